//! Opal garbage collector.
//!
//! A precise, non-incremental mark-sweep collector over an index-based
//! arena. Object handles ([`opal_core::ObjRef`]) are bare arena indices;
//! nothing is reference counted, so cyclic object graphs (frames pointing
//! at parent frames, self-containing lists) are collected naturally.
//!
//! # Protocol
//!
//! Every managed type implements [`Trace`], enumerating the values and
//! object handles it owns. Collection marks from a caller-provided root
//! set and sweeps everything left unmarked; statically allocated objects
//! (singletons, interned type objects) are pinned and never reclaimed.
//!
//! Collection only runs when the mutator asks for it, between VM
//! instructions at safe points, so object graphs observed by a single
//! instruction are stable for its duration.

mod config;
mod heap;
mod stats;
mod trace;

pub use config::GcConfig;
pub use heap::{AllocError, Heap};
pub use stats::GcStats;
pub use trace::{Trace, Tracer};
