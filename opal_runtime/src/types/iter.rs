//! Stateful iterator payloads.
//!
//! Container iterators hold a strong reference to their source so the
//! source outlives any temporary that produced it (iterating a list
//! literal keeps the list alive through the loop). Advancement happens
//! in [`crate::protocol::iter_next`].

use opal_core::{ObjRef, Value};
use opal_gc::Tracer;

/// Which projection a dict view or iterator walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictViewKind {
    Keys,
    Values,
    Items,
}

/// Iterator state over a container.
#[derive(Debug)]
pub enum IterData {
    /// Index iterator over a list object.
    List { list: ObjRef, index: usize },
    /// Index iterator over a tuple object.
    Tuple { tuple: ObjRef, index: usize },
    /// Character iterator over a string value.
    Str { string: Value, index: usize },
    /// Arithmetic progression iterator.
    Range { next: i64, stop: i64, step: i64 },
    /// Dict iterator; `slot` is the storage slot to resume from.
    Dict {
        dict: ObjRef,
        slot: u32,
        kind: DictViewKind,
    },
    /// Set iterator (over the backing storage's keys).
    Set { set: ObjRef, slot: u32 },
    /// A dict view object (`d.keys()`, `d.values()`, `d.items()`).
    View { dict: ObjRef, kind: DictViewKind },
}

impl IterData {
    pub(crate) fn trace(&self, tracer: &mut Tracer) {
        match self {
            IterData::List { list, .. } => tracer.visit(*list),
            IterData::Tuple { tuple, .. } => tracer.visit(*tuple),
            IterData::Str { string, .. } => tracer.visit_value(string),
            IterData::Range { .. } => {}
            IterData::Dict { dict, .. } | IterData::View { dict, .. } => tracer.visit(*dict),
            IterData::Set { set, .. } => tracer.visit(*set),
        }
    }
}

// =============================================================================
// Prototypes
// =============================================================================

use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{Payload, TypeId, TypePrototype};
use crate::protocol;
use crate::types::tuple::new_tuple;

/// Shared by every concrete iterator type: `iter(it) is it`, and `next`
/// advances the captured state.
pub static ITER_PROTOTYPE: TypePrototype = TypePrototype {
    iter: Some(iter_self),
    next: Some(iter_advance),
    ..TypePrototype::empty("iterator")
};

/// Dict views (`keys()`, `values()`, `items()`): sized, iterable.
pub static VIEW_PROTOTYPE: TypePrototype = TypePrototype {
    len: Some(view_len),
    iter: Some(view_iter),
    ..TypePrototype::empty("dict_view")
};

fn iter_self(_ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    Ok(v.clone())
}

/// What the iterator should produce next, captured without holding a
/// heap borrow.
enum Step {
    Done,
    Yield(Value),
    /// Items iteration builds a `(key, value)` tuple after the borrow
    /// ends.
    YieldPair(Value, Value),
}

fn iter_advance(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Option<Value>> {
    let Value::Object(r) = v else {
        return Err(ctx.raise(
            ExcKind::TypeError,
            "descriptor requires an iterator receiver".to_string(),
        ));
    };

    let step = {
        let heap = ctx.heap();
        let Payload::Iter(state) = &heap.get(*r).payload else {
            return Err(ctx.raise(
                ExcKind::TypeError,
                "descriptor requires an iterator receiver".to_string(),
            ));
        };
        match state {
            IterData::List { list, index } => match &heap.get(*list).payload {
                Payload::List(items) => match items.get(*index) {
                    Some(item) => Step::Yield(item.clone()),
                    None => Step::Done,
                },
                _ => Step::Done,
            },
            IterData::Tuple { tuple, index } => match &heap.get(*tuple).payload {
                Payload::Tuple(items) => match items.get(*index) {
                    Some(item) => Step::Yield(item.clone()),
                    None => Step::Done,
                },
                _ => Step::Done,
            },
            IterData::Str { string, index } => match string.as_str() {
                Some(s) => match s.chars().nth(*index) {
                    Some(c) => Step::Yield(Value::Str(c.to_string().into())),
                    None => Step::Done,
                },
                None => Step::Done,
            },
            IterData::Range { next, stop, step } => {
                let exhausted = if *step > 0 { next >= stop } else { next <= stop };
                if exhausted {
                    Step::Done
                } else {
                    Step::Yield(Value::int(*next))
                }
            }
            IterData::Dict { dict, slot, kind } => {
                let storage = match &heap.get(*dict).payload {
                    Payload::Dict(s) | Payload::Set(s) => s,
                    _ => return Ok(None),
                };
                match storage.nth_live_from_slot(*slot) {
                    Some((_, entry)) => match kind {
                        DictViewKind::Keys => Step::Yield(entry.key.clone()),
                        DictViewKind::Values => Step::Yield(entry.value.clone()),
                        DictViewKind::Items => {
                            Step::YieldPair(entry.key.clone(), entry.value.clone())
                        }
                    },
                    None => Step::Done,
                }
            }
            IterData::Set { set, slot } => {
                let storage = match &heap.get(*set).payload {
                    Payload::Set(s) | Payload::Dict(s) => s,
                    _ => return Ok(None),
                };
                match storage.nth_live_from_slot(*slot) {
                    Some((_, entry)) => Step::Yield(entry.key.clone()),
                    None => Step::Done,
                }
            }
            IterData::View { .. } => {
                return Err(ctx.raise(
                    ExcKind::TypeError,
                    "dict view is not an iterator; call iter() on it".to_string(),
                ));
            }
        }
    };

    match step {
        Step::Done => Ok(None),
        Step::Yield(value) => {
            advance_state(ctx, *r);
            Ok(Some(value))
        }
        Step::YieldPair(k, val) => {
            advance_state(ctx, *r);
            Ok(Some(new_tuple(ctx, vec![k, val])?))
        }
    }
}

/// Move the iterator past the element just produced. Dict iterators
/// track the storage slot they stopped at, so entries deleted behind
/// them are never revisited.
fn advance_state(ctx: &mut dyn Ctx, iter: opal_core::ObjRef) {
    // Dict/set need the produced slot recomputed under a fresh borrow.
    let produced_slot = {
        let heap = ctx.heap();
        if let Payload::Iter(IterData::Dict { dict, slot, .. } | IterData::Set { set: dict, slot }) =
            &heap.get(iter).payload
        {
            match &heap.get(*dict).payload {
                Payload::Dict(s) | Payload::Set(s) => {
                    s.nth_live_from_slot(*slot).map(|(found, _)| found)
                }
                _ => None,
            }
        } else {
            None
        }
    };

    if let Payload::Iter(state) = &mut ctx.heap_mut().get_mut(iter).payload {
        match state {
            IterData::List { index, .. }
            | IterData::Tuple { index, .. }
            | IterData::Str { index, .. } => *index += 1,
            IterData::Range { next, step, .. } => *next += *step,
            IterData::Dict { slot, .. } | IterData::Set { slot, .. } => {
                if let Some(found) = produced_slot {
                    *slot = found + 1;
                }
            }
            IterData::View { .. } => {}
        }
    }
}

fn view_len(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    if let Value::Object(r) = v {
        if let Payload::Iter(IterData::View { dict, .. }) = &ctx.heap().get(*r).payload {
            return Ok(protocol::dict_len(ctx, *dict));
        }
    }
    Err(ctx.raise(
        ExcKind::TypeError,
        "descriptor requires a dict view receiver".to_string(),
    ))
}

fn view_iter(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    if let Value::Object(r) = v {
        if let Payload::Iter(IterData::View { dict, kind }) = &ctx.heap().get(*r).payload {
            let (dict, kind) = (*dict, *kind);
            return protocol::new_dict_iter(ctx, dict, kind);
        }
    }
    Err(ctx.raise(
        ExcKind::TypeError,
        "descriptor requires a dict view receiver".to_string(),
    ))
}
