//! Collector configuration.

/// Tunable limits for the heap.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Hard cap on live objects; allocation past it fails with
    /// [`crate::AllocError`] (surfaced to scripts as MemoryError).
    pub max_objects: usize,
    /// Number of allocations between automatic collection requests.
    pub collect_interval: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            max_objects: usize::MAX,
            collect_interval: 16 * 1024,
        }
    }
}

impl GcConfig {
    /// A configuration with a hard object cap, used by tests and embedders
    /// that want deterministic MemoryError behavior.
    pub fn with_max_objects(max_objects: usize) -> Self {
        GcConfig {
            max_objects,
            ..Default::default()
        }
    }
}
