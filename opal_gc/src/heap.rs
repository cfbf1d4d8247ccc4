//! Index-based heap arena with mark-sweep collection.

use crate::config::GcConfig;
use crate::stats::GcStats;
use crate::trace::{Trace, Tracer};
use opal_core::ObjRef;

/// Allocation failure: the configured object limit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "heap object limit reached")
    }
}

impl std::error::Error for AllocError {}

struct Slot<T> {
    data: Option<T>,
    marked: bool,
    pinned: bool,
}

/// The object arena.
///
/// Slots are reused through a free list; a handle therefore stays valid
/// exactly as long as the collector can prove the object reachable.
/// Accessing a reclaimed handle is an interpreter bug and aborts.
pub struct Heap<T: Trace> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    allocs_since_collect: usize,
    config: GcConfig,
    stats: GcStats,
}

impl<T: Trace> Heap<T> {
    pub fn new(config: GcConfig) -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            allocs_since_collect: 0,
            config,
            stats: GcStats::default(),
        }
    }

    /// Allocate an object, returning its handle.
    pub fn alloc(&mut self, data: T) -> Result<ObjRef, AllocError> {
        self.alloc_inner(data, false)
    }

    /// Allocate an object that is never reclaimed (singletons, interned
    /// type objects). Static objects still participate in tracing so the
    /// graphs they own stay live.
    pub fn alloc_static(&mut self, data: T) -> Result<ObjRef, AllocError> {
        self.alloc_inner(data, true)
    }

    fn alloc_inner(&mut self, data: T, pinned: bool) -> Result<ObjRef, AllocError> {
        if self.live >= self.config.max_objects {
            return Err(AllocError);
        }
        self.live += 1;
        self.allocs_since_collect += 1;
        self.stats.peak_live = self.stats.peak_live.max(self.live);

        let slot = Slot {
            data: Some(data),
            marked: false,
            pinned,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                Ok(ObjRef::from_index(index))
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("heap index overflow");
                self.slots.push(slot);
                Ok(ObjRef::from_index(index))
            }
        }
    }

    /// Borrow an object. Panics on a reclaimed handle (internal bug).
    #[inline]
    pub fn get(&self, obj: ObjRef) -> &T {
        self.slots[obj.index() as usize]
            .data
            .as_ref()
            .expect("access to reclaimed heap object")
    }

    /// Mutably borrow an object. Panics on a reclaimed handle.
    #[inline]
    pub fn get_mut(&mut self, obj: ObjRef) -> &mut T {
        self.slots[obj.index() as usize]
            .data
            .as_mut()
            .expect("access to reclaimed heap object")
    }

    /// Whether the handle still refers to a live object.
    #[inline]
    pub fn contains(&self, obj: ObjRef) -> bool {
        self.slots
            .get(obj.index() as usize)
            .is_some_and(|s| s.data.is_some())
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Whether enough allocation has happened to warrant a cycle. The
    /// mutator polls this at safe points; collection never runs on its own.
    #[inline]
    pub fn wants_collect(&self) -> bool {
        self.allocs_since_collect >= self.config.collect_interval
    }

    /// Run a full mark-sweep cycle from the given roots. Returns the
    /// number of objects reclaimed.
    pub fn collect<I>(&mut self, roots: I) -> usize
    where
        I: IntoIterator<Item = ObjRef>,
    {
        // Mark phase. Pinned objects are unconditional roots.
        let mut tracer = Tracer::new();
        for root in roots {
            tracer.visit(root);
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.pinned && slot.data.is_some() {
                tracer.visit(ObjRef::from_index(index as u32));
            }
        }

        while let Some(obj) = tracer.pop() {
            let slot = &mut self.slots[obj.index() as usize];
            if slot.marked {
                continue;
            }
            let Some(data) = slot.data.as_ref() else {
                continue;
            };
            slot.marked = true;
            data.trace(&mut tracer);
        }

        // Sweep phase.
        let mut reclaimed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.data.is_some() && !slot.marked {
                slot.data = None;
                self.free.push(index as u32);
                reclaimed += 1;
            }
            slot.marked = false;
        }

        self.live -= reclaimed;
        self.allocs_since_collect = 0;
        self.stats.collections += 1;
        self.stats.reclaimed += reclaimed as u64;
        self.stats.live_after_last = self.live;
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::Value;

    /// Minimal traceable node for exercising the collector.
    struct Node {
        edges: Vec<ObjRef>,
        values: Vec<Value>,
    }

    impl Node {
        fn leaf() -> Self {
            Node {
                edges: Vec::new(),
                values: Vec::new(),
            }
        }
    }

    impl Trace for Node {
        fn trace(&self, tracer: &mut Tracer) {
            for e in &self.edges {
                tracer.visit(*e);
            }
            tracer.visit_values(&self.values);
        }
    }

    #[test]
    fn test_alloc_get() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        assert!(heap.contains(a));
        assert_eq!(heap.get(a).edges.len(), 0);
    }

    #[test]
    fn test_unreachable_is_reclaimed() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        let b = heap.alloc(Node::leaf()).unwrap();
        let reclaimed = heap.collect([a]);
        assert_eq!(reclaimed, 1);
        assert!(heap.contains(a));
        assert!(!heap.contains(b));
    }

    #[test]
    fn test_reachable_graph_survives() {
        let mut heap = Heap::new(GcConfig::default());
        let leaf = heap.alloc(Node::leaf()).unwrap();
        let mid = heap
            .alloc(Node {
                edges: vec![leaf],
                values: Vec::new(),
            })
            .unwrap();
        let root = heap
            .alloc(Node {
                edges: Vec::new(),
                values: vec![Value::Object(mid)],
            })
            .unwrap();
        heap.collect([root]);
        assert!(heap.contains(root));
        assert!(heap.contains(mid));
        assert!(heap.contains(leaf));
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        let b = heap
            .alloc(Node {
                edges: vec![a],
                values: Vec::new(),
            })
            .unwrap();
        heap.get_mut(a).edges.push(b);
        // Self-cycle as well.
        heap.get_mut(a).edges.push(a);

        // Reachable cycle survives a cycle rooted at `a`.
        heap.collect([a]);
        assert!(heap.contains(a));
        assert!(heap.contains(b));

        // Unreachable cycle is reclaimed.
        let reclaimed = heap.collect([]);
        assert_eq!(reclaimed, 2);
        assert!(!heap.contains(a));
        assert!(!heap.contains(b));
    }

    #[test]
    fn test_static_objects_are_pinned() {
        let mut heap = Heap::new(GcConfig::default());
        let s = heap.alloc_static(Node::leaf()).unwrap();
        heap.collect([]);
        assert!(heap.contains(s));
    }

    #[test]
    fn test_slot_reuse() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        heap.collect([]);
        let b = heap.alloc(Node::leaf()).unwrap();
        assert_eq!(a.index(), b.index());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_object_limit() {
        let mut heap = Heap::new(GcConfig::with_max_objects(2));
        heap.alloc(Node::leaf()).unwrap();
        heap.alloc(Node::leaf()).unwrap();
        assert!(matches!(heap.alloc(Node::leaf()), Err(AllocError)));
    }

    #[test]
    fn test_stats() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        heap.alloc(Node::leaf()).unwrap();
        heap.collect([a]);
        let stats = heap.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.live_after_last, 1);
        assert_eq!(stats.peak_live, 2);
    }
}
