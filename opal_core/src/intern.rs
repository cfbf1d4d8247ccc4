//! Process-wide string interner.
//!
//! Identifier strings (names, attribute keys) are interned so that the
//! compiler's name tables and the runtime's attribute maps share storage
//! and compare by pointer in the common case. The table is initialized
//! lazily under a one-time guard so it is sound even when the VM is
//! embedded in a multi-threaded host.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

static INTERNER: OnceLock<DashMap<Arc<str>, ()>> = OnceLock::new();

fn table() -> &'static DashMap<Arc<str>, ()> {
    INTERNER.get_or_init(DashMap::new)
}

/// Intern a string, returning the canonical shared copy.
pub fn intern(s: &str) -> Arc<str> {
    let table = table();
    if let Some(entry) = table.get(s) {
        return entry.key().clone();
    }
    let arc: Arc<str> = Arc::from(s);
    table.insert(arc.clone(), ());
    arc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_shares_storage() {
        let a = intern("append");
        let b = intern("append");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_distinct_strings() {
        let a = intern("x");
        let b = intern("y");
        assert_ne!(a, b);
    }
}
