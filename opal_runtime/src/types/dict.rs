//! Insertion-ordered hash storage shared by dict and set payloads.
//!
//! The storage keeps entries in insertion order and an index from key
//! hash to entry slots. Probing takes the key equality test as a
//! callback because object equality may need the machine (a tuple key
//! holding values that compare structurally); the callers in
//! [`crate::protocol`] supply it.

use opal_core::Value;
use opal_gc::Tracer;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[derive(Debug, Clone)]
pub struct DictEntry {
    pub hash: u64,
    pub key: Value,
    pub value: Value,
}

/// Hash map from Value to Value preserving insertion order. Deleted
/// entries become tombstones so existing slot indices stay valid.
#[derive(Debug, Default)]
pub struct DictStorage {
    entries: Vec<Option<DictEntry>>,
    index: FxHashMap<u64, SmallVec<[u32; 1]>>,
    len: usize,
}

impl DictStorage {
    pub fn new() -> Self {
        DictStorage::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Candidate entry slots for a hash. The caller probes each with its
    /// equality test; the bucket is cloned so the storage (and the heap
    /// it lives in) is not borrowed during probing.
    pub fn candidates(&self, hash: u64) -> SmallVec<[u32; 1]> {
        self.index.get(&hash).cloned().unwrap_or_default()
    }

    /// The key stored in a candidate slot, if the slot is still live.
    pub fn key_at(&self, slot: u32) -> Option<Value> {
        self.entries
            .get(slot as usize)?
            .as_ref()
            .map(|e| e.key.clone())
    }

    pub fn value_at(&self, slot: u32) -> Option<Value> {
        self.entries
            .get(slot as usize)?
            .as_ref()
            .map(|e| e.value.clone())
    }

    pub fn set_value_at(&mut self, slot: u32, value: Value) {
        if let Some(entry) = self.entries.get_mut(slot as usize).and_then(Option::as_mut) {
            entry.value = value;
        }
    }

    /// Append a new entry. The caller has already established that no
    /// live entry matches the key.
    pub fn push(&mut self, hash: u64, key: Value, value: Value) {
        let slot = self.entries.len() as u32;
        self.entries.push(Some(DictEntry { hash, key, value }));
        self.index.entry(hash).or_default().push(slot);
        self.len += 1;
    }

    /// Remove the entry in a slot, returning its value.
    pub fn remove_at(&mut self, slot: u32) -> Option<Value> {
        let entry = self.entries.get_mut(slot as usize)?.take()?;
        if let Some(bucket) = self.index.get_mut(&entry.hash) {
            bucket.retain(|s| *s != slot);
            if bucket.is_empty() {
                self.index.remove(&entry.hash);
            }
        }
        self.len -= 1;
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.len = 0;
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries
            .iter()
            .flatten()
            .map(|e| (&e.key, &e.value))
    }

    /// The nth live entry (insertion order), for stateful iterators.
    /// Returns the slot index alongside so iterators can resume after
    /// mutation without revisiting.
    pub fn nth_live_from_slot(&self, start_slot: u32) -> Option<(u32, &DictEntry)> {
        self.entries
            .iter()
            .enumerate()
            .skip(start_slot as usize)
            .find_map(|(i, e)| e.as_ref().map(|e| (i as u32, e)))
    }

    pub(crate) fn trace(&self, tracer: &mut Tracer) {
        for entry in self.entries.iter().flatten() {
            tracer.visit_value(&entry.key);
            tracer.visit_value(&entry.value);
        }
    }
}

// =============================================================================
// Prototype
// =============================================================================

use crate::context::{Ctx, ExcKind, PyResult};
use crate::object::{MethodDef, Payload, PyObject, TypeId, TypePrototype};
use crate::protocol;
use crate::types::iter::{DictViewKind, IterData};
use opal_core::ObjRef;

pub static PROTOTYPE: TypePrototype = TypePrototype {
    len: Some(dict_len_slot),
    getitem: Some(dict_getitem),
    setitem: Some(dict_setitem),
    delitem: Some(dict_delitem),
    contains: Some(dict_contains),
    iter: Some(dict_iter_slot),
    methods: &[
        MethodDef {
            name: "get",
            func: dict_method_get,
        },
        MethodDef {
            name: "keys",
            func: dict_keys,
        },
        MethodDef {
            name: "values",
            func: dict_values,
        },
        MethodDef {
            name: "items",
            func: dict_items,
        },
        MethodDef {
            name: "pop",
            func: dict_pop,
        },
        MethodDef {
            name: "update",
            func: dict_update_method,
        },
        MethodDef {
            name: "setdefault",
            func: dict_setdefault,
        },
        MethodDef {
            name: "clear",
            func: dict_clear,
        },
    ],
    ..TypePrototype::empty("dict")
};

fn as_dict(ctx: &mut dyn Ctx, v: &Value) -> PyResult<ObjRef> {
    if let Value::Object(r) = v {
        if matches!(ctx.heap().get(*r).payload, Payload::Dict(_)) {
            return Ok(*r);
        }
    }
    let got = protocol::type_name(ctx, v);
    Err(ctx.raise(
        ExcKind::TypeError,
        format!("descriptor requires a 'dict' receiver, got '{got}'"),
    ))
}

pub fn new_dict(ctx: &mut dyn Ctx) -> PyResult<ObjRef> {
    ctx.alloc(PyObject::new(
        TypeId::DICT,
        Payload::Dict(DictStorage::new()),
    ))
}

fn missing_key(ctx: &mut dyn Ctx, key: &Value) -> crate::context::Raised {
    let repr = protocol::repr_value(ctx, key).unwrap_or_else(|_| "<key>".to_string());
    ctx.raise(ExcKind::KeyError, repr)
}

fn dict_len_slot(ctx: &mut dyn Ctx, v: &Value) -> PyResult<usize> {
    let dict = as_dict(ctx, v)?;
    Ok(protocol::dict_len(ctx, dict))
}

fn dict_getitem(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<Value> {
    let dict = as_dict(ctx, v)?;
    match protocol::dict_get(ctx, dict, key)? {
        Some(value) => Ok(value),
        None => Err(missing_key(ctx, key)),
    }
}

fn dict_setitem(ctx: &mut dyn Ctx, v: &Value, key: &Value, value: &Value) -> PyResult<()> {
    let dict = as_dict(ctx, v)?;
    protocol::dict_set(ctx, dict, key.clone(), value.clone())
}

fn dict_delitem(ctx: &mut dyn Ctx, v: &Value, key: &Value) -> PyResult<()> {
    let dict = as_dict(ctx, v)?;
    match protocol::dict_remove(ctx, dict, key)? {
        Some(_) => Ok(()),
        None => Err(missing_key(ctx, key)),
    }
}

fn dict_contains(ctx: &mut dyn Ctx, v: &Value, needle: &Value) -> PyResult<bool> {
    let dict = as_dict(ctx, v)?;
    Ok(protocol::dict_find(ctx, dict, needle)?.is_some())
}

fn dict_iter_slot(ctx: &mut dyn Ctx, v: &Value) -> PyResult<Value> {
    let dict = as_dict(ctx, v)?;
    protocol::new_dict_iter(ctx, dict, DictViewKind::Keys)
}

fn dict_method_get(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "get", args, 1, 2)?;
    let dict = as_dict(ctx, recv)?;
    match protocol::dict_get(ctx, dict, &args[0])? {
        Some(value) => Ok(value),
        None => Ok(args.get(1).cloned().unwrap_or(Value::None)),
    }
}

fn new_view(ctx: &mut dyn Ctx, dict: ObjRef, kind: DictViewKind) -> PyResult<Value> {
    let view = ctx.alloc(PyObject::new(
        TypeId::DICT_VIEW,
        Payload::Iter(IterData::View { dict, kind }),
    ))?;
    Ok(Value::Object(view))
}

fn dict_keys(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "keys", args, 0, 0)?;
    let dict = as_dict(ctx, recv)?;
    new_view(ctx, dict, DictViewKind::Keys)
}

fn dict_values(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "values", args, 0, 0)?;
    let dict = as_dict(ctx, recv)?;
    new_view(ctx, dict, DictViewKind::Values)
}

fn dict_items(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "items", args, 0, 0)?;
    let dict = as_dict(ctx, recv)?;
    new_view(ctx, dict, DictViewKind::Items)
}

fn dict_pop(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "pop", args, 1, 2)?;
    let dict = as_dict(ctx, recv)?;
    match protocol::dict_remove(ctx, dict, &args[0])? {
        Some(value) => Ok(value),
        None => match args.get(1) {
            Some(default) => Ok(default.clone()),
            None => Err(missing_key(ctx, &args[0])),
        },
    }
}

/// Merge another dict (or iterable of pairs) into the receiver.
pub fn dict_update(ctx: &mut dyn Ctx, dict: ObjRef, other: &Value) -> PyResult<()> {
    if let Value::Object(o) = other {
        if let Payload::Dict(storage) = &ctx.heap().get(*o).payload {
            let pairs: Vec<(Value, Value)> = storage
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (k, v) in pairs {
                protocol::dict_set(ctx, dict, k, v)?;
            }
            return Ok(());
        }
    }
    let iter = protocol::get_iter(ctx, other)?;
    while let Some(pair) = protocol::iter_next(ctx, &iter)? {
        let item_iter = protocol::get_iter(ctx, &pair)?;
        let (Some(k), Some(v)) = (
            protocol::iter_next(ctx, &item_iter)?,
            protocol::iter_next(ctx, &item_iter)?,
        ) else {
            return Err(ctx.raise(
                ExcKind::ValueError,
                "dictionary update sequence element is not a pair".to_string(),
            ));
        };
        protocol::dict_set(ctx, dict, k, v)?;
    }
    Ok(())
}

fn dict_update_method(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "update", args, 1, 1)?;
    let dict = as_dict(ctx, recv)?;
    dict_update(ctx, dict, &args[0])?;
    Ok(Value::None)
}

fn dict_setdefault(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "setdefault", args, 1, 2)?;
    let dict = as_dict(ctx, recv)?;
    if let Some(value) = protocol::dict_get(ctx, dict, &args[0])? {
        return Ok(value);
    }
    let default = args.get(1).cloned().unwrap_or(Value::None);
    protocol::dict_set(ctx, dict, args[0].clone(), default.clone())?;
    Ok(default)
}

fn dict_clear(ctx: &mut dyn Ctx, recv: &Value, args: &[Value]) -> PyResult<Value> {
    super::check_arity(ctx, "clear", args, 0, 0)?;
    let dict = as_dict(ctx, recv)?;
    match &mut ctx.heap_mut().get_mut(dict).payload {
        Payload::Dict(storage) => storage.clear(),
        _ => unreachable!("receiver checked by as_dict"),
    }
    Ok(Value::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(storage: &DictStorage, hash: u64, key: &Value) -> Option<u32> {
        storage.candidates(hash).into_iter().find(|&slot| {
            storage
                .key_at(slot)
                .and_then(|k| k.shallow_eq(key))
                .unwrap_or(false)
        })
    }

    fn hash_of(v: &Value) -> u64 {
        v.primitive_hash().expect("primitive key")
    }

    #[test]
    fn test_insert_lookup() {
        let mut d = DictStorage::new();
        let key = Value::str("a");
        d.push(hash_of(&key), key.clone(), Value::int(1));
        let slot = probe(&d, hash_of(&key), &key).unwrap();
        assert_eq!(d.value_at(slot).unwrap().as_i64(), Some(1));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_insertion_order_iteration() {
        let mut d = DictStorage::new();
        for i in 0..10 {
            let k = Value::int(i);
            d.push(hash_of(&k), k, Value::int(i * 10));
        }
        let keys: Vec<i64> = d.iter().map(|(k, _)| k.as_i64().unwrap()).collect();
        assert_eq!(keys, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_keeps_order_and_slots() {
        let mut d = DictStorage::new();
        for i in 0..5 {
            let k = Value::int(i);
            d.push(hash_of(&k), k, Value::None);
        }
        let k2 = Value::int(2);
        let slot = probe(&d, hash_of(&k2), &k2).unwrap();
        d.remove_at(slot);
        assert_eq!(d.len(), 4);
        assert!(probe(&d, hash_of(&k2), &k2).is_none());
        let keys: Vec<i64> = d.iter().map(|(k, _)| k.as_i64().unwrap()).collect();
        assert_eq!(keys, vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_hash_collisions_probe_by_equality() {
        let mut d = DictStorage::new();
        // Force both keys into one bucket.
        d.push(7, Value::str("a"), Value::int(1));
        d.push(7, Value::str("b"), Value::int(2));
        let slot_b = d
            .candidates(7)
            .into_iter()
            .find(|&s| {
                d.key_at(s)
                    .and_then(|k| k.shallow_eq(&Value::str("b")))
                    .unwrap_or(false)
            })
            .unwrap();
        assert_eq!(d.value_at(slot_b).unwrap().as_i64(), Some(2));
    }

    #[test]
    fn test_iterator_resume_slots() {
        let mut d = DictStorage::new();
        for i in 0..3 {
            let k = Value::int(i);
            d.push(hash_of(&k), k, Value::None);
        }
        let (slot0, e0) = d.nth_live_from_slot(0).unwrap();
        assert_eq!(e0.key.as_i64(), Some(0));
        let (slot1, _) = d.nth_live_from_slot(slot0 + 1).unwrap();
        assert_eq!(slot1, 1);
        assert!(d.nth_live_from_slot(3).is_none());
    }
}
