//! Open-addressed hash table keyed by interned strings.
//!
//! This is deliberately not `std::collections::HashMap`: string interning
//! needs to probe buckets directly, treating tombstones as "keep probing"
//! for lookups but "reusable slot" for inserts. Keys are interned string
//! handles, so key comparison is handle equality; each entry caches the
//! key's hash so probing never has to chase back into the heap.
//!
//! Invariants:
//! - `count` includes tombstones, so the 0.75 load-factor growth bound
//!   stays stable under delete/insert churn.
//! - a tombstone is `(key: None, value: Bool(true))`; a free slot is
//!   `(key: None, value: Null)`.

use crate::object::ObjRef;
use crate::value::Value;

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    const FREE: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::Null,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

/// String-keyed hash table with linear probing and tombstone deletion.
#[derive(Debug, Default)]
pub struct Table {
    /// Occupied slots, tombstones included.
    count: usize,
    /// Occupied slots holding a live key.
    live: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            live: 0,
            entries: Vec::new(),
        }
    }

    /// Number of live key/value pairs.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Occupied slot count, tombstones included (the load-factor input).
    pub fn occupied(&self) -> usize {
        self.count
    }

    /// Probe for the slot belonging to `key`. Returns the first tombstone
    /// seen if the key is absent, so inserts reuse dead slots.
    fn find_slot(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let capacity = entries.len();
        let mut index = hash as usize % capacity;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::FREE; capacity]);
        self.count = 0;
        self.live = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let slot = Self::find_slot(&self.entries, key, entry.hash);
                self.entries[slot] = entry;
                self.count += 1;
                self.live += 1;
            }
        }
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let slot = Self::find_slot(&self.entries, key, hash);
        let entry = &self.entries[slot];
        entry.key.map(|_| entry.value)
    }

    /// Insert or update. Returns true when `key` was not already present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }

        let slot = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        if is_new {
            // A fresh slot grows the occupied count; a recycled tombstone
            // was already counted.
            if !entry.is_tombstone() {
                self.count += 1;
            }
            self.live += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Delete by leaving a tombstone so probe chains stay intact.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[slot];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::Bool(true),
        };
        self.live -= 1;
        true
    }

    /// Probe for an interned string by content. `eq` is called with
    /// candidate keys whose cached hash matches; it decides byte equality.
    /// Used only by the heap's intern set.
    pub fn find_str(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    // Stop on a truly free slot; skip tombstones.
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && eq(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> ObjRef {
        ObjRef::from_raw(n)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut table = Table::new();
        assert!(table.set(key(1), 101, Value::Number(1.0)));
        assert!(table.set(key(2), 202, Value::Number(2.0)));
        assert!(!table.set(key(1), 101, Value::Number(9.0)));
        assert_eq!(table.get(key(1), 101), Some(Value::Number(9.0)));
        assert_eq!(table.get(key(2), 202), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(3), 303), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut table = Table::new();
        // Three keys with identical hashes forces one probe chain.
        for n in 1..=3 {
            table.set(key(n), 7, Value::Number(n as f64));
        }
        assert!(table.delete(key(2), 7));
        // Key 3 was probed past key 2's slot; it must still be reachable.
        assert_eq!(table.get(key(3), 7), Some(Value::Number(3.0)));
        assert_eq!(table.get(key(2), 7), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_tombstone_slot_reused_on_insert() {
        let mut table = Table::new();
        for n in 1..=3 {
            table.set(key(n), 7, Value::Number(n as f64));
        }
        let occupied = table.occupied();
        table.delete(key(2), 7);
        table.set(key(9), 7, Value::Number(9.0));
        // The tombstone was recycled; no new slot was consumed.
        assert_eq!(table.occupied(), occupied);
        assert_eq!(table.get(key(9), 7), Some(Value::Number(9.0)));
    }

    #[test]
    fn test_growth_keeps_load_factor_bound() {
        let mut table = Table::new();
        for n in 0..100 {
            table.set(key(n), n.wrapping_mul(2654435761), Value::Number(n as f64));
            assert!(
                table.occupied() * TABLE_MAX_LOAD_DEN <= table.capacity() * TABLE_MAX_LOAD_NUM,
                "load factor exceeded at {} entries",
                n + 1
            );
        }
        for n in 0..100 {
            assert_eq!(
                table.get(key(n), n.wrapping_mul(2654435761)),
                Some(Value::Number(n as f64))
            );
        }
    }

    #[test]
    fn test_growth_drops_tombstones() {
        let mut table = Table::new();
        for n in 0..50 {
            table.set(key(n), n, Value::Null);
        }
        for n in 0..40 {
            table.delete(key(n), n);
        }
        // Force growth; tombstones are not carried over.
        for n in 100..160 {
            table.set(key(n), n, Value::Null);
        }
        assert_eq!(table.len(), 70);
        assert_eq!(table.occupied(), 70);
    }

    #[test]
    fn test_find_str_skips_tombstones() {
        let mut table = Table::new();
        for n in 1..=3 {
            table.set(key(n), 7, Value::Null);
        }
        table.delete(key(1), 7);
        let found = table.find_str(7, |k| k == key(3));
        assert_eq!(found, Some(key(3)));
        let missing = table.find_str(7, |k| k == key(1));
        assert_eq!(missing, None);
    }
}
