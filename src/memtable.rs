//! In-memory sorted buffer of the most recent mutations.
//!
//! The memtable maps each key to the latest [`Entry`] for it, tombstones
//! included. Capacity counts distinct keys: overwriting a resident key
//! does not grow the table, and a tombstone occupies a slot like any
//! other entry. The engine flushes a full memtable to an SSTable before
//! admitting the next mutation.
//!
//! Backed by `crossbeam_skiplist::SkipMap`, which keeps keys ordered and
//! allows concurrent readers without locking; the distinct-key count is
//! tracked separately in an atomic, since writes are serialized under
//! the engine's mutation lock.

use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::entry::Entry;

#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Entry>,
    distinct: AtomicUsize,
    capacity: usize,
}

impl Memtable {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: SkipMap::new(),
            distinct: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Inserts or overwrites the entry for its key. Used by live writes
    /// and by WAL replay, which preserves the recorded timestamp and
    /// sequence instead of assigning new ones.
    pub fn insert(&self, entry: Entry) {
        if self.data.get(entry.key.as_slice()).is_none() {
            self.distinct.fetch_add(1, Ordering::SeqCst);
        }
        self.data.insert(entry.key.clone(), entry);
    }

    /// Returns the resident entry, which may be a tombstone.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.data.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    /// Number of distinct keys resident.
    pub fn len(&self) -> usize {
        self.distinct.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// All entries in ascending key order; the memtable is left empty.
    pub fn drain_sorted(&mut self) -> Vec<Entry> {
        let entries: Vec<Entry> = self.data.iter().map(|e| e.value().clone()).collect();
        self.data = SkipMap::new();
        self.distinct.store(0, Ordering::SeqCst);
        entries
    }

    /// All entries in ascending key order, non-destructively.
    pub fn entries(&self) -> Vec<Entry> {
        self.data.iter().map(|e| e.value().clone()).collect()
    }

    /// Entries with keys in `[low, high]`, ascending.
    pub fn entries_in(&self, low: &[u8], high: &[u8]) -> Vec<Entry> {
        self.data
            .range::<[u8], _>((Bound::Included(low), Bound::Included(high)))
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &[u8], value: &[u8], ts: u64) -> Entry {
        Entry::put(key.to_vec(), value.to_vec(), ts, ts)
    }

    #[test]
    fn test_insert_and_get() {
        let memtable = Memtable::new(30);

        memtable.insert(put(b"b", b"2", 1));
        memtable.insert(put(b"a", b"1", 2));
        memtable.insert(Entry::tombstone(b"c".to_vec(), 3, 3));

        assert_eq!(memtable.get(b"a").unwrap().value, Some(b"1".to_vec()));
        assert_eq!(memtable.get(b"b").unwrap().value, Some(b"2".to_vec()));
        assert!(memtable.get(b"c").unwrap().is_tombstone());
        assert!(memtable.get(b"d").is_none());
        assert_eq!(memtable.len(), 3);
    }

    #[test]
    fn test_overwrite_does_not_grow() {
        let memtable = Memtable::new(30);

        memtable.insert(put(b"k", b"1", 1));
        memtable.insert(put(b"k", b"2", 2));
        memtable.insert(Entry::tombstone(b"k".to_vec(), 3, 3));

        assert_eq!(memtable.len(), 1);
        assert!(memtable.get(b"k").unwrap().is_tombstone());
    }

    #[test]
    fn test_is_full_counts_distinct_keys() {
        let memtable = Memtable::new(3);

        memtable.insert(put(b"a", b"1", 1));
        memtable.insert(put(b"b", b"2", 2));
        assert!(!memtable.is_full());

        // A tombstone takes a slot like any other entry.
        memtable.insert(Entry::tombstone(b"c".to_vec(), 3, 3));
        assert!(memtable.is_full());

        // Overwrites never push the table over capacity.
        memtable.insert(put(b"a", b"9", 4));
        assert_eq!(memtable.len(), 3);
    }

    #[test]
    fn test_drain_sorted() {
        let mut memtable = Memtable::new(30);

        memtable.insert(put(b"cherry", b"3", 1));
        memtable.insert(put(b"apple", b"1", 2));
        memtable.insert(put(b"banana", b"2", 3));

        let entries = memtable.drain_sorted();
        let keys: Vec<_> = entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(
            keys,
            vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]
        );

        assert!(memtable.is_empty());
        assert!(memtable.get(b"apple").is_none());
    }

    #[test]
    fn test_entries_in_is_inclusive() {
        let memtable = Memtable::new(30);
        for key in [&b"a"[..], b"b", b"c", b"d", b"e"] {
            memtable.insert(put(key, b"v", 1));
        }

        let keys: Vec<_> = memtable
            .entries_in(b"b", b"d")
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }
}
