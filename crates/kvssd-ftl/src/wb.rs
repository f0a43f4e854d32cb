use std::collections::HashMap;

use kvssd_collections::SkipList;
use kvssd_types::{GrainAddr, Key, KvRecord, Lpa};

use crate::hash::HashMeta;

/// Buffered pair awaiting flush.
pub struct WbEntry {
    pub value: Vec<u8>,
    pub grains: u32,
    pub hash: HashMeta,
}

/// Skiplist write buffer, bounded to the flush size. Keys overwrite in
/// place, so a flush batch never carries two entries for one key.
pub struct WriteBuffer {
    list: SkipList<Key, WbEntry>,
    flush_size: usize,
}

impl WriteBuffer {
    pub fn new(flush_size: usize) -> Self {
        WriteBuffer {
            list: SkipList::new(),
            flush_size,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.list.len() >= self.flush_size
    }

    /// Insert or overwrite; returns the displaced entry for space
    /// accounting.
    pub fn insert(&mut self, key: Key, value: Vec<u8>) -> Option<WbEntry> {
        let grains = KvRecord::grains(&key, value.len()) as u32;
        let hash = HashMeta::new(&key);
        self.list.insert(key, WbEntry { value, grains, hash })
    }

    pub fn probe(&self, key: &Key) -> Option<&WbEntry> {
        self.list.get(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<WbEntry> {
        self.list.remove(key)
    }

    /// Empty the buffer into flush order (ascending key order, matching the
    /// skiplist iteration the packer walks).
    pub fn drain(&mut self) -> Vec<(Key, WbEntry)> {
        self.list.drain_ordered()
    }
}

/// Flush-scoped secondary index `grain address -> LPA`. A data check
/// against a grain address present here would read bytes this very flush
/// has already superseded, so the caller reroutes to the collision path
/// instead. Rebuilt empty after every flush.
#[derive(Default)]
pub struct DedupTable {
    map: HashMap<u32, Lpa>,
}

impl DedupTable {
    pub fn insert(&mut self, ppa: GrainAddr, lpa: Lpa) {
        self.map.insert(ppa.raw(), lpa);
    }

    /// Record a delete: the tombstone keeps the slot from matching any
    /// real grain address.
    pub fn insert_tombstone(&mut self, lpa: Lpa) {
        self.map.insert(u32::MAX, lpa);
    }

    pub fn contains(&self, ppa: GrainAddr) -> bool {
        self.map.contains_key(&ppa.raw())
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_replaces_in_place() {
        let mut wb = WriteBuffer::new(4);
        let k = Key::new(b"dup").unwrap();
        assert!(wb.insert(k, vec![1; 4]).is_none());
        let old = wb.insert(k, vec![2; 8]).unwrap();
        assert_eq!(old.value, vec![1; 4]);
        assert_eq!(wb.len(), 1);
        assert_eq!(wb.probe(&k).unwrap().value, vec![2; 8]);
    }

    #[test]
    fn fills_at_flush_size() {
        let mut wb = WriteBuffer::new(2);
        wb.insert(Key::new(b"a").unwrap(), vec![0; 4]);
        assert!(!wb.is_full());
        wb.insert(Key::new(b"b").unwrap(), vec![0; 4]);
        assert!(wb.is_full());
        let batch = wb.drain();
        assert_eq!(batch.len(), 2);
        assert!(wb.is_empty());
    }

    #[test]
    fn dedup_table_flags_superseded_grains() {
        let mut ht = DedupTable::default();
        let g = GrainAddr::new(3, 1);
        assert!(!ht.contains(g));
        ht.insert(g, 42);
        assert!(ht.contains(g));
        ht.clear();
        assert!(!ht.contains(g));
    }
}
