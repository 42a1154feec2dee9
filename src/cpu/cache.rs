//! Write-back cache for memory mutations made inside loops.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

/// Touch count at which an entry is written back by the LFU pass.
pub const FLUSH_THRESHOLD: u32 = 5;

/// A cached data word and its touch counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cacheable {
    pub value: i64,
    pub access: u32,
}

/// Address -> cached word. Entries are dirty until flushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBackCache {
    entries: BTreeMap<i64, Cacheable>,
}

impl WriteBackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: i64) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn entry(&self, address: i64) -> Option<Cacheable> {
        self.entries.get(&address).copied()
    }

    /// Cached value without counting a touch.
    pub fn get(&self, address: i64) -> Option<i64> {
        self.entries.get(&address).map(|e| e.value)
    }

    /// Insert the value read from memory, untouched. Existing entries win.
    pub fn seed(&mut self, address: i64, value: i64) {
        self.entries.entry(address).or_insert(Cacheable { value, access: 0 });
    }

    /// Read and count a touch.
    pub fn touch(&mut self, address: i64) -> Option<i64> {
        let entry = self.entries.get_mut(&address)?;
        entry.access += 1;
        Some(entry.value)
    }

    /// Write and count a touch, creating the entry if needed.
    pub fn store(&mut self, address: i64, value: i64) {
        let entry = self.entries.entry(address).or_default();
        entry.value = value;
        entry.access += 1;
    }

    /// Drop an entry without writing it back.
    pub fn remove(&mut self, address: i64) -> Option<Cacheable> {
        self.entries.remove(&address)
    }

    /// Collect every entry touched at least [`FLUSH_THRESHOLD`] times and
    /// reset its counter. The entries stay cached.
    pub fn lfu_pass(&mut self) -> Vec<(i64, i64)> {
        self.entries
            .iter_mut()
            .filter(|(_, e)| e.access >= FLUSH_THRESHOLD)
            .map(|(&address, e)| {
                e.access = 0;
                (address, e.value)
            })
            .collect()
    }

    /// Empty the cache, returning every entry for write-back.
    pub fn flush_all(&mut self) -> Vec<(i64, i64)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(address, e)| (address, e.value))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, Cacheable)> + '_ {
        self.entries.iter().map(|(&a, &e)| (a, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_does_not_touch() {
        let mut cache = WriteBackCache::new();
        cache.seed(0x10, 7);
        cache.seed(0x10, 99);
        assert_eq!(cache.entry(0x10), Some(Cacheable { value: 7, access: 0 }));
    }

    #[test]
    fn test_touch_and_store_count() {
        let mut cache = WriteBackCache::new();
        assert_eq!(cache.touch(1), None);
        cache.store(1, 3);
        assert_eq!(cache.touch(1), Some(3));
        assert_eq!(cache.get(1), Some(3));
        assert_eq!(cache.entry(1).unwrap().access, 2);
    }

    #[test]
    fn test_lfu_pass_at_threshold() {
        let mut cache = WriteBackCache::new();
        for i in 0..FLUSH_THRESHOLD as i64 {
            cache.store(1, i);
        }
        cache.store(2, 8);

        assert_eq!(cache.lfu_pass(), vec![(1, 4)]);
        assert_eq!(cache.entry(1), Some(Cacheable { value: 4, access: 0 }));
        assert!(cache.lfu_pass().is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_flush_all_empties() {
        let mut cache = WriteBackCache::new();
        cache.store(5, 1);
        cache.store(2, 9);
        assert_eq!(cache.flush_all(), vec![(2, 9), (5, 1)]);
        assert!(cache.is_empty());
    }
}
