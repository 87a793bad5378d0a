//! In-memory sorted table backed by a concurrent skip list.
//!
//! The memtable is the first stop for every write. `crossbeam-skiplist`'s
//! `SkipMap` gives us lock-free concurrent reads, linearizable per-key
//! writes, and ordered range iteration, so upserts from many threads never
//! contend on the table itself.
//!
//! Size accounting tracks the *on-disk serialized* size of the resident
//! entries: replacing a key subtracts the old entry's contribution before
//! adding the new one. The superseded size has to come from the entry the
//! insert actually displaces, so puts for the same key are serialized
//! through a small array of hash-sharded locks; puts for different keys
//! land on different shards and reads never touch them. When the accounted
//! size first exceeds the threshold, a one-shot `oversized` latch flips;
//! exactly one caller observes the transition and is responsible for
//! scheduling the flush.
//!
//! A sealed read-only empty memtable serves as the sentinel occupying the
//! flushing slot while no flush is in progress. Mutating it fails.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::codec;
use crate::entry::Entry;
use crate::error::{Error, Result};

const WRITE_SHARDS: usize = 16;

pub struct Memtable {
    data: SkipMap<Vec<u8>, Option<Vec<u8>>>,
    /// Serializes same-key puts so each size delta is computed against the
    /// entry it actually replaces.
    write_shards: [Mutex<()>; WRITE_SHARDS],
    size: AtomicI64,
    oversized: AtomicBool,
    /// None marks the sealed read-only sentinel.
    threshold: Option<i64>,
}

fn shard(key: &[u8]) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize % WRITE_SHARDS
}

impl Memtable {
    /// Creates an empty memtable that overflows past the given serialized
    /// size in bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            data: SkipMap::new(),
            write_shards: std::array::from_fn(|_| Mutex::new(())),
            size: AtomicI64::new(0),
            oversized: AtomicBool::new(false),
            threshold: Some(threshold as i64),
        }
    }

    /// The read-only empty sentinel. Rejects all mutation.
    pub fn sealed() -> Self {
        Self {
            data: SkipMap::new(),
            write_shards: std::array::from_fn(|_| Mutex::new(())),
            size: AtomicI64::new(0),
            oversized: AtomicBool::new(true),
            threshold: None,
        }
    }

    /// Inserts or replaces an entry. Returns true iff this call flipped the
    /// oversized latch, i.e. the caller must schedule a flush.
    pub fn put(&self, entry: Entry) -> Result<bool> {
        let threshold = self.threshold.ok_or(Error::ReadOnly)?;

        let new_size = codec::entry_size(&entry) as i64;
        let (key, value) = entry.into_parts();

        let delta = {
            // holds same-key puts apart so old_size is the size of the
            // entry this insert displaces, not a stale read
            let _guard = self.write_shards[shard(&key)].lock()?;
            let old_size = self.data.get(&key).map_or(0, |existing| {
                codec::record_size(&key, existing.value().as_deref()) as i64
            });
            self.data.insert(key, value);
            new_size - old_size
        };

        let total = self.size.fetch_add(delta, Ordering::SeqCst) + delta;
        if total > threshold {
            return Ok(!self.oversized.swap(true, Ordering::SeqCst));
        }
        Ok(false)
    }

    /// Trips the oversized latch without inserting, forcing the next flush
    /// decision. Returns true iff this call flipped the latch.
    pub fn overflow(&self) -> Result<bool> {
        if self.threshold.is_none() {
            return Err(Error::ReadOnly);
        }
        Ok(!self.oversized.swap(true, Ordering::SeqCst))
    }

    /// Retrieves the entry for a given key, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.data
            .get(key)
            .map(|e| Entry::from_parts(e.key().clone(), e.value().clone()))
    }

    /// Accounted serialized size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.threshold.is_none()
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("entries", &self.data.len())
            .field("size", &self.size())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

/// Iterator over a snapshot of a memtable range, `from <= key < to`, with
/// `to = None` meaning unbounded.
///
/// The range is materialized at construction: writes issued after the
/// iterator is created are never observed, which is what gives engine scans
/// their snapshot semantics against the live memtable.
pub struct MemtableIter {
    entries: std::vec::IntoIter<Entry>,
}

impl MemtableIter {
    pub fn new(memtable: &Arc<Memtable>, from: &[u8], to: Option<&[u8]>) -> Self {
        let entries: Vec<Entry> = memtable
            .data
            .range::<[u8], _>((
                std::ops::Bound::Included(from),
                match to {
                    Some(to) => std::ops::Bound::Excluded(to),
                    None => std::ops::Bound::Unbounded,
                },
            ))
            .map(|e| Entry::from_parts(e.key().clone(), e.value().clone()))
            .collect();
        Self {
            entries: entries.into_iter(),
        }
    }

    /// All entries of the memtable in key order.
    pub fn all(memtable: &Arc<Memtable>) -> Self {
        Self::new(memtable, crate::entry::FIRST_KEY, None)
    }
}

impl Iterator for MemtableIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(iter: MemtableIter) -> Vec<Entry> {
        iter.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_put_and_get() {
        let memtable = Memtable::new(1024);
        memtable
            .put(Entry::new(b"key1".to_vec(), b"value1".to_vec()))
            .expect("put failed");
        memtable
            .put(Entry::tombstone(b"key2".to_vec()))
            .expect("put failed");

        assert_eq!(
            memtable.get(b"key1"),
            Some(Entry::new(b"key1".to_vec(), b"value1".to_vec()))
        );
        assert_eq!(
            memtable.get(b"key2"),
            Some(Entry::tombstone(b"key2".to_vec()))
        );
        assert_eq!(memtable.get(b"key3"), None);
    }

    #[test]
    fn test_replace_updates_size_accounting() {
        let memtable = Memtable::new(1024);
        let first = Entry::new(b"key".to_vec(), b"a-long-initial-value".to_vec());
        let second = Entry::new(b"key".to_vec(), b"v".to_vec());

        memtable.put(first).unwrap();
        memtable.put(second.clone()).unwrap();

        // only the latest entry's serialized size remains accounted
        assert_eq!(memtable.size(), codec::entry_size(&second));
    }

    #[test]
    fn test_tombstone_replacing_value_shrinks_size() {
        let memtable = Memtable::new(1024);
        memtable
            .put(Entry::new(b"key".to_vec(), b"value".to_vec()))
            .unwrap();
        memtable.put(Entry::tombstone(b"key".to_vec())).unwrap();

        let tombstone = Entry::tombstone(b"key".to_vec());
        assert_eq!(memtable.size(), codec::entry_size(&tombstone));
    }

    #[test]
    fn test_oversized_latch_fires_once() {
        let memtable = Memtable::new(16);
        assert!(!memtable
            .put(Entry::new(b"a".to_vec(), b"1".to_vec()))
            .unwrap());
        // this put crosses the threshold and must be the only one to see it
        assert!(memtable
            .put(Entry::new(b"b".to_vec(), b"some larger value".to_vec()))
            .unwrap());
        assert!(!memtable
            .put(Entry::new(b"c".to_vec(), b"even more data here".to_vec()))
            .unwrap());
    }

    #[test]
    fn test_overflow_fires_once() {
        let memtable = Memtable::new(1024);
        assert!(memtable.overflow().unwrap());
        assert!(!memtable.overflow().unwrap());
    }

    #[test]
    fn test_overflow_then_put_does_not_fire_again() {
        let memtable = Memtable::new(4);
        assert!(memtable.overflow().unwrap());
        assert!(!memtable
            .put(Entry::new(b"key".to_vec(), b"value".to_vec()))
            .unwrap());
    }

    #[test]
    fn test_sealed_rejects_mutation() {
        let memtable = Memtable::sealed();
        assert_eq!(
            memtable.put(Entry::new(b"k".to_vec(), b"v".to_vec())),
            Err(Error::ReadOnly)
        );
        assert_eq!(memtable.overflow(), Err(Error::ReadOnly));
        assert!(memtable.is_read_only());
        assert!(memtable.is_empty());
    }

    #[test]
    fn test_iter_is_sorted() {
        let memtable = Arc::new(Memtable::new(1024));
        for key in [&b"key3"[..], b"key1", b"key2"] {
            memtable
                .put(Entry::new(key.to_vec(), b"v".to_vec()))
                .unwrap();
        }

        let keys: Vec<Vec<u8>> = collect(MemtableIter::all(&memtable))
            .into_iter()
            .map(|e| e.key().to_vec())
            .collect();
        assert_eq!(
            keys,
            vec![b"key1".to_vec(), b"key2".to_vec(), b"key3".to_vec()]
        );
    }

    #[test]
    fn test_iter_bounds() {
        let memtable = Arc::new(Memtable::new(1024));
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            memtable
                .put(Entry::new(key.to_vec(), b"v".to_vec()))
                .unwrap();
        }

        let entries = collect(MemtableIter::new(&memtable, b"b", Some(b"d")));
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec![&b"b"[..], b"c"]);

        // from == to yields nothing
        assert!(collect(MemtableIter::new(&memtable, b"b", Some(b"b"))).is_empty());
    }

    #[test]
    fn test_iter_snapshot_ignores_later_writes() {
        let memtable = Arc::new(Memtable::new(1024));
        memtable
            .put(Entry::new(b"a".to_vec(), b"1".to_vec()))
            .unwrap();

        let iter = MemtableIter::all(&memtable);
        memtable
            .put(Entry::new(b"b".to_vec(), b"2".to_vec()))
            .unwrap();

        let keys: Vec<Vec<u8>> = collect(iter).into_iter().map(|e| e.key().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_concurrent_same_key_puts_keep_size_exact() {
        let memtable = Arc::new(Memtable::new(usize::MAX >> 1));
        let mut handles = Vec::new();
        for t in 0..8 {
            let memtable = Arc::clone(&memtable);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    // varying value lengths so a lost replacement skews the
                    // accounting instead of cancelling out
                    let value = vec![b'v'; (t * 7 + i) % 63 + 1];
                    memtable
                        .put(Entry::new(b"contended".to_vec(), value))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // whatever write won, the accounted size is exactly the resident
        // entry's serialized size
        let resident = memtable.get(b"contended").unwrap();
        assert_eq!(memtable.size(), codec::entry_size(&resident));
    }

    #[test]
    fn test_concurrent_puts_are_visible() {
        let memtable = Arc::new(Memtable::new(1024 * 1024));
        let mut handles = Vec::new();
        for t in 0..4 {
            let memtable = Arc::clone(&memtable);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("key_{t}_{i:03}").into_bytes();
                    memtable.put(Entry::new(key, b"v".to_vec())).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4 {
            for i in 0..100 {
                let key = format!("key_{t}_{i:03}").into_bytes();
                assert!(memtable.get(&key).is_some());
            }
        }
    }
}
