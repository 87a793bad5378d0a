//! Merge and filter iterators for scan operations.
//!
//! A scan draws from up to K ordered sources at once: the active memtable,
//! the flushing memtable, and one iterator per sorted run. The merge
//! iterator combines them into a single ordered stream with newest-wins
//! semantics, and the tombstone filter hides deletion markers from the
//! caller.
//!
//! # Merge strategy
//!
//! A binary min-heap holds the current head of every source, ordered by
//! `(key, source index)`. Lower source index means newer data, so on a key
//! tie the newest source pops first; any later pop of the same key from an
//! older source is skipped by comparing against the last yielded key.
//!
//! ```text
//! sources:  [a, d, g, ...]  [b, d, h, ...]  [c, f, i, ...]
//!               |               |               |
//! heap:     [   a,              b,              c     ]
//!               | (pop minimum)
//! output:       a
//! ```
//!
//! Sources are pulled lazily, one element per emit, so large scans never
//! buffer more than K heads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entry::Entry;
use crate::error::Result;

/// A boxed ordered entry source feeding the merge.
pub type EntryIter = Box<dyn Iterator<Item = Result<Entry>> + Send>;

struct HeapItem {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key() == other.entry.key() && self.source == other.source
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse the key comparison so the
        // smallest key pops first. On a tie the lower source index (newer)
        // must pop first.
        match self.entry.key().cmp(other.entry.key()) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

/// Merges K ordered entry streams into one ordered stream. For each
/// distinct key only the entry from the lowest-index source is emitted;
/// equal keys from higher-index sources are dropped. Tombstones are
/// preserved.
pub struct MergeIterator {
    sources: Vec<EntryIter>,
    heap: BinaryHeap<HeapItem>,
    last_key: Option<Vec<u8>>,
    pending_error: Option<crate::error::Error>,
    failed: bool,
}

impl MergeIterator {
    pub fn new(mut sources: Vec<EntryIter>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut pending_error = None;
        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok(entry)) => heap.push(HeapItem { entry, source }),
                Some(Err(e)) => {
                    pending_error = Some(e);
                    break;
                }
                None => {}
            }
        }
        Self {
            sources,
            heap,
            last_key: None,
            pending_error,
            failed: false,
        }
    }

    /// Pulls the next head from a source into the heap.
    fn advance(&mut self, source: usize) -> Result<()> {
        match self.sources[source].next() {
            Some(Ok(entry)) => {
                self.heap.push(HeapItem { entry, source });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        while let Some(item) = self.heap.pop() {
            // A refill failure is delivered after the current entry.
            if let Err(e) = self.advance(item.source) {
                self.pending_error = Some(e);
            }

            // An equal key from an older source was already shadowed.
            if self.last_key.as_deref() == Some(item.entry.key()) {
                if let Some(e) = self.pending_error.take() {
                    self.failed = true;
                    return Some(Err(e));
                }
                continue;
            }

            self.last_key = Some(item.entry.key().to_vec());
            return Some(Ok(item.entry));
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        None
    }
}

/// Wraps an entry iterator and hides tombstones. Applied to range scans
/// only; point lookups must see the raw entry so a tombstone masks older
/// generations.
pub struct TombstoneFilter<I: Iterator<Item = Result<Entry>>> {
    inner: I,
    peeked: Option<Result<Entry>>,
}

impl<I: Iterator<Item = Result<Entry>>> TombstoneFilter<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            peeked: None,
        }
    }

    /// Returns the next live entry without consuming it.
    pub fn peek(&mut self) -> Option<&Result<Entry>> {
        if self.peeked.is_none() {
            self.peeked = self.next();
        }
        self.peeked.as_ref()
    }
}

impl<I: Iterator<Item = Result<Entry>>> Iterator for TombstoneFilter<I> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.peeked.take() {
            return Some(item);
        }
        loop {
            match self.inner.next()? {
                Ok(entry) if entry.is_tombstone() => continue,
                item => return Some(item),
            }
        }
    }
}
