//! The engine facade: public operations and flush scheduling.
//!
//! # Locking
//!
//! One reader-writer lock guards the published state, and it is used
//! inversely to intuition: **upserts take the shared side** so any number
//! of writers proceed in parallel into the lock-free memtable, while
//! **state transitions take the exclusive side** for the instant it takes
//! to swap in a new immutable [`EngineState`]. This is deliberate, not a
//! mistake: the exclusive section serializes snapshot replacement, which
//! guarantees every upsert lands in a memtable that belongs to one
//! consistent `{active, flushing, storage}` triple.
//!
//! # Background work
//!
//! Flush and compaction run on a single worker thread. An overflow that
//! finds a flush already pending surfaces [`Error::TooManyFlushes`] to the
//! one upsert that tripped the latch; an explicit [`Engine::flush`] awaits
//! the pending flush instead. A background failure closes storage, which
//! poisons every subsequent read, and propagates to the waiting caller.

use std::sync::{Arc, Mutex, RwLock};

use crate::config::Config;
use crate::entry::{Entry, FIRST_KEY};
use crate::errinput;
use crate::error::{Error, Result};
use crate::iterator::{EntryIter, MergeIterator, TombstoneFilter};
use crate::memtable::MemtableIter;
use crate::run::RunWriter;
use crate::state::EngineState;
use crate::storage::{self, StorageSet};
use crate::worker::{Task, Worker};

/// The iterator returned by [`Engine::scan`]: a newest-wins merge over the
/// snapshot's stores with tombstones hidden.
pub type ScanIter = TombstoneFilter<MergeIterator>;

struct Shared {
    config: Config,
    /// The coordination lock and the published state are one structure:
    /// readers snapshot the `Arc` under the shared side, transitions swap
    /// it under the exclusive side.
    state: RwLock<Arc<EngineState>>,
}

pub struct Engine {
    shared: Arc<Shared>,
    worker: Worker,
    /// Latest scheduled flush, so an explicit flush can await one that an
    /// overflow already started.
    pending_flush: Mutex<Option<Task>>,
    /// Serializes close against itself (it is idempotent but not atomic).
    close_lock: Mutex<()>,
}

impl Engine {
    /// Opens the engine over a data directory, creating it if needed.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let storage = Arc::new(StorageSet::load(&config.dir)?);
        tracing::info!(
            dir = %config.dir.display(),
            runs = storage.run_count(),
            "opened engine"
        );

        let state = EngineState::new(&config, storage);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(Arc::new(state)),
            }),
            worker: Worker::new("emberdb-bg"),
            pending_flush: Mutex::new(None),
            close_lock: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Result<Arc<EngineState>> {
        let state = Arc::clone(&*self.shared.state.read()?);
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state)
    }

    /// Point lookup. Consults the active memtable, then the flushing
    /// memtable, then every run newest-first; the first hit decides.
    /// Tombstones and misses both come back as `None`; deletion markers
    /// never escape.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.snapshot()?;
        let entry = match state.memtable.get(key) {
            Some(entry) => Some(entry),
            None => match state.flushing.get(key) {
                Some(entry) => Some(entry),
                None => state.storage.get(key)?,
            },
        };
        Ok(entry.and_then(Entry::into_value))
    }

    /// Forward range scan over `from <= key < to`, with `to = None`
    /// unbounded and the empty `from` meaning the very first key. The
    /// iterator reflects the state snapshot taken here; later writes are
    /// invisible to it.
    pub fn scan(&self, from: &[u8], to: Option<&[u8]>) -> Result<ScanIter> {
        let state = self.snapshot()?;

        let mut sources: Vec<EntryIter> = Vec::with_capacity(state.storage.run_count() + 2);
        sources.push(Box::new(MemtableIter::new(&state.memtable, from, to)));
        sources.push(Box::new(MemtableIter::new(&state.flushing, from, to)));
        for run_iter in state.storage.iterate(from, to)? {
            sources.push(Box::new(run_iter));
        }

        Ok(TombstoneFilter::new(MergeIterator::new(sources)))
    }

    /// Inserts, replaces, or deletes (via a tombstone entry) a key. If this
    /// write tips the active memtable over its threshold, a background
    /// flush is scheduled; the write itself never waits on flush I/O.
    pub fn upsert(&self, entry: Entry) -> Result<()> {
        if entry.key().is_empty() {
            return errinput!("key must not be empty");
        }

        let should_flush = {
            // the shared side: parallel upserts, serialized against swaps
            let guard = self.shared.state.read()?;
            let state = Arc::clone(&guard);
            if state.closed {
                return Err(Error::Closed);
            }
            state.memtable.put(entry)?
        };

        if should_flush {
            self.flush_in_bg(false)?;
        }
        Ok(())
    }

    /// Inserts or replaces a key.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.upsert(Entry::new(key.to_vec(), value))
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.upsert(Entry::tombstone(key.to_vec()))
    }

    /// Forces a flush of the active memtable regardless of size and waits
    /// for it to be durable and installed. If a flush is already pending,
    /// awaits that one instead.
    pub fn flush(&self) -> Result<()> {
        let run_flush = {
            let guard = self.shared.state.write()?;
            let state = Arc::clone(&guard);
            if state.closed {
                return Err(Error::Closed);
            }
            state.memtable.overflow()?
        };

        if run_flush {
            return self.flush_in_bg(true)?.wait();
        }
        // The latch was already tripped, so a flush for this memtable is
        // scheduled or running; await it.
        let pending = self.pending_flush.lock()?.clone();
        match pending {
            Some(task) => task.wait(),
            None => Ok(()),
        }
    }

    /// Schedules a background flush, transitioning the state to flushing.
    /// With `tolerate_flush_in_progress`, an in-flight flush is returned
    /// for awaiting; without it, the overflow caller gets back-pressure.
    fn flush_in_bg(&self, tolerate_flush_in_progress: bool) -> Result<Task> {
        let task = {
            let mut guard = self.shared.state.write()?;
            let state = Arc::clone(&guard);
            if state.closed {
                return Err(Error::Closed);
            }
            if state.is_flushing() {
                if tolerate_flush_in_progress {
                    let pending = self.pending_flush.lock()?.clone();
                    return Ok(pending.unwrap_or_else(Task::completed));
                }
                return Err(Error::TooManyFlushes);
            }
            *guard = Arc::new(state.prepare_flush(&self.shared.config)?);

            // published before the lock drops: anyone who observes the
            // flushing state also finds this task to await
            let task = Task::new();
            *self.pending_flush.lock()? = Some(task.clone());
            task
        };

        let shared = Arc::clone(&self.shared);
        if let Err(e) = self
            .worker
            .submit("flush", task.clone(), move || Self::run_flush(&shared))
        {
            task.complete(Err(e.clone()));
            return Err(e);
        }
        Ok(task)
    }

    /// The flush job: write the flushing memtable as a new run, reload the
    /// storage set, and install it. Runs on the worker thread.
    fn run_flush(shared: &Arc<Shared>) -> Result<()> {
        let state = Arc::clone(&*shared.state.read()?);

        let result = (|| -> Result<()> {
            if !state.flushing.is_empty() {
                let generation = state.storage.next_generation();
                let path = storage::run_path(&shared.config.dir, generation);
                let count = RunWriter::write(&path, MemtableIter::all(&state.flushing))?;
                tracing::info!(generation, entries = count, "flushed memtable");
            }

            let storage = Arc::new(StorageSet::load(&shared.config.dir)?);
            {
                let mut guard = shared.state.write()?;
                let current = Arc::clone(&guard);
                *guard = Arc::new(current.after_flush(storage)?);
            }
            state.storage.maybe_close();
            Ok(())
        })();

        if let Err(e) = &result {
            tracing::error!(error = %e, "flush failed, closing storage");
            shared.state.read()?.storage.close();
        }
        result
    }

    /// Collapses all runs into one and waits for it. No-op when storage is
    /// already compacted and the active memtable is empty.
    pub fn compact(&self) -> Result<()> {
        let state = self.snapshot()?;
        if state.memtable.is_empty() && state.storage.is_compacted() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let task = Task::new();
        self.worker
            .submit("compact", task.clone(), move || Self::run_compact(&shared))?;
        task.wait()
    }

    /// The compaction job: newest-wins merge of every run with tombstones
    /// dropped, written as a single new run; superseded run files are
    /// deleted afterwards. Memtables are not involved. Runs on the worker
    /// thread.
    fn run_compact(shared: &Arc<Shared>) -> Result<()> {
        let state = Arc::clone(&*shared.state.read()?);
        if state.memtable.is_empty() && state.storage.is_compacted() {
            return Ok(());
        }

        let result = (|| -> Result<()> {
            if state.storage.run_count() > 0 {
                let generation = state.storage.next_generation();
                let path = storage::run_path(&shared.config.dir, generation);

                let sources: Vec<EntryIter> = state
                    .storage
                    .iterate(FIRST_KEY, None)?
                    .into_iter()
                    .map(|iter| Box::new(iter) as EntryIter)
                    .collect();
                let merged = TombstoneFilter::new(MergeIterator::new(sources));
                let count = RunWriter::write(&path, merged)?;

                for run in state.storage.runs() {
                    std::fs::remove_file(run.path())?;
                }
                tracing::info!(
                    generation,
                    entries = count,
                    replaced = state.storage.run_count(),
                    "compacted storage"
                );
            }

            let storage = Arc::new(StorageSet::load(&shared.config.dir)?);
            {
                let mut guard = shared.state.write()?;
                let current = Arc::clone(&guard);
                *guard = Arc::new(current.after_compact(storage)?);
            }
            state.storage.maybe_close();
            Ok(())
        })();

        if let Err(e) = &result {
            tracing::error!(error = %e, "compaction failed, closing storage");
            shared.state.read()?.storage.close();
        }
        result
    }

    /// Shuts the engine down: drains the background worker, closes storage,
    /// and writes any remaining active-memtable contents to a final run.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        let _guard = self.close_lock.lock()?;
        {
            let state = self.shared.state.read()?;
            if state.closed {
                return Ok(());
            }
        }

        self.worker.shutdown()?;

        let state = Arc::clone(&*self.shared.state.read()?);
        state.storage.close();
        {
            let mut guard = self.shared.state.write()?;
            let current = Arc::clone(&guard);
            *guard = Arc::new(current.after_close()?);
        }

        if !state.memtable.is_empty() {
            let generation = state.storage.next_generation();
            let path = storage::run_path(&self.shared.config.dir, generation);
            let count = RunWriter::write(&path, MemtableIter::all(&state.memtable))?;
            tracing::info!(generation, entries = count, "flushed memtable on close");
        }

        tracing::info!(dir = %self.shared.config.dir.display(), "closed engine");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "close on drop failed");
        }
    }
}
