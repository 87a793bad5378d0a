//! The on-disk generation set: every sorted run currently visible.
//!
//! There is no manifest; the directory listing is the source of truth. Run
//! files are named `run_<generation>.data` with a zero-padded monotonic
//! generation, so a lexicographic directory sort is also a generation sort.
//! Higher generation means newer, and wins on key conflicts.
//!
//! A storage set is immutable once published. Flush and compaction write
//! new files and then load a fresh set; the superseded set is marked closed
//! once no state snapshot references it, while in-flight scan iterators
//! keep their runs alive through `Arc` until they drain.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::run::{Run, RunIter, TMP_EXTENSION};

const RUN_PREFIX: &str = "run_";
const RUN_SUFFIX: &str = ".data";

/// Path of the run file for a generation.
pub fn run_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{RUN_PREFIX}{generation:010}{RUN_SUFFIX}"))
}

/// Parses a generation out of a run file name.
fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(RUN_PREFIX)?
        .strip_suffix(RUN_SUFFIX)?
        .parse()
        .ok()
}

pub struct StorageSet {
    /// Newest first.
    runs: Vec<Arc<Run>>,
    next_generation: u64,
    closed: AtomicBool,
}

impl StorageSet {
    /// Loads the storage set from a data directory: removes temp files left
    /// by interrupted writers, then opens every run, newest first.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut generations = Vec::new();
        for dir_entry in std::fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TMP_EXTENSION) {
                tracing::warn!(path = %path.display(), "removing stale temp file");
                std::fs::remove_file(&path)?;
                continue;
            }
            if let Some(generation) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_generation)
            {
                generations.push((generation, path));
            }
        }
        generations.sort_by_key(|(generation, _)| *generation);

        let next_generation = generations.last().map_or(0, |(generation, _)| generation + 1);
        let mut runs = Vec::with_capacity(generations.len());
        for (generation, path) in generations.into_iter().rev() {
            runs.push(Arc::new(Run::open(path, generation)?));
        }

        Ok(Self {
            runs,
            next_generation,
            closed: AtomicBool::new(false),
        })
    }

    /// Probes runs newest-first and returns the first hit, tombstones
    /// included so that a deletion masks older generations.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.check_open()?;
        for run in &self.runs {
            if let Some(entry) = run.get(key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// One lazy scan iterator per run, newest first. The caller feeds these
    /// into the merge in this order so newer runs shadow older ones.
    pub fn iterate(&self, from: &[u8], to: Option<&[u8]>) -> Result<Vec<RunIter>> {
        self.check_open()?;
        self.runs
            .iter()
            .map(|run| RunIter::new(Arc::clone(run), from, to))
            .collect()
    }

    pub fn runs(&self) -> &[Arc<Run>] {
        &self.runs
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// A set with at most one run has nothing left to compact.
    pub fn is_compacted(&self) -> bool {
        self.runs.len() <= 1
    }

    /// Generation for the next run written against this set.
    pub fn next_generation(&self) -> u64 {
        self.next_generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the set closed; subsequent reads through it fail. File handles
    /// are released when the last `Arc<Run>` drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Retires a superseded set after a new one has been installed.
    pub fn maybe_close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(runs = self.runs.len(), "retired storage set");
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for StorageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StorageSet")
            .field("runs", &self.runs)
            .field("next_generation", &self.next_generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}
