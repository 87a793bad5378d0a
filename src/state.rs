//! The engine's immutable state snapshot and its transitions.
//!
//! Every operation starts by snapshotting one `Arc<EngineState>`; the
//! triple `{memtable, flushing, storage}` it sees is guaranteed consistent
//! because transitions build a whole new state and swap the `Arc` under the
//! exclusive side of the coordination lock. No field is ever mutated in
//! place.
//!
//! At most one flush is in progress: `flushing` holds the sealed empty
//! sentinel while idle and the frozen memtable while a flush is running.
//! The `closed` flag never returns to false.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::storage::StorageSet;

#[derive(Debug)]
pub struct EngineState {
    pub memtable: Arc<Memtable>,
    pub flushing: Arc<Memtable>,
    pub storage: Arc<StorageSet>,
    pub closed: bool,
}

impl EngineState {
    /// Fresh state for an opened engine: empty active memtable, idle
    /// flushing slot.
    pub fn new(config: &Config, storage: Arc<StorageSet>) -> Self {
        Self {
            memtable: Arc::new(Memtable::new(config.flush_threshold_bytes)),
            flushing: Arc::new(Memtable::sealed()),
            storage,
            closed: false,
        }
    }

    /// Whether a flush is in progress. Only the sealed sentinel ever
    /// occupies the flushing slot outside a flush.
    pub fn is_flushing(&self) -> bool {
        !self.flushing.is_read_only()
    }

    /// `idle -> flushing`: the active memtable moves into the flushing slot
    /// and a fresh empty memtable takes its place.
    pub fn prepare_flush(&self, config: &Config) -> Result<Self> {
        self.check_open()?;
        if self.is_flushing() {
            return Err(Error::InvalidState("already flushing".to_string()));
        }
        Ok(Self {
            memtable: Arc::new(Memtable::new(config.flush_threshold_bytes)),
            flushing: Arc::clone(&self.memtable),
            storage: Arc::clone(&self.storage),
            closed: false,
        })
    }

    /// `flushing -> idle`: the storage set that includes the new run
    /// replaces the old one and the flushing slot empties.
    pub fn after_flush(&self, storage: Arc<StorageSet>) -> Result<Self> {
        self.check_open()?;
        if !self.is_flushing() {
            return Err(Error::InvalidState("not flushing".to_string()));
        }
        Ok(Self {
            memtable: Arc::clone(&self.memtable),
            flushing: Arc::new(Memtable::sealed()),
            storage,
            closed: false,
        })
    }

    /// Installs the compacted storage set; memtables are untouched.
    pub fn after_compact(&self, storage: Arc<StorageSet>) -> Result<Self> {
        self.check_open()?;
        Ok(Self {
            memtable: Arc::clone(&self.memtable),
            flushing: Arc::clone(&self.flushing),
            storage,
            closed: false,
        })
    }

    /// Terminal transition, valid only once storage has been closed.
    pub fn after_close(&self) -> Result<Self> {
        self.check_open()?;
        if !self.storage.is_closed() {
            return Err(Error::InvalidState(
                "storage must be closed first".to_string(),
            ));
        }
        Ok(Self {
            memtable: Arc::new(Memtable::sealed()),
            flushing: Arc::new(Memtable::sealed()),
            storage: Arc::clone(&self.storage),
            closed: true,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
