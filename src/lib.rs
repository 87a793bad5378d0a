//! EmberDB: an embedded LSM-tree key-value storage engine.
//!
//! The engine stores opaque byte-string keys and values, ordered
//! lexicographically, and supports point writes (including deletions),
//! point lookups, and forward range scans. Data is durable across restarts
//! and memory stays bounded by flushing the write buffer to disk.
//!
//! # Architecture
//!
//! ```text
//!  writers ──────────┐              readers ─────────────┐
//!                    ▼                                   ▼
//!          ┌──────────────────┐   snapshot   ┌────────────────────────┐
//!          │ Active Memtable  │◄─────────────┤ EngineState            │
//!          │   (SkipMap)      │              │ {active, flushing,     │
//!          └────────┬─────────┘              │  storage, closed}      │
//!                   │ overflow              └────────────────────────┘
//!                   ▼
//!          ┌──────────────────┐
//!          │ Flushing Memtable│   background worker
//!          └────────┬─────────┘
//!                   │ flush
//!                   ▼
//!          ┌──────────────────┐
//!          │ Sorted runs      │  run_0000000002.data   (newest)
//!          │ (StorageSet)     │  run_0000000001.data
//!          │                  │  run_0000000000.data   (oldest)
//!          └──────────────────┘
//! ```
//!
//! Writes land in the active memtable; when its accounted size crosses the
//! flush threshold the state transitions so the full memtable becomes the
//! flushing memtable and a fresh one takes its place, while a single
//! background worker persists the frozen table as a new sorted run. Reads
//! consult the active memtable, the flushing memtable, and every run
//! newest-first, merged with newest-wins semantics and tombstones
//! suppressed. Compaction collapses all runs into one.
//!
//! There is no write-ahead log: memtable contents not yet flushed are lost
//! on a crash, by design. [`Engine::close`] flushes the active memtable, so
//! an orderly shutdown loses nothing.
//!
//! # Example
//!
//! ```no_run
//! use emberdb::{Config, Engine};
//!
//! # fn main() -> emberdb::Result<()> {
//! let engine = Engine::open(Config::new("./data"))?;
//! engine.set(b"hello", b"world".to_vec())?;
//! assert_eq!(engine.get(b"hello")?, Some(b"world".to_vec()));
//! for entry in engine.scan(b"", None)? {
//!     let entry = entry?;
//!     println!("{:?} = {:?}", entry.key(), entry.value());
//! }
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod iterator;
pub mod memtable;
pub mod run;
pub mod state;
pub mod storage;
pub mod worker;

pub use config::Config;
pub use engine::{Engine, ScanIter};
pub use entry::Entry;
pub use error::{Error, Result};
