//! Reading and writing of sorted-run files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};

use super::index::OffsetIndex;
use crate::codec;
use crate::entry::Entry;
use crate::error::{Error, Result};

/// Suffix for in-progress run files. A `.tmp` file is never opened as a
/// run; load-time cleanup removes leftovers from crashed writers.
pub const TMP_EXTENSION: &str = "tmp";

/// A read-only handle to one sorted run.
///
/// The offset index is held in memory; record reads go through a shared
/// file handle behind a mutex, so `get` and `scan` work through `&self`
/// from any number of threads. Runs are shared via `Arc`: the file handle
/// closes when the last reader drops, which is what lets compaction unlink
/// a superseded run while scans are still draining it.
pub struct Run {
    path: PathBuf,
    generation: u64,
    file: Mutex<File>,
    index: OffsetIndex,
}

impl Run {
    /// Opens a run file and loads its index. Structural corruption is a
    /// fatal open-time error.
    pub fn open(path: impl Into<PathBuf>, generation: u64) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let index = OffsetIndex::load(&mut file, file_len).map_err(|e| {
            Error::InvalidData(format!("run {}: {e}", path.display()))
        })?;

        Ok(Self {
            path,
            generation,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries in the run.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn key_at(&self, i: usize) -> Result<Vec<u8>> {
        let offset = self
            .index
            .get(i)
            .ok_or_else(|| Error::InvalidState(format!("record {i} out of range")))?;
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        codec::read_key(&mut *file)
    }

    fn entry_at(&self, i: usize) -> Result<Entry> {
        let offset = self
            .index
            .get(i)
            .ok_or_else(|| Error::InvalidState(format!("record {i} out of range")))?;
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        codec::read_entry(&mut *file)
    }

    /// Binary-search point lookup. Returns the stored entry, tombstones
    /// included, or None if the run does not contain the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let mut low = 0;
        let mut high = self.index.len();
        while low < high {
            let mid = (low + high) / 2;
            match self.key_at(mid)?.as_slice().cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return self.entry_at(mid).map(Some),
            }
        }
        Ok(None)
    }

    /// Index of the first record whose key is >= the given key.
    fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        let mut low = 0;
        let mut high = self.index.len();
        while low < high {
            let mid = (low + high) / 2;
            if self.key_at(mid)?.as_slice() < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("path", &self.path)
            .field("generation", &self.generation)
            .field("entries", &self.len())
            .finish()
    }
}

/// Lazy iterator over a key range of one run, `from <= key < to`.
pub struct RunIter {
    run: Arc<Run>,
    pos: usize,
    to: Option<Vec<u8>>,
    done: bool,
}

impl RunIter {
    pub fn new(run: Arc<Run>, from: &[u8], to: Option<&[u8]>) -> Result<Self> {
        let pos = run.lower_bound(from)?;
        Ok(Self {
            run,
            pos,
            to: to.map(|t| t.to_vec()),
            done: false,
        })
    }
}

impl Iterator for RunIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.run.len() {
            return None;
        }
        let entry = match self.run.entry_at(self.pos) {
            Ok(entry) => entry,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if let Some(to) = &self.to {
            if entry.key() >= to.as_slice() {
                self.done = true;
                return None;
            }
        }
        self.pos += 1;
        Some(Ok(entry))
    }
}

/// Writes a sorted entry stream into a new run file.
pub struct RunWriter;

impl RunWriter {
    /// Streams entries into `<path>.tmp`, appends the offset index and
    /// trailer, fsyncs, and atomically renames to `path`. On any error the
    /// temp file is removed and the final name never appears.
    ///
    /// The input must already be key-ascending with no duplicates, which
    /// both producers (memtable iterators and the merge) guarantee.
    pub fn write<I>(path: &Path, entries: I) -> Result<usize>
    where
        I: Iterator<Item = Result<Entry>>,
    {
        let tmp_path = path.with_extension(TMP_EXTENSION);
        let result = Self::write_inner(&tmp_path, path, entries);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn write_inner<I>(tmp_path: &Path, path: &Path, entries: I) -> Result<usize>
    where
        I: Iterator<Item = Result<Entry>>,
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut writer = BufWriter::new(file);

        let mut offsets = Vec::new();
        let mut offset = 0u64;
        for entry in entries {
            let entry = entry?;
            offsets.push(offset);
            codec::write_entry(&mut writer, &entry)?;
            offset += codec::entry_size(&entry);
        }

        for record_offset in &offsets {
            writer.write_u64::<LittleEndian>(*record_offset)?;
        }
        writer.write_u64::<LittleEndian>(offsets.len() as u64)?;

        let file = writer
            .into_inner()
            .map_err(|e| Error::IO(e.to_string()))?;
        file.sync_all()?;
        fs::rename(tmp_path, path)?;

        Ok(offsets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &[u8], value: &[u8]) -> Entry {
        Entry::new(key.to_vec(), value.to_vec())
    }

    fn write_run(dir: &TempDir, name: &str, entries: Vec<Entry>) -> Arc<Run> {
        let path = dir.path().join(name);
        RunWriter::write(&path, entries.into_iter().map(Ok)).expect("write failed");
        Arc::new(Run::open(path, 0).expect("open failed"))
    }

    fn sample_run(dir: &TempDir) -> Arc<Run> {
        write_run(
            dir,
            "sample.data",
            vec![
                entry(b"apple", b"fruit"),
                entry(b"banana", b"fruit"),
                Entry::tombstone(b"cherry".to_vec()),
                entry(b"date", b"fruit"),
            ],
        )
    }

    #[test]
    fn test_write_and_get() {
        let dir = TempDir::new().unwrap();
        let run = sample_run(&dir);

        assert_eq!(run.len(), 4);
        assert_eq!(run.get(b"apple").unwrap(), Some(entry(b"apple", b"fruit")));
        assert_eq!(run.get(b"date").unwrap(), Some(entry(b"date", b"fruit")));
        assert_eq!(run.get(b"durian").unwrap(), None);
        assert_eq!(run.get(b"aardvark").unwrap(), None);
    }

    #[test]
    fn test_get_returns_tombstones() {
        let dir = TempDir::new().unwrap();
        let run = sample_run(&dir);
        assert_eq!(
            run.get(b"cherry").unwrap(),
            Some(Entry::tombstone(b"cherry".to_vec()))
        );
    }

    #[test]
    fn test_scan_full() {
        let dir = TempDir::new().unwrap();
        let run = sample_run(&dir);

        let keys: Vec<Vec<u8>> = RunIter::new(Arc::clone(&run), b"", None)
            .unwrap()
            .map(|r| r.unwrap().key().to_vec())
            .collect();
        assert_eq!(
            keys,
            vec![
                b"apple".to_vec(),
                b"banana".to_vec(),
                b"cherry".to_vec(),
                b"date".to_vec()
            ]
        );
    }

    #[test]
    fn test_scan_bounds() {
        let dir = TempDir::new().unwrap();
        let run = sample_run(&dir);

        // from lands between keys, to is exclusive
        let keys: Vec<Vec<u8>> = RunIter::new(Arc::clone(&run), b"b", Some(b"date"))
            .unwrap()
            .map(|r| r.unwrap().key().to_vec())
            .collect();
        assert_eq!(keys, vec![b"banana".to_vec(), b"cherry".to_vec()]);

        // from == to yields nothing
        let empty: Vec<_> = RunIter::new(Arc::clone(&run), b"banana", Some(b"banana"))
            .unwrap()
            .collect();
        assert!(empty.is_empty());

        // from past the last key yields nothing
        let empty: Vec<_> = RunIter::new(run, b"zebra", None).unwrap().collect();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_empty_run() {
        let dir = TempDir::new().unwrap();
        let run = write_run(&dir, "empty.data", vec![]);
        assert!(run.is_empty());
        assert_eq!(run.get(b"anything").unwrap(), None);
        assert_eq!(RunIter::new(run, b"", None).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_value_roundtrip() {
        let dir = TempDir::new().unwrap();
        let run = write_run(&dir, "empty_value.data", vec![entry(b"k", b"")]);
        assert_eq!(run.get(b"k").unwrap(), Some(entry(b"k", b"")));
    }

    #[test]
    fn test_failed_write_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed.data");

        let entries = vec![
            Ok(entry(b"a", b"1")),
            Err(Error::InvalidData("stream broke".to_string())),
        ];
        assert!(RunWriter::write(&path, entries.into_iter()).is_err());

        assert!(!path.exists());
        assert!(!path.with_extension(TMP_EXTENSION).exists());
    }

    #[test]
    fn test_truncated_file_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("truncated.data");
        RunWriter::write(&path, vec![Ok(entry(b"key", b"value"))].into_iter()).unwrap();

        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();

        assert!(matches!(
            Run::open(&path, 0),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_concurrent_reads() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<Entry> = (0..500)
            .map(|i| entry(format!("key_{i:04}").as_bytes(), format!("value_{i:04}").as_bytes()))
            .collect();
        let run = write_run(&dir, "concurrent.data", entries);

        let mut handles = Vec::new();
        for t in 0..8 {
            let run = Arc::clone(&run);
            handles.push(std::thread::spawn(move || {
                for i in (t..500).step_by(8) {
                    let key = format!("key_{i:04}").into_bytes();
                    let expected = format!("value_{i:04}").into_bytes();
                    let got = run.get(&key).unwrap().unwrap();
                    assert_eq!(got.value(), Some(expected.as_slice()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
