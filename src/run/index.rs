//! The dense offset index at the tail of a run file.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::errdata;
use crate::error::Result;

/// One file offset per record, loaded fully into memory at open so record
/// access is a single seek. Offsets are validated once here; readers may
/// trust them afterwards.
#[derive(Debug)]
pub struct OffsetIndex {
    offsets: Vec<u64>,
    /// End of the entries section, i.e. where the index section begins.
    entries_end: u64,
}

impl OffsetIndex {
    /// Reads and validates the index of an open run file. Any structural
    /// inconsistency (truncated trailer, count out of bounds, offsets not
    /// strictly ascending or out of range) fails the open.
    pub fn load(file: &mut File, file_len: u64) -> Result<Self> {
        if file_len < 8 {
            return errdata!("run file too small for trailer ({file_len} bytes)");
        }

        file.seek(SeekFrom::End(-8))?;
        let count = file.read_u64::<LittleEndian>()?;

        let index_size = count
            .checked_mul(8)
            .and_then(|n| n.checked_add(8))
            .filter(|n| *n <= file_len)
            .ok_or_else(|| {
                crate::error::Error::InvalidData(format!(
                    "trailer count {count} exceeds file size {file_len}"
                ))
            })?;
        let entries_end = file_len - index_size;

        file.seek(SeekFrom::Start(entries_end))?;
        let mut offsets = Vec::with_capacity(count as usize);
        for i in 0..count {
            let offset = file.read_u64::<LittleEndian>()?;
            if offset >= entries_end {
                return errdata!("offset {offset} of record {i} points past entries section");
            }
            if let Some(prev) = offsets.last() {
                if offset <= *prev {
                    return errdata!("offsets not strictly ascending at record {i}");
                }
            } else if offset != 0 {
                return errdata!("first record offset is {offset}, expected 0");
            }
            offsets.push(offset);
        }

        Ok(Self {
            offsets,
            entries_end,
        })
    }

    pub fn get(&self, i: usize) -> Option<u64> {
        self.offsets.get(i).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn entries_end(&self) -> u64 {
        self.entries_end
    }
}
