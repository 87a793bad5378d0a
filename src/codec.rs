//! Binary encoding of entry records.
//!
//! All integers are little-endian. A record is:
//!
//! ```text
//! u32 key_len | key_bytes | u8 tag | (u32 val_len | val_bytes)?
//! ```
//!
//! `tag = 0` encodes a tombstone and omits the value fields entirely.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::entry::Entry;
use crate::errdata;
use crate::error::Result;

pub const TAG_TOMBSTONE: u8 = 0;
pub const TAG_PRESENT: u8 = 1;

/// Maximum key size accepted during reads (64 KiB). Prevents huge
/// allocations on corrupt files.
const MAX_KEY_BYTES: usize = 64 * 1024;
/// Maximum value size accepted during reads (256 MiB).
const MAX_VALUE_BYTES: usize = 256 * 1024 * 1024;

/// The on-disk serialized size of an entry. This is also the unit of
/// memtable size accounting.
pub fn entry_size(entry: &Entry) -> u64 {
    record_size(entry.key(), entry.value())
}

/// [`entry_size`] over borrowed parts.
pub fn record_size(key: &[u8], value: Option<&[u8]>) -> u64 {
    let value_len = match value {
        Some(value) => 4 + value.len() as u64,
        None => 0,
    };
    4 + key.len() as u64 + 1 + value_len
}

/// Writes a single record.
pub fn write_entry<W: Write>(writer: &mut W, entry: &Entry) -> Result<()> {
    writer.write_u32::<LittleEndian>(entry.key().len() as u32)?;
    writer.write_all(entry.key())?;
    match entry.value() {
        Some(value) => {
            writer.write_u8(TAG_PRESENT)?;
            writer.write_u32::<LittleEndian>(value.len() as u32)?;
            writer.write_all(value)?;
        }
        None => writer.write_u8(TAG_TOMBSTONE)?,
    }
    Ok(())
}

/// Reads a single record. Short reads and unknown tags are corruption.
pub fn read_entry<R: Read>(reader: &mut R) -> Result<Entry> {
    let key = read_bytes(reader, MAX_KEY_BYTES, "key")?;
    let value = match reader.read_u8().map_err(|e| short_read("value tag", e))? {
        TAG_TOMBSTONE => None,
        TAG_PRESENT => Some(read_bytes(reader, MAX_VALUE_BYTES, "value")?),
        tag => return errdata!("unknown value tag {tag}"),
    };
    Ok(Entry::from_parts(key, value))
}

/// Reads only the length-prefixed key at the current position, leaving the
/// reader before the value tag. Used by binary searches that do not need
/// the value.
pub fn read_key<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    read_bytes(reader, MAX_KEY_BYTES, "key")
}

fn read_bytes<R: Read>(reader: &mut R, max: usize, what: &str) -> Result<Vec<u8>> {
    let len = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| short_read(what, e))? as usize;
    if len > max {
        return errdata!("{what} length {len} exceeds maximum {max}");
    }
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| short_read(what, e))?;
    Ok(bytes)
}

fn short_read(what: &str, err: std::io::Error) -> crate::error::Error {
    crate::error::Error::InvalidData(format!("truncated {what}: {err}"))
}
