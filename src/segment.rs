//! Append-only writer and random-access reader over a single numbered
//! segment file (`<id>.data`).

use crate::codec::{self, Record, HEADER_SIZE};
use crate::engine::segment_path;
use crate::error::{Error, Result};

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

/// The write-half of an active segment: a writable file handle plus the
/// current append offset, which doubles as the lock serializing writers.
struct WriteHalf {
    file: File,
    offset: Mutex<u64>,
}

/// One segment file. Exactly one segment in a store is active (writable);
/// the rest are sealed (read-only). The distinction is an `Option` on the
/// write half rather than a trait object, per the design notes.
pub struct Segment {
    id: u64,
    read: File,
    write: Option<WriteHalf>,
}

impl Segment {
    /// Opens (or creates, if active) the segment with the given id.
    pub fn open(dir: &Path, id: u64, active: bool) -> Result<Self> {
        let path = segment_path(dir, id);
        let write = if active {
            let file = OpenOptions::new().create(true).write(true).read(false).open(&path)?;
            let offset = file.metadata()?.len();
            Some(WriteHalf { file, offset: Mutex::new(offset) })
        } else {
            None
        };
        let read = OpenOptions::new().read(true).open(&path)?;
        Ok(Self { id, read, write })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.write.is_some()
    }

    /// Current append offset (== on-disk size for an active segment).
    pub fn size(&self) -> Result<u64> {
        match &self.write {
            Some(w) => Ok(*w.offset.lock().unwrap()),
            None => Ok(self.read.metadata()?.len()),
        }
    }

    /// Appends an already-encoded record and returns its `(offset, size)`.
    pub fn write(&self, encoded: &[u8]) -> Result<(u64, u32)> {
        let w = self.write.as_ref().ok_or(Error::ReadOnlyFile)?;
        let mut offset = w.offset.lock().unwrap();
        w.file.write_at(encoded, *offset)?;
        let pos = *offset;
        *offset += encoded.len() as u64;
        Ok((pos, encoded.len() as u32))
    }

    /// Reads and CRC-validates the full record for `key` given the keydir's
    /// `value_position`/`value_size`, using exactly one positional read: the
    /// record's start can be computed from `value_position` and `key.len()`
    /// without consulting the file again.
    pub fn read_record(&self, key: &[u8], value_position: u64, value_size: u32) -> Result<Record> {
        let header_and_key = HEADER_SIZE as u64 + key.len() as u64;
        let record_start = value_position.checked_sub(header_and_key).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "value position precedes its own record header",
            ))
        })?;
        let total_len = header_and_key as usize + value_size as usize;
        let mut buf = vec![0u8; total_len];
        self.read.read_exact_at(&mut buf, record_start)?;
        let record = codec::decode(&buf)?;
        if record.key != key {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "keydir entry points at a record for a different key",
            )));
        }
        Ok(record)
    }

    pub fn sync(&self) -> Result<()> {
        if let Some(w) = &self.write {
            w.file.sync_all()?;
        }
        Ok(())
    }
}
