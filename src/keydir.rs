//! In-memory index from key to the location of its most recent value.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::RwLock;

/// Where the current value for a key lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub file_id: u64,
    pub value_position: u64,
    pub value_size: u32,
    pub timestamp: i64,
}

/// Name of the hint file at the store root.
pub const HINT_FILE: &str = "index";
/// Name of the temporary file `save` writes before renaming it into place.
pub const HINT_TEMP_FILE: &str = "index-temp";

/// Concurrent map from key to [`Entry`], with its own readers-writer lock
/// independent of the engine's segment-handle lock.
pub struct Keydir {
    map: RwLock<HashMap<Vec<u8>, Entry>>,
}

impl Keydir {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    pub fn add(&self, key: Vec<u8>, entry: Entry) {
        self.map.write().unwrap().insert(key, entry);
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.map.read().unwrap().get(key).copied()
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.map.read().unwrap().contains_key(key)
    }

    pub fn delete(&self, key: &[u8]) -> Option<Entry> {
        self.map.write().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys currently indexed, as a point-in-time copy.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.map.read().unwrap().keys().cloned().collect()
    }

    /// A point-in-time copy of the whole map, used by the compactor and by
    /// `fold`.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Entry)> {
        self.map.read().unwrap().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Replaces `key`'s entry with `new` only if it still equals `expected`.
    /// Used by the compactor when installing merged entries, so a write
    /// that raced the merge is never clobbered by stale merged data.
    pub fn replace_if_unchanged(&self, key: &[u8], expected: Entry, new: Entry) -> bool {
        let mut map = self.map.write().unwrap();
        match map.get(key) {
            Some(current) if *current == expected => {
                map.insert(key.to_vec(), new);
                true
            }
            _ => false,
        }
    }

    /// Self-delimiting binary encoding of the map: a sequence of
    /// `(key_len: u32, key, file_id: u64, value_size: u32, value_position:
    /// u64, timestamp: i64)` records. Implementation detail, not a format
    /// other readers need to match (spec's open question leaves the exact
    /// scheme to the implementer).
    pub fn encode(&self) -> Vec<u8> {
        let map = self.map.read().unwrap();
        let mut buf = Vec::new();
        for (key, entry) in map.iter() {
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&entry.file_id.to_le_bytes());
            buf.extend_from_slice(&entry.value_size.to_le_bytes());
            buf.extend_from_slice(&entry.value_position.to_le_bytes());
            buf.extend_from_slice(&entry.timestamp.to_le_bytes());
        }
        buf
    }

    /// Replaces the map with the contents decoded from `reader`. On a
    /// decode error the map is left empty, so callers fall back to a full
    /// segment scan.
    pub fn load(&self, mut reader: impl Read) -> io::Result<()> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        let mut decoded = HashMap::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            if pos + 4 > buf.len() {
                return Err(invalid("truncated key length"));
            }
            let key_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + key_len + 8 + 4 + 8 + 8 > buf.len() {
                return Err(invalid("truncated entry"));
            }
            let key = buf[pos..pos + key_len].to_vec();
            pos += key_len;
            let file_id = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let value_size = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let value_position = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let timestamp = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            decoded.insert(key, Entry { file_id, value_position, value_size, timestamp });
        }
        *self.map.write().unwrap() = decoded;
        Ok(())
    }

    /// Writes the encoded map to `<dir>/index-temp`, flushes it, then
    /// renames it over `<dir>/index`. The rename is atomic with respect to
    /// any reader that opens `<dir>/index` concurrently.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let tmp_path = dir.join(HINT_TEMP_FILE);
        let mut f = File::create(&tmp_path)?;
        f.write_all(&self.encode())?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp_path, dir.join(HINT_FILE))?;
        Ok(())
    }
}

impl Default for Keydir {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
