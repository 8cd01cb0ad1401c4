use crate::codec::HEADER_SIZE;
use crate::error::{Error, Result};

/// Store configuration. Immutable once a [`crate::BitCask`] has been opened
/// with it.
///
/// Defaults mirror `original_source/config.go`'s `DefaultConfig`, scaled up
/// from that file's test-fixture-sized limits to values usable in practice.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Segment size ceiling triggering rotation to a new active segment.
    pub max_file_size: u64,
    /// Upper bound on key length, in bytes. 0 means unlimited.
    pub max_key_size: u32,
    /// Upper bound on value length, in bytes. 0 means unlimited.
    pub max_value_size: u32,
    /// If true, fsync the active segment after every write.
    pub sync_on_write: bool,
    /// Reclaimable-byte threshold that triggers a background compaction.
    pub max_reclaim_space: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: 64 << 20, // 64 MiB
            max_key_size: 0,
            max_value_size: 0,
            sync_on_write: false,
            max_reclaim_space: 16 << 20, // 16 MiB
        }
    }
}

impl Config {
    /// Checks that the configuration is internally consistent. Called by
    /// `BitCask::open`, not by callers directly.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_file_size < HEADER_SIZE as u64 {
            return Err(Error::InvalidConfig(format!(
                "max_file_size must be at least {HEADER_SIZE} bytes (the record header size)"
            )));
        }
        if self.max_key_size != 0 {
            let smallest_record = HEADER_SIZE as u64 + self.max_key_size as u64;
            if smallest_record > self.max_file_size {
                return Err(Error::InvalidConfig(
                    "max_key_size leaves no room for a value within max_file_size".to_string(),
                ));
            }
        }
        Ok(())
    }
}
