//! Binary format for a single log entry.
//!
//! `crc(4) | timestamp(8) | key_size(4) | value_size(4) | key | value`, all
//! multi-byte integers little-endian. The CRC is an IEEE-802.3 checksum
//! (`crc32fast`) over everything in the record except the CRC field itself.
//! A tombstone is a record with `value_size == 0` and an empty value.

use crate::error::{Error, Result};

/// Size of the fixed-width record header, in bytes.
pub const HEADER_SIZE: usize = 20;

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// True if this record is a tombstone (a deletion marker).
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

/// Encodes a key/value pair (or a tombstone, if `value` is empty) with the
/// given timestamp into its on-disk representation.
pub fn encode(key: &[u8], value: &[u8], timestamp: i64) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + key.len() + value.len()];
    buf[4..12].copy_from_slice(&timestamp.to_le_bytes());
    buf[12..16].copy_from_slice(&(key.len() as u32).to_le_bytes());
    buf[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
    buf[20..20 + key.len()].copy_from_slice(key);
    buf[20 + key.len()..].copy_from_slice(value);

    let crc = crc32fast::hash(&buf[4..]);
    buf[0..4].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decodes a full record (header, key, and value) from `buf`, verifying its
/// checksum. Returns [`Error::InvalidChecksum`] on a mismatch.
pub fn decode(buf: &[u8]) -> Result<Record> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "record shorter than header",
        )));
    }
    let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let computed = crc32fast::hash(&buf[4..]);
    if crc != computed {
        return Err(Error::InvalidChecksum);
    }

    let timestamp = i64::from_le_bytes(buf[4..12].try_into().unwrap());
    let key_size = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
    let value_size = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;

    if buf.len() != HEADER_SIZE + key_size + value_size {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "record length does not match header",
        )));
    }

    let key = buf[HEADER_SIZE..HEADER_SIZE + key_size].to_vec();
    let value = buf[HEADER_SIZE + key_size..].to_vec();
    Ok(Record { timestamp, key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn round_trip() {
        let buf = encode(b"hello", b"world", 1_700_000_000);
        let record = decode(&buf).expect("decode");
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.key, b"hello");
        assert_eq!(record.value, b"world");
        assert!(!record.is_tombstone());
    }

    #[test_case(b"hello", b"world", 42 ; "ascii key and value")]
    #[test_case(b"\x00\x01", b"\xff\xfe\xfd", -1 ; "binary key and value")]
    #[test_case(b"k", b"", 0 ; "tombstone")]
    #[test_case(b"", b"", 0 ; "empty key and value")]
    fn round_trips_for(key: &[u8], value: &[u8], timestamp: i64) {
        let buf = encode(key, value, timestamp);
        let record = decode(&buf).expect("decode");
        assert_eq!(record.key, key);
        assert_eq!(record.value, value);
        assert_eq!(record.timestamp, timestamp);
    }

    #[test]
    fn header_layout_is_stable() {
        // crc(4) | timestamp(8) | key_size(4) | value_size(4), little-endian.
        let buf = encode(b"k", b"v", 1);
        assert_eq!(hex::encode(&buf[4..12]), "0100000000000000");
        assert_eq!(hex::encode(&buf[12..16]), "01000000");
        assert_eq!(hex::encode(&buf[16..20]), "01000000");
    }

    #[test]
    fn tombstone_round_trip() {
        let buf = encode(b"hello", b"", 42);
        let record = decode(&buf).expect("decode");
        assert!(record.is_tombstone());
    }

    #[test]
    fn empty_key_and_value() {
        let buf = encode(b"", b"", 0);
        assert_eq!(buf.len(), HEADER_SIZE);
        let record = decode(&buf).expect("decode");
        assert!(record.key.is_empty());
        assert!(record.is_tombstone());
    }

    #[test]
    fn bit_flip_is_detected() {
        let mut buf = encode(b"hello", b"world", 1);
        // Flip a bit well inside the payload.
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(matches!(decode(&buf), Err(Error::InvalidChecksum)));
    }

    #[test]
    fn truncated_buffer_errors() {
        let buf = encode(b"hello", b"world", 1);
        assert!(decode(&buf[..buf.len() - 1]).is_err());
    }
}
