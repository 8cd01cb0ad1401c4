use std::fmt::{self, Display};

/// A bitcask error.
#[derive(Debug)]
pub enum Error {
    /// The requested key does not exist, or was deleted.
    KeyNotFound,
    /// `put` was called with an empty key.
    EmptyKey,
    /// A key exceeded `Config::max_key_size`.
    KeyTooLarge,
    /// A value exceeded `Config::max_value_size`.
    ValueTooLarge,
    /// A record's CRC did not match its contents.
    InvalidChecksum,
    /// A write was attempted against a sealed segment.
    ReadOnlyFile,
    /// A compaction was requested while one was already running.
    MergeInProgress,
    /// The configuration failed validation.
    InvalidConfig(String),
    /// An underlying I/O failure.
    Io(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::EmptyKey => write!(f, "key must not be empty"),
            Error::KeyTooLarge => write!(f, "key exceeds configured maximum size"),
            Error::ValueTooLarge => write!(f, "value exceeds configured maximum size"),
            Error::InvalidChecksum => write!(f, "invalid checksum"),
            Error::ReadOnlyFile => write!(f, "segment is sealed and cannot be written to"),
            Error::MergeInProgress => write!(f, "a merge is already in progress"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
