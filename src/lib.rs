#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! An embedded, persistent key/value store built on a log-structured
//! on-disk format with an in-memory hash index ("keydir"): every write
//! appends an encoded record to an active log segment, and the keydir maps
//! each key directly to the byte range holding its latest value, so a
//! lookup costs one hashmap probe plus one positional read.
//!
//! ```no_run
//! use bitcask::{BitCask, Config};
//!
//! # fn main() -> bitcask::Result<()> {
//! let db = BitCask::open("/tmp/example-db", Config::default())?;
//! db.put(b"key", b"value")?;
//! assert_eq!(db.get(b"key")?, b"value");
//! db.close()?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod compactor;
mod config;
mod engine;
mod error;
mod keydir;
mod segment;

pub use config::Config;
pub use engine::BitCask;
pub use error::{Error, Result};
