use std::io;
use thiserror::Error;

/// Errors that can occur when working with a ZbMap
#[derive(Error, Debug)]
pub enum ZbMapError {
    /// IO errors when reading/writing snapshots or allocating buffers
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Encoding errors when converting data to bytes
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Decoding errors when converting bytes back to data
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// A derived byte length no longer fits the 32-bit-safe buffer budget
    #[error("unable to allocate map data buffer: {0}")]
    CapacityOverflow(String),

    /// The hash table would have to grow past its maximum size
    #[error("map is full: hash table size would exceed {max_table_size}")]
    MapFull { max_table_size: usize },

    #[error("key can't exceed the max key length of {max}, got {len}")]
    KeyTooLarge { len: usize, max: usize },

    #[error("value can't exceed the max value length of {max}, got {len}")]
    ValueTooLarge { len: usize, max: usize },

    #[error("index {index} is out of bounds for size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("invalid bucket address {0:#018x}")]
    InvalidAddress(u64),

    /// The stream ended before the expected number of bytes arrived
    #[error("expected {expected}, got {actual} bytes")]
    ShortRead { expected: u64, actual: u64 },

    #[error("write failure after {written} bytes: {source}")]
    WriteFailed {
        written: u64,
        #[source]
        source: io::Error,
    },

    #[error("unsupported snapshot format version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Snapshot bytes that do not describe a consistent map
    #[error("corrupted map data: {0}")]
    Corrupted(String),

    /// The map was mutated after the iterator was reset
    #[error("map was modified while iterating")]
    ConcurrentModification,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, ZbMapError>;

impl From<Box<dyn std::error::Error + Send + Sync>> for ZbMapError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            ZbMapError::Io(io::Error::new(io_err.kind(), err.to_string()))
        } else {
            ZbMapError::Encoding(err.to_string())
        }
    }
}
