use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store file couldn't be opened or created
    #[error("Can't open the store file")]
    Open(#[source] std::io::Error),
    /// Another process already holds the store file
    #[error("The store file is held by another process")]
    Lock(#[source] std::io::Error),
    /// A flush of the mapping didn't reach stable storage
    #[error("Flushing the store to stable storage failed")]
    Sync(#[source] std::io::Error),
    /// Growing the store file failed, usually ENOSPC
    #[error("Growing the store file from 0x{size:x} to 0x{requested:x} bytes failed")]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// Mapping the store file into memory failed
    #[error("Mapping 0x{requested:x} bytes of the store into memory failed")]
    MapFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// A reference resolved outside the mapping or onto no allocated object
    #[error("Reference does not resolve to an object: offset 0x{offset:x}, length 0x{len:x}")]
    InvalidAccess { offset: u64, len: usize },
    /// The file contents don't look like a store of ours
    #[error("Store data format error: {0}")]
    Corrupt(&'static str),
    /// The target is persisted and can no longer be mutated
    #[error("Already bound to persistent storage")]
    Busy,
    /// Schema or attribute name collision
    #[error("Name already in use: {0}")]
    Exists(String),
    /// Schema or attribute lookup failure
    #[error("Not found: {0}")]
    NotFound(String),
    /// Bad type tag, null where disallowed, or a mismatched attribute kind
    #[error("Invalid argument: {0}")]
    Invalid(&'static str),
    /// The heap is exhausted even after one grow retry
    #[error("No space left in the store for 0x{requested:x} bytes")]
    NoMem { requested: usize },
    /// Operation not implemented
    #[error("Operation is not supported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;
