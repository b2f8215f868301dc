//! Error types returned by this crate's public and crate-internal APIs.
//!
//! Mirrors the reference engine's hand-rolled error idiom: one enum per
//! concern, explicit `Display`/`std::error::Error` impls, `From` conversions
//! at the I/O boundary, no `thiserror`/`anyhow`.

use std::fmt;

/// Convenience alias used pervasively throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The generic, catch-all error type returned by most of this crate's
/// fallible operations.
#[derive(Debug)]
pub enum Error {
    /// A chunk index was used that is out of bounds for the torrent.
    InvalidChunkIndex,
    /// A block's (offset, length) doesn't line up with the chunk's expected
    /// block layout.
    InvalidBlockInfo,
    /// Bencoded metainfo failed to parse.
    Metainfo(serde_bencode::Error),
    /// An I/O error bubbled up from the chunk store.
    Io(std::io::Error),
    /// An I/O error bubbled up from a bulk-range (HTTP) source.
    Http(String),
    /// The persistence file's header didn't match the expected magic or
    /// was otherwise malformed; the load is aborted and treated as if no
    /// partial state existed.
    CorruptPersistence(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChunkIndex => write!(f, "invalid chunk index"),
            Self::InvalidBlockInfo => write!(f, "invalid block info"),
            Self::Metainfo(e) => write!(f, "metainfo error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Http(msg) => write!(f, "HTTP error: {}", msg),
            Self::CorruptPersistence(msg) => {
                write!(f, "corrupt persistence file: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Metainfo(e)
    }
}

/// Returned when creating a new torrent's on-disk storage fails.
#[derive(Debug)]
pub enum NewTorrentError {
    /// A torrent with this ID already exists.
    AlreadyExists,
    /// Failed to set up the torrent's files or directories.
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already exists"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Returned when writing a block to the chunk store fails.
#[derive(Debug)]
pub enum WriteError {
    /// The chunk index doesn't exist in this torrent.
    InvalidChunkIndex,
    /// Underlying I/O failure while writing to disk.
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChunkIndex => write!(f, "invalid chunk index"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
