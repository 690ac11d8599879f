//! Error taxonomy shared across the crate.
//!
//! Structural filesystem errors propagate unchanged to callers; indexing is a
//! side effect and is never allowed to mask the primary operation's outcome.

use thiserror::Error;

/// Errors produced by the file API, the sidecar layer, and the index engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The path does not exist in the store.
    #[error("no such path: {0}")]
    NotFound(String),

    /// The path already exists and the operation does not overwrite.
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// Delete was attempted on a directory that still has children.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// The operation or attribute is recognized but not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A malformed argument (empty path, unknown view tag, bad property name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O failure from the backing store.
    #[error("backend failure: {0}")]
    Backend(#[from] std::io::Error),

    /// Failure from the index backend.
    #[error("index failure: {0}")]
    Index(#[from] tantivy::TantivyError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a raw I/O error for `path` into the taxonomy, so callers see
    /// `NotFound`/`AlreadyExists` instead of an opaque backend failure.
    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.to_string()),
            _ => Error::Backend(err),
        }
    }
}
