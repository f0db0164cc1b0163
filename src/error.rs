//! Typed errors returned by every engine operation.
//!
//! The bridge maps these onto POSIX errno values; the mapping is the
//! bridge's concern, not the engine's.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// Requested name or inode absent.
    #[error("not found")]
    NotFound,

    /// Name already in use where uniqueness was required.
    #[error("already exists")]
    Exists,

    /// The operation requires a directory.
    #[error("not a directory")]
    NotDir,

    /// The operation does not apply to directories.
    #[error("is a directory")]
    IsDir,

    /// rmdir on a non-empty directory, or rename over one.
    #[error("directory not empty")]
    NotEmpty,

    /// Name exceeds the configured maximum.
    #[error("name too long")]
    NameTooLong,

    /// Name is empty or contains '/' or NUL.
    #[error("invalid name")]
    InvalidName,

    /// Rename would make a directory its own descendant.
    #[error("rename would create a cycle")]
    Loop,

    /// An arena, the xattr budget, or the WAL is exhausted.
    #[error("out of capacity")]
    Capacity,

    /// On-disk format version is incompatible.
    #[error("incompatible on-disk version")]
    Version,

    /// An integrity check failed and is not recoverable.
    #[error("corrupt state")]
    Corrupt,

    /// Underlying storage failed during a WAL write or arena flush.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed argument.
    #[error("invalid argument")]
    Invalid,
}

pub type Result<T> = std::result::Result<T, FsError>;
