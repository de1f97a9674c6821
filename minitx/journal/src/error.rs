use std::path::PathBuf;

use thiserror::Error;

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("record at offset {offset} of {path:?} cannot be decoded: {reason}")]
    DeserializationFailed {
        path: PathBuf,
        offset: u64,
        reason: String,
    },
    #[error("journal corrupted: checksum mismatch at offset {offset} of {path:?}")]
    Corrupted { path: PathBuf, offset: u64 },
    #[error("invalid journal header in {path:?}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },
    #[error("journal is closed")]
    Closed,
}
