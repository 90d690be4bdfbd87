//! Storage error types.

use std::fmt;

use crate::message::CodecError;

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    /// Engine failure
    Engine(String),
    /// A stored record could not be decoded
    Corruption(CodecError),
    /// The storage was closed
    Closed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Engine(e) => write!(f, "storage error: {}", e),
            Self::Corruption(e) => write!(f, "data corruption: {}", e),
            Self::Closed => write!(f, "storage is closed"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Corruption(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for StorageError {
    fn from(err: fjall::Error) -> Self {
        Self::Engine(err.to_string())
    }
}

impl From<CodecError> for StorageError {
    fn from(err: CodecError) -> Self {
        Self::Corruption(err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
