//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is full: all frames are pinned")]
    BufferPoolFull,

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Unexpected page type: expected {expected}, found tag {found}")]
    InvalidPageType { expected: &'static str, found: u32 },

    #[error("Page is full: requires {required} bytes but only {available} available")]
    PageFull { required: usize, available: usize },

    #[error("Directory page is full")]
    DirectoryFull,

    #[error("Directory record already exists: {0}")]
    RecordExists(String),

    #[error("Directory record not found: {0}")]
    RecordNotFound(String),

    #[error("Index name too long: {0} (max 32 bytes)")]
    NameTooLong(String),

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Log flush still pending after bounded wait")]
    LogFlushPending,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
