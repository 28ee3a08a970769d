//! Error types for BrambleDB.

use thiserror::Error;

use crate::page::PageId;

/// Result type alias using BrambleError.
pub type Result<T> = std::result::Result<T, BrambleError>;

/// Errors that can occur in BrambleDB operations.
#[derive(Debug, Error)]
pub enum BrambleError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Page manager errors
    #[error("page {page_id} out of bounds (file has {page_count} pages)")]
    PageOutOfBounds { page_id: PageId, page_count: u32 },

    #[error("page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("page {page_id} corrupted: {reason}")]
    PageCorrupted { page_id: PageId, reason: String },

    // B+ tree errors
    #[error("entry too large: {size} bytes (max {max})")]
    EntryTooLarge { size: usize, max: usize },
}
