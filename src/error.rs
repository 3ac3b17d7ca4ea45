//! Crate-wide error type.

use std::io;

use thiserror::Error;

/// Errors produced by the ext4 core.
#[derive(Debug, Error)]
pub enum Ext4Error {
    /// A positioned read or write transferred fewer bytes than requested, or
    /// the underlying OS call failed.
    #[error("disk I/O error: {0}")]
    Io(#[from] io::Error),

    /// The allocator scanned every block group without finding a free block.
    #[error("no space left on device")]
    NoSpace,

    /// An on-disk structure violates an invariant the core relies on.
    #[error("filesystem corruption: {0}")]
    Corruption(String),

    /// A free request targeted a group whose block bitmap is still
    /// uninitialized. Freeing into a group nothing was ever allocated from
    /// is always a caller bug.
    #[error("attempted to free blocks into an uninitialized group {group}")]
    FreeIntoUninitGroup {
        /// The block group index.
        group: u32,
    },

    /// A precondition the caller was responsible for upholding did not hold.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Ext4Error>;
