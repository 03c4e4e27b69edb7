//! Filepath: src/error.rs
//!
//! Crate-level error taxonomy.
//!
//! Allocation failure inside a segment ([`AllocError`]) is deliberately a
//! separate, smaller type: the tree container catches it and converts it
//! into a grow-and-retry, so it only surfaces to callers when even the
//! initial attachment cannot be satisfied.

use std::fmt;

use thiserror::Error;

use crate::alloc::AllocError;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by tree and segment operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A lookup demanded a node that does not exist.
    ///
    /// Only raised by the `_or_err` lookup variants; plain lookups return
    /// `Option`.
    #[error("node missing: {0:?}")]
    NodeMissing(String),

    /// Allocation inside the current segment failed and could not be
    /// recovered by growing.
    #[error("shared segment allocation failed")]
    SegmentAlloc(#[from] AllocError),

    /// A named region could not be created or opened.
    #[error("cannot open or create shared region {name:?}: {reason}")]
    SegmentOpen { name: String, reason: String },

    /// A segment name without a `_<digits>` suffix cannot derive a
    /// successor name.
    #[error("shared region name {0:?} has no `_<digits>` suffix")]
    InvalidName(String),

    /// Writing the debug dump failed.
    #[error("dump failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn open(name: &str, reason: impl fmt::Display) -> Self {
        Self::SegmentOpen {
            name: name.to_owned(),
            reason: reason.to_string(),
        }
    }
}
