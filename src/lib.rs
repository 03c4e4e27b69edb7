//! # shmtree
//!
//! A hierarchical name index shared between processes through named
//! shared-memory regions.
//!
//! Cooperating processes attach to the same region name and see one
//! mutable tree of named nodes - directories and files - each carrying a
//! small caller-defined payload. When the tree outgrows its region, the
//! mutating handle migrates it into a successor region at double the size
//! and every other attached handle follows lazily.
//!
//! ## Design
//!
//! - Everything inside a region is addressed by offsets from the mapped
//!   base, never raw pointers, so processes mapping the region at
//!   different addresses share one consistent graph.
//! - Nodes are reference counted inside the region; `parent` and self
//!   back-references are non-owning so cycles cannot leak.
//! - Child maps are ordered and ASCII-case-insensitive; lookups accept
//!   `/` and `\` as separators interchangeably.
//! - Glob patterns support `*`, `?` and the `*/` one-directory-level
//!   wildcard, and may span directory boundaries.
//! - Attach/detach is reference counted in the region itself; the last
//!   handle off a region destroys it and removes the OS-level name.
//!
//! ## Concurrency
//!
//! One concurrent writer across all attached processes (enforced by the
//! caller), any number of readers concurrent with it. Reference counting
//! and migration are internally synchronized.

mod alloc;
mod error;
pub mod glob;
mod map;
mod node;
mod ordering;
pub mod path;
mod payload;
mod ptr;
mod segment;
mod shmstr;
mod shmvec;
mod tracing_helpers;
mod tree;

pub use alloc::AllocError;
pub use error::{Error, Result};
pub use node::{Children, NodeHandle, FLAG_DIRECTORY, FLAG_DUMMY, FLAG_FIRST_USER};
pub use payload::Payload;
pub use ptr::RelPtr;
pub use segment::Segment;
pub use shmstr::ShmString;
pub use tree::{SharedTree, DEFAULT_SEGMENT_SIZE};
