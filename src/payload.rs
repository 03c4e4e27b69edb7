//! Filepath: src/payload.rs
//!
//! The caller-defined value attached to every tree node.
//!
//! Payloads live inside the segment, so they may only contain plain data
//! and segment offsets, never process-local pointers. Construction happens
//! against a concrete segment (and is re-run against the successor when an
//! operation retries after a grow), and the migration deep copy clones
//! payloads across segments.

use crate::alloc::AllocError;
use crate::segment::Segment;
use crate::shmstr::ShmString;

/// A value type storable inside a segment.
///
/// # Safety
///
/// Implementors guarantee that the value:
///
/// - has a stable layout across every process attaching to the region
///   (`#[repr(C)]` or primitive),
/// - stores no process-local addresses, only plain data and segment
///   offsets,
/// - releases, in [`Payload::destroy`], every heap block it owns in the
///   segment it was built in.
///
/// The `Send + Sync` bounds reflect that payload values are plain data
/// readable from any thread holding a node handle.
pub unsafe trait Payload: Sized + Send + Sync + 'static {
    /// The process-local source a payload is constructed from.
    type Source: ?Sized;

    /// Build a payload inside `seg` from a local source value.
    fn create_in(seg: &Segment, source: &Self::Source) -> Result<Self, AllocError>;

    /// Build the payload used for auto-created intermediate directories.
    fn create_empty(seg: &Segment) -> Result<Self, AllocError>;

    /// Copy this payload into another segment (the migration deep copy).
    ///
    /// # Safety
    ///
    /// `self` must be live within `src`; the result belongs to `dst`.
    unsafe fn clone_into(&self, src: &Segment, dst: &Segment) -> Result<Self, AllocError>;

    /// Release any segment storage the payload owns.
    ///
    /// # Safety
    ///
    /// Must be called at most once, against the segment the payload was
    /// built in.
    unsafe fn destroy(&mut self, seg: &Segment) {
        let _ = seg;
    }
}

macro_rules! pod_payload {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: primitives are plain data with a fixed layout and
            // own no segment storage.
            unsafe impl Payload for $t {
                type Source = $t;

                fn create_in(_seg: &Segment, source: &$t) -> Result<Self, AllocError> {
                    Ok(*source)
                }

                fn create_empty(_seg: &Segment) -> Result<Self, AllocError> {
                    Ok(<$t>::default())
                }

                unsafe fn clone_into(
                    &self,
                    _src: &Segment,
                    _dst: &Segment,
                ) -> Result<Self, AllocError> {
                    Ok(*self)
                }
            }
        )*
    };
}

pod_payload!((), bool, u8, u16, u32, u64, i8, i16, i32, i64, usize, isize);

// SAFETY: offset + length pair; `destroy` frees the buffer.
unsafe impl Payload for ShmString {
    type Source = [u8];

    fn create_in(seg: &Segment, source: &[u8]) -> Result<Self, AllocError> {
        ShmString::new_in(seg, source)
    }

    fn create_empty(_seg: &Segment) -> Result<Self, AllocError> {
        Ok(ShmString::empty())
    }

    unsafe fn clone_into(&self, src: &Segment, dst: &Segment) -> Result<Self, AllocError> {
        self.clone_into_segment(src, dst)
    }

    unsafe fn destroy(&mut self, seg: &Segment) {
        ShmString::destroy(self, seg);
    }
}
