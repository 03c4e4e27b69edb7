//! Filepath: src/shmstr.rs
//!
//! Byte strings stored in a segment, plus the ASCII-case-insensitive
//! ordering the whole tree is keyed by.

use std::cmp::Ordering;

use crate::alloc::AllocError;
use crate::segment::Segment;

/// A byte string whose buffer lives in a segment heap.
///
/// The empty string allocates nothing. Like every in-segment type, the
/// lifecycle is explicit: [`ShmString::destroy`] releases the buffer.
#[repr(C)]
pub struct ShmString {
    buf: u64,
    len: u32,
    _pad: u32,
}

impl ShmString {
    /// The empty string; no allocation.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            buf: 0,
            len: 0,
            _pad: 0,
        }
    }

    /// Copy `bytes` into `seg`.
    pub fn new_in(seg: &Segment, bytes: &[u8]) -> Result<Self, AllocError> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        let buf = seg.alloc(bytes.len())?;
        // SAFETY: freshly allocated block of at least `bytes.len()` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), seg.resolve::<u8>(buf), bytes.len());
        }
        Ok(Self {
            buf,
            len: bytes.len() as u32,
            _pad: 0,
        })
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the bytes through a mapping.
    #[inline]
    #[must_use]
    pub fn as_bytes<'s>(&self, seg: &'s Segment) -> &'s [u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: buf/len were set from a successful allocation in `seg`.
        unsafe { std::slice::from_raw_parts(seg.resolve::<u8>(self.buf), self.len as usize) }
    }

    /// Copy out as an owned `String`, replacing invalid UTF-8.
    #[must_use]
    pub fn to_string_lossy(&self, seg: &Segment) -> String {
        String::from_utf8_lossy(self.as_bytes(seg)).into_owned()
    }

    /// Copy this string into another segment.
    pub fn clone_into_segment(&self, src: &Segment, dst: &Segment) -> Result<Self, AllocError> {
        Self::new_in(dst, self.as_bytes(src))
    }

    /// Release the buffer.
    ///
    /// # Safety
    ///
    /// Must be called at most once, against the segment the string was
    /// built in; the string must not be used afterwards.
    pub unsafe fn destroy(&mut self, seg: &Segment) {
        if self.buf != 0 {
            seg.dealloc(self.buf);
            self.buf = 0;
            self.len = 0;
        }
    }
}

/// ASCII-case-insensitive ordering on raw bytes.
///
/// This is the ordering of every children map in the tree; non-ASCII bytes
/// compare verbatim.
#[inline]
#[must_use]
pub fn ci_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let fold = |c: u8| c.to_ascii_lowercase();
    a.iter()
        .map(|&c| fold(c))
        .cmp(b.iter().map(|&c| fold(c)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn unique_name(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "shmtree_str_{}_{}_{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, AtomicOrdering::Relaxed)
        )
    }

    #[test]
    fn ci_cmp_folds_ascii_case() {
        assert_eq!(ci_cmp(b"Windows", b"windows"), Ordering::Equal);
        assert_eq!(ci_cmp(b"FOO.txt", b"foo.TXT"), Ordering::Equal);
        assert_eq!(ci_cmp(b"abc", b"ABD"), Ordering::Less);
        assert_eq!(ci_cmp(b"b", b"A"), Ordering::Greater);
        assert_eq!(ci_cmp(b"foo", b"foo2"), Ordering::Less);
    }

    #[test]
    fn ci_cmp_leaves_non_ascii_alone() {
        assert_ne!(ci_cmp("é".as_bytes(), "É".as_bytes()), Ordering::Equal);
    }

    #[test]
    fn round_trips_through_segment() {
        let seg = Segment::open_or_create(&unique_name("rt"), 16 * 1024).unwrap();
        let mut s = ShmString::new_in(&seg, b"hello.txt").unwrap();
        assert_eq!(s.as_bytes(&seg), b"hello.txt");
        assert_eq!(s.to_string_lossy(&seg), "hello.txt");
        assert_eq!(s.len(), 9);
        unsafe { s.destroy(&seg) };
        seg.request_unlink();
    }

    #[test]
    fn empty_string_never_allocates() {
        let seg = Segment::open_or_create(&unique_name("empty"), 16 * 1024).unwrap();
        let mut s = ShmString::new_in(&seg, b"").unwrap();
        assert!(s.is_empty());
        assert_eq!(s.as_bytes(&seg), b"");
        unsafe { s.destroy(&seg) };
        seg.request_unlink();
    }
}
