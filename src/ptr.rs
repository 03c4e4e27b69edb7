//! Filepath: src/ptr.rs
//!
//! Segment-relative pointers and shared ownership inside a segment.
//!
//! Nothing stored inside a segment may hold a process-local address:
//! two processes map the same region at different bases. [`RelPtr`] is the
//! raw building block (an offset plus a phantom type), and
//! [`ShmShared`] / [`ShmWeak`] layer `Arc`-style shared ownership on top of
//! it with the reference counts kept *inside* the segment, so handles held
//! by different processes cooperate.
//!
//! Cycles (a node's `parent` and `self_ref` back-references) use the weak
//! variant, which keeps the control block alive but not the value.
//!
//! # Teardown
//!
//! Values in a segment own other segment storage, and Rust's `Drop` cannot
//! reach the mapping from inside the value. Teardown is therefore explicit:
//! types stored behind a control block implement [`ShmDrop`], and release
//! operations take the segment as an argument.

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{fence, AtomicU32};

use crate::alloc::AllocError;
use crate::ordering::{REF_DEC, REF_INC, REF_SYNC, RELAXED, UPGRADE_FAIL, UPGRADE_OK};
use crate::segment::Segment;

/// An offset from the segment base, typed for convenience.
///
/// `0` is the null value: the segment header occupies offset zero, so no
/// allocation can ever land there.
#[repr(transparent)]
pub struct RelPtr<T> {
    off: u64,
    _marker: PhantomData<*mut T>,
}

// Manual impls: a relative pointer is always plain data, whatever `T` is.
impl<T> Clone for RelPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelPtr<T> {}

impl<T> RelPtr<T> {
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self {
            off: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn from_off(off: u64) -> Self {
        Self {
            off,
            _marker: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.off == 0
    }

    #[inline]
    #[must_use]
    pub const fn off(&self) -> u64 {
        self.off
    }

    /// Resolve against a mapping.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and address a live `T` inside `seg`.
    #[inline]
    pub(crate) unsafe fn as_ptr(&self, seg: &Segment) -> *mut T {
        seg.resolve::<T>(self.off)
    }
}

impl<T> std::fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RelPtr({:#x})", self.off)
    }
}

/// Explicit teardown for values that own segment storage.
///
/// # Safety
///
/// Implementors must release every block the value owns, against the same
/// segment the value lives in, and must be safe to call exactly once.
pub(crate) unsafe trait ShmDrop {
    unsafe fn shm_drop(&mut self, seg: &Segment);
}

/// Control block of a shared value: counts first, value last.
///
/// `weak` carries the usual `Arc` invariant: all strong references
/// together hold one weak count, so the block is freed when `weak`
/// reaches zero.
#[repr(C)]
pub(crate) struct CtrlBlock<T> {
    strong: AtomicU32,
    weak: AtomicU32,
    value: T,
}

impl<T> CtrlBlock<T> {
    /// A block holding `value` with one strong (and its implicit weak)
    /// reference.
    pub(crate) fn new(value: T) -> Self {
        Self {
            strong: AtomicU32::new(1),
            weak: AtomicU32::new(1),
            value,
        }
    }
}

/// Owning reference stored *inside* a segment.
///
/// Plain data with manual lifecycle: cloning and releasing take the
/// segment explicitly. The public API never exposes this directly; the
/// process-local node handle wraps it together with the mapping.
#[repr(transparent)]
pub(crate) struct ShmShared<T> {
    ctrl: RelPtr<CtrlBlock<T>>,
}

impl<T> Clone for ShmShared<T> {
    fn clone(&self) -> Self {
        Self { ctrl: self.ctrl }
    }
}

impl<T> Copy for ShmShared<T> {}

/// Non-owning reference stored inside a segment.
#[repr(transparent)]
pub(crate) struct ShmWeak<T> {
    ctrl: RelPtr<CtrlBlock<T>>,
}

impl<T> Clone for ShmWeak<T> {
    fn clone(&self) -> Self {
        Self { ctrl: self.ctrl }
    }
}

impl<T> Copy for ShmWeak<T> {}

impl<T: ShmDrop> ShmShared<T> {
    /// Allocate a control block holding `value` with one strong reference.
    pub(crate) fn new_in(seg: &Segment, value: T) -> Result<Self, AllocError> {
        let ctrl = seg.construct_anon(CtrlBlock::new(value))?;
        Ok(Self { ctrl })
    }

    /// Wrap an existing control block, taking over its strong reference.
    pub(crate) fn from_ctrl(ctrl: RelPtr<CtrlBlock<T>>) -> Self {
        Self { ctrl }
    }

    #[inline]
    pub(crate) fn ctrl(&self) -> RelPtr<CtrlBlock<T>> {
        self.ctrl
    }

    /// Raw pointer to the shared value.
    ///
    /// # Safety
    ///
    /// The reference must be live within `seg`.
    #[inline]
    pub(crate) unsafe fn value_ptr(&self, seg: &Segment) -> *mut T {
        std::ptr::addr_of_mut!((*self.ctrl.as_ptr(seg)).value)
    }

    /// Take another strong reference.
    ///
    /// # Safety
    ///
    /// The reference must be live within `seg`.
    pub(crate) unsafe fn clone_ref(&self, seg: &Segment) -> Self {
        (*self.ctrl.as_ptr(seg)).strong.fetch_add(1, REF_INC);
        *self
    }

    /// Make a non-owning reference to the same value.
    ///
    /// # Safety
    ///
    /// The reference must be live within `seg`.
    pub(crate) unsafe fn downgrade(&self, seg: &Segment) -> ShmWeak<T> {
        (*self.ctrl.as_ptr(seg)).weak.fetch_add(1, REF_INC);
        ShmWeak { ctrl: self.ctrl }
    }

    /// Drop this strong reference; tears the value down at zero.
    ///
    /// # Safety
    ///
    /// Consumes the reference: it must not be used afterwards, and it must
    /// be live within `seg` when called.
    pub(crate) unsafe fn release(self, seg: &Segment) {
        let ctrl = self.ctrl.as_ptr(seg);
        if (*ctrl).strong.fetch_sub(1, REF_DEC) == 1 {
            fence(REF_SYNC);
            (*std::ptr::addr_of_mut!((*ctrl).value)).shm_drop(seg);
            release_weak_count(seg, self.ctrl);
        }
    }

    /// Current strong count, for diagnostics and tests.
    ///
    /// # Safety
    ///
    /// The reference must be live within `seg`.
    #[cfg(test)]
    pub(crate) unsafe fn strong_count(&self, seg: &Segment) -> u32 {
        (*self.ctrl.as_ptr(seg)).strong.load(RELAXED)
    }
}

impl<T: ShmDrop> ShmWeak<T> {
    #[inline]
    #[must_use]
    pub(crate) const fn null() -> Self {
        Self {
            ctrl: RelPtr::null(),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_null(&self) -> bool {
        self.ctrl.is_null()
    }

    /// Take another weak reference.
    ///
    /// # Safety
    ///
    /// Must not be null; the control block must be live within `seg`.
    pub(crate) unsafe fn clone_ref(&self, seg: &Segment) -> Self {
        (*self.ctrl.as_ptr(seg)).weak.fetch_add(1, REF_INC);
        *self
    }

    /// Try to recover an owning reference.
    ///
    /// Returns `None` when the value is already gone (or the weak is null).
    ///
    /// # Safety
    ///
    /// A non-null weak's control block must be live within `seg`.
    pub(crate) unsafe fn upgrade(&self, seg: &Segment) -> Option<ShmShared<T>> {
        if self.is_null() {
            return None;
        }
        let strong = &(*self.ctrl.as_ptr(seg)).strong;
        let mut n = strong.load(RELAXED);
        loop {
            if n == 0 {
                return None;
            }
            match strong.compare_exchange_weak(n, n + 1, UPGRADE_OK, UPGRADE_FAIL) {
                Ok(_) => return Some(ShmShared { ctrl: self.ctrl }),

                Err(cur) => n = cur,
            }
        }
    }

    /// Drop this weak reference; frees the control block at zero.
    ///
    /// No-op when null.
    ///
    /// # Safety
    ///
    /// Consumes the reference; a non-null weak must be live within `seg`.
    pub(crate) unsafe fn release(self, seg: &Segment) {
        if self.is_null() {
            return;
        }
        release_weak_count(seg, self.ctrl);
    }
}

/// Shared tail of strong/weak release: free the block when the weak count
/// bottoms out.
///
/// The value inside is already torn down (or never existed for pure weak
/// counts); only the raw block is returned to the heap.
unsafe fn release_weak_count<T>(seg: &Segment, ctrl: RelPtr<CtrlBlock<T>>) {
    let raw = ctrl.as_ptr(seg);
    if (*raw).weak.fetch_sub(1, REF_DEC) == 1 {
        fence(REF_SYNC);
        seg.dealloc(ctrl.off());
    }
}

/// Compile-time guard: control blocks must fit the segment alignment.
const _: () = assert!(mem::align_of::<CtrlBlock<u64>>() <= crate::alloc::ALIGN);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32 as TestCounter, Ordering};

    fn unique_name(tag: &str) -> String {
        static SEQ: TestCounter = TestCounter::new(0);
        format!(
            "shmtree_ptr_{}_{}_{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Value that traps double teardown.
    struct Probe {
        drops: u64,
    }

    unsafe impl ShmDrop for Probe {
        unsafe fn shm_drop(&mut self, _seg: &Segment) {
            assert_eq!(self.drops, 0, "value torn down twice");
            self.drops += 1;
        }
    }

    #[test]
    fn strong_clone_and_release() {
        let seg = Segment::open_or_create(&unique_name("strong"), 16 * 1024).unwrap();
        let a = ShmShared::new_in(&seg, Probe { drops: 0 }).unwrap();
        unsafe {
            let b = a.clone_ref(&seg);
            assert_eq!(a.strong_count(&seg), 2);
            b.release(&seg);
            assert_eq!(a.strong_count(&seg), 1);
            a.release(&seg);
        }
        seg.request_unlink();
    }

    #[test]
    fn weak_does_not_keep_value_alive() {
        let seg = Segment::open_or_create(&unique_name("weak"), 16 * 1024).unwrap();
        let a = ShmShared::new_in(&seg, Probe { drops: 0 }).unwrap();
        unsafe {
            let w = a.downgrade(&seg);
            let upgraded = w.upgrade(&seg).expect("value still alive");
            upgraded.release(&seg);
            a.release(&seg);
            assert!(w.upgrade(&seg).is_none());
            w.release(&seg);
        }
        seg.request_unlink();
    }

    #[test]
    fn null_weak_is_inert() {
        let seg = Segment::open_or_create(&unique_name("null"), 16 * 1024).unwrap();
        let w: ShmWeak<Probe> = ShmWeak::null();
        assert!(w.is_null());
        unsafe {
            assert!(w.upgrade(&seg).is_none());
            w.release(&seg);
        }
        seg.request_unlink();
    }

    #[test]
    fn block_memory_is_reclaimed() {
        let seg = Segment::open_or_create(&unique_name("reclaim"), 16 * 1024).unwrap();
        let a = ShmShared::new_in(&seg, Probe { drops: 0 }).unwrap();
        let first_off = a.ctrl().off();
        unsafe { a.release(&seg) };
        // The freed control block is the first candidate for reuse.
        let b = ShmShared::new_in(&seg, Probe { drops: 0 }).unwrap();
        assert_eq!(b.ctrl().off(), first_off);
        unsafe { b.release(&seg) };
        seg.request_unlink();
    }
}
