//! Filepath: src/segment.rs
//!
//! Named shared-memory segment with an in-segment heap and a small
//! named-object table.
//!
//! A [`Segment`] maps a named OS region into the current process. The first
//! attacher initializes the header (a CAS-guarded state machine over
//! zero-filled memory); later attachers spin until the header is ready.
//! Everything stored in the segment is addressed by offsets from the mapped
//! base, so different processes can map the region at different addresses
//! and still share one object graph.
//!
//! The named-object table is the rendezvous mechanism between processes:
//! the first attacher constructs the control object under a well-known
//! name, subsequent attachers find it.

use std::mem;
use std::ptr::{self, addr_of_mut};
use std::sync::atomic::{AtomicBool, AtomicU64};

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::alloc::{heap_alloc, heap_dealloc, round_up, AllocError, HeapState, ALIGN};
use crate::error::{Error, Result};
use crate::ordering::{FLAG_READ, FLAG_SET, RELAXED};
use crate::ptr::RelPtr;
use crate::tracing_helpers::{debug_log, trace_log};

/// Header state: freshly mapped, zero-filled memory.
const STATE_RAW: u64 = 0;

/// Header state: one attacher is writing the header.
const STATE_INIT: u64 = 1;

/// Header state: ready for use. Doubles as a magic number.
const STATE_READY: u64 = 0x5348_4d49_4458_0001;

/// Maximum number of named objects per segment.
const MAX_NAMED: usize = 8;

/// Maximum byte length of an object name.
const MAX_NAME: usize = 23;

#[repr(C)]
struct NameEntry {
    len: u8,
    bytes: [u8; MAX_NAME],
    off: u64,
}

#[repr(C)]
struct NameTable {
    entries: [NameEntry; MAX_NAMED],
}

/// Control block at offset zero of every segment.
#[repr(C)]
struct SegmentHeader {
    state: AtomicU64,
    size: u64,
    heap: spin::Mutex<HeapState>,
    names: spin::Mutex<NameTable>,
}

const fn heap_start() -> u64 {
    round_up(mem::size_of::<SegmentHeader>()) as u64
}

/// A mapped, named shared-memory region.
///
/// Shared within a process via `Arc`; every handle derived from the segment
/// holds the `Arc` so the mapping outlives the objects resolved through it.
/// The OS-level name is removed only when a detach drives the tree's
/// reference count to zero (see [`Segment::request_unlink`]).
pub struct Segment {
    shmem: Shmem,
    unlink_on_drop: AtomicBool,
}

// SAFETY: the segment holds raw pointers into a mapping shared between
// processes. All shared state inside the mapping is either atomic, guarded
// by in-segment locks, or covered by the crate's single-writer convention,
// and the mapping itself stays valid for the lifetime of this value.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Open the named region, or create it at `size` bytes if it does not
    /// exist yet.
    ///
    /// Creation races between processes resolve by falling back to opening
    /// the instance that won.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        let shmem = match ShmemConf::new().size(size).os_id(name).create() {
            Ok(mut m) => {
                // Unlinking is decided by the refcount protocol, not by
                // which process happened to create the region.
                m.set_owner(false);
                debug_log!(region = name, size, "created shared region");
                m
            }

            Err(ShmemError::MappingIdExists) => {
                let m = ShmemConf::new()
                    .os_id(name)
                    .open()
                    .map_err(|e| Error::open(name, e))?;
                debug_log!(region = name, "opened shared region");
                m
            }

            Err(e) => return Err(Error::open(name, e)),
        };

        let seg = Self {
            shmem,
            unlink_on_drop: AtomicBool::new(false),
        };
        seg.init_header();
        Ok(seg)
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: the header lives at offset zero of the mapping and is
        // made of interior-mutable fields; init_header ran before any use.
        unsafe { &*self.base().cast::<SegmentHeader>() }
    }

    /// Total size of the region in bytes, as recorded by its initializer.
    #[must_use]
    pub fn size(&self) -> usize {
        self.header().size as usize
    }

    /// First attacher writes the header; everyone else waits for it.
    fn init_header(&self) {
        // SAFETY: offset zero is in bounds and properly aligned; the CAS
        // ensures exactly one process writes the non-atomic fields.
        unsafe {
            let hdr = self.base().cast::<SegmentHeader>();
            let state = &(*hdr).state;
            match state.compare_exchange(STATE_RAW, STATE_INIT, FLAG_SET, FLAG_READ) {
                Ok(_) => {
                    ptr::write(addr_of_mut!((*hdr).size), self.shmem.len() as u64);
                    ptr::write(
                        addr_of_mut!((*hdr).heap),
                        spin::Mutex::new(HeapState {
                            bump: heap_start(),
                            free_head: 0,
                        }),
                    );
                    ptr::write(
                        addr_of_mut!((*hdr).names),
                        spin::Mutex::new(NameTable {
                            entries: std::array::from_fn(|_| NameEntry {
                                len: 0,
                                bytes: [0; MAX_NAME],
                                off: 0,
                            }),
                        }),
                    );
                    state.store(STATE_READY, FLAG_SET);
                }

                Err(_) => {
                    while state.load(FLAG_READ) != STATE_READY {
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `size` bytes in the segment heap, returning the offset of
    /// the new block from the segment base.
    pub fn alloc(&self, size: usize) -> std::result::Result<u64, AllocError> {
        let hdr = self.header();
        let mut heap = hdr.heap.lock();
        let res = unsafe { heap_alloc(self.base(), hdr.size, &mut heap, size) };
        trace_log!(size, ok = res.is_ok(), "segment alloc");
        res
    }

    /// Free a block previously returned by [`Segment::alloc`].
    ///
    /// # Safety
    ///
    /// `off` must come from `alloc` on this segment and must not be freed
    /// twice or used afterwards.
    pub unsafe fn dealloc(&self, off: u64) {
        let hdr = self.header();
        let mut heap = hdr.heap.lock();
        heap_dealloc(self.base(), &mut heap, off);
    }

    /// Resolve an offset to a typed pointer within this mapping.
    ///
    /// # Safety
    ///
    /// `off` must address a live, properly typed object in this segment.
    #[inline]
    pub(crate) unsafe fn resolve<T>(&self, off: u64) -> *mut T {
        debug_assert!(off != 0, "null offset");
        debug_assert!(off as usize + mem::size_of::<T>() <= self.size());
        self.base().add(off as usize).cast()
    }

    // ========================================================================
    // Named objects
    // ========================================================================

    /// Look up a named object.
    #[must_use]
    pub fn find_named<T>(&self, name: &str) -> Option<RelPtr<T>> {
        assert!(mem::align_of::<T>() <= ALIGN);
        let names = self.header().names.lock();
        names
            .entries
            .iter()
            .find(|e| e.off != 0 && &e.bytes[..e.len as usize] == name.as_bytes())
            .map(|e| RelPtr::from_off(e.off))
    }

    /// Find a named object, constructing it with `init` if absent.
    ///
    /// The table lock is held across the whole operation, so concurrent
    /// attachers agree on a single instance. Returns the object and whether
    /// this call constructed it.
    pub fn find_or_construct_named<T, F>(
        &self,
        name: &str,
        init: F,
    ) -> std::result::Result<(RelPtr<T>, bool), AllocError>
    where
        F: FnOnce() -> std::result::Result<T, AllocError>,
    {
        assert!(mem::align_of::<T>() <= ALIGN);
        assert!(name.len() <= MAX_NAME, "object name too long");

        let mut names = self.header().names.lock();
        if let Some(e) = names
            .entries
            .iter()
            .find(|e| e.off != 0 && &e.bytes[..e.len as usize] == name.as_bytes())
        {
            return Ok((RelPtr::from_off(e.off), false));
        }

        let slot = names
            .entries
            .iter()
            .position(|e| e.off == 0)
            .ok_or_else(|| AllocError::new(mem::size_of::<NameEntry>()))?;

        let value = init()?;
        let off = self.alloc(mem::size_of::<T>())?;
        // SAFETY: freshly allocated, in-bounds, ALIGN-aligned block.
        unsafe { self.resolve::<T>(off).write(value) };

        let entry = &mut names.entries[slot];
        entry.len = name.len() as u8;
        entry.bytes[..name.len()].copy_from_slice(name.as_bytes());
        entry.off = off;
        Ok((RelPtr::from_off(off), true))
    }

    /// Construct an anonymous object in the segment heap.
    pub fn construct_anon<T>(&self, value: T) -> std::result::Result<RelPtr<T>, AllocError> {
        assert!(mem::align_of::<T>() <= ALIGN);
        let off = self.alloc(mem::size_of::<T>())?;
        // SAFETY: freshly allocated, in-bounds, ALIGN-aligned block.
        unsafe { self.resolve::<T>(off).write(value) };
        Ok(RelPtr::from_off(off))
    }

    /// Drop an object constructed by [`Segment::construct_anon`] or
    /// [`Segment::find_or_construct_named`] and free its block.
    ///
    /// The plain Rust destructor runs; any segment storage the value owns
    /// must have been released beforehand.
    ///
    /// # Safety
    ///
    /// `p` must point at a live `T` allocated in this segment, and no other
    /// reference to it may remain.
    pub unsafe fn destroy<T>(&self, p: RelPtr<T>) {
        let raw = self.resolve::<T>(p.off());
        ptr::drop_in_place(raw);
        self.dealloc(p.off());
    }

    /// Remove a name from the table without touching the object.
    ///
    /// # Safety
    ///
    /// The caller takes over ownership of the object's storage.
    pub(crate) unsafe fn remove_named(&self, name: &str) -> Option<u64> {
        let mut names = self.header().names.lock();
        let entry = names
            .entries
            .iter_mut()
            .find(|e| e.off != 0 && &e.bytes[..e.len as usize] == name.as_bytes())?;
        let off = entry.off;
        entry.off = 0;
        entry.len = 0;
        Some(off)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Ask for the OS-level name to be removed when the last in-process
    /// reference to this mapping drops.
    pub fn request_unlink(&self) {
        self.unlink_on_drop.store(true, FLAG_SET);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let unlink = self.unlink_on_drop.load(RELAXED);
        self.shmem.set_owner(unlink);
        debug_log!(unlink, "segment unmapped");
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("size", &self.size()).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
