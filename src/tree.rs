//! Filepath: src/tree.rs
//! `SharedTree` - the per-process handle to a name index in shared memory.
//!
//! This module provides the main `SharedTree<P>` type: attachment to a
//! named segment, the cross-process reference count that decides when the
//! region is destroyed, and the grow protocol that migrates the tree into
//! a doubled successor segment when the current one runs out of memory.
//!
//! # Migration in one paragraph
//!
//! Segment names end in `_<N>`. When an insertion hits an allocation
//! failure, the handle opens (or creates) `_<N+1>` at twice the size,
//! deep-copies the tree into it, attaches, marks the old segment's control
//! object `outdated`, detaches from it, and retries the insertion. Other
//! attached handles notice `outdated` before their next dereference and
//! walk the same chain; the last one off a segment destroys it and removes
//! the OS-level name.

use std::fmt as StdFmt;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc::AllocError;
use crate::error::{Error, Result};
use crate::node::{add_node, new_node_in, Node, NodeHandle, FLAG_DIRECTORY};
use crate::ordering::{FLAG_READ, FLAG_SET};
use crate::payload::Payload;
use crate::ptr::{RelPtr, ShmShared};
use crate::segment::Segment;
use crate::tracing_helpers::{debug_log, info_log};

/// Default size of a freshly created region: 64 KiB.
///
/// Callers should supply powers of two; growth is exactly doubling, and a
/// region that cannot hold the control object plus an empty root cannot
/// grow itself out of trouble.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// Well-known name of the per-segment control object.
const META_NAME: &str = "Meta";

/// Per-segment control object, found under [`META_NAME`].
#[repr(C)]
struct Meta<P: Payload> {
    /// The root directory node (empty name, null parent).
    tree: ShmShared<Node<P>>,

    /// Number of attached handles across all processes.
    refs: spin::Mutex<i64>,

    /// Sticky flag: a successor segment exists and holds the
    /// authoritative tree.
    outdated: AtomicBool,
}

/// One process's attachment to one segment generation.
struct Attachment<P: Payload> {
    name: String,
    seg: Arc<Segment>,
    meta: RelPtr<Meta<P>>,
}

impl<P: Payload> Attachment<P> {
    #[inline]
    unsafe fn meta(&self) -> *mut Meta<P> {
        self.meta.as_ptr(&self.seg)
    }

    fn outdated(&self) -> bool {
        // SAFETY: the attachment's refcount keeps the meta object alive.
        unsafe { (*self.meta()).outdated.load(FLAG_READ) }
    }

    fn root(&self) -> NodeHandle<P> {
        // SAFETY: same as above; the root reference is live while meta is.
        unsafe { NodeHandle::retain(&self.seg, (*self.meta()).tree) }
    }
}

/// Split a region name into its `(prefix_, serial)` parts.
///
/// Returns `None` unless the name ends in `_<digits>`.
fn split_serial(name: &str) -> Option<(&str, u64)> {
    let idx = name.rfind('_')?;
    let digits = &name[idx + 1..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let serial = digits.parse().ok()?;
    Some((&name[..=idx], serial))
}

/// Name of the next segment in the grow chain.
fn successor_name(name: &str) -> Result<String> {
    let (prefix, serial) =
        split_serial(name).ok_or_else(|| Error::InvalidName(name.to_owned()))?;
    Ok(format!("{prefix}{}", serial + 1))
}

/// Open or create a segment and locate its control object, constructing
/// an empty tree when this attacher is first.
///
/// Does not touch the reference count; callers decide when the attachment
/// becomes discoverable (the grower copies the tree first).
fn open_attachment<P: Payload>(name: &str, size: usize) -> Result<(Attachment<P>, bool)> {
    let seg = Arc::new(Segment::open_or_create(name, size)?);
    let (meta, created) = seg.find_or_construct_named::<Meta<P>, _>(META_NAME, || {
        let payload = P::create_empty(&seg)?;
        let root = new_node_in(&seg, b"", FLAG_DIRECTORY, payload)?;
        Ok(Meta {
            tree: root,
            refs: spin::Mutex::new(0),
            outdated: AtomicBool::new(false),
        })
    })?;
    Ok((
        Attachment {
            name: name.to_owned(),
            seg,
            meta,
        },
        created,
    ))
}

/// Bump the attachment's reference count.
fn inc_ref<P: Payload>(att: &Attachment<P>) -> i64 {
    // SAFETY: the meta object is live; the count is guarded by its mutex.
    unsafe {
        let mut refs = (*att.meta()).refs.lock();
        *refs += 1;
        *refs
    }
}

/// Drop the attachment's reference count; the handle that reaches zero
/// destroys the tree and removes the OS-level name.
fn release_attachment<P: Payload>(att: &Attachment<P>) {
    // SAFETY: we hold one count, so the meta object is live on entry.
    unsafe {
        let remaining = {
            let mut refs = (*att.meta()).refs.lock();
            *refs -= 1;
            *refs
        };
        debug_log!(region = att.name.as_str(), remaining, "detach");
        if remaining == 0 {
            // Last user anywhere: tear down the tree, the control object,
            // and the region name.
            let tree = std::ptr::read(std::ptr::addr_of!((*att.meta()).tree));
            tree.release(&att.seg);
            att.seg.remove_named(META_NAME);
            att.seg.destroy(att.meta);
            att.seg.request_unlink();
            info_log!(region = att.name.as_str(), "destroyed last reference, region unlinked");
        }
    }
}

/// Deep-copy the tree of `src` into the (empty) root of `dst`.
///
/// Fails with the allocator's error when even the doubled successor cannot
/// hold the tree; the grow loop then doubles again.
fn copy_tree<P: Payload>(
    src: &Attachment<P>,
    dst: &Attachment<P>,
) -> std::result::Result<(), AllocError> {
    // SAFETY: both attachments hold their segments; roots are live.
    unsafe {
        let src_root = (*src.meta()).tree;
        let dst_root = (*dst.meta()).tree;
        copy_node(
            &src.seg,
            src_root.value_ptr(&src.seg),
            &dst.seg,
            dst_root.value_ptr(&dst.seg),
        )
    }
}

/// Copy one node's local state and recurse over its children in map
/// order. The destination node's `self_ref` is wired at creation, before
/// the recursion, so grandchildren can point their parents at it.
unsafe fn copy_node<P: Payload>(
    src_seg: &Segment,
    src: *mut Node<P>,
    dst_seg: &Segment,
    dst: *mut Node<P>,
) -> std::result::Result<(), AllocError> {
    (*dst).flags.store((*src).flags.load(FLAG_READ), FLAG_SET);

    let new_name = (*src).name.clone_into_segment(src_seg, dst_seg)?;
    let mut old_name = std::mem::replace(&mut (*dst).name, new_name);
    old_name.destroy(dst_seg);

    let new_payload = (*src).payload.clone_into(src_seg, dst_seg)?;
    let mut old_payload = std::mem::replace(&mut (*dst).payload, new_payload);
    old_payload.destroy(dst_seg);

    let count = (*src).children.len();
    for idx in 0..count {
        let entry = &(*src).children.entries(src_seg)[idx];

        (*dst).children.reserve_one(dst_seg)?;
        let placeholder = P::create_empty(dst_seg)?;
        let child = new_node_in(dst_seg, &[], 0, placeholder)?;
        (*child.value_ptr(dst_seg)).parent = (*dst).self_ref.clone_ref(dst_seg);

        if let Err(e) = copy_node(
            src_seg,
            entry.child.value_ptr(src_seg),
            dst_seg,
            child.value_ptr(dst_seg),
        ) {
            child.release(dst_seg);
            return Err(e);
        }

        let key = match entry.key.clone_into_segment(src_seg, dst_seg) {
            Ok(k) => k,

            Err(e) => {
                child.release(dst_seg);
                return Err(e);
            }
        };
        (*dst).children.push_ordered(dst_seg, key, child);
    }
    Ok(())
}

/// Follow or extend the grow chain until attached to a current segment.
///
/// Works for both roles: the mutator that just hit an allocation failure
/// (successor absent, so it creates and copies) and a reader following
/// `outdated` (successor present, copy skipped). If the copy itself runs
/// out of memory the freshly created successor is left behind as an
/// outdated forwarding hop and the loop doubles again.
fn reassign<P: Payload>(att: &mut Attachment<P>) -> Result<()> {
    let mut hops: Vec<Attachment<P>> = Vec::new();
    let mut name = att.name.clone();
    let mut size = att.seg.size();

    let next = loop {
        name = successor_name(&name)?;
        size *= 2;
        let (cand, created) = open_attachment::<P>(&name, size)?;

        if created {
            if let Err(_copy_err) = copy_tree(att, &cand) {
                debug_log!(region = name.as_str(), size, error = %_copy_err, "successor too small");
                inc_ref(&cand);
                // SAFETY: the refcount we just took keeps meta live.
                unsafe { (*cand.meta()).outdated.store(true, FLAG_SET) };
                hops.push(cand);
                continue;
            }
        }

        inc_ref(&cand);
        if !cand.outdated() {
            break cand;
        }
        // Another process migrated past this generation while we worked;
        // keep walking the chain.
        hops.push(cand);
    };

    // Make the old generation forward, then leave it and every
    // intermediate hop. Whoever is last on each destroys it.
    // SAFETY: our refcount keeps the old meta live until released below.
    unsafe { (*att.meta()).outdated.store(true, FLAG_SET) };
    for hop in &hops {
        release_attachment(hop);
    }
    let old = std::mem::replace(att, next);
    release_attachment(&old);

    info_log!(
        region = att.name.as_str(),
        size = att.seg.size(),
        "tree migrated"
    );
    Ok(())
}

/// A per-process handle to a hierarchical name index living in a named
/// shared-memory region.
///
/// Multiple cooperating processes attach to the same name and see one
/// mutable tree of named nodes, each carrying a caller-defined payload
/// (see [`Payload`]). The handle transparently follows segment migrations
/// triggered by any attached process.
///
/// # Concurrency
///
/// The design assumes a single concurrent writer across all attached
/// processes (enforced by the caller); readers may run concurrently with
/// that writer. Attach, detach and migration are internally serialized.
///
/// # Example
///
/// ```no_run
/// use shmtree::SharedTree;
///
/// let tree: SharedTree<u64> = SharedTree::attach_default("docs_1")?;
/// let _ = tree.add_file("reports/2026/q3.txt", &7, 0, true)?;
/// let node = tree.find_or_err("Reports/2026/Q3.TXT")?;
/// assert_eq!(*node.data(), 7);
/// # Ok::<(), shmtree::Error>(())
/// ```
pub struct SharedTree<P: Payload> {
    state: Mutex<Attachment<P>>,
}

// SAFETY: the attachment is behind a process-local mutex; everything it
// points at is in shared memory with atomic or mutex-guarded state.
unsafe impl<P: Payload> Send for SharedTree<P> {}
unsafe impl<P: Payload> Sync for SharedTree<P> {}

impl<P: Payload> SharedTree<P> {
    /// Attach to `shm_name`, creating the region at `size` bytes when it
    /// does not exist yet.
    ///
    /// A name without a `_<digits>` suffix gets `_1` appended, so the
    /// grow chain always has somewhere to count.
    pub fn attach(shm_name: &str, size: usize) -> Result<Self> {
        let name = if split_serial(shm_name).is_some() {
            shm_name.to_owned()
        } else {
            format!("{shm_name}_1")
        };
        let (att, _created) = open_attachment::<P>(&name, size)?;
        inc_ref(&att);
        info_log!(
            region = name.as_str(),
            nodes = att.root().count_recursive(),
            size = att.seg.size(),
            "attached"
        );
        Ok(Self {
            state: Mutex::new(att),
        })
    }

    /// [`SharedTree::attach`] with the default 64 KiB initial size.
    pub fn attach_default(shm_name: &str) -> Result<Self> {
        Self::attach(shm_name, DEFAULT_SEGMENT_SIZE)
    }

    /// Root handle of the current segment generation, following any
    /// pending migration first.
    pub fn root(&self) -> Result<NodeHandle<P>> {
        let mut st = self.state.lock();
        if st.outdated() {
            reassign(&mut st)?;
        }
        Ok(st.root())
    }

    /// Current name of the managed region (advances across migrations).
    #[must_use]
    pub fn shm_name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Current size of the managed region in bytes.
    #[must_use]
    pub fn segment_size(&self) -> usize {
        self.state.lock().seg.size()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Add a file node at `path`, creating missing intermediate
    /// directories as dummies.
    ///
    /// `source` is the process-local value the payload is built from;
    /// construction happens inside the (possibly re-grown) segment. With
    /// `overwrite` false an existing node at `path` is left untouched and
    /// `None` is returned; otherwise the new node replaces it.
    ///
    /// Runs of allocation failures are absorbed by growing the region and
    /// retrying, so callers only ever see other error kinds.
    pub fn add_file(
        &self,
        path: &str,
        source: &P::Source,
        flags: u8,
        overwrite: bool,
    ) -> Result<Option<NodeHandle<P>>> {
        self.add_with_flags(path, source, flags, overwrite)
    }

    /// Add a directory node at `path`.
    ///
    /// Identical to [`SharedTree::add_file`] apart from OR-ing
    /// [`FLAG_DIRECTORY`](crate::FLAG_DIRECTORY) into the flags.
    pub fn add_directory(
        &self,
        path: &str,
        source: &P::Source,
        flags: u8,
        overwrite: bool,
    ) -> Result<Option<NodeHandle<P>>> {
        self.add_with_flags(path, source, flags | FLAG_DIRECTORY, overwrite)
    }

    fn add_with_flags(
        &self,
        path: &str,
        source: &P::Source,
        flags: u8,
        overwrite: bool,
    ) -> Result<Option<NodeHandle<P>>> {
        loop {
            let (root, generation) = {
                let mut st = self.state.lock();
                if st.outdated() {
                    reassign(&mut st)?;
                }
                (st.root(), st.name.clone())
            };
            match add_node(&root, path, source, flags, overwrite) {
                Ok(res) => return Ok(res),

                Err(_full) => {
                    debug_log!(path, error = %_full, "segment full, growing");
                    drop(root);
                    let mut st = self.state.lock();
                    // Another thread may have migrated underneath the
                    // failed attempt; only grow the generation that was
                    // actually full.
                    if st.name == generation {
                        reassign(&mut st)?;
                    }
                }
            }
        }
    }

    /// Drop every node below the root.
    pub fn clear(&self) -> Result<()> {
        self.root()?.clear_children();
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find the node at `path`; `None` at the first missing component.
    pub fn find(&self, path: &str) -> Result<Option<NodeHandle<P>>> {
        Ok(self.root()?.find(path))
    }

    /// Find the node at `path`; a missing node is an error.
    pub fn find_or_err(&self, path: &str) -> Result<NodeHandle<P>> {
        self.root()?.find_or_err(path)
    }

    /// All nodes matching a wildcard pattern. See
    /// [`NodeHandle::glob`](crate::NodeHandle::glob).
    pub fn glob(&self, pattern: &str) -> Result<Vec<NodeHandle<P>>> {
        Ok(self.root()?.glob(pattern))
    }

    /// Call `visitor` on each node that exists along `path`, in order.
    pub fn visit_path<F>(&self, path: &str, visitor: F) -> Result<()>
    where
        F: FnMut(&NodeHandle<P>),
    {
        self.root()?.visit_path(path, visitor);
        Ok(())
    }

    /// Total node count of the tree by the recursive diagnostic measure
    /// (see [`NodeHandle::count_recursive`]).
    pub fn node_count(&self) -> Result<usize> {
        Ok(self.root()?.count_recursive())
    }

    /// Pretty-print the whole tree; indentation equals depth.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> Result<()>
    where
        P: StdFmt::Debug,
    {
        self.root()?.dump(out)?;
        Ok(())
    }
}

impl<P: Payload> Drop for SharedTree<P> {
    fn drop(&mut self) {
        release_attachment(self.state.get_mut());
    }
}

impl<P: Payload> StdFmt::Debug for SharedTree<P> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let st = self.state.lock();
        f.debug_struct("SharedTree")
            .field("region", &st.name)
            .field("size", &st.seg.size())
            .finish()
    }
}
