//! Filepath: src/node.rs
//!
//! Tree nodes and the process-local [`NodeHandle`].
//!
//! A [`Node`] lives entirely inside a segment: its name, payload and
//! children map are segment allocations, and its `parent` / `self_ref`
//! back-references are non-owning in-segment handles (weak, so the cycle
//! parent → child → parent cannot keep nodes alive forever).
//!
//! Processes never touch a `Node` directly. A [`NodeHandle`] pairs an
//! owning in-segment reference with the `Arc` of the local mapping, so the
//! node stays alive as long as the handle does and the mapping stays valid
//! as long as any handle resolved through it exists.
//!
//! Structural mutation (children, flags, payload) is covered by the
//! crate-wide single-writer convention: one writer across all attached
//! processes, readers concurrent with it.

use std::fmt;
use std::io;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use crate::alloc::AllocError;
use crate::error::{Error, Result};
use crate::glob::{partial_match, remainder_is_hit, split_fixed_prefix, starts_with_dir_star};
use crate::map::NodeMap;
use crate::path::components;
use crate::payload::Payload;
use crate::ptr::{CtrlBlock, RelPtr, ShmDrop, ShmShared, ShmWeak};
use crate::segment::Segment;
use crate::shmstr::ShmString;
use crate::tracing_helpers::trace_log;

/// Node flag: the node is a directory and may have children.
pub const FLAG_DIRECTORY: u8 = 0x01;

/// Node flag: auto-created intermediate directory.
pub const FLAG_DUMMY: u8 = 0x02;

/// First flag bit free for caller-defined use.
pub const FLAG_FIRST_USER: u8 = 0x10;

/// One entry of the tree, stored in a segment.
#[repr(C)]
pub(crate) struct Node<P: Payload> {
    pub(crate) flags: AtomicU8,
    pub(crate) name: ShmString,
    pub(crate) payload: P,
    pub(crate) children: NodeMap<P>,
    pub(crate) parent: ShmWeak<Node<P>>,
    pub(crate) self_ref: ShmWeak<Node<P>>,
}

// SAFETY: releases, exactly once, everything a node owns in its segment.
// Children cascade through their own strong references.
unsafe impl<P: Payload> ShmDrop for Node<P> {
    unsafe fn shm_drop(&mut self, seg: &Segment) {
        while !self.children.is_empty() {
            let mut entry = self.children.remove_at(seg, self.children.len() - 1);
            entry.key.destroy(seg);
            entry.child.release(seg);
        }
        self.children.destroy(seg);
        self.name.destroy(seg);
        self.payload.destroy(seg);
        self.parent.release(seg);
        self.self_ref.release(seg);
    }
}

/// Allocate a node with one strong reference and a wired `self_ref`.
///
/// The parent back-reference starts null; callers wire it before linking
/// the node into a children map.
pub(crate) fn new_node_in<P: Payload>(
    seg: &Segment,
    name: &[u8],
    flags: u8,
    payload: P,
) -> std::result::Result<ShmShared<Node<P>>, AllocError> {
    assert!(std::mem::align_of::<CtrlBlock<Node<P>>>() <= crate::alloc::ALIGN);
    let mut name_s = match ShmString::new_in(seg, name) {
        Ok(s) => s,

        Err(e) => {
            // The payload was built in this segment for this node; without
            // a node to own it, release it here.
            let mut payload = payload;
            unsafe { payload.destroy(seg) };
            return Err(e);
        }
    };

    let ctrl_off = match seg.alloc(std::mem::size_of::<CtrlBlock<Node<P>>>()) {
        Ok(off) => off,

        Err(e) => {
            let mut payload = payload;
            unsafe {
                name_s.destroy(seg);
                payload.destroy(seg);
            }
            return Err(e);
        }
    };

    // SAFETY: freshly allocated, properly aligned block.
    unsafe {
        seg.resolve::<CtrlBlock<Node<P>>>(ctrl_off)
            .write(CtrlBlock::new(Node {
                flags: AtomicU8::new(flags),
                name: name_s,
                payload,
                children: NodeMap::new(),
                parent: ShmWeak::null(),
                self_ref: ShmWeak::null(),
            }));
    }
    let shared: ShmShared<Node<P>> = ShmShared::from_ctrl(RelPtr::from_off(ctrl_off));

    // Wire the self reference before the node can be observed, so children
    // added later can point their parent at it.
    unsafe {
        let weak = shared.downgrade(seg);
        (*shared.value_ptr(seg)).self_ref = weak;
    }
    Ok(shared)
}

/// Shared-ownership handle to one tree node, valid in this process.
///
/// Cloning is cheap (one atomic increment inside the segment). The handle
/// keeps both the node and the mapping alive; a handle that survives a
/// migration still reads the segment it was created in.
pub struct NodeHandle<P: Payload> {
    seg: Arc<Segment>,
    node: ShmShared<Node<P>>,
}

// SAFETY: the handle only exposes reads of in-segment plain data plus
// atomic flag/refcount updates; structural mutation is serialized by the
// crate's single-writer convention.
unsafe impl<P: Payload> Send for NodeHandle<P> {}
unsafe impl<P: Payload> Sync for NodeHandle<P> {}

impl<P: Payload> Clone for NodeHandle<P> {
    fn clone(&self) -> Self {
        Self::retain(&self.seg, self.node)
    }
}

impl<P: Payload> Drop for NodeHandle<P> {
    fn drop(&mut self) {
        // SAFETY: the handle owns one strong reference and the mapping.
        unsafe { self.node.release(&self.seg) };
    }
}

impl<P: Payload> NodeHandle<P> {
    /// Wrap an in-segment reference, taking over its strong count.
    pub(crate) fn adopt(seg: Arc<Segment>, node: ShmShared<Node<P>>) -> Self {
        Self { seg, node }
    }

    /// Wrap an in-segment reference, taking an additional strong count.
    pub(crate) fn retain(seg: &Arc<Segment>, node: ShmShared<Node<P>>) -> Self {
        // SAFETY: the caller vouches the reference is live in `seg`.
        unsafe { node.clone_ref(seg) };
        Self {
            seg: Arc::clone(seg),
            node,
        }
    }

    /// The mapping this handle resolves through.
    ///
    /// Needed to read payloads that are themselves segment allocations,
    /// such as [`ShmString`](crate::ShmString).
    #[inline]
    #[must_use]
    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    #[inline]
    fn raw(&self) -> *mut Node<P> {
        // SAFETY: the handle keeps the node alive within its mapping.
        unsafe { self.node.value_ptr(&self.seg) }
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// The node's own name (empty for the root).
    #[must_use]
    pub fn name(&self) -> String {
        unsafe { (*self.raw()).name.to_string_lossy(&self.seg) }
    }

    pub(crate) fn name_is_empty(&self) -> bool {
        unsafe { (*self.raw()).name.is_empty() }
    }

    /// Current flag bits.
    #[must_use]
    pub fn flags(&self) -> u8 {
        unsafe { (*self.raw()).flags.load(crate::ordering::FLAG_READ) }
    }

    /// True when any bit of `flag` is set on this node.
    #[must_use]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    /// Set or clear the given flag bits.
    pub fn set_flag(&self, flag: u8, enabled: bool) {
        let flags = unsafe { &(*self.raw()).flags };
        if enabled {
            flags.fetch_or(flag, crate::ordering::FLAG_SET);
        } else {
            flags.fetch_and(!flag, crate::ordering::FLAG_SET);
        }
    }

    /// True when the node is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.has_flag(FLAG_DIRECTORY)
    }

    /// Borrow the payload.
    ///
    /// Reads race only with the single external writer, per the crate's
    /// concurrency convention.
    #[must_use]
    pub fn data(&self) -> &P {
        unsafe { &(*self.raw()).payload }
    }

    /// Full path from the root, components joined with `/`.
    ///
    /// The root yields the empty string. A non-root node whose parent is
    /// gone yields its own name, treated as a root.
    #[must_use]
    pub fn path(&self) -> String {
        let mut parts = Vec::new();
        let mut cur = self.clone();
        loop {
            match cur.parent() {
                Some(p) => {
                    parts.push(cur.name());
                    cur = p;
                }

                None => {
                    if !cur.name_is_empty() {
                        parts.push(cur.name());
                    }
                    break;
                }
            }
        }
        parts.reverse();
        parts.join("/")
    }

    /// The parent node, or `None` at the root (or for a detached node).
    #[must_use]
    pub fn parent(&self) -> Option<NodeHandle<P>> {
        // SAFETY: the parent weak lives in our node; upgrade yields an
        // owning reference in the same segment.
        unsafe {
            (*self.raw())
                .parent
                .upgrade(&self.seg)
                .map(|s| Self::adopt(Arc::clone(&self.seg), s))
        }
    }

    // ========================================================================
    // Children
    // ========================================================================

    /// Case-insensitive lookup of a direct child.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<NodeHandle<P>> {
        unsafe {
            (*self.raw())
                .children
                .get(&self.seg, name.as_bytes())
                .map(|s| Self::retain(&self.seg, s))
        }
    }

    /// Like [`NodeHandle::child`], but missing children are an error.
    pub fn child_or_err(&self, name: &str) -> Result<NodeHandle<P>> {
        self.child(name)
            .ok_or_else(|| Error::NodeMissing(name.to_owned()))
    }

    /// True when a direct child exists under `name`.
    #[must_use]
    pub fn has_child(&self, name: &str) -> bool {
        unsafe {
            (*self.raw())
                .children
                .search(&self.seg, name.as_bytes())
                .is_ok()
        }
    }

    /// Number of direct children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        unsafe { (*self.raw()).children.len() }
    }

    /// Recursive size measure used by diagnostics: each node contributes
    /// one plus its direct child count, summed over the whole subtree.
    #[must_use]
    pub fn count_recursive(&self) -> usize {
        let mut total = self.child_count() + 1;
        for child in self.children() {
            total += child.count_recursive();
        }
        total
    }

    /// Iterate the direct children in case-insensitive name order.
    #[must_use]
    pub fn children(&self) -> Children<P> {
        Children {
            parent: self.clone(),
            idx: 0,
        }
    }

    /// Unlink and return the child stored under `name`.
    ///
    /// The detached subtree stays alive for as long as the returned handle
    /// does.
    pub fn remove_child(&self, name: &str) -> Option<NodeHandle<P>> {
        unsafe {
            let node = self.raw();
            let idx = (*node).children.search(&self.seg, name.as_bytes()).ok()?;
            let mut entry = (*node).children.remove_at(&self.seg, idx);
            entry.key.destroy(&self.seg);
            Some(Self::adopt(Arc::clone(&self.seg), entry.child))
        }
    }

    /// Drop all children.
    pub fn clear_children(&self) {
        unsafe {
            let node = self.raw();
            while !(*node).children.is_empty() {
                let last = (*node).children.len() - 1;
                let mut entry = (*node).children.remove_at(&self.seg, last);
                entry.key.destroy(&self.seg);
                entry.child.release(&self.seg);
            }
        }
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Walk `path` from this node; `None` at the first missing component.
    ///
    /// An empty path finds the node itself.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<NodeHandle<P>> {
        let mut cur = self.clone();
        for comp in components(path) {
            cur = cur.child(comp)?;
        }
        Some(cur)
    }

    /// Like [`NodeHandle::find`], but a missing node is an error.
    pub fn find_or_err(&self, path: &str) -> Result<NodeHandle<P>> {
        self.find(path)
            .ok_or_else(|| Error::NodeMissing(path.to_owned()))
    }

    /// Call `visitor` for each node that exists along `path`, in order,
    /// starting with this node's children. Stops at the first missing
    /// component.
    pub fn visit_path<F>(&self, path: &str, mut visitor: F)
    where
        F: FnMut(&NodeHandle<P>),
    {
        let mut cur = self.clone();
        for comp in components(path) {
            match cur.child(comp) {
                Some(next) => {
                    visitor(&next);
                    cur = next;
                }

                None => break,
            }
        }
    }

    /// All nodes matching a wildcard pattern (`*`, `?`, and the `*/`
    /// one-directory-level form).
    ///
    /// A literal prefix before the first wildcard is resolved with a plain
    /// path walk; the rest matches against this subtree. Results arrive in
    /// depth-first, case-insensitive sibling order.
    #[must_use]
    pub fn glob(&self, pattern: &str) -> Vec<NodeHandle<P>> {
        let mut out = Vec::new();
        match split_fixed_prefix(pattern) {
            Some((prefix, rest)) => {
                if let Some(anchor) = self.find(prefix) {
                    anchor.find_local(&mut out, rest.as_bytes());
                }
            }

            None => self.find_local(&mut out, pattern.as_bytes()),
        }
        out
    }

    /// Match `pattern` against each direct child, recursing into
    /// directories while pattern remains.
    fn find_local(&self, out: &mut Vec<NodeHandle<P>>, pattern: &[u8]) {
        let count = self.child_count();
        for idx in 0..count {
            let (child, matched) = unsafe {
                let node = self.raw();
                if idx >= (*node).children.len() {
                    break;
                }
                let entry = &(*node).children.entries(&self.seg)[idx];
                let child = Self::retain(&self.seg, entry.child);
                let matched = partial_match(entry.key.as_bytes(&self.seg), pattern);
                (child, matched)
            };

            if starts_with_dir_star(pattern) && child.is_directory() {
                // One directory level, not many: strip the star and match
                // the rest inside the child.
                child.find_local(out, &pattern[1..]);
            } else if let Some(consumed) = matched {
                let rest = &pattern[consumed..];
                if remainder_is_hit(rest) {
                    out.push(child.clone());
                }
                if child.is_directory() {
                    child.find_local(out, rest);
                }
            }
        }
        trace_log!(pattern = ?String::from_utf8_lossy(pattern), hits = out.len(), "glob level");
    }

    /// Pretty-print the subtree, one node per line, indentation = depth.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> io::Result<()>
    where
        P: fmt::Debug,
    {
        self.dump_level(out, 0)
    }

    fn dump_level<W: io::Write>(&self, out: &mut W, level: usize) -> io::Result<()>
    where
        P: fmt::Debug,
    {
        writeln!(
            out,
            "{:indent$}{} -> {:?}",
            "",
            self.name(),
            self.data(),
            indent = level
        )?;
        for child in self.children() {
            child.dump_level(out, level + 1)?;
        }
        Ok(())
    }

    /// True when both handles address the same node in the same mapping.
    #[must_use]
    pub fn same_node(&self, other: &NodeHandle<P>) -> bool {
        Arc::ptr_eq(&self.seg, &other.seg) && self.node.ctrl().off() == other.node.ctrl().off()
    }
}

impl<P: Payload> fmt::Debug for NodeHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.name())
            .field("flags", &self.flags())
            .field("children", &self.child_count())
            .finish()
    }
}

impl<P: Payload> PartialEq for NodeHandle<P> {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
    }
}

/// Iterator over direct children, in case-insensitive name order.
pub struct Children<P: Payload> {
    parent: NodeHandle<P>,
    idx: usize,
}

impl<P: Payload> Iterator for Children<P> {
    type Item = NodeHandle<P>;

    fn next(&mut self) -> Option<NodeHandle<P>> {
        unsafe {
            let node = self.parent.raw();
            if self.idx >= (*node).children.len() {
                return None;
            }
            let entry = &(*node).children.entries(self.parent.segment())[self.idx];
            self.idx += 1;
            Some(NodeHandle::retain(self.parent.segment(), entry.child))
        }
    }
}

// ============================================================================
// Insertion (shared with the tree container)
// ============================================================================

/// Walk `path` from `base`, creating dummy directories for missing
/// interior components, and place the terminal node.
///
/// Returns `Ok(None)` when `overwrite` is false and the terminal already
/// exists (the tree is left unchanged), or when the path has no
/// components. Allocation failures unwind cleanly so the caller can grow
/// the segment and retry from scratch.
pub(crate) fn add_node<P: Payload>(
    base: &NodeHandle<P>,
    path: &str,
    source: &P::Source,
    flags: u8,
    overwrite: bool,
) -> std::result::Result<Option<NodeHandle<P>>, AllocError> {
    let mut comps = components(path).peekable();
    let mut cur = base.clone();
    while let Some(comp) = comps.next() {
        if comps.peek().is_none() {
            return add_terminal(&cur, comp, source, flags, overwrite);
        }
        cur = match cur.child(comp) {
            Some(next) => next,

            None => add_dummy_dir(&cur, comp)?,
        };
    }
    Ok(None)
}

/// Create and link an auto-intermediate directory under `parent`.
fn add_dummy_dir<P: Payload>(
    parent: &NodeHandle<P>,
    name: &str,
) -> std::result::Result<NodeHandle<P>, AllocError> {
    let seg = parent.segment().clone();
    unsafe {
        let pnode = parent.raw();
        let idx = match (*pnode).children.search(&seg, name.as_bytes()) {
            // Only reached when the caller just saw the child missing.
            Ok(found) => {
                let entry = &(*pnode).children.entries(&seg)[found];
                return Ok(NodeHandle::retain(&seg, entry.child));
            }

            Err(idx) => idx,
        };
        (*pnode).children.reserve_one(&seg)?;

        let payload = P::create_empty(&seg)?;
        let child = new_node_in(&seg, name.as_bytes(), FLAG_DIRECTORY | FLAG_DUMMY, payload)?;
        (*child.value_ptr(&seg)).parent = (*pnode).self_ref.clone_ref(&seg);

        let key = match ShmString::new_in(&seg, name.as_bytes()) {
            Ok(k) => k,

            Err(e) => {
                child.release(&seg);
                return Err(e);
            }
        };
        (*pnode).children.insert_at(&seg, idx, key, child);
        Ok(NodeHandle::retain(&seg, child))
    }
}

/// Place the terminal node of an insertion under `parent`.
fn add_terminal<P: Payload>(
    parent: &NodeHandle<P>,
    name: &str,
    source: &P::Source,
    flags: u8,
    overwrite: bool,
) -> std::result::Result<Option<NodeHandle<P>>, AllocError> {
    let seg = parent.segment().clone();
    unsafe {
        let pnode = parent.raw();
        match (*pnode).children.search(&seg, name.as_bytes()) {
            Ok(idx) => {
                if !overwrite {
                    return Ok(None);
                }
                // Build the replacement fully before unlinking the old
                // child, so a failed allocation leaves the tree unchanged.
                let payload = P::create_in(&seg, source)?;
                let child = new_node_in(&seg, name.as_bytes(), flags, payload)?;
                (*child.value_ptr(&seg)).parent = (*pnode).self_ref.clone_ref(&seg);
                let old = (*pnode).children.replace_at(&seg, idx, child);
                old.release(&seg);
                Ok(Some(NodeHandle::retain(&seg, child)))
            }

            Err(idx) => {
                (*pnode).children.reserve_one(&seg)?;
                let payload = P::create_in(&seg, source)?;
                let child = new_node_in(&seg, name.as_bytes(), flags, payload)?;
                (*child.value_ptr(&seg)).parent = (*pnode).self_ref.clone_ref(&seg);
                let key = match ShmString::new_in(&seg, name.as_bytes()) {
                    Ok(k) => k,

                    Err(e) => {
                        child.release(&seg);
                        return Err(e);
                    }
                };
                (*pnode).children.insert_at(&seg, idx, key, child);
                Ok(Some(NodeHandle::retain(&seg, child)))
            }
        }
    }
}
