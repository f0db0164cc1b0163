//! The node arena: fixed-size, cache-aligned node records addressed by a
//! 32-bit index, with a free list threaded through the free slots; and the
//! spill arena holding directory child entries past the inline fan-out.
//!
//! A node record is exactly two cache lines. The record is a plain value
//! (`zerocopy`-derived) so the whole arena can be snapshotted and reloaded
//! byte-for-byte. Free slots are recognized by `mode == 0` and reuse the
//! `parent` field as the free-list link, so no allocation metadata needs
//! to be persisted: the chain is rebuilt by a scan on load.

use std::cell::UnsafeCell;

use hashbrown::HashMap;
use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{FsError, Result};
use crate::param::{INLINE_CHILDREN, NODE_SIZE, NO_INDEX, NO_OFFSET};

/// One directory entry: the edge name (interned) and the child's node
/// index. The name lives on the entry, not the node, because a node
/// hardlinked under two names has no single authoritative name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChildEnt {
    pub name_off: u32,
    pub idx: u32,
}

/// The node record. 64-bit fields first so the layout carries no padding.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Node {
    pub ino: u64,
    pub size: u64,
    pub atime_ns: u64,
    pub mtime_ns: u64,
    pub ctime_ns: u64,

    /// Parent index; `NO_INDEX` for the root. Free slots reuse this field
    /// as the free-list link.
    pub parent: u32,
    /// Primary name offset; the authoritative name of a directory entry
    /// is the one on the `ChildEnt`.
    pub name_off: u32,
    /// Type and permission bits (`S_IFMT` layout). Zero marks a free slot.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,

    /// Head of the xattr chain in the string arena; `NO_OFFSET` for none.
    pub xattr_off: u32,
    /// Spill chunk holding the child entries once they outgrow the inline
    /// array; `NO_OFFSET` while inline.
    pub spill_off: u32,
    pub spill_cap: u32,
    pub nchildren: u32,

    pub children: [ChildEnt; INLINE_CHILDREN],
}

const_assert_eq!(std::mem::size_of::<Node>(), NODE_SIZE);
const_assert_eq!(std::mem::size_of::<ChildEnt>(), 8);

impl Node {
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    /// Initializes a freshly allocated record.
    pub fn init(&mut self, ino: u64, parent: u32, name_off: u32, mode: u32, uid: u32, gid: u32, ts: u64) {
        *self = Node::new_zeroed();
        self.ino = ino;
        self.parent = parent;
        self.name_off = name_off;
        self.mode = mode;
        self.uid = uid;
        self.gid = gid;
        self.atime_ns = ts;
        self.mtime_ns = ts;
        self.ctime_ns = ts;
        self.xattr_off = NO_OFFSET;
        self.spill_off = NO_OFFSET;
    }
}

struct NodeAlloc {
    free_head: u32,
    /// Bump watermark: slots at or beyond this index have never been used.
    high: u32,
    in_use: u32,
}

pub struct NodeArena {
    slots: Box<[UnsafeCell<Node>]>,
    alloc: Mutex<NodeAlloc>,
}

// SAFETY: slot access goes through the unsafe accessors, whose callers
// uphold the per-node locking discipline; allocation state is behind a
// mutex.
unsafe impl Sync for NodeArena {}

impl NodeArena {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(Node::new_zeroed())).collect(),
            alloc: Mutex::new(NodeAlloc {
                free_head: NO_INDEX,
                high: 0,
                in_use: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn in_use(&self) -> u32 {
        self.alloc.lock().in_use
    }

    /// Highest slot index ever allocated plus one; the snapshot extent.
    pub fn high(&self) -> u32 {
        self.alloc.lock().high
    }

    /// Shared view of a node record.
    ///
    /// # Safety
    ///
    /// `idx` must be an allocated slot and the caller must hold at least a
    /// read lock on it (or be single-threaded, as during recovery).
    pub unsafe fn node(&self, idx: u32) -> &Node {
        debug_assert!((idx as usize) < self.slots.len());
        &*self.slots[idx as usize].get()
    }

    /// Exclusive view of a node record.
    ///
    /// # Safety
    ///
    /// `idx` must be an allocated slot and the caller must hold its write
    /// lock (or be single-threaded).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn node_mut(&self, idx: u32) -> &mut Node {
        debug_assert!((idx as usize) < self.slots.len());
        &mut *self.slots[idx as usize].get()
    }

    /// Allocates a slot, reusing the free list first. The returned record
    /// is zeroed with a sentinel parent.
    pub fn alloc(&self) -> Result<u32> {
        let mut a = self.alloc.lock();
        let idx = if a.free_head != NO_INDEX {
            let idx = a.free_head;
            // SAFETY: free slots are only touched under the alloc mutex.
            a.free_head = unsafe { self.node(idx) }.parent;
            idx
        } else if a.high < self.capacity() {
            a.high += 1;
            a.high - 1
        } else {
            return Err(FsError::Capacity);
        };
        a.in_use += 1;
        // SAFETY: the slot just left the free list; nothing else can see it.
        let n = unsafe { self.node_mut(idx) };
        *n = Node::new_zeroed();
        n.parent = NO_INDEX;
        Ok(idx)
    }

    /// Allocates a specific slot. Used by WAL replay, which must land
    /// records on the indices the original operation chose. Single-threaded.
    pub fn alloc_at(&self, idx: u32) -> Result<()> {
        if idx >= self.capacity() {
            return Err(FsError::Corrupt);
        }
        let mut a = self.alloc.lock();
        while a.high <= idx {
            let i = a.high;
            a.high += 1;
            // SAFETY: fresh slot, nothing else can see it.
            let n = unsafe { self.node_mut(i) };
            *n = Node::new_zeroed();
            n.parent = a.free_head;
            a.free_head = i;
        }
        // Unlink idx from the free chain.
        let mut prev = NO_INDEX;
        let mut cur = a.free_head;
        while cur != NO_INDEX {
            // SAFETY: free slots, alloc mutex held.
            let next = unsafe { self.node(cur) }.parent;
            if cur == idx {
                if prev == NO_INDEX {
                    a.free_head = next;
                } else {
                    unsafe { self.node_mut(prev) }.parent = next;
                }
                a.in_use += 1;
                let n = unsafe { self.node_mut(idx) };
                *n = Node::new_zeroed();
                n.parent = NO_INDEX;
                return Ok(());
            }
            prev = cur;
            cur = next;
        }
        // Not free: the slot is already in use.
        Err(FsError::Corrupt)
    }

    /// Retires a slot to the free list.
    ///
    /// The caller must guarantee nothing references the node any more
    /// (link count zero, no open handles, no directory entry).
    pub fn free(&self, idx: u32) {
        let mut a = self.alloc.lock();
        // SAFETY: caller guarantees exclusivity; the slot is leaving use.
        let n = unsafe { self.node_mut(idx) };
        *n = Node::new_zeroed();
        n.parent = a.free_head;
        a.free_head = idx;
        a.in_use -= 1;
    }

    /// Replaces the whole arena with a densely packed record sequence,
    /// as produced by rebalance. Slots past the sequence are zeroed and
    /// the allocator restarts from a clean bump state.
    ///
    /// # Safety
    ///
    /// Caller must have quiesced mutations (filesystem-wide lock held).
    pub unsafe fn install(&self, nodes: &[Node]) {
        let mut a = self.alloc.lock();
        debug_assert!(nodes.len() <= self.slots.len());
        for (i, n) in nodes.iter().enumerate() {
            *self.node_mut(i as u32) = *n;
        }
        for i in nodes.len() as u32..a.high {
            *self.node_mut(i) = Node::new_zeroed();
        }
        *a = NodeAlloc {
            free_head: NO_INDEX,
            high: nodes.len() as u32,
            in_use: nodes.len() as u32,
        };
    }

    /// All slots up to the watermark, as snapshot bytes.
    ///
    /// # Safety
    ///
    /// Caller must have quiesced mutations (filesystem-wide lock held).
    pub unsafe fn snapshot(&self) -> &[u8] {
        let high = self.alloc.lock().high as usize;
        // UnsafeCell<Node> is layout-compatible with Node.
        let nodes = std::slice::from_raw_parts(self.slots.as_ptr() as *const Node, high);
        nodes.as_bytes()
    }

    /// Reloads the arena from snapshot bytes and rebuilds the free list
    /// by scanning for free slots.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() % NODE_SIZE != 0 || bytes.len() / NODE_SIZE > self.slots.len() {
            return Err(FsError::Corrupt);
        }
        let n = bytes.len() / NODE_SIZE;
        let mut free_head = NO_INDEX;
        let mut in_use = 0;
        for i in 0..n {
            let mut node = Node::read_from_bytes(&bytes[i * NODE_SIZE..(i + 1) * NODE_SIZE])
                .map_err(|_| FsError::Corrupt)?;
            if node.is_free() {
                node = Node::new_zeroed();
                node.parent = free_head;
                free_head = i as u32;
            } else {
                in_use += 1;
            }
            *self.slots[i].get_mut() = node;
        }
        *self.alloc.lock() = NodeAlloc {
            free_head,
            high: n as u32,
            in_use,
        };
        Ok(())
    }
}

/// Spill chunk header, packed into one entry slot: `name_off` holds the
/// chunk capacity in entries, `idx` holds the in-use flag.
const CHUNK_USED: u32 = 1;
const CHUNK_FREE: u32 = 0;

struct SpillAlloc {
    /// Bump watermark in entry slots. Slot 0 is the "none" sentinel.
    bump: u32,
    /// Free chunks by capacity class.
    free: HashMap<u32, Vec<u32>>,
}

/// Directory child entries past the inline fan-out live here, as chunks of
/// `ChildEnt` slots: one header slot followed by `cap` entry slots.
pub struct SpillArena {
    slots: Box<[UnsafeCell<ChildEnt>]>,
    alloc: Mutex<SpillAlloc>,
}

// SAFETY: chunk contents are guarded by the owning directory's node lock;
// allocation state is behind a mutex.
unsafe impl Sync for SpillArena {}

impl SpillArena {
    pub fn new(capacity_slots: u32) -> Self {
        Self {
            slots: (0..capacity_slots)
                .map(|_| UnsafeCell::new(ChildEnt { name_off: 0, idx: 0 }))
                .collect(),
            alloc: Mutex::new(SpillAlloc {
                bump: 1,
                free: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    unsafe fn slot(&self, i: u32) -> &ChildEnt {
        &*self.slots[i as usize].get()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, i: u32) -> &mut ChildEnt {
        &mut *self.slots[i as usize].get()
    }

    /// Allocates a chunk of `cap` entries, returning its offset (the
    /// header slot index).
    pub fn alloc(&self, cap: u32) -> Result<u32> {
        let mut a = self.alloc.lock();
        let off = if let Some(off) = a.free.get_mut(&cap).and_then(Vec::pop) {
            off
        } else {
            let off = a.bump;
            let end = off.checked_add(1 + cap).ok_or(FsError::Capacity)?;
            if end > self.capacity() {
                return Err(FsError::Capacity);
            }
            a.bump = end;
            off
        };
        // SAFETY: the chunk just left the allocator; nothing else sees it.
        unsafe {
            *self.slot_mut(off) = ChildEnt { name_off: cap, idx: CHUNK_USED };
            for i in 0..cap {
                *self.slot_mut(off + 1 + i) = ChildEnt { name_off: 0, idx: 0 };
            }
        }
        Ok(off)
    }

    /// Returns a chunk to its capacity-class free list.
    ///
    /// # Safety
    ///
    /// The caller must hold the owning directory's write lock and drop all
    /// references into the chunk.
    pub unsafe fn free(&self, off: u32) {
        let cap = self.slot(off).name_off;
        self.slot_mut(off).idx = CHUNK_FREE;
        self.alloc.lock().free.entry(cap).or_default().push(off);
    }

    /// Capacity of the chunk at `off`.
    ///
    /// # Safety
    ///
    /// `off` must be a live chunk; caller holds the owning node's lock.
    pub unsafe fn chunk_cap(&self, off: u32) -> u32 {
        self.slot(off).name_off
    }

    /// The first `n` entries of the chunk at `off`.
    ///
    /// # Safety
    ///
    /// `off` must be a live chunk of capacity >= n and the caller must
    /// hold at least a read lock on the owning directory.
    pub unsafe fn entries(&self, off: u32, n: u32) -> &[ChildEnt] {
        debug_assert!(n <= self.chunk_cap(off));
        std::slice::from_raw_parts(self.slots[(off + 1) as usize].get(), n as usize)
    }

    /// Mutable view of the chunk's entry slots, full capacity.
    ///
    /// # Safety
    ///
    /// As [`Self::entries`], but the caller must hold the owning
    /// directory's write lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn entries_mut(&self, off: u32) -> &mut [ChildEnt] {
        let cap = self.chunk_cap(off);
        std::slice::from_raw_parts_mut(self.slots[(off + 1) as usize].get(), cap as usize)
    }

    /// Drops every chunk, for a rebuild during rebalance.
    ///
    /// # Safety
    ///
    /// Caller must have quiesced mutations and forgotten all chunk
    /// offsets (rebalance rewrites them).
    pub unsafe fn reset(&self) {
        *self.alloc.lock() = SpillAlloc {
            bump: 1,
            free: HashMap::new(),
        };
    }

    /// Snapshot bytes up to the bump watermark.
    ///
    /// # Safety
    ///
    /// Caller must have quiesced mutations.
    pub unsafe fn snapshot(&self) -> &[u8] {
        let bump = self.alloc.lock().bump as usize;
        let ents = std::slice::from_raw_parts(self.slots.as_ptr() as *const ChildEnt, bump);
        ents.as_bytes()
    }

    /// Reloads from snapshot bytes, rebuilding the free lists with a
    /// chunk walk.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let ent = std::mem::size_of::<ChildEnt>();
        if bytes.len() % ent != 0 || bytes.len() / ent > self.slots.len() {
            return Err(FsError::Corrupt);
        }
        let n = (bytes.len() / ent) as u32;
        for i in 0..n as usize {
            *self.slots[i].get_mut() = ChildEnt::read_from_bytes(&bytes[i * ent..(i + 1) * ent])
                .map_err(|_| FsError::Corrupt)?;
        }
        let mut free: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut pos = 1;
        while pos < n {
            let hdr = *self.slots[pos as usize].get_mut();
            let cap = hdr.name_off;
            if cap == 0 || pos + 1 + cap > n {
                return Err(FsError::Corrupt);
            }
            if hdr.idx == CHUNK_FREE {
                free.entry(cap).or_default().push(pos);
            }
            pos += 1 + cap;
        }
        *self.alloc.lock() = SpillAlloc { bump: n.max(1), free };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_record_is_two_cache_lines() {
        assert_eq!(std::mem::size_of::<Node>(), 128);
    }

    #[test]
    fn alloc_reuses_freed_slots() {
        let a = NodeArena::new(8);
        let x = a.alloc().unwrap();
        let y = a.alloc().unwrap();
        assert_ne!(x, y);
        a.free(x);
        assert_eq!(a.alloc().unwrap(), x);
        assert_eq!(a.in_use(), 2);
    }

    #[test]
    fn alloc_fails_at_capacity() {
        let a = NodeArena::new(2);
        a.alloc().unwrap();
        a.alloc().unwrap();
        assert!(matches!(a.alloc(), Err(FsError::Capacity)));
    }

    #[test]
    fn alloc_at_pins_replayed_indices() {
        let a = NodeArena::new(8);
        a.alloc_at(3).unwrap();
        // Slot 3 is now taken.
        assert!(matches!(a.alloc_at(3), Err(FsError::Corrupt)));
        // 0..3 went to the free list and are handed out again.
        let got = a.alloc().unwrap();
        assert!(got < 3);
    }

    #[test]
    fn snapshot_roundtrip_preserves_records_and_free_list() {
        let a = NodeArena::new(8);
        let x = a.alloc().unwrap();
        let y = a.alloc().unwrap();
        unsafe {
            a.node_mut(x).init(7, NO_INDEX, 0, libc::S_IFDIR | 0o755, 0, 0, 1);
            a.node_mut(y).init(8, x, 0, libc::S_IFREG | 0o644, 0, 0, 1);
        }
        a.free(x);
        let snap = unsafe { a.snapshot() }.to_vec();

        let mut b = NodeArena::new(8);
        b.load(&snap).unwrap();
        assert_eq!(b.in_use(), 1);
        assert_eq!(unsafe { b.node(y) }.ino, 8);
        // The freed slot comes back first.
        assert_eq!(b.alloc().unwrap(), x);
    }

    #[test]
    fn spill_chunks_roundtrip() {
        let s = SpillArena::new(64);
        let c1 = s.alloc(4).unwrap();
        let c2 = s.alloc(8).unwrap();
        unsafe {
            s.entries_mut(c1)[0] = ChildEnt { name_off: 44, idx: 5 };
            s.free(c2);
        }
        let snap = unsafe { s.snapshot() }.to_vec();

        let mut t = SpillArena::new(64);
        t.load(&snap).unwrap();
        assert_eq!(unsafe { t.entries(c1, 1) }[0], ChildEnt { name_off: 44, idx: 5 });
        // The freed chunk is found again by the walk.
        assert_eq!(t.alloc(8).unwrap(), c2);
    }
}
