//! The filesystem engine. Five layers, leaves first:
//!
//!   + Arenas: interned strings, node records, child spill, data blocks.
//!   + Log: write-ahead records with crash recovery for every mutation.
//!   + Tree: directory hierarchy with sorted child vectors.
//!   + Attributes: stat fields, hardlinks, extended attributes.
//!   + Handle: the public operations the filesystem bridge calls.
//!
//! The bridge holds a [`RazorFs`] handle and threads it through every
//! call; the engine holds no process-wide state beyond what the handle
//! references. Inputs and results are value types; no engine-owned
//! pointers escape.
//!
//! Every mutating operation follows the same transaction shape: acquire
//! the node locks (ascending index order), validate, reserve arena space,
//! append BEGIN and the redo records, mutate the in-memory arenas, append
//! COMMIT and flush. A failure after mutation rolls the arenas back in
//! LIFO order and leaves the transaction uncommitted for recovery to
//! discard. Node retirement (frees) happens only after a successful
//! flush, so rollback never has to resurrect a freed slot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ::log::{debug, error, info, warn};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use parking_lot::Mutex;

use crate::arena::{NodeArena, SpillArena, StringArena};
use crate::error::{FsError, Result};
use crate::lock::{LockTable, MAX_LOCK_SET};
use crate::param::{now_ns, Config, NO_INDEX, NO_OFFSET, ROOT_IDX, ROOT_INO};

pub mod data;
pub mod inode;
pub(crate) mod log;
pub mod path;
pub(crate) mod recovery;
pub(crate) mod tree;
pub mod xattr;

use self::log::{payload, RecordType, Wal};
use data::BlockStore;
use inode::InodeTable;
use path::{FileName, Path};
use tree::TreeCtx;

pub use xattr::{Namespace, XattrFlags};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenameFlags: u32 {
        /// Fail with `ErrExists` instead of replacing the destination.
        const NOREPLACE = 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetattrMask: u32 {
        const MODE = 1;
        const UID = 2;
        const GID = 4;
        const SIZE = 8;
        const ATIME = 16;
        const MTIME = 32;
        const CTIME = 64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
}

impl FileType {
    fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => Self::Directory,
            libc::S_IFLNK => Self::Symlink,
            _ => Self::Regular,
        }
    }
}

/// Stat-shaped attribute snapshot. Timestamps are nanoseconds since the
/// Unix epoch.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub ino: u64,
    pub mode: u32,
    pub kind: FileType,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_ns: u64,
    pub mtime_ns: u64,
    pub ctime_ns: u64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub name: Vec<u8>,
    pub kind: FileType,
}

/// Attribute changes for `setattr`; absent fields are untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Setattr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime_ns: Option<u64>,
    pub mtime_ns: Option<u64>,
    pub ctime_ns: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Statfs {
    pub block_size: u32,
    pub blocks_total: u32,
    pub blocks_used: u32,
    pub nodes_total: u32,
    pub nodes_used: u32,
    pub strings_capacity: u32,
    pub strings_used: u32,
    pub inodes: u64,
}

/// The engine handle returned by `mount`.
pub struct RazorFs {
    pub(crate) cfg: Config,
    pub(crate) strings: StringArena,
    pub(crate) nodes: NodeArena,
    pub(crate) spill: SpillArena,
    pub(crate) data: BlockStore,
    pub(crate) itable: Mutex<InodeTable>,
    pub(crate) locks: LockTable,
    pub(crate) wal: Mutex<Wal>,
    mutations: AtomicU32,
    closed: AtomicBool,
}

impl RazorFs {
    /// Opens or creates the filesystem: loads the active snapshot
    /// generation, replays the WAL, verifies the invariants, writes a
    /// fresh checkpoint and returns the handle.
    pub fn mount(cfg: Config) -> Result<Self> {
        if !cfg.block_size.is_power_of_two() || !(512..=32768).contains(&cfg.block_size) {
            return Err(FsError::Invalid);
        }
        if cfg.max_name_len == 0 || cfg.max_name_len > 4096 {
            return Err(FsError::Invalid);
        }
        std::fs::create_dir_all(&cfg.region_dir)?;

        let mut strings = StringArena::new(cfg.string_capacity());
        let mut nodes = NodeArena::new(cfg.node_slots());
        let mut spill = SpillArena::new(cfg.spill_slots());
        let mut data = BlockStore::new(cfg.data_slots(), cfg.block_size, cfg.compress_threshold);
        let mut itable = InodeTable::new();

        let fresh_root = |nodes: &mut NodeArena, itable: &mut InodeTable| -> Result<()> {
            let root = nodes.alloc()?;
            debug_assert_eq!(root, ROOT_IDX);
            // SAFETY: single-threaded during mount.
            unsafe {
                let n = nodes.node_mut(root);
                n.init(ROOT_INO, NO_INDEX, NO_OFFSET, libc::S_IFDIR | 0o755, 0, 0, now_ns());
                n.nlink = 2;
            }
            itable.link(ROOT_INO, root);
            Ok(())
        };

        let wal = if cfg.wal_path.exists() {
            let (wal, records) = Wal::open(&cfg.wal_path, cfg.wal_size_limit)?;
            if recovery::region_path(&cfg, "nodes", wal.active_gen()).exists() {
                info!(
                    "mount: recovering from generation {} with {} log records",
                    wal.active_gen(),
                    records.len()
                );
                recovery::load_snapshot(&cfg, wal.active_gen(), &mut strings, &mut nodes, &mut spill, &mut data)?;
                recovery::rebuild_itable(&nodes, &mut itable)?;
                let ctx = TreeCtx { nodes: &nodes, strings: &strings, spill: &spill };
                recovery::replay(&cfg, &records, ctx, &data, &mut itable)?;
                recovery::sweep_unreferenced(ctx, &data, &mut itable);
                recovery::check(ctx, &data, &itable)?;
            } else if records.is_empty() {
                // Crashed between creating the log and the first
                // checkpoint of a brand-new filesystem: nothing was ever
                // committed, so start over.
                fresh_root(&mut nodes, &mut itable)?;
            } else {
                error!("mount: log has records but no snapshot to replay onto");
                return Err(FsError::Corrupt);
            }
            wal
        } else {
            fresh_root(&mut nodes, &mut itable)?;
            Wal::create(&cfg.wal_path, cfg.wal_size_limit)?
        };

        let fs = Self {
            locks: LockTable::new(nodes.capacity()),
            strings,
            nodes,
            spill,
            data,
            itable: Mutex::new(itable),
            wal: Mutex::new(wal),
            mutations: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            cfg,
        };
        fs.checkpoint()?;
        Ok(fs)
    }

    /// Quiesces mutations, checkpoints, flushes the arenas and closes.
    pub fn unmount(self) -> Result<()> {
        self.checkpoint()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn ctx(&self) -> TreeCtx<'_> {
        TreeCtx {
            nodes: &self.nodes,
            strings: &self.strings,
            spill: &self.spill,
        }
    }

    fn region_path(&self, section: &str, gen: u8) -> PathBuf {
        recovery::region_path(&self.cfg, section, gen)
    }

    /// Resolves an inode to its node index and takes the node's read
    /// lock, re-checking the mapping against concurrent retirement.
    fn locked_read(&self, ino: u64) -> Result<(u32, crate::lock::NodeReadGuard<'_>)> {
        loop {
            let idx = self.itable.lock().lookup_by_inode(ino)?;
            let g = self.locks.read(idx);
            if self.itable.lock().lookup_by_inode(ino).ok() == Some(idx) {
                return Ok((idx, g));
            }
        }
    }

    /// As `locked_read`, write mode.
    fn locked_write(&self, ino: u64) -> Result<(u32, crate::lock::NodeWriteGuard<'_>)> {
        loop {
            let idx = self.itable.lock().lookup_by_inode(ino)?;
            let g = self.locks.write(idx);
            if self.itable.lock().lookup_by_inode(ino).ok() == Some(idx) {
                return Ok((idx, g));
            }
        }
    }

    /// Attribute snapshot. Caller holds at least a read lock on `idx`.
    unsafe fn attr_of(&self, idx: u32) -> Attr {
        let n = self.nodes.node(idx);
        Attr {
            ino: n.ino,
            mode: n.mode,
            kind: FileType::from_mode(n.mode),
            nlink: n.nlink,
            uid: n.uid,
            gid: n.gid,
            size: n.size,
            atime_ns: n.atime_ns,
            mtime_ns: n.mtime_ns,
            ctime_ns: n.ctime_ns,
        }
    }

    fn check_link_name<'n>(&self, name: &'n [u8]) -> Result<&'n FileName> {
        let name = FileName::new(name, self.cfg.max_name_len)?;
        if name.is_dot() || name.is_dotdot() {
            return Err(FsError::Invalid);
        }
        Ok(name)
    }

    /// Retires a node whose link count hit zero, unless open handles keep
    /// it alive, in which case it is parked until the last release.
    ///
    /// # Safety
    ///
    /// Caller holds the node's write lock and has already committed the
    /// unlink that drove the link count to zero.
    unsafe fn retire_if_unreferenced(&self, idx: u32) {
        let node = self.nodes.node(idx);
        if node.nlink != 0 {
            return;
        }
        let ino = node.ino;
        let mut it = self.itable.lock();
        if it.open_count(idx) > 0 {
            it.park_orphan(idx);
            return;
        }
        it.unlink(ino);
        drop(it);
        self.data.free_blocks(ino, 0);
        self.nodes.free(idx);
    }

    // ------------------------------------------------------------------
    // Read-side operations.

    pub fn getattr(&self, ino: u64) -> Result<Attr> {
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_read(ino)?;
        // SAFETY: read lock held.
        Ok(unsafe { self.attr_of(idx) })
    }

    pub fn lookup(&self, parent: u64, name: &[u8]) -> Result<u64> {
        let name = FileName::new(name, self.cfg.max_name_len)?;
        let _t = self.locks.tree.read();
        let (pidx, _g) = self.locked_read(parent)?;
        // SAFETY: parent read lock held.
        let cidx = unsafe {
            if name.is_dot() {
                pidx
            } else if name.is_dotdot() {
                let p = self.nodes.node(pidx).parent;
                if p == NO_INDEX { pidx } else { p }
            } else {
                tree::lookup(self.ctx(), pidx, name.as_bytes())?
            }
        };
        self.itable.lock().lookup_by_index(cidx)
    }

    /// Directory listing from an opaque cursor. `.` and `..` are
    /// synthesized as the first two entries. Iteration is stable across
    /// concurrent non-structural mutations; entries added or removed
    /// during iteration may or may not appear.
    pub fn readdir(&self, ino: u64, cursor: u64) -> Result<(Vec<DirEntry>, u64)> {
        let _t = self.locks.tree.read();
        // Snapshot names and inode numbers under the directory's read
        // lock; each entry's type is then filled in under a brief lock on
        // that child, never while the parent's lock is held.
        let (snapshot, parent_ino) = {
            let (idx, _g) = self.locked_read(ino)?;
            // SAFETY: read lock held.
            unsafe {
                let node = self.nodes.node(idx);
                if !node.is_dir() {
                    return Err(FsError::NotDir);
                }
                let it = self.itable.lock();
                let pino = if node.parent == NO_INDEX {
                    ino
                } else {
                    it.lookup_by_index(node.parent)?
                };
                let mut snap = Vec::new();
                for ent in tree::child_slice(self.ctx(), idx) {
                    snap.push((
                        it.lookup_by_index(ent.idx)?,
                        self.strings.get_str(ent.name_off)?.to_vec(),
                    ));
                }
                (snap, pino)
            }
        };

        let mut out = Vec::new();
        let mut pos = cursor;
        if pos == 0 {
            out.push(DirEntry { ino, name: b".".to_vec(), kind: FileType::Directory });
            pos = 1;
        }
        if pos == 1 {
            out.push(DirEntry { ino: parent_ino, name: b"..".to_vec(), kind: FileType::Directory });
            pos = 2;
        }
        for (child_ino, name) in snapshot.into_iter().skip(pos as usize - 2) {
            pos += 1;
            match self.locked_read(child_ino) {
                // SAFETY: the child's read lock is held.
                Ok((cidx, _cg)) => out.push(DirEntry {
                    ino: child_ino,
                    name,
                    kind: FileType::from_mode(unsafe { self.nodes.node(cidx).mode }),
                }),
                // Unlinked while we iterated; entries removed during
                // iteration may or may not appear.
                Err(_) => continue,
            }
        }
        Ok((out, pos))
    }

    /// Path resolution with try-lock coupling: at most two node locks are
    /// held at a time, and contention restarts the walk from the root
    /// rather than blocking (see the lock module).
    pub fn resolve(&self, path_bytes: &[u8]) -> Result<u64> {
        let path = Path::new(path_bytes)?;
        let _t = self.locks.tree.read();
        'restart: loop {
            let mut cur = ROOT_IDX;
            let mut guard = match self.locks.try_read(cur) {
                Some(g) => g,
                None => {
                    std::thread::yield_now();
                    continue 'restart;
                }
            };
            let mut rest = path;
            while let Some((next_rest, comp)) = rest.next_component() {
                rest = next_rest;
                let name = FileName::new(comp, self.cfg.max_name_len)?;
                // SAFETY: cur's read lock is held.
                let next = unsafe {
                    if name.is_dot() {
                        cur
                    } else if name.is_dotdot() {
                        let p = self.nodes.node(cur).parent;
                        if p == NO_INDEX { cur } else { p }
                    } else {
                        tree::lookup(self.ctx(), cur, name.as_bytes())?
                    }
                };
                if next == cur {
                    continue;
                }
                let next_guard = match self.locks.try_read(next) {
                    Some(g) => g,
                    None => {
                        drop(guard);
                        std::thread::yield_now();
                        continue 'restart;
                    }
                };
                drop(guard);
                cur = next;
                guard = next_guard;
            }
            let ino = self.itable.lock().lookup_by_index(cur)?;
            return Ok(ino);
        }
    }

    pub fn read(&self, ino: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_read(ino)?;
        // SAFETY: read lock held; block bytes are guarded by it.
        unsafe {
            let node = self.nodes.node(idx);
            if node.is_dir() {
                return Err(FsError::IsDir);
            }
            let size = node.size;
            if offset >= size || len == 0 {
                return Ok(Vec::new());
            }
            let end = size.min(offset + len as u64);
            let bs = self.data.block_size() as u64;
            let mut out = Vec::with_capacity((end - offset) as usize);
            let mut pos = offset;
            while pos < end {
                let blk = (pos / bs) as u32;
                let in_blk = (pos % bs) as usize;
                let n = ((bs as usize) - in_blk).min((end - pos) as usize);
                match self.data.read_block(node.ino, blk)? {
                    Some(block) => out.extend_from_slice(&block[in_blk..in_blk + n]),
                    None => out.resize(out.len() + n, 0),
                }
                pos += n as u64;
            }
            Ok(out)
        }
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>> {
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_read(ino)?;
        // SAFETY: read lock held.
        let (size, is_link) = unsafe {
            let n = self.nodes.node(idx);
            (n.size, n.is_symlink())
        };
        if !is_link {
            return Err(FsError::Invalid);
        }
        drop(_g);
        drop(_t);
        self.read(ino, 0, size as u32)
    }

    pub fn statfs(&self) -> Statfs {
        Statfs {
            block_size: self.data.block_size(),
            blocks_total: self.data.slot_count(),
            blocks_used: self.data.slots_in_use(),
            nodes_total: self.nodes.capacity(),
            nodes_used: self.nodes.in_use(),
            strings_capacity: self.strings.capacity(),
            strings_used: self.strings.used(),
            inodes: self.itable.lock().len() as u64,
        }
    }

    /// Full invariant pass over the tree, as run after recovery.
    pub fn fsck(&self) -> Result<()> {
        let _t = self.locks.tree.write();
        recovery::check(self.ctx(), &self.data, &self.itable.lock())
    }

    // ------------------------------------------------------------------
    // Open-handle tracking.

    pub fn open(&self, ino: u64) -> Result<()> {
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_read(ino)?;
        self.itable.lock().incref(idx);
        Ok(())
    }

    pub fn release(&self, ino: u64) -> Result<()> {
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_write(ino)?;
        let gone = {
            let mut it = self.itable.lock();
            it.decref(idx) == 0 && it.is_orphan(idx)
        };
        if gone {
            // SAFETY: write lock held; the unlink that orphaned the node
            // committed long ago.
            unsafe {
                let node_ino = self.nodes.node(idx).ino;
                self.itable.lock().unlink(node_ino);
                self.data.free_blocks(node_ino, 0);
                self.nodes.free(idx);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutating operations.

    pub fn create(&self, parent: u64, name: &[u8], mode: u32, uid: u32, gid: u32) -> Result<u64> {
        self.create_node(parent, name, libc::S_IFREG | (mode & 0o7777), uid, gid, None)
    }

    pub fn mkdir(&self, parent: u64, name: &[u8], mode: u32, uid: u32, gid: u32) -> Result<u64> {
        self.create_node(parent, name, libc::S_IFDIR | (mode & 0o7777), uid, gid, None)
    }

    pub fn symlink(&self, parent: u64, name: &[u8], target: &[u8], uid: u32, gid: u32) -> Result<u64> {
        if target.is_empty() || target.len() > self.cfg.block_size as usize * 16 {
            return Err(FsError::Invalid);
        }
        self.create_node(parent, name, libc::S_IFLNK | 0o777, uid, gid, Some(target))
    }

    /// Shared create/mkdir/symlink path. A symlink's target bytes are
    /// stored through the block store inside the same transaction.
    fn create_node(
        &self,
        parent: u64,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        link_target: Option<&[u8]>,
    ) -> Result<u64> {
        let name = self.check_link_name(name)?;
        let ts = now_ns();
        let _t = self.locks.tree.read();
        let (pidx, _pg) = self.locked_write(parent)?;
        let ctx = self.ctx();

        // SAFETY: parent write lock held for the whole critical section.
        let ino = unsafe {
            if !self.nodes.node(pidx).is_dir() {
                return Err(FsError::NotDir);
            }
            match tree::lookup(ctx, pidx, name.as_bytes()) {
                Ok(_) => return Err(FsError::Exists),
                Err(FsError::NotFound) => {}
                Err(e) => return Err(e),
            }

            // Reservations, all fallible before anything becomes visible.
            let name_off = self.strings.intern(name.as_bytes())?;
            let cidx = self.nodes.alloc()?;
            let ino = self.itable.lock().allocate_inode();

            // Redo records first.
            let mut w = self.wal.lock();
            let rtype = if mode & libc::S_IFMT == libc::S_IFDIR {
                RecordType::Mkdir
            } else {
                RecordType::Create
            };
            let begun: Result<u64> = (|| {
                let tx = w.begin(ino, ts)?;
                w.append(
                    rtype,
                    tx,
                    ino,
                    ts,
                    &payload::Create {
                        parent: pidx,
                        child: cidx,
                        mode,
                        uid,
                        gid,
                        name: name.as_bytes().to_vec(),
                    }
                    .encode(),
                )?;
                if let Some(target) = link_target {
                    for (off, chunk) in chunk_blocks(target, self.data.block_size()) {
                        w.append(
                            RecordType::Write,
                            tx,
                            ino,
                            ts,
                            &payload::Write { offset: off, data: chunk.to_vec() }.encode(),
                        )?;
                    }
                }
                Ok(tx)
            })();
            let tx = match begun {
                Ok(tx) => tx,
                Err(e) => {
                    self.nodes.free(cidx);
                    return Err(e);
                }
            };
            drop(w);

            // Apply.
            {
                let n = self.nodes.node_mut(cidx);
                n.init(ino, pidx, name_off, mode, uid, gid, ts);
                n.nlink = if n.is_dir() { 2 } else { 1 };
            }
            if let Err(e) = tree::insert_child(ctx, pidx, name_off, cidx) {
                self.nodes.free(cidx);
                self.wal.lock().abort(tx);
                return Err(e);
            }
            let mut applied_target = false;
            if let Some(target) = link_target {
                match apply_write(&self.nodes, &self.data, cidx, 0, target, ts) {
                    Ok(()) => applied_target = true,
                    Err(e) => {
                        let _ = tree::remove_child(ctx, pidx, name.as_bytes());
                        self.nodes.free(cidx);
                        self.wal.lock().abort(tx);
                        return Err(e);
                    }
                }
            }
            self.itable.lock().link(ino, cidx);
            let saved_parent = {
                let p = self.nodes.node_mut(pidx);
                let saved = (p.nlink, p.mtime_ns, p.ctime_ns);
                if mode & libc::S_IFMT == libc::S_IFDIR {
                    p.nlink += 1;
                }
                p.mtime_ns = ts;
                p.ctime_ns = ts;
                saved
            };

            // Commit: the operation is not done until this flush returns.
            if let Err(e) = self.wal.lock().commit(tx, ino, ts) {
                // LIFO rollback.
                let p = self.nodes.node_mut(pidx);
                (p.nlink, p.mtime_ns, p.ctime_ns) = saved_parent;
                self.itable.lock().unlink(ino);
                if applied_target {
                    self.data.free_blocks(ino, 0);
                }
                let _ = tree::remove_child(ctx, pidx, name.as_bytes());
                self.nodes.free(cidx);
                self.wal.lock().abort(tx);
                return Err(e);
            }
            ino
        };

        drop(_pg);
        drop(_t);
        self.after_mutation();
        Ok(ino)
    }

    pub fn link(&self, ino: u64, new_parent: u64, new_name: &[u8]) -> Result<()> {
        let name = self.check_link_name(new_name)?;
        let ts = now_ns();
        let _t = self.locks.tree.read();
        loop {
            let pidx = self.itable.lock().lookup_by_inode(new_parent)?;
            let tidx = self.itable.lock().lookup_by_inode(ino)?;
            let guards = self.locks.write_pair(pidx, tidx);
            {
                let it = self.itable.lock();
                if it.lookup_by_inode(new_parent).ok() != Some(pidx)
                    || it.lookup_by_inode(ino).ok() != Some(tidx)
                {
                    drop(guards);
                    continue;
                }
            }
            let ctx = self.ctx();
            // SAFETY: both write locks held.
            unsafe {
                if !self.nodes.node(pidx).is_dir() {
                    return Err(FsError::NotDir);
                }
                if self.nodes.node(tidx).is_dir() {
                    return Err(FsError::IsDir);
                }
                match tree::lookup(ctx, pidx, name.as_bytes()) {
                    Ok(_) => return Err(FsError::Exists),
                    Err(FsError::NotFound) => {}
                    Err(e) => return Err(e),
                }

                let name_off = self.strings.intern(name.as_bytes())?;
                let mut w = self.wal.lock();
                let tx = w.begin(ino, ts)?;
                w.append(
                    RecordType::Link,
                    tx,
                    ino,
                    ts,
                    &payload::Edge { parent: pidx, name: name.as_bytes().to_vec() }.encode(),
                )?;
                drop(w);

                tree::insert_child(ctx, pidx, name_off, tidx).map_err(|e| {
                    self.wal.lock().abort(tx);
                    e
                })?;
                let saved = {
                    let t = self.nodes.node_mut(tidx);
                    let saved = (t.nlink, t.ctime_ns, t.parent);
                    t.nlink += 1;
                    t.ctime_ns = ts;
                    t.parent = pidx;
                    saved
                };
                let saved_parent = {
                    let p = self.nodes.node_mut(pidx);
                    let sp = (p.mtime_ns, p.ctime_ns);
                    p.mtime_ns = ts;
                    p.ctime_ns = ts;
                    sp
                };

                if let Err(e) = self.wal.lock().commit(tx, ino, ts) {
                    let p = self.nodes.node_mut(pidx);
                    (p.mtime_ns, p.ctime_ns) = saved_parent;
                    let t = self.nodes.node_mut(tidx);
                    (t.nlink, t.ctime_ns, t.parent) = saved;
                    let _ = tree::remove_child(ctx, pidx, name.as_bytes());
                    self.wal.lock().abort(tx);
                    return Err(e);
                }
            }
            drop(guards);
            break;
        }
        drop(_t);
        self.after_mutation();
        Ok(())
    }

    pub fn unlink(&self, parent: u64, name: &[u8]) -> Result<()> {
        self.remove_entry(parent, name, false)
    }

    pub fn rmdir(&self, parent: u64, name: &[u8]) -> Result<()> {
        self.remove_entry(parent, name, true)
    }

    fn remove_entry(&self, parent: u64, name: &[u8], want_dir: bool) -> Result<()> {
        let name = self.check_link_name(name)?;
        let ts = now_ns();
        let _t = self.locks.tree.read();
        loop {
            let pidx = self.itable.lock().lookup_by_inode(parent)?;
            let cidx = {
                let _g = self.locks.read(pidx);
                if self.itable.lock().lookup_by_inode(parent).ok() != Some(pidx) {
                    continue;
                }
                // SAFETY: parent read lock held.
                unsafe { tree::lookup(self.ctx(), pidx, name.as_bytes())? }
            };
            let guards = self.locks.write_pair(pidx, cidx);
            let ctx = self.ctx();
            // SAFETY: both write locks held.
            unsafe {
                if self.itable.lock().lookup_by_inode(parent).ok() != Some(pidx)
                    || tree::lookup(ctx, pidx, name.as_bytes()).ok() != Some(cidx)
                {
                    drop(guards);
                    continue;
                }
                let child_ino = self.nodes.node(cidx).ino;
                let is_dir = self.nodes.node(cidx).is_dir();
                if want_dir && !is_dir {
                    return Err(FsError::NotDir);
                }
                if !want_dir && is_dir {
                    return Err(FsError::IsDir);
                }
                if is_dir && self.nodes.node(cidx).nchildren > 0 {
                    return Err(FsError::NotEmpty);
                }

                let mut w = self.wal.lock();
                let tx = w.begin(child_ino, ts)?;
                w.append(
                    if want_dir { RecordType::Rmdir } else { RecordType::Unlink },
                    tx,
                    child_ino,
                    ts,
                    &payload::Edge { parent: pidx, name: name.as_bytes().to_vec() }.encode(),
                )?;
                drop(w);

                let removed = tree::remove_child(ctx, pidx, name.as_bytes()).map_err(|e| {
                    self.wal.lock().abort(tx);
                    e
                })?;
                let saved_child = {
                    let c = self.nodes.node_mut(cidx);
                    let saved = (c.nlink, c.ctime_ns);
                    c.nlink = if is_dir { 0 } else { c.nlink - 1 };
                    c.ctime_ns = ts;
                    saved
                };
                let saved_parent = {
                    let p = self.nodes.node_mut(pidx);
                    let saved = (p.nlink, p.mtime_ns, p.ctime_ns);
                    if is_dir {
                        p.nlink -= 1;
                    }
                    p.mtime_ns = ts;
                    p.ctime_ns = ts;
                    saved
                };

                if let Err(e) = self.wal.lock().commit(tx, child_ino, ts) {
                    let p = self.nodes.node_mut(pidx);
                    (p.nlink, p.mtime_ns, p.ctime_ns) = saved_parent;
                    let c = self.nodes.node_mut(cidx);
                    (c.nlink, c.ctime_ns) = saved_child;
                    let _ = tree::insert_child(ctx, pidx, removed.name_off, removed.idx);
                    self.wal.lock().abort(tx);
                    return Err(e);
                }

                // Retirement strictly after the flush: rollback never has
                // to resurrect a freed slot.
                self.retire_if_unreferenced(cidx);
            }
            drop(guards);
            break;
        }
        drop(_t);
        self.after_mutation();
        Ok(())
    }

    pub fn rename(
        &self,
        src_parent: u64,
        src_name: &[u8],
        dst_parent: u64,
        dst_name: &[u8],
        flags: RenameFlags,
    ) -> Result<()> {
        let src_name = self.check_link_name(src_name)?;
        let dst_name = self.check_link_name(dst_name)?;
        let ts = now_ns();
        let _t = self.locks.tree.read();
        // Renames serialize against each other so the ancestry check and
        // the re-parenting are atomic as a pair.
        let _r = self.locks.rename.lock();
        loop {
            let spidx = self.itable.lock().lookup_by_inode(src_parent)?;
            let dpidx = self.itable.lock().lookup_by_inode(dst_parent)?;
            // Discover the moving node and any replacement victim under
            // read locks, then take the whole write-lock set in ascending
            // index order and revalidate.
            let (midx, vidx) = {
                let _sg = self.locks.read(spidx);
                if self.itable.lock().lookup_by_inode(src_parent).ok() != Some(spidx) {
                    continue;
                }
                let midx = match unsafe { tree::lookup(self.ctx(), spidx, src_name.as_bytes()) } {
                    Ok(i) => i,
                    Err(e) => return Err(e),
                };
                drop(_sg);
                let _dg = self.locks.read(dpidx);
                if self.itable.lock().lookup_by_inode(dst_parent).ok() != Some(dpidx) {
                    continue;
                }
                let vidx = match unsafe { tree::lookup(self.ctx(), dpidx, dst_name.as_bytes()) } {
                    Ok(i) => Some(i),
                    Err(FsError::NotFound) => None,
                    Err(e) => return Err(e),
                };
                (midx, vidx)
            };
            if vidx == Some(midx) {
                // Source and destination are links to the same node:
                // rename does nothing, successfully.
                return Ok(());
            }

            let mut set: ArrayVec<u32, MAX_LOCK_SET> = ArrayVec::new();
            set.push(spidx);
            set.push(dpidx);
            set.push(midx);
            if let Some(v) = vidx {
                set.push(v);
            }
            let guards = self.locks.write_set(&mut set);
            let ctx = self.ctx();

            // SAFETY: the full write-lock set is held from here on.
            unsafe {
                let it = self.itable.lock();
                let stale = it.lookup_by_inode(src_parent).ok() != Some(spidx)
                    || it.lookup_by_inode(dst_parent).ok() != Some(dpidx);
                drop(it);
                if stale
                    || tree::lookup(ctx, spidx, src_name.as_bytes()).ok() != Some(midx)
                    || tree::lookup(ctx, dpidx, dst_name.as_bytes()).ok() != vidx
                {
                    drop(guards);
                    continue;
                }

                let moving_is_dir = self.nodes.node(midx).is_dir();
                let moving_ino = self.nodes.node(midx).ino;
                let victim_is_dir = vidx.map_or(false, |v| self.nodes.node(v).is_dir());
                if let Some(v) = vidx {
                    if flags.contains(RenameFlags::NOREPLACE) {
                        return Err(FsError::Exists);
                    }
                    if victim_is_dir && !moving_is_dir {
                        return Err(FsError::IsDir);
                    }
                    if !victim_is_dir && moving_is_dir {
                        return Err(FsError::NotDir);
                    }
                    if victim_is_dir && self.nodes.node(v).nchildren > 0 {
                        return Err(FsError::NotEmpty);
                    }
                }
                if moving_is_dir && tree::is_ancestor(ctx, midx, dpidx)? {
                    return Err(FsError::Loop);
                }

                let dst_off = self.strings.intern(dst_name.as_bytes())?;
                let mut w = self.wal.lock();
                let tx = w.begin(moving_ino, ts)?;
                w.append(
                    RecordType::Rename,
                    tx,
                    moving_ino,
                    ts,
                    &payload::Rename {
                        src_parent: spidx,
                        dst_parent: dpidx,
                        flags: flags.bits(),
                        src_name: src_name.as_bytes().to_vec(),
                        dst_name: dst_name.as_bytes().to_vec(),
                    }
                    .encode(),
                )?;
                drop(w);

                // Apply. Victim removal first (so the insert cannot hit
                // ErrExists), then the one fallible step, then the rest.
                let victim_ent = match vidx {
                    Some(_) => Some(tree::remove_child(ctx, dpidx, dst_name.as_bytes()).map_err(|e| {
                        self.wal.lock().abort(tx);
                        e
                    })?),
                    None => None,
                };
                if let Err(e) = tree::insert_child(ctx, dpidx, dst_off, midx) {
                    if let Some(ent) = victim_ent {
                        let _ = tree::insert_child(ctx, dpidx, ent.name_off, ent.idx);
                    }
                    self.wal.lock().abort(tx);
                    return Err(e);
                }
                let src_ent = match tree::remove_child(ctx, spidx, src_name.as_bytes()) {
                    Ok(ent) => ent,
                    Err(e) => {
                        let _ = tree::remove_child(ctx, dpidx, dst_name.as_bytes());
                        if let Some(ent) = victim_ent {
                            let _ = tree::insert_child(ctx, dpidx, ent.name_off, ent.idx);
                        }
                        self.wal.lock().abort(tx);
                        return Err(e);
                    }
                };

                let saved_victim = vidx.map(|v| {
                    let n = self.nodes.node_mut(v);
                    let saved = (n.nlink, n.ctime_ns);
                    n.nlink = if n.is_dir() { 0 } else { n.nlink - 1 };
                    n.ctime_ns = ts;
                    saved
                });
                let saved_moving = {
                    let m = self.nodes.node_mut(midx);
                    let saved = (m.parent, m.name_off, m.ctime_ns);
                    m.parent = dpidx;
                    m.name_off = dst_off;
                    m.ctime_ns = ts;
                    saved
                };
                let saved_sp = {
                    let p = self.nodes.node_mut(spidx);
                    let saved = (p.nlink, p.mtime_ns, p.ctime_ns);
                    if moving_is_dir && spidx != dpidx {
                        p.nlink -= 1;
                    }
                    p.mtime_ns = ts;
                    p.ctime_ns = ts;
                    saved
                };
                let saved_dp = {
                    let p = self.nodes.node_mut(dpidx);
                    let saved = (p.nlink, p.mtime_ns, p.ctime_ns);
                    // A replaced directory's `..` leaves; a moving
                    // directory's `..` arrives only across parents.
                    if victim_is_dir {
                        p.nlink -= 1;
                    }
                    if moving_is_dir && spidx != dpidx {
                        p.nlink += 1;
                    }
                    p.mtime_ns = ts;
                    p.ctime_ns = ts;
                    saved
                };

                if let Err(e) = self.wal.lock().commit(tx, moving_ino, ts) {
                    let p = self.nodes.node_mut(dpidx);
                    (p.nlink, p.mtime_ns, p.ctime_ns) = saved_dp;
                    let p = self.nodes.node_mut(spidx);
                    (p.nlink, p.mtime_ns, p.ctime_ns) = saved_sp;
                    let m = self.nodes.node_mut(midx);
                    (m.parent, m.name_off, m.ctime_ns) = saved_moving;
                    if let (Some(v), Some(saved)) = (vidx, saved_victim) {
                        let n = self.nodes.node_mut(v);
                        (n.nlink, n.ctime_ns) = saved;
                    }
                    let _ = tree::insert_child(ctx, spidx, src_ent.name_off, src_ent.idx);
                    let _ = tree::remove_child(ctx, dpidx, dst_name.as_bytes());
                    if let Some(ent) = victim_ent {
                        let _ = tree::insert_child(ctx, dpidx, ent.name_off, ent.idx);
                    }
                    self.wal.lock().abort(tx);
                    return Err(e);
                }

                if let Some(v) = vidx {
                    self.retire_if_unreferenced(v);
                }
            }
            drop(guards);
            break;
        }
        drop(_r);
        drop(_t);
        self.after_mutation();
        Ok(())
    }

    pub fn write(&self, ino: u64, offset: u64, bytes: &[u8]) -> Result<u32> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let ts = now_ns();
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_write(ino)?;
        // SAFETY: write lock held.
        unsafe {
            let node = self.nodes.node(idx);
            if !node.is_file() {
                return Err(if node.is_dir() { FsError::IsDir } else { FsError::Invalid });
            }

            let tx = {
                let mut w = self.wal.lock();
                let tx = w.begin(ino, ts)?;
                for (off, chunk) in chunk_blocks_at(offset, bytes, self.data.block_size()) {
                    if let Err(e) = w.append(
                        RecordType::Write,
                        tx,
                        ino,
                        ts,
                        &payload::Write { offset: off, data: chunk.to_vec() }.encode(),
                    ) {
                        w.abort(tx);
                        return Err(e);
                    }
                }
                tx
            };
            // Any early return from here on leaves an aborted transaction
            // for recovery to discard.
            let tx = scopeguard::guard(tx, |tx| self.wal.lock().abort(tx));

            // Snapshot prior state for rollback.
            let bs = self.data.block_size() as u64;
            let first_blk = (offset / bs) as u32;
            let last_blk = ((offset + bytes.len() as u64 - 1) / bs) as u32;
            let mut prior: Vec<(u32, Option<Vec<u8>>)> = Vec::new();
            for blk in first_blk..=last_blk {
                prior.push((blk, self.data.read_block(ino, blk)?));
            }
            let saved = {
                let n = self.nodes.node(idx);
                (n.size, n.mtime_ns, n.ctime_ns)
            };

            if let Err(e) = apply_write(&self.nodes, &self.data, idx, offset, bytes, ts) {
                self.rollback_write(ino, idx, &prior, saved);
                return Err(e);
            }

            if let Err(e) = self.wal.lock().commit(*tx, ino, ts) {
                self.rollback_write(ino, idx, &prior, saved);
                return Err(e);
            }
            let _ = scopeguard::ScopeGuard::into_inner(tx);
        }
        drop(_g);
        drop(_t);
        self.after_mutation();
        Ok(bytes.len() as u32)
    }

    /// Restores the blocks and size captured before a failed write.
    ///
    /// # Safety: the node's write lock is held.
    unsafe fn rollback_write(
        &self,
        ino: u64,
        idx: u32,
        prior: &[(u32, Option<Vec<u8>>)],
        saved: (u64, u64, u64),
    ) {
        for (blk, old) in prior {
            match old {
                Some(block) => {
                    let live = self.data.block_size();
                    let _ = self.data.write_block(ino, *blk, block, live);
                }
                None => self.data.free_block(ino, *blk),
            }
        }
        let n = self.nodes.node_mut(idx);
        (n.size, n.mtime_ns, n.ctime_ns) = saved;
    }

    pub fn truncate(&self, ino: u64, len: u64) -> Result<()> {
        self.setattr(ino, Setattr { size: Some(len), ..Setattr::default() })
            .map(|_| ())
    }

    pub fn setattr(&self, ino: u64, changes: Setattr) -> Result<Attr> {
        let ts = now_ns();
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_write(ino)?;
        // SAFETY: write lock held.
        unsafe {
            let node = self.nodes.node(idx);
            if changes.size.is_some() && node.is_dir() {
                return Err(FsError::IsDir);
            }

            let mut mask = SetattrMask::empty();
            let mut p = payload::Setattr {
                mask: 0,
                mode: changes.mode.unwrap_or(0),
                uid: changes.uid.unwrap_or(0),
                gid: changes.gid.unwrap_or(0),
                size: changes.size.unwrap_or(0),
                atime_ns: changes.atime_ns.unwrap_or(0),
                mtime_ns: changes.mtime_ns.unwrap_or(0),
                ctime_ns: changes.ctime_ns.unwrap_or(0),
            };
            if changes.mode.is_some() {
                mask |= SetattrMask::MODE;
            }
            if changes.uid.is_some() {
                mask |= SetattrMask::UID;
            }
            if changes.gid.is_some() {
                mask |= SetattrMask::GID;
            }
            if changes.size.is_some() {
                mask |= SetattrMask::SIZE;
            }
            if changes.atime_ns.is_some() {
                mask |= SetattrMask::ATIME;
            }
            if changes.mtime_ns.is_some() {
                mask |= SetattrMask::MTIME;
            }
            if changes.ctime_ns.is_some() {
                mask |= SetattrMask::CTIME;
            }
            if mask.is_empty() {
                return Ok(self.attr_of(idx));
            }
            p.mask = mask.bits();

            let tx = {
                let mut w = self.wal.lock();
                let tx = w.begin(ino, ts)?;
                if let Err(e) = w.append(RecordType::Setattr, tx, ino, ts, &p.encode()) {
                    w.abort(tx);
                    return Err(e);
                }
                tx
            };
            let tx = scopeguard::guard(tx, |tx| self.wal.lock().abort(tx));

            // Snapshot prior state: the record fields plus the tail block
            // a shrink will zero.
            let saved = *self.nodes.node(idx);
            let bs = self.data.block_size() as u64;
            let tail = match changes.size {
                Some(new_size) if new_size < saved.size && new_size % bs != 0 => {
                    let blk = (new_size / bs) as u32;
                    Some((blk, self.data.read_block(ino, blk)?))
                }
                _ => None,
            };

            let dead = match apply_setattr(&self.nodes, &self.data, idx, &p, ts) {
                Ok(d) => d,
                Err(e) => return Err(e),
            };

            if let Err(e) = self.wal.lock().commit(*tx, ino, ts) {
                if let Some((blk, old)) = tail {
                    match old {
                        Some(block) => {
                            let _ = self.data.write_block(ino, blk, &block, self.data.block_size());
                        }
                        None => self.data.free_block(ino, blk),
                    }
                }
                *self.nodes.node_mut(idx) = saved;
                return Err(e);
            }
            let _ = scopeguard::ScopeGuard::into_inner(tx);

            // Freeing truncated blocks strictly after the flush.
            if let Some(first_dead) = dead {
                self.data.free_blocks(ino, first_dead);
            }

            let attr = self.attr_of(idx);
            drop(_g);
            drop(_t);
            self.after_mutation();
            Ok(attr)
        }
    }

    // ------------------------------------------------------------------
    // Extended attributes.

    pub fn xattr_set(
        &self,
        ino: u64,
        ns: Namespace,
        key: &[u8],
        value: &[u8],
        flags: XattrFlags,
    ) -> Result<()> {
        let ts = now_ns();
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_write(ino)?;
        // SAFETY: write lock held.
        unsafe {
            // Snapshot the prior binding so a failed flush can undo both
            // a fresh head entry and an in-place value replacement, and
            // reject flag violations before anything reaches the log.
            let saved_head = self.nodes.node(idx).xattr_off;
            let saved_ctime = self.nodes.node(idx).ctime_ns;
            let replaced = xattr::probe(&self.strings, &self.nodes, idx, ns, key)?;
            if replaced.is_some() && flags.contains(XattrFlags::CREATE) {
                return Err(FsError::Exists);
            }
            if replaced.is_none() && flags.contains(XattrFlags::REPLACE) {
                return Err(FsError::NotFound);
            }

            let mut w = self.wal.lock();
            let tx = w.begin(ino, ts)?;
            w.append(
                RecordType::XattrSet,
                tx,
                ino,
                ts,
                &payload::XattrSet { ns: ns as u8, key: key.to_vec(), value: value.to_vec() }.encode(),
            )?;
            drop(w);

            if let Err(e) = xattr::set(&self.strings, &self.nodes, idx, ns, key, value, flags, &self.cfg) {
                self.wal.lock().abort(tx);
                return Err(e);
            }
            self.nodes.node_mut(idx).ctime_ns = ts;

            if let Err(e) = self.wal.lock().commit(tx, ino, ts) {
                if let Some((rec_off, val_off, val_len)) = replaced {
                    let _ = xattr::restore_value(&self.strings, rec_off, val_off, val_len);
                }
                let n = self.nodes.node_mut(idx);
                n.xattr_off = saved_head;
                n.ctime_ns = saved_ctime;
                self.wal.lock().abort(tx);
                return Err(e);
            }
        }
        drop(_g);
        drop(_t);
        self.after_mutation();
        Ok(())
    }

    pub fn xattr_get(&self, ino: u64, ns: Namespace, key: &[u8]) -> Result<Vec<u8>> {
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_read(ino)?;
        // SAFETY: read lock held.
        unsafe { xattr::get(&self.strings, &self.nodes, idx, ns, key) }
    }

    pub fn xattr_list(&self, ino: u64) -> Result<Vec<(Namespace, Vec<u8>)>> {
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_read(ino)?;
        // SAFETY: read lock held.
        unsafe { xattr::list(&self.strings, &self.nodes, idx) }
    }

    pub fn xattr_remove(&self, ino: u64, ns: Namespace, key: &[u8]) -> Result<()> {
        let ts = now_ns();
        let _t = self.locks.tree.read();
        let (idx, _g) = self.locked_write(ino)?;
        // SAFETY: write lock held.
        unsafe {
            // Probe first: an absent key must fail without a transaction.
            if xattr::probe(&self.strings, &self.nodes, idx, ns, key)?.is_none() {
                return Err(FsError::NotFound);
            }

            let mut w = self.wal.lock();
            let tx = w.begin(ino, ts)?;
            w.append(
                RecordType::XattrRemove,
                tx,
                ino,
                ts,
                &payload::XattrRemove { ns: ns as u8, key: key.to_vec() }.encode(),
            )?;
            drop(w);

            let saved_ctime = self.nodes.node(idx).ctime_ns;
            let (prev, removed) = match xattr::remove(&self.strings, &self.nodes, idx, ns, key) {
                Ok(x) => x,
                Err(e) => {
                    self.wal.lock().abort(tx);
                    return Err(e);
                }
            };
            self.nodes.node_mut(idx).ctime_ns = ts;

            if let Err(e) = self.wal.lock().commit(tx, ino, ts) {
                let _ = xattr::unremove(&self.strings, &self.nodes, idx, prev, removed);
                self.nodes.node_mut(idx).ctime_ns = saved_ctime;
                self.wal.lock().abort(tx);
                return Err(e);
            }
        }
        drop(_g);
        drop(_t);
        self.after_mutation();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance.

    /// Forces a checkpoint: quiesce, flush arenas to the inactive
    /// snapshot generation, flip, truncate the WAL.
    pub fn sync(&self) -> Result<()> {
        self.checkpoint()
    }

    fn checkpoint(&self) -> Result<()> {
        let _t = self.locks.tree.write();
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> Result<()> {
        let mut w = self.wal.lock();
        let next_gen = 1 - w.active_gen();
        // SAFETY: the filesystem-wide write lock quiesces all mutators.
        unsafe {
            crate::shm::store(
                &self.region_path("nodes", next_gen),
                self.nodes.capacity() as u64 * crate::param::NODE_SIZE as u64,
                self.nodes.snapshot(),
            )?;
            crate::shm::store(
                &self.region_path("strings", next_gen),
                self.strings.capacity() as u64,
                self.strings.snapshot(),
            )?;
            crate::shm::store(
                &self.region_path("spill", next_gen),
                self.spill.capacity() as u64 * 8,
                self.spill.snapshot(),
            )?;
            crate::shm::store(
                &self.region_path("data", next_gen),
                self.data.slot_count() as u64 * (self.data.block_size() as u64 + data::SLOT_META_SIZE as u64),
                self.data.snapshot(),
            )?;
        }
        w.finish_checkpoint(next_gen)?;
        debug!("checkpoint: generation {next_gen} is now active");
        Ok(())
    }

    /// Post-commit housekeeping: count the mutation, and when due, take
    /// the filesystem-wide lock for a re-layout and/or checkpoint.
    /// Failures here never fail the already-committed operation.
    fn after_mutation(&self) {
        let muts = self.mutations.fetch_add(1, Ordering::Relaxed) + 1;
        let rebalance_due =
            self.cfg.rebalance_interval != 0 && muts % self.cfg.rebalance_interval == 0;
        let checkpoint_due = self.wal.lock().needs_checkpoint();
        if !rebalance_due && !checkpoint_due {
            return;
        }
        let _t = self.locks.tree.write();
        if rebalance_due {
            let mut it = self.itable.lock();
            // SAFETY: filesystem-wide write lock held.
            match unsafe { tree::rebalance(self.ctx(), &mut it) } {
                Ok(map) => debug!("rebalance: re-laid {} nodes", map.len()),
                Err(e) => {
                    warn!("rebalance failed: {e}");
                    return;
                }
            }
            drop(it);
        }
        // A rebalance remaps the indices WAL records refer to, so it must
        // always be sealed with a checkpoint.
        if let Err(e) = self.checkpoint_locked() {
            warn!("checkpoint failed: {e}");
        }
    }
}

impl Drop for RazorFs {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.checkpoint() {
                warn!("checkpoint on drop failed: {e}");
            }
        }
    }
}

/// Splits `bytes` written at `offset` into block-bounded chunks.
fn chunk_blocks_at(offset: u64, bytes: &[u8], block_size: u32) -> Vec<(u64, &[u8])> {
    let bs = block_size as usize;
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let off = offset + pos as u64;
        let in_blk = (off % bs as u64) as usize;
        let n = (bs - in_blk).min(bytes.len() - pos);
        out.push((off, &bytes[pos..pos + n]));
        pos += n;
    }
    out
}

fn chunk_blocks(bytes: &[u8], block_size: u32) -> Vec<(u64, &[u8])> {
    chunk_blocks_at(0, bytes, block_size)
}

/// Applies a write to the block store and the node's size and times.
/// Shared by the live path and WAL replay; replaying an already-applied
/// write is a plain overwrite.
///
/// # Safety
///
/// Caller holds the node's write lock or is single-threaded.
pub(crate) unsafe fn apply_write(
    nodes: &NodeArena,
    data: &BlockStore,
    idx: u32,
    offset: u64,
    bytes: &[u8],
    ts: u64,
) -> Result<()> {
    let bs = data.block_size() as u64;
    let (ino, old_size) = {
        let n = nodes.node(idx);
        (n.ino, n.size)
    };
    let mut pos = 0usize;
    while pos < bytes.len() {
        let off = offset + pos as u64;
        let blk = (off / bs) as u32;
        let in_blk = (off % bs) as usize;
        let n = (bs as usize - in_blk).min(bytes.len() - pos);
        let mut block = match data.read_block(ino, blk)? {
            Some(b) => b,
            None => vec![0u8; bs as usize],
        };
        block[in_blk..in_blk + n].copy_from_slice(&bytes[pos..pos + n]);
        let file_end = old_size.max(off + n as u64);
        let live = (file_end - blk as u64 * bs).min(bs) as u32;
        data.write_block(ino, blk, &block, live)?;
        pos += n;
    }
    let node = nodes.node_mut(idx);
    node.size = node.size.max(offset + bytes.len() as u64);
    node.mtime_ns = ts;
    node.ctime_ns = ts;
    Ok(())
}

/// Applies a SETATTR record. A shrink zeroes the tail of the boundary
/// block; the caller frees the fully-dead blocks (immediately on replay,
/// after the commit flush on the live path). Returns the first dead block
/// index when the size shrank.
///
/// # Safety
///
/// Caller holds the node's write lock or is single-threaded.
pub(crate) unsafe fn apply_setattr(
    nodes: &NodeArena,
    data: &BlockStore,
    idx: u32,
    p: &payload::Setattr,
    ts: u64,
) -> Result<Option<u32>> {
    let mask = SetattrMask::from_bits_truncate(p.mask);
    let mut dead = None;
    if mask.contains(SetattrMask::SIZE) {
        let (ino, old_size) = {
            let n = nodes.node(idx);
            (n.ino, n.size)
        };
        let new_size = p.size;
        if new_size < old_size {
            let bs = data.block_size() as u64;
            dead = Some(((new_size + bs - 1) / bs) as u32);
            if new_size % bs != 0 {
                let blk = (new_size / bs) as u32;
                if let Some(mut block) = data.read_block(ino, blk)? {
                    block[(new_size % bs) as usize..].fill(0);
                    data.write_block(ino, blk, &block, (new_size % bs) as u32)?;
                }
            }
        }
        nodes.node_mut(idx).size = new_size;
    }
    let node = nodes.node_mut(idx);
    if mask.contains(SetattrMask::MODE) {
        // Type bits are immutable; only permissions change.
        node.mode = (node.mode & libc::S_IFMT) | (p.mode & 0o7777);
    }
    if mask.contains(SetattrMask::UID) {
        node.uid = p.uid;
    }
    if mask.contains(SetattrMask::GID) {
        node.gid = p.gid;
    }
    if mask.contains(SetattrMask::SIZE) {
        node.mtime_ns = ts;
    }
    if mask.contains(SetattrMask::ATIME) {
        node.atime_ns = p.atime_ns;
    }
    // An explicit mtime wins over the one a size change implies.
    if mask.contains(SetattrMask::MTIME) {
        node.mtime_ns = p.mtime_ns;
    }
    node.ctime_ns = if mask.contains(SetattrMask::CTIME) {
        p.ctime_ns
    } else {
        ts
    };
    Ok(dead)
}
