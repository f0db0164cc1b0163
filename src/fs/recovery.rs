//! Mount-time recovery.
//!
//! On mount the engine loads the active snapshot generation, rebuilds the
//! derived tables (inode map, block map, intern index, free lists) by
//! scanning, classifies the WAL's transactions, replays the committed
//! ones in sequence order, discards the incomplete ones, and runs a full
//! consistency pass over the data-model invariants before service
//! resumes.
//!
//! Replay is idempotent: a checkpoint crash can leave the log pointing at
//! a snapshot that already contains some or all of the logged effects, so
//! redoing a CREATE whose inode already exists is a no-op, redoing a
//! WRITE is an overwrite, and redoing an UNLINK whose entry is gone is a
//! no-op.

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::{debug, error, warn};
use std::collections::VecDeque;
use std::path::PathBuf;

use crate::arena::{NodeArena, SpillArena, StringArena};
use crate::error::{FsError, Result};
use crate::fs::data::BlockStore;
use crate::fs::inode::InodeTable;
use crate::fs::log::{payload, Record, RecordType};
use crate::fs::tree::{self, TreeCtx};
use crate::fs::xattr::{self, XattrFlags};
use crate::fs::{apply_setattr, apply_write};
use crate::param::{Config, NO_INDEX, ROOT_IDX};
use crate::shm;

pub(crate) fn region_path(cfg: &Config, section: &str, gen: u8) -> PathBuf {
    cfg.region_dir.join(format!("razorfs.{section}.{gen}"))
}

/// Loads the four arena sections of the given snapshot generation.
pub(crate) fn load_snapshot(
    cfg: &Config,
    gen: u8,
    strings: &mut StringArena,
    nodes: &mut NodeArena,
    spill: &mut SpillArena,
    data: &mut BlockStore,
) -> Result<()> {
    strings.load(&shm::load(&region_path(cfg, "strings", gen))?)?;
    nodes.load(&shm::load(&region_path(cfg, "nodes", gen))?)?;
    spill.load(&shm::load(&region_path(cfg, "spill", gen))?)?;
    data.load(&shm::load(&region_path(cfg, "data", gen))?)?;
    Ok(())
}

/// Derives the inode table from a node-arena scan.
pub(crate) fn rebuild_itable(nodes: &NodeArena, itable: &mut InodeTable) -> Result<()> {
    for idx in 0..nodes.high() {
        // SAFETY: single-threaded during mount.
        let node = unsafe { nodes.node(idx) };
        if node.is_free() {
            continue;
        }
        if itable.contains_ino(node.ino) {
            error!("recovery: inode {} appears twice in the node arena", node.ino);
            return Err(FsError::Corrupt);
        }
        itable.link(node.ino, idx);
    }
    Ok(())
}

/// Replays the committed transactions' redo records in sequence order.
pub(crate) fn replay(
    cfg: &Config,
    records: &[Record],
    ctx: TreeCtx<'_>,
    data: &BlockStore,
    itable: &mut InodeTable,
) -> Result<()> {
    let committed: HashSet<u64> = records
        .iter()
        .filter(|r| r.rtype == RecordType::Commit)
        .map(|r| r.txid)
        .collect();
    let discarded = records
        .iter()
        .filter(|r| r.rtype == RecordType::Begin && !committed.contains(&r.txid))
        .count();
    if discarded > 0 {
        warn!("recovery: discarding {discarded} incomplete transaction(s)");
    }

    for rec in records.iter().filter(|r| committed.contains(&r.txid)) {
        // SAFETY: recovery is single-threaded; no locks are needed.
        unsafe {
            match rec.rtype {
                RecordType::Begin
                | RecordType::Commit
                | RecordType::Abort
                | RecordType::Checkpoint => {}
                RecordType::Create | RecordType::Mkdir => replay_create(ctx, itable, rec)?,
                RecordType::Link => replay_link(ctx, itable, rec)?,
                RecordType::Unlink => replay_unlink(ctx, data, itable, rec, false)?,
                RecordType::Rmdir => replay_unlink(ctx, data, itable, rec, true)?,
                RecordType::Rename => replay_rename(ctx, data, itable, rec)?,
                RecordType::Write => replay_write(ctx, data, itable, rec)?,
                RecordType::Setattr => replay_setattr_rec(ctx, data, itable, rec)?,
                RecordType::XattrSet => replay_xattr_set(cfg, ctx, itable, rec)?,
                RecordType::XattrRemove => replay_xattr_remove(ctx, itable, rec)?,
            }
        }
    }
    Ok(())
}

unsafe fn valid_dir(ctx: TreeCtx<'_>, idx: u32) -> Result<()> {
    if idx >= ctx.nodes.high() || ctx.nodes.node(idx).is_free() || !ctx.nodes.node(idx).is_dir() {
        return Err(FsError::Corrupt);
    }
    Ok(())
}

unsafe fn replay_create(ctx: TreeCtx<'_>, itable: &mut InodeTable, rec: &Record) -> Result<()> {
    let p = payload::Create::decode(&rec.payload)?;
    if itable.contains_ino(rec.ino) {
        return Ok(());
    }
    if p.child < ctx.nodes.high() && !ctx.nodes.node(p.child).is_free() {
        // The slot is held by later history that is already in the
        // snapshot, which means this create (and its eventual unlink)
        // are in there too.
        return Ok(());
    }
    valid_dir(ctx, p.parent)?;
    ctx.nodes.alloc_at(p.child)?;
    let name_off = ctx.strings.intern(&p.name)?;
    let is_dir = p.mode & libc::S_IFMT == libc::S_IFDIR;
    {
        let n = ctx.nodes.node_mut(p.child);
        n.init(rec.ino, p.parent, name_off, p.mode, p.uid, p.gid, rec.timestamp);
        n.nlink = if is_dir { 2 } else { 1 };
    }
    tree::insert_child(ctx, p.parent, name_off, p.child)?;
    let parent = ctx.nodes.node_mut(p.parent);
    if is_dir {
        parent.nlink += 1;
    }
    parent.mtime_ns = rec.timestamp;
    parent.ctime_ns = rec.timestamp;
    itable.link(rec.ino, p.child);
    Ok(())
}

unsafe fn replay_link(ctx: TreeCtx<'_>, itable: &mut InodeTable, rec: &Record) -> Result<()> {
    let p = payload::Edge::decode(&rec.payload)?;
    let tidx = match itable.lookup_by_inode(rec.ino) {
        Ok(i) => i,
        // The target vanished through later committed operations that
        // are also in this snapshot.
        Err(_) => return Ok(()),
    };
    valid_dir(ctx, p.parent)?;
    match tree::lookup(ctx, p.parent, &p.name) {
        Ok(i) if i == tidx => return Ok(()),
        // The name belongs to later history already in the snapshot.
        Ok(_) => return Ok(()),
        Err(FsError::NotFound) => {}
        Err(e) => return Err(e),
    }
    let name_off = ctx.strings.intern(&p.name)?;
    tree::insert_child(ctx, p.parent, name_off, tidx)?;
    {
        let t = ctx.nodes.node_mut(tidx);
        t.nlink += 1;
        t.ctime_ns = rec.timestamp;
        t.parent = p.parent;
    }
    let parent = ctx.nodes.node_mut(p.parent);
    parent.mtime_ns = rec.timestamp;
    parent.ctime_ns = rec.timestamp;
    Ok(())
}

unsafe fn replay_unlink(
    ctx: TreeCtx<'_>,
    data: &BlockStore,
    itable: &mut InodeTable,
    rec: &Record,
    want_dir: bool,
) -> Result<()> {
    let p = payload::Edge::decode(&rec.payload)?;
    valid_dir(ctx, p.parent)?;
    let cidx = match tree::lookup(ctx, p.parent, &p.name) {
        Ok(i) => i,
        Err(FsError::NotFound) => return Ok(()),
        Err(e) => return Err(e),
    };
    if ctx.nodes.node(cidx).ino != rec.ino {
        // The name was re-used by a later committed create that is
        // already in this snapshot.
        return Ok(());
    }
    tree::remove_child(ctx, p.parent, &p.name)?;
    let nlink = {
        let c = ctx.nodes.node_mut(cidx);
        c.nlink = if want_dir { 0 } else { c.nlink - 1 };
        c.ctime_ns = rec.timestamp;
        c.nlink
    };
    let parent = ctx.nodes.node_mut(p.parent);
    if want_dir {
        parent.nlink -= 1;
    }
    parent.mtime_ns = rec.timestamp;
    parent.ctime_ns = rec.timestamp;
    if nlink == 0 {
        itable.unlink(rec.ino);
        data.free_blocks(rec.ino, 0);
        ctx.nodes.free(cidx);
    }
    Ok(())
}

unsafe fn replay_rename(
    ctx: TreeCtx<'_>,
    data: &BlockStore,
    itable: &mut InodeTable,
    rec: &Record,
) -> Result<()> {
    let p = payload::Rename::decode(&rec.payload)?;
    let midx = match itable.lookup_by_inode(rec.ino) {
        Ok(i) => i,
        Err(_) => return Ok(()),
    };
    valid_dir(ctx, p.src_parent)?;
    valid_dir(ctx, p.dst_parent)?;
    match tree::lookup(ctx, p.src_parent, &p.src_name) {
        Ok(i) if i == midx => {}
        // Already moved (or the edge was re-made by later operations in
        // this snapshot); nothing to redo.
        _ => return Ok(()),
    }
    let moving_is_dir = ctx.nodes.node(midx).is_dir();

    // Replace the victim, if any.
    if let Ok(vidx) = tree::lookup(ctx, p.dst_parent, &p.dst_name) {
        let victim_ino = ctx.nodes.node(vidx).ino;
        let victim_is_dir = ctx.nodes.node(vidx).is_dir();
        tree::remove_child(ctx, p.dst_parent, &p.dst_name)?;
        let nlink = {
            let v = ctx.nodes.node_mut(vidx);
            v.nlink = if victim_is_dir { 0 } else { v.nlink - 1 };
            v.nlink
        };
        if victim_is_dir {
            ctx.nodes.node_mut(p.dst_parent).nlink -= 1;
        }
        if nlink == 0 {
            itable.unlink(victim_ino);
            data.free_blocks(victim_ino, 0);
            ctx.nodes.free(vidx);
        }
    }

    let dst_off = ctx.strings.intern(&p.dst_name)?;
    tree::insert_child(ctx, p.dst_parent, dst_off, midx)?;
    tree::remove_child(ctx, p.src_parent, &p.src_name)?;
    {
        let m = ctx.nodes.node_mut(midx);
        m.parent = p.dst_parent;
        m.name_off = dst_off;
        m.ctime_ns = rec.timestamp;
    }
    if moving_is_dir && p.src_parent != p.dst_parent {
        ctx.nodes.node_mut(p.src_parent).nlink -= 1;
        ctx.nodes.node_mut(p.dst_parent).nlink += 1;
    }
    for parent in [p.src_parent, p.dst_parent] {
        let n = ctx.nodes.node_mut(parent);
        n.mtime_ns = rec.timestamp;
        n.ctime_ns = rec.timestamp;
    }
    Ok(())
}

unsafe fn replay_write(
    ctx: TreeCtx<'_>,
    data: &BlockStore,
    itable: &InodeTable,
    rec: &Record,
) -> Result<()> {
    let p = payload::Write::decode(&rec.payload)?;
    let idx = match itable.lookup_by_inode(rec.ino) {
        Ok(i) => i,
        Err(_) => return Ok(()),
    };
    apply_write(ctx.nodes, data, idx, p.offset, &p.data, rec.timestamp)
}

unsafe fn replay_setattr_rec(
    ctx: TreeCtx<'_>,
    data: &BlockStore,
    itable: &InodeTable,
    rec: &Record,
) -> Result<()> {
    let p = payload::Setattr::decode(&rec.payload)?;
    let idx = match itable.lookup_by_inode(rec.ino) {
        Ok(i) => i,
        Err(_) => return Ok(()),
    };
    if let Some(first_dead) = apply_setattr(ctx.nodes, data, idx, &p, rec.timestamp)? {
        data.free_blocks(rec.ino, first_dead);
    }
    Ok(())
}

unsafe fn replay_xattr_set(
    cfg: &Config,
    ctx: TreeCtx<'_>,
    itable: &InodeTable,
    rec: &Record,
) -> Result<()> {
    let p = payload::XattrSet::decode(&rec.payload)?;
    let idx = match itable.lookup_by_inode(rec.ino) {
        Ok(i) => i,
        Err(_) => return Ok(()),
    };
    let ns = xattr::Namespace::from_u32(p.ns as u32)?;
    xattr::set(ctx.strings, ctx.nodes, idx, ns, &p.key, &p.value, XattrFlags::empty(), cfg)
}

unsafe fn replay_xattr_remove(ctx: TreeCtx<'_>, itable: &InodeTable, rec: &Record) -> Result<()> {
    let p = payload::XattrRemove::decode(&rec.payload)?;
    let idx = match itable.lookup_by_inode(rec.ino) {
        Ok(i) => i,
        Err(_) => return Ok(()),
    };
    let ns = xattr::Namespace::from_u32(p.ns as u32)?;
    match xattr::remove(ctx.strings, ctx.nodes, idx, ns, &p.key) {
        Ok(_) => Ok(()),
        Err(FsError::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Frees nodes whose link count is zero. At mount time no open handle can
/// exist, so nothing holds an orphan alive.
pub(crate) fn sweep_unreferenced(ctx: TreeCtx<'_>, data: &BlockStore, itable: &mut InodeTable) {
    for idx in 0..ctx.nodes.high() {
        // SAFETY: single-threaded during mount.
        let node = unsafe { ctx.nodes.node(idx) };
        if node.is_free() || node.nlink != 0 {
            continue;
        }
        debug!("recovery: sweeping unreferenced inode {}", node.ino);
        itable.unlink(node.ino);
        data.free_blocks(node.ino, 0);
        ctx.nodes.free(idx);
    }
}

/// The post-recovery consistency pass: verifies every quiescent-point
/// invariant of the data model and fails the mount with `ErrCorrupt` on
/// any violation.
pub(crate) fn check(ctx: TreeCtx<'_>, data: &BlockStore, itable: &InodeTable) -> Result<()> {
    let corrupt = |what: &str| {
        error!("consistency: {what}");
        FsError::Corrupt
    };

    // SAFETY: caller has quiesced mutations (mount, or the fs-wide lock).
    unsafe {
        if ctx.nodes.high() == 0 {
            return Err(corrupt("no root node"));
        }
        let root = ctx.nodes.node(ROOT_IDX);
        if root.is_free() || !root.is_dir() || root.parent != NO_INDEX {
            return Err(corrupt("root is not a parentless directory"));
        }

        let mut refs: HashMap<u32, u32> = HashMap::new();
        let mut visited_dirs: HashSet<u32> = HashSet::new();
        let mut reachable: HashSet<u32> = HashSet::new();
        reachable.insert(ROOT_IDX);
        let mut queue = VecDeque::from([ROOT_IDX]);

        while let Some(idx) = queue.pop_front() {
            if !visited_dirs.insert(idx) {
                return Err(corrupt("directory reachable twice"));
            }
            let dir = ctx.nodes.node(idx);
            if dir.size != 0 {
                return Err(corrupt("directory with nonzero byte size"));
            }
            if data.block_count(dir.ino) != 0 {
                return Err(corrupt("directory with payload blocks"));
            }

            let ents = tree::child_slice(ctx, idx).to_vec();
            let mut names = Vec::with_capacity(ents.len());
            for ent in &ents {
                names.push(ctx.strings.get_str(ent.name_off)?);
            }
            if !names.iter().tuple_windows().all(|(a, b)| a < b) {
                return Err(corrupt("child list not strictly ascending"));
            }

            let mut subdirs = 0;
            for ent in &ents {
                if ent.idx >= ctx.nodes.high() || ctx.nodes.node(ent.idx).is_free() {
                    return Err(corrupt("child entry points at a free slot"));
                }
                let child = ctx.nodes.node(ent.idx);
                *refs.entry(ent.idx).or_insert(0) += 1;
                reachable.insert(ent.idx);
                if child.parent == NO_INDEX {
                    return Err(corrupt("non-root node with sentinel parent"));
                }
                if child.is_dir() {
                    if child.parent != idx {
                        return Err(corrupt("directory parent pointer mismatch"));
                    }
                    subdirs += 1;
                    queue.push_back(ent.idx);
                }
                // Files carry a best-effort parent pointer only: a node
                // hardlinked into two directories cannot name both, and
                // unlinking the edge it names leaves it pointing at the
                // history, not the survivor. Directories are strict.
                // Every node's own name offset must resolve (multi-link
                // nodes carry their most recent edge name).
                ctx.strings.get_str(child.name_off)?;
            }

            let expected = 2 + subdirs;
            if dir.nlink != expected {
                return Err(corrupt("directory link count mismatch"));
            }
        }

        for (&idx, &count) in &refs {
            let node = ctx.nodes.node(idx);
            if !node.is_dir() && node.nlink != count {
                return Err(corrupt("file link count does not match entry count"));
            }
        }

        let orphan_count = itable.orphans().count() as u32;
        if reachable.len() as u32 + orphan_count != ctx.nodes.in_use() {
            return Err(corrupt("arena contains unreachable live nodes"));
        }

        for &idx in &reachable {
            let node = ctx.nodes.node(idx);
            if itable.lookup_by_inode(node.ino).ok() != Some(idx)
                || itable.lookup_by_index(idx).ok() != Some(node.ino)
            {
                return Err(corrupt("inode table disagrees with the arena"));
            }
        }
    }
    Ok(())
}
