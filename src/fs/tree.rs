//! The n-ary tree engine: child lookup, insertion, deletion, ancestry
//! checks, and the periodic breadth-first re-layout.
//!
//! Children of a directory are a compact sequence of `{name, index}`
//! entries in strictly ascending order of the interned name bytes: lookup
//! is a binary search, insertion slides later entries, deletion compacts
//! in place. Up to the inline fan-out the sequence lives in the node
//! record; past it, in a spill chunk that doubles as it grows and is
//! given back once the directory shrinks inline again.
//!
//! Functions here mutate arena structure only. Locking, WAL records and
//! transaction rollback belong to the caller: every function is `unsafe`
//! with the contract that the caller holds the owning directory's lock
//! (write for mutation) or is otherwise single-threaded, as during
//! recovery and rebalance.

use hashbrown::HashMap;
use std::collections::VecDeque;

use crate::arena::{ChildEnt, Node, NodeArena, SpillArena, StringArena};
use crate::error::{FsError, Result};
use crate::fs::inode::InodeTable;
use crate::param::{INLINE_CHILDREN, NO_INDEX, NO_OFFSET, ROOT_IDX, SPILL_FIRST_CAP};

/// The three arenas every structural operation needs.
#[derive(Clone, Copy)]
pub struct TreeCtx<'a> {
    pub nodes: &'a NodeArena,
    pub strings: &'a StringArena,
    pub spill: &'a SpillArena,
}

/// The current child entries of `dir_idx`, sorted ascending by name.
///
/// # Safety
///
/// Caller holds at least a read lock on `dir_idx`.
pub unsafe fn child_slice<'a>(ctx: TreeCtx<'a>, dir_idx: u32) -> &'a [ChildEnt] {
    let node = ctx.nodes.node(dir_idx);
    if node.spill_off == NO_OFFSET {
        &node.children[..node.nchildren as usize]
    } else {
        ctx.spill.entries(node.spill_off, node.nchildren)
    }
}

/// Binary search over a directory's children. `Ok(pos)` when `name` is
/// present, `Err(pos)` with the insertion point otherwise.
unsafe fn search(
    ctx: TreeCtx<'_>,
    dir_idx: u32,
    name: &[u8],
) -> Result<std::result::Result<usize, usize>> {
    let slice = child_slice(ctx, dir_idx);
    let mut lo = 0;
    let mut hi = slice.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match ctx.strings.get_str(slice[mid].name_off)?.cmp(name) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

/// Looks a name up in a directory.
///
/// # Safety
///
/// Caller holds at least a read lock on `dir_idx`.
pub unsafe fn lookup(ctx: TreeCtx<'_>, dir_idx: u32, name: &[u8]) -> Result<u32> {
    if !ctx.nodes.node(dir_idx).is_dir() {
        return Err(FsError::NotDir);
    }
    match search(ctx, dir_idx, name)? {
        Ok(pos) => Ok(child_slice(ctx, dir_idx)[pos].idx),
        Err(_) => Err(FsError::NotFound),
    }
}

/// Inserts a `{name, child}` entry, preserving the sort order. Fails with
/// `ErrExists` if the name is taken and `ErrCapacity` if the spill arena
/// cannot grow the directory. On the capacity path nothing is mutated.
///
/// # Safety
///
/// Caller holds the write lock on `dir_idx`.
pub unsafe fn insert_child(ctx: TreeCtx<'_>, dir_idx: u32, name_off: u32, child: u32) -> Result<()> {
    let name = ctx.strings.get_str(name_off)?;
    let pos = match search(ctx, dir_idx, name)? {
        Ok(_) => return Err(FsError::Exists),
        Err(pos) => pos,
    };
    let ent = ChildEnt { name_off, idx: child };
    let (n, spill_off, spill_cap) = {
        let node = ctx.nodes.node(dir_idx);
        (node.nchildren as usize, node.spill_off, node.spill_cap)
    };

    if spill_off == NO_OFFSET && n < INLINE_CHILDREN {
        let node = ctx.nodes.node_mut(dir_idx);
        node.children.copy_within(pos..n, pos + 1);
        node.children[pos] = ent;
        node.nchildren += 1;
        return Ok(());
    }

    if spill_off == NO_OFFSET {
        // Inline array is full: promote to the first spill chunk.
        let chunk = ctx.spill.alloc(SPILL_FIRST_CAP)?;
        let node = ctx.nodes.node_mut(dir_idx);
        let ents = ctx.spill.entries_mut(chunk);
        ents[..pos].copy_from_slice(&node.children[..pos]);
        ents[pos] = ent;
        ents[pos + 1..=n].copy_from_slice(&node.children[pos..n]);
        node.spill_off = chunk;
        node.spill_cap = SPILL_FIRST_CAP;
        node.nchildren += 1;
        return Ok(());
    }

    if n as u32 == spill_cap {
        // Grow into a doubled chunk, then retire the old one.
        let new_cap = spill_cap * 2;
        let chunk = ctx.spill.alloc(new_cap)?;
        {
            let old = ctx.spill.entries(spill_off, n as u32);
            let ents = ctx.spill.entries_mut(chunk);
            ents[..pos].copy_from_slice(&old[..pos]);
            ents[pos] = ent;
            ents[pos + 1..=n].copy_from_slice(&old[pos..n]);
        }
        ctx.spill.free(spill_off);
        let node = ctx.nodes.node_mut(dir_idx);
        node.spill_off = chunk;
        node.spill_cap = new_cap;
        node.nchildren += 1;
        return Ok(());
    }

    let ents = ctx.spill.entries_mut(spill_off);
    ents.copy_within(pos..n, pos + 1);
    ents[pos] = ent;
    ctx.nodes.node_mut(dir_idx).nchildren += 1;
    Ok(())
}

/// Removes the entry for `name`, compacting the sequence. A directory
/// shrunk back to the inline fan-out migrates out of its spill chunk.
///
/// # Safety
///
/// Caller holds the write lock on `dir_idx`.
pub unsafe fn remove_child(ctx: TreeCtx<'_>, dir_idx: u32, name: &[u8]) -> Result<ChildEnt> {
    let pos = match search(ctx, dir_idx, name)? {
        Ok(pos) => pos,
        Err(_) => return Err(FsError::NotFound),
    };
    let (n, spill_off) = {
        let node = ctx.nodes.node(dir_idx);
        (node.nchildren as usize, node.spill_off)
    };

    let removed;
    if spill_off == NO_OFFSET {
        let node = ctx.nodes.node_mut(dir_idx);
        removed = node.children[pos];
        node.children.copy_within(pos + 1..n, pos);
        node.nchildren -= 1;
    } else {
        {
            let ents = ctx.spill.entries_mut(spill_off);
            removed = ents[pos];
            ents.copy_within(pos + 1..n, pos);
        }
        let node = ctx.nodes.node_mut(dir_idx);
        node.nchildren -= 1;
        if node.nchildren as usize <= INLINE_CHILDREN {
            let m = node.nchildren as usize;
            let mut inline = [ChildEnt { name_off: 0, idx: 0 }; INLINE_CHILDREN];
            inline[..m].copy_from_slice(&ctx.spill.entries(spill_off, m as u32)[..m]);
            node.children = inline;
            ctx.spill.free(spill_off);
            node.spill_off = NO_OFFSET;
            node.spill_cap = 0;
        }
    }
    Ok(removed)
}

/// Whether `maybe_ancestor` is `idx` itself or an ancestor of it. Used by
/// rename cycle prevention: moving a directory under its own descendant
/// must fail with `ErrLoop`.
///
/// # Safety
///
/// Caller must hold the rename serialization lock (parent pointers of the
/// walked nodes must not be re-parented concurrently) or be
/// single-threaded.
pub unsafe fn is_ancestor(ctx: TreeCtx<'_>, maybe_ancestor: u32, idx: u32) -> Result<bool> {
    let mut cur = idx;
    let mut steps = 0u32;
    loop {
        if cur == maybe_ancestor {
            return Ok(true);
        }
        if cur == ROOT_IDX {
            return Ok(false);
        }
        cur = ctx.nodes.node(cur).parent;
        if cur == NO_INDEX {
            return Ok(false);
        }
        steps += 1;
        if steps > ctx.nodes.capacity() {
            // A parent cycle is structural corruption, not a user error.
            return Err(FsError::Corrupt);
        }
    }
}

/// Breadth-first re-layout of the node arena for cache locality: live
/// nodes are compacted into ascending BFS order, all indices are
/// remapped, and the spill arena is rebuilt. Returns the old-to-new index
/// map. Correctness never depends on when (or whether) this runs, and
/// running it twice in a row is a no-op layout-wise.
///
/// # Safety
///
/// Caller holds the filesystem-wide write lock.
pub unsafe fn rebalance(ctx: TreeCtx<'_>, itable: &mut InodeTable) -> Result<HashMap<u32, u32>> {
    let mut order: Vec<u32> = Vec::with_capacity(ctx.nodes.in_use() as usize);
    let mut queue = VecDeque::new();
    queue.push_back(ROOT_IDX);
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        let node = ctx.nodes.node(idx);
        if node.is_dir() {
            for ent in child_slice(ctx, idx) {
                queue.push_back(ent.idx);
            }
        }
    }
    // Orphans (link count zero, held open) are unreachable from the root
    // but must survive the re-layout.
    let mut orphans: Vec<u32> = itable.orphans().collect();
    orphans.sort_unstable();
    order.extend(&orphans);

    let map: HashMap<u32, u32> = order
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, new as u32))
        .collect();
    if map.len() != order.len() {
        return Err(FsError::Corrupt);
    }

    // Copy out, remap, rebuild. The spill arena is reconstructed from
    // scratch so it compacts along with the nodes.
    let mut spilled: Vec<(usize, Vec<ChildEnt>)> = Vec::new();
    let mut new_nodes: Vec<Node> = Vec::with_capacity(order.len());
    for (new, &old) in order.iter().enumerate() {
        let mut node = *ctx.nodes.node(old);
        if node.parent != NO_INDEX {
            node.parent = *map.get(&node.parent).ok_or(FsError::Corrupt)?;
        }
        if node.is_dir() && node.nchildren > 0 {
            let mut ents = child_slice(ctx, old).to_vec();
            for e in &mut ents {
                e.idx = *map.get(&e.idx).ok_or(FsError::Corrupt)?;
            }
            if ents.len() <= INLINE_CHILDREN {
                node.children[..ents.len()].copy_from_slice(&ents);
                node.spill_off = NO_OFFSET;
                node.spill_cap = 0;
            } else {
                spilled.push((new, ents));
            }
        }
        new_nodes.push(node);
    }

    ctx.spill.reset();
    for (new, ents) in spilled {
        let mut cap = SPILL_FIRST_CAP;
        while (ents.len() as u32) > cap {
            cap *= 2;
        }
        let chunk = ctx.spill.alloc(cap)?;
        ctx.spill.entries_mut(chunk)[..ents.len()].copy_from_slice(&ents);
        new_nodes[new].spill_off = chunk;
        new_nodes[new].spill_cap = cap;
    }

    ctx.nodes.install(&new_nodes);
    itable.remap(&map);
    Ok(map)
}
