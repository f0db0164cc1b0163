//! The inode table.
//!
//! A bidirectional map between 64-bit inode numbers and node indices,
//! plus open-handle reference counts. Link counts live on the node record,
//! not here. Inode numbers are never reused within a session: the next
//! number is a monotonic counter, rebuilt at mount as one past the highest
//! number found in the node arena.
//!
//! A node whose link count reaches zero while handles are still open is
//! parked as an orphan: its record, payload and table entry stay alive
//! until the last `release` drops the open count to zero (invariant: a
//! link-count-zero node is freed exactly once, and only with zero open
//! handles).

use hashbrown::{HashMap, HashSet};

use crate::error::{FsError, Result};
use crate::param::ROOT_INO;

pub struct InodeTable {
    by_ino: HashMap<u64, u32>,
    by_idx: HashMap<u32, u64>,
    next_ino: u64,
    /// Open handle counts, by node index. Absent means zero.
    open: HashMap<u32, u32>,
    /// Link-count-zero nodes kept alive by open handles.
    orphans: HashSet<u32>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            by_ino: HashMap::new(),
            by_idx: HashMap::new(),
            next_ino: ROOT_INO,
            open: HashMap::new(),
            orphans: HashSet::new(),
        }
    }

    /// Draws a fresh inode number. Conservative: numbers are never handed
    /// out twice within a session.
    pub fn allocate_inode(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Replay path: makes sure the counter stays ahead of a replayed
    /// inode number.
    pub fn reserve_inode(&mut self, ino: u64) {
        self.next_ino = self.next_ino.max(ino + 1);
    }

    pub fn link(&mut self, ino: u64, idx: u32) {
        self.by_ino.insert(ino, idx);
        self.by_idx.insert(idx, ino);
        self.reserve_inode(ino);
    }

    pub fn unlink(&mut self, ino: u64) {
        if let Some(idx) = self.by_ino.remove(&ino) {
            self.by_idx.remove(&idx);
            self.open.remove(&idx);
            self.orphans.remove(&idx);
        }
    }

    pub fn lookup_by_inode(&self, ino: u64) -> Result<u32> {
        self.by_ino.get(&ino).copied().ok_or(FsError::NotFound)
    }

    pub fn lookup_by_index(&self, idx: u32) -> Result<u64> {
        self.by_idx.get(&idx).copied().ok_or(FsError::NotFound)
    }

    pub fn contains_ino(&self, ino: u64) -> bool {
        self.by_ino.contains_key(&ino)
    }

    /// Bumps the open-handle count.
    pub fn incref(&mut self, idx: u32) {
        *self.open.entry(idx).or_insert(0) += 1;
    }

    /// Drops one open handle; returns the remaining count.
    pub fn decref(&mut self, idx: u32) -> u32 {
        match self.open.get_mut(&idx) {
            Some(n) if *n > 1 => {
                *n -= 1;
                *n
            }
            Some(_) => {
                self.open.remove(&idx);
                0
            }
            None => 0,
        }
    }

    pub fn open_count(&self, idx: u32) -> u32 {
        self.open.get(&idx).copied().unwrap_or(0)
    }

    pub fn park_orphan(&mut self, idx: u32) {
        self.orphans.insert(idx);
    }

    pub fn is_orphan(&self, idx: u32) -> bool {
        self.orphans.contains(&idx)
    }

    pub fn orphans(&self) -> impl Iterator<Item = u32> + '_ {
        self.orphans.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Applies a rebalance index remapping.
    pub fn remap(&mut self, map: &HashMap<u32, u32>) {
        let remap1 = |idx: u32| map.get(&idx).copied().unwrap_or(idx);
        self.by_ino.values_mut().for_each(|v| *v = remap1(*v));
        self.by_idx = self.by_ino.iter().map(|(&ino, &idx)| (idx, ino)).collect();
        let open: HashMap<u32, u32> = self.open.drain().map(|(idx, n)| (remap1(idx), n)).collect();
        self.open = open;
        let orphans: HashSet<u32> = self.orphans.drain().map(remap1).collect();
        self.orphans = orphans;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_numbers_are_never_reused() {
        let mut t = InodeTable::new();
        let a = t.allocate_inode();
        t.link(a, 0);
        t.unlink(a);
        let b = t.allocate_inode();
        assert!(b > a);
    }

    #[test]
    fn bidirectional_lookup() {
        let mut t = InodeTable::new();
        t.link(7, 3);
        assert_eq!(t.lookup_by_inode(7).unwrap(), 3);
        assert_eq!(t.lookup_by_index(3).unwrap(), 7);
        assert!(matches!(t.lookup_by_inode(8), Err(FsError::NotFound)));
    }

    #[test]
    fn open_counts_saturate_at_zero() {
        let mut t = InodeTable::new();
        t.incref(1);
        t.incref(1);
        assert_eq!(t.decref(1), 1);
        assert_eq!(t.decref(1), 0);
        assert_eq!(t.decref(1), 0);
    }

    #[test]
    fn reserve_keeps_the_counter_ahead() {
        let mut t = InodeTable::new();
        t.reserve_inode(100);
        assert_eq!(t.allocate_inode(), 101);
    }
}
