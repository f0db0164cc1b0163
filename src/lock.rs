//! The locking discipline.
//!
//! Every node carries a reader/writer lock, held in a table indexed by
//! node index rather than co-located in the node record (a lock cannot
//! meaningfully survive a process exit, and keeping it out of the record
//! keeps the record a plain persistable value).
//!
//! Deadlock freedom rests on three rules:
//!
//! * An operation that must hold several node locks at once acquires them
//!   in ascending node-index order, through [`LockTable::write_pair`] or
//!   [`LockTable::write_set`]. It never blocks on a lock while holding a
//!   higher-indexed one.
//! * Path traversal uses try-lock coupling: the child lock is *tried*
//!   while the parent's is held, and on contention the walk releases
//!   everything and restarts from the root. A traversal therefore never
//!   blocks while holding a lock, so it cannot close a wait cycle with a
//!   mutator.
//! * Ancestry checks during rename read parent pointers of nodes outside
//!   the locked set; all renames serialize on [`LockTable::rename`] so two
//!   renames cannot concurrently re-parent around each other's cycle check.
//!
//! The whole-filesystem lock `tree` is held shared by every operation and
//! exclusively only by rebalance and checkpoint, which need a quiesced
//! arena. Locks are `parking_lot` primitives: task-fair, so a stream of
//! readers cannot starve a waiting writer.

use arrayvec::ArrayVec;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Guard over one node's lock, write mode.
pub type NodeWriteGuard<'a> = RwLockWriteGuard<'a, ()>;
/// Guard over one node's lock, read mode.
pub type NodeReadGuard<'a> = RwLockReadGuard<'a, ()>;

/// The most node locks any single operation holds at once (rename with
/// replacement: both parents, the moving node, the replaced node).
pub const MAX_LOCK_SET: usize = 4;

pub struct LockTable {
    node: Box<[RwLock<()>]>,

    /// Filesystem-wide lock. Shared by every operation, exclusive for
    /// rebalance and checkpoint.
    pub tree: RwLock<()>,

    /// Serializes renames against each other; see the module docs.
    pub rename: Mutex<()>,
}

impl LockTable {
    pub fn new(slots: u32) -> Self {
        Self {
            node: (0..slots).map(|_| RwLock::new(())).collect(),
            tree: RwLock::new(()),
            rename: Mutex::new(()),
        }
    }

    pub fn read(&self, idx: u32) -> NodeReadGuard<'_> {
        self.node[idx as usize].read()
    }

    /// Non-blocking read acquisition, for lock coupling during traversal.
    pub fn try_read(&self, idx: u32) -> Option<NodeReadGuard<'_>> {
        self.node[idx as usize].try_read()
    }

    pub fn write(&self, idx: u32) -> NodeWriteGuard<'_> {
        self.node[idx as usize].write()
    }

    /// Write-locks two nodes in ascending index order. The indices may be
    /// equal, in which case a single guard is returned.
    pub fn write_pair(&self, a: u32, b: u32) -> ArrayVec<NodeWriteGuard<'_>, 2> {
        let mut guards = ArrayVec::new();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        guards.push(self.write(lo));
        if hi != lo {
            guards.push(self.write(hi));
        }
        guards
    }

    /// Write-locks a set of nodes in ascending index order, deduplicated.
    pub fn write_set(
        &self,
        idxs: &mut ArrayVec<u32, MAX_LOCK_SET>,
    ) -> ArrayVec<NodeWriteGuard<'_>, MAX_LOCK_SET> {
        idxs.sort_unstable();
        let mut prev: Option<u32> = None;
        idxs.retain(|i| {
            let keep = prev != Some(*i);
            prev = Some(*i);
            keep
        });
        idxs.iter().map(|&i| self.write(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pair_handles_equal_indices() {
        let t = LockTable::new(4);
        let guards = t.write_pair(2, 2);
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn set_is_sorted_and_deduplicated() {
        let t = LockTable::new(8);
        let mut set: ArrayVec<u32, MAX_LOCK_SET> = ArrayVec::new();
        set.extend([5, 1, 5, 3]);
        let guards = t.write_set(&mut set);
        assert_eq!(set.as_slice(), &[1, 3, 5]);
        assert_eq!(guards.len(), 3);
    }

    #[test]
    fn opposite_pair_orders_do_not_deadlock() {
        let t = Arc::new(LockTable::new(2));
        let mut handles = Vec::new();
        for flip in [false, true] {
            let t = Arc::clone(&t);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let (a, b) = if flip { (1, 0) } else { (0, 1) };
                    let _g = t.write_pair(a, b);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
