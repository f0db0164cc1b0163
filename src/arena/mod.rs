//! The backing arenas.
//!
//! An arena is a contiguous, append-biased region holding fixed-shape
//! records addressed by a small integer index or offset. The engine keeps
//! its whole working state in four of them:
//!
//! * [`StringArena`]: interned names, xattr keys, xattr values and chain
//!   records (C1).
//! * [`NodeArena`]: the 128-byte node records (C2).
//! * [`SpillArena`]: directory child entries past the inline fan-out.
//! * the data region of `fs::data`, holding file payload blocks.
//!
//! Arenas live in process memory; durability comes from the snapshot
//! regions (`shm`) plus the write-ahead log. Reads of published bytes take
//! no lock: entries are never moved once written, and the few in-place
//! mutations (node records, child lists, xattr chain links) are guarded by
//! the owning node's lock. Appends serialize on a per-arena writer lock
//! held only for the append itself, never across a higher-level operation.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

mod nodes;
mod strings;

pub use nodes::{ChildEnt, Node, NodeArena, SpillArena};
pub use strings::StringArena;

/// A fixed-capacity byte buffer with interior mutability and a published
/// high-water mark.
///
/// Bytes below `used` are published: they are readable without
/// synchronization because nothing mutates them except under the lock
/// that publishes them (the arena's writer lock for appends, a node lock
/// for in-place record updates, where readers of the record hold the same
/// lock).
pub(crate) struct RawBuf {
    data: Box<[UnsafeCell<u8>]>,
    used: AtomicU32,
}

// SAFETY: all access to the interior bytes goes through the unsafe
// accessors below, whose callers uphold the arena locking discipline.
unsafe impl Sync for RawBuf {}

impl RawBuf {
    pub fn new(capacity: u32) -> Self {
        Self {
            data: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            used: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    /// Publishes a new high-water mark.
    pub fn store_used(&self, used: u32) {
        self.used.store(used, Ordering::Release);
    }

    /// Returns a view of `len` bytes at `off`.
    ///
    /// # Safety
    ///
    /// The range must be in bounds, and the caller must hold whatever lock
    /// guards concurrent mutation of it (none for append-only published
    /// bytes, the owning node's lock for mutable records).
    pub unsafe fn slice(&self, off: u32, len: u32) -> &[u8] {
        debug_assert!(off as usize + len as usize <= self.data.len());
        std::slice::from_raw_parts(self.data[off as usize].get(), len as usize)
    }

    /// Returns a mutable view of `len` bytes at `off`.
    ///
    /// # Safety
    ///
    /// The range must be in bounds and the caller must have exclusive
    /// access to it under the locking discipline.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, off: u32, len: u32) -> &mut [u8] {
        debug_assert!(off as usize + len as usize <= self.data.len());
        std::slice::from_raw_parts_mut(self.data[off as usize].get(), len as usize)
    }

    /// All published bytes, for writing a snapshot.
    ///
    /// # Safety
    ///
    /// The caller must have quiesced all writers (the filesystem-wide
    /// exclusive lock is held).
    pub unsafe fn contents(&self) -> &[u8] {
        self.slice(0, self.used())
    }

    /// Replaces the buffer contents from a snapshot payload.
    pub fn load(&mut self, payload: &[u8]) -> crate::error::Result<()> {
        if payload.len() > self.data.len() {
            return Err(crate::error::FsError::Corrupt);
        }
        // Exclusive by &mut; no other view of the cells exists.
        for (cell, b) in self.data.iter_mut().zip(payload) {
            *cell.get_mut() = *b;
        }
        self.store_used(payload.len() as u32);
        Ok(())
    }
}
