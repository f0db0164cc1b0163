//! razorfs: an in-process filesystem data engine.
//!
//! The engine sits behind a userspace-filesystem bridge (FUSE or similar)
//! and owns everything below the callback layer. Five layers, leaves
//! first:
//!
//!   + Arenas: an interned string store, fixed-size cache-aligned node
//!     records, child-entry spill, and compressed payload blocks.
//!   + Snapshots: double-buffered memory-mapped region files that
//!     persist the arenas at each checkpoint.
//!   + Log: a CRC-framed, fsync'd write-ahead log; no mutation is
//!     visible as committed until its COMMIT record is durable.
//!   + Tree: the directory hierarchy, with per-node reader/writer locks
//!     acquired in ascending index order.
//!   + Handle: [`RazorFs`], returned by `mount` and threaded through
//!     every call by the bridge.
//!
//! Timestamps are nanoseconds since the Unix epoch throughout. All
//! persisted multi-byte integers are little-endian.

#![warn(rust_2018_idioms)]

mod arena;
mod error;
mod fs;
mod lock;
mod param;
mod shm;

pub use error::{FsError, Result};
pub use fs::{
    Attr, DirEntry, FileType, Namespace, RazorFs, RenameFlags, Setattr, SetattrMask, Statfs,
    XattrFlags,
};
pub use param::Config;
