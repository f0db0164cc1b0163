//! Engine-wide constants and the mount-time configuration.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Root node index. The root is always the first slot in the node arena.
pub const ROOT_IDX: u32 = 0;

/// Root inode number.
pub const ROOT_INO: u64 = 1;

/// Sentinel parent index carried by the root node and by free slots.
pub const NO_INDEX: u32 = u32::MAX;

/// Sentinel arena offset meaning "none". Offset 0 is never handed out.
pub const NO_OFFSET: u32 = 0;

/// Node record size. Two cache lines.
pub const NODE_SIZE: usize = 128;

/// Child entries held inline in a directory node before spilling.
pub const INLINE_CHILDREN: usize = 6;

/// Entry count of the first spill chunk a directory is promoted into.
pub const SPILL_FIRST_CAP: u32 = 16;

/// On-disk format version.
pub const FORMAT_MAJOR: u16 = 1;
pub const FORMAT_MINOR: u16 = 0;

/// Magic values fixed by the persistence layout.
pub const REGION_MAGIC: [u8; 4] = *b"RZFS";
pub const WAL_MAGIC: [u8; 4] = *b"RZWL";
pub const RECORD_MAGIC: [u8; 4] = *b"RZRE";
pub const BLOCK_MAGIC: [u8; 4] = *b"RZCP";

/// Mount-time configuration. Everything tunable about the engine goes
/// through here; the engine holds no process-wide state beyond what the
/// handle references.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the persistence region files.
    pub region_dir: PathBuf,

    /// Total persistence capacity in bytes, split across the arenas by
    /// the `*_capacity` accessors below.
    pub region_capacity: u64,

    /// Path of the write-ahead log file.
    pub wal_path: PathBuf,

    /// WAL size past which a commit triggers a checkpoint.
    pub wal_size_limit: u64,

    /// File payload block size.
    pub block_size: u32,

    /// Blocks shorter than this are stored uncompressed.
    pub compress_threshold: u32,

    /// Structural mutations between breadth-first re-layouts.
    pub rebalance_interval: u32,

    /// Maximum filename length in bytes.
    pub max_name_len: u32,

    /// Maximum number of extended attributes per inode.
    pub max_xattrs: u32,

    /// Maximum total xattr value bytes per inode.
    pub max_xattr_bytes: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_dir: PathBuf::from("."),
            region_capacity: 64 << 20,
            wal_path: PathBuf::from("razorfs.wal"),
            wal_size_limit: 8 << 20,
            block_size: 4096,
            compress_threshold: 512,
            rebalance_interval: 100,
            max_name_len: 255,
            max_xattrs: 64,
            max_xattr_bytes: 64 << 10,
        }
    }
}

impl Config {
    /// Node arena slot count: an eighth of the capacity, 128 bytes a slot.
    pub fn node_slots(&self) -> u32 {
        ((self.region_capacity / 8) / NODE_SIZE as u64) as u32
    }

    /// String arena capacity in bytes: an eighth of the capacity.
    pub fn string_capacity(&self) -> u32 {
        (self.region_capacity / 8) as u32
    }

    /// Child spill arena capacity in entries: a sixteenth of the capacity,
    /// 8 bytes an entry.
    pub fn spill_slots(&self) -> u32 {
        ((self.region_capacity / 16) / 8) as u32
    }

    /// Data region slot count: the remaining capacity over the stored
    /// block size (payload plus slot metadata).
    pub fn data_slots(&self) -> u32 {
        let rest = self.region_capacity - self.region_capacity / 8 * 2 - self.region_capacity / 16;
        (rest / (self.block_size as u64 + crate::fs::data::SLOT_META_SIZE as u64)) as u32
    }
}

/// Current time as nanoseconds since the Unix epoch. All engine
/// timestamps are nanosecond-granularity.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
