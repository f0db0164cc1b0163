//! File payload storage: fixed-size blocks with transparent compression.
//!
//! A file's bytes are a sequence of `block_size` blocks addressed by
//! `(inode, block index)`; the mapping lives here, outside the node
//! record, and is rebuilt from a slot scan on load. Missing blocks are
//! holes and read as zeros.
//!
//! Each stored block is framed `{magic "RZCP", 4-byte original length,
//! 4-byte stored length}` followed by payload. A block is compressed only
//! when both hold: the live data length reaches the configured threshold,
//! and the compressed output is strictly smaller than the original minus
//! the header overhead. Otherwise it is stored raw and the header marks
//! it as such (stored length == original length). Reads decompress
//! transparently.

use hashbrown::HashMap;
use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::arena::RawBuf;
use crate::error::{FsError, Result};
use crate::param::BLOCK_MAGIC;

pub const SLOT_META_SIZE: usize = 32;

const SLOT_USED: u32 = 1;
const SLOT_FREE: u32 = 0;

/// Block header overhead charged against the compression benefit check.
const HDR_OVERHEAD: u32 = 12;

/// Slot metadata: ownership tag for the mount-time scan, then the on-disk
/// block header, then padding to 32 bytes.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct SlotMeta {
    ino: U64,
    blk: U32,
    state: U32,
    magic: [u8; 4],
    orig: U32,
    stored: U32,
    rsvd: U32,
}

const_assert_eq!(std::mem::size_of::<SlotMeta>(), SLOT_META_SIZE);

struct MapState {
    /// `(inode, block index)` -> slot index.
    map: HashMap<(u64, u32), u32>,
    free: Vec<u32>,
    bump: u32,
}

pub struct BlockStore {
    buf: RawBuf,
    slot_count: u32,
    block_size: u32,
    threshold: u32,
    state: Mutex<MapState>,
}

impl BlockStore {
    pub fn new(slot_count: u32, block_size: u32, threshold: u32) -> Self {
        let slot_size = SLOT_META_SIZE as u32 + block_size;
        Self {
            buf: RawBuf::new(slot_count * slot_size),
            slot_count,
            block_size,
            threshold,
            state: Mutex::new(MapState {
                map: HashMap::new(),
                free: Vec::new(),
                bump: 0,
            }),
        }
    }

    fn slot_size(&self) -> u32 {
        SLOT_META_SIZE as u32 + self.block_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn slots_in_use(&self) -> u32 {
        self.state.lock().map.len() as u32
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    fn slot_off(&self, slot: u32) -> u32 {
        slot * self.slot_size()
    }

    /// Reads a block back, decompressing if needed. `None` is a hole.
    ///
    /// The caller holds at least a read lock on the owning file's node,
    /// which is what guards the slot bytes.
    pub fn read_block(&self, ino: u64, blk: u32) -> Result<Option<Vec<u8>>> {
        let slot = match self.state.lock().map.get(&(ino, blk)) {
            Some(&s) => s,
            None => return Ok(None),
        };
        let off = self.slot_off(slot);
        // SAFETY: in bounds; the owning node's lock guards the bytes.
        let bytes = unsafe { self.buf.slice(off, self.slot_size()) };
        let meta =
            SlotMeta::read_from_bytes(&bytes[..SLOT_META_SIZE]).map_err(|_| FsError::Corrupt)?;
        if meta.magic != BLOCK_MAGIC || meta.orig.get() != self.block_size {
            return Err(FsError::Corrupt);
        }
        let stored = meta.stored.get();
        if stored > self.block_size {
            return Err(FsError::Corrupt);
        }
        let payload = &bytes[SLOT_META_SIZE..SLOT_META_SIZE + stored as usize];
        if stored == meta.orig.get() {
            Ok(Some(payload.to_vec()))
        } else {
            lz4_flex::block::decompress(payload, self.block_size as usize)
                .map(Some)
                .map_err(|_| FsError::Corrupt)
        }
    }

    /// Stored (possibly compressed) length of a block, if present.
    pub fn stored_len(&self, ino: u64, blk: u32) -> Option<u32> {
        let slot = *self.state.lock().map.get(&(ino, blk))?;
        let off = self.slot_off(slot);
        // SAFETY: as in read_block.
        let bytes = unsafe { self.buf.slice(off, SLOT_META_SIZE as u32) };
        SlotMeta::read_from_bytes(bytes).ok().map(|m| m.stored.get())
    }

    /// Stores a full block. `data` must be exactly `block_size` bytes
    /// (zero-padded past the file's live range); `live` is the number of
    /// meaningful bytes, which drives the compression threshold.
    ///
    /// The caller holds the owning file node's write lock.
    pub fn write_block(&self, ino: u64, blk: u32, data: &[u8], live: u32) -> Result<()> {
        debug_assert_eq!(data.len(), self.block_size as usize);
        let compressed = if live >= self.threshold {
            let out = lz4_flex::block::compress(data);
            if (out.len() as u32) < self.block_size - HDR_OVERHEAD {
                Some(out)
            } else {
                None
            }
        } else {
            None
        };

        let slot = {
            let mut st = self.state.lock();
            match st.map.get(&(ino, blk)) {
                Some(&s) => s,
                None => {
                    let s = if let Some(s) = st.free.pop() {
                        s
                    } else if st.bump < self.slot_count {
                        st.bump += 1;
                        st.bump - 1
                    } else {
                        return Err(FsError::Capacity);
                    };
                    st.map.insert((ino, blk), s);
                    s
                }
            }
        };

        let (stored, payload): (u32, &[u8]) = match &compressed {
            Some(out) => (out.len() as u32, out),
            None => (self.block_size, data),
        };
        let meta = SlotMeta {
            ino: U64::new(ino),
            blk: U32::new(blk),
            state: U32::new(SLOT_USED),
            magic: BLOCK_MAGIC,
            orig: U32::new(self.block_size),
            stored: U32::new(stored),
            rsvd: U32::new(0),
        };
        let off = self.slot_off(slot);
        // SAFETY: slot owned by (ino, blk) and guarded by the caller's
        // node write lock; a freshly allocated slot is invisible to others.
        let bytes = unsafe { self.buf.slice_mut(off, self.slot_size()) };
        bytes[..SLOT_META_SIZE].copy_from_slice(meta.as_bytes());
        bytes[SLOT_META_SIZE..SLOT_META_SIZE + payload.len()].copy_from_slice(payload);
        self.buf
            .store_used(self.buf.used().max(off + self.slot_size()));
        Ok(())
    }

    /// Number of stored blocks belonging to `ino`.
    pub fn block_count(&self, ino: u64) -> u32 {
        self.state.lock().map.keys().filter(|(i, _)| *i == ino).count() as u32
    }

    /// Drops a single block.
    ///
    /// The caller holds the owning file node's write lock.
    pub fn free_block(&self, ino: u64, blk: u32) {
        let mut st = self.state.lock();
        if let Some(slot) = st.map.remove(&(ino, blk)) {
            let off = self.slot_off(slot);
            // SAFETY: the slot just left the map; the caller's node write
            // lock excludes readers of this file.
            let bytes = unsafe { self.buf.slice_mut(off, SLOT_META_SIZE as u32) };
            bytes[12..16].copy_from_slice(&SLOT_FREE.to_le_bytes());
            st.free.push(slot);
        }
    }

    /// Drops every block of `ino` at or past `from_blk` (truncate) or all
    /// of them (`from_blk == 0`, unlink).
    ///
    /// The caller holds the owning file node's write lock.
    pub fn free_blocks(&self, ino: u64, from_blk: u32) {
        let mut st = self.state.lock();
        let victims: Vec<(u64, u32)> = st
            .map
            .keys()
            .filter(|(i, b)| *i == ino && *b >= from_blk)
            .copied()
            .collect();
        for key in victims {
            if let Some(slot) = st.map.remove(&key) {
                let off = self.slot_off(slot);
                // SAFETY: the slot just left the map; the caller's node
                // write lock excludes readers of this file.
                let bytes = unsafe { self.buf.slice_mut(off, SLOT_META_SIZE as u32) };
                // The state field sits at offset 12 of the slot metadata.
                bytes[12..16].copy_from_slice(&SLOT_FREE.to_le_bytes());
                st.free.push(slot);
            }
        }
    }

    /// Snapshot bytes up to the bump watermark.
    ///
    /// # Safety
    ///
    /// Caller must have quiesced mutations.
    pub unsafe fn snapshot(&self) -> &[u8] {
        let bump = self.state.lock().bump;
        self.buf.slice(0, bump * self.slot_size())
    }

    /// Reloads from snapshot bytes, rebuilding the block map and free
    /// list from the slot metadata.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let slot_size = self.slot_size() as usize;
        if bytes.len() % slot_size != 0 || bytes.len() / slot_size > self.slot_count as usize {
            return Err(FsError::Corrupt);
        }
        self.buf.load(bytes)?;
        let n = (bytes.len() / slot_size) as u32;
        let mut map = HashMap::new();
        let mut free = Vec::new();
        for slot in 0..n {
            let off = slot as usize * slot_size;
            let meta = SlotMeta::read_from_bytes(&bytes[off..off + SLOT_META_SIZE])
                .map_err(|_| FsError::Corrupt)?;
            match meta.state.get() {
                SLOT_USED => {
                    if meta.magic != BLOCK_MAGIC {
                        return Err(FsError::Corrupt);
                    }
                    map.insert((meta.ino.get(), meta.blk.get()), slot);
                }
                SLOT_FREE => free.push(slot),
                _ => return Err(FsError::Corrupt),
            }
        }
        *self.state.lock() = MapState { map, free, bump: n };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn store() -> BlockStore {
        BlockStore::new(16, 4096, 512)
    }

    #[test]
    fn repetitive_blocks_compress() {
        let s = store();
        let data = vec![b'A'; 4096];
        s.write_block(9, 0, &data, 4096).unwrap();
        assert!(s.stored_len(9, 0).unwrap() < 4096);
        assert_eq!(s.read_block(9, 0).unwrap().unwrap(), data);
    }

    #[test]
    fn incompressible_blocks_are_stored_raw() {
        let s = store();
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);
        s.write_block(9, 0, &data, 4096).unwrap();
        assert_eq!(s.stored_len(9, 0).unwrap(), 4096);
        assert_eq!(s.read_block(9, 0).unwrap().unwrap(), data);
    }

    #[test]
    fn short_blocks_skip_compression() {
        let s = store();
        let mut data = vec![0u8; 4096];
        data[..100].fill(b'B');
        s.write_block(9, 0, &data, 100).unwrap();
        assert_eq!(s.stored_len(9, 0).unwrap(), 4096);
    }

    #[test]
    fn missing_blocks_are_holes() {
        let s = store();
        assert!(s.read_block(9, 3).unwrap().is_none());
    }

    #[test]
    fn freed_slots_are_reused() {
        let s = BlockStore::new(2, 4096, 512);
        s.write_block(1, 0, &[0u8; 4096], 4096).unwrap();
        s.write_block(1, 1, &[0u8; 4096], 4096).unwrap();
        assert!(matches!(
            s.write_block(2, 0, &[0u8; 4096], 4096),
            Err(FsError::Capacity)
        ));
        s.free_blocks(1, 1);
        s.write_block(2, 0, &[1u8; 4096], 4096).unwrap();
        assert!(s.read_block(1, 1).unwrap().is_none());
    }

    #[test]
    fn load_rebuilds_the_block_map() {
        let mut a = store();
        let data = vec![b'Z'; 4096];
        a.write_block(5, 2, &data, 4096).unwrap();
        a.write_block(5, 3, &data, 4096).unwrap();
        a.free_blocks(5, 3);
        let snap = unsafe { a.snapshot() }.to_vec();

        let mut b = store();
        b.load(&snap).unwrap();
        assert_eq!(b.read_block(5, 2).unwrap().unwrap(), data);
        assert!(b.read_block(5, 3).unwrap().is_none());
        // The freed slot is allocatable again.
        b.write_block(6, 0, &data, 4096).unwrap();
    }
}
