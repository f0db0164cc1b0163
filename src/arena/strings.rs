//! The string arena: an append-only interned byte store for names, xattr
//! keys and values, and the xattr chain records.
//!
//! Every allocation is framed as `{kind: u16, len: u16, payload, pad}`,
//! padded so frames start on 4-byte boundaries. Offsets are 32-bit and
//! point at the frame header; offset 0 is reserved as "none". Entries are
//! never moved or freed within a mount session. Interning is idempotent
//! for identical byte sequences through a hash index rebuilt from a frame
//! walk on load.
//!
//! An invalid offset is corruption and surfaces as `ErrCorrupt`; it is
//! never swallowed.

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::RawBuf;
use crate::error::{FsError, Result};
use crate::param::NO_OFFSET;

/// Frame header size and alignment.
const FRAME_HDR: u32 = 4;
const ALIGN: u32 = 4;

/// What a frame holds. Stored in the frame header so the index can be
/// rebuilt by walking the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    /// An interned, deduplicated byte string (names, xattr keys).
    Str = 1,
    /// A fixed-size xattr chain record, mutated in place under the owning
    /// node's lock.
    XattrRec = 2,
    /// An uninterned byte blob (xattr values).
    Blob = 3,
}

impl FrameKind {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Str),
            2 => Some(Self::XattrRec),
            3 => Some(Self::Blob),
            _ => None,
        }
    }
}

struct Writer {
    /// Interned bytes -> frame offset.
    index: HashMap<Box<[u8]>, u32>,
}

pub struct StringArena {
    buf: RawBuf,
    writer: Mutex<Writer>,
}

impl StringArena {
    pub fn new(capacity: u32) -> Self {
        let arena = Self {
            buf: RawBuf::new(capacity),
            writer: Mutex::new(Writer {
                index: HashMap::new(),
            }),
        };
        // Offset 0 is the "none" sentinel; burn the first frame slot.
        arena.buf.store_used(ALIGN);
        arena
    }

    pub fn used(&self) -> u32 {
        self.buf.used()
    }

    pub fn capacity(&self) -> u32 {
        self.buf.capacity()
    }

    /// Appends a frame and publishes it. Serialized by the writer lock,
    /// which the caller must hold.
    fn append(&self, kind: FrameKind, payload_len: u16, payload: Option<&[u8]>) -> Result<u32> {
        let off = self.buf.used();
        let total = FRAME_HDR + payload_len as u32;
        let padded = (total + ALIGN - 1) & !(ALIGN - 1);
        if off.checked_add(padded).map_or(true, |end| end > self.buf.capacity()) {
            return Err(FsError::Capacity);
        }
        // SAFETY: the range is unpublished (>= used) and we hold the
        // writer lock, so no other thread reads or writes it.
        let dst = unsafe { self.buf.slice_mut(off, padded) };
        dst.fill(0);
        dst[0..2].copy_from_slice(&(kind as u16).to_le_bytes());
        dst[2..4].copy_from_slice(&payload_len.to_le_bytes());
        if let Some(p) = payload {
            dst[FRAME_HDR as usize..FRAME_HDR as usize + p.len()].copy_from_slice(p);
        }
        self.buf.store_used(off + padded);
        Ok(off)
    }

    /// Validates the frame at `off` and returns its kind and payload
    /// length. Any mismatch is corruption.
    fn frame(&self, off: u32) -> Result<(FrameKind, u16)> {
        if off == NO_OFFSET || off % ALIGN != 0 || off + FRAME_HDR > self.buf.used() {
            return Err(FsError::Corrupt);
        }
        // SAFETY: in bounds per the check above; frame headers are
        // immutable once published.
        let hdr = unsafe { self.buf.slice(off, FRAME_HDR) };
        let kind =
            FrameKind::from_u16(u16::from_le_bytes([hdr[0], hdr[1]])).ok_or(FsError::Corrupt)?;
        let len = u16::from_le_bytes([hdr[2], hdr[3]]);
        if off + FRAME_HDR + len as u32 > self.buf.used() {
            return Err(FsError::Corrupt);
        }
        Ok((kind, len))
    }

    /// Interns a byte string, returning a stable offset. Idempotent for
    /// identical byte sequences.
    pub fn intern(&self, bytes: &[u8]) -> Result<u32> {
        if bytes.len() > u16::MAX as usize {
            return Err(FsError::Invalid);
        }
        let mut w = self.writer.lock();
        if let Some(&off) = w.index.get(bytes) {
            return Ok(off);
        }
        let off = self.append(FrameKind::Str, bytes.len() as u16, Some(bytes))?;
        w.index.insert(bytes.into(), off);
        Ok(off)
    }

    /// Appends an uninterned blob (an xattr value).
    pub fn blob(&self, bytes: &[u8]) -> Result<u32> {
        if bytes.len() > u16::MAX as usize {
            return Err(FsError::Capacity);
        }
        let _w = self.writer.lock();
        self.append(FrameKind::Blob, bytes.len() as u16, Some(bytes))
    }

    /// Allocates a zeroed record frame the caller will mutate in place
    /// under its node's lock.
    pub fn alloc_record(&self, len: u16) -> Result<u32> {
        let _w = self.writer.lock();
        self.append(FrameKind::XattrRec, len, None)
    }

    /// Resolves an interned string offset.
    pub fn get_str(&self, off: u32) -> Result<&[u8]> {
        let (kind, len) = self.frame(off)?;
        if kind != FrameKind::Str {
            return Err(FsError::Corrupt);
        }
        // SAFETY: published and immutable.
        Ok(unsafe { self.buf.slice(off + FRAME_HDR, len as u32) })
    }

    /// Resolves a blob offset.
    pub fn get_blob(&self, off: u32) -> Result<&[u8]> {
        let (kind, len) = self.frame(off)?;
        if kind != FrameKind::Blob {
            return Err(FsError::Corrupt);
        }
        // SAFETY: published and immutable.
        Ok(unsafe { self.buf.slice(off + FRAME_HDR, len as u32) })
    }

    /// Read view of a record frame's payload.
    ///
    /// # Safety
    ///
    /// The caller must hold at least a read lock on the node owning the
    /// record.
    pub unsafe fn record(&self, off: u32) -> Result<&[u8]> {
        let (kind, len) = self.frame(off)?;
        if kind != FrameKind::XattrRec {
            return Err(FsError::Corrupt);
        }
        Ok(self.buf.slice(off + FRAME_HDR, len as u32))
    }

    /// Mutable view of a record frame's payload.
    ///
    /// # Safety
    ///
    /// The caller must hold the write lock on the node owning the record.
    pub unsafe fn record_mut(&self, off: u32) -> Result<&mut [u8]> {
        let (kind, len) = self.frame(off)?;
        if kind != FrameKind::XattrRec {
            return Err(FsError::Corrupt);
        }
        Ok(self.buf.slice_mut(off + FRAME_HDR, len as u32))
    }

    /// Snapshot of all published bytes.
    ///
    /// # Safety
    ///
    /// Caller must have quiesced mutations (filesystem-wide lock held).
    pub unsafe fn snapshot(&self) -> &[u8] {
        self.buf.contents()
    }

    /// Reloads the arena from a snapshot payload and rebuilds the intern
    /// index by walking the frames.
    pub fn load(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.load(payload)?;
        if self.buf.used() < ALIGN {
            self.buf.store_used(ALIGN);
        }
        let mut index = HashMap::new();
        let mut off = ALIGN;
        while off < self.buf.used() {
            let (kind, len) = self.frame(off)?;
            if kind == FrameKind::Str {
                let bytes = self.get_str(off)?;
                index.insert(bytes.into(), off);
            }
            let padded = (FRAME_HDR + len as u32 + ALIGN - 1) & !(ALIGN - 1);
            off += padded;
        }
        self.writer.lock().index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let a = StringArena::new(4096);
        let x = a.intern(b"hello").unwrap();
        let y = a.intern(b"hello").unwrap();
        assert_eq!(x, y);
        assert_eq!(a.get_str(x).unwrap(), b"hello");
        let z = a.intern(b"world").unwrap();
        assert_ne!(x, z);
    }

    #[test]
    fn offset_zero_is_reserved() {
        let a = StringArena::new(4096);
        let x = a.intern(b"a").unwrap();
        assert_ne!(x, NO_OFFSET);
        assert!(a.get_str(NO_OFFSET).is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let a = StringArena::new(64);
        assert!(a.intern(&[b'x'; 40]).is_ok());
        assert!(matches!(a.intern(&[b'y'; 40]), Err(FsError::Capacity)));
    }

    #[test]
    fn invalid_offset_is_corruption() {
        let a = StringArena::new(4096);
        let x = a.intern(b"abc").unwrap();
        assert!(matches!(a.get_str(x + 2), Err(FsError::Corrupt)));
        assert!(matches!(a.get_str(60_000), Err(FsError::Corrupt)));
        // A blob offset is not a string offset.
        let b = a.blob(b"v").unwrap();
        assert!(matches!(a.get_str(b), Err(FsError::Corrupt)));
    }

    #[test]
    fn load_rebuilds_the_intern_index() {
        let mut a = StringArena::new(4096);
        let x = a.intern(b"name").unwrap();
        let snap = unsafe { a.snapshot() }.to_vec();
        let mut b = StringArena::new(4096);
        b.load(&snap).unwrap();
        assert_eq!(b.intern(b"name").unwrap(), x);
        assert_eq!(b.get_str(x).unwrap(), b"name");
    }
}
