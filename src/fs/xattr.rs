//! Extended attributes.
//!
//! Per-inode attributes chained through the string arena: each entry is a
//! 20-byte record `{namespace, key offset, value offset, value length,
//! next offset}`, the node holds the chain head, and new entries go in at
//! the head. Retrieval scans the chain linearly; xattr counts are small.
//!
//! Keys are interned (deduplicated); values are appended as blobs. A
//! replaced value's old blob stays in the arena until the next rebuild,
//! since entries are never freed mid-session.
//!
//! All functions here require the caller to hold the owning node's lock
//! (write for mutation, read otherwise); they are `unsafe` for that
//! reason, in addition to trusting the node index.

use bitflags::bitflags;

use crate::arena::{NodeArena, StringArena};
use crate::error::{FsError, Result};
use crate::param::{Config, NO_OFFSET};

/// Chain record payload length in the string arena.
pub const XATTR_REC_LEN: u16 = 20;

bitflags! {
    /// Mirrors the create/replace exclusivity of `setxattr(2)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XattrFlags: u32 {
        /// Fail with `ErrExists` if the key is already present.
        const CREATE = 1;
        /// Fail with `ErrNotFound` if the key is absent.
        const REPLACE = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Namespace {
    User = 0,
    Trusted = 1,
    Security = 2,
    System = 3,
}

impl Namespace {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::User),
            1 => Ok(Self::Trusted),
            2 => Ok(Self::Security),
            3 => Ok(Self::System),
            _ => Err(FsError::Corrupt),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Rec {
    ns: u32,
    key_off: u32,
    val_off: u32,
    val_len: u32,
    next: u32,
}

impl Rec {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != XATTR_REC_LEN as usize {
            return Err(FsError::Corrupt);
        }
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        Ok(Self {
            ns: word(0),
            key_off: word(1),
            val_off: word(2),
            val_len: word(3),
            next: word(4),
        })
    }

    fn encode(&self, out: &mut [u8]) {
        for (i, v) in [self.ns, self.key_off, self.val_off, self.val_len, self.next]
            .into_iter()
            .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
    }
}

/// Walks the chain looking for `(ns, key)`. Returns the matching record
/// offset, its predecessor's offset (`NO_OFFSET` when the match is the
/// head), plus the chain length and total value bytes seen.
unsafe fn find(
    strings: &StringArena,
    head: u32,
    ns: Namespace,
    key: &[u8],
) -> Result<(Option<(u32, u32)>, u32, u64)> {
    let mut found = None;
    let mut prev = NO_OFFSET;
    let mut cur = head;
    let mut count = 0;
    let mut total = 0u64;
    while cur != NO_OFFSET {
        let rec = Rec::decode(strings.record(cur)?)?;
        if found.is_none() && rec.ns == ns as u32 && strings.get_str(rec.key_off)? == key {
            found = Some((cur, prev));
        }
        count += 1;
        total += rec.val_len as u64;
        prev = cur;
        cur = rec.next;
    }
    Ok((found, count, total))
}

/// Sets an attribute per `flags`. Caller holds the node's write lock.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn set(
    strings: &StringArena,
    nodes: &NodeArena,
    idx: u32,
    ns: Namespace,
    key: &[u8],
    value: &[u8],
    flags: XattrFlags,
    cfg: &Config,
) -> Result<()> {
    if key.is_empty() || key.len() > cfg.max_name_len as usize {
        return Err(FsError::InvalidName);
    }
    let node = nodes.node_mut(idx);
    let (found, count, total) = find(strings, node.xattr_off, ns, key)?;

    match found {
        Some((off, _)) => {
            if flags.contains(XattrFlags::CREATE) {
                return Err(FsError::Exists);
            }
            let old = Rec::decode(strings.record(off)?)?;
            if total - old.val_len as u64 + value.len() as u64 > cfg.max_xattr_bytes as u64 {
                return Err(FsError::Capacity);
            }
            let val_off = strings.blob(value)?;
            let mut rec = old;
            rec.val_off = val_off;
            rec.val_len = value.len() as u32;
            rec.encode(strings.record_mut(off)?);
        }
        None => {
            if flags.contains(XattrFlags::REPLACE) {
                return Err(FsError::NotFound);
            }
            if count >= cfg.max_xattrs || total + value.len() as u64 > cfg.max_xattr_bytes as u64 {
                return Err(FsError::Capacity);
            }
            let key_off = strings.intern(key)?;
            let val_off = strings.blob(value)?;
            let off = strings.alloc_record(XATTR_REC_LEN)?;
            Rec {
                ns: ns as u32,
                key_off,
                val_off,
                val_len: value.len() as u32,
                next: node.xattr_off,
            }
            .encode(strings.record_mut(off)?);
            node.xattr_off = off;
        }
    }
    Ok(())
}

/// Reads an attribute value. Caller holds at least the node's read lock.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn get(
    strings: &StringArena,
    nodes: &NodeArena,
    idx: u32,
    ns: Namespace,
    key: &[u8],
) -> Result<Vec<u8>> {
    let node = nodes.node(idx);
    let (found, _, _) = find(strings, node.xattr_off, ns, key)?;
    let (off, _) = found.ok_or(FsError::NotFound)?;
    let rec = Rec::decode(strings.record(off)?)?;
    let val = strings.get_blob(rec.val_off)?;
    if val.len() != rec.val_len as usize {
        return Err(FsError::Corrupt);
    }
    Ok(val.to_vec())
}

/// Lists `(namespace, key)` pairs, head first. Caller holds at least the
/// node's read lock.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn list(
    strings: &StringArena,
    nodes: &NodeArena,
    idx: u32,
) -> Result<Vec<(Namespace, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut cur = nodes.node(idx).xattr_off;
    while cur != NO_OFFSET {
        let rec = Rec::decode(strings.record(cur)?)?;
        out.push((
            Namespace::from_u32(rec.ns)?,
            strings.get_str(rec.key_off)?.to_vec(),
        ));
        cur = rec.next;
    }
    Ok(out)
}

/// Looks `(ns, key)` up without mutating, for pre-transaction validation
/// and rollback snapshots: `(record offset, value offset, value length)`.
///
/// # Safety
///
/// See the module docs; a read lock suffices.
pub(crate) unsafe fn probe(
    strings: &StringArena,
    nodes: &NodeArena,
    idx: u32,
    ns: Namespace,
    key: &[u8],
) -> Result<Option<(u32, u32, u32)>> {
    let (found, _, _) = find(strings, nodes.node(idx).xattr_off, ns, key)?;
    match found {
        Some((off, _)) => {
            let rec = Rec::decode(strings.record(off)?)?;
            Ok(Some((off, rec.val_off, rec.val_len)))
        }
        None => Ok(None),
    }
}

/// Points an existing record back at an earlier value, undoing a replace.
///
/// # Safety
///
/// Caller holds the node's write lock on the record's owner.
pub(crate) unsafe fn restore_value(
    strings: &StringArena,
    rec_off: u32,
    val_off: u32,
    val_len: u32,
) -> Result<()> {
    let mut rec = Rec::decode(strings.record(rec_off)?)?;
    rec.val_off = val_off;
    rec.val_len = val_len;
    rec.encode(strings.record_mut(rec_off)?);
    Ok(())
}

/// Removes an attribute. Returns `(predecessor offset, removed offset)`
/// so a failed transaction can splice the record back in (the removed
/// record's own `next` still points into the remaining chain).
///
/// Caller holds the node's write lock.
///
/// # Safety
///
/// See the module docs.
pub unsafe fn remove(
    strings: &StringArena,
    nodes: &NodeArena,
    idx: u32,
    ns: Namespace,
    key: &[u8],
) -> Result<(u32, u32)> {
    let node = nodes.node_mut(idx);
    let (found, _, _) = find(strings, node.xattr_off, ns, key)?;
    let (off, prev) = found.ok_or(FsError::NotFound)?;
    let rec = Rec::decode(strings.record(off)?)?;
    if prev == NO_OFFSET {
        node.xattr_off = rec.next;
    } else {
        let mut p = Rec::decode(strings.record(prev)?)?;
        p.next = rec.next;
        p.encode(strings.record_mut(prev)?);
    }
    Ok((prev, off))
}

/// Splices a just-removed record back into the chain, for rollback.
///
/// # Safety
///
/// Caller holds the node's write lock and `removed` came from the
/// matching [`remove`] on the same chain, with no mutation in between.
pub(crate) unsafe fn unremove(
    strings: &StringArena,
    nodes: &NodeArena,
    idx: u32,
    prev: u32,
    removed: u32,
) -> Result<()> {
    if prev == NO_OFFSET {
        nodes.node_mut(idx).xattr_off = removed;
    } else {
        let mut p = Rec::decode(strings.record(prev)?)?;
        p.next = removed;
        p.encode(strings.record_mut(prev)?);
    }
    Ok(())
}
