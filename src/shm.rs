//! Snapshot regions: the persistence backing for the arenas.
//!
//! Each region is a memory-mapped file laid out as a fixed header
//! `{magic "RZFS", 2-byte major, 2-byte minor, 8-byte capacity, 8-byte
//! used, 4-byte CRC-32 over the preceding 24 bytes}` followed by payload
//! bytes, all little-endian. A region is written whole at checkpoint time
//! and read whole at mount; the working arenas live in process memory in
//! between, so uncommitted mutations can never leak into the persistent
//! image.
//!
//! On open, magic and version are validated and the header CRC is
//! checked; a CRC failure declares the region corrupt, and a version
//! mismatch fails with `ErrVersion`.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{Mmap, MmapMut};
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, IntoBytes, Immutable, KnownLayout};

use crate::error::{FsError, Result};
use crate::param::{FORMAT_MAJOR, FORMAT_MINOR, REGION_MAGIC};

pub const REGION_HDR_SIZE: usize = 28;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RegionHeader {
    magic: [u8; 4],
    major: U16,
    minor: U16,
    capacity: U64,
    used: U64,
    crc: U32,
}

const_assert_eq!(std::mem::size_of::<RegionHeader>(), REGION_HDR_SIZE);

fn header_crc(hdr: &RegionHeader) -> u32 {
    crc32fast::hash(&hdr.as_bytes()[..REGION_HDR_SIZE - 4])
}

/// Writes a region file: header plus payload, flushed to stable storage.
pub fn store(path: &Path, capacity: u64, payload: &[u8]) -> Result<()> {
    if payload.len() as u64 > capacity {
        return Err(FsError::Capacity);
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.set_len(REGION_HDR_SIZE as u64 + capacity)?;
    // SAFETY: the file is private to the engine; no other mapping of it
    // is mutated while this one is live.
    let mut map = unsafe { MmapMut::map_mut(&file)? };

    let mut hdr = RegionHeader {
        magic: REGION_MAGIC,
        major: U16::new(FORMAT_MAJOR),
        minor: U16::new(FORMAT_MINOR),
        capacity: U64::new(capacity),
        used: U64::new(payload.len() as u64),
        crc: U32::new(0),
    };
    hdr.crc = U32::new(header_crc(&hdr));

    map[..REGION_HDR_SIZE].copy_from_slice(hdr.as_bytes());
    map[REGION_HDR_SIZE..REGION_HDR_SIZE + payload.len()].copy_from_slice(payload);
    map.flush()?;
    Ok(())
}

/// Reads and validates a region file, returning the used payload bytes.
pub fn load(path: &Path) -> Result<Vec<u8>> {
    let file = OpenOptions::new().read(true).open(path)?;
    // SAFETY: read-only mapping of an engine-private file.
    let map = unsafe { Mmap::map(&file)? };
    if map.len() < REGION_HDR_SIZE {
        return Err(FsError::Corrupt);
    }
    let hdr = RegionHeader::read_from_bytes(&map[..REGION_HDR_SIZE]).map_err(|_| FsError::Corrupt)?;
    if hdr.magic != REGION_MAGIC {
        return Err(FsError::Corrupt);
    }
    if hdr.major.get() != FORMAT_MAJOR {
        return Err(FsError::Version);
    }
    if hdr.crc.get() != crc32fast::hash(&map[..REGION_HDR_SIZE - 4]) {
        return Err(FsError::Corrupt);
    }
    let used = hdr.used.get();
    if used > hdr.capacity.get() || REGION_HDR_SIZE as u64 + used > map.len() as u64 {
        return Err(FsError::Corrupt);
    }
    Ok(map[REGION_HDR_SIZE..REGION_HDR_SIZE + used as usize].to_vec())
}
