//! The write-ahead log.
//!
//! An append-only, fsync'd log of logical operations. No mutation to the
//! arenas may be visible as committed until a COMMIT record covering it
//! has been written and durably flushed: an operation appends BEGIN and
//! its redo records, mutates the in-memory arenas, appends COMMIT, and
//! only returns success after the flush.
//!
//! The file starts with `{magic "RZWL", 2-byte major, 2-byte minor,
//! 4-byte reserved}`; the low reserved byte names the active snapshot
//! generation. Each record is `{magic "RZRE", 1-byte type, 1-byte
//! reserved, 2-byte payload length, 8-byte transaction id, 8-byte
//! sequence, 8-byte inode, 8-byte timestamp (nanoseconds since the Unix
//! epoch), payload, 4-byte CRC-32 of the record through the last payload
//! byte}`, all little-endian. A torn tail record is detectable because
//! its CRC cannot match; the first framing or CRC failure marks the
//! logical end of the log and everything beyond is discarded.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{FsError, Result};
use crate::param::{now_ns, FORMAT_MAJOR, FORMAT_MINOR, RECORD_MAGIC, WAL_MAGIC};

pub const WAL_HDR_SIZE: usize = 12;
pub const RECORD_FIXED: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Begin = 1,
    Create = 2,
    Unlink = 3,
    Mkdir = 4,
    Rmdir = 5,
    Rename = 6,
    Write = 7,
    Setattr = 8,
    XattrSet = 9,
    XattrRemove = 10,
    Link = 11,
    Commit = 12,
    Abort = 13,
    Checkpoint = 14,
}

impl RecordType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Begin),
            2 => Some(Self::Create),
            3 => Some(Self::Unlink),
            4 => Some(Self::Mkdir),
            5 => Some(Self::Rmdir),
            6 => Some(Self::Rename),
            7 => Some(Self::Write),
            8 => Some(Self::Setattr),
            9 => Some(Self::XattrSet),
            10 => Some(Self::XattrRemove),
            11 => Some(Self::Link),
            12 => Some(Self::Commit),
            13 => Some(Self::Abort),
            14 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RecordHdr {
    magic: [u8; 4],
    rtype: u8,
    rsvd: u8,
    payload_len: U16,
    txid: U64,
    seq: U64,
    ino: U64,
    timestamp: U64,
}

const_assert_eq!(std::mem::size_of::<RecordHdr>(), RECORD_FIXED);

/// A scanned record, framing already validated.
#[derive(Debug, Clone)]
pub struct Record {
    pub rtype: RecordType,
    pub txid: u64,
    pub seq: u64,
    pub ino: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

pub struct Wal {
    file: File,
    /// Bytes of valid log, header included. The append position.
    len: u64,
    next_txid: u64,
    next_seq: u64,
    limit: u64,
    active_gen: u8,
}

fn header_bytes(gen: u8) -> [u8; WAL_HDR_SIZE] {
    let mut hdr = [0u8; WAL_HDR_SIZE];
    hdr[0..4].copy_from_slice(&WAL_MAGIC);
    hdr[4..6].copy_from_slice(&FORMAT_MAJOR.to_le_bytes());
    hdr[6..8].copy_from_slice(&FORMAT_MINOR.to_le_bytes());
    hdr[8] = gen;
    hdr
}

/// Parses records from the byte suffix after the file header, stopping at
/// the first framing or CRC failure.
pub fn scan(bytes: &[u8]) -> Vec<Record> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    loop {
        let rest = &bytes[pos..];
        if rest.len() < RECORD_FIXED + 4 {
            break;
        }
        let hdr = match RecordHdr::read_from_bytes(&rest[..RECORD_FIXED]) {
            Ok(h) => h,
            Err(_) => break,
        };
        if hdr.magic != RECORD_MAGIC {
            break;
        }
        let rtype = match RecordType::from_u8(hdr.rtype) {
            Some(t) => t,
            None => break,
        };
        let plen = hdr.payload_len.get() as usize;
        let total = RECORD_FIXED + plen + 4;
        if rest.len() < total {
            break;
        }
        let crc = u32::from_le_bytes(rest[RECORD_FIXED + plen..total].try_into().unwrap());
        if crc != crc32fast::hash(&rest[..RECORD_FIXED + plen]) {
            break;
        }
        out.push(Record {
            rtype,
            txid: hdr.txid.get(),
            seq: hdr.seq.get(),
            ino: hdr.ino.get(),
            timestamp: hdr.timestamp.get(),
            payload: rest[RECORD_FIXED..RECORD_FIXED + plen].to_vec(),
        });
        pos += total;
    }
    out
}

impl Wal {
    /// Creates a fresh log for a new filesystem.
    pub fn create(path: &Path, limit: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&header_bytes(0))?;
        file.sync_data()?;
        Ok(Self {
            file,
            len: WAL_HDR_SIZE as u64,
            next_txid: 1,
            next_seq: 1,
            limit,
            active_gen: 0,
        })
    }

    /// Opens an existing log, validates the header, scans the records up
    /// to the logical end, and truncates any torn tail.
    pub fn open(path: &Path, limit: u64) -> Result<(Self, Vec<Record>)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < WAL_HDR_SIZE || bytes[0..4] != WAL_MAGIC {
            return Err(FsError::Corrupt);
        }
        if u16::from_le_bytes([bytes[4], bytes[5]]) != FORMAT_MAJOR {
            return Err(FsError::Version);
        }
        let active_gen = bytes[8] & 1;
        let records = scan(&bytes[WAL_HDR_SIZE..]);
        let len = WAL_HDR_SIZE as u64
            + records
                .iter()
                .map(|r| (RECORD_FIXED + r.payload.len() + 4) as u64)
                .sum::<u64>();
        if len < bytes.len() as u64 {
            debug!("wal: discarding {} torn tail bytes", bytes.len() as u64 - len);
            file.set_len(len)?;
        }
        let next_txid = records.iter().map(|r| r.txid).max().unwrap_or(0) + 1;
        let next_seq = records.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
        Ok((
            Self {
                file,
                len,
                next_txid,
                next_seq,
                limit,
                active_gen,
            },
            records,
        ))
    }

    pub fn active_gen(&self) -> u8 {
        self.active_gen
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.len > self.limit
    }

    /// Starts a transaction: allocates an id and appends BEGIN.
    pub fn begin(&mut self, ino: u64, ts: u64) -> Result<u64> {
        let txid = self.next_txid;
        self.next_txid += 1;
        self.append(RecordType::Begin, txid, ino, ts, &[])?;
        Ok(txid)
    }

    /// Appends one record. Not durable until `commit`.
    pub fn append(
        &mut self,
        rtype: RecordType,
        txid: u64,
        ino: u64,
        ts: u64,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > u16::MAX as usize {
            return Err(FsError::Invalid);
        }
        let hdr = RecordHdr {
            magic: RECORD_MAGIC,
            rtype: rtype as u8,
            rsvd: 0,
            payload_len: U16::new(payload.len() as u16),
            txid: U64::new(txid),
            seq: U64::new(self.next_seq),
            ino: U64::new(ino),
            timestamp: U64::new(ts),
        };
        let mut buf = Vec::with_capacity(RECORD_FIXED + payload.len() + 4);
        buf.extend_from_slice(hdr.as_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&crc32fast::hash(&buf).to_le_bytes());

        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(&buf)?;
        self.next_seq += 1;
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Appends COMMIT and flushes to stable storage. This is the point at
    /// which the transaction becomes durable.
    pub fn commit(&mut self, txid: u64, ino: u64, ts: u64) -> Result<()> {
        self.append(RecordType::Commit, txid, ino, ts, &[])?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Best-effort ABORT marker. Recovery discards the transaction either
    /// way (no COMMIT), so failures here are swallowed.
    pub fn abort(&mut self, txid: u64) {
        let _ = self.append(RecordType::Abort, txid, 0, now_ns(), &[]);
    }

    /// Finishes a checkpoint: appends the CHECKPOINT marker durably,
    /// flips the active snapshot generation in the header, then truncates
    /// the records away. Replay is idempotent, so a crash between the
    /// flip and the truncate only means harmless re-application.
    pub fn finish_checkpoint(&mut self, new_gen: u8) -> Result<()> {
        self.append(RecordType::Checkpoint, 0, 0, now_ns(), &[new_gen])?;
        self.file.sync_data()?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes(new_gen))?;
        self.file.sync_data()?;
        self.active_gen = new_gen;

        self.file.set_len(WAL_HDR_SIZE as u64)?;
        self.file.sync_data()?;
        self.len = WAL_HDR_SIZE as u64;
        Ok(())
    }
}

/// Redo-record payload encodings. Each carries the minimum information to
/// redo its operation; multi-byte integers are little-endian.
pub(crate) mod payload {
    use crate::error::{FsError, Result};

    struct Dec<'a> {
        b: &'a [u8],
        pos: usize,
    }

    impl<'a> Dec<'a> {
        fn new(b: &'a [u8]) -> Self {
            Self { b, pos: 0 }
        }

        fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            if self.pos + n > self.b.len() {
                return Err(FsError::Corrupt);
            }
            let s = &self.b[self.pos..self.pos + n];
            self.pos += n;
            Ok(s)
        }

        fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        fn u16(&mut self) -> Result<u16> {
            Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
        }

        fn u32(&mut self) -> Result<u32> {
            Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
        }

        fn u64(&mut self) -> Result<u64> {
            Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
        }

        fn done(&self) -> Result<()> {
            if self.pos == self.b.len() {
                Ok(())
            } else {
                Err(FsError::Corrupt)
            }
        }
    }

    fn put_name(out: &mut Vec<u8>, name: &[u8]) {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
    }

    /// CREATE / MKDIR: where the node went and how it starts out. The new
    /// inode number rides in the record header.
    pub struct Create {
        pub parent: u32,
        pub child: u32,
        pub mode: u32,
        pub uid: u32,
        pub gid: u32,
        pub name: Vec<u8>,
    }

    impl Create {
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(22 + self.name.len());
            out.extend_from_slice(&self.parent.to_le_bytes());
            out.extend_from_slice(&self.child.to_le_bytes());
            out.extend_from_slice(&self.mode.to_le_bytes());
            out.extend_from_slice(&self.uid.to_le_bytes());
            out.extend_from_slice(&self.gid.to_le_bytes());
            put_name(&mut out, &self.name);
            out
        }

        pub fn decode(b: &[u8]) -> Result<Self> {
            let mut d = Dec::new(b);
            let parent = d.u32()?;
            let child = d.u32()?;
            let mode = d.u32()?;
            let uid = d.u32()?;
            let gid = d.u32()?;
            let nlen = d.u16()? as usize;
            let name = d.take(nlen)?.to_vec();
            d.done()?;
            Ok(Self { parent, child, mode, uid, gid, name })
        }
    }

    /// UNLINK / RMDIR / LINK: a directory edge. The affected inode rides
    /// in the record header.
    pub struct Edge {
        pub parent: u32,
        pub name: Vec<u8>,
    }

    impl Edge {
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(6 + self.name.len());
            out.extend_from_slice(&self.parent.to_le_bytes());
            put_name(&mut out, &self.name);
            out
        }

        pub fn decode(b: &[u8]) -> Result<Self> {
            let mut d = Dec::new(b);
            let parent = d.u32()?;
            let nlen = d.u16()? as usize;
            let name = d.take(nlen)?.to_vec();
            d.done()?;
            Ok(Self { parent, name })
        }
    }

    pub struct Rename {
        pub src_parent: u32,
        pub dst_parent: u32,
        pub flags: u32,
        pub src_name: Vec<u8>,
        pub dst_name: Vec<u8>,
    }

    impl Rename {
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&self.src_parent.to_le_bytes());
            out.extend_from_slice(&self.dst_parent.to_le_bytes());
            out.extend_from_slice(&self.flags.to_le_bytes());
            put_name(&mut out, &self.src_name);
            put_name(&mut out, &self.dst_name);
            out
        }

        pub fn decode(b: &[u8]) -> Result<Self> {
            let mut d = Dec::new(b);
            let src_parent = d.u32()?;
            let dst_parent = d.u32()?;
            let flags = d.u32()?;
            let slen = d.u16()? as usize;
            let src_name = d.take(slen)?.to_vec();
            let dlen = d.u16()? as usize;
            let dst_name = d.take(dlen)?.to_vec();
            d.done()?;
            Ok(Self { src_parent, dst_parent, flags, src_name, dst_name })
        }
    }

    /// WRITE: one block-bounded chunk of caller bytes.
    pub struct Write {
        pub offset: u64,
        pub data: Vec<u8>,
    }

    impl Write {
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(12 + self.data.len());
            out.extend_from_slice(&self.offset.to_le_bytes());
            out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.data);
            out
        }

        pub fn decode(b: &[u8]) -> Result<Self> {
            let mut d = Dec::new(b);
            let offset = d.u64()?;
            let len = d.u32()? as usize;
            let data = d.take(len)?.to_vec();
            d.done()?;
            Ok(Self { offset, data })
        }
    }

    /// SETATTR: a full snapshot of the settable fields plus the mask that
    /// selects which ones apply.
    pub struct Setattr {
        pub mask: u32,
        pub mode: u32,
        pub uid: u32,
        pub gid: u32,
        pub size: u64,
        pub atime_ns: u64,
        pub mtime_ns: u64,
        pub ctime_ns: u64,
    }

    impl Setattr {
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(48);
            out.extend_from_slice(&self.mask.to_le_bytes());
            out.extend_from_slice(&self.mode.to_le_bytes());
            out.extend_from_slice(&self.uid.to_le_bytes());
            out.extend_from_slice(&self.gid.to_le_bytes());
            out.extend_from_slice(&self.size.to_le_bytes());
            out.extend_from_slice(&self.atime_ns.to_le_bytes());
            out.extend_from_slice(&self.mtime_ns.to_le_bytes());
            out.extend_from_slice(&self.ctime_ns.to_le_bytes());
            out
        }

        pub fn decode(b: &[u8]) -> Result<Self> {
            let mut d = Dec::new(b);
            let out = Self {
                mask: d.u32()?,
                mode: d.u32()?,
                uid: d.u32()?,
                gid: d.u32()?,
                size: d.u64()?,
                atime_ns: d.u64()?,
                mtime_ns: d.u64()?,
                ctime_ns: d.u64()?,
            };
            d.done()?;
            Ok(out)
        }
    }

    pub struct XattrSet {
        pub ns: u8,
        pub key: Vec<u8>,
        pub value: Vec<u8>,
    }

    impl XattrSet {
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.push(self.ns);
            put_name(&mut out, &self.key);
            out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.value);
            out
        }

        pub fn decode(b: &[u8]) -> Result<Self> {
            let mut d = Dec::new(b);
            let ns = d.u8()?;
            let klen = d.u16()? as usize;
            let key = d.take(klen)?.to_vec();
            let vlen = d.u32()? as usize;
            let value = d.take(vlen)?.to_vec();
            d.done()?;
            Ok(Self { ns, key, value })
        }
    }

    pub struct XattrRemove {
        pub ns: u8,
        pub key: Vec<u8>,
    }

    impl XattrRemove {
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.push(self.ns);
            put_name(&mut out, &self.key);
            out
        }

        pub fn decode(b: &[u8]) -> Result<Self> {
            let mut d = Dec::new(b);
            let ns = d.u8()?;
            let klen = d.u16()? as usize;
            let key = d.take(klen)?.to_vec();
            d.done()?;
            Ok(Self { ns, key })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wal_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("wal")
    }

    #[test]
    fn records_roundtrip_through_a_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = Wal::create(&wal_path(&dir), 1 << 20).unwrap();
        let tx = w.begin(7, 111).unwrap();
        w.append(RecordType::Create, tx, 7, 111, b"payload").unwrap();
        w.commit(tx, 7, 112).unwrap();
        drop(w);

        let (_, recs) = Wal::open(&wal_path(&dir), 1 << 20).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].rtype, RecordType::Begin);
        assert_eq!(recs[1].rtype, RecordType::Create);
        assert_eq!(recs[1].payload, b"payload");
        assert_eq!(recs[2].rtype, RecordType::Commit);
        assert!(recs.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn a_torn_tail_marks_the_logical_end() {
        let dir = tempfile::tempdir().unwrap();
        let p = wal_path(&dir);
        let mut w = Wal::create(&p, 1 << 20).unwrap();
        let tx = w.begin(1, 1).unwrap();
        w.append(RecordType::Write, tx, 1, 1, &[0xab; 100]).unwrap();
        w.commit(tx, 1, 2).unwrap();
        drop(w);

        // Chop into the middle of the COMMIT record.
        let len = std::fs::metadata(&p).unwrap().len();
        let f = OpenOptions::new().write(true).open(&p).unwrap();
        f.set_len(len - 10).unwrap();
        drop(f);

        let (w, recs) = Wal::open(&p, 1 << 20).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs.last().unwrap().rtype, RecordType::Write);
        // The torn bytes are gone from the file as well.
        assert_eq!(std::fs::metadata(&p).unwrap().len(), w.len());
    }

    #[test]
    fn a_corrupt_byte_ends_the_log_there() {
        let dir = tempfile::tempdir().unwrap();
        let p = wal_path(&dir);
        let mut w = Wal::create(&p, 1 << 20).unwrap();
        let t1 = w.begin(1, 1).unwrap();
        w.commit(t1, 1, 1).unwrap();
        let t2 = w.begin(2, 2).unwrap();
        w.commit(t2, 2, 2).unwrap();
        drop(w);

        // Flip a payload-adjacent byte in the third record.
        let mut bytes = std::fs::read(&p).unwrap();
        let off = WAL_HDR_SIZE + 2 * (RECORD_FIXED + 4) + 20;
        bytes[off] ^= 0x01;
        std::fs::write(&p, &bytes).unwrap();

        let (_, recs) = Wal::open(&p, 1 << 20).unwrap();
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.txid == 1));
    }

    #[test]
    fn checkpoint_resets_the_log_and_flips_the_generation() {
        let dir = tempfile::tempdir().unwrap();
        let p = wal_path(&dir);
        let mut w = Wal::create(&p, 128).unwrap();
        let tx = w.begin(1, 1).unwrap();
        w.commit(tx, 1, 1).unwrap();
        w.finish_checkpoint(1).unwrap();
        assert_eq!(w.len(), WAL_HDR_SIZE as u64);
        drop(w);

        let (w, recs) = Wal::open(&p, 128).unwrap();
        assert_eq!(w.active_gen(), 1);
        assert!(recs.is_empty());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = wal_path(&dir);
        Wal::create(&p, 1 << 20).unwrap();
        let mut bytes = std::fs::read(&p).unwrap();
        bytes[4] = 0x42;
        std::fs::write(&p, &bytes).unwrap();
        assert!(matches!(Wal::open(&p, 1 << 20), Err(FsError::Version)));
    }
}
