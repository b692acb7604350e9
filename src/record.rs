//! On-disk framing for entity records and the root file.
//!
//! Both formats are fixed, little-endian byte layouts specified down to the
//! field, so they are hand-encoded here rather than routed through a
//! generic serializer such as `bincode`.

use crate::error::{Error, Result};
use crate::oid::{Oid, Tid};

/// Fixed header size of an entity record: length(4) + oid(8) + tid(4) + timestamp(8).
pub const RECORD_HEADER_LEN: usize = 24;

/// A decoded entity record header plus a view of its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub oid: Oid,
    pub tid: Tid,
    pub timestamp: u64,
    pub body: Vec<u8>,
}

impl Record {
    /// A normal (non-gravestone) record.
    pub fn new(oid: Oid, tid: Tid, timestamp: u64, body: Vec<u8>) -> Self {
        Record { oid, tid, timestamp, body }
    }

    /// A gravestone marking `oid` unreachable as of `timestamp`.
    pub fn gravestone(oid: Oid, timestamp: u64) -> Self {
        Record { oid, tid: crate::oid::NULL_TID, timestamp, body: Vec::new() }
    }

    pub fn is_gravestone(&self) -> bool {
        self.tid == crate::oid::NULL_TID
    }

    /// Total on-disk size of this record, header included.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.body.len()
    }

    /// Encodes the record into its on-disk little-endian byte layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        let length = self.encoded_len() as u32;
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&self.oid.to_le_bytes());
        buf.extend_from_slice(&self.tid.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decodes a record from a buffer that holds *exactly* one record,
    /// including its length prefix (as returned by a BFS range read using
    /// the length recorded in an index entry).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(Error::corruption(format!(
                "record buffer too short: {} < {}",
                buf.len(),
                RECORD_HEADER_LEN
            )));
        }
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if length != buf.len() {
            return Err(Error::corruption(format!(
                "record length header {length} does not match buffer size {}",
                buf.len()
            )));
        }
        let oid = Oid::from_le_bytes(buf[4..12].try_into().unwrap());
        let tid = Tid::from_le_bytes(buf[12..16].try_into().unwrap());
        let timestamp = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let body = buf[24..].to_vec();
        Ok(Record { oid, tid, timestamp, body })
    }

    /// Reads just the length prefix of a record starting at `buf[0..4]`,
    /// used while scanning a file sequentially without decoding the whole
    /// record up front.
    pub fn peek_length(buf: &[u8]) -> Result<u32> {
        if buf.len() < 4 {
            return Err(Error::corruption("buffer too short to contain a length prefix"));
        }
        Ok(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
    }
}

/// Magic bytes identifying a root file: ASCII "NBRT".
pub const ROOT_MAGIC: u32 = 0x4E425254;

/// Decoded contents of `root.bin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootFile {
    pub root_oid: Oid,
    /// High-water mark of the oid allocator, persisted in the extension
    /// region (SPEC_FULL.md §3) so recovery need not always rescan every
    /// record to resume the allocator.
    pub last_allocated_oid: Oid,
}

const ROOT_CORE_LEN: usize = 4 + 8 + 4; // magic + rootOid + crc
const ROOT_EXT_LEN: usize = 8 + 4; // lastAllocatedOid + crc

impl RootFile {
    pub fn new(root_oid: Oid, last_allocated_oid: Oid) -> Self {
        RootFile { root_oid, last_allocated_oid }
    }

    /// Encodes the core 16-byte region followed by the extension region.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ROOT_CORE_LEN + ROOT_EXT_LEN);
        buf.extend_from_slice(&ROOT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.root_oid.to_le_bytes());
        let core_crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&core_crc.to_le_bytes());

        let ext_start = buf.len();
        buf.extend_from_slice(&self.last_allocated_oid.to_le_bytes());
        let ext_crc = crc32fast::hash(&buf[ext_start..]);
        buf.extend_from_slice(&ext_crc.to_le_bytes());
        buf
    }

    /// Decodes and validates a root file. Readers that only understand the
    /// first 16 bytes (no extension region) still validate, with
    /// `last_allocated_oid` defaulting to `0`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ROOT_CORE_LEN {
            return Err(Error::corruption("root file shorter than core region"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != ROOT_MAGIC {
            return Err(Error::corruption(format!("bad root magic: {magic:#x}")));
        }
        let root_oid = Oid::from_le_bytes(buf[4..12].try_into().unwrap());
        let stored_crc = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let actual_crc = crc32fast::hash(&buf[0..12]);
        if stored_crc != actual_crc {
            return Err(Error::corruption("root file checksum mismatch"));
        }

        let last_allocated_oid = if buf.len() >= ROOT_CORE_LEN + ROOT_EXT_LEN {
            let ext = &buf[ROOT_CORE_LEN..ROOT_CORE_LEN + ROOT_EXT_LEN];
            let value = Oid::from_le_bytes(ext[0..8].try_into().unwrap());
            let stored_ext_crc = u32::from_le_bytes(ext[8..12].try_into().unwrap());
            let actual_ext_crc = crc32fast::hash(&ext[0..8]);
            if stored_ext_crc != actual_ext_crc {
                return Err(Error::corruption("root file extension checksum mismatch"));
            }
            value
        } else {
            0
        };

        Ok(RootFile { root_oid, last_allocated_oid })
    }
}
