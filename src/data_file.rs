//! Per-channel append-only data file (design §4.2).
//!
//! A thin layer over the BFS: a data file is identified by `(channel,
//! number)` and lives at the path `channel_<channel:03>/channel_<channel:03>_file_<number:06>.dat`
//! (design §6). Appends become BFS blobs at that path; rollover creates a
//! new path with `number + 1`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bfs::{BlobFileSystem, BlobPath};
use crate::error::Result;
use crate::record::Record;

/// Builds the directory path for a channel, e.g. `"channel_000"`.
pub fn channel_dir(channel: u32) -> BlobPath {
    BlobPath::new(format!("channel_{channel:03}"))
}

/// Builds the data-file path for `(channel, number)`, e.g.
/// `"channel_000/channel_000_file_000001.dat"`.
pub fn data_file_path(channel: u32, number: u64) -> BlobPath {
    channel_dir(channel).join(&format!("channel_{channel:03}_file_{number:06}.dat"))
}

/// A single data file: append-only record stream plus the bookkeeping
/// (`logicalSize`, `liveBytes`) housekeeping needs to decide on retirement.
pub struct DataFile {
    bfs: Arc<dyn BlobFileSystem>,
    channel: u32,
    number: u64,
    path: BlobPath,
    logical_size: AtomicU64,
    live_bytes: AtomicU64,
    /// Set once this file has been found corrupt; housekeeping and the
    /// writer both refuse to touch a quarantined file further (design §7).
    quarantined: std::sync::atomic::AtomicBool,
}

impl DataFile {
    /// Opens (or creates) the data file at `(channel, number)`, seeding its
    /// logical size from whatever the BFS already reports and its live
    /// byte count from `initial_live_bytes` (supplied by the index rebuild
    /// on open, since a fresh file starts with its full size live).
    pub fn open(
        bfs: Arc<dyn BlobFileSystem>,
        channel: u32,
        number: u64,
        initial_live_bytes: u64,
    ) -> Result<Self> {
        let path = data_file_path(channel, number);
        let logical_size = bfs.size(&path)?;
        Ok(DataFile {
            bfs,
            channel,
            number,
            path,
            logical_size: AtomicU64::new(logical_size),
            live_bytes: AtomicU64::new(initial_live_bytes),
            quarantined: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &BlobPath {
        &self.path
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::SeqCst)
    }

    pub fn quarantine(&self) {
        self.quarantined.store(true, Ordering::SeqCst);
    }

    /// Appends an already-encoded record, returning its starting position.
    /// Used by the storer's commit path, which pre-encodes every record in
    /// a commit before issuing any BFS calls so that a mid-commit failure
    /// never leaves a half-written record on disk.
    pub fn append_encoded(&self, encoded: &[u8]) -> Result<u64> {
        let position = self.logical_size.load(Ordering::SeqCst);
        self.bfs.write(&self.path, &[encoded])?;
        self.logical_size.fetch_add(encoded.len() as u64, Ordering::SeqCst);
        self.live_bytes.fetch_add(encoded.len() as u64, Ordering::SeqCst);
        Ok(position)
    }

    /// Reads and decodes the record at `position..position+length`
    /// (design §4.3 Invariant C: the caller is expected to have gotten
    /// these coordinates from a trustworthy index entry).
    pub fn read_record(&self, position: u64, length: u32) -> Result<Record> {
        let bytes = self.bfs.read(&self.path, position, Some(length as u64))?;
        Record::decode(&bytes)
    }

    /// Reads this file's bytes in full, used to mirror a file to the backup
    /// directory before retirement (design §7).
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.bfs.read(&self.path, 0, None)
    }

    /// Marks `length` bytes as no longer live (a housekeeping sweep or
    /// gravestone write determined the record at this position is
    /// unreachable).
    pub fn mark_dead(&self, length: u64) {
        self.live_bytes.fetch_sub(length, Ordering::SeqCst);
    }

    /// Truncates the file back to `pre_commit_len`, discarding any bytes a
    /// failed commit appended (design §4.6 rollback).
    pub fn truncate_to(&self, pre_commit_len: u64) -> Result<()> {
        self.bfs.truncate(&self.path, pre_commit_len)?;
        let dropped = self.logical_size.load(Ordering::SeqCst).saturating_sub(pre_commit_len);
        self.logical_size.store(pre_commit_len, Ordering::SeqCst);
        self.live_bytes.fetch_sub(dropped, Ordering::SeqCst);
        Ok(())
    }

    /// Whether an append of `additional` bytes would push this file past
    /// `max_size` (design §4.2 rollover trigger).
    pub fn would_exceed(&self, additional: u64, max_size: u64) -> bool {
        self.logical_size.load(Ordering::SeqCst) + additional > max_size
    }

    /// `liveBytes / logicalSize < threshold` (design §4.2). A file with
    /// zero logical size is never eligible (nothing to reclaim).
    pub fn needs_retirement(&self, threshold: f64, is_current_target: bool) -> bool {
        if is_current_target || self.is_quarantined() {
            return false;
        }
        let logical = self.logical_size() as f64;
        if logical == 0.0 {
            return false;
        }
        (self.live_bytes() as f64 / logical) < threshold
    }

    /// Deletes this file's underlying blobs entirely. Used once
    /// housekeeping has copied its surviving records elsewhere.
    pub fn delete(&self) -> Result<()> {
        self.bfs.delete(&self.path)
    }
}
