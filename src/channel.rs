//! Channel: the single-writer unit owning one data-file stream, its entity
//! index shard, its entity cache, and its work queue (design §4.7).
//!
//! Every public operation funnels through a bounded `crossbeam_channel`
//! queue drained by one dedicated worker thread, so requests are processed
//! in arrival order exactly as design §4.7/§5 specifies, and the queue's
//! bounded capacity is the backpressure mechanism of §5 ("a `store` call
//! blocks once the target channel's queue is full").

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use crate::bfs::BlobFileSystem;
use crate::data_file::{self, DataFile};
use crate::entity_cache::{CacheStats, EntityCache};
use crate::entity_index::{EntityIndexShard, IndexEntry};
use crate::error::{Error, Result};
use crate::oid::{Oid, Tid};
use crate::record::Record;

/// Outcome of a phase run with a time budget (design §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    TimeBudgetExceeded,
}

/// The not-yet-visible bytes of one channel's share of a commit. Holds
/// everything needed to either `publish` (make the writes visible in the
/// index and cache) or `rollback` (truncate the file back to its
/// pre-commit length), per design §4.6's atomicity model.
pub struct AppendPlan {
    channel: u32,
    file_number: u64,
    pre_commit_len: u64,
    placements: Vec<Placement>,
}

impl AppendPlan {
    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn oids(&self) -> impl Iterator<Item = Oid> + '_ {
        self.placements.iter().map(|p| p.oid)
    }

    /// The fully-encoded bytes of every placement, in append order, for
    /// mirroring a successful commit to the backup directory (design §6
    /// `backupDirectory`).
    pub fn encoded_records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.placements.iter().map(|p| p.encoded.as_slice())
    }
}

struct Placement {
    oid: Oid,
    tid: Tid,
    position: u64,
    length: u32,
    body: Vec<u8>,
    encoded: Vec<u8>,
}

type Job = Box<dyn FnOnce() + Send>;

struct ChannelState {
    files: BTreeMap<u64, Arc<DataFile>>,
    current_file_number: u64,
    /// Round-robin cursor over file numbers the consolidation phase has
    /// already considered this sweep, so repeated ticks don't always
    /// re-examine the same (non-eligible) low-numbered file first.
    file_check_cursor: u64,
}

struct ChannelInner {
    id: u32,
    bfs: Arc<dyn BlobFileSystem>,
    /// Mirror target for `backupDirectory` (design §6/§7), a plain local
    /// directory regardless of `bfs`'s own backend — a backup is a
    /// file-level copy of the store's layout, not a replica of the primary
    /// backend. `None` when `backupDirectory` is unset.
    backup: Option<Arc<dyn BlobFileSystem>>,
    index: EntityIndexShard,
    cache: EntityCache,
    state: RwLock<ChannelState>,
    max_file_size: u64,
    retirement_threshold: f64,
}

/// A single channel: dedicated worker thread plus the state it owns
/// exclusively (design §4.7).
pub struct Channel {
    inner: Arc<ChannelInner>,
    sender: Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

impl Channel {
    /// Opens a channel over an already-discovered set of data files
    /// (design §4.9: recovery lists files and rebuilds or loads the index
    /// before channels start serving requests).
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: u32,
        bfs: Arc<dyn BlobFileSystem>,
        backup: Option<Arc<dyn BlobFileSystem>>,
        files: BTreeMap<u64, Arc<DataFile>>,
        current_file_number: u64,
        index_entries: BTreeMap<Oid, IndexEntry>,
        cache_threshold: u64,
        cache_timeout: Duration,
        cache_soft_ratio: f64,
        max_file_size: u64,
        retirement_threshold: f64,
        queue_capacity: usize,
    ) -> Self {
        let index = EntityIndexShard::new();
        index.replace_all(index_entries);

        let inner = Arc::new(ChannelInner {
            id,
            bfs,
            backup,
            index,
            cache: EntityCache::new(cache_threshold, cache_timeout, cache_soft_ratio),
            state: RwLock::new(ChannelState { files, current_file_number, file_check_cursor: 0 }),
            max_file_size,
            retirement_threshold,
        });

        let (sender, receiver) = channel::bounded(queue_capacity);
        let worker = Self::spawn_worker(id, receiver);
        Channel { inner, sender, worker: Some(worker) }
    }

    fn spawn_worker(id: u32, receiver: Receiver<Job>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("nebula-channel-{id:03}"))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("failed to spawn channel worker thread")
    }

    /// Submits a job to this channel's worker and blocks for its result,
    /// modeling the "submitted to the queue, processed in arrival order"
    /// contract of design §4.7 for every public operation.
    fn submit<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ChannelInner) -> T + Send + 'static,
    {
        let inner = self.inner.clone();
        let (reply_tx, reply_rx) = channel::bounded(1);
        let job: Job = Box::new(move || {
            let result = f(&inner);
            let _ = reply_tx.send(result);
        });
        self.sender.send(job).map_err(|_| Error::concurrency("channel worker is no longer accepting work"))?;
        reply_rx.recv().map_err(|_| Error::concurrency("channel worker dropped without replying"))
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn index_len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn file_numbers(&self) -> Vec<u64> {
        self.inner.state.read().expect("channel state lock poisoned").files.keys().copied().collect()
    }

    pub fn sum_logical_size(&self) -> u64 {
        self.inner.state.read().expect("channel state lock poisoned").files.values().map(|f| f.logical_size()).sum()
    }

    pub fn sum_live_bytes(&self) -> u64 {
        self.inner.state.read().expect("channel state lock poisoned").files.values().map(|f| f.live_bytes()).sum()
    }

    /// Number of this channel's data files currently quarantined (design
    /// §7: `health` must describe "any quarantined files").
    pub fn quarantined_file_count(&self) -> usize {
        self.inner
            .state
            .read()
            .expect("channel state lock poisoned")
            .files
            .values()
            .filter(|f| f.is_quarantined())
            .count()
    }

    /// Phase 1 of a commit (design §4.6): encodes and appends `records` to
    /// this channel's current file (rolling over if needed), without
    /// touching the index or cache. Returns a plan the caller later
    /// `publish`es or `rollback`s once every other channel in the commit
    /// has also succeeded or failed.
    pub fn append(&self, records: Vec<Record>) -> Result<AppendPlan> {
        self.submit(move |inner| inner.append_locked(records))?
    }

    pub fn publish(&self, plan: AppendPlan) -> Result<()> {
        self.submit(move |inner| inner.publish_locked(plan))
    }

    /// Mirrors a successful commit's records to the configured backup
    /// directory (design §6 `backupDirectory`: "commits also mirror
    /// records to this location"). A no-op when no backup directory is
    /// configured. Best-effort: mirroring happens after the primary
    /// append already succeeded, so a backup failure is logged rather
    /// than failing an otherwise-durable commit.
    pub fn mirror_to_backup(&self, plan: &AppendPlan) {
        let Some(backup) = &self.inner.backup else { return };
        let path = data_file_path(plan.channel, plan.file_number);
        for encoded in plan.encoded_records() {
            if let Err(err) = backup.write(&path, &[encoded]) {
                log::warn!("channel {:03} failed to mirror commit to backup directory: {err}", self.inner.id);
                return;
            }
        }
    }

    pub fn rollback(&self, plan: &AppendPlan) -> Result<()> {
        let channel = plan.channel;
        let file_number = plan.file_number;
        let pre_commit_len = plan.pre_commit_len;
        self.submit(move |inner| inner.rollback_locked(channel, file_number, pre_commit_len))?
    }

    /// Read-through the cache to the data file (design §4.4: admission on
    /// every successful read). Returns `None` if the oid has no live index
    /// entry (not an error: the caller asked for a possibly-absent oid).
    pub fn read(&self, oid: Oid) -> Result<Option<Vec<u8>>> {
        self.submit(move |inner| inner.read_locked(oid))?
    }

    pub fn index_entry(&self, oid: Oid) -> Option<IndexEntry> {
        self.inner.index.get(oid)
    }

    pub fn index_snapshot(&self) -> Vec<(Oid, IndexEntry)> {
        self.inner.index.snapshot()
    }

    /// Housekeeping phase 1 (design §4.8): evict expired/over-threshold
    /// cache entries. Does not need worker serialization since the cache
    /// has its own internal mutex and eviction never touches the index.
    pub fn sweep_cache(&self) {
        self.inner.cache.sweep();
    }

    /// Housekeeping phase 2 (design §4.8): consolidate at most one
    /// retirement-eligible file into the current file.
    pub fn consolidate_one_file(&self, deadline: Instant) -> Result<PhaseOutcome> {
        self.submit(move |inner| inner.consolidate_one_file_locked(deadline))?
    }

    /// Housekeeping phase 3 (design §4.8): writes a gravestone for `oid`
    /// and marks its prior record's bytes dead, through the same append
    /// path as a normal commit ("GC never blocks the writer — it appends
    /// gravestones through the normal commit path"). Returns `false` if
    /// the oid had already been retired by a concurrent sweep.
    pub fn write_gravestone(&self, oid: Oid, timestamp: u64) -> Result<bool> {
        self.submit(move |inner| inner.write_gravestone_locked(oid, timestamp))?
    }
}

impl ChannelInner {
    fn append_locked(&self, records: Vec<Record>) -> Result<AppendPlan> {
        let mut state = self.state.write().expect("channel state lock poisoned");
        let current_number = state.current_file_number;
        let additional: u64 = records.iter().map(|r| r.encoded_len() as u64).sum();

        let needs_rollover = state
            .files
            .get(&current_number)
            .map(|f| f.would_exceed(additional, self.max_file_size))
            .unwrap_or(false);
        if needs_rollover {
            let next_number = current_number + 1;
            let file = Arc::new(DataFile::open(self.bfs.clone(), self.id, next_number, 0)?);
            state.files.insert(next_number, file);
            state.current_file_number = next_number;
            log::info!("channel {:03} rolled over to data file {next_number}", self.id);
        }

        let file_number = state.current_file_number;
        let file = state.files.get(&file_number).expect("current file always present").clone();
        let pre_commit_len = file.logical_size();

        let mut placements = Vec::with_capacity(records.len());
        for record in &records {
            let encoded = record.encode();
            let position = file.append_encoded(&encoded)?;
            let length = encoded.len() as u32;
            placements.push(Placement {
                oid: record.oid,
                tid: record.tid,
                position,
                length,
                body: record.body.clone(),
                encoded,
            });
        }

        Ok(AppendPlan { channel: self.id, file_number, pre_commit_len, placements })
    }

    fn publish_locked(&self, plan: AppendPlan) {
        for placement in plan.placements {
            if placement.oid == crate::oid::NULL_OID {
                // Gravestones are never indexed; write_gravestone_locked
                // handles index removal and dead-byte bookkeeping itself.
                continue;
            }
            self.index.insert(
                placement.oid,
                IndexEntry {
                    tid: placement.tid,
                    channel: plan.channel,
                    file_number: plan.file_number,
                    position: placement.position,
                    length: placement.length,
                },
            );
            self.cache.admit(placement.oid, placement.body);
        }
    }

    fn rollback_locked(&self, _channel: u32, file_number: u64, pre_commit_len: u64) -> Result<()> {
        let state = self.state.read().expect("channel state lock poisoned");
        if let Some(file) = state.files.get(&file_number) {
            file.truncate_to(pre_commit_len)?;
        }
        Ok(())
    }

    fn read_locked(&self, oid: Oid) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.cache.get(oid) {
            return Ok(Some(bytes));
        }
        let Some(entry) = self.index.get(oid) else {
            return Ok(None);
        };
        let state = self.state.read().expect("channel state lock poisoned");
        let file = state
            .files
            .get(&entry.file_number)
            .ok_or_else(|| Error::corruption(format!("index points at missing file {}", entry.file_number)))?
            .clone();
        drop(state);

        let record = file.read_record(entry.position, entry.length)?;
        if record.oid != oid || record.tid != entry.tid {
            self.quarantine_file_locked(entry.file_number);
            return Err(Error::corruption(format!(
                "index/file mismatch for oid {oid}: index says (oid={oid}, tid={}), file has (oid={}, tid={})",
                entry.tid, record.oid, record.tid
            )));
        }
        self.cache.admit(oid, record.body.clone());
        Ok(Some(record.body))
    }

    /// Quarantines `file_number` (design §7: "the channel marks the file
    /// as quarantined and continues on a new file"). If the quarantined
    /// file was the channel's current append target, rolls over to a
    /// fresh file so future appends never land in it; readers keep
    /// failing against it with `Corruption` until an operator intervenes.
    fn quarantine_file_locked(&self, file_number: u64) {
        let mut state = self.state.write().expect("channel state lock poisoned");
        if let Some(file) = state.files.get(&file_number) {
            file.quarantine();
            log::error!("channel {:03} quarantined data file {file_number} due to corruption", self.id);
        }
        if state.current_file_number == file_number {
            let next_number = file_number + 1;
            match DataFile::open(self.bfs.clone(), self.id, next_number, 0) {
                Ok(file) => {
                    state.files.insert(next_number, Arc::new(file));
                    state.current_file_number = next_number;
                    log::info!("channel {:03} rolled over to data file {next_number} after quarantine", self.id);
                }
                Err(err) => {
                    log::error!(
                        "channel {:03} failed to roll over after quarantining file {file_number}: {err}",
                        self.id
                    );
                }
            }
        }
    }

    fn write_gravestone_locked(&self, oid: Oid, timestamp: u64) -> Result<bool> {
        let Some(old_entry) = self.index.get(oid) else {
            return Ok(false);
        };

        let plan = self.append_locked(vec![Record::gravestone(oid, timestamp)])?;
        // Gravestones are not published into the index/cache (publish_locked
        // skips oid=0 placements); apply their side effects directly.
        let state = self.state.read().expect("channel state lock poisoned");
        if let Some(old_file) = state.files.get(&old_entry.file_number) {
            old_file.mark_dead(old_entry.length as u64);
        }
        drop(state);
        drop(plan);

        self.index.remove(oid);
        self.cache.remove(oid);
        Ok(true)
    }

    fn consolidate_one_file_locked(&self, deadline: Instant) -> Result<PhaseOutcome> {
        if Instant::now() >= deadline {
            return Ok(PhaseOutcome::TimeBudgetExceeded);
        }

        let candidate = {
            let mut state = self.state.write().expect("channel state lock poisoned");
            let current = state.current_file_number;
            let numbers: Vec<u64> = state.files.keys().copied().collect();
            let found = numbers
                .iter()
                .copied()
                .find(|&n| {
                    state.files.get(&n).map(|f| f.needs_retirement(self.retirement_threshold, n == current)).unwrap_or(false)
                });
            if let Some(n) = found {
                state.file_check_cursor = n;
            }
            found
        };

        let Some(old_number) = candidate else {
            return Ok(PhaseOutcome::Completed);
        };

        let old_file = {
            let state = self.state.read().expect("channel state lock poisoned");
            state.files.get(&old_number).expect("candidate came from files map").clone()
        };

        // Back up the whole file before touching it (design §6/§7:
        // "backups are taken automatically before retirement/consolidation
        // so that corruption in housekeeping cannot lose data"). Failure
        // here aborts this tick's consolidation attempt rather than
        // proceeding to retire a file with no safety copy; the phase is
        // retried on a later tick per the housekeeping backoff policy.
        if let Some(backup) = &self.backup {
            let bytes = old_file.read_all()?;
            if !bytes.is_empty() {
                backup.write(&data_file_path(self.id, old_number), &[&bytes])?;
                log::info!("channel {:03} backed up file {old_number} before retirement", self.id);
            }
        }

        let oids = self.index.oids_in_file(old_number);
        log::info!("channel {:03} retiring file {old_number} ({} live records)", self.id, oids.len());

        for oid in oids {
            let Some(entry) = self.index.get(oid) else { continue };
            if entry.file_number != old_number {
                continue; // already relocated by a racing path, e.g. a concurrent commit
            }
            let record = old_file.read_record(entry.position, entry.length)?;
            if record.oid != oid || record.tid != entry.tid {
                // This file will never pass needs_retirement again, so
                // consolidation naturally moves on to a different
                // candidate on the next tick (design §7: "continues on a
                // new file").
                self.quarantine_file_locked(old_number);
                return Err(Error::corruption(format!(
                    "consolidation found index/file mismatch for oid {oid} in file {old_number}"
                )));
            }
            let plan = self.append_locked(vec![record])?;
            self.publish_locked(plan);
        }

        let mut state = self.state.write().expect("channel state lock poisoned");
        state.files.remove(&old_number);
        drop(state);
        old_file.delete()?;
        log::info!("channel {:03} deleted retired file {old_number}", self.id);

        Ok(PhaseOutcome::Completed)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel, which ends the worker's
        // `recv()` loop; join it so no worker outlives its `Channel`.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Deterministically selects the owning channel for `oid` (design §4.3
/// Invariant A). Grounded in the same `hash(key) mod shard_count` pattern
/// used throughout the corpus for consistent sharding; stable across
/// process restarts because it depends only on `oid` and `channel_count`.
pub fn channel_for_oid(oid: Oid, channel_count: u32) -> u32 {
    (oid % channel_count as u64) as u32
}

pub use data_file::{channel_dir, data_file_path};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bfs::local::LocalBlobFileSystem;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Channel) {
        let dir = TempDir::with_prefix("nebula-channel").unwrap();
        let bfs: Arc<dyn BlobFileSystem> = Arc::new(LocalBlobFileSystem::new(dir.path().to_path_buf()).unwrap());
        let file = Arc::new(DataFile::open(bfs.clone(), 0, 1, 0).unwrap());
        let mut files = BTreeMap::new();
        files.insert(1, file);
        let channel = Channel::open(
            0,
            bfs,
            None,
            files,
            1,
            BTreeMap::new(),
            1024 * 1024,
            Duration::from_secs(60),
            0.8,
            64 * 1024,
            0.5,
            16,
        );
        (dir, channel)
    }

    #[test]
    fn append_then_publish_makes_record_readable() {
        let (_dir, channel) = fixture();
        let rec = Record::new(1, 10, 100, b"hello".to_vec());
        let plan = channel.append(vec![rec]).unwrap();
        channel.publish(plan).unwrap();
        assert_eq!(channel.read(1).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn rollback_discards_appended_bytes() {
        let (_dir, channel) = fixture();
        let rec = Record::new(1, 10, 100, b"hello".to_vec());
        let plan = channel.append(vec![rec]).unwrap();
        channel.rollback(&plan).unwrap();
        assert_eq!(channel.read(1).unwrap(), None);
        assert_eq!(channel.sum_logical_size(), 0);
    }

    #[test]
    fn read_of_unknown_oid_is_none_not_error() {
        let (_dir, channel) = fixture();
        assert_eq!(channel.read(999).unwrap(), None);
    }

    #[test]
    fn rollover_creates_a_new_file_when_threshold_exceeded() {
        let dir = TempDir::with_prefix("nebula-channel-rollover").unwrap();
        let bfs: Arc<dyn BlobFileSystem> = Arc::new(LocalBlobFileSystem::new(dir.path().to_path_buf()).unwrap());
        let file = Arc::new(DataFile::open(bfs.clone(), 0, 1, 0).unwrap());
        let mut files = BTreeMap::new();
        files.insert(1, file);
        let channel =
            Channel::open(0, bfs, None, files, 1, BTreeMap::new(), 1024, Duration::from_secs(60), 0.8, 64, 0.5, 16);

        for i in 1..=5u64 {
            let rec = Record::new(i, 10, 100, vec![0u8; 20]);
            let plan = channel.append(vec![rec]).unwrap();
            channel.publish(plan).unwrap();
        }
        assert!(channel.file_numbers().len() > 1);
    }

    #[test]
    fn write_gravestone_removes_index_entry_and_marks_bytes_dead() {
        let (_dir, channel) = fixture();
        let rec = Record::new(1, 10, 100, b"hello".to_vec());
        let plan = channel.append(vec![rec]).unwrap();
        channel.publish(plan).unwrap();
        assert_eq!(channel.sum_live_bytes(), channel.sum_logical_size());

        let removed = channel.write_gravestone(1, 200).unwrap();
        assert!(removed);
        assert_eq!(channel.read(1).unwrap(), None);
        assert!(channel.sum_live_bytes() < channel.sum_logical_size());
    }

    #[test]
    fn write_gravestone_of_already_gone_oid_returns_false() {
        let (_dir, channel) = fixture();
        assert!(!channel.write_gravestone(42, 1).unwrap());
    }

    #[test]
    fn channel_for_oid_is_deterministic() {
        assert_eq!(channel_for_oid(10, 4), channel_for_oid(10, 4));
        assert_eq!(channel_for_oid(0, 4), 0);
    }

    #[test]
    fn read_mismatch_quarantines_the_file_and_rolls_over_to_a_new_one() {
        let (_dir, channel) = fixture();
        let rec = Record::new(1, 10, 100, b"hello".to_vec());
        let plan = channel.append(vec![rec]).unwrap();
        channel.publish(plan).unwrap();
        channel.inner.cache.remove(1); // force the next read past the cache and into the file

        // Simulate the index disagreeing with what's actually on disk (the
        // same symptom a torn/corrupt record would produce).
        let mut entry = channel.inner.index.get(1).unwrap();
        let original_file_number = entry.file_number;
        entry.tid = 999;
        channel.inner.index.insert(1, entry);

        let result = channel.read(1);
        assert!(matches!(result, Err(Error::Corruption(_))));
        assert_eq!(channel.quarantined_file_count(), 1);

        // The channel keeps working: the next append rolls past the
        // quarantined file rather than reusing it.
        let rec2 = Record::new(2, 10, 100, b"world".to_vec());
        let plan2 = channel.append(vec![rec2]).unwrap();
        assert_eq!(plan2.file_number, original_file_number + 1);
        channel.publish(plan2).unwrap();
        assert_eq!(channel.read(2).unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn mirror_to_backup_writes_committed_records_to_the_backup_directory() {
        let dir = TempDir::with_prefix("nebula-channel-backup").unwrap();
        let backup_dir = TempDir::with_prefix("nebula-channel-backup-target").unwrap();
        let bfs: Arc<dyn BlobFileSystem> = Arc::new(LocalBlobFileSystem::new(dir.path().to_path_buf()).unwrap());
        let backup: Arc<dyn BlobFileSystem> =
            Arc::new(LocalBlobFileSystem::new(backup_dir.path().to_path_buf()).unwrap());
        let file = Arc::new(DataFile::open(bfs.clone(), 0, 1, 0).unwrap());
        let mut files = BTreeMap::new();
        files.insert(1, file);
        let channel = Channel::open(
            0,
            bfs,
            Some(backup.clone()),
            files,
            1,
            BTreeMap::new(),
            1024 * 1024,
            Duration::from_secs(60),
            0.8,
            64 * 1024,
            0.5,
            16,
        );

        let rec = Record::new(1, 10, 100, b"hello".to_vec());
        let plan = channel.append(vec![rec]).unwrap();
        channel.mirror_to_backup(&plan);
        channel.publish(plan).unwrap();

        let mirrored = backup.read(&data_file_path(0, 1), 0, None).unwrap();
        let record = Record::decode(&mirrored).unwrap();
        assert_eq!(record.oid, 1);
        assert_eq!(record.body, b"hello");
    }

    #[test]
    fn consolidation_backs_up_the_retired_file_before_deleting_it() {
        let dir = TempDir::with_prefix("nebula-channel-consolidate-backup").unwrap();
        let backup_dir = TempDir::with_prefix("nebula-channel-consolidate-backup-target").unwrap();
        let bfs: Arc<dyn BlobFileSystem> = Arc::new(LocalBlobFileSystem::new(dir.path().to_path_buf()).unwrap());
        let backup: Arc<dyn BlobFileSystem> =
            Arc::new(LocalBlobFileSystem::new(backup_dir.path().to_path_buf()).unwrap());
        let file = Arc::new(DataFile::open(bfs.clone(), 0, 1, 0).unwrap());
        let mut files = BTreeMap::new();
        files.insert(1, file);
        let channel = Channel::open(
            0,
            bfs,
            Some(backup.clone()),
            files,
            1,
            BTreeMap::new(),
            1024 * 1024,
            Duration::from_secs(60),
            0.8,
            64,
            0.5,
            16,
        );

        let rec1 = Record::new(1, 10, 100, vec![0u8; 40]);
        let plan1 = channel.append(vec![rec1]).unwrap();
        channel.publish(plan1).unwrap();
        let rec2 = Record::new(2, 10, 100, vec![0u8; 40]);
        let plan2 = channel.append(vec![rec2]).unwrap();
        channel.publish(plan2).unwrap();
        assert!(channel.file_numbers().len() > 1, "second record must roll over past file 1");

        channel.write_gravestone(1, 200).unwrap(); // file 1 is now entirely dead

        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(channel.consolidate_one_file(deadline).unwrap(), PhaseOutcome::Completed);

        let backed_up = backup.read(&data_file_path(0, 1), 0, None).unwrap();
        assert!(!backed_up.is_empty(), "retired file's bytes must be mirrored to the backup directory first");
    }
}
