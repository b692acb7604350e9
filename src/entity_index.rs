//! Entity index: `oid → (channel, file#, position, length, tid)`.
//!
//! One shard per channel, owned exclusively by that channel's worker;
//! readers take a point-in-time clone of an entry under a brief lock.
//! Backed by a `BTreeMap`; ordered iteration is a free side effect that
//! rebuild/compaction scans rely on for determinism.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::oid::{Oid, Tid};

/// One entry in the entity index (design §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub tid: Tid,
    pub channel: u32,
    pub file_number: u64,
    pub position: u64,
    pub length: u32,
}

/// A single channel's shard of the entity index.
///
/// Wrapped in a `RwLock` rather than left bare: the owning channel worker
/// takes the write lock for every mutation (insert/delete/rebuild), but
/// cross-channel reads (design §4.7, "fan out read requests to the owning
/// channel") and housekeeping's scans only need a read lock, so they are
/// never blocked behind each other.
pub struct EntityIndexShard {
    entries: RwLock<BTreeMap<Oid, IndexEntry>>,
}

impl EntityIndexShard {
    pub fn new() -> Self {
        EntityIndexShard { entries: RwLock::new(BTreeMap::new()) }
    }

    pub fn get(&self, oid: Oid) -> Option<IndexEntry> {
        self.entries.read().expect("entity index lock poisoned").get(&oid).copied()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.entries.read().expect("entity index lock poisoned").contains_key(&oid)
    }

    /// Inserts or replaces the entry for `oid`. Returns the prior entry if
    /// there was one (it becomes garbage for a later housekeeping pass to
    /// reclaim once its bytes are no longer reachable from the new entry's
    /// file). Enforces design §4.3 Invariant B by panicking if the new
    /// entry's file number regresses — that would be an engine bug, not a
    /// recoverable condition, since it can only happen if the caller
    /// computed `file_number` incorrectly.
    pub fn insert(&self, oid: Oid, entry: IndexEntry) -> Option<IndexEntry> {
        let mut entries = self.entries.write().expect("entity index lock poisoned");
        if let Some(prior) = entries.get(&oid) {
            assert!(
                entry.file_number >= prior.file_number,
                "entity index invariant B violated: oid {oid} regressed from file {} to file {}",
                prior.file_number,
                entry.file_number
            );
        }
        entries.insert(oid, entry)
    }

    /// Removes the entry for `oid` (used when a gravestone sweep
    /// determines the oid is unreachable).
    pub fn remove(&self, oid: Oid) -> Option<IndexEntry> {
        self.entries.write().expect("entity index lock poisoned").remove(&oid)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("entity index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of every `(oid, entry)` pair, ordered by oid. Used by GC
    /// mark-sweep and by full-file-check scans.
    pub fn snapshot(&self) -> Vec<(Oid, IndexEntry)> {
        self.entries.read().expect("entity index lock poisoned").iter().map(|(&k, &v)| (k, v)).collect()
    }

    /// Oids whose entry points at `file_number`, used when a file is being
    /// retired and its surviving records need to be relocated.
    pub fn oids_in_file(&self, file_number: u64) -> Vec<Oid> {
        self.entries
            .read()
            .expect("entity index lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.file_number == file_number)
            .map(|(&oid, _)| oid)
            .collect()
    }

    /// Replaces the entire shard, used by a full rebuild-from-scan on open
    /// (design §4.9).
    pub fn replace_all(&self, rebuilt: BTreeMap<Oid, IndexEntry>) {
        *self.entries.write().expect("entity index lock poisoned") = rebuilt;
    }
}

impl Default for EntityIndexShard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_number: u64, position: u64) -> IndexEntry {
        IndexEntry { tid: 1, channel: 0, file_number, position, length: 10 }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let shard = EntityIndexShard::new();
        shard.insert(1, entry(1, 0));
        assert_eq!(shard.get(1), Some(entry(1, 0)));
        assert_eq!(shard.get(2), None);
    }

    #[test]
    fn insert_returns_prior_entry() {
        let shard = EntityIndexShard::new();
        shard.insert(1, entry(1, 0));
        let prior = shard.insert(1, entry(2, 0));
        assert_eq!(prior, Some(entry(1, 0)));
    }

    #[test]
    #[should_panic(expected = "invariant B violated")]
    fn insert_panics_on_file_number_regression() {
        let shard = EntityIndexShard::new();
        shard.insert(1, entry(5, 0));
        shard.insert(1, entry(2, 0));
    }

    #[test]
    fn remove_deletes_entry() {
        let shard = EntityIndexShard::new();
        shard.insert(1, entry(1, 0));
        assert_eq!(shard.remove(1), Some(entry(1, 0)));
        assert_eq!(shard.get(1), None);
    }

    #[test]
    fn oids_in_file_filters_by_file_number() {
        let shard = EntityIndexShard::new();
        shard.insert(1, entry(1, 0));
        shard.insert(2, entry(2, 0));
        shard.insert(3, entry(1, 10));
        let mut oids = shard.oids_in_file(1);
        oids.sort();
        assert_eq!(oids, vec![1, 3]);
    }

    #[test]
    fn snapshot_is_ordered_by_oid() {
        let shard = EntityIndexShard::new();
        shard.insert(5, entry(1, 0));
        shard.insert(1, entry(1, 0));
        shard.insert(3, entry(1, 0));
        let oids: Vec<Oid> = shard.snapshot().into_iter().map(|(oid, _)| oid).collect();
        assert_eq!(oids, vec![1, 3, 5]);
    }
}
