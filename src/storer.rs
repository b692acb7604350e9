//! Storer / commit path (design §4.6): turns a live object graph into a
//! durable, all-or-nothing write.
//!
//! A `Storer` borrows the objects passed to it for its whole lifetime, so
//! it can hold `&dyn Any` references to them until `commit()` serializes
//! everything — nothing is copied until a handler's `write_body` actually
//! runs.

use std::any::Any;
use std::collections::HashMap;

use itertools::Itertools;

use crate::channel::{channel_for_oid, AppendPlan};
use crate::error::{Error, Result};
use crate::oid::{Oid, Tid};
use crate::record::Record;
use crate::store::Store;
use crate::type_handler::TypeHandler;
use std::sync::Arc;

struct PendingEntry<'s> {
    oid: Oid,
    tid: Tid,
    handler: Arc<dyn TypeHandler>,
    obj: &'s dyn Any,
}

/// A pending batch of writes, atomic to a single `commit()` (design §4.6).
pub struct Storer<'s> {
    store: &'s Store,
    pending: Vec<PendingEntry<'s>>,
    /// Identity → oid for objects already discovered *in this storer*
    /// (design §4.6: "if `obj` has been seen in this storer, return its
    /// provisional oid"). Covers both cycles and shared subgraphs.
    seen: HashMap<usize, Oid>,
}

impl<'s> Storer<'s> {
    pub(crate) fn new(store: &'s Store) -> Self {
        Storer { store, pending: Vec::new(), seen: HashMap::new() }
    }

    /// Stores `obj`, recursively discovering and storing everything it
    /// references, and returns the oid assigned to it (design §4.6).
    /// `T` must already be registered with the store's type handler
    /// registry (design §9: "dynamic dispatch over type handlers").
    pub fn store<T: Any>(&mut self, obj: &'s T) -> Result<Oid> {
        self.store_dyn(obj as &'s dyn Any)
    }

    pub fn store_all<T: Any>(&mut self, objs: &'s [T]) -> Result<Vec<Oid>> {
        objs.iter().map(|obj| self.store(obj)).collect()
    }

    fn store_dyn(&mut self, obj: &'s dyn Any) -> Result<Oid> {
        let (tid, handler) = self.store.registry().by_object(obj)?;
        let identity = handler.identity(obj);

        if let Some(&oid) = self.seen.get(&identity) {
            return Ok(oid);
        }
        if let Some(oid) = self.store.identity_cache_lookup(identity) {
            // Already persisted by an earlier commit in this process: reuse
            // its oid and don't re-enqueue it (design §4.6: "reusing the
            // existing oid for already-persisted ones"). This engine has no
            // dirty-tracking, so an unchanged already-persisted object that
            // is merely referenced again is not rewritten; callers that
            // mutated it must `store()` it explicitly at the top level to
            // get a new record version.
            self.seen.insert(identity, oid);
            return Ok(oid);
        }

        let oid = self.store.allocate_oid();
        self.seen.insert(identity, oid);

        // Recurse before enqueuing `obj` itself, so that by the time
        // `write_body` runs for it every reference already has an oid
        // (design §4.6: "oids are assigned before any body is serialized").
        for reference in handler.references(obj) {
            self.store_dyn(reference)?;
        }

        self.pending.push(PendingEntry { oid, tid, handler, obj });
        Ok(oid)
    }

    /// Serializes and durably writes every pending object (design §4.6).
    /// All-or-nothing: if any channel's append fails, every channel that
    /// did succeed is rolled back and no index entry or cache entry is
    /// published. Returns the number of records committed.
    pub fn commit(self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let timestamp = self.store.next_commit_timestamp();
        let channel_count = self.store.channel_count();

        let seen = &self.seen;
        let registry = self.store.registry();
        let resolve = move |referenced: &dyn Any| -> Result<Oid> {
            let (_, handler) = registry.by_object(referenced)?;
            let identity = handler.identity(referenced);
            seen.get(&identity).copied().ok_or_else(|| {
                Error::corruption("storer reference resolved to an object with no assigned oid")
            })
        };

        let mut channeled_records = Vec::with_capacity(self.pending.len());
        for entry in &self.pending {
            let body = entry.handler.write_body(entry.obj, &resolve)?;
            let record = Record::new(entry.oid, entry.tid, timestamp, body);
            channeled_records.push((channel_for_oid(entry.oid, channel_count), record));
        }
        // Grouping a commit's records by destination channel before dispatch.
        let by_channel: HashMap<u32, Vec<Record>> = channeled_records.into_iter().into_group_map();

        let mut plans: Vec<(u32, AppendPlan)> = Vec::with_capacity(by_channel.len());
        let mut failure: Option<Error> = None;
        for (channel_id, records) in by_channel {
            match self.store.channel(channel_id).append(records) {
                Ok(plan) => plans.push((channel_id, plan)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for (channel_id, plan) in &plans {
                if let Err(rollback_err) = self.store.channel(*channel_id).rollback(plan) {
                    log::error!("channel {channel_id:03} rollback failed after commit failure: {rollback_err}");
                }
            }
            log::warn!("commit rolled back after channel append failure: {err}");
            return Err(err);
        }

        let mut count = 0;
        for (channel_id, plan) in plans {
            count += plan.oids().count();
            self.store.channel(channel_id).mirror_to_backup(&plan);
            self.store.channel(channel_id).publish(plan)?;
        }

        for (&identity, &oid) in &self.seen {
            self.store.identity_cache_insert(identity, oid);
        }

        Ok(count)
    }
}
