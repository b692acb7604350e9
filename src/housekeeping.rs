//! Housekeeping engine: a cooperative background loop that runs three
//! time-budgeted phases every tick — cache sweep, file consolidation, and
//! GC mark-sweep — plus operator-triggered unbounded variants of the
//! latter two.
//!
//! Each phase individually respects a deadline and can be resumed on the
//! next tick rather than run to completion inline.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::{channel_for_oid, PhaseOutcome};
use crate::error::Result;
use crate::oid::{Oid, NULL_OID};
use crate::store::StoreInner;

/// Resumable state for the mark phase: oids still to visit, and every oid
/// already discovered reachable this cycle.
struct MarkState {
    worklist: VecDeque<Oid>,
    visited: HashSet<Oid>,
}

/// Resumable state for the sweep phase: the flattened `(channel, oid)` list
/// to consider, a cursor into it, and the reachable set the mark phase
/// produced.
struct SweepState {
    items: Vec<(u32, Oid)>,
    position: usize,
    reachable: HashSet<Oid>,
}

enum GcState {
    Idle,
    Marking(MarkState),
    Sweeping(SweepState),
}

/// The background housekeeping worker for one store handle.
pub struct Housekeeping {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Housekeeping {
    /// Spawns the periodic worker thread (design §5: "a dedicated
    /// housekeeping thread ticking on `housekeepingIntervalMs`").
    pub(crate) fn start(store: Arc<StoreInner>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = shutdown.clone();
        let interval = store.config.housekeeping_interval();
        let budget = store.config.housekeeping_time_budget();

        let worker = std::thread::Builder::new()
            .name("nebula-housekeeping".to_string())
            .spawn(move || {
                let mut gc_state = GcState::Idle;
                let mut file_check_cursor = 0usize;
                let mut file_check_failures = 0u32;
                let mut gc_failures = 0u32;
                while !worker_shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    if worker_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let deadline = Instant::now() + budget;
                    sweep_caches(&store);
                    match tick_file_check(&store, &mut file_check_cursor, deadline) {
                        Ok(()) => file_check_failures = 0,
                        Err(err) => {
                            log::error!("housekeeping file check tick failed: {err}");
                            file_check_failures += 1;
                            backoff_with_jitter(file_check_failures);
                        }
                    }
                    match tick_gc(&store, &mut gc_state, deadline) {
                        Ok(()) => gc_failures = 0,
                        Err(err) => {
                            log::error!("housekeeping gc tick failed: {err}");
                            gc_failures += 1;
                            backoff_with_jitter(gc_failures);
                        }
                    }
                }
            })
            .expect("failed to spawn housekeeping worker thread");

        Housekeeping { shutdown, worker: Some(worker) }
    }

    /// Signals the worker to stop after its current phase and joins it.
    pub(crate) fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Runs GC mark-sweep to completion with an effectively unbounded
    /// budget (design §4.8: operator-triggered full collection).
    pub(crate) fn run_to_completion(store: &Arc<StoreInner>) -> Result<()> {
        let mut gc_state = GcState::Idle;
        loop {
            let deadline = Instant::now() + Duration::from_secs(3600);
            tick_gc(store, &mut gc_state, deadline)?;
            if matches!(gc_state, GcState::Idle) {
                return Ok(());
            }
        }
    }

    /// Runs file consolidation to completion across every channel
    /// (design §4.8: operator-triggered full file check).
    pub(crate) fn run_file_check_to_completion(store: &Arc<StoreInner>) -> Result<()> {
        loop {
            let before: usize = store.channels.iter().map(|c| c.file_numbers().len()).sum();
            let deadline = Instant::now() + Duration::from_secs(3600);
            for channel in &store.channels {
                channel.consolidate_one_file(deadline)?;
            }
            let after: usize = store.channels.iter().map(|c| c.file_numbers().len()).sum();
            if after >= before {
                return Ok(());
            }
        }
    }
}

/// A failed phase is retried on the next regular tick, but a run of
/// consecutive failures additionally sleeps a jittered, exponentially
/// growing delay first (design §4.8: "retried on the next tick with
/// exponential backoff"), so a persistently broken backend doesn't spin the
/// housekeeping thread at the bare tick interval.
fn backoff_with_jitter(consecutive_failures: u32) {
    let base_ms = 50u64.saturating_mul(1u64 << consecutive_failures.min(10));
    let capped_ms = base_ms.min(30_000);
    let jittered_ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=capped_ms);
    std::thread::sleep(Duration::from_millis(jittered_ms));
}

fn sweep_caches(store: &StoreInner) {
    for channel in &store.channels {
        channel.sweep_cache();
    }
}

/// One time-budgeted slice of file consolidation (design §4.8 phase 2):
/// round-robins through channels starting after wherever the last tick left
/// off, so no single channel starves the others across ticks.
fn tick_file_check(store: &StoreInner, cursor: &mut usize, deadline: Instant) -> Result<()> {
    let count = store.channels.len();
    if count == 0 {
        return Ok(());
    }
    for step in 0..count {
        if Instant::now() >= deadline {
            break;
        }
        let index = (*cursor + step) % count;
        store.channels[index].consolidate_one_file(deadline)?;
    }
    *cursor = (*cursor + 1) % count;
    Ok(())
}

/// One time-budgeted slice of GC mark-sweep (design §4.8 phase 3),
/// resuming wherever the previous tick's mark or sweep left off.
fn tick_gc(store: &StoreInner, state: &mut GcState, deadline: Instant) -> Result<()> {
    loop {
        match state {
            GcState::Idle => {
                let root = store.root_oid();
                if root == NULL_OID {
                    return Ok(()); // nothing to mark from; GC is a no-op until a root exists
                }
                let mut worklist = VecDeque::new();
                let mut visited = HashSet::new();
                visited.insert(root);
                worklist.push_back(root);
                *state = GcState::Marking(MarkState { worklist, visited });
            }
            GcState::Marking(mark) => {
                match mark_reachable(store, mark, deadline)? {
                    PhaseOutcome::TimeBudgetExceeded => return Ok(()),
                    PhaseOutcome::Completed => {
                        let items = all_index_entries(store);
                        let reachable = std::mem::take(&mut mark.visited);
                        *state = GcState::Sweeping(SweepState { items, position: 0, reachable });
                    }
                }
            }
            GcState::Sweeping(sweep) => {
                match sweep_unreached(store, sweep, deadline)? {
                    PhaseOutcome::TimeBudgetExceeded => return Ok(()),
                    PhaseOutcome::Completed => {
                        *state = GcState::Idle;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Breadth-first traversal of the object graph reachable from the worklist,
/// consulting each object's type handler for its on-disk references
/// (design §9: "GC never forces a full deserialization, only `referencedOids`").
fn mark_reachable(store: &StoreInner, mark: &mut MarkState, deadline: Instant) -> Result<PhaseOutcome> {
    while let Some(oid) = mark.worklist.pop_front() {
        if Instant::now() >= deadline {
            mark.worklist.push_front(oid);
            return Ok(PhaseOutcome::TimeBudgetExceeded);
        }

        let channel = &store.channels[channel_for_oid(oid, store.channels.len() as u32) as usize];
        let Some(entry) = channel.index_entry(oid) else { continue };
        let Some(bytes) = channel.read(oid)? else { continue };
        let handler = store.registry.by_tid(entry.tid)?;
        for referenced in handler.referenced_oids(&bytes)? {
            if referenced != NULL_OID && mark.visited.insert(referenced) {
                mark.worklist.push_back(referenced);
            }
        }
    }
    Ok(PhaseOutcome::Completed)
}

fn all_index_entries(store: &StoreInner) -> Vec<(u32, Oid)> {
    let mut items = Vec::new();
    for channel in &store.channels {
        for (oid, _) in channel.index_snapshot() {
            items.push((channel.id(), oid));
        }
    }
    items
}

/// Writes gravestones for every indexed oid the mark phase never reached
/// (design §4.8 phase 3: "retire anything unreachable from the root").
fn sweep_unreached(store: &StoreInner, sweep: &mut SweepState, deadline: Instant) -> Result<PhaseOutcome> {
    while sweep.position < sweep.items.len() {
        if Instant::now() >= deadline {
            return Ok(PhaseOutcome::TimeBudgetExceeded);
        }
        let (channel_id, oid) = sweep.items[sweep.position];
        sweep.position += 1;
        if oid == store.root_oid() || sweep.reachable.contains(&oid) {
            continue;
        }
        let timestamp = store.next_commit_timestamp();
        store.channels[channel_id as usize].write_gravestone(oid, timestamp)?;
    }
    Ok(PhaseOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bfs::local::LocalBlobFileSystem;
    use crate::bfs::BlobFileSystem;
    use crate::config::StoreConfig;
    use crate::root;
    use crate::type_dictionary::TypeDictionary;
    use crate::type_handler::{TypeHandler, TypeHandlerRegistry};
    use std::any::Any;
    use tempfile::TempDir;

    struct Leaf {
        value: u32,
    }

    struct LeafHandler;

    impl TypeHandler for LeafHandler {
        fn type_name(&self) -> &str {
            "Leaf"
        }
        fn identity(&self, obj: &dyn Any) -> usize {
            obj.downcast_ref::<Leaf>().expect("wrong type") as *const Leaf as usize
        }
        fn references<'a>(&self, _obj: &'a dyn Any) -> Vec<&'a dyn Any> {
            Vec::new()
        }
        fn write_body(&self, obj: &dyn Any, _resolve: &dyn Fn(&dyn Any) -> crate::error::Result<Oid>) -> crate::error::Result<Vec<u8>> {
            Ok(obj.downcast_ref::<Leaf>().unwrap().value.to_le_bytes().to_vec())
        }
        fn read_body(&self, bytes: &[u8]) -> crate::error::Result<Box<dyn Any>> {
            let value = u32::from_le_bytes(bytes.try_into().unwrap());
            Ok(Box::new(Leaf { value }))
        }
        fn referenced_oids(&self, _body: &[u8]) -> crate::error::Result<Vec<Oid>> {
            Ok(Vec::new())
        }
    }

    fn build_inner(dir: &TempDir, channel_count: u32) -> Arc<StoreInner> {
        let config = StoreConfig::for_testing(dir.path().to_path_buf());
        let bfs: Arc<dyn BlobFileSystem> = Arc::new(LocalBlobFileSystem::new(config.storage_directory.clone()).unwrap());
        root::validate_channel_count(bfs.as_ref(), channel_count).unwrap();
        let recovered = root::recover(&bfs, channel_count).unwrap();
        let dictionary = TypeDictionary::open(bfs.clone()).unwrap();
        let registry = TypeHandlerRegistry::new();
        let mut channels = Vec::new();
        for (id, recovered_channel) in recovered.channels.into_iter().enumerate() {
            channels.push(crate::channel::Channel::open(
                id as u32,
                bfs.clone(),
                None,
                recovered_channel.files,
                recovered_channel.current_file_number,
                recovered_channel.index_entries,
                config.entity_cache_threshold,
                config.entity_cache_timeout(),
                config.cache_soft_ratio,
                config.data_file_maximum_size,
                config.retirement_threshold,
                16,
            ));
        }
        Arc::new(StoreInner {
            config,
            bfs,
            dictionary,
            registry,
            channels,
            oid_alloc: crate::oid::OidAllocator::starting_after(0),
            commit_clock: std::sync::atomic::AtomicU64::new(1),
            root_oid: std::sync::atomic::AtomicU64::new(0),
            identity_cache: Mutex::new(std::collections::HashMap::new()),
            state: std::sync::RwLock::new(crate::store::StoreState::Running),
            _lock_file: None,
        })
    }

    #[test]
    fn gc_with_no_root_is_a_no_op() {
        let dir = TempDir::with_prefix("nebula-housekeeping").unwrap();
        let inner = build_inner(&dir, 2);
        Housekeeping::run_to_completion(&inner).unwrap();
    }

    #[test]
    fn gc_retires_objects_unreachable_from_the_root() {
        let dir = TempDir::with_prefix("nebula-housekeeping-gc").unwrap();
        let inner = build_inner(&dir, 2);
        inner.registry.register::<Leaf>(&inner.dictionary, Arc::new(LeafHandler)).unwrap();

        let (root_tid, _) = inner.registry.by_object(&Leaf { value: 0 }).unwrap();
        let channel_count = inner.channels.len() as u32;

        let root_oid = inner.oid_alloc.allocate();
        let orphan_oid = inner.oid_alloc.allocate();
        let ts = inner.next_commit_timestamp();

        let root_channel = channel_for_oid(root_oid, channel_count);
        let plan = inner.channels[root_channel as usize]
            .append(vec![crate::record::Record::new(root_oid, root_tid, ts, 7u32.to_le_bytes().to_vec())])
            .unwrap();
        inner.channels[root_channel as usize].publish(plan).unwrap();

        let orphan_channel = channel_for_oid(orphan_oid, channel_count);
        let plan = inner.channels[orphan_channel as usize]
            .append(vec![crate::record::Record::new(orphan_oid, root_tid, ts, 9u32.to_le_bytes().to_vec())])
            .unwrap();
        inner.channels[orphan_channel as usize].publish(plan).unwrap();

        inner.root_oid.store(root_oid, std::sync::atomic::Ordering::SeqCst);

        Housekeeping::run_to_completion(&inner).unwrap();

        assert!(inner.channels[root_channel as usize].index_entry(root_oid).is_some());
        assert!(inner.channels[orphan_channel as usize].index_entry(orphan_oid).is_none());
    }

    #[test]
    fn file_check_to_completion_terminates_with_nothing_to_consolidate() {
        let dir = TempDir::with_prefix("nebula-housekeeping-filecheck").unwrap();
        let inner = build_inner(&dir, 2);
        Housekeeping::run_file_check_to_completion(&inner).unwrap();
    }
}
