//! The top-level store handle (design §4.9): owns every channel, the type
//! dictionary and registry, the oid allocator, and the housekeeping worker,
//! and carries the handle through its open/close state machine.

use std::any::Any;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use fs4::FileExt;

use crate::bfs::{self, BlobFileSystem};
use crate::channel::{channel_for_oid, Channel};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::housekeeping::Housekeeping;
use crate::oid::{Oid, OidAllocator, Tid, NULL_OID};
use crate::root::{self, RootFile};
use crate::storer::Storer;
use crate::type_dictionary::TypeDictionary;
use crate::type_handler::TypeHandlerRegistry;

/// The handle's lifecycle (design §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// A snapshot of the store's operational health, for monitoring.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub state: StoreState,
    pub channel_count: u32,
    pub quarantined_files: usize,
    pub type_count: usize,
}

/// Everything a `Store` handle needs, behind one `Arc` so [`Housekeeping`]
/// can hold a clone and run its background thread independently of the
/// handle that opened it.
pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) bfs: Arc<dyn BlobFileSystem>,
    pub(crate) dictionary: TypeDictionary,
    pub(crate) registry: TypeHandlerRegistry,
    pub(crate) channels: Vec<Channel>,
    pub(crate) oid_alloc: OidAllocator,
    pub(crate) commit_clock: AtomicU64,
    pub(crate) root_oid: AtomicU64,
    pub(crate) identity_cache: Mutex<HashMap<usize, Oid>>,
    pub(crate) state: RwLock<StoreState>,
    /// Held for the lifetime of the store when locking applies (design §6,
    /// `store.lock`, ADDED); dropping the handle releases the OS lock.
    pub(crate) _lock_file: Option<File>,
}

impl StoreInner {
    /// The GC mark phase's entry point (design §4.8.3).
    pub(crate) fn root_oid(&self) -> Oid {
        self.root_oid.load(Ordering::SeqCst)
    }

    pub(crate) fn next_commit_timestamp(&self) -> u64 {
        self.commit_clock.fetch_add(1, Ordering::SeqCst)
    }
}

/// A store handle (design §4.9). Cloning shares the same underlying engine;
/// the last handle to drop does not automatically stop housekeeping —
/// callers that want a clean shutdown must call [`Store::close`].
pub struct Store {
    inner: Arc<StoreInner>,
    housekeeping: Arc<Mutex<Option<Housekeeping>>>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Store { inner: self.inner.clone(), housekeeping: self.housekeeping.clone() }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Acquires `storage_directory/store.lock` for the lifetime of the store
/// (design §6, `Config::AlreadyOpen`). Only meaningful when the store's
/// bytes actually live under a local directory this process can flock;
/// remote-backend stores (S3/Redis/Kafka) rely on the backend's own
/// concurrency guarantees instead (documented as an open question in
/// DESIGN.md).
fn acquire_lock_file(config: &StoreConfig) -> Result<Option<File>> {
    if config.use_blob_fs && config.blob_fs_type != crate::config::BlobFsType::Local {
        return Ok(None);
    }
    std::fs::create_dir_all(&config.storage_directory)?;
    let path = config.storage_directory.join("store.lock");
    let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| Error::config(format!("store already open: {} is locked", path.display())))?;

    // Stamp a fresh instance id into the lock file body so an operator
    // inspecting `store.lock` on a running store can tell which process
    // opened it apart from the OS-level flock itself.
    let instance_id = uuid::Uuid::new_v4();
    file.set_len(0)?;
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{instance_id}")?;
    file.sync_all()?;

    Ok(Some(file))
}

impl Store {
    /// Opens (or creates) a store at `config.storage_directory`, recovering
    /// every channel's file list and entity index (design §4.9).
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let lock_file = acquire_lock_file(&config)?;

        let bfs = bfs::open(&config)?;
        root::validate_channel_count(bfs.as_ref(), config.channel_count)?;

        let dictionary = TypeDictionary::open(bfs.clone())?;
        let registry = TypeHandlerRegistry::new();

        let recovered = root::recover(&bfs, config.channel_count)?;
        let oid_alloc = OidAllocator::starting_after(recovered.last_allocated_oid);

        // A plain local directory regardless of the primary backend: design
        // §6 describes `backupDirectory` as a file-level mirror, not another
        // `blobFsType` to configure.
        let backup: Option<Arc<dyn BlobFileSystem>> = match &config.backup_directory {
            Some(dir) => {
                Some(Arc::new(crate::bfs::local::LocalBlobFileSystem::new(dir.clone())?) as Arc<dyn BlobFileSystem>)
            }
            None => None,
        };

        let mut channels = Vec::with_capacity(config.channel_count as usize);
        for (id, recovered_channel) in recovered.channels.into_iter().enumerate() {
            channels.push(Channel::open(
                id as u32,
                bfs.clone(),
                backup.clone(),
                recovered_channel.files,
                recovered_channel.current_file_number,
                recovered_channel.index_entries,
                config.entity_cache_threshold,
                config.entity_cache_timeout(),
                config.cache_soft_ratio,
                config.data_file_maximum_size,
                config.retirement_threshold,
                // Bounded so a flood of concurrent callers backpressures
                // rather than growing the queue without limit (design §5).
                256,
            ));
        }

        log::info!(
            "nebula-store opened at {:?} with {} channels (root oid {})",
            config.storage_directory,
            config.channel_count,
            recovered.root_oid
        );

        let inner = Arc::new(StoreInner {
            config,
            bfs,
            dictionary,
            registry,
            channels,
            oid_alloc,
            commit_clock: AtomicU64::new(now_millis()),
            root_oid: AtomicU64::new(recovered.root_oid),
            identity_cache: Mutex::new(HashMap::new()),
            state: RwLock::new(StoreState::Starting),
            _lock_file: lock_file,
        });

        *inner.state.write().expect("store state lock poisoned") = StoreState::Running;

        let store = Store { inner, housekeeping: Arc::new(Mutex::new(None)) };

        if store.inner.config.housekeeping_on_startup {
            log::info!("running startup housekeeping pass before serving requests");
            Housekeeping::run_to_completion(&store.inner)?;
        }

        let housekeeping = Housekeeping::start(store.inner.clone());
        *store.housekeeping.lock().expect("housekeeping handle lock poisoned") = Some(housekeeping);

        Ok(store)
    }

    pub fn state(&self) -> StoreState {
        *self.inner.state.read().expect("store state lock poisoned")
    }

    pub fn channel_count(&self) -> u32 {
        self.inner.channels.len() as u32
    }

    pub(crate) fn channel(&self, id: u32) -> &Channel {
        &self.inner.channels[id as usize]
    }

    pub(crate) fn registry(&self) -> &TypeHandlerRegistry {
        &self.inner.registry
    }

    pub(crate) fn allocate_oid(&self) -> Oid {
        self.inner.oid_alloc.allocate()
    }

    pub(crate) fn next_commit_timestamp(&self) -> u64 {
        self.inner.next_commit_timestamp()
    }

    pub(crate) fn identity_cache_lookup(&self, identity: usize) -> Option<Oid> {
        self.inner.identity_cache.lock().expect("identity cache lock poisoned").get(&identity).copied()
    }

    pub(crate) fn identity_cache_insert(&self, identity: usize, oid: Oid) {
        self.inner.identity_cache.lock().expect("identity cache lock poisoned").insert(identity, oid);
    }

    /// Registers a type handler, assigning it a tid via the type dictionary
    /// (design §4.5, §9).
    pub fn register<T: Any>(&self, handler: Arc<dyn crate::type_handler::TypeHandler>) -> Result<Tid> {
        self.inner.registry.register::<T>(&self.inner.dictionary, handler)
    }

    /// Starts a new commit-scoped storer (design §4.6).
    pub fn begin_storer(&self) -> Storer<'_> {
        Storer::new(self)
    }

    /// Stores and commits `obj` in one call, then durably updates the root
    /// pointer to it (design §4.9: "the root is the GC mark phase's entry
    /// point"). Convenience over `begin_storer` for the common single-root
    /// use pattern.
    pub fn store_root<T: Any>(&self, obj: &T) -> Result<Oid> {
        let mut storer = self.begin_storer();
        let oid = storer.store(obj)?;
        storer.commit()?;
        self.set_root(oid)?;
        Ok(oid)
    }

    /// Durably repoints the root at `oid` without storing anything new
    /// (e.g. after fetching and mutating-then-storing a replacement root
    /// object at the caller's level).
    pub fn set_root(&self, oid: Oid) -> Result<()> {
        self.inner.root_oid.store(oid, Ordering::SeqCst);
        let last_allocated_oid = self.inner.oid_alloc.peek_next().saturating_sub(1);
        root::write_root(self.inner.bfs.as_ref(), &RootFile::new(oid, last_allocated_oid))?;
        Ok(())
    }

    pub fn root_oid(&self) -> Oid {
        self.inner.root_oid.load(Ordering::SeqCst)
    }

    /// Fetches and deserializes the object at `oid` (design §4.6's inverse:
    /// a single-object read path, not the storer's graph walk).
    pub fn fetch<T: Any>(&self, oid: Oid) -> Result<T> {
        if oid == NULL_OID {
            return Err(Error::not_found("oid 0 (null) has no object"));
        }
        let channel = self.channel(channel_for_oid(oid, self.channel_count()));
        let entry = channel.index_entry(oid).ok_or_else(|| Error::not_found(format!("oid {oid}")))?;
        let bytes = channel.read(oid)?.ok_or_else(|| Error::not_found(format!("oid {oid}")))?;
        let handler = self.inner.registry.by_tid(entry.tid)?;
        let boxed = handler.read_body(&bytes)?;
        boxed.downcast::<T>().map(|b| *b).map_err(|_| {
            Error::corruption(format!("oid {oid} has tid {} but was fetched as a different Rust type", entry.tid))
        })
    }

    /// Fetches the current root object (design §4.9).
    pub fn fetch_root<T: Any>(&self) -> Result<T> {
        self.fetch(self.root_oid())
    }

    /// Forces an immediate full GC mark-sweep pass, ignoring the normal
    /// per-tick time budget (design §4.8: "an unbounded-budget variant for
    /// operator-triggered collection").
    pub fn issue_full_garbage_collection(&self) -> Result<()> {
        Housekeeping::run_to_completion(&self.inner)
    }

    /// Forces an immediate full file-consolidation pass across every
    /// channel, ignoring the normal per-tick time budget.
    pub fn issue_full_file_check(&self) -> Result<()> {
        Housekeeping::run_file_check_to_completion(&self.inner)
    }

    pub fn health(&self) -> StoreHealth {
        StoreHealth {
            state: self.state(),
            channel_count: self.channel_count(),
            quarantined_files: self.inner.channels.iter().map(|c| c.quarantined_file_count()).sum(),
            type_count: self.inner.dictionary.len(),
        }
    }

    /// Stops housekeeping and releases the store lock (design §4.9:
    /// Running → Stopping → Stopped). Channels themselves are torn down
    /// when the last `Store` handle (and thus the last `Arc<StoreInner>`)
    /// drops, joining their worker threads.
    pub fn close(self) {
        *self.inner.state.write().expect("store state lock poisoned") = StoreState::Stopping;
        if let Some(housekeeping) = self.housekeeping.lock().expect("housekeeping handle lock poisoned").take() {
            housekeeping.stop();
        }
        *self.inner.state.write().expect("store state lock poisoned") = StoreState::Stopped;
        log::info!("nebula-store at {:?} closed", self.inner.config.storage_directory);
    }
}
