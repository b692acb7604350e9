//! Type dictionary: persisted `tid ↔ descriptor` mapping.
//!
//! Append-only, fsynced on every growth, loaded whole on open. A descriptor
//! is a small `bincode`-encoded envelope (`{ tid, name }`), since this is an
//! internal bookkeeping structure rather than a fixed external wire format.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::bfs::{BlobFileSystem, BlobPath};
use crate::error::{Error, Result};
use crate::oid::Tid;

const TYPES_DICT_PATH: &str = "types.dict";

/// One entry of the persisted dictionary. Opaque to the rest of the
/// engine beyond `tid` and `name` (design §3: "descriptors are opaque to
/// the core").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub tid: Tid,
    pub name: String,
}

struct Snapshot {
    by_tid: HashMap<Tid, TypeDescriptor>,
    by_name: HashMap<String, Tid>,
}

impl Snapshot {
    fn empty() -> Self {
        Snapshot { by_tid: HashMap::new(), by_name: HashMap::new() }
    }
}

/// The process-wide, persisted type dictionary for one store handle
/// (design §4.5, §9: "process-wide state").
///
/// Reads go through a copy-on-write snapshot (design §5); writes (a new
/// type's first use) are serialized by `write_lock` so two racing
/// registrations of the same new type name can't both assign a tid.
pub struct TypeDictionary {
    bfs: Arc<dyn BlobFileSystem>,
    path: BlobPath,
    snapshot: RwLock<Arc<Snapshot>>,
    next_tid: AtomicU32,
    write_lock: Mutex<()>,
}

impl TypeDictionary {
    /// Loads `types.dict` if present, otherwise starts an empty dictionary
    /// with tid allocation beginning at 1 (design §4.5: "on open: load the
    /// dictionary, then forbid reassignment of any existing tid" —
    /// reassignment is structurally impossible here since `tid_for` only
    /// ever allocates a *new* tid, never overwrites an entry).
    pub fn open(bfs: Arc<dyn BlobFileSystem>) -> Result<Self> {
        let path = BlobPath::new(TYPES_DICT_PATH);
        let mut by_tid = HashMap::new();
        let mut by_name = HashMap::new();
        let mut max_tid = 0u32;

        if bfs.exists(&path)? {
            let bytes = bfs.read(&path, 0, None)?;
            let mut cursor = 0usize;
            while cursor < bytes.len() {
                if cursor + 4 > bytes.len() {
                    return Err(Error::corruption("types.dict truncated length prefix"));
                }
                let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
                cursor += 4;
                if cursor + len > bytes.len() {
                    return Err(Error::corruption("types.dict truncated descriptor"));
                }
                let descriptor: TypeDescriptor = bincode::deserialize(&bytes[cursor..cursor + len])?;
                cursor += len;

                if by_name.contains_key(&descriptor.name) {
                    return Err(Error::corruption(format!(
                        "types.dict contains duplicate name {:?}",
                        descriptor.name
                    )));
                }
                max_tid = max_tid.max(descriptor.tid);
                by_name.insert(descriptor.name.clone(), descriptor.tid);
                by_tid.insert(descriptor.tid, descriptor);
            }
        }

        Ok(TypeDictionary {
            bfs,
            path,
            snapshot: RwLock::new(Arc::new(Snapshot { by_tid, by_name })),
            next_tid: AtomicU32::new(max_tid + 1),
            write_lock: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("type dictionary lock poisoned").clone()
    }

    /// Returns the tid for `name`, assigning and persisting a fresh one on
    /// first use (design §4.5: "on first use of a type: assign the next
    /// free tid, append the descriptor record to `types.dict`, fsync").
    pub fn tid_for(&self, name: &str) -> Result<Tid> {
        if let Some(&tid) = self.snapshot().by_name.get(name) {
            return Ok(tid);
        }

        let _guard = self.write_lock.lock().expect("type dictionary write lock poisoned");
        // Re-check under the write lock: another thread may have raced us
        // between the lock-free read above and acquiring the lock.
        if let Some(&tid) = self.snapshot().by_name.get(name) {
            return Ok(tid);
        }

        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        let descriptor = TypeDescriptor { tid, name: name.to_string() };
        let encoded = bincode::serialize(&descriptor)?;
        let mut record = Vec::with_capacity(4 + encoded.len());
        record.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        record.extend_from_slice(&encoded);
        self.bfs.write(&self.path, &[&record])?;
        log::info!("registered type {name:?} as tid {tid}");

        let prior = self.snapshot();
        let mut by_tid = prior.by_tid.clone();
        let mut by_name = prior.by_name.clone();
        by_tid.insert(tid, descriptor);
        by_name.insert(name.to_string(), tid);
        *self.snapshot.write().expect("type dictionary lock poisoned") = Arc::new(Snapshot { by_tid, by_name });

        Ok(tid)
    }

    pub fn descriptor(&self, tid: Tid) -> Result<TypeDescriptor> {
        self.snapshot().by_tid.get(&tid).cloned().ok_or_else(|| Error::not_found(format!("tid {tid}")))
    }

    pub fn len(&self) -> usize {
        self.snapshot().by_tid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bfs::local::LocalBlobFileSystem;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Arc<dyn BlobFileSystem>) {
        let dir = TempDir::with_prefix("nebula-typedict").unwrap();
        let bfs: Arc<dyn BlobFileSystem> = Arc::new(LocalBlobFileSystem::new(dir.path().to_path_buf()).unwrap());
        (dir, bfs)
    }

    #[test]
    fn fresh_dictionary_assigns_tids_starting_at_one() {
        let (_dir, bfs) = fixture();
        let dict = TypeDictionary::open(bfs).unwrap();
        assert_eq!(dict.tid_for("Book").unwrap(), 1);
        assert_eq!(dict.tid_for("Library").unwrap(), 2);
    }

    #[test]
    fn repeated_registration_of_same_name_returns_same_tid() {
        let (_dir, bfs) = fixture();
        let dict = TypeDictionary::open(bfs).unwrap();
        let first = dict.tid_for("Book").unwrap();
        let second = dict.tid_for("Book").unwrap();
        assert_eq!(first, second);
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn reopening_loads_persisted_descriptors_and_resumes_allocation() {
        let (_dir, bfs) = fixture();
        {
            let dict = TypeDictionary::open(bfs.clone()).unwrap();
            dict.tid_for("Book").unwrap();
            dict.tid_for("Library").unwrap();
        }
        let reopened = TypeDictionary::open(bfs).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.tid_for("Book").unwrap(), 1);
        // A third, genuinely new type gets a tid after both persisted ones.
        assert_eq!(reopened.tid_for("Shelf").unwrap(), 3);
    }

    #[test]
    fn descriptor_lookup_by_tid() {
        let (_dir, bfs) = fixture();
        let dict = TypeDictionary::open(bfs).unwrap();
        let tid = dict.tid_for("Book").unwrap();
        assert_eq!(dict.descriptor(tid).unwrap().name, "Book");
    }

    #[test]
    fn descriptor_lookup_of_unknown_tid_is_not_found() {
        let (_dir, bfs) = fixture();
        let dict = TypeDictionary::open(bfs).unwrap();
        assert!(matches!(dict.descriptor(99), Err(Error::NotFound(_))));
    }
}
