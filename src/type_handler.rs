//! Dynamic dispatch over application type handlers (design §9).
//!
//! Object↔bytes serialization for user types is explicitly out of scope
//! (design §1): the engine only ever sees a `tid` plus opaque bytes. This
//! module defines the seam a real serializer plugs into — a trait object
//! table keyed by `tid`, chosen over a tagged-variant enum because
//! embedding applications register handlers for types the core never sees
//! at compile time (design §9, "Dynamic dispatch over type handlers").
//!
//! A handler's `tid` is not fixed by the application: [`TypeDictionary`]
//! (§4.5) owns assignment, so `register` here always goes through it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::oid::{Oid, Tid};
use crate::type_dictionary::TypeDictionary;

/// The capability set a registered type must provide: write its body,
/// read its body back, and enumerate the other objects it directly
/// references (design §4.6, §9).
pub trait TypeHandler: Send + Sync {
    /// Stable name used as the type dictionary descriptor and as the
    /// reverse lookup key from runtime type to tid (design §3, §4.5).
    fn type_name(&self) -> &str;

    /// An address-stable identity for `obj`, used as the storer's DFS
    /// identity-map key so cycles terminate and shared subgraphs are
    /// stored exactly once (design §9). Typically the pointer value of an
    /// `Rc`/`Arc`-shared allocation.
    fn identity(&self, obj: &dyn Any) -> usize;

    /// Objects directly reachable from `obj` that may themselves need
    /// storing (design §4.6: "recursively discover reachable objects
    /// through the type handler").
    fn references<'a>(&self, obj: &'a dyn Any) -> Vec<&'a dyn Any>;

    /// Serializes `obj`'s body. `resolve` maps a referenced object (by its
    /// `&dyn Any`) to the oid the storer already assigned it — every
    /// object returned by `references()` for this same `obj` is guaranteed
    /// to have an oid by the time `write_body` is called (design §4.6:
    /// oids are assigned before any body is serialized).
    fn write_body(&self, obj: &dyn Any, resolve: &dyn Fn(&dyn Any) -> Result<Oid>) -> Result<Vec<u8>>;

    /// Deserializes a body back into a boxed value of this handler's type.
    fn read_body(&self, bytes: &[u8]) -> Result<Box<dyn Any>>;

    /// Extracts the oids a serialized body references, without fully
    /// deserializing it into live objects. This is the "enumerate
    /// references" capability in its on-disk form (design §9), distinct
    /// from `references()` which walks a live object graph: housekeeping's
    /// GC mark phase (§4.8.3) only ever has bytes plus a tid on hand, never
    /// a materialized object, since marking must not force a full
    /// deserialization of every reachable entity just to find its edges.
    fn referenced_oids(&self, body: &[u8]) -> Result<Vec<Oid>>;
}

/// A snapshot of the registered handlers, installed copy-on-write (design
/// §5: "the type dictionary is copy-on-write; readers see a stable
/// snapshot; writers install a new snapshot under a registry mutex").
struct Snapshot {
    by_tid: HashMap<Tid, Arc<dyn TypeHandler>>,
    /// Reverse lookup from a Rust `TypeId` to its tid (design §3/§4.5:
    /// "plus a reverse lookup from runtime type to tid"). Lets the storer
    /// (§4.6) find the handler for a freshly-discovered referenced object
    /// without the caller naming it explicitly at every recursion step.
    by_type: HashMap<TypeId, Tid>,
}

/// The process-wide, in-memory registry of type handlers for one store
/// handle. Tid assignment itself is delegated to the persisted
/// [`TypeDictionary`]; this registry only maps tid → live trait object.
pub struct TypeHandlerRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl TypeHandlerRegistry {
    pub fn new() -> Self {
        TypeHandlerRegistry {
            snapshot: RwLock::new(Arc::new(Snapshot { by_tid: HashMap::new(), by_type: HashMap::new() })),
        }
    }

    /// Binds `handler` to the tid the type dictionary assigns for
    /// `handler.type_name()` (assigning a fresh one and persisting a
    /// descriptor on first use, design §4.5), then installs a new snapshot.
    /// `T` is also recorded in the `TypeId → tid` reverse lookup so the
    /// storer can resolve references to `T` without the caller re-stating
    /// the handler at every recursion step.
    pub fn register<T: Any>(&self, dictionary: &TypeDictionary, handler: Arc<dyn TypeHandler>) -> Result<Tid> {
        let tid = dictionary.tid_for(handler.type_name())?;
        let mut guard = self.snapshot.write().expect("type handler registry lock poisoned");
        let mut by_tid = guard.by_tid.clone();
        let mut by_type = guard.by_type.clone();
        by_tid.insert(tid, handler);
        by_type.insert(TypeId::of::<T>(), tid);
        *guard = Arc::new(Snapshot { by_tid, by_type });
        Ok(tid)
    }

    /// Readers clone the `Arc` under a brief read lock and never hold the
    /// lock during lookup (design §5).
    fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("type handler registry lock poisoned").clone()
    }

    pub fn by_tid(&self, tid: Tid) -> Result<Arc<dyn TypeHandler>> {
        self.snapshot().by_tid.get(&tid).cloned().ok_or_else(|| Error::not_found(format!("tid {tid}")))
    }

    /// Resolves `obj`'s handler via its Rust `TypeId`, for types registered
    /// through [`register`](Self::register). Used by the storer to look up
    /// the handler for a reference it discovered but was not told about
    /// explicitly (design §4.6, §9).
    pub fn by_object(&self, obj: &dyn Any) -> Result<(Tid, Arc<dyn TypeHandler>)> {
        let snapshot = self.snapshot();
        let tid = snapshot
            .by_type
            .get(&obj.type_id())
            .copied()
            .ok_or_else(|| Error::not_found("no type handler registered for this Rust type"))?;
        let handler = snapshot.by_tid.get(&tid).cloned().expect("by_type and by_tid must stay in sync");
        Ok((tid, handler))
    }

    pub fn registered_tids(&self) -> Vec<Tid> {
        self.snapshot().by_tid.keys().copied().collect()
    }
}

impl Default for TypeHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bfs::local::LocalBlobFileSystem;
    use std::sync::Arc;
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
        fn write_body(&self, obj: &dyn Any, _resolve: &dyn Fn(&dyn Any) -> Result<Oid>) -> Result<Vec<u8>> {
            let leaf = obj.downcast_ref::<Leaf>().expect("wrong type");
            Ok(leaf.value.to_le_bytes().to_vec())
        }
        fn read_body(&self, bytes: &[u8]) -> Result<Box<dyn Any>> {
            let value = u32::from_le_bytes(bytes.try_into().map_err(|_| Error::corruption("bad Leaf body"))?);
            Ok(Box::new(Leaf { value }))
        }
        fn referenced_oids(&self, _body: &[u8]) -> Result<Vec<Oid>> {
            Ok(Vec::new())
        }
    }

    fn fixture() -> (TempDir, TypeDictionary) {
        let dir = TempDir::with_prefix("nebula-typehandler").unwrap();
        let bfs = Arc::new(LocalBlobFileSystem::new(dir.path().to_path_buf()).unwrap());
        let dictionary = TypeDictionary::open(bfs).unwrap();
        (dir, dictionary)
    }

    #[test]
    fn register_then_lookup_by_tid() {
        let (_dir, dictionary) = fixture();
        let registry = TypeHandlerRegistry::new();
        let tid = registry.register::<Leaf>(&dictionary, Arc::new(LeafHandler)).unwrap();
        assert_eq!(registry.by_tid(tid).unwrap().type_name(), "Leaf");
    }

    #[test]
    fn lookup_of_unregistered_tid_is_not_found() {
        let registry = TypeHandlerRegistry::new();
        assert!(matches!(registry.by_tid(99), Err(Error::NotFound(_))));
    }

    #[test]
    fn by_object_resolves_handler_via_type_id() {
        let (_dir, dictionary) = fixture();
        let registry = TypeHandlerRegistry::new();
        registry.register::<Leaf>(&dictionary, Arc::new(LeafHandler)).unwrap();
        let leaf = Leaf { value: 7 };
        let (tid, handler) = registry.by_object(&leaf).unwrap();
        assert_eq!(handler.type_name(), "Leaf");
        assert_eq!(registry.by_tid(tid).unwrap().type_name(), "Leaf");
    }

    #[test]
    fn by_object_of_unregistered_type_is_not_found() {
        let registry = TypeHandlerRegistry::new();
        let leaf = Leaf { value: 1 };
        assert!(registry.by_object(&leaf).is_err());
    }

    #[test]
    fn write_then_read_body_round_trips() {
        let handler = LeafHandler;
        let leaf = Leaf { value: 42 };
        let body = handler.write_body(&leaf, &|_| Ok(0)).unwrap();
        let decoded = handler.read_body(&body).unwrap();
        assert_eq!(decoded.downcast_ref::<Leaf>().unwrap().value, 42);
    }
}
