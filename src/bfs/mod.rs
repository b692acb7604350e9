//! Blob File System (BFS) abstraction.
//!
//! A capability interface for pluggable backends: every backend represents
//! a logical "file" as an ordered sequence of numbered blobs, concatenated
//! to form one contiguous byte range. This is the only I/O boundary the
//! channelized engine crosses; swapping `blobFsType` swaps every byte this
//! crate ever reads or writes.
//!
//! An object-safe, `get`/`set`/`delete`/`scan`-style capability surface
//! keyed on opaque byte ranges rather than point keys.

pub mod local;

#[cfg(feature = "backend-kafka")]
pub mod kafka_log;
#[cfg(feature = "backend-redis")]
pub mod redis_kv;
#[cfg(feature = "backend-s3")]
pub mod object_store;

use std::fmt;
use std::sync::Arc;

use crate::config::{BlobFsType, StoreConfig};
use crate::error::{Error, Result};

/// A logical path within a BFS backend: a `/`-separated relative path with
/// no leading or trailing slash, e.g. `"channel_000/channel_000_file_000001.dat"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobPath(String);

impl BlobPath {
    pub fn new(path: impl Into<String>) -> Self {
        BlobPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path segment, e.g. `"channel_000_file_000001.dat"` for
    /// `"channel_000/channel_000_file_000001.dat"`.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Builds a child path under this directory path.
    pub fn join(&self, child: &str) -> Self {
        if self.0.is_empty() {
            BlobPath(child.to_string())
        } else {
            BlobPath(format!("{}/{child}", self.0))
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immediate child of a directory, as emitted by `visit_children`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    /// Base name, with any blob-number suffix stripped.
    pub name: String,
    pub is_dir: bool,
}

/// Rejects backend-specific illegal path/key names before any I/O is attempted.
pub trait PathValidator: Send + Sync {
    fn validate(&self, path: &BlobPath) -> Result<()>;
}

/// A validator with no restrictions beyond "non-empty", used by backends
/// whose key space has no further naming rules worth enforcing up front.
pub struct PermissivePathValidator;

impl PathValidator for PermissivePathValidator {
    fn validate(&self, path: &BlobPath) -> Result<()> {
        if path.as_str().is_empty() {
            return Err(Error::config("blob path must not be empty"));
        }
        Ok(())
    }
}

/// The pluggable storage backend contract (design §4.1).
///
/// Object-safe and dynamically dispatched (`Arc<dyn BlobFileSystem>`).
/// Synchronous: the engine's own threading model (design §5) is a fixed
/// pool of OS threads issuing blocking calls, so an `async` trait here
/// would fight that idiom rather than extend it.
pub trait BlobFileSystem: Send + Sync {
    fn exists(&self, path: &BlobPath) -> Result<bool>;

    fn directory_exists(&self, path: &BlobPath) -> Result<bool>;

    /// Sum of blob sizes; `0` if the path is absent.
    fn size(&self, path: &BlobPath) -> Result<u64>;

    /// Returns exactly the bytes of the logical range `[offset, offset+length)`,
    /// spanning blobs transparently. `length = None` means "to end".
    /// Fails with `Error::NotFound` if `path` does not exist.
    fn read(&self, path: &BlobPath, offset: u64, length: Option<u64>) -> Result<Vec<u8>>;

    /// Appends a single new blob, atomically from the reader's perspective
    /// (no partial appends are ever observable). Returns the number of
    /// bytes written.
    fn write(&self, path: &BlobPath, buffers: &[&[u8]]) -> Result<u64>;

    /// Removes all blobs for `path`. Idempotent.
    fn delete(&self, path: &BlobPath) -> Result<()>;

    /// Removes any existing content at `dst`, copies all of `src`'s bytes
    /// into `dst` as a single blob, then deletes `src`. Default
    /// implementation per the contract table ("defined as
    /// read-then-write-then-delete"); backends with a native atomic rename
    /// should override this.
    fn move_file(&self, src: &BlobPath, dst: &BlobPath) -> Result<u64> {
        let bytes = self.read(src, 0, None)?;
        let len = bytes.len() as u64;
        if self.exists(dst)? {
            self.delete(dst)?;
        }
        self.write(dst, &[&bytes])?;
        self.delete(src)?;
        Ok(len)
    }

    /// Reads `[offset, offset+length)` from `src` and appends it as a new
    /// blob to `dst`. Default implementation per the contract table.
    fn copy(&self, src: &BlobPath, dst: &BlobPath, offset: u64, length: Option<u64>) -> Result<u64> {
        let bytes = self.read(src, offset, length)?;
        self.write(dst, &[&bytes])
    }

    /// Keeps bytes `[0, new_len)`. Default implementation ("read-delete-
    /// rewrite") per the contract table; backends that can truncate
    /// natively should override this for efficiency.
    fn truncate(&self, path: &BlobPath, new_len: u64) -> Result<()> {
        let bytes = if new_len == 0 { Vec::new() } else { self.read(path, 0, Some(new_len))? };
        self.delete(path)?;
        if !bytes.is_empty() {
            self.write(path, &[&bytes])?;
        }
        Ok(())
    }

    /// Emits immediate child directories and file base names (blob-number
    /// suffix stripped) of `dir`.
    fn visit_children(&self, dir: &BlobPath, visitor: &mut dyn FnMut(ChildEntry)) -> Result<()>;

    fn path_validator(&self) -> &dyn PathValidator;
}

/// Wraps a fallible BFS call with bounded exponential backoff for
/// `Error::Backend { kind: Transient, .. }` failures (design §7): retried
/// inside the BFS wrapper, surfacing as `Fatal` once retries are exhausted.
pub fn with_retry<T>(max_attempts: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                attempt += 1;
                let base_ms = 10u64.saturating_mul(1 << attempt.min(10));
                // Full jitter (design §5/§9: housekeeping and BFS backoff
                // both avoid lockstep retries across channels/workers).
                let backoff_ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=base_ms);
                log::warn!("transient backend error (attempt {attempt}/{max_attempts}): {err}");
                std::thread::sleep(std::time::Duration::from_millis(backoff_ms));
            }
            Err(err) if err.is_transient() => {
                return Err(Error::fatal(format!("retries exhausted: {err}")));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Selects and opens the backend named by `config.blob_fs_type`
/// (design §6, `useBlobFs` + `blobFsType` + `blobFsConnection`).
///
/// `useBlobFs = false` is the common case and always resolves to the local
/// filesystem rooted at `storage_directory`, regardless of `blobFsType`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn BlobFileSystem>> {
    if !config.use_blob_fs {
        return Ok(Arc::new(local::LocalBlobFileSystem::new(config.storage_directory.clone())?));
    }
    match config.blob_fs_type {
        BlobFsType::Local => {
            Ok(Arc::new(local::LocalBlobFileSystem::new(config.storage_directory.clone())?))
        }
        BlobFsType::S3 => {
            #[cfg(feature = "backend-s3")]
            {
                let connection = config
                    .blob_fs_connection
                    .as_deref()
                    .ok_or_else(|| Error::config("blobFsConnection required for blobFsType=s3"))?;
                Ok(Arc::new(object_store::ObjectStoreBlobFileSystem::connect(connection)?))
            }
            #[cfg(not(feature = "backend-s3"))]
            Err(Error::config("blobFsType=s3 requires the \"backend-s3\" feature"))
        }
        BlobFsType::Redis => {
            #[cfg(feature = "backend-redis")]
            {
                let connection = config
                    .blob_fs_connection
                    .as_deref()
                    .ok_or_else(|| Error::config("blobFsConnection required for blobFsType=redis"))?;
                Ok(Arc::new(redis_kv::RedisBlobFileSystem::connect(connection)?))
            }
            #[cfg(not(feature = "backend-redis"))]
            Err(Error::config("blobFsType=redis requires the \"backend-redis\" feature"))
        }
        BlobFsType::Kafka => {
            #[cfg(feature = "backend-kafka")]
            {
                let connection = config
                    .blob_fs_connection
                    .as_deref()
                    .ok_or_else(|| Error::config("blobFsConnection required for blobFsType=kafka"))?;
                Ok(Arc::new(kafka_log::KafkaLogBlobFileSystem::connect(connection)?))
            }
            #[cfg(not(feature = "backend-kafka"))]
            Err(Error::config("blobFsType=kafka requires the \"backend-kafka\" feature"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_path_file_name_strips_directory() {
        let path = BlobPath::new("channel_000/channel_000_file_000001.dat");
        assert_eq!(path.file_name(), "channel_000_file_000001.dat");
    }

    #[test]
    fn blob_path_join() {
        let dir = BlobPath::new("channel_000");
        assert_eq!(dir.join("channel_000_file_000001.dat").as_str(), "channel_000/channel_000_file_000001.dat");
    }

    #[test]
    fn with_retry_returns_ok_without_retry_on_success() {
        let mut calls = 0;
        let result = with_retry(3, || {
            calls += 1;
            Ok::<_, Error>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn with_retry_surfaces_fatal_after_exhausting_attempts() {
        let mut calls = 0;
        let result: Result<()> = with_retry(3, || {
            calls += 1;
            Err(Error::transient("flaky"))
        });
        assert_eq!(calls, 3);
        match result {
            Err(Error::Backend { kind: crate::error::BackendErrorKind::Fatal, .. }) => {}
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[test]
    fn with_retry_does_not_retry_non_transient_errors() {
        let mut calls = 0;
        let result: Result<()> = with_retry(3, || {
            calls += 1;
            Err(Error::corruption("bad checksum"))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn open_defaults_to_local_backend() {
        let dir = tempfile::TempDir::with_prefix("nebula-bfs-open").unwrap();
        let config = crate::config::StoreConfig::for_testing(dir.path().to_path_buf());
        let fs = open(&config).unwrap();
        let path = BlobPath::new("probe");
        fs.write(&path, &[b"ok"]).unwrap();
        assert_eq!(fs.read(&path, 0, None).unwrap(), b"ok");
    }
}
