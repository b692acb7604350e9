//! Redis-backed BFS backend (`feature = "backend-redis"`).
//!
//! A blob is a key `"{path}.{number}"` holding the blob's raw bytes. Built
//! on the `redis` crate's blocking `Connection`, matching this engine's
//! synchronous threading model (design §4.1.1). A `Mutex<Connection>`
//! serializes access since `redis::Connection` is not `Sync`.

use std::sync::Mutex;

use redis::Commands;

use crate::bfs::{BlobFileSystem, BlobPath, ChildEntry, PathValidator, PermissivePathValidator};
use crate::error::{Error, Result};

pub struct RedisBlobFileSystem {
    conn: Mutex<redis::Connection>,
    validator: PermissivePathValidator,
}

impl RedisBlobFileSystem {
    /// `connection` is a standard Redis URL, e.g. `"redis://127.0.0.1:6379"`.
    pub fn connect(connection: &str) -> Result<Self> {
        let client = redis::Client::open(connection).map_err(map_redis_err)?;
        let conn = client.get_connection().map_err(map_redis_err)?;
        Ok(RedisBlobFileSystem { conn: Mutex::new(conn), validator: PermissivePathValidator })
    }

    fn blob_keys(&self, path: &BlobPath) -> Result<Vec<(u64, String)>> {
        let mut conn = self.conn.lock().expect("redis connection mutex poisoned");
        let pattern = format!("{path}.*");
        let keys: Vec<String> = conn.keys(&pattern).map_err(map_redis_err)?;
        let prefix = format!("{path}.");
        let mut found: Vec<(u64, String)> = keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()).map(|n| (n, key)))
            .collect();
        found.sort_by_key(|(number, _)| *number);
        Ok(found)
    }
}

fn map_redis_err(err: redis::RedisError) -> Error {
    if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        Error::transient(err)
    } else {
        Error::fatal(err)
    }
}

impl BlobFileSystem for RedisBlobFileSystem {
    fn exists(&self, path: &BlobPath) -> Result<bool> {
        Ok(!self.blob_keys(path)?.is_empty())
    }

    fn directory_exists(&self, path: &BlobPath) -> Result<bool> {
        let mut conn = self.conn.lock().expect("redis connection mutex poisoned");
        let pattern = format!("{path}/*");
        let keys: Vec<String> = conn.keys(&pattern).map_err(map_redis_err)?;
        Ok(!keys.is_empty())
    }

    fn size(&self, path: &BlobPath) -> Result<u64> {
        let keys = self.blob_keys(path)?;
        let mut conn = self.conn.lock().expect("redis connection mutex poisoned");
        let mut total = 0u64;
        for (_, key) in keys {
            let len: u64 = conn.strlen(&key).map_err(map_redis_err)?;
            total += len;
        }
        Ok(total)
    }

    fn read(&self, path: &BlobPath, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let keys = self.blob_keys(path)?;
        if keys.is_empty() {
            return Err(Error::not_found(format!("key {path}")));
        }
        let mut conn = self.conn.lock().expect("redis connection mutex poisoned");
        let mut whole = Vec::new();
        for (_, key) in keys {
            let bytes: Vec<u8> = conn.get(&key).map_err(map_redis_err)?;
            whole.extend_from_slice(&bytes);
        }
        let end = match length {
            Some(len) => (offset + len).min(whole.len() as u64),
            None => whole.len() as u64,
        };
        if offset > whole.len() as u64 {
            return Err(Error::corruption(format!("read offset {offset} beyond value size for {path}")));
        }
        Ok(whole[offset as usize..end as usize].to_vec())
    }

    fn write(&self, path: &BlobPath, buffers: &[&[u8]]) -> Result<u64> {
        let next_number = self.blob_keys(path)?.last().map(|(n, _)| n + 1).unwrap_or(1);
        let key = format!("{path}.{next_number}");
        let mut body = Vec::new();
        for buf in buffers {
            body.extend_from_slice(buf);
        }
        let mut conn = self.conn.lock().expect("redis connection mutex poisoned");
        let _: () = conn.set(&key, &body).map_err(map_redis_err)?;
        Ok(body.len() as u64)
    }

    fn delete(&self, path: &BlobPath) -> Result<()> {
        let keys = self.blob_keys(path)?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("redis connection mutex poisoned");
        for (_, key) in keys {
            let _: () = conn.del(&key).map_err(map_redis_err)?;
        }
        Ok(())
    }

    fn visit_children(&self, dir: &BlobPath, visitor: &mut dyn FnMut(ChildEntry)) -> Result<()> {
        let mut conn = self.conn.lock().expect("redis connection mutex poisoned");
        let pattern = if dir.as_str().is_empty() { "*".to_string() } else { format!("{dir}/*") };
        let keys: Vec<String> = conn.keys(&pattern).map_err(map_redis_err)?;
        let mut seen = std::collections::BTreeSet::new();
        for key in keys {
            let rest = key.strip_prefix(&format!("{dir}/")).unwrap_or(&key);
            let first_segment = rest.split('/').next().unwrap_or(rest);
            let is_dir = rest.contains('/');
            let name = if is_dir {
                first_segment.to_string()
            } else {
                match first_segment.rsplit_once('.') {
                    Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => base.to_string(),
                    _ => first_segment.to_string(),
                }
            };
            if seen.insert((name.clone(), is_dir)) {
                visitor(ChildEntry { name, is_dir });
            }
        }
        Ok(())
    }

    fn path_validator(&self) -> &dyn PathValidator {
        &self.validator
    }
}
