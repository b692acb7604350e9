//! S3-like object store BFS backend (`feature = "backend-s3"`).
//!
//! A blob is an object with key `"{path}.{number}"` in a single bucket.
//! Built on the `s3` crate's blocking API, matching this engine's
//! synchronous threading model (design §4.1.1).

use s3::bucket::Bucket;
use s3::creds::Credentials;

use crate::bfs::{BlobFileSystem, BlobPath, ChildEntry, PathValidator, PermissivePathValidator};
use crate::error::{Error, Result};

pub struct ObjectStoreBlobFileSystem {
    bucket: Bucket,
    validator: PermissivePathValidator,
}

impl ObjectStoreBlobFileSystem {
    /// `connection` is `"bucket@region"`, e.g. `"nebula-store@us-east-1"`,
    /// with credentials resolved from the environment the same way the
    /// `s3` crate's `Credentials::default()` does (`AWS_ACCESS_KEY_ID` etc.).
    pub fn connect(connection: &str) -> Result<Self> {
        let (bucket_name, region) = connection
            .split_once('@')
            .ok_or_else(|| Error::config("blobFsConnection must be \"bucket@region\""))?;
        let region = region.parse().map_err(|err| Error::config(format!("invalid region: {err}")))?;
        let credentials = Credentials::default().map_err(|err| Error::config(err.to_string()))?;
        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|err| Error::fatal(format!("failed to open bucket: {err}")))?;
        Ok(ObjectStoreBlobFileSystem { bucket: *bucket, validator: PermissivePathValidator })
    }

    fn object_keys(&self, path: &BlobPath) -> Result<Vec<(u64, String)>> {
        let prefix = format!("{path}.");
        let results = self
            .bucket
            .list_blocking(prefix.clone(), None)
            .map_err(map_s3_err)?;
        let mut found = Vec::new();
        for page in results {
            for object in page.contents {
                if let Some(suffix) = object.key.strip_prefix(&prefix) {
                    if let Ok(number) = suffix.parse::<u64>() {
                        found.push((number, object.key));
                    }
                }
            }
        }
        found.sort_by_key(|(number, _)| *number);
        Ok(found)
    }
}

fn map_s3_err(err: s3::error::S3Error) -> Error {
    Error::transient(err)
}

impl BlobFileSystem for ObjectStoreBlobFileSystem {
    fn exists(&self, path: &BlobPath) -> Result<bool> {
        Ok(!self.object_keys(path)?.is_empty())
    }

    fn directory_exists(&self, path: &BlobPath) -> Result<bool> {
        let prefix = format!("{path}/");
        let results = self.bucket.list_blocking(prefix, Some("/".to_string())).map_err(map_s3_err)?;
        Ok(results.iter().any(|page| !page.contents.is_empty() || !page.common_prefixes.is_empty()))
    }

    fn size(&self, path: &BlobPath) -> Result<u64> {
        let keys = self.object_keys(path)?;
        let mut total = 0;
        for (_, key) in keys {
            let (_, code) = self.bucket.head_object_blocking(&key).map_err(map_s3_err)?;
            total += code.content_length.unwrap_or(0) as u64;
        }
        Ok(total)
    }

    fn read(&self, path: &BlobPath, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let keys = self.object_keys(path)?;
        if keys.is_empty() {
            return Err(Error::not_found(format!("object {path}")));
        }
        let mut whole = Vec::new();
        for (_, key) in keys {
            let response = self.bucket.get_object_blocking(&key).map_err(map_s3_err)?;
            whole.extend_from_slice(response.as_slice());
        }
        let end = match length {
            Some(len) => (offset + len).min(whole.len() as u64),
            None => whole.len() as u64,
        };
        if offset > whole.len() as u64 {
            return Err(Error::corruption(format!("read offset {offset} beyond object size for {path}")));
        }
        Ok(whole[offset as usize..end as usize].to_vec())
    }

    fn write(&self, path: &BlobPath, buffers: &[&[u8]]) -> Result<u64> {
        let next_number = self.object_keys(path)?.last().map(|(n, _)| n + 1).unwrap_or(1);
        let key = format!("{path}.{next_number}");
        let mut body = Vec::new();
        for buf in buffers {
            body.extend_from_slice(buf);
        }
        self.bucket.put_object_blocking(&key, &body).map_err(map_s3_err)?;
        Ok(body.len() as u64)
    }

    fn delete(&self, path: &BlobPath) -> Result<()> {
        for (_, key) in self.object_keys(path)? {
            self.bucket.delete_object_blocking(&key).map_err(map_s3_err)?;
        }
        Ok(())
    }

    fn visit_children(&self, dir: &BlobPath, visitor: &mut dyn FnMut(ChildEntry)) -> Result<()> {
        let prefix = if dir.as_str().is_empty() { String::new() } else { format!("{dir}/") };
        let results = self.bucket.list_blocking(prefix, Some("/".to_string())).map_err(map_s3_err)?;
        let mut seen = std::collections::BTreeSet::new();
        for page in results {
            for common in page.common_prefixes.unwrap_or_default() {
                let name = common.prefix.trim_end_matches('/').rsplit('/').next().unwrap_or("").to_string();
                if seen.insert((name.clone(), true)) {
                    visitor(ChildEntry { name, is_dir: true });
                }
            }
            for object in page.contents {
                let base_key = object.key.rsplit_once('/').map(|(_, b)| b).unwrap_or(&object.key);
                let base = match base_key.rsplit_once('.') {
                    Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => base,
                    _ => base_key,
                };
                if seen.insert((base.to_string(), false)) {
                    visitor(ChildEntry { name: base.to_string(), is_dir: false });
                }
            }
        }
        Ok(())
    }

    fn path_validator(&self) -> &dyn PathValidator {
        &self.validator
    }
}
