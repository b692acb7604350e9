//! Local filesystem BFS backend: a blob is a numbered file `name.N`.
//!
//! Plain `std::fs`/`std::io` calls with no async runtime, errors
//! propagated through `?` into the crate's `Result`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::bfs::{BlobFileSystem, BlobPath, ChildEntry, PathValidator};
use crate::error::{Error, Result};

/// Rejects paths that would escape `root` or that the local filesystem
/// cannot represent as given (absolute paths, `..` components, embedded
/// NUL bytes).
pub struct LocalPathValidator;

impl PathValidator for LocalPathValidator {
    fn validate(&self, path: &BlobPath) -> Result<()> {
        let s = path.as_str();
        if s.is_empty() {
            return Err(Error::config("blob path must not be empty"));
        }
        if s.contains('\0') {
            return Err(Error::config("blob path must not contain NUL bytes"));
        }
        if Path::new(s).is_absolute() || s.split('/').any(|seg| seg == "..") {
            return Err(Error::config(format!("blob path escapes storage root: {s}")));
        }
        Ok(())
    }
}

pub struct LocalBlobFileSystem {
    root: PathBuf,
    validator: LocalPathValidator,
}

impl LocalBlobFileSystem {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(LocalBlobFileSystem { root, validator: LocalPathValidator })
    }

    fn full_path(&self, path: &BlobPath) -> PathBuf {
        self.root.join(path.as_str())
    }

    /// Lists `(blob_number, file_path)` pairs for `path`, sorted ascending
    /// by blob number.
    fn blobs(&self, path: &BlobPath) -> Result<Vec<(u64, PathBuf)>> {
        let full = self.full_path(path);
        let dir = match full.parent() {
            Some(dir) => dir,
            None => return Ok(Vec::new()),
        };
        let file_name = match full.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => return Ok(Vec::new()),
        };
        let prefix = format!("{file_name}.");

        let mut found = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(suffix) = name.strip_prefix(&prefix) {
                if let Ok(number) = suffix.parse::<u64>() {
                    found.push((number, entry.path()));
                }
            }
        }
        found.sort_by_key(|(number, _)| *number);
        Ok(found)
    }

    fn blob_path(&self, path: &BlobPath, number: u64) -> PathBuf {
        let mut full = self.full_path(path).into_os_string();
        full.push(format!(".{number}"));
        PathBuf::from(full)
    }
}

impl BlobFileSystem for LocalBlobFileSystem {
    fn exists(&self, path: &BlobPath) -> Result<bool> {
        self.validator.validate(path)?;
        Ok(!self.blobs(path)?.is_empty())
    }

    fn directory_exists(&self, path: &BlobPath) -> Result<bool> {
        self.validator.validate(path)?;
        Ok(self.full_path(path).is_dir())
    }

    fn size(&self, path: &BlobPath) -> Result<u64> {
        self.validator.validate(path)?;
        let mut total = 0;
        for (_, blob_path) in self.blobs(path)? {
            total += fs::metadata(&blob_path)?.len();
        }
        Ok(total)
    }

    fn read(&self, path: &BlobPath, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        self.validator.validate(path)?;
        let blobs = self.blobs(path)?;
        if blobs.is_empty() {
            return Err(Error::not_found(format!("blob path {path}")));
        }

        let total_size: u64 = {
            let mut sum = 0;
            for (_, blob_path) in &blobs {
                sum += fs::metadata(blob_path)?.len();
            }
            sum
        };
        let want_end = match length {
            Some(length) => offset.saturating_add(length).min(total_size),
            None => total_size,
        };
        if offset > total_size {
            return Err(Error::corruption(format!(
                "read offset {offset} beyond logical size {total_size} for {path}"
            )));
        }

        let mut out = Vec::with_capacity((want_end - offset) as usize);
        let mut cursor: u64 = 0;
        for (_, blob_path) in blobs {
            if cursor >= want_end {
                break;
            }
            let blob_len = fs::metadata(&blob_path)?.len();
            let blob_start = cursor;
            let blob_end = cursor + blob_len;
            cursor = blob_end;

            if blob_end <= offset || blob_start >= want_end {
                continue;
            }
            let slice_start = offset.max(blob_start) - blob_start;
            let slice_end = want_end.min(blob_end) - blob_start;

            let mut file = File::open(&blob_path)?;
            file.seek(SeekFrom::Start(slice_start))?;
            let mut buf = vec![0u8; (slice_end - slice_start) as usize];
            file.read_exact(&mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    fn write(&self, path: &BlobPath, buffers: &[&[u8]]) -> Result<u64> {
        self.validator.validate(path)?;
        if let Some(dir) = self.full_path(path).parent() {
            fs::create_dir_all(dir)?;
        }
        let next_number = self.blobs(path)?.last().map(|(n, _)| n + 1).unwrap_or(1);
        let blob_path = self.blob_path(path, next_number);

        let mut file = OpenOptions::new().write(true).create_new(true).open(&blob_path)?;
        let mut written: u64 = 0;
        for buf in buffers {
            file.write_all(buf)?;
            written += buf.len() as u64;
        }
        file.sync_all()?;
        Ok(written)
    }

    fn delete(&self, path: &BlobPath) -> Result<()> {
        self.validator.validate(path)?;
        for (_, blob_path) in self.blobs(path)? {
            match fs::remove_file(&blob_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn truncate(&self, path: &BlobPath, new_len: u64) -> Result<()> {
        self.validator.validate(path)?;
        let blobs = self.blobs(path)?;
        if blobs.is_empty() {
            if new_len == 0 {
                return Ok(());
            }
            return Err(Error::not_found(format!("blob path {path}")));
        }

        // Fast path: truncating to a length that lands exactly on a blob
        // boundary just drops the later blobs; truncating mid-blob shrinks
        // that one blob natively via `set_len`.
        let mut cursor: u64 = 0;
        for (_, blob_path) in &blobs {
            let blob_len = fs::metadata(blob_path)?.len();
            if cursor >= new_len {
                fs::remove_file(blob_path)?;
            } else if cursor + blob_len > new_len {
                let keep = new_len - cursor;
                let file = OpenOptions::new().write(true).open(blob_path)?;
                file.set_len(keep)?;
            }
            cursor += blob_len;
        }
        Ok(())
    }

    fn visit_children(&self, dir: &BlobPath, visitor: &mut dyn FnMut(ChildEntry)) -> Result<()> {
        self.validator.validate(dir)?;
        let full = self.full_path(dir);
        let entries = match fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut seen = std::collections::BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_dir() {
                if seen.insert(name.clone()) {
                    visitor(ChildEntry { name, is_dir: true });
                }
            } else {
                // Strip a trailing ".N" blob-number suffix.
                let base = match name.rsplit_once('.') {
                    Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => base,
                    _ => name.as_str(),
                };
                if seen.insert(base.to_string()) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, LocalBlobFileSystem) {
        let dir = TempDir::with_prefix("nebula-bfs").expect("tempdir");
        let bfs = LocalBlobFileSystem::new(dir.path().to_path_buf()).unwrap();
        (dir, bfs)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, bfs) = fixture();
        let path = BlobPath::new("channel_000/channel_000_file_000001.dat");
        bfs.write(&path, &[b"hello "]).unwrap();
        bfs.write(&path, &[b"world"]).unwrap();
        assert_eq!(bfs.size(&path).unwrap(), 11);
        let bytes = bfs.read(&path, 0, None).unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn read_spans_multiple_blobs_with_partial_ranges() {
        let (_dir, bfs) = fixture();
        let path = BlobPath::new("f");
        bfs.write(&path, &[b"aaa"]).unwrap(); // blob .1: offsets 0..3
        bfs.write(&path, &[b"bbb"]).unwrap(); // blob .2: offsets 3..6
        bfs.write(&path, &[b"ccc"]).unwrap(); // blob .3: offsets 6..9

        assert_eq!(bfs.read(&path, 2, Some(4)).unwrap(), b"abbb");
        assert_eq!(bfs.read(&path, 0, Some(1)).unwrap(), b"a");
        assert_eq!(bfs.read(&path, 8, None).unwrap(), b"c");
    }

    #[test]
    fn delete_removes_all_blobs_and_is_idempotent() {
        let (_dir, bfs) = fixture();
        let path = BlobPath::new("f");
        bfs.write(&path, &[b"x"]).unwrap();
        bfs.write(&path, &[b"y"]).unwrap();
        bfs.delete(&path).unwrap();
        assert!(!bfs.exists(&path).unwrap());
        bfs.delete(&path).unwrap(); // idempotent
    }

    #[test]
    fn truncate_drops_later_blobs_and_shrinks_straddling_blob() {
        let (_dir, bfs) = fixture();
        let path = BlobPath::new("f");
        bfs.write(&path, &[b"aaaa"]).unwrap(); // 0..4
        bfs.write(&path, &[b"bbbb"]).unwrap(); // 4..8
        bfs.truncate(&path, 6).unwrap();
        assert_eq!(bfs.read(&path, 0, None).unwrap(), b"aaaabb");
    }

    #[test]
    fn move_file_replaces_destination_wholesale() {
        let (_dir, bfs) = fixture();
        let src = BlobPath::new("src");
        let dst = BlobPath::new("dst");
        bfs.write(&dst, &[b"stale"]).unwrap();
        bfs.write(&src, &[b"fresh"]).unwrap();
        bfs.move_file(&src, &dst).unwrap();
        assert!(!bfs.exists(&src).unwrap());
        assert_eq!(bfs.read(&dst, 0, None).unwrap(), b"fresh");
    }

    #[test]
    fn visit_children_strips_blob_number_suffix() {
        let (_dir, bfs) = fixture();
        bfs.write(&BlobPath::new("channel_000/channel_000_file_000001.dat"), &[b"x"]).unwrap();
        bfs.write(&BlobPath::new("channel_000/channel_000_file_000002.dat"), &[b"y"]).unwrap();

        let mut names = Vec::new();
        bfs.visit_children(&BlobPath::new("channel_000"), &mut |entry| names.push(entry.name))
            .unwrap();
        names.sort();
        assert_eq!(
            names,
            vec!["channel_000_file_000001.dat".to_string(), "channel_000_file_000002.dat".to_string()]
        );
    }

    #[test]
    fn validator_rejects_path_traversal() {
        let (_dir, bfs) = fixture();
        let path = BlobPath::new("../escape");
        assert!(bfs.write(&path, &[b"x"]).is_err());
    }
}
