//! On-disk [`Database`] implementation. Maps a key (an ordered sequence of
//! string segments) to a filesystem path under a base directory, writing
//! each value with the same crash-safe temp-file-then-rename dance jj-lib's
//! `file_util::persist_content_addressed_temp_file` uses for content-store
//! blobs (see `simple_backend.rs`): write to a `NamedTempFile` in the base
//! directory, `sync_data`, then rename into place.
//!
//! Two segment values need special handling (spec.md §4.B, §8 open
//! questions):
//! - A trailing `"."` segment marks a directory node in the semantic model.
//!   `"."` isn't a legal regular file name, so it's mapped to a reserved
//!   sentinel file name (`@dir`) inside the directory it names.
//! - A `".."` segment would escape the base directory through path
//!   traversal and is always rejected.

use std::fs;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::Batch;
use super::BatchBackend;
use super::Key;
use super::Op;
use super::not_found;
use super::validate_key;
use crate::error::KvError;
use crate::error::KvResult;

/// Reserved file name standing in for a key whose final segment is `"."`.
const DIR_SENTINEL: &str = "@dir";

pub struct DiskDb {
    root: PathBuf,
    current_batch: Mutex<Option<Batch>>,
}

impl DiskDb {
    pub fn open(root: impl Into<PathBuf>) -> KvResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, current_batch: Mutex::new(None) })
    }

    fn resolve_path(&self, key: &[String]) -> KvResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        let (last, rest) = key.split_last().expect("validated non-empty");
        for segment in rest {
            if segment == ".." {
                return Err(KvError::PathEscape(key.to_vec()));
            }
            if segment == "." {
                path.push(DIR_SENTINEL_PARENT_MARKER_PANIC);
            }
            path.push(segment);
        }
        if last == ".." {
            return Err(KvError::PathEscape(key.to_vec()));
        }
        if last == "." {
            path.push(DIR_SENTINEL);
        } else {
            path.push(last);
        }
        Ok(path)
    }
}

// A "." can only legally appear as the final segment (it marks the node at
// the path built so far as a directory); if it ever appears mid-key, that's
// a programmer error in a caller, not a recoverable condition.
const DIR_SENTINEL_PARENT_MARKER_PANIC: &str = "@dir-mid-key-is-a-bug";

struct DiskBatchBackend {
    root: PathBuf,
}

impl DiskBatchBackend {
    fn resolve(&self, key: &[String]) -> KvResult<PathBuf> {
        let db = DiskDb { root: self.root.clone(), current_batch: Mutex::new(None) };
        db.resolve_path(key)
    }
}

impl BatchBackend for DiskBatchBackend {
    fn commit(&self, ops: Vec<Op>) -> KvResult<()> {
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    let path = self.resolve(&key)?;
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut temp = NamedTempFile::new_in(&self.root)?;
                    temp.write_all(&value)?;
                    temp.as_file().sync_data()?;
                    temp.persist(&path).map_err(|e| e.error)?;
                }
                Op::Erase(key) => {
                    let path = self.resolve(&key)?;
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Op::Clear(prefix) => {
                    let path = self.resolve_dir(&prefix)?;
                    if path.exists() {
                        fs::remove_dir_all(&path)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl DiskBatchBackend {
    fn resolve_dir(&self, prefix: &[String]) -> KvResult<PathBuf> {
        validate_key(prefix)?;
        let mut path = self.root.clone();
        for segment in prefix {
            if segment == ".." {
                return Err(KvError::PathEscape(prefix.to_vec()));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

impl super::Database for DiskDb {
    fn get(&self, key: &[String]) -> KvResult<Vec<u8>> {
        validate_key(key)?;
        if let Some(batch) = self.current_batch.lock().unwrap().as_ref() {
            if !batch.is_finished() {
                if let Some(resolved) = super::resolve_in_ops(key, &batch.snapshot_ops()) {
                    return resolved.ok_or_else(|| not_found(key));
                }
            }
        }
        let path = self.resolve_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &[String]) -> KvResult<Vec<Key>> {
        let mut base = self.root.clone();
        for segment in prefix {
            if segment == ".." {
                return Err(KvError::PathEscape(prefix.to_vec()));
            }
            base.push(segment);
        }

        let mut found = Vec::new();
        if base.exists() {
            for entry in WalkDir::new(&base).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    if let Some(k) = self.path_to_key(entry.path()) {
                        found.push(k);
                    }
                }
            }
        }
        found.sort();

        if let Some(batch) = self.current_batch.lock().unwrap().as_ref() {
            if !batch.is_finished() {
                apply_pending_to_listing(&mut found, prefix, &batch.snapshot_ops());
            }
        }
        Ok(found)
    }

    fn glob(&self, prefix: &[String]) -> KvResult<Vec<Key>> {
        let depth = prefix.len() + 1;
        Ok(self.keys(prefix)?.into_iter().filter(|k| k.len() == depth).collect())
    }

    fn batch(&self) -> Batch {
        let mut guard = self.current_batch.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            if !existing.is_finished() {
                return existing.join();
            }
        }
        let fresh = Batch::new(Arc::new(DiskBatchBackend { root: self.root.clone() }));
        *guard = Some(fresh.clone());
        fresh
    }

    fn export(&self, writer: &mut dyn std::io::Write) -> KvResult<()> {
        let keys = self.keys(&[])?;
        writer.write_all(&(keys.len() as u64).to_le_bytes())?;
        for key in keys {
            let value = self.get(&key)?;
            let joined = key.join("/");
            writer.write_all(&(joined.len() as u32).to_le_bytes())?;
            writer.write_all(joined.as_bytes())?;
            writer.write_all(&(value.len() as u32).to_le_bytes())?;
            writer.write_all(&value)?;
        }
        Ok(())
    }

    fn import(&self, reader: &mut dyn std::io::Read) -> KvResult<()> {
        let mut count_buf = [0u8; 8];
        reader.read_exact(&mut count_buf)?;
        let count = u64::from_le_bytes(count_buf);
        let batch = self.batch();
        for _ in 0..count {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let key_len = u32::from_le_bytes(len_buf) as usize;
            let mut key_buf = vec![0u8; key_len];
            reader.read_exact(&mut key_buf)?;
            let key_str =
                String::from_utf8(key_buf).map_err(|e| KvError::Corrupt(e.to_string()))?;
            let key: Key = key_str.split('/').map(str::to_owned).collect();

            reader.read_exact(&mut len_buf)?;
            let val_len = u32::from_le_bytes(len_buf) as usize;
            let mut val_buf = vec![0u8; val_len];
            reader.read_exact(&mut val_buf)?;
            batch.put(&val_buf, key);
        }
        batch.flush()?;
        Ok(())
    }

    fn close(&self) -> KvResult<()> {
        Ok(())
    }
}

impl DiskDb {
    /// Reverses [`Self::resolve_path`]: turns a stored file path back into
    /// its logical key, restoring `"."` for the directory sentinel.
    fn path_to_key(&self, path: &Path) -> Option<Key> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if let Some(last) = segments.last_mut() {
            if last == DIR_SENTINEL {
                *last = ".".to_owned();
            }
        }
        Some(segments)
    }
}

fn apply_pending_to_listing(found: &mut Vec<Key>, prefix: &[String], ops: &[Op]) {
    use std::collections::BTreeSet;
    let mut set: BTreeSet<Key> = found.drain(..).collect();
    for op in ops {
        match op {
            Op::Put(k, _) if k.starts_with(prefix) => {
                set.insert(k.clone());
            }
            Op::Erase(k) if k.starts_with(prefix) => {
                set.remove(k);
            }
            Op::Clear(p) => {
                set.retain(|k| !k.starts_with(p.as_slice()));
            }
            _ => {}
        }
    }
    found.extend(set);
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use super::super::key;
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = DiskDb::open(dir.path()).unwrap();
        let batch = db.batch();
        batch.put(b"hello", key(&["objects", "abc"]));
        batch.flush().unwrap();
        assert_eq!(db.get(&key(&["objects", "abc"])).unwrap(), b"hello");
    }

    #[test]
    fn directory_key_uses_sentinel_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = DiskDb::open(dir.path()).unwrap();
        let batch = db.batch();
        let dir_key = key(&["tree", "sub", "."]);
        batch.put(b"dirnode", dir_key.clone());
        batch.flush().unwrap();
        assert_eq!(db.get(&dir_key).unwrap(), b"dirnode");
        let listed = db.keys(&key(&["tree"])).unwrap();
        assert!(listed.contains(&dir_key));
    }

    #[test]
    fn parent_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = DiskDb::open(dir.path()).unwrap();
        let result = db.get(&key(&["..", "etc", "passwd"]));
        assert!(matches!(result, Err(KvError::PathEscape(_))));
    }

    #[test]
    fn clear_removes_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let db = DiskDb::open(dir.path()).unwrap();
        let batch = db.batch();
        batch.put(b"1", key(&["stage", "objects", "a"]));
        batch.put(b"2", key(&["stage", "objects", "b"]));
        batch.flush().unwrap();

        let batch2 = db.batch();
        batch2.clear(key(&["stage"]));
        batch2.flush().unwrap();

        assert!(db.get(&key(&["stage", "objects", "a"])).is_err());
        assert!(db.get(&key(&["stage", "objects", "b"])).is_err());
    }

    #[test]
    fn rollback_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let db = DiskDb::open(dir.path()).unwrap();
        let batch = db.batch();
        batch.put(b"hello", key(&["objects", "abc"]));
        batch.rollback();
        assert!(db.get(&key(&["objects", "abc"])).is_err());
    }
}
