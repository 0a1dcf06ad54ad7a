//! In-memory [`Database`] implementation, used for tests and for the
//! staging area when a caller doesn't need persistence.

use std::collections::BTreeMap;
use std::io::Read as _;
use std::io::Write as _;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use super::Batch;
use super::BatchBackend;
use super::Key;
use super::Op;
use super::not_found;
use super::validate_key;
use crate::error::KvError;
use crate::error::KvResult;

#[derive(Default)]
pub struct MemoryDb {
    data: Arc<RwLock<BTreeMap<Key, Vec<u8>>>>,
    current_batch: Mutex<Option<Batch>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryBatchBackend {
    data: Arc<RwLock<BTreeMap<Key, Vec<u8>>>>,
}

impl BatchBackend for MemoryBatchBackend {
    fn commit(&self, ops: Vec<Op>) -> KvResult<()> {
        let mut data = self.data.write().unwrap();
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    data.insert(key, value);
                }
                Op::Erase(key) => {
                    data.remove(&key);
                }
                Op::Clear(prefix) => {
                    data.retain(|k, _| !k.starts_with(prefix.as_slice()));
                }
            }
        }
        Ok(())
    }
}

impl super::Database for MemoryDb {
    fn get(&self, key: &[String]) -> KvResult<Vec<u8>> {
        validate_key(key)?;
        if let Some(batch) = self.current_batch.lock().unwrap().as_ref() {
            if !batch.is_finished() {
                if let Some(resolved) = super::resolve_in_ops(key, &batch.snapshot_ops()) {
                    return resolved.ok_or_else(|| not_found(key));
                }
            }
        }
        self.data
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    fn keys(&self, prefix: &[String]) -> KvResult<Vec<Key>> {
        let pending = self
            .current_batch
            .lock()
            .unwrap()
            .as_ref()
            .filter(|b| !b.is_finished())
            .map(|b| b.snapshot_ops());

        let mut merged: BTreeMap<Key, Option<Vec<u8>>> = self
            .data
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();

        if let Some(ops) = pending {
            for op in ops {
                match op {
                    Op::Put(k, v) if k.starts_with(prefix) => {
                        merged.insert(k, Some(v));
                    }
                    Op::Erase(k) if k.starts_with(prefix) => {
                        merged.insert(k, None);
                    }
                    Op::Clear(p) => {
                        for (k, v) in merged.iter_mut() {
                            if k.starts_with(&p) {
                                *v = None;
                            }
                        }
                        if p.starts_with(prefix) {
                            // Nothing else to do: future puts under `p` are
                            // re-applied by later ops in the loop.
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|_| k))
            .collect())
    }

    fn glob(&self, prefix: &[String]) -> KvResult<Vec<Key>> {
        let depth = prefix.len() + 1;
        Ok(self
            .keys(prefix)?
            .into_iter()
            .filter(|k| k.len() == depth)
            .collect())
    }

    fn batch(&self) -> Batch {
        let mut guard = self.current_batch.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            if !existing.is_finished() {
                return existing.join();
            }
        }
        let fresh = Batch::new(Arc::new(MemoryBatchBackend { data: self.data.clone() }));
        *guard = Some(fresh.clone());
        fresh
    }

    fn export(&self, writer: &mut dyn std::io::Write) -> KvResult<()> {
        let data = self.data.read().unwrap();
        writer.write_all(&(data.len() as u64).to_le_bytes())?;
        for (key, value) in data.iter() {
            let joined = key.join("/");
            writer.write_all(&(joined.len() as u32).to_le_bytes())?;
            writer.write_all(joined.as_bytes())?;
            writer.write_all(&(value.len() as u32).to_le_bytes())?;
            writer.write_all(value)?;
        }
        Ok(())
    }

    fn import(&self, reader: &mut dyn std::io::Read) -> KvResult<()> {
        let mut count_buf = [0u8; 8];
        reader.read_exact(&mut count_buf)?;
        let count = u64::from_le_bytes(count_buf);
        let mut data = self.data.write().unwrap();
        for _ in 0..count {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let key_len = u32::from_le_bytes(len_buf) as usize;
            let mut key_buf = vec![0u8; key_len];
            reader.read_exact(&mut key_buf)?;
            let key_str = String::from_utf8(key_buf)
                .map_err(|e| KvError::Corrupt(e.to_string()))?;
            let key: Key = key_str.split('/').map(str::to_owned).collect();

            reader.read_exact(&mut len_buf)?;
            let val_len = u32::from_le_bytes(len_buf) as usize;
            let mut val_buf = vec![0u8; val_len];
            reader.read_exact(&mut val_buf)?;
            data.insert(key, val_buf);
        }
        Ok(())
    }

    fn close(&self) -> KvResult<()> {
        Ok(())
    }
}
