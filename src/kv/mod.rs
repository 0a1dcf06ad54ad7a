//! Hierarchical keyed byte store abstraction (spec.md §4.B).
//!
//! jj-lib doesn't have a direct analogue (it stores objects as files via
//! `Backend`, see `simple_backend.rs`), but the shape here — a trait
//! implemented by an in-memory and an on-disk backend, wrapped by a layer
//! that adds caching/atomicity (our [`crate::linker::Linker`], which plays
//! the role jj-lib's `store.rs` `Store` plays over `Backend`) — follows the
//! same split: thin storage trait, thicker façade on top.
//!
//! Keys are ordered sequences of string segments, e.g.
//! `["stage", "objects", "<b58>"]`. Batches are reference-counted so that
//! composite Linker operations (mkdir → stage → stage_node) can share one
//! underlying transaction; only the outermost `flush` commits, and any
//! `rollback` — at any nesting depth — discards the whole transaction, since
//! a partial composite operation can't be allowed to apply.

pub mod disk;
pub mod memory;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::error::KvError;
use crate::error::KvResult;

/// An ordered sequence of key segments, e.g. `["stage", "objects", "abc"]`.
pub type Key = Vec<String>;

pub fn key(segments: &[&str]) -> Key {
    segments.iter().map(|s| (*s).to_owned()).collect()
}

#[derive(Debug, Clone)]
enum Op {
    Put(Key, Vec<u8>),
    Erase(Key),
    Clear(Key),
}

/// Storage-specific half of a batch: buffers nothing itself, just knows how
/// to apply a finished list of ops atomically and how to read (so that
/// reads-within-a-batch can be served by the backend directly, since both
/// backends apply ops immediately to a staging area keyed by batch id in
/// their own implementations — see `memory.rs`/`disk.rs`).
pub(crate) trait BatchBackend: Send + Sync {
    fn commit(&self, ops: Vec<Op>) -> KvResult<()>;
}

struct BatchShared {
    backend: Arc<dyn BatchBackend>,
    ops: Mutex<Vec<Op>>,
    open_count: AtomicUsize,
    finished: std::sync::atomic::AtomicBool,
}

/// A handle to an open transaction. Cloning (via nested [`Database::batch`]
/// calls) shares the same underlying op buffer; see the module docs for the
/// commit/rollback rules.
#[derive(Clone)]
pub struct Batch {
    shared: Arc<BatchShared>,
}

impl Batch {
    fn new(backend: Arc<dyn BatchBackend>) -> Self {
        Self {
            shared: Arc::new(BatchShared {
                backend,
                ops: Mutex::new(Vec::new()),
                open_count: AtomicUsize::new(1),
                finished: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    fn join(&self) -> Self {
        self.shared.open_count.fetch_add(1, Ordering::SeqCst);
        Self { shared: self.shared.clone() }
    }

    pub fn put(&self, value: &[u8], key: Key) {
        self.shared.ops.lock().unwrap().push(Op::Put(key, value.to_vec()));
    }

    pub fn erase(&self, key: Key) {
        self.shared.ops.lock().unwrap().push(Op::Erase(key));
    }

    pub fn clear(&self, prefix: Key) {
        self.shared.ops.lock().unwrap().push(Op::Clear(prefix));
    }

    pub fn have_writes(&self) -> bool {
        !self.shared.ops.lock().unwrap().is_empty()
    }

    /// Commits the batch if this is the outermost handle (i.e. every nested
    /// `batch()` call has also been flushed). Returns whether a commit
    /// actually happened.
    pub fn flush(self) -> KvResult<bool> {
        let remaining = self.shared.open_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 {
            return Ok(false);
        }
        if self.shared.finished.swap(true, Ordering::SeqCst) {
            // Already rolled back by a sibling handle.
            return Ok(false);
        }
        let ops = std::mem::take(&mut *self.shared.ops.lock().unwrap());
        self.shared.backend.commit(ops)?;
        Ok(true)
    }

    /// Discards every buffered write, regardless of nesting depth. Any other
    /// outstanding handle to this same batch becomes inert: its eventual
    /// `flush` is a no-op.
    pub fn rollback(self) {
        self.shared.finished.store(true, Ordering::SeqCst);
        self.shared.ops.lock().unwrap().clear();
    }

    /// Whether this batch has already been flushed (at the outermost level)
    /// or rolled back. Backends use this to decide whether a stored handle
    /// can still be joined or must be replaced with a fresh transaction.
    pub(crate) fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot_ops(&self) -> Vec<Op> {
        self.shared.ops.lock().unwrap().clone()
    }
}

/// Resolves what a pending (uncommitted) batch would do to `key`, so that
/// reads within an open batch observe the batch's own writes (spec.md
/// §4.B). Returns `None` if `ops` doesn't touch `key` at all.
pub(crate) fn resolve_in_ops(key: &[String], ops: &[Op]) -> Option<Option<Vec<u8>>> {
    let mut result = None;
    for op in ops {
        match op {
            Op::Put(k, v) if k.as_slice() == key => result = Some(Some(v.clone())),
            Op::Erase(k) if k.as_slice() == key => result = Some(None),
            Op::Clear(prefix) if key.starts_with(prefix.as_slice()) => result = Some(None),
            _ => {}
        }
    }
    result
}

/// Distinguishes a miss from other I/O failures without string matching.
pub fn not_found(key: &[String]) -> KvError {
    KvError::NoSuchKey(key.to_vec())
}

/// Hierarchical keyed byte store (spec.md §4.B).
pub trait Database: Send + Sync {
    fn get(&self, key: &[String]) -> KvResult<Vec<u8>>;

    /// All keys under `prefix`, recursively, in lexical order.
    fn keys(&self, prefix: &[String]) -> KvResult<Vec<Key>>;

    /// Keys directly under `prefix` (non-recursive).
    fn glob(&self, prefix: &[String]) -> KvResult<Vec<Key>>;

    fn batch(&self) -> Batch;

    fn export(&self, writer: &mut dyn std::io::Write) -> KvResult<()>;

    fn import(&self, reader: &mut dyn std::io::Read) -> KvResult<()>;

    fn close(&self) -> KvResult<()>;
}

pub(crate) fn validate_key(k: &[String]) -> KvResult<()> {
    if k.is_empty() {
        return Err(KvError::EmptyKey);
    }
    Ok(())
}
