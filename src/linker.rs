//! The versioned metadata engine (spec.md §4.D): Merkle-DAG operations,
//! staging, refs, commits, atomic batches, and the three in-memory indices.
//!
//! Grounded in `catfs/core/linker.go`: the same index triad (b58 hash →
//! node, inode → node, path trie → node), the same `MemIndex*` cache
//! discipline, and the same `appendDot` convention for directory keys
//! (here, [`RepoPathBuf::as_directory_key`]). Where the Go source leaves
//! `NextInode` unimplemented, we build the fully specified version per
//! spec.md §8's open-question resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::error::KvError;
use crate::error::LinkerError;
use crate::error::LinkerResult;
use crate::hash::Hash;
use crate::kv::Batch;
use crate::kv::Database;
use crate::kv::key;
use crate::node::CommitNode;
use crate::node::DirectoryNode;
use crate::node::FileNode;
use crate::node::GhostNode;
use crate::node::MergeInfo;
use crate::node::Node;
use crate::node::NodeBase;
use crate::node::NodeType;
use crate::node::decode_node;
use crate::node::directory_with_child;
use crate::node::encode_node;
use crate::node::make_ghost;
use crate::node::new_root_directory;
use crate::path_trie::TrieNode;
use crate::repo_path::RepoPathBuf;

/// Names reserved for the two always-present refs (spec.md §3, §4.D).
const REF_HEAD: &str = "head";
const REF_CURR: &str = "curr";
const REF_STATUS: &str = "status";

/// A move-mapping record: links a ghost's former position to the inode
/// that now lives at its new position (spec.md §4.D moves keys; §6
/// supplements the unspecified line format as
/// `<src_inode> <src_path> <dst_path> <direction>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveMapping {
    pub src_inode: u64,
    pub src_path: RepoPathBuf,
    pub dst_path: RepoPathBuf,
    /// `true` for the forward direction (ghost → alive); `false` for the
    /// reverse overlay record stored at the destination inode.
    pub forward: bool,
}

fn format_move_mapping(m: &MoveMapping) -> Vec<u8> {
    let direction = if m.forward { '>' } else { '<' };
    format!("{} {} {} {direction}", m.src_inode, m.src_path.as_str(), m.dst_path.as_str()).into_bytes()
}

fn parse_move_mapping(data: &[u8]) -> LinkerResult<MoveMapping> {
    let text = std::str::from_utf8(data)
        .map_err(|e| LinkerError::Kv(KvError::Corrupt(e.to_string())))?;
    let mut parts = text.split(' ');
    let src_inode: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| LinkerError::Kv(KvError::Corrupt("bad move record".to_owned())))?;
    let src_path = parts
        .next()
        .ok_or_else(|| LinkerError::Kv(KvError::Corrupt("bad move record".to_owned())))?;
    let dst_path = parts
        .next()
        .ok_or_else(|| LinkerError::Kv(KvError::Corrupt("bad move record".to_owned())))?;
    let direction = parts
        .next()
        .ok_or_else(|| LinkerError::Kv(KvError::Corrupt("bad move record".to_owned())))?;
    Ok(MoveMapping {
        src_inode,
        src_path: RepoPathBuf::parse(src_path),
        dst_path: RepoPathBuf::parse(dst_path),
        forward: direction == ">",
    })
}

fn segments_for_path(path: &RepoPathBuf, is_directory: bool) -> Vec<String> {
    let owned;
    let s: &str = if is_directory {
        owned = path.as_directory_key();
        &owned
    } else {
        path.as_str()
    };
    s.split('/').filter(|c| !c.is_empty()).map(str::to_owned).collect()
}

struct Indices {
    root: Option<DirectoryNode>,
    by_hash: HashMap<String, Node>,
    by_inode: HashMap<u64, Node>,
    ptrie: TrieNode<Node>,
}

impl Indices {
    fn clear() -> Self {
        Self {
            root: None,
            by_hash: HashMap::new(),
            by_inode: HashMap::new(),
            ptrie: TrieNode::new(),
        }
    }

    fn add(&mut self, nd: Node, update_path_index: bool) {
        self.by_hash.insert(nd.tree_hash().to_b58(), nd.clone());
        self.by_inode.insert(nd.inode(), nd.clone());
        if update_path_index {
            if let Some(path) = nd.path() {
                let key = if nd.node_type() == NodeType::Directory {
                    path.as_directory_key()
                } else {
                    path.as_str().to_owned()
                };
                self.ptrie.insert(&key, nd);
            }
        }
    }
}

/// Holds the KV handle, the cached root directory, and the three in-memory
/// indices (spec.md §4.D). Not safe for concurrent mutators — callers must
/// serialize writes, per spec.md §5.
pub struct Linker {
    kv: Arc<dyn Database>,
    owner: String,
    indices: Mutex<Indices>,
}

impl Linker {
    pub fn new(kv: Arc<dyn Database>, owner: impl Into<String>) -> Self {
        Self { kv, owner: owner.into(), indices: Mutex::new(Indices::clear()) }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn clear_indices(&self) {
        *self.indices.lock().unwrap() = Indices::clear();
    }

    // -- atomicity -----------------------------------------------------

    /// Wraps `f` in a KV batch (spec.md §4.D, §5). Nested calls share the
    /// outermost transaction via [`Database::batch`]'s reference counting;
    /// only the outermost handle's flush actually commits. Any `Err`
    /// returned by `f`, or a panic unwinding out of it, rolls back the
    /// whole shared batch and clears the in-memory indices so they are
    /// reloaded lazily from the KV on next access.
    pub fn atomic_with_batch<T>(
        &self,
        f: impl FnOnce(&Batch) -> LinkerResult<T> + std::panic::UnwindSafe,
    ) -> LinkerResult<T> {
        let batch = self.kv.batch();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&batch)));
        match outcome {
            Ok(Ok(value)) => {
                batch.flush()?;
                Ok(value)
            }
            Ok(Err(e)) => {
                let had_writes = batch.have_writes();
                batch.rollback();
                if had_writes {
                    self.clear_indices();
                }
                Err(e)
            }
            Err(panic) => {
                batch.rollback();
                self.clear_indices();
                std::panic::resume_unwind(panic);
            }
        }
    }

    /// Convenience wrapper for operations that don't need direct batch
    /// access (spec.md §4.D: `atomic(fn)`).
    pub fn atomic<T>(&self, f: impl FnOnce() -> LinkerResult<T> + std::panic::UnwindSafe) -> LinkerResult<T> {
        self.atomic_with_batch(|_batch| f())
    }

    // -- inode allocation ------------------------------------------------

    /// Monotonic counter persisted as `stats/max-inode` (big-endian u64).
    /// Must be allocated from within the same batch as the operation that
    /// consumes the value (spec.md §4.D, §5).
    fn next_inode_in(&self, batch: &Batch) -> LinkerResult<u64> {
        let stats_key = key(&["stats", "max-inode"]);
        let current = match self.kv.get(&stats_key) {
            Ok(bytes) => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| LinkerError::Kv(KvError::Corrupt("bad max-inode record".to_owned())))?;
                u64::from_be_bytes(arr)
            }
            Err(KvError::NoSuchKey(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        let next = current + 1;
        batch.put(&next.to_be_bytes(), stats_key);
        Ok(next)
    }

    /// Public entry point, run in its own batch (spec.md §4.D: `next_inode()`).
    pub fn next_inode(&self) -> LinkerResult<u64> {
        self.atomic_with_batch(|batch| self.next_inode_in(batch))
    }

    // -- node storage ------------------------------------------------------

    fn put_node(&self, batch: &Batch, nd: &Node, staged: bool) {
        let bytes = encode_node(nd);
        let prefix = if staged { "stage" } else { "" };
        let objects_key = if staged {
            key(&["stage", "objects", nd.tree_hash().to_b58().as_str()])
        } else {
            key(&["objects", nd.tree_hash().to_b58().as_str()])
        };
        batch.put(&bytes, objects_key);

        let is_dir = nd.node_type() == NodeType::Directory;
        if let Some(path) = nd.path() {
            let mut segments = vec!["tree".to_owned()];
            segments.extend(segments_for_path(&path, is_dir));
            let tree_key = if staged {
                let mut v = vec!["stage".to_owned()];
                v.extend(segments);
                v
            } else {
                segments
            };
            batch.put(nd.tree_hash().to_b58().as_bytes(), tree_key);
        }
        let _ = prefix;

        batch.put(&nd.inode().to_le_bytes(), key(&["inode", nd.inode().to_string().as_str()]));
    }

    /// Serializes `nd` into `stage/objects`, updates path and inode
    /// indices, then recursively re-stages every ancestor directory up to
    /// root, since each ancestor's tree_hash must change (spec.md §4.D:
    /// `stage_node`).
    #[instrument(skip(self, nd))]
    pub fn stage_node(&self, nd: Node) -> LinkerResult<Node> {
        self.atomic_with_batch(|batch| self.stage_node_in(batch, nd))
    }

    fn stage_node_in(&self, batch: &Batch, nd: Node) -> LinkerResult<Node> {
        self.put_node(batch, &nd, true);
        self.indices.lock().unwrap().add(nd.clone(), true);

        let Some(path) = nd.path() else {
            return Ok(nd);
        };
        if path.is_root() {
            if let Node::Directory(dir) = &nd {
                self.indices.lock().unwrap().root = Some(dir.clone());
            }
            self.update_staging_root(batch, nd.tree_hash())?;
            return Ok(nd);
        }

        let Some(parent_path) = path.parent() else {
            return Ok(nd);
        };
        let parent_node = self.resolve_node_in(&parent_path, true)?.ok_or_else(|| {
            LinkerError::NoSuchFile(parent_path.clone())
        })?;
        let Node::Directory(parent_dir) = parent_node else {
            return Err(LinkerError::NotADirectory(parent_path));
        };
        let basename = path.basename().to_owned();
        let updated_dir = directory_with_child(&parent_dir, &basename, Some(nd.tree_hash()));
        let mut updated_node = Node::Directory(updated_dir);
        updated_node.recompute_tree_hash();
        self.stage_node_in(batch, updated_node)?;
        Ok(nd)
    }

    fn update_staging_root(&self, batch: &Batch, root_hash: Hash) -> LinkerResult<()> {
        let mut status = self.read_status_raw()?;
        status.root = root_hash;
        self.write_status(batch, &status);
        Ok(())
    }

    /// Copies every key under `stage/<segment>/*` to `<segment>/*`, dropping
    /// the leading `stage` component. Used by [`Self::make_commit`] to carry
    /// staged objects, tree entries, and move records into their permanent
    /// location before the `stage` subtree is cleared.
    fn promote_staged(&self, batch: &Batch, segment: &[&str]) -> LinkerResult<()> {
        let mut staged_prefix = vec!["stage".to_owned()];
        staged_prefix.extend(segment.iter().map(|s| (*s).to_owned()));
        for k in self.kv.keys(&staged_prefix)? {
            let data = self.kv.get(&k)?;
            let permanent_key: Vec<String> = k[1..].to_vec();
            batch.put(&data, permanent_key);
        }
        Ok(())
    }

    // -- lookups -------------------------------------------------------

    /// Consults the path trie cache first; otherwise `stage/tree/<path>`,
    /// falling back to `tree/<path>` (spec.md §4.D: `resolve_node`).
    pub fn resolve_node(&self, path: &RepoPathBuf) -> LinkerResult<Option<Node>> {
        self.resolve_node_in(path, false)
    }

    fn resolve_node_in(&self, path: &RepoPathBuf, prefer_directory: bool) -> LinkerResult<Option<Node>> {
        let cache_keys: [String; 2] = if prefer_directory {
            [path.as_directory_key(), path.as_str().to_owned()]
        } else {
            [path.as_str().to_owned(), path.as_directory_key()]
        };
        for cache_key in &cache_keys {
            if let Some(nd) = self.indices.lock().unwrap().ptrie.lookup(cache_key) {
                return Ok(Some(nd.clone()));
            }
        }

        for is_dir in [prefer_directory, !prefer_directory] {
            let mut segments = vec!["stage".to_owned(), "tree".to_owned()];
            segments.extend(segments_for_path(path, is_dir));
            if let Some(nd) = self.try_tree_key(&segments)? {
                return Ok(Some(nd));
            }

            let mut segments = vec!["tree".to_owned()];
            segments.extend(segments_for_path(path, is_dir));
            if let Some(nd) = self.try_tree_key(&segments)? {
                return Ok(Some(nd));
            }
        }
        Ok(None)
    }

    fn try_tree_key(&self, segments: &[String]) -> LinkerResult<Option<Node>> {
        match self.kv.get(segments) {
            Ok(bytes) => {
                let b58 = String::from_utf8(bytes)
                    .map_err(|e| LinkerError::Kv(KvError::Corrupt(e.to_string())))?;
                let hash = Hash::from_b58(&b58)
                    .map_err(|_| LinkerError::Kv(KvError::Corrupt("bad hash in tree index".to_owned())))?;
                self.node_by_hash(hash)
            }
            Err(KvError::NoSuchKey(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Walks from the current root's in-memory directory, returning ghosts
    /// where applicable so that deletions are observable (spec.md §4.D:
    /// `lookup_node`, unlike `resolve_node`).
    pub fn lookup_node(&self, path: &RepoPathBuf) -> LinkerResult<Option<Node>> {
        let root = match self.current_root()? {
            Some(root) => root,
            None => return Ok(None),
        };
        self.walk_from_root(root, path)
    }

    /// Like [`Self::lookup_node`], but resolves against an explicit commit's
    /// root rather than the Linker's own cached current root. Grounded in
    /// `catfs/core/linker.go`'s `LookupNodeAt`, used by the mapper (spec.md
    /// §4.I) to compare two arbitrary commits instead of always the live
    /// staging tree.
    pub fn lookup_node_at(&self, commit: &CommitNode, path: &RepoPathBuf) -> LinkerResult<Option<Node>> {
        let root = self.directory_by_hash(commit.root)?;
        self.walk_from_root(root, path)
    }

    fn walk_from_root(&self, root: DirectoryNode, path: &RepoPathBuf) -> LinkerResult<Option<Node>> {
        if path.is_root() {
            return Ok(Some(Node::Directory(root)));
        }

        let mut current = root;
        let components: Vec<&str> = path.components().collect();
        for (idx, component) in components.iter().enumerate() {
            let Some(child_hash) = current.children.get(*component).copied() else {
                return Ok(None);
            };
            let Some(child) = self.node_by_hash(child_hash)? else {
                return Ok(None);
            };
            let is_last = idx + 1 == components.len();
            if is_last {
                return Ok(Some(child));
            }
            match child {
                Node::Directory(dir) => current = dir,
                _ => return Ok(None),
            }
        }
        Ok(Some(Node::Directory(current)))
    }

    fn current_root(&self) -> LinkerResult<Option<DirectoryNode>> {
        if let Some(root) = self.indices.lock().unwrap().root.clone() {
            return Ok(Some(root));
        }
        let status = match self.read_status_raw() {
            Ok(status) => status,
            Err(LinkerError::Kv(KvError::NoSuchKey(_))) => return Ok(None),
            Err(e) => return Err(e),
        };
        let root = self.directory_by_hash(status.root)?;
        self.indices.lock().unwrap().root = Some(root.clone());
        Ok(Some(root))
    }

    /// Cache-first; else reads `stage/objects` then `objects` (spec.md
    /// §4.D: `node_by_hash`).
    pub fn node_by_hash(&self, hash: Hash) -> LinkerResult<Option<Node>> {
        let b58 = hash.to_b58();
        if let Some(nd) = self.indices.lock().unwrap().by_hash.get(&b58).cloned() {
            return Ok(Some(nd));
        }
        for segments in [key(&["stage", "objects", b58.as_str()]), key(&["objects", b58.as_str()])] {
            match self.kv.get(&segments) {
                Ok(bytes) => {
                    let nd = decode_node(&bytes)?;
                    self.indices.lock().unwrap().add(nd.clone(), false);
                    return Ok(Some(nd));
                }
                Err(KvError::NoSuchKey(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Reads `inode/<n>` to get a hash, then [`Self::node_by_hash`]
    /// (spec.md §4.D: `node_by_inode`).
    pub fn node_by_inode(&self, inode: u64) -> LinkerResult<Option<Node>> {
        if let Some(nd) = self.indices.lock().unwrap().by_inode.get(&inode).cloned() {
            return Ok(Some(nd));
        }
        match self.kv.get(&key(&["inode", inode.to_string().as_str()])) {
            Ok(bytes) => {
                let hash = decode_le_u64_as_hash_lookup(&bytes)?;
                self.node_by_hash(hash)
            }
            Err(KvError::NoSuchKey(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn directory_by_hash(&self, hash: Hash) -> LinkerResult<DirectoryNode> {
        match self.node_by_hash(hash)? {
            Some(Node::Directory(dir)) => Ok(dir),
            Some(_) => Err(LinkerError::Node(crate::error::NodeError::BadNode)),
            None => Err(LinkerError::Kv(KvError::NoSuchKey(vec!["objects".to_owned(), hash.to_b58()]))),
        }
    }

    fn commit_by_hash(&self, hash: Hash) -> LinkerResult<CommitNode> {
        match self.node_by_hash(hash)? {
            Some(Node::Commit(c)) => Ok(c),
            Some(_) => Err(LinkerError::Node(crate::error::NodeError::BadNode)),
            None => Err(LinkerError::Kv(KvError::NoSuchKey(vec!["objects".to_owned(), hash.to_b58()]))),
        }
    }

    // -- refs ------------------------------------------------------------

    fn ref_key(name: &str) -> Vec<String> {
        key(&["refs", name.to_lowercase().as_str()])
    }

    pub fn save_ref(&self, name: &str, hash: Hash) -> LinkerResult<()> {
        self.atomic_with_batch(|batch| {
            batch.put(hash.to_b58().as_bytes(), Self::ref_key(name));
            Ok(())
        })
    }

    pub fn remove_ref(&self, name: &str) -> LinkerResult<()> {
        self.atomic_with_batch(|batch| {
            batch.erase(Self::ref_key(name));
            Ok(())
        })
    }

    pub fn list_refs(&self) -> LinkerResult<Vec<(String, Hash)>> {
        let mut out = Vec::new();
        for k in self.kv.glob(&key(&["refs"]))? {
            let name = k.last().cloned().unwrap_or_default();
            let bytes = self.kv.get(&k)?;
            let b58 = String::from_utf8(bytes).map_err(|e| LinkerError::Kv(KvError::Corrupt(e.to_string())))?;
            let hash = Hash::from_b58(&b58).map_err(|_| LinkerError::Kv(KvError::Corrupt("bad ref hash".to_owned())))?;
            out.push((name, hash));
        }
        Ok(out)
    }

    /// Lowercase-normalizes `name`, strips a trailing run of `^` (each one
    /// means "parent"), then resolves the base name, applying the caret
    /// walk afterward (spec.md §4.D: `resolve_ref`).
    #[instrument(skip(self))]
    pub fn resolve_ref(&self, name: &str) -> LinkerResult<Node> {
        let lower = name.to_lowercase();
        let base = lower.trim_end_matches('^');
        let hops = lower.len() - base.len();

        let mut node = self.resolve_ref_base(base)?;
        for _ in 0..hops {
            let Node::Commit(commit) = &node else {
                return Err(LinkerError::Node(crate::error::NodeError::BadNode));
            };
            match commit.parent {
                Some(parent_hash) => node = Node::Commit(self.commit_by_hash(parent_hash)?),
                None => {
                    warn!(ref_name = name, "resolve_ref: parent chain exhausted, stopping at initial commit");
                    break;
                }
            }
        }
        Ok(node)
    }

    fn resolve_ref_base(&self, base: &str) -> LinkerResult<Node> {
        match base {
            REF_HEAD => {
                let hash = self.read_ref_hash(REF_HEAD)?;
                Ok(Node::Commit(self.commit_by_hash(hash)?))
            }
            REF_CURR | REF_STATUS => Ok(Node::Commit(self.status()?)),
            other => {
                if let Ok(hash) = self.read_ref_hash(other) {
                    return Ok(Node::Commit(self.commit_by_hash(hash)?));
                }
                if let Ok(hash) = Hash::from_b58(other) {
                    if let Some(nd) = self.node_by_hash(hash)? {
                        return Ok(nd);
                    }
                }
                Err(LinkerError::NoSuchRef(other.to_owned()))
            }
        }
    }

    fn read_ref_hash(&self, name: &str) -> LinkerResult<Hash> {
        match self.kv.get(&Self::ref_key(name)) {
            Ok(bytes) => {
                let b58 = String::from_utf8(bytes).map_err(|e| LinkerError::Kv(KvError::Corrupt(e.to_string())))?;
                Hash::from_b58(&b58).map_err(|_| LinkerError::Kv(KvError::Corrupt("bad ref hash".to_owned())))
            }
            Err(KvError::NoSuchKey(_)) => Err(LinkerError::NoSuchRef(name.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    /// The commit pointed to by `refs/head`, or `None` before the first
    /// commit (spec.md §4.D: `head_commit`). Exposed so the garbage
    /// collector (spec.md §4.E) and the VCS mapper (spec.md §4.I) can walk
    /// from it without going through ref-name parsing.
    pub fn head_commit(&self) -> LinkerResult<Option<CommitNode>> {
        match self.read_ref_hash(REF_HEAD) {
            Ok(hash) => Ok(Some(self.commit_by_hash(hash)?)),
            Err(LinkerError::NoSuchRef(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -- staging commit ---------------------------------------------------

    fn read_status_raw(&self) -> LinkerResult<CommitNode> {
        match self.kv.get(&key(&["stage", "STATUS"])) {
            Ok(bytes) => match decode_node(&bytes)? {
                Node::Commit(c) => Ok(c),
                _ => Err(LinkerError::Node(crate::error::NodeError::BadNode)),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn write_status(&self, batch: &Batch, status: &CommitNode) {
        batch.put(&encode_node(&Node::Commit(status.clone())), key(&["stage", "STATUS"]));
    }

    /// Returns the staging commit, creating an empty one (parented on
    /// `head`, or on a fresh empty root directory if there is no `head`
    /// yet) if none exists. Idempotent and safe under concurrent callers
    /// (spec.md §4.D: `status`).
    #[instrument(skip(self))]
    pub fn status(&self) -> LinkerResult<CommitNode> {
        if let Ok(status) = self.read_status_raw() {
            return Ok(status);
        }
        self.atomic_with_batch(|batch| {
            if let Ok(status) = self.read_status_raw() {
                return Ok(status);
            }
            let head = self.head_commit()?;
            let root_hash = match &head {
                Some(head) => head.root,
                None => {
                    let inode = self.next_inode_in(batch)?;
                    let root = new_root_directory(self.owner.clone(), 0, inode);
                    self.put_node(batch, &root, true);
                    self.indices.lock().unwrap().root = root.as_directory().cloned();
                    root.tree_hash()
                }
            };
            let base = NodeBase {
                name: String::new(),
                user: self.owner.clone(),
                tree_hash: Hash::from_bytes([0; crate::hash::HASH_LEN]),
                content_hash: None,
                backend_hash: None,
                mod_time: 0,
                inode: 0,
            };
            let status = CommitNode {
                base,
                message: String::new(),
                author: self.owner.clone(),
                root: root_hash,
                parent: head.map(|h| h.base.tree_hash),
                index: 0,
                merge: None,
            };
            let mut status_node = Node::Commit(status);
            status_node.recompute_tree_hash();
            let Node::Commit(status) = status_node else { unreachable!() };
            self.write_status(batch, &status);
            Ok(status)
        })
    }

    /// `true` iff the staging root hash differs from head's root, or head
    /// is absent and the staging root is nonempty (spec.md §4.D:
    /// `have_staged_changes`).
    pub fn have_staged_changes(&self) -> LinkerResult<bool> {
        let status = self.status()?;
        match self.head_commit()? {
            Some(head) => Ok(status.root != head.root),
            None => {
                let root = self.directory_by_hash(status.root)?;
                Ok(!root.children.is_empty())
            }
        }
    }

    /// Promotes the staging commit to an immutable commit, assigning it
    /// the next `index`, writing `refs/head`, and clearing `stage/*`
    /// except for a fresh `STATUS` (spec.md §4.D: `make_commit`). Fails
    /// with [`LinkerError::NoChange`] when the staging root equals head's
    /// root.
    #[instrument(skip(self, author, message))]
    pub fn make_commit(&self, author: &str, message: &str, mod_time: i64) -> LinkerResult<CommitNode> {
        let status = self.status()?;
        let head = self.head_commit()?;
        if let Some(head) = &head {
            if head.root == status.root {
                return Err(LinkerError::NoChange);
            }
        }

        self.atomic_with_batch(|batch| {
            let inode = self.next_inode_in(batch)?;
            let index = head.as_ref().map_or(0, |h| h.index + 1);
            let base = NodeBase {
                name: String::new(),
                user: self.owner.clone(),
                tree_hash: Hash::from_bytes([0; crate::hash::HASH_LEN]),
                content_hash: None,
                backend_hash: None,
                mod_time,
                inode,
            };
            let commit = CommitNode {
                base,
                message: message.to_owned(),
                author: author.to_owned(),
                root: status.root,
                parent: head.as_ref().map(|h| h.base.tree_hash),
                index,
                merge: None,
            };
            let mut commit_node = Node::Commit(commit);
            commit_node.recompute_tree_hash();
            let Node::Commit(commit) = commit_node.clone() else { unreachable!() };

            batch.put(&encode_node(&commit_node), key(&["objects", commit.base.tree_hash.to_b58().as_str()]));
            batch.put(commit.base.tree_hash.to_b58().as_bytes(), key(&["index", index.to_string().as_str()]));
            batch.put(commit.base.tree_hash.to_b58().as_bytes(), Self::ref_key(REF_HEAD));

            // Staged objects/tree entries/move records only exist under
            // `stage/*`; promote each into its permanent counterpart before
            // the `stage` subtree is wiped below, or committed data would
            // simply vanish from the KV store (masked only by the in-memory
            // caches staying warm within this same `Linker` instance).
            self.promote_staged(batch, &["objects"])?;
            self.promote_staged(batch, &["tree"])?;
            self.promote_staged(batch, &["moves"])?;

            batch.clear(key(&["stage"]));

            let mut fresh_status = status.clone();
            fresh_status.parent = Some(commit.base.tree_hash);
            let mut fresh_node = Node::Commit(fresh_status);
            fresh_node.recompute_tree_hash();
            let Node::Commit(fresh_status) = fresh_node else { unreachable!() };
            self.write_status(batch, &fresh_status);

            self.indices.lock().unwrap().add(commit_node, false);
            info!(index, root = %commit.root, "committed");
            Ok(commit)
        })
    }

    // -- mkdir / stage -----------------------------------------------------

    /// Creates an empty directory at `path` if the parent exists and the
    /// basename is absent; replaces a ghost at the basename; fails if a
    /// file already occupies it. Idempotent if the target is already a
    /// directory. Creating intermediate parents is gated by
    /// `create_parents` (spec.md §4.D: `mkdir`).
    #[instrument(skip(self))]
    pub fn mkdir(&self, path: &RepoPathBuf, create_parents: bool, mod_time: i64) -> LinkerResult<DirectoryNode> {
        self.atomic_with_batch(|batch| self.mkdir_in(batch, path, create_parents, mod_time))
    }

    fn mkdir_in(
        &self,
        batch: &Batch,
        path: &RepoPathBuf,
        create_parents: bool,
        mod_time: i64,
    ) -> LinkerResult<DirectoryNode> {
        if path.is_root() {
            if let Some(root) = self.current_root()? {
                return Ok(root);
            }
            // `status()` ensures the root directory and staging commit both
            // exist (it creates an empty root when there's no head yet);
            // reuse that instead of duplicating root-creation here, since
            // `stage_node_in`'s root branch needs `stage/STATUS` to already
            // be in place.
            let status = self.status()?;
            let root = self.directory_by_hash(status.root)?;
            self.indices.lock().unwrap().root = Some(root.clone());
            let _ = (batch, mod_time);
            return Ok(root);
        }

        if let Some(existing) = self.lookup_node(path)? {
            match existing {
                Node::Directory(dir) => return Ok(dir),
                Node::File(_) => return Err(LinkerError::NotADirectory(path.clone())),
                Node::Ghost(_) => {}
                Node::Commit(_) => return Err(LinkerError::Node(crate::error::NodeError::BadNode)),
            }
        }

        let parent_path = path.parent().expect("non-root path has a parent");
        let parent_dir = match self.lookup_node(&parent_path)? {
            Some(Node::Directory(dir)) => dir,
            Some(_) => return Err(LinkerError::NotADirectory(parent_path)),
            None if create_parents => self.mkdir_in(batch, &parent_path, true, mod_time)?,
            None => return Err(LinkerError::NoSuchFile(parent_path)),
        };

        let inode = self.next_inode_in(batch)?;
        let mut node = Node::Directory(DirectoryNode {
            base: NodeBase {
                name: path.basename().to_owned(),
                user: self.owner.clone(),
                tree_hash: Hash::from_bytes([0; crate::hash::HASH_LEN]),
                content_hash: None,
                backend_hash: None,
                mod_time,
                inode,
            },
            size: 0,
            parent: Some(parent_path),
            children: Default::default(),
        });
        node.recompute_tree_hash();
        self.stage_node_in(batch, node)
            .map(|nd| nd.as_directory().cloned().expect("just built a directory"))
    }

    /// Ensures the parent chain, replaces any ghost, and either creates a
    /// new file or updates an existing one. A no-op if the new
    /// `backend_hash` equals the old one. On update, the old child is
    /// first removed from the parent so the parent's tree_hash recomputes
    /// correctly, then re-added after mutation (spec.md §4.D: `stage`).
    #[instrument(skip(self, key, content_hash, backend_hash))]
    #[allow(clippy::too_many_arguments)]
    pub fn stage(
        &self,
        path: &RepoPathBuf,
        content_hash: Hash,
        backend_hash: Hash,
        size: u64,
        key: [u8; 32],
        mod_time: i64,
    ) -> LinkerResult<FileNode> {
        self.atomic_with_batch(|batch| {
            let parent_path = path.parent().ok_or_else(|| LinkerError::NotADirectory(path.clone()))?;
            self.mkdir_in(batch, &parent_path, true, mod_time)?;

            let existing = self.lookup_node(path)?;
            if let Some(Node::File(existing)) = &existing {
                if existing.base.backend_hash == Some(backend_hash) {
                    return Ok(existing.clone());
                }
            }

            let inode = match &existing {
                Some(Node::File(f)) => f.base.inode,
                Some(Node::Ghost(g)) => g.ghost_inode,
                _ => self.next_inode_in(batch)?,
            };

            if matches!(existing, Some(Node::Directory(_))) {
                return Err(LinkerError::NotADirectory(path.clone()));
            }

            // Detach the old child first so the parent's tree_hash
            // recomputes correctly once the new file is re-attached.
            if existing.is_some() {
                let parent_dir = match self.lookup_node(&parent_path)? {
                    Some(Node::Directory(dir)) => dir,
                    _ => return Err(LinkerError::NotADirectory(parent_path.clone())),
                };
                let detached = directory_with_child(&parent_dir, path.basename(), None);
                let mut detached_node = Node::Directory(detached);
                detached_node.recompute_tree_hash();
                self.stage_node_in(batch, detached_node)?;
            }

            let mut node = Node::File(FileNode {
                base: NodeBase {
                    name: path.basename().to_owned(),
                    user: self.owner.clone(),
                    tree_hash: Hash::from_bytes([0; crate::hash::HASH_LEN]),
                    content_hash: Some(content_hash),
                    backend_hash: Some(backend_hash),
                    mod_time,
                    inode,
                },
                size,
                parent: parent_path,
                key,
            });
            node.recompute_tree_hash();
            let staged = self.stage_node_in(batch, node)?;
            Ok(staged.as_file().cloned().expect("just built a file"))
        })
    }

    /// Removes the node at `path`, replacing it with a [`GhostNode`] that
    /// carries its last-known state (spec.md §3: ghosts).
    #[instrument(skip(self))]
    pub fn remove(&self, path: &RepoPathBuf, mod_time: i64) -> LinkerResult<GhostNode> {
        self.atomic_with_batch(|batch| {
            let existing = self
                .lookup_node(path)?
                .ok_or_else(|| LinkerError::NoSuchFile(path.clone()))?;
            if matches!(existing, Node::Ghost(_)) {
                return Err(LinkerError::NoSuchFile(path.clone()));
            }

            let parent_path = path.parent().ok_or_else(|| LinkerError::NotADirectory(path.clone()))?;
            let parent_dir = match self.lookup_node(&parent_path)? {
                Some(Node::Directory(dir)) => dir,
                _ => return Err(LinkerError::NotADirectory(parent_path.clone())),
            };
            let detached = directory_with_child(&parent_dir, path.basename(), None);
            let mut detached_node = Node::Directory(detached);
            detached_node.recompute_tree_hash();
            self.stage_node_in(batch, detached_node)?;

            let ghost_node = make_ghost(existing, path.clone(), 0, self.owner.clone(), mod_time);
            let Node::Ghost(ghost) = ghost_node else { unreachable!() };
            let ghost_inode = ghost.base.inode;
            let mut ghost = ghost;
            ghost.ghost_inode = ghost_inode;
            let ghost_node = Node::Ghost(ghost.clone());
            self.stage_node_in(batch, ghost_node)?;
            Ok(ghost)
        })
    }

    // -- moves -------------------------------------------------------------

    /// Records that `src_inode` (formerly at `src_path`) now lives at
    /// `dst_path`, so the mapper can propagate the move instead of
    /// reporting add+remove (spec.md §6 supplement).
    pub fn record_move(&self, src_inode: u64, src_path: &RepoPathBuf, dst_path: &RepoPathBuf) -> LinkerResult<()> {
        self.atomic_with_batch(|batch| {
            let forward = MoveMapping {
                src_inode,
                src_path: src_path.clone(),
                dst_path: dst_path.clone(),
                forward: true,
            };
            batch.put(&format_move_mapping(&forward), key(&["stage", "moves", src_inode.to_string().as_str()]));
            batch.put(
                &format_move_mapping(&forward),
                key(&["stage", "moves", "overlay", src_inode.to_string().as_str()]),
            );
            Ok(())
        })
    }

    /// Looks up where (if anywhere) `src_inode`'s ghost says it moved to,
    /// checking the staged record before the committed one.
    pub fn move_target(&self, src_inode: u64) -> LinkerResult<Option<MoveMapping>> {
        for segments in [
            key(&["stage", "moves", src_inode.to_string().as_str()]),
            key(&["moves", src_inode.to_string().as_str()]),
        ] {
            match self.kv.get(&segments) {
                Ok(bytes) => return Ok(Some(parse_move_mapping(&bytes)?)),
                Err(KvError::NoSuchKey(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    // -- supplemented features (spec.md §6, from FilesByContents) --------

    /// Reverse lookup of files by backend hash, across `objects/*` and
    /// `stage/objects/*`. Heavy — not meant to be called in a loop
    /// (grounded in `catfs/core/linker.go`'s `FilesByContents`).
    pub fn files_by_contents(&self, contents: &[Hash]) -> LinkerResult<HashMap<String, FileNode>> {
        let mut result = HashMap::new();
        for prefix in [vec!["objects".to_owned()], vec!["stage".to_owned(), "objects".to_owned()]] {
            for k in self.kv.keys(&prefix)? {
                let data = self.kv.get(&k)?;
                let nd = match decode_node(&data) {
                    Ok(nd) => nd,
                    Err(_) => continue,
                };
                let Node::File(file) = nd else { continue };
                if let Some(backend_hash) = file.base.backend_hash {
                    if contents.contains(&backend_hash) {
                        result.insert(backend_hash.to_b58(), file);
                    }
                }
            }
        }
        Ok(result)
    }

    pub(crate) fn kv(&self) -> &Arc<dyn Database> {
        &self.kv
    }

    /// Drops `hash` from the in-memory by-hash/by-inode/path-trie caches
    /// (spec.md §4.E: sweep "purges it from the in-memory index"). Caches
    /// are pure truth-mirrors of the KV state, so dropping an entry is
    /// always safe — the next lookup simply reloads from the KV, or finds
    /// nothing if the key really is gone.
    pub(crate) fn purge_from_indices(&self, hash: Hash) {
        let mut indices = self.indices.lock().unwrap();
        if indices.root.as_ref().is_some_and(|root| root.base.tree_hash == hash) {
            indices.root = None;
        }
        let b58 = hash.to_b58();
        if let Some(nd) = indices.by_hash.remove(&b58) {
            indices.by_inode.remove(&nd.inode());
            if let Some(path) = nd.path() {
                let key = if nd.node_type() == NodeType::Directory {
                    path.as_directory_key()
                } else {
                    path.as_str().to_owned()
                };
                indices.ptrie.remove(&key);
            }
        }
    }
}

fn decode_le_u64_as_hash_lookup(bytes: &[u8]) -> LinkerResult<Hash> {
    // `inode/<n>` stores the node's own tree hash in base58 text, matching
    // every other tree index (spec.md §4.D lists it as `b58(tree_hash)`).
    let b58 = std::str::from_utf8(bytes).map_err(|e| LinkerError::Kv(KvError::Corrupt(e.to_string())))?;
    Hash::from_b58(b58).map_err(|_| LinkerError::Kv(KvError::Corrupt("bad hash in inode index".to_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryDb;

    fn new_linker() -> Linker {
        Linker::new(Arc::new(MemoryDb::new()), "alice")
    }

    #[test]
    fn status_is_idempotent() {
        let lkr = new_linker();
        let a = lkr.status().unwrap();
        let b = lkr.status().unwrap();
        assert_eq!(a.root, b.root);
    }

    #[test]
    fn mkdir_then_resolve_root_is_cached() {
        let lkr = new_linker();
        let root1 = lkr.mkdir(&RepoPathBuf::root(), false, 0).unwrap();
        let root2 = lkr.mkdir(&RepoPathBuf::root(), false, 0).unwrap();
        assert_eq!(root1.base.tree_hash, root2.base.tree_hash);
    }

    #[test]
    fn stage_file_then_commit_persists_across_reopen() {
        let lkr = new_linker();
        let path = RepoPathBuf::parse("/cat.png");
        let content = Hash::sum(b"meow");
        let backend = Hash::sum(b"backend-bytes");
        lkr.stage(&path, content, backend, 4, [1u8; 32], 1000).unwrap();
        let commit = lkr.make_commit("alice", "first", 1000).unwrap();
        assert_eq!(commit.index, 0);

        let head = lkr.resolve_ref("head").unwrap();
        let Node::Commit(head_commit) = head else { panic!("expected commit") };
        assert_eq!(head_commit.root, commit.root);
    }

    #[test]
    fn commit_with_no_change_fails() {
        let lkr = new_linker();
        lkr.stage(&RepoPathBuf::parse("/a"), Hash::sum(b"a"), Hash::sum(b"a-backend"), 1, [0u8; 32], 0)
            .unwrap();
        lkr.make_commit("alice", "first", 0).unwrap();
        let err = lkr.make_commit("alice", "second", 0).unwrap_err();
        assert!(matches!(err, LinkerError::NoChange));
    }

    #[test]
    fn ref_walk_stops_at_initial_commit() {
        let lkr = new_linker();
        for i in 0..10 {
            let path = RepoPathBuf::parse("/x");
            lkr.stage(&path, Hash::sum(format!("v{i}").as_bytes()), Hash::sum(format!("b{i}").as_bytes()), 1, [0u8; 32], i)
                .unwrap();
            lkr.make_commit("alice", "msg", i).unwrap();
        }
        let ten_carets = lkr.resolve_ref("head^^^^^^^^^^").unwrap();
        let eleven_carets = lkr.resolve_ref("head^^^^^^^^^^^").unwrap();
        let Node::Commit(a) = ten_carets else { panic!() };
        let Node::Commit(b) = eleven_carets else { panic!() };
        assert_eq!(a.base.tree_hash, b.base.tree_hash);
        assert_eq!(a.index, 0);
    }

    #[test]
    fn hash_collision_across_paths_yields_distinct_tree_hashes() {
        let lkr = new_linker();
        let content = Hash::sum(b"same content");
        let backend = Hash::sum(b"same backend");
        let a = lkr.stage(&RepoPathBuf::parse("/sub/a.png"), content, backend, 1, [0; 32], 0).unwrap();
        let b = lkr.stage(&RepoPathBuf::parse("/a.png"), content, backend, 1, [0; 32], 0).unwrap();
        let c = lkr.stage(&RepoPathBuf::parse("/b.png"), content, backend, 1, [0; 32], 0).unwrap();
        assert_ne!(a.base.tree_hash, b.base.tree_hash);
        assert_ne!(a.base.tree_hash, c.base.tree_hash);
        assert_ne!(b.base.tree_hash, c.base.tree_hash);
    }

    #[test]
    fn remove_replaces_node_with_ghost() {
        let lkr = new_linker();
        let path = RepoPathBuf::parse("/cat.png");
        lkr.stage(&path, Hash::sum(b"a"), Hash::sum(b"a-backend"), 1, [0; 32], 0).unwrap();
        let ghost = lkr.remove(&path, 1).unwrap();
        assert_eq!(ghost.ghost_path, path);
        let looked_up = lkr.lookup_node(&path).unwrap().unwrap();
        assert!(matches!(looked_up, Node::Ghost(_)));
    }

    #[test]
    fn have_staged_changes_reflects_root_delta() {
        let lkr = new_linker();
        assert!(!lkr.have_staged_changes().unwrap());
        lkr.stage(&RepoPathBuf::parse("/a"), Hash::sum(b"a"), Hash::sum(b"a-backend"), 1, [0; 32], 0)
            .unwrap();
        assert!(lkr.have_staged_changes().unwrap());
        lkr.make_commit("alice", "first", 0).unwrap();
        assert!(!lkr.have_staged_changes().unwrap());
    }

    #[test]
    fn atomic_rollback_clears_indices_on_error() {
        let lkr = new_linker();
        lkr.mkdir(&RepoPathBuf::root(), false, 0).unwrap();
        let result: LinkerResult<()> = lkr.atomic_with_batch(|batch| {
            batch.put(b"x", key(&["objects", "dummy"]));
            Err(LinkerError::NoChange)
        });
        assert!(result.is_err());
        assert!(lkr.kv.get(&key(&["objects", "dummy"])).is_err());
    }
}
