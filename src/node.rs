//! The node model (spec.md §3, §4.C): a tagged union of File, Directory,
//! Commit and Ghost, with a compact binary encoding that is this crate's
//! on-wire and on-disk contract.
//!
//! jj-lib models this with `backend::TreeValue`/`backend::Tree` plus a
//! derive-generated `ContentHash` trait and a prost-generated proto schema
//! (`simple_backend.rs`). We don't have the `jj-lib-proc-macros` derive
//! source or the `.proto` files in the retrieval pack, so rather than
//! fabricate either, we hand-write the canonical encoding directly: a
//! node's `tree_hash` is simply `Hash::sum` of that canonical encoding with
//! the `tree_hash` field itself omitted. This satisfies the same invariant
//! jj-lib's `ContentHash` derive buys it (deterministic, recursive,
//! structural hashing) without inventing dependencies that aren't in the
//! corpus. See DESIGN.md for the full note.

use std::collections::HashMap;
use std::io::Cursor;
use std::io::Read as _;

use indexmap::IndexMap;

use crate::error::NodeError;
use crate::error::NodeResult;
use crate::hash::Hash;
use crate::hash::ghost_hash;
use crate::repo_path::RepoPathBuf;

/// Discriminant shared by all four variants (spec.md §3: "`type`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    Commit,
    Ghost,
}

/// Fields common to every node variant (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBase {
    pub name: String,
    pub user: String,
    pub tree_hash: Hash,
    pub content_hash: Option<Hash>,
    pub backend_hash: Option<Hash>,
    pub mod_time: i64,
    pub inode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub base: NodeBase,
    pub size: u64,
    pub parent: RepoPathBuf,
    /// Per-file symmetric key (spec.md §3).
    pub key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    pub base: NodeBase,
    pub size: u64,
    pub parent: Option<RepoPathBuf>,
    /// Insertion-ordered map from basename to child tree hash (spec.md §3:
    /// "a map from basename to tree_hash, and an insertion-ordered name
    /// list" — `IndexMap` gives us both in one structure).
    pub children: IndexMap<String, Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInfo {
    pub with: Hash,
    pub head: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNode {
    pub base: NodeBase,
    pub message: String,
    pub author: String,
    pub root: Hash,
    pub parent: Option<Hash>,
    pub index: u64,
    pub merge: Option<MergeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostNode {
    pub base: NodeBase,
    pub inner: Box<Node>,
    pub ghost_path: RepoPathBuf,
    pub ghost_inode: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileNode),
    Directory(DirectoryNode),
    Commit(CommitNode),
    Ghost(GhostNode),
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::File(_) => NodeType::File,
            Self::Directory(_) => NodeType::Directory,
            Self::Commit(_) => NodeType::Commit,
            Self::Ghost(_) => NodeType::Ghost,
        }
    }

    pub fn base(&self) -> &NodeBase {
        match self {
            Self::File(f) => &f.base,
            Self::Directory(d) => &d.base,
            Self::Commit(c) => &c.base,
            Self::Ghost(g) => &g.base,
        }
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        match self {
            Self::File(f) => &mut f.base,
            Self::Directory(d) => &mut d.base,
            Self::Commit(c) => &mut c.base,
            Self::Ghost(g) => &mut g.base,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn tree_hash(&self) -> Hash {
        self.base().tree_hash
    }

    pub fn content_hash(&self) -> Option<Hash> {
        self.base().content_hash
    }

    pub fn backend_hash(&self) -> Option<Hash> {
        self.base().backend_hash
    }

    pub fn inode(&self) -> u64 {
        self.base().inode
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Self::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            Self::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_commit(&self) -> Option<&CommitNode> {
        match self {
            Self::Commit(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_ghost(&self) -> Option<&GhostNode> {
        match self {
            Self::Ghost(g) => Some(g),
            _ => None,
        }
    }

    /// The path this node lives (or lived) at. Commits have no path.
    pub fn path(&self) -> Option<RepoPathBuf> {
        match self {
            Self::File(f) => Some(join_parent(&f.parent, &f.base.name)),
            Self::Directory(d) => match &d.parent {
                Some(parent) => Some(join_parent(parent, &d.base.name)),
                None => Some(RepoPathBuf::root()),
            },
            Self::Commit(_) => None,
            Self::Ghost(g) => Some(g.ghost_path.clone()),
        }
    }

    /// Recomputes and stores this node's `tree_hash` (spec.md §3: "A
    /// directory's tree_hash is a pure function of its serialized children
    /// map (recursive); any child change propagates up to the root.").
    pub fn recompute_tree_hash(&mut self) {
        let bytes = canonical_bytes(self, false);
        let hash = Hash::sum(&bytes);
        self.base_mut().tree_hash = hash;
    }
}

fn join_parent(parent: &RepoPathBuf, name: &str) -> RepoPathBuf {
    parent.join(name)
}

// --- Binary encoding -------------------------------------------------------
//
// A small hand-rolled writer/reader pair. Every multi-byte integer is
// little-endian; strings and byte blobs are length-prefixed with a u32.

fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    write_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

fn write_str(buf: &mut Vec<u8>, v: &str) {
    write_bytes(buf, v.as_bytes());
}

fn write_hash(buf: &mut Vec<u8>, v: &Hash) {
    buf.extend_from_slice(v.as_bytes());
}

fn write_opt_hash(buf: &mut Vec<u8>, v: Option<&Hash>) {
    match v {
        Some(h) => {
            write_u8(buf, 1);
            write_hash(buf, h);
        }
        None => write_u8(buf, 0),
    }
}

fn write_path(buf: &mut Vec<u8>, p: &RepoPathBuf) {
    write_str(buf, p.as_str());
}

fn write_opt_path(buf: &mut Vec<u8>, p: Option<&RepoPathBuf>) {
    match p {
        Some(p) => {
            write_u8(buf, 1);
            write_path(buf, p);
        }
        None => write_u8(buf, 0),
    }
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(data) }
    }

    fn read_u8(&mut self) -> NodeResult<u8> {
        let mut b = [0u8; 1];
        self.cursor.read_exact(&mut b).map_err(encoding_err)?;
        Ok(b[0])
    }

    fn read_u32(&mut self) -> NodeResult<u32> {
        let mut b = [0u8; 4];
        self.cursor.read_exact(&mut b).map_err(encoding_err)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&mut self) -> NodeResult<u64> {
        let mut b = [0u8; 8];
        self.cursor.read_exact(&mut b).map_err(encoding_err)?;
        Ok(u64::from_le_bytes(b))
    }

    fn read_i64(&mut self) -> NodeResult<i64> {
        let mut b = [0u8; 8];
        self.cursor.read_exact(&mut b).map_err(encoding_err)?;
        Ok(i64::from_le_bytes(b))
    }

    fn read_bytes(&mut self) -> NodeResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(encoding_err)?;
        Ok(buf)
    }

    fn read_str(&mut self) -> NodeResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| NodeError::Encoding(e.to_string()))
    }

    fn read_hash(&mut self) -> NodeResult<Hash> {
        let mut b = [0u8; crate::hash::HASH_LEN];
        self.cursor.read_exact(&mut b).map_err(encoding_err)?;
        Ok(Hash::from_bytes(b))
    }

    fn read_opt_hash(&mut self) -> NodeResult<Option<Hash>> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_hash()?)),
            _ => Err(NodeError::Encoding("bad option tag".to_owned())),
        }
    }

    fn read_path(&mut self) -> NodeResult<RepoPathBuf> {
        Ok(RepoPathBuf::parse(self.read_str()?))
    }

    fn read_opt_path(&mut self) -> NodeResult<Option<RepoPathBuf>> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_path()?)),
            _ => Err(NodeError::Encoding("bad option tag".to_owned())),
        }
    }
}

fn encoding_err(e: std::io::Error) -> NodeError {
    NodeError::Encoding(e.to_string())
}

fn write_base(buf: &mut Vec<u8>, base: &NodeBase, include_tree_hash: bool) {
    write_str(buf, &base.name);
    write_str(buf, &base.user);
    if include_tree_hash {
        write_u8(buf, 1);
        write_hash(buf, &base.tree_hash);
    } else {
        write_u8(buf, 0);
    }
    write_opt_hash(buf, base.content_hash.as_ref());
    write_opt_hash(buf, base.backend_hash.as_ref());
    write_i64(buf, base.mod_time);
    write_u64(buf, base.inode);
}

fn read_base(r: &mut Reader<'_>) -> NodeResult<NodeBase> {
    let name = r.read_str()?;
    let user = r.read_str()?;
    let tree_hash = match r.read_u8()? {
        1 => r.read_hash()?,
        0 => Hash::from_bytes([0; crate::hash::HASH_LEN]),
        _ => return Err(NodeError::Encoding("bad tree_hash presence tag".to_owned())),
    };
    let content_hash = r.read_opt_hash()?;
    let backend_hash = r.read_opt_hash()?;
    let mod_time = r.read_i64()?;
    let inode = r.read_u64()?;
    Ok(NodeBase {
        name,
        user,
        tree_hash,
        content_hash,
        backend_hash,
        mod_time,
        inode,
    })
}

/// Encodes `node` for hashing (`include_tree_hash = false`) or for storage
/// (`include_tree_hash = true`, the default used by [`encode_node`]).
fn canonical_bytes(node: &Node, include_tree_hash: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    match node {
        Node::File(f) => {
            write_u8(&mut buf, 0);
            write_base(&mut buf, &f.base, include_tree_hash);
            write_u64(&mut buf, f.size);
            write_path(&mut buf, &f.parent);
            write_bytes(&mut buf, &f.key);
        }
        Node::Directory(d) => {
            write_u8(&mut buf, 1);
            write_base(&mut buf, &d.base, include_tree_hash);
            write_u64(&mut buf, d.size);
            write_opt_path(&mut buf, d.parent.as_ref());
            write_u32(&mut buf, d.children.len() as u32);
            for (name, hash) in &d.children {
                write_str(&mut buf, name);
                write_hash(&mut buf, hash);
            }
        }
        Node::Commit(c) => {
            write_u8(&mut buf, 2);
            write_base(&mut buf, &c.base, include_tree_hash);
            write_str(&mut buf, &c.message);
            write_str(&mut buf, &c.author);
            write_hash(&mut buf, &c.root);
            write_opt_hash(&mut buf, c.parent.as_ref());
            write_u64(&mut buf, c.index);
            match &c.merge {
                Some(m) => {
                    write_u8(&mut buf, 1);
                    write_hash(&mut buf, &m.with);
                    write_hash(&mut buf, &m.head);
                }
                None => write_u8(&mut buf, 0),
            }
        }
        Node::Ghost(g) => {
            write_u8(&mut buf, 3);
            write_base(&mut buf, &g.base, include_tree_hash);
            let inner_bytes = canonical_bytes(&g.inner, true);
            write_bytes(&mut buf, &inner_bytes);
            write_path(&mut buf, &g.ghost_path);
            write_u64(&mut buf, g.ghost_inode);
        }
    }
    buf
}

/// Serializes `node` into the compact binary schema (spec.md §4.C).
pub fn encode_node(node: &Node) -> Vec<u8> {
    canonical_bytes(node, true)
}

/// Deserializes a node previously produced by [`encode_node`].
pub fn decode_node(data: &[u8]) -> NodeResult<Node> {
    let mut r = Reader::new(data);
    decode_node_inner(&mut r)
}

fn decode_node_inner(r: &mut Reader<'_>) -> NodeResult<Node> {
    let tag = r.read_u8()?;
    match tag {
        0 => {
            let base = read_base(r)?;
            let size = r.read_u64()?;
            let parent = r.read_path()?;
            let key_vec = r.read_bytes()?;
            let key: [u8; 32] = key_vec
                .try_into()
                .map_err(|_| NodeError::Encoding("bad file key length".to_owned()))?;
            Ok(Node::File(FileNode { base, size, parent, key }))
        }
        1 => {
            let base = read_base(r)?;
            let size = r.read_u64()?;
            let parent = r.read_opt_path()?;
            let count = r.read_u32()? as usize;
            let mut children = IndexMap::with_capacity(count);
            for _ in 0..count {
                let name = r.read_str()?;
                let hash = r.read_hash()?;
                children.insert(name, hash);
            }
            Ok(Node::Directory(DirectoryNode { base, size, parent, children }))
        }
        2 => {
            let base = read_base(r)?;
            let message = r.read_str()?;
            let author = r.read_str()?;
            let root = r.read_hash()?;
            let parent = r.read_opt_hash()?;
            let index = r.read_u64()?;
            let merge = match r.read_u8()? {
                0 => None,
                1 => Some(MergeInfo { with: r.read_hash()?, head: r.read_hash()? }),
                _ => return Err(NodeError::Encoding("bad merge presence tag".to_owned())),
            };
            Ok(Node::Commit(CommitNode { base, message, author, root, parent, index, merge }))
        }
        3 => {
            let base = read_base(r)?;
            let inner_bytes = r.read_bytes()?;
            let inner = Box::new(decode_node(&inner_bytes)?);
            let ghost_path = r.read_path()?;
            let ghost_inode = r.read_u64()?;
            Ok(Node::Ghost(GhostNode { base, inner, ghost_path, ghost_inode }))
        }
        _ => Err(NodeError::Encoding(format!("unknown node tag {tag}"))),
    }
}

/// Wraps `inner` in a [`GhostNode`], deriving the ghost's own tree hash from
/// the inner node's tree hash (spec.md §3: `"ghost:" + inner.tree_hash`).
pub fn make_ghost(inner: Node, ghost_path: RepoPathBuf, ghost_inode: u64, user: String, mod_time: i64) -> Node {
    let inner_tree_hash = inner.tree_hash();
    let tree_hash = ghost_hash(&inner_tree_hash);
    let base = NodeBase {
        name: inner.name().to_owned(),
        user,
        tree_hash,
        content_hash: inner.content_hash(),
        backend_hash: inner.backend_hash(),
        mod_time,
        inode: inner.inode(),
    };
    Node::Ghost(GhostNode {
        base,
        inner: Box::new(inner),
        ghost_path,
        ghost_inode,
    })
}

/// Child name/hash pairs for a [`DirectoryNode`], used by GC and the mapper
/// to recurse without depending on `IndexMap`'s iteration type directly.
pub fn directory_children(dir: &DirectoryNode) -> impl Iterator<Item = (&str, &Hash)> {
    dir.children.iter().map(|(k, v)| (k.as_str(), v))
}

/// Builds a fresh, empty root directory (inode must come from the caller's
/// monotonic counter).
pub fn new_root_directory(user: impl Into<String>, mod_time: i64, inode: u64) -> Node {
    let mut node = Node::Directory(DirectoryNode {
        base: NodeBase {
            name: String::new(),
            user: user.into(),
            tree_hash: Hash::from_bytes([0; crate::hash::HASH_LEN]),
            content_hash: None,
            backend_hash: None,
            mod_time,
            inode,
        },
        size: 0,
        parent: None,
        children: IndexMap::new(),
    });
    node.recompute_tree_hash();
    node
}

/// Returns a copy of `dir` with `name` mapped to `child_hash`, recomputing
/// the directory's own tree hash (spec.md §3 invariant).
pub fn directory_with_child(dir: &DirectoryNode, name: &str, child_hash: Option<Hash>) -> DirectoryNode {
    let mut children = dir.children.clone();
    match child_hash {
        Some(hash) => {
            children.insert(name.to_owned(), hash);
        }
        None => {
            children.shift_remove(name);
        }
    }
    DirectoryNode { children, ..dir.clone() }
}

// Kept for callers that want a plain HashMap view (e.g. conformance tests)
// without caring about insertion order.
pub fn children_as_map(dir: &DirectoryNode) -> HashMap<String, Hash> {
    dir.children.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(name: &str, parent: RepoPathBuf, inode: u64) -> Node {
        let mut node = Node::File(FileNode {
            base: NodeBase {
                name: name.to_owned(),
                user: "alice".to_owned(),
                tree_hash: Hash::from_bytes([0; 32]),
                content_hash: Some(Hash::sum(b"content")),
                backend_hash: Some(Hash::sum(b"backend")),
                mod_time: 1000,
                inode,
            },
            size: 7,
            parent,
            key: [7u8; 32],
        });
        node.recompute_tree_hash();
        node
    }

    #[test]
    fn file_roundtrips() {
        let node = sample_file("cat.png", RepoPathBuf::root(), 1);
        let bytes = encode_node(&node);
        let back = decode_node(&bytes).unwrap();
        assert_eq!(node, back);
    }

    #[test]
    fn directory_roundtrips_and_hash_changes_with_children() {
        let mut dir = DirectoryNode {
            base: NodeBase {
                name: "sub".to_owned(),
                user: "alice".to_owned(),
                tree_hash: Hash::from_bytes([0; 32]),
                content_hash: None,
                backend_hash: None,
                mod_time: 1000,
                inode: 2,
            },
            size: 0,
            parent: Some(RepoPathBuf::root()),
            children: IndexMap::new(),
        };
        let mut node = Node::Directory(dir.clone());
        node.recompute_tree_hash();
        let empty_hash = node.tree_hash();

        dir.children.insert("a.png".to_owned(), Hash::sum(b"a"));
        let mut node2 = Node::Directory(dir);
        node2.recompute_tree_hash();
        assert_ne!(empty_hash, node2.tree_hash());

        let bytes = encode_node(&node2);
        let back = decode_node(&bytes).unwrap();
        assert_eq!(node2, back);
    }

    #[test]
    fn ghost_tree_hash_is_ghost_prefixed() {
        let inner = sample_file("cat.png", RepoPathBuf::root(), 1);
        let inner_hash = inner.tree_hash();
        let ghost = make_ghost(inner, RepoPathBuf::parse("/cat.png"), 1, "alice".to_owned(), 2000);
        assert_eq!(ghost.tree_hash(), ghost_hash(&inner_hash));
        let bytes = encode_node(&ghost);
        let back = decode_node(&bytes).unwrap();
        assert_eq!(ghost, back);
    }

    #[test]
    fn same_content_hash_different_paths_yield_different_tree_hashes() {
        let a = sample_file("a.png", RepoPathBuf::root(), 1);
        let b = sample_file("a.png", RepoPathBuf::parse("/sub"), 2);
        let c = sample_file("b.png", RepoPathBuf::root(), 3);
        assert_ne!(a.tree_hash(), b.tree_hash());
        assert_ne!(a.tree_hash(), c.tree_hash());
        assert_ne!(b.tree_hash(), c.tree_hash());
    }
}
