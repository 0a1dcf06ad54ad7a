//! Prefix lookup for cached path→node resolution (spec.md §4.J).
//!
//! Mirrors the role of `util/trie.Node` in the original `floo` source: a
//! node per path component, holding arbitrary cached data plus child nodes
//! keyed by path segment. We keep the same shape (insert-with-data, lookup,
//! remove) but drop the Go version's `Walk`/`Len` helpers that nothing in
//! this crate needs.

use std::collections::BTreeMap;

/// A single node in the path trie. `data` holds whatever the cache layer
/// wants to associate with the path that reaches this node.
#[derive(Default)]
pub struct TrieNode<T> {
    children: BTreeMap<String, TrieNode<T>>,
    data: Option<T>,
}

impl<T> TrieNode<T> {
    pub fn new() -> Self {
        Self { children: BTreeMap::new(), data: None }
    }

    /// Inserts `data` at `path`, creating intermediate nodes as needed.
    /// Overwrites any data already present at that exact path.
    pub fn insert(&mut self, path: &str, data: T) {
        let mut node = self;
        for segment in split_components(path) {
            node = node.children.entry(segment.to_owned()).or_insert_with(TrieNode::new);
        }
        node.data = Some(data);
    }

    /// Looks up the node stored at exactly `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&T> {
        let mut node = self;
        for segment in split_components(path) {
            node = node.children.get(segment)?;
        }
        node.data.as_ref()
    }

    /// Removes whatever is stored at `path`. Leaves empty intermediate
    /// nodes in place (cheap to keep, and `lookup` simply won't find data
    /// there); a cleared cache entry is always safe to drop per spec.md's
    /// "caches vs truth" design note.
    pub fn remove(&mut self, path: &str) {
        let mut node = self;
        for segment in split_components(path) {
            match node.children.get_mut(segment) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.data = None;
    }

    /// Drops every cached entry. Always safe (spec.md §9: "the in-memory
    /// indices ... are pure caches of the KV state; any suspected
    /// inconsistency is resolved by clearing them").
    pub fn clear(&mut self) {
        self.children.clear();
        self.data = None;
    }
}

fn split_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
