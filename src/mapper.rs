//! The VCS sync mapper (spec.md §4.I): diffs two Merkle trees — rooted at
//! `src_head` in one linker and `dst_head` in another, which may be the same
//! linker comparing two commits — and reports every place they differ
//! through a caller-supplied visitor.
//!
//! Grounded in `catfs/vcs/mapper.go`'s four-stage walk (ghost resolution,
//! recursive directory/file comparison, leftover extraction, reporting). The
//! mapper never mutates either store; it only reads through
//! [`Linker::lookup_node_at`] and [`Linker::node_by_hash`] and emits
//! [`MapPair`] values.

use std::collections::HashSet;

use crate::error::MapperError;
use crate::error::MapperResult;
use crate::linker::Linker;
use crate::node::CommitNode;
use crate::node::DirectoryNode;
use crate::node::GhostNode;
use crate::node::Node;
use crate::node::directory_children;
use crate::repo_path::RepoPathBuf;

/// A node as seen at a particular path on one side of the comparison.
#[derive(Debug, Clone)]
pub struct ModNode {
    pub path: RepoPathBuf,
    pub node: Node,
}

/// One reported difference between the two trees (spec.md §4.I).
#[derive(Debug, Clone)]
pub struct MapPair {
    pub src: Option<ModNode>,
    pub dst: Option<ModNode>,
    pub type_mismatch: bool,
    pub src_was_removed: bool,
    pub src_was_moved: bool,
}

/// A visitor may abort the walk by returning `Err`; the mapper propagates it
/// verbatim without leaving partial state behind (spec.md §5: cancellation).
pub trait Visitor {
    fn visit(&mut self, pair: MapPair) -> MapperResult<()>;
}

impl<F: FnMut(MapPair) -> MapperResult<()>> Visitor for F {
    fn visit(&mut self, pair: MapPair) -> MapperResult<()> {
        self(pair)
    }
}

/// Resolves a ghost to the node its move-mapping says it became, restricted
/// to moves that are still corroborated by both the mapping and the current
/// tree (spec.md §4.I: "Move detection rule"). Returns `None` for a pure
/// remove or any broken link in the chain — callers then treat it as
/// add+remove rather than a move.
fn ghost_to_alive(lkr: &Linker, head: &CommitNode, ghost: &GhostNode) -> MapperResult<Option<ModNode>> {
    let Some(mapping) = lkr.move_target(ghost.base.inode)? else {
        return Ok(None);
    };
    if !mapping.forward {
        return Ok(None);
    }
    match lkr.lookup_node_at(head, &mapping.dst_path)? {
        Some(node) if node.inode() == mapping.src_inode && !matches!(node, Node::Ghost(_)) => {
            Ok(Some(ModNode { path: mapping.dst_path, node }))
        }
        _ => Ok(None),
    }
}

fn collect_ghosts(
    lkr: &Linker,
    dir: &DirectoryNode,
    base: RepoPathBuf,
    out: &mut Vec<(RepoPathBuf, GhostNode)>,
) -> MapperResult<()> {
    for (name, hash) in directory_children(dir) {
        let child_path = base.join(name);
        let Some(child) = lkr.node_by_hash(*hash)? else { continue };
        match child {
            Node::Ghost(g) => out.push((child_path, g)),
            Node::Directory(d) => collect_ghosts(lkr, &d, child_path, out)?,
            _ => {}
        }
    }
    Ok(())
}

/// Diffs `src_head`'s tree (in `src`) against `dst_head`'s tree (in `dst`),
/// reporting every [`MapPair`] through `visitor` (spec.md §4.I).
pub struct Mapper<'a> {
    src: &'a Linker,
    dst: &'a Linker,
    src_head: CommitNode,
    dst_head: CommitNode,
    handled_src: HashSet<String>,
    handled_dst: HashSet<String>,
}

impl<'a> Mapper<'a> {
    pub fn new(src: &'a Linker, dst: &'a Linker, src_head: CommitNode, dst_head: CommitNode) -> Self {
        Self {
            src,
            dst,
            src_head,
            dst_head,
            handled_src: HashSet::new(),
            handled_dst: HashSet::new(),
        }
    }

    pub fn run(&mut self, visitor: &mut dyn Visitor) -> MapperResult<()> {
        self.handle_ghosts(visitor)?;
        self.map_directory(RepoPathBuf::root(), visitor)?;
        self.extract_leftovers(visitor)?;
        Ok(())
    }

    // -- stage 1: ghost resolution --------------------------------------

    fn handle_ghosts(&mut self, visitor: &mut dyn Visitor) -> MapperResult<()> {
        let Some(Node::Directory(root_dir)) = self.src.lookup_node_at(&self.src_head, &RepoPathBuf::root())? else {
            return Ok(());
        };
        let mut ghosts = Vec::new();
        collect_ghosts(self.src, &root_dir, RepoPathBuf::root(), &mut ghosts)?;
        for (path, ghost) in ghosts {
            self.handle_one_ghost(path, ghost, visitor)?;
        }
        Ok(())
    }

    fn handle_one_ghost(&mut self, ghost_path: RepoPathBuf, ghost: GhostNode, visitor: &mut dyn Visitor) -> MapperResult<()> {
        self.handled_src.insert(ghost_path.as_str().to_owned());

        let Some(alive) = ghost_to_alive(self.src, &self.src_head, &ghost)? else {
            // Pure remove: report whatever still lives at the ghost's old
            // path on the destination, unless it too was removed there.
            if let Some(dst_node) = self.dst.lookup_node_at(&self.dst_head, &ghost_path)? {
                if !matches!(dst_node, Node::Ghost(_)) {
                    self.handled_dst.insert(ghost_path.as_str().to_owned());
                    visitor.visit(MapPair {
                        src: None,
                        dst: Some(ModNode { path: ghost_path, node: dst_node }),
                        type_mismatch: false,
                        src_was_removed: true,
                        src_was_moved: false,
                    })?;
                }
            }
            return Ok(());
        };

        // The source moved this node to `alive.path`. If the destination
        // has an unrelated node already sitting there, this is a competing
        // add — don't propagate the move, let the normal recursive/leftover
        // passes diff the two independent nodes at that path instead.
        let dst_at_new = self.dst.lookup_node_at(&self.dst_head, &alive.path)?;
        if let Some(dst_node) = &dst_at_new {
            if dst_node.inode() != alive.node.inode() && !matches!(dst_node, Node::Ghost(_)) {
                return Ok(());
            }
        }

        let dst_at_old = self.dst.lookup_node_at(&self.dst_head, &ghost_path)?;
        let dst_resolved = match dst_at_old {
            Some(Node::Ghost(dg)) => ghost_to_alive(self.dst, &self.dst_head, &dg)?.map(|m| m.node),
            Some(other) => Some(other),
            None => None,
        };

        match (&alive.node, &dst_resolved) {
            (Node::Directory(_), Some(Node::Directory(_))) => {
                self.map_directory(alive.path.clone(), visitor)?;
            }
            (Node::File(_), Some(Node::File(_))) => {
                self.handled_src.insert(alive.path.as_str().to_owned());
                self.handled_dst.insert(alive.path.as_str().to_owned());
                let dst_node = dst_resolved.expect("matched Some above");
                visitor.visit(MapPair {
                    src: Some(alive.clone()),
                    dst: Some(ModNode { path: alive.path.clone(), node: dst_node }),
                    type_mismatch: false,
                    src_was_removed: false,
                    src_was_moved: true,
                })?;
            }
            (_, Some(_)) => {
                self.handled_src.insert(alive.path.as_str().to_owned());
                self.handled_dst.insert(alive.path.as_str().to_owned());
                let dst_node = dst_resolved.expect("matched Some above");
                visitor.visit(MapPair {
                    src: Some(alive.clone()),
                    dst: Some(ModNode { path: alive.path.clone(), node: dst_node }),
                    type_mismatch: true,
                    src_was_removed: false,
                    src_was_moved: true,
                })?;
            }
            (_, None) => {
                self.handled_src.insert(alive.path.as_str().to_owned());
                visitor.visit(MapPair {
                    src: Some(alive),
                    dst: None,
                    type_mismatch: false,
                    src_was_removed: false,
                    src_was_moved: true,
                })?;
            }
        }
        Ok(())
    }

    // -- stage 2: recursive mapping ---------------------------------------

    fn map_directory(&mut self, path: RepoPathBuf, visitor: &mut dyn Visitor) -> MapperResult<()> {
        if self.handled_src.contains(path.as_str()) {
            return Ok(());
        }
        let Some(Node::Directory(src_dir)) = self.src.lookup_node_at(&self.src_head, &path)? else {
            return Ok(());
        };

        let dst_node = self.dst.lookup_node_at(&self.dst_head, &path)?;
        if let Some(Node::Directory(dst_dir)) = &dst_node {
            if dst_dir.base.tree_hash == src_dir.base.tree_hash {
                self.mark_subtree_handled(&src_dir, &path);
                return Ok(());
            }
        }

        self.handled_src.insert(path.as_str().to_owned());
        if dst_node.is_some() {
            self.handled_dst.insert(path.as_str().to_owned());
        }

        for (name, hash) in directory_children(&src_dir) {
            let child_path = path.join(name);
            if self.handled_src.contains(child_path.as_str()) {
                continue;
            }
            let Some(child) = self.src.node_by_hash(*hash)? else { continue };
            match child {
                // Ghosts were already fully handled in stage 1.
                Node::Ghost(_) => {}
                Node::Directory(_) => self.map_directory(child_path, visitor)?,
                Node::File(_) => self.map_file(child_path, child, visitor)?,
                Node::Commit(_) => return Err(MapperError::BadNode),
            }
        }
        Ok(())
    }

    fn mark_subtree_handled(&mut self, dir: &DirectoryNode, path: &RepoPathBuf) {
        self.handled_src.insert(path.as_str().to_owned());
        self.handled_dst.insert(path.as_str().to_owned());
        for (name, hash) in directory_children(dir) {
            let child_path = path.join(name);
            if let Ok(Some(child)) = self.src.node_by_hash(*hash) {
                if let Node::Directory(d) = &child {
                    self.mark_subtree_handled(d, &child_path);
                } else {
                    self.handled_src.insert(child_path.as_str().to_owned());
                    self.handled_dst.insert(child_path.as_str().to_owned());
                }
            }
        }
    }

    fn map_file(&mut self, path: RepoPathBuf, src_node: Node, visitor: &mut dyn Visitor) -> MapperResult<()> {
        self.handled_src.insert(path.as_str().to_owned());
        match self.dst.lookup_node_at(&self.dst_head, &path)? {
            None => visitor.visit(MapPair {
                src: Some(ModNode { path, node: src_node }),
                dst: None,
                type_mismatch: false,
                src_was_removed: false,
                src_was_moved: false,
            }),
            Some(dst_node @ Node::Directory(_)) => {
                self.handled_dst.insert(path.as_str().to_owned());
                visitor.visit(MapPair {
                    src: Some(ModNode { path: path.clone(), node: src_node }),
                    dst: Some(ModNode { path, node: dst_node }),
                    type_mismatch: true,
                    src_was_removed: false,
                    src_was_moved: false,
                })
            }
            Some(Node::Ghost(g)) => {
                self.handled_dst.insert(path.as_str().to_owned());
                match ghost_to_alive(self.dst, &self.dst_head, &g)? {
                    Some(alive) => self.report_file_pair(ModNode { path, node: src_node }, alive, visitor),
                    None => visitor.visit(MapPair {
                        src: Some(ModNode { path, node: src_node }),
                        dst: None,
                        type_mismatch: false,
                        src_was_removed: false,
                        src_was_moved: false,
                    }),
                }
            }
            Some(dst_node @ Node::File(_)) => {
                self.handled_dst.insert(path.as_str().to_owned());
                self.report_file_pair(ModNode { path: path.clone(), node: src_node }, ModNode { path, node: dst_node }, visitor)
            }
            Some(Node::Commit(_)) => Err(MapperError::BadNode),
        }
    }

    /// Compares two files that occupy (from the mapper's point of view) the
    /// same logical position, possibly at different paths if `dst` is a
    /// resolved ghost counterpart: equal content at the same path is handled
    /// silently, equal content at different paths is a move, anything else
    /// is a modify (spec.md §4.I stage 2).
    fn report_file_pair(&self, src: ModNode, dst: ModNode, visitor: &mut dyn Visitor) -> MapperResult<()> {
        let same_content = src.node.content_hash().is_some() && src.node.content_hash() == dst.node.content_hash();
        if same_content && src.path == dst.path {
            return Ok(());
        }
        visitor.visit(MapPair {
            src_was_moved: same_content && src.path != dst.path,
            src: Some(src),
            dst: Some(dst),
            type_mismatch: false,
            src_was_removed: false,
        })
    }

    // -- stage 3: leftover extraction --------------------------------------

    fn extract_leftovers(&mut self, visitor: &mut dyn Visitor) -> MapperResult<()> {
        self.walk_leftovers_src(RepoPathBuf::root(), visitor)?;
        self.walk_leftovers_dst(RepoPathBuf::root(), visitor)?;
        Ok(())
    }

    fn walk_leftovers_src(&mut self, path: RepoPathBuf, visitor: &mut dyn Visitor) -> MapperResult<()> {
        if self.handled_src.contains(path.as_str()) {
            return Ok(());
        }
        let Some(node) = self.src.lookup_node_at(&self.src_head, &path)? else {
            return Ok(());
        };
        match node {
            // Every ghost was already fully accounted for in stage 1.
            Node::Ghost(_) => {}
            Node::Directory(dir) => {
                if dir.children.is_empty() {
                    self.handled_src.insert(path.as_str().to_owned());
                    visitor.visit(MapPair {
                        src: Some(ModNode { path, node: Node::Directory(dir) }),
                        dst: None,
                        type_mismatch: false,
                        src_was_removed: false,
                        src_was_moved: false,
                    })?;
                } else {
                    let names: Vec<String> = dir.children.keys().cloned().collect();
                    for name in names {
                        self.walk_leftovers_src(path.join(&name), visitor)?;
                    }
                }
            }
            other => {
                self.handled_src.insert(path.as_str().to_owned());
                visitor.visit(MapPair {
                    src: Some(ModNode { path, node: other }),
                    dst: None,
                    type_mismatch: false,
                    src_was_removed: false,
                    src_was_moved: false,
                })?;
            }
        }
        Ok(())
    }

    fn walk_leftovers_dst(&mut self, path: RepoPathBuf, visitor: &mut dyn Visitor) -> MapperResult<()> {
        if self.handled_dst.contains(path.as_str()) {
            return Ok(());
        }
        let Some(node) = self.dst.lookup_node_at(&self.dst_head, &path)? else {
            return Ok(());
        };
        match node {
            Node::Ghost(_) => {}
            Node::Directory(dir) => {
                if dir.children.is_empty() {
                    self.handled_dst.insert(path.as_str().to_owned());
                    visitor.visit(MapPair {
                        src: None,
                        dst: Some(ModNode { path, node: Node::Directory(dir) }),
                        type_mismatch: false,
                        src_was_removed: false,
                        src_was_moved: false,
                    })?;
                } else {
                    let names: Vec<String> = dir.children.keys().cloned().collect();
                    for name in names {
                        self.walk_leftovers_dst(path.join(&name), visitor)?;
                    }
                }
            }
            other => {
                self.handled_dst.insert(path.as_str().to_owned());
                visitor.visit(MapPair {
                    src: None,
                    dst: Some(ModNode { path, node: other }),
                    type_mismatch: false,
                    src_was_removed: false,
                    src_was_moved: false,
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hash::Hash;
    use crate::kv::memory::MemoryDb;

    fn new_linker() -> Linker {
        Linker::new(Arc::new(MemoryDb::new()), "alice")
    }

    fn head_of(lkr: &Linker) -> CommitNode {
        lkr.head_commit().unwrap().expect("a commit exists")
    }

    fn collect(lkr_src: &Linker, lkr_dst: &Linker) -> Vec<MapPair> {
        let mut mapper = Mapper::new(lkr_src, lkr_dst, head_of(lkr_src), head_of(lkr_dst));
        let mut pairs = Vec::new();
        mapper.run(&mut |pair: MapPair| -> MapperResult<()> {
            pairs.push(pair);
            Ok(())
        }).unwrap();
        pairs
    }

    /// Relocates the file at `old_path` to `new_path`, preserving its inode
    /// (spec.md §3: "stable across renames") by building the destination node
    /// with [`Linker::stage_node`] directly instead of the inode-allocating
    /// [`Linker::stage`] convenience method, then records the move mapping.
    fn move_file(lkr: &Linker, old_path: &RepoPathBuf, new_path: &RepoPathBuf, mod_time: i64) {
        let old = lkr.lookup_node(old_path).unwrap().unwrap();
        let old_file = old.as_file().unwrap().clone();
        lkr.remove(old_path, mod_time).unwrap();
        let new_parent = new_path.parent().unwrap();
        lkr.mkdir(&new_parent, true, mod_time).unwrap();
        let mut new_node = Node::File(crate::node::FileNode {
            base: crate::node::NodeBase {
                name: new_path.basename().to_owned(),
                user: lkr.owner().to_owned(),
                tree_hash: crate::hash::Hash::from_bytes([0; crate::hash::HASH_LEN]),
                content_hash: old_file.base.content_hash,
                backend_hash: old_file.base.backend_hash,
                mod_time,
                inode: old_file.base.inode,
            },
            size: old_file.size,
            parent: new_parent,
            key: old_file.key,
        });
        new_node.recompute_tree_hash();
        lkr.stage_node(new_node).unwrap();
        lkr.record_move(old_file.base.inode, old_path, new_path).unwrap();
    }

    #[test]
    fn identical_trees_produce_no_pairs() {
        let a = new_linker();
        a.stage(&RepoPathBuf::parse("/x"), Hash::sum(b"x"), Hash::sum(b"x-backend"), 1, [0; 32], 0).unwrap();
        a.make_commit("alice", "first", 0).unwrap();

        let b = new_linker();
        b.stage(&RepoPathBuf::parse("/x"), Hash::sum(b"x"), Hash::sum(b"x-backend"), 1, [0; 32], 0).unwrap();
        b.make_commit("alice", "first", 0).unwrap();

        assert!(collect(&a, &b).is_empty());
    }

    #[test]
    fn file_present_only_on_src_is_an_add() {
        let a = new_linker();
        a.stage(&RepoPathBuf::parse("/only-src"), Hash::sum(b"s"), Hash::sum(b"s-backend"), 1, [0; 32], 0).unwrap();
        a.make_commit("alice", "first", 0).unwrap();

        let b = new_linker();
        b.mkdir(&RepoPathBuf::root(), false, 0).unwrap();
        b.stage(&RepoPathBuf::parse("/placeholder"), Hash::sum(b"p"), Hash::sum(b"p-backend"), 1, [0; 32], 0).unwrap();
        b.make_commit("alice", "first", 0).unwrap();

        let pairs = collect(&a, &b);
        let found = pairs.iter().find(|p| p.dst.is_none() && p.src.as_ref().unwrap().path.as_str() == "/only-src");
        assert!(found.is_some());
    }

    #[test]
    fn removed_file_is_reported_as_removed() {
        let a = new_linker();
        a.stage(&RepoPathBuf::parse("/gone"), Hash::sum(b"g"), Hash::sum(b"g-backend"), 1, [0; 32], 0).unwrap();
        a.make_commit("alice", "first", 0).unwrap();
        a.remove(&RepoPathBuf::parse("/gone"), 1).unwrap();
        a.make_commit("alice", "second", 1).unwrap();

        let b = new_linker();
        b.stage(&RepoPathBuf::parse("/gone"), Hash::sum(b"g"), Hash::sum(b"g-backend"), 1, [0; 32], 0).unwrap();
        b.make_commit("alice", "first", 0).unwrap();

        let pairs = collect(&a, &b);
        let removal = pairs.iter().find(|p| p.src.is_none());
        assert!(removal.is_some());
        assert!(removal.unwrap().src_was_removed);
    }

    #[test]
    fn moved_file_is_reported_as_a_move() {
        let a = new_linker();
        a.stage(&RepoPathBuf::parse("/old.png"), Hash::sum(b"v"), Hash::sum(b"v-backend"), 1, [0; 32], 0).unwrap();
        a.make_commit("alice", "first", 0).unwrap();
        move_file(&a, &RepoPathBuf::parse("/old.png"), &RepoPathBuf::parse("/new.png"), 1);
        a.make_commit("alice", "moved", 1).unwrap();

        let b = new_linker();
        b.stage(&RepoPathBuf::parse("/old.png"), Hash::sum(b"v"), Hash::sum(b"v-backend"), 1, [0; 32], 0).unwrap();
        b.make_commit("alice", "first", 0).unwrap();

        let pairs = collect(&a, &b);
        let moved = pairs.iter().find(|p| p.src_was_moved);
        assert!(moved.is_some(), "expected a move pair, got {pairs:?}");
    }
}
