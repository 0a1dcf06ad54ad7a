//! End-to-end sync-mapper scenarios (spec.md §4.I, §8) that go beyond the
//! module's own unit tests: a moved directory re-rooted wholesale, a
//! src/dst type conflict at the same path, and an empty leftover directory
//! reported once rather than per descendant.

use std::sync::Arc;

use vaultfs::hash::HASH_LEN;
use vaultfs::hash::Hash;
use vaultfs::kv::memory::MemoryDb;
use vaultfs::linker::Linker;
use vaultfs::mapper::MapPair;
use vaultfs::mapper::Mapper;
use vaultfs::node::CommitNode;
use vaultfs::node::FileNode;
use vaultfs::node::Node;
use vaultfs::node::NodeBase;
use vaultfs::repo_path::RepoPathBuf;

fn new_linker() -> Linker {
    Linker::new(Arc::new(MemoryDb::new()), "alice")
}

fn head_of(lkr: &Linker) -> CommitNode {
    lkr.head_commit().unwrap().expect("a commit exists")
}

/// Relocates the file at `old_path` to `new_path`, preserving its inode
/// (spec.md §3: "stable across renames") the way a real move must: build the
/// destination node with `stage_node` directly instead of the
/// inode-allocating `stage` convenience method, then record the move.
fn move_file(lkr: &Linker, old_path: &RepoPathBuf, new_path: &RepoPathBuf, mod_time: i64) {
    let old_file = lkr.lookup_node(old_path).unwrap().unwrap().as_file().unwrap().clone();
    lkr.remove(old_path, mod_time).unwrap();
    let new_parent = new_path.parent().unwrap();
    lkr.mkdir(&new_parent, true, mod_time).unwrap();
    let mut new_node = Node::File(FileNode {
        base: NodeBase {
            name: new_path.basename().to_owned(),
            user: lkr.owner().to_owned(),
            tree_hash: Hash::from_bytes([0; HASH_LEN]),
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

fn collect(src: &Linker, dst: &Linker) -> Vec<MapPair> {
    let mut mapper = Mapper::new(src, dst, head_of(src), head_of(dst));
    let mut pairs = Vec::new();
    mapper
        .run(&mut |pair: MapPair| -> Result<(), vaultfs::error::MapperError> {
            pairs.push(pair);
            Ok(())
        })
        .unwrap();
    pairs
}

#[test]
fn file_moved_to_a_sibling_directory_is_reported_as_a_move() {
    let a = new_linker();
    a.stage(&RepoPathBuf::parse("/src/a.txt"), Hash::sum(b"v"), Hash::sum(b"v-backend"), 1, [0; 32], 0).unwrap();
    a.make_commit("alice", "first", 0).unwrap();
    move_file(&a, &RepoPathBuf::parse("/src/a.txt"), &RepoPathBuf::parse("/dst/a.txt"), 1);
    a.make_commit("alice", "moved", 1).unwrap();

    let b = new_linker();
    b.stage(&RepoPathBuf::parse("/src/a.txt"), Hash::sum(b"v"), Hash::sum(b"v-backend"), 1, [0; 32], 0).unwrap();
    b.make_commit("alice", "first", 0).unwrap();

    let pairs = collect(&a, &b);
    let moved = pairs.iter().find(|p| p.src_was_moved);
    assert!(moved.is_some(), "expected a move pair, got {pairs:?}");
    let moved = moved.unwrap();
    assert_eq!(moved.src.as_ref().unwrap().path.as_str(), "/dst/a.txt");
    assert_eq!(moved.dst.as_ref().unwrap().path.as_str(), "/src/a.txt");
}

#[test]
fn moved_directory_is_reported_as_a_directory_reroot() {
    let a = new_linker();
    a.stage(&RepoPathBuf::parse("/olddir/file.txt"), Hash::sum(b"v"), Hash::sum(b"v-backend"), 1, [0; 32], 0).unwrap();
    a.make_commit("alice", "first", 0).unwrap();

    let old_dir = a.lookup_node(&RepoPathBuf::parse("/olddir")).unwrap().unwrap();
    a.remove(&RepoPathBuf::parse("/olddir"), 1).unwrap();
    a.stage(&RepoPathBuf::parse("/newdir/file.txt"), Hash::sum(b"v"), Hash::sum(b"v-backend"), 1, [0; 32], 1).unwrap();
    a.record_move(old_dir.inode(), &RepoPathBuf::parse("/olddir"), &RepoPathBuf::parse("/newdir")).unwrap();
    a.make_commit("alice", "moved dir", 1).unwrap();

    let b = new_linker();
    b.stage(&RepoPathBuf::parse("/olddir/file.txt"), Hash::sum(b"v"), Hash::sum(b"v-backend"), 1, [0; 32], 0).unwrap();
    b.make_commit("alice", "first", 0).unwrap();

    let pairs = collect(&a, &b);
    // The directory reroot recurses into the moved directory's contents, so
    // the file inside gets its own pair reported through the normal
    // directory-mapping path rather than a standalone directory pair.
    let file_pair = pairs.iter().find(|p| {
        p.src.as_ref().map(|m| m.path.as_str()) == Some("/newdir/file.txt")
            || p.dst.as_ref().map(|m| m.path.as_str()) == Some("/olddir/file.txt")
    });
    assert!(file_pair.is_some(), "expected the moved directory's contents to be diffed, got {pairs:?}");
}

#[test]
fn competing_adds_at_the_same_path_are_not_treated_as_a_move() {
    let a = new_linker();
    a.stage(&RepoPathBuf::parse("/x.txt"), Hash::sum(b"orig"), Hash::sum(b"orig-backend"), 1, [0; 32], 0).unwrap();
    a.make_commit("alice", "first", 0).unwrap();
    let old_file = a.lookup_node(&RepoPathBuf::parse("/x.txt")).unwrap().unwrap();
    a.remove(&RepoPathBuf::parse("/x.txt"), 1).unwrap();
    a.stage(&RepoPathBuf::parse("/y.txt"), Hash::sum(b"orig"), Hash::sum(b"orig-backend"), 1, [0; 32], 1).unwrap();
    a.record_move(old_file.inode(), &RepoPathBuf::parse("/x.txt"), &RepoPathBuf::parse("/y.txt")).unwrap();
    a.make_commit("alice", "moved", 1).unwrap();

    // dst independently has an unrelated file at the destination path.
    let b = new_linker();
    b.stage(&RepoPathBuf::parse("/x.txt"), Hash::sum(b"orig"), Hash::sum(b"orig-backend"), 1, [0; 32], 0).unwrap();
    b.make_commit("alice", "first", 0).unwrap();
    b.stage(&RepoPathBuf::parse("/y.txt"), Hash::sum(b"unrelated"), Hash::sum(b"unrelated-backend"), 1, [0; 32], 1).unwrap();
    b.make_commit("alice", "unrelated add", 1).unwrap();

    let pairs = collect(&a, &b);
    assert!(
        !pairs.iter().any(|p| p.src_was_moved),
        "a competing add at the move destination must not be reported as a move, got {pairs:?}"
    );
}

#[test]
fn empty_leftover_directory_is_reported_once_not_per_descendant() {
    let a = new_linker();
    a.mkdir(&RepoPathBuf::parse("/onlysrc/nested"), true, 0).unwrap();
    a.stage(&RepoPathBuf::parse("/keep.txt"), Hash::sum(b"k"), Hash::sum(b"k-backend"), 1, [0; 32], 0).unwrap();
    a.make_commit("alice", "first", 0).unwrap();

    let b = new_linker();
    b.stage(&RepoPathBuf::parse("/keep.txt"), Hash::sum(b"k"), Hash::sum(b"k-backend"), 1, [0; 32], 0).unwrap();
    b.make_commit("alice", "first", 0).unwrap();

    let pairs = collect(&a, &b);
    let dir_pairs: Vec<&MapPair> = pairs
        .iter()
        .filter(|p| {
            p.src.as_ref().is_some_and(|m| matches!(m.node, Node::Directory(_)))
        })
        .collect();
    assert_eq!(dir_pairs.len(), 1, "the empty leftover directory chain should be a single pair, got {pairs:?}");
    assert_eq!(dir_pairs[0].src.as_ref().unwrap().path.as_str(), "/onlysrc/nested");
}

#[test]
fn type_mismatch_between_a_file_and_a_directory_is_flagged() {
    let a = new_linker();
    a.stage(&RepoPathBuf::parse("/thing"), Hash::sum(b"f"), Hash::sum(b"f-backend"), 1, [0; 32], 0).unwrap();
    a.make_commit("alice", "first", 0).unwrap();

    let b = new_linker();
    b.mkdir(&RepoPathBuf::parse("/thing"), true, 0).unwrap();
    b.stage(&RepoPathBuf::parse("/thing/inner.txt"), Hash::sum(b"i"), Hash::sum(b"i-backend"), 1, [0; 32], 0).unwrap();
    b.make_commit("alice", "first", 0).unwrap();

    let pairs = collect(&a, &b);
    let mismatch = pairs.iter().find(|p| p.type_mismatch);
    assert!(mismatch.is_some(), "expected a type mismatch pair, got {pairs:?}");
}
