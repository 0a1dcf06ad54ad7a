//! `vaultfs`: a content-addressed, versioned virtual filesystem core.
//!
//! Three subsystems, each a module below: the [`linker`] (a versioned
//! Merkle-DAG metadata engine over files, directories, commits and ghosts,
//! backed by the [`kv`] trait), the [`codec`] (a seekable stream codec
//! combining chunked compression and AEAD-framed encryption), and the
//! [`mapper`] (a diff/sync engine between two such trees). [`gc`] reclaims
//! unreachable objects from the store the linker writes into; [`overlay`]
//! layers in-memory sparse writes atop a read-only stream; [`path_trie`] and
//! [`repo_path`] are shared plumbing.
//!
//! This crate has no CLI, daemon, or FUSE surface — those are external
//! collaborators that would be built against this library, not part of it.

pub mod codec;
pub mod error;
pub mod gc;
pub mod hash;
pub mod kv;
pub mod linker;
pub mod mapper;
pub mod node;
pub mod overlay;
pub mod path_trie;
pub mod repo_path;
