//! Crate-wide error kinds.
//!
//! Structured the way jj-lib's `backend::BackendError` is: one `thiserror`
//! enum per concern, `source` fields boxed where the cause is foreign, and
//! `#[non_exhaustive]` so new variants don't break callers who already match
//! exhaustively with a trailing wildcard.

use thiserror::Error;

use crate::repo_path::RepoPathBuf;

/// Errors from the key/value store abstraction (spec.md §4.B).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    #[error("no such key: {0:?}")]
    NoSuchKey(Vec<String>),

    /// Open question (spec.md §8): an empty key sequence is a hard error
    /// rather than silently producing `""` and dereferencing its last
    /// element.
    #[error("empty key sequence is not a valid key")]
    EmptyKey,

    #[error("key sequence escapes the store root: {0:?}")]
    PathEscape(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt on-disk store state: {0}")]
    Corrupt(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Errors from node (de)serialization (spec.md §4.C).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NodeError {
    #[error("node was not of the expected variant")]
    BadNode,

    #[error("malformed node encoding: {0}")]
    Encoding(String),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Errors surfaced at the Linker boundary (spec.md §4.D, §7).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkerError {
    #[error("no such file: {0}")]
    NoSuchFile(RepoPathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(RepoPathBuf),

    #[error("no such ref: {0}")]
    NoSuchRef(String),

    #[error("commit attempted with no staged changes")]
    NoChange,

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

pub type LinkerResult<T> = Result<T, LinkerError>;

impl LinkerError {
    /// Predicate callers must use instead of string-matching (spec.md §7:
    /// `IsNoSuchFileError`).
    pub fn is_no_such_file(&self) -> bool {
        matches!(self, Self::NoSuchFile(_))
    }

    /// Predicate callers must use instead of string-matching (spec.md §7:
    /// `IsErrNoSuchRef`).
    pub fn is_no_such_ref(&self) -> bool {
        matches!(self, Self::NoSuchRef(_))
    }
}

/// Stream-codec integrity failures (spec.md §4.F, §4.G, §7). Always fatal
/// for the stream in which they occur.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("bad magic number")]
    BadMagicNumber,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u16),

    #[error("unknown compression algorithm id: {0}")]
    BadAlgorithm(u16),

    #[error("unknown cipher id: {0}")]
    BadCipher(u16),

    #[error("header MAC verification failed")]
    BadHeaderMac,

    #[error("block {0} failed to authenticate")]
    BadBlock(u64),

    #[error("compression chunk index is not monotonically increasing")]
    BadIndex,

    #[error("malformed stream header or trailer")]
    BadHeader,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Errors from the VCS mapper (spec.md §4.I).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MapperError {
    #[error(transparent)]
    Linker(#[from] LinkerError),

    #[error("node was not of the expected variant during mapping")]
    BadNode,

    /// Propagated verbatim from a visitor that short-circuited the walk
    /// (spec.md §5: "visitors may short-circuit by returning an error").
    #[error(transparent)]
    Visitor(Box<dyn std::error::Error + Send + Sync>),
}

pub type MapperResult<T> = Result<T, MapperError>;
