//! Seekable stream codec (spec.md §4.F, §4.G, §4.H): chunked compression,
//! AEAD-framed encryption, and the pipeline/`LimitStream` glue that
//! composes them in front of an external blob backend.
//!
//! Grounded in `catfs/mio/{compress,encrypt}` — the chunk/block framing and
//! the binary-searchable index are carried over; see each submodule's docs
//! for what's a direct port versus authored from spec.md prose where the
//! retrieval pack's Go source was itself truncated.

pub mod compress;
pub mod encrypt;
pub mod pipeline;

pub use compress::Algorithm;
pub use encrypt::Cipher;
