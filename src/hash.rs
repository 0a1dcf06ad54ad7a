//! Content-addressed identifier used throughout the Merkle DAG.
//!
//! Mirrors the role of `object_id::ObjectId` in jj-lib, but collapsed to a
//! single concrete type: every node in this crate (file, directory, commit,
//! ghost) is identified the same way, so there is no need for the `id_type!`
//! family of newtypes.

use std::fmt;

use blake2::Blake2s256;
use blake2::Digest as _;

/// Length in bytes of a [`Hash`]. Blake2s256 produces a 32-byte digest.
pub const HASH_LEN: usize = 32;

/// Opaque content identifier. Equality is byte-equality; clone is deep (it's
/// a fixed-size array, so cloning is just a copy).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn equal(&self, other: &Self) -> bool {
        self == other
    }

    /// Hashes `bytes` with the crate's content-hash function.
    pub fn sum(bytes: &[u8]) -> Self {
        let mut hasher = Blake2s256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn to_b58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_b58(s: &str) -> Result<Self, Base58DecodeError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| Base58DecodeError { input: s.to_owned() })?;
        let array: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| Base58DecodeError { input: s.to_owned() })?;
        Ok(Self(array))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_b58())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b58())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid base58 hash: {input}")]
pub struct Base58DecodeError {
    input: String,
}

/// Hashes the string `"ghost:" + inner` as required for
/// [`crate::node::Node::Ghost`]'s own tree hash (spec.md §3).
pub fn ghost_hash(inner: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(6 + HASH_LEN);
    buf.extend_from_slice(b"ghost:");
    buf.extend_from_slice(inner.as_bytes());
    Hash::sum(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_b58() {
        let h = Hash::sum(b"hello world");
        let s = h.to_b58();
        let back = Hash::from_b58(&s).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn distinct_inputs_distinct_hashes() {
        assert_ne!(Hash::sum(b"a"), Hash::sum(b"b"));
    }

    #[test]
    fn ghost_hash_differs_from_inner() {
        let inner = Hash::sum(b"node-bytes");
        assert_ne!(ghost_hash(&inner), inner);
    }

    #[test]
    fn from_b58_rejects_garbage() {
        assert!(Hash::from_b58("not-valid-base58-!!!").is_err());
    }
}
