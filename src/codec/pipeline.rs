//! Stream pipeline gluing compression and encryption to a blob backend
//! (spec.md §4.H).
//!
//! `ingest` composes [`compress::Writer`] and [`encrypt::Writer`] around a
//! backend write sink in the order spec.md §5 describes the round trip:
//! plaintext is compressed first, then the compressed bytes are sealed. The
//! inverse order — decrypt, then decompress — is used for `egress`.

use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use crate::codec::Algorithm;
use crate::codec::Cipher;
use crate::codec::compress;
use crate::codec::encrypt;
use crate::error::CodecResult;

/// Abstraction over wherever sealed, compressed blobs actually live — an
/// object store, a disk cache, a remote bucket. Grounded in the shape of
/// `catfs/mio`'s backend interface referenced by the pipeline's doc comments
/// in the retrieval pack, generalized to the three operations the pipeline
/// needs.
pub trait BlobBackend {
    type Blob: Read + Seek;

    fn put(&self, key: &str, data: &[u8]) -> CodecResult<()>;
    fn get(&self, key: &str) -> CodecResult<Self::Blob>;
    fn has(&self, key: &str) -> CodecResult<bool>;
}

/// Compresses then encrypts `plaintext`, storing the sealed bytes at `key`
/// in `backend` (spec.md §4.H: ingest path).
pub fn ingest<B: BlobBackend>(
    backend: &B,
    key: &str,
    plaintext: &[u8],
    algo: Algorithm,
    cipher: Cipher,
    enc_key: [u8; 32],
) -> CodecResult<()> {
    let sealed = Vec::new();
    let encryptor = encrypt::Writer::new(sealed, enc_key, cipher);
    let mut compressor = compress::Writer::new(encryptor, algo);
    compressor.write(plaintext)?;
    let encryptor = compressor.finish()?;
    let sealed = encryptor.finish()?;
    backend.put(key, &sealed)
}

/// Reads, decrypts, and decompresses the blob at `key`, returning its full
/// plaintext (spec.md §4.H: egress path, whole-blob convenience wrapper
/// around the seekable [`egress_reader`]).
pub fn egress<B: BlobBackend>(backend: &B, key: &str, enc_key: [u8; 32]) -> CodecResult<Vec<u8>> {
    let mut reader = egress_reader(backend, key, enc_key)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Returns a seekable reader over `key`'s plaintext, decrypting and
/// decompressing lazily as bytes are requested (spec.md §8: random access
/// without loading the whole blob).
pub fn egress_reader<B: BlobBackend>(
    backend: &B,
    key: &str,
    enc_key: [u8; 32],
) -> CodecResult<compress::Reader<encrypt::Reader<B::Blob>>> {
    let blob = backend.get(key)?;
    let decryptor = encrypt::Reader::new(blob, enc_key);
    Ok(compress::Reader::new(decryptor))
}

/// Bounds reads of an underlying seekable stream to a known logical length,
/// so a `File` node's recorded `size` (spec.md §4.C) rather than the
/// physical extent of the sealed, padded ciphertext governs end-of-stream.
pub struct LimitStream<S: Read + Seek> {
    inner: S,
    limit: u64,
    pos: u64,
}

impl<S: Read + Seek> LimitStream<S> {
    pub fn new(inner: S, limit: u64) -> Self {
        Self { inner, limit, pos: 0 }
    }
}

impl<S: Read + Seek> Read for LimitStream<S> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.limit {
            return Ok(0);
        }
        let remaining = (self.limit - self.pos) as usize;
        let max = out.len().min(remaining);
        let n = self.inner.read(&mut out[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: Read + Seek> Seek for LimitStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => (self.pos as i64 + delta).max(0) as u64,
            SeekFrom::End(delta) => (self.limit as i64 + delta).max(0) as u64,
        };
        let clamped = new_pos.min(self.limit);
        self.inner.seek(SeekFrom::Start(clamped))?;
        self.pos = clamped;
        Ok(clamped)
    }
}
