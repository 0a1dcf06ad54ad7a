//! End-to-end sparse-write overlay scenarios (spec.md §4.K, §8) that go
//! beyond `overlay.rs`'s own unit tests: a `Layer` stacked on top of a real
//! decrypted, decompressed codec stream rather than a bare `Cursor`, and a
//! longer sequence of overlapping/disjoint writes checked against a naive
//! reference buffer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Cursor;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use vaultfs::codec::Algorithm;
use vaultfs::codec::Cipher;
use vaultfs::codec::pipeline::BlobBackend;
use vaultfs::codec::pipeline::egress_reader;
use vaultfs::codec::pipeline::ingest;
use vaultfs::error::CodecError;
use vaultfs::error::CodecResult;
use vaultfs::overlay::Layer;

struct MemBackend {
    blobs: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemBackend {
    fn new() -> Self {
        Self { blobs: RefCell::new(HashMap::new()) }
    }
}

impl BlobBackend for MemBackend {
    type Blob = Cursor<Vec<u8>>;

    fn put(&self, key: &str, data: &[u8]) -> CodecResult<()> {
        self.blobs.borrow_mut().insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> CodecResult<Self::Blob> {
        let blobs = self.blobs.borrow();
        let data = blobs.get(key).ok_or(CodecError::BadHeader)?;
        Ok(Cursor::new(data.clone()))
    }

    fn has(&self, key: &str) -> CodecResult<bool> {
        Ok(self.blobs.borrow().contains_key(key))
    }
}

/// Overwriting a stretch of an otherwise-committed file must read back the
/// new bytes while everything outside the write still comes from the
/// decrypted, decompressed backing stream, not from a plain in-memory
/// buffer.
#[test]
fn writes_over_a_decrypted_compressed_stream_shadow_only_the_written_range() {
    let backend = MemBackend::new();
    let key = [3u8; 32];
    let plaintext: Vec<u8> = (0..8000u32).map(|i| (i % 251) as u8).collect();
    ingest(&backend, "blob", &plaintext, Algorithm::Lz4, Cipher::Aes256Gcm, key).unwrap();

    let reader = egress_reader(&backend, "blob", key).unwrap();
    let mut layer = Layer::new(reader);
    layer.set_size(plaintext.len() as u64);

    layer.seek(SeekFrom::Start(2000)).unwrap();
    let patch = vec![0xAAu8; 500];
    layer.write_all(&patch).unwrap();

    let mut expected = plaintext.clone();
    expected[2000..2500].copy_from_slice(&patch);

    layer.seek(SeekFrom::Start(0)).unwrap();
    let mut out = Vec::new();
    layer.read_to_end(&mut out).unwrap();
    assert_eq!(out, expected);
}

/// A write that starts before the base stream's logical end but extends
/// past it grows the overlay's reported size, and the tail beyond the old
/// end must not fall back to the base (there's nothing there to read).
#[test]
fn write_straddling_the_base_streams_end_extends_the_logical_size() {
    let backend = MemBackend::new();
    let key = [4u8; 32];
    let plaintext = vec![1u8; 100];
    ingest(&backend, "blob", &plaintext, Algorithm::Snappy, Cipher::ChaCha20Poly1305, key).unwrap();

    let reader = egress_reader(&backend, "blob", key).unwrap();
    let mut layer = Layer::new(reader);
    layer.set_size(plaintext.len() as u64);

    layer.seek(SeekFrom::Start(80)).unwrap();
    let tail = vec![2u8; 50];
    layer.write_all(&tail).unwrap();
    assert_eq!(layer.size(), Some(130));

    layer.seek(SeekFrom::Start(0)).unwrap();
    let mut out = Vec::new();
    layer.read_to_end(&mut out).unwrap();
    assert_eq!(out.len(), 130);
    assert_eq!(&out[..80], &plaintext[..80]);
    assert_eq!(&out[80..], &tail[..]);
}

/// A naive reference model (a `Vec<u8>` mutated directly) checked against a
/// longer sequence of writes at varying offsets, some overlapping, some
/// disjoint, some repeated at the same spot (last write wins).
#[test]
fn a_sequence_of_overlapping_and_disjoint_writes_matches_a_reference_buffer() {
    let base = vec![0u8; 200];
    let mut layer = Layer::new(Cursor::new(base.clone()));
    layer.set_size(base.len() as u64);

    let mut reference = base.clone();
    let writes: &[(u64, &[u8])] = &[
        (10, b"aaaaaaaaaa"),
        (50, b"bbbbbbbbbb"),
        (15, b"ccccc"),
        (45, b"dddddddddd"),
        (0, b"ee"),
        (190, b"ffffffffff"),
    ];

    for (offset, data) in writes {
        layer.seek(SeekFrom::Start(*offset)).unwrap();
        layer.write_all(data).unwrap();
        let end = *offset as usize + data.len();
        if end > reference.len() {
            reference.resize(end, 0);
        }
        reference[*offset as usize..end].copy_from_slice(data);
    }

    layer.seek(SeekFrom::Start(0)).unwrap();
    let mut out = Vec::new();
    layer.read_to_end(&mut out).unwrap();
    assert_eq!(out, reference);
}

/// Reading a sub-range that straddles a written patch and untouched base
/// bytes on both sides blends all three correctly when seeking directly to
/// an interior offset, without reading from the start first.
#[test]
fn random_access_read_into_the_middle_of_a_patch_blends_correctly() {
    let base: Vec<u8> = (0..64u8).collect();
    let mut layer = Layer::new(Cursor::new(base.clone()));
    layer.set_size(base.len() as u64);

    layer.seek(SeekFrom::Start(20)).unwrap();
    let patch = vec![0xFFu8; 10];
    layer.write_all(&patch).unwrap();

    layer.seek(SeekFrom::Start(15)).unwrap();
    let mut buf = [0u8; 20];
    layer.read_exact(&mut buf).unwrap();

    let mut expected = [0u8; 20];
    expected[..5].copy_from_slice(&base[15..20]);
    expected[5..15].copy_from_slice(&patch);
    expected[15..].copy_from_slice(&base[30..35]);
    assert_eq!(buf, expected);
}

/// Seeking past the logical end and reading yields nothing, mirroring a
/// plain file's behavior rather than panicking on an out-of-range slice.
#[test]
fn reading_past_the_logical_end_returns_no_bytes() {
    let base = vec![9u8; 16];
    let mut layer = Layer::new(Cursor::new(base));
    layer.set_size(16);

    layer.seek(SeekFrom::Start(16)).unwrap();
    let mut buf = [0u8; 8];
    let n = layer.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    layer.seek(SeekFrom::Start(100)).unwrap();
    let n = layer.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}
