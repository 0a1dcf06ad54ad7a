//! Seekable chunked compression (spec.md §4.F).
//!
//! Wire format, grounded in `catfs/mio/compress/common.go`:
//!
//! ```text
//! HEADER  (12 B): magic b"engorgio" (8B) + version u16 LE + algorithm u16 LE
//! CHUNKS:         each up to CHUNK_SIZE raw bytes, compressed independently
//! INDEX:          N+1 16-byte records (raw_off u64 LE, zip_off u64 LE)
//! TRAILER (12 B): chunk_size u32 LE + index_size u64 LE
//! ```
//!
//! Each index record marks the start of a chunk in both coordinates; the
//! final record is a sentinel marking end-of-stream in both coordinates.
//! `Reader::chunk_lookup` brackets any offset between two consecutive
//! records, exactly as the original's `chunkLookup` does via `sort.Search`.
//!
//! One deliberate deviation from the original (documented in DESIGN.md): the
//! original's index validation rejects any two adjacent records with an
//! equal `rawOff`, which makes a genuinely empty stream unrepresentable
//! (there is no way to close the stream without either zero or one index
//! records, and `chunkLookup` needs at least two to bracket anything). Here
//! adjacent records are required to be non-decreasing rather than strictly
//! increasing in both coordinates, which admits exactly one degenerate
//! all-zero-length final chunk and makes the empty-stream case well-formed.

use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use crate::error::CodecError;
use crate::error::CodecResult;

const MAGIC: &[u8; 8] = b"engorgio";
const CURRENT_VERSION: u16 = 1;
const HEADER_SIZE: u64 = 12;
const TRAILER_SIZE: u64 = 12;
const RECORD_SIZE: u64 = 16;

/// Default/maximum chunk size (spec.md §5.3: 64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Compression algorithm selector (spec.md §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    None = 0,
    Snappy = 1,
    Lz4 = 2,
}

impl Algorithm {
    fn from_u16(v: u16) -> CodecResult<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            2 => Ok(Self::Lz4),
            other => Err(CodecError::BadAlgorithm(other)),
        }
    }

    fn encode(self, data: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Snappy => Ok(snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|_| CodecError::BadHeader)?),
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    fn decode(self, data: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|_| CodecError::BadBlock(0)),
            Self::Lz4 => lz4_flex::decompress_size_prepended(data).map_err(|_| CodecError::BadBlock(0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    raw_off: u64,
    zip_off: u64,
}

impl Record {
    fn write(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.raw_off.to_le_bytes());
        buf.extend_from_slice(&self.zip_off.to_le_bytes());
    }

    fn read(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() != RECORD_SIZE as usize {
            return Err(CodecError::BadIndex);
        }
        let raw_off = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let zip_off = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        Ok(Self { raw_off, zip_off })
    }
}

fn write_header(out: &mut Vec<u8>, algo: Algorithm) {
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
    out.extend_from_slice(&(algo as u16).to_le_bytes());
}

/// Buffers writes into fixed-size chunks, compressing and flushing each full
/// chunk immediately; call [`Writer::finish`] to flush any remainder and
/// write the index and trailer (spec.md §4.F: compressing writer).
pub struct Writer<W: Write> {
    inner: W,
    algo: Algorithm,
    chunk_size: usize,
    buf: Vec<u8>,
    records: Vec<Record>,
    chunk_start: Record,
    header_written: bool,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W, algo: Algorithm) -> Self {
        Self::with_chunk_size(inner, algo, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: W, algo: Algorithm, chunk_size: usize) -> Self {
        Self {
            inner,
            algo,
            chunk_size,
            buf: Vec::with_capacity(chunk_size),
            records: Vec::new(),
            chunk_start: Record { raw_off: 0, zip_off: HEADER_SIZE },
            header_written: false,
        }
    }

    fn ensure_header(&mut self) -> CodecResult<()> {
        if self.header_written {
            return Ok(());
        }
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        write_header(&mut header, self.algo);
        self.inner.write_all(&header)?;
        self.records.push(self.chunk_start);
        self.header_written = true;
        Ok(())
    }

    fn flush_chunk(&mut self, raw: &[u8]) -> CodecResult<()> {
        let compressed = self.algo.encode(raw)?;
        self.inner.write_all(&compressed)?;
        self.chunk_start = Record {
            raw_off: self.chunk_start.raw_off + raw.len() as u64,
            zip_off: self.chunk_start.zip_off + compressed.len() as u64,
        };
        self.records.push(self.chunk_start);
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> CodecResult<()> {
        self.ensure_header()?;
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.chunk_size {
            let chunk: Vec<u8> = self.buf.drain(..self.chunk_size).collect();
            self.flush_chunk(&chunk)?;
        }
        Ok(())
    }

    /// Flushes any buffered partial chunk, then writes the index and
    /// trailer, returning the inner writer.
    pub fn finish(mut self) -> CodecResult<W> {
        self.ensure_header()?;
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.flush_chunk(&chunk)?;
        }

        let mut index = Vec::with_capacity(self.records.len() * RECORD_SIZE as usize);
        for record in &self.records {
            record.write(&mut index);
        }
        self.inner.write_all(&index)?;

        let mut trailer = Vec::with_capacity(TRAILER_SIZE as usize);
        trailer.extend_from_slice(&(self.chunk_size as u32).to_le_bytes());
        trailer.extend_from_slice(&(index.len() as u64).to_le_bytes());
        self.inner.write_all(&trailer)?;

        Ok(self.inner)
    }
}

impl<W: Write> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Writer::write(self, buf).map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Seekable decompressing reader (spec.md §4.F, §8 random-access property).
pub struct Reader<R: Read + Seek> {
    inner: R,
    algo: Algorithm,
    chunk_size: u32,
    index: Vec<Record>,
    parsed: bool,
    loaded_chunk_start: Option<Record>,
    chunk_buf: Vec<u8>,
    raw_pos: u64,
}

impl<R: Read + Seek> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            algo: Algorithm::None,
            chunk_size: DEFAULT_CHUNK_SIZE as u32,
            index: Vec::new(),
            parsed: false,
            loaded_chunk_start: None,
            chunk_buf: Vec::new(),
            raw_pos: 0,
        }
    }

    fn ensure_parsed(&mut self) -> CodecResult<()> {
        if self.parsed {
            return Ok(());
        }
        self.inner.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        self.inner.read_exact(&mut header)?;
        if &header[0..8] != MAGIC {
            return Err(CodecError::BadMagicNumber);
        }
        let version = u16::from_le_bytes(header[8..10].try_into().unwrap());
        if version != CURRENT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let algo_id = u16::from_le_bytes(header[10..12].try_into().unwrap());
        self.algo = Algorithm::from_u16(algo_id)?;

        let end = self.inner.seek(SeekFrom::End(0))?;
        if end < HEADER_SIZE + TRAILER_SIZE {
            return Err(CodecError::BadHeader);
        }
        self.inner.seek(SeekFrom::Start(end - TRAILER_SIZE))?;
        let mut trailer = [0u8; TRAILER_SIZE as usize];
        self.inner.read_exact(&mut trailer)?;
        self.chunk_size = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
        let index_size = u64::from_le_bytes(trailer[4..12].try_into().unwrap());
        if index_size % RECORD_SIZE != 0 || index_size == 0 {
            return Err(CodecError::BadIndex);
        }

        let index_start = end
            .checked_sub(TRAILER_SIZE + index_size)
            .ok_or(CodecError::BadIndex)?;
        self.inner.seek(SeekFrom::Start(index_start))?;
        let mut index_bytes = vec![0u8; index_size as usize];
        self.inner.read_exact(&mut index_bytes)?;

        let count = (index_size / RECORD_SIZE) as usize;
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let start = i * RECORD_SIZE as usize;
            records.push(Record::read(&index_bytes[start..start + RECORD_SIZE as usize])?);
        }
        for pair in records.windows(2) {
            if pair[1].raw_off < pair[0].raw_off || pair[1].zip_off < pair[0].zip_off {
                return Err(CodecError::BadIndex);
            }
        }
        if records.len() < 2 {
            return Err(CodecError::BadIndex);
        }
        self.index = records;
        self.parsed = true;
        self.inner.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(())
    }

    fn total_raw_len(&self) -> u64 {
        self.index.last().map(|r| r.raw_off).unwrap_or(0)
    }

    /// Brackets `offset` between two consecutive index records, as the
    /// original's `chunkLookup` does.
    fn chunk_lookup(&self, offset: u64) -> (Record, Record) {
        let idx = self.index.partition_point(|r| r.raw_off <= offset);
        if idx == 0 {
            (self.index[0], self.index[1])
        } else if idx >= self.index.len() {
            (self.index[self.index.len() - 1], self.index[self.index.len() - 1])
        } else {
            (self.index[idx - 1], self.index[idx])
        }
    }

    fn load_chunk_at(&mut self, start: Record, end: Record) -> CodecResult<()> {
        if self.loaded_chunk_start == Some(start) {
            return Ok(());
        }
        let chunk_zip_len = end.zip_off - start.zip_off;
        if chunk_zip_len == 0 {
            self.chunk_buf.clear();
            self.loaded_chunk_start = Some(start);
            return Ok(());
        }
        self.inner.seek(SeekFrom::Start(start.zip_off))?;
        let mut compressed = vec![0u8; chunk_zip_len as usize];
        self.inner.read_exact(&mut compressed)?;
        self.chunk_buf = self.algo.decode(&compressed)?;
        self.loaded_chunk_start = Some(start);
        Ok(())
    }
}

impl<R: Read + Seek> Read for Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.ensure_parsed().map_err(std::io::Error::other)?;
        if self.raw_pos >= self.total_raw_len() {
            return Ok(0);
        }
        let (start, end) = self.chunk_lookup(self.raw_pos);
        self.load_chunk_at(start, end).map_err(std::io::Error::other)?;
        let offset_in_chunk = (self.raw_pos - start.raw_off) as usize;
        if offset_in_chunk >= self.chunk_buf.len() {
            return Ok(0);
        }
        let available = &self.chunk_buf[offset_in_chunk..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.raw_pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for Reader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.ensure_parsed().map_err(std::io::Error::other)?;
        let total = self.total_raw_len();
        let new_pos = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::End(delta) => (total as i64 + delta).max(0) as u64,
            SeekFrom::Current(delta) => (self.raw_pos as i64 + delta).max(0) as u64,
        };
        self.raw_pos = new_pos;
        Ok(new_pos)
    }
}
