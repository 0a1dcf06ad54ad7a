//! Seekable AEAD-framed encryption (spec.md §4.G).
//!
//! Wire format (spec.md §4.G, §6 — authoritative; see DESIGN.md for the one
//! place this deliberately departs from `catfs/mio/encrypt/format.go`, whose
//! flags-bitfield header is replaced here with explicit version/cipher
//! fields, keeping the same total 36-byte size):
//!
//! ```text
//! HEADER (36 B): magic b"evanesco" (8B) + version u16 LE + cipher u16 LE
//!                + key_length u32 LE + max_block_size u32 LE
//!                + 16-byte truncated HMAC-SHA3-224 over the preceding 20 B
//! BLOCKS:        each is an 8-byte LE block number followed by the AEAD
//!                seal of up to max_block_size plaintext bytes (ciphertext
//!                + authentication tag)
//! ```
//!
//! The on-wire block number is 8 bytes; constructing the actual AEAD nonce
//! pads it with zero bytes out to the cipher's required nonce length (12 for
//! both supported ciphers), following `catfs/mio/encrypt/reader.go`'s
//! `readBlock`/`Seek` block-addressing scheme.

use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use chacha20poly1305::ChaCha20Poly1305;
use hmac::Hmac;
use hmac::Mac;
use sha3::Sha3_224;

use crate::error::CodecError;
use crate::error::CodecResult;

const MAGIC: &[u8; 8] = b"evanesco";
const CURRENT_VERSION: u16 = 1;
const MAC_SIZE: usize = 16;
const HEADER_BODY_SIZE: usize = 20;
const HEADER_SIZE: usize = HEADER_BODY_SIZE + MAC_SIZE;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_LEN: u32 = 32;

/// Default/maximum plaintext size per sealed block (spec.md §5.3: 64 KiB).
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 64 * 1024;

/// AEAD cipher selector (spec.md §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    ChaCha20Poly1305 = 0,
    Aes256Gcm = 1,
}

impl Cipher {
    fn from_u16(v: u16) -> CodecResult<Self> {
        match v {
            0 => Ok(Self::ChaCha20Poly1305),
            1 => Ok(Self::Aes256Gcm),
            other => Err(CodecError::BadCipher(other)),
        }
    }

    fn seal(self, key: &[u8; 32], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            Self::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodecError::BadHeader)?;
                cipher.encrypt(nonce.into(), plaintext).map_err(|_| CodecError::BadHeader)
            }
            Self::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CodecError::BadHeader)?;
                cipher.encrypt(nonce.into(), plaintext).map_err(|_| CodecError::BadHeader)
            }
        }
    }

    fn open(self, key: &[u8; 32], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], block_num: u64) -> CodecResult<Vec<u8>> {
        let result = match self {
            Self::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodecError::BadBlock(block_num))?;
                cipher.decrypt(nonce.into(), ciphertext)
            }
            Self::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CodecError::BadBlock(block_num))?;
                cipher.decrypt(nonce.into(), ciphertext)
            }
        };
        result.map_err(|_| CodecError::BadBlock(block_num))
    }
}

fn block_nonce(block_num: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&block_num.to_le_bytes());
    nonce
}

fn header_mac(key: &[u8; 32], body: &[u8]) -> CodecResult<[u8; MAC_SIZE]> {
    let mut mac = Hmac::<Sha3_224>::new_from_slice(key).map_err(|_| CodecError::BadHeaderMac)?;
    mac.update(body);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_SIZE];
    out.copy_from_slice(&full[..MAC_SIZE]);
    Ok(out)
}

fn build_header(key: &[u8; 32], cipher: Cipher, max_block_size: u32) -> CodecResult<Vec<u8>> {
    let mut body = Vec::with_capacity(HEADER_BODY_SIZE);
    body.extend_from_slice(MAGIC);
    body.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
    body.extend_from_slice(&(cipher as u16).to_le_bytes());
    body.extend_from_slice(&KEY_LEN.to_le_bytes());
    body.extend_from_slice(&max_block_size.to_le_bytes());
    let mac = header_mac(key, &body)?;
    let mut header = body;
    header.extend_from_slice(&mac);
    Ok(header)
}

struct ParsedHeader {
    cipher: Cipher,
    max_block_size: u32,
}

fn parse_header(key: &[u8; 32], header: &[u8]) -> CodecResult<ParsedHeader> {
    if header.len() != HEADER_SIZE {
        return Err(CodecError::BadHeader);
    }
    if &header[0..8] != MAGIC {
        return Err(CodecError::BadMagicNumber);
    }
    let version = u16::from_le_bytes(header[8..10].try_into().unwrap());
    if version != CURRENT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let cipher_id = u16::from_le_bytes(header[10..12].try_into().unwrap());
    let cipher = Cipher::from_u16(cipher_id)?;
    let key_length = u32::from_le_bytes(header[12..16].try_into().unwrap());
    if key_length != KEY_LEN {
        return Err(CodecError::BadHeader);
    }
    let max_block_size = u32::from_le_bytes(header[16..20].try_into().unwrap());

    let expected_mac = header_mac(key, &header[..HEADER_BODY_SIZE])?;
    if expected_mac != header[HEADER_BODY_SIZE..HEADER_SIZE] {
        return Err(CodecError::BadHeaderMac);
    }
    Ok(ParsedHeader { cipher, max_block_size })
}

/// Buffers writes into fixed-size blocks, sealing and flushing each full
/// block immediately; call [`Writer::finish`] to flush any remainder.
pub struct Writer<W: Write> {
    inner: W,
    key: [u8; 32],
    cipher: Cipher,
    max_block_size: u32,
    buf: Vec<u8>,
    block_num: u64,
    header_written: bool,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W, key: [u8; 32], cipher: Cipher) -> Self {
        Self::with_max_block_size(inner, key, cipher, DEFAULT_MAX_BLOCK_SIZE)
    }

    pub fn with_max_block_size(inner: W, key: [u8; 32], cipher: Cipher, max_block_size: u32) -> Self {
        Self {
            inner,
            key,
            cipher,
            max_block_size,
            buf: Vec::with_capacity(max_block_size as usize),
            block_num: 0,
            header_written: false,
        }
    }

    fn ensure_header(&mut self) -> CodecResult<()> {
        if self.header_written {
            return Ok(());
        }
        let header = build_header(&self.key, self.cipher, self.max_block_size)?;
        self.inner.write_all(&header)?;
        self.header_written = true;
        Ok(())
    }

    fn seal_block(&mut self, plaintext: &[u8]) -> CodecResult<()> {
        let nonce = block_nonce(self.block_num);
        let ciphertext = self.cipher.seal(&self.key, &nonce, plaintext)?;
        self.inner.write_all(&self.block_num.to_le_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.block_num += 1;
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> CodecResult<()> {
        self.ensure_header()?;
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.max_block_size as usize {
            let block: Vec<u8> = self.buf.drain(..self.max_block_size as usize).collect();
            self.seal_block(&block)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> CodecResult<W> {
        self.ensure_header()?;
        if !self.buf.is_empty() {
            let block = std::mem::take(&mut self.buf);
            self.seal_block(&block)?;
        }
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

/// Seekable decrypting reader.
pub struct Reader<R: Read + Seek> {
    inner: R,
    key: [u8; 32],
    cipher: Cipher,
    max_block_size: u32,
    parsed: bool,
    loaded_block: Option<u64>,
    block_buf: Vec<u8>,
    dec_pos: u64,
}

impl<R: Read + Seek> Reader<R> {
    pub fn new(inner: R, key: [u8; 32]) -> Self {
        Self {
            inner,
            key,
            cipher: Cipher::ChaCha20Poly1305,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            parsed: false,
            loaded_block: None,
            block_buf: Vec::new(),
            dec_pos: 0,
        }
    }

    fn ensure_parsed(&mut self) -> CodecResult<()> {
        if self.parsed {
            return Ok(());
        }
        self.inner.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_SIZE];
        self.inner.read_exact(&mut header)?;
        let parsed = parse_header(&self.key, &header)?;
        self.cipher = parsed.cipher;
        self.max_block_size = parsed.max_block_size;
        self.parsed = true;
        Ok(())
    }

    fn stream_len(&mut self) -> CodecResult<u64> {
        let current = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(current))?;
        Ok(end)
    }

    fn block_on_disk_size(&self) -> u64 {
        8 + self.max_block_size as u64 + TAG_SIZE as u64
    }

    fn load_block(&mut self, block_num: u64) -> CodecResult<()> {
        if self.loaded_block == Some(block_num) {
            return Ok(());
        }
        let offset = HEADER_SIZE as u64 + block_num * self.block_on_disk_size();
        let stream_len = self.stream_len()?;
        if offset >= stream_len {
            self.block_buf.clear();
            self.loaded_block = Some(block_num);
            return Ok(());
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut wire_block_num = [0u8; 8];
        self.inner.read_exact(&mut wire_block_num)?;
        if u64::from_le_bytes(wire_block_num) != block_num {
            return Err(CodecError::BadBlock(block_num));
        }
        let remaining = stream_len - offset - 8;
        let to_read = remaining.min(self.max_block_size as u64 + TAG_SIZE as u64);
        let mut ciphertext = vec![0u8; to_read as usize];
        self.inner.read_exact(&mut ciphertext)?;

        let nonce = block_nonce(block_num);
        self.block_buf = self.cipher.open(&self.key, &nonce, &ciphertext, block_num)?;
        self.loaded_block = Some(block_num);
        Ok(())
    }
}

impl<R: Read + Seek> Read for Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.ensure_parsed().map_err(std::io::Error::other)?;
        let block_num = self.dec_pos / self.max_block_size as u64;
        self.load_block(block_num).map_err(std::io::Error::other)?;
        let offset_in_block = (self.dec_pos % self.max_block_size as u64) as usize;
        if offset_in_block >= self.block_buf.len() {
            return Ok(0);
        }
        let available = &self.block_buf[offset_in_block..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.dec_pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for Reader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.ensure_parsed().map_err(std::io::Error::other)?;
        let new_pos = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => (self.dec_pos as i64 + delta).max(0) as u64,
            SeekFrom::End(delta) => {
                let stream_len = self.stream_len().map_err(std::io::Error::other)?;
                if stream_len <= HEADER_SIZE as u64 {
                    (0i64 + delta).max(0) as u64
                } else {
                    let block_on_disk = self.block_on_disk_size();
                    let body_len = stream_len - HEADER_SIZE as u64;
                    let full_blocks = body_len / block_on_disk;
                    let last_block_wire = body_len % block_on_disk;
                    let last_block_plain = last_block_wire.saturating_sub(8 + TAG_SIZE as u64);
                    let total_plain = full_blocks * self.max_block_size as u64 + last_block_plain;
                    ((total_plain as i64) + delta).max(0) as u64
                }
            }
        };
        self.dec_pos = new_pos;
        Ok(new_pos)
    }
}
