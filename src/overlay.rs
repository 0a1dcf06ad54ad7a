//! In-memory sparse write overlay atop a read-only seekable stream (spec.md
//! §4.K).
//!
//! `IntervalIndex`/`Modification::merge` are a direct port of
//! `catfs/mio/overlay/overlay.go`'s `Add`/`Merge`, restated with owned
//! `Vec<u8>` splicing instead of the original's slice-append juggling.
//! `Layer`'s `Read`/`Write`/`Seek` impls are authored from spec.md's prose
//! (§4.K: "serves bytes from overlays when they cover the requested range,
//! and from the underlying seekable reader otherwise") since the retrieval
//! pack's `overlay.go` was truncated right after `SetSize`, before any
//! `Layer` I/O method.

use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

/// A single buffered write, covering the half-open byte range
/// `[offset, offset + data.len())`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    offset: u64,
    data: Vec<u8>,
}

impl Modification {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self { offset, data }
    }

    /// `[min, max)`.
    pub fn range(&self) -> (u64, u64) {
        (self.offset, self.offset + self.data.len() as u64)
    }

    /// Absorbs `other` into `self`, keeping `self`'s bytes wherever the two
    /// ranges overlap (`catfs/mio/overlay/overlay.go`'s `Merge`: "the
    /// overlapping parts are taken from `n` always").
    fn merge(&mut self, other: Modification) {
        let (o_min, o_max) = other.range();
        let (n_min, n_max) = self.range();
        if o_min > n_max || n_min > o_max {
            return;
        }
        let new_min = n_min.min(o_min);
        let new_max = n_max.max(o_max);
        let mut merged = vec![0u8; (new_max - new_min) as usize];
        let o_off = (o_min - new_min) as usize;
        merged[o_off..o_off + other.data.len()].copy_from_slice(&other.data);
        let n_off = (n_min - new_min) as usize;
        merged[n_off..n_off + self.data.len()].copy_from_slice(&self.data);
        self.offset = new_min;
        self.data = merged;
    }
}

/// A sorted, non-overlapping collection of [`Modification`]s; inserting an
/// interval that overlaps existing ones merges them into one.
#[derive(Debug, Default)]
pub struct IntervalIndex {
    intervals: Vec<Modification>,
    /// The largest interval end ever passed to [`Self::add`].
    pub max: u64,
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `m`, merging with any intervals it overlaps
    /// (`catfs/mio/overlay/overlay.go`'s `Add`).
    pub fn add(&mut self, mut m: Modification) {
        let (min, max) = m.range();
        assert!(max >= min, "interval end must not precede its start");
        if max > self.max {
            self.max = max;
        }
        if self.intervals.is_empty() {
            self.intervals.push(m);
            return;
        }

        let min_idx = self.intervals.partition_point(|iv| iv.range().1 < min);
        let max_idx = self.intervals.partition_point(|iv| iv.range().0 < max);

        if min_idx >= self.intervals.len() {
            self.intervals.push(m);
            return;
        }
        if min_idx == max_idx {
            self.intervals.insert(min_idx, m);
            return;
        }
        for iv in self.intervals.drain(min_idx..max_idx) {
            m.merge(iv);
        }
        self.intervals.insert(min_idx, m);
    }

    /// Every interval intersecting `[start, end)`
    /// (`catfs/mio/overlay/overlay.go`'s `Overlays`).
    pub fn overlays(&self, start: u64, end: u64) -> &[Modification] {
        let lo = self.intervals.partition_point(|iv| iv.range().1 < start);
        let hi = self.intervals.partition_point(|iv| iv.range().0 < end);
        &self.intervals[lo..hi.max(lo)]
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

/// Wraps a read-only seekable stream, buffering writes in an
/// [`IntervalIndex`] and blending them back in on read (spec.md §4.K).
pub struct Layer<R: Read + Seek> {
    index: IntervalIndex,
    inner: R,
    pos: u64,
    file_size: Option<u64>,
}

impl<R: Read + Seek> Layer<R> {
    pub fn new(inner: R) -> Self {
        Self { index: IntervalIndex::new(), inner, pos: 0, file_size: None }
    }

    /// Fixes the layer's logical size, e.g. from a `File` node's recorded
    /// `size` (`catfs/mio/overlay/overlay.go`'s `SetSize`).
    pub fn set_size(&mut self, size: u64) {
        self.file_size = Some(size);
    }

    pub fn size(&self) -> Option<u64> {
        self.file_size
    }
}

impl<R: Read + Seek> Read for Layer<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let start = self.pos;
        let want_end = start + out.len() as u64;
        let end = match self.file_size {
            Some(size) => size.min(want_end),
            None => want_end,
        };
        if start >= end {
            return Ok(0);
        }
        let n = (end - start) as usize;
        let mut buf = vec![0u8; n];

        self.inner.seek(SeekFrom::Start(start))?;
        let mut filled = 0usize;
        while filled < n {
            match self.inner.read(&mut buf[filled..])? {
                0 => break,
                k => filled += k,
            }
        }

        for modi in self.index.overlays(start, end) {
            let (m_min, m_max) = modi.range();
            let ov_start = m_min.max(start);
            let ov_end = m_max.min(end);
            if ov_start >= ov_end {
                continue;
            }
            let dst_off = (ov_start - start) as usize;
            let src_off = (ov_start - m_min) as usize;
            let len = (ov_end - ov_start) as usize;
            buf[dst_off..dst_off + len].copy_from_slice(&modi.data[src_off..src_off + len]);
        }

        out[..n].copy_from_slice(&buf);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Write for Layer<R> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let modi = Modification::new(self.pos, buf.to_vec());
        let (_, end) = modi.range();
        self.index.add(modi);
        self.pos += buf.len() as u64;
        self.file_size = Some(self.file_size.map_or(end, |size| size.max(end)));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<R: Read + Seek> Seek for Layer<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => (self.pos as i64 + delta).max(0) as u64,
            SeekFrom::End(delta) => {
                let base = self.file_size.unwrap_or(self.index.max);
                (base as i64 + delta).max(0) as u64
            }
        };
        self.pos = new_pos;
        Ok(new_pos)
    }
}
