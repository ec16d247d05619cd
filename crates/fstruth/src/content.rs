//! Expected file contents, modelled as logical extents.
//!
//! The builder never reads a file back to learn what it contains.  Instead
//! every write, append, truncation and clone is applied to a [`ContentModel`]
//! as well, and the expected size, fingerprint and data ranges are derived
//! from the model.

use sha2::{Digest, Sha256};

use crate::{object::ByteRange, pattern::Pattern, IO_CHUNK};

/// A run of pattern bytes at a fixed position in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
    pub pattern: Pattern,
    /// Offset into the pattern stream of the extent's first byte.
    pub pattern_offset: u64,
}

impl Extent {
    fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// The part of this extent inside `[start, end)`, if any.
    fn clip(&self, start: u64, end: u64) -> Option<Extent> {
        let from = self.offset.max(start);
        let to = self.end().min(end);
        (from < to).then(|| Extent {
            offset: from,
            len: to - from,
            pattern: self.pattern.clone(),
            pattern_offset: self.pattern_offset + (from - self.offset),
        })
    }
}

/// Logical content of a regular file.  Bytes outside every extent are holes
/// and read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentModel {
    size: u64,
    /// Sorted by offset, non-overlapping, never empty.
    extents: Vec<Extent>,
}

impl ContentModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Writes `len` pattern bytes at `offset`, overlaying whatever was there
    /// and extending the file if needed.
    pub fn write(&mut self, offset: u64, len: u64, pattern: &Pattern, pattern_offset: u64) {
        if len == 0 {
            return;
        }
        let end = offset + len;

        let mut extents = Vec::with_capacity(self.extents.len() + 2);
        for extent in self.extents.drain(..) {
            if extent.end() <= offset || extent.offset >= end {
                extents.push(extent);
                continue;
            }
            extents.extend(extent.clip(0, offset));
            extents.extend(extent.clip(end, u64::MAX));
        }
        extents.push(Extent {
            offset,
            len,
            pattern: pattern.clone(),
            pattern_offset,
        });
        extents.sort_by_key(|e| e.offset);

        self.extents = extents;
        self.size = self.size.max(end);
    }

    /// Appends `len` pattern bytes, starting the pattern from its beginning.
    pub fn append(&mut self, len: u64, pattern: &Pattern) {
        let size = self.size;
        self.write(size, len, pattern, 0);
    }

    /// Sets the file size.  Growing leaves a hole; shrinking drops data.
    pub fn truncate(&mut self, size: u64) {
        self.extents = self
            .extents
            .drain(..)
            .filter_map(|e| e.clip(0, size))
            .collect();
        self.size = size;
    }

    /// Fills `buf` with the expected bytes at `offset`.  Reads beyond the end
    /// of the file produce zeros.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) {
        buf.fill(0);
        let end = offset + buf.len() as u64;
        for extent in &self.extents {
            if extent.offset >= end {
                break;
            }
            if let Some(part) = extent.clip(offset, end) {
                let start = (part.offset - offset) as usize;
                let stop = start + part.len as usize;
                part.pattern.fill(part.pattern_offset, &mut buf[start..stop]);
            }
        }
    }

    /// Lowercase hex SHA-256 of the expected content.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; IO_CHUNK];
        let mut pos = 0;
        while pos < self.size {
            let n = (self.size - pos).min(IO_CHUNK as u64) as usize;
            self.read_at(pos, &mut buffer[..n]);
            hasher.update(&buffer[..n]);
            pos += n as u64;
        }
        hex::encode(hasher.finalize())
    }

    /// The logical ranges holding written data, adjacent extents merged.
    pub fn data_ranges(&self) -> Vec<ByteRange> {
        let mut ranges: Vec<ByteRange> = vec![];
        for extent in &self.extents {
            match ranges.last_mut() {
                Some(last) if last.end() == extent.offset => last.len += extent.len,
                _ => ranges.push(ByteRange {
                    offset: extent.offset,
                    len: extent.len,
                }),
            }
        }
        ranges
    }
}
