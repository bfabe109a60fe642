//! Event-id index for the queryable mode: maps a row number to the DATA
//! packet that holds it.

use crate::error::{CodecError, Result};
use crate::varint::{put_uvarint, uvarint, uvarint_len};

pub const INDEX_MAGIC: &[u8; 4] = b"USCI";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub first_row: u64,
    pub row_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventIndex {
    entries: Vec<IndexEntry>,
}

impl EventIndex {
    /// Builds the index from per-window row counts in emission order.
    pub fn from_window_sizes<I: IntoIterator<Item = usize>>(sizes: I) -> Self {
        let mut entries = Vec::new();
        let mut first_row = 0u64;
        for size in sizes {
            entries.push(IndexEntry {
                first_row,
                row_count: size as u64,
            });
            first_row += size as u64;
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn total_rows(&self) -> u64 {
        self.entries
            .last()
            .map_or(0, |e| e.first_row + e.row_count)
    }

    /// Index of the DATA packet containing `event` (0-based row number).
    pub fn locate(&self, event: u64) -> Option<usize> {
        let i = self
            .entries
            .partition_point(|e| e.first_row + e.row_count <= event);
        let entry = self.entries.get(i)?;
        (event >= entry.first_row).then_some(i)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(INDEX_MAGIC);
        out.push(crate::packet::WIRE_VERSION);
        put_uvarint(&mut out, self.entries.len() as u64);
        for e in &self.entries {
            put_uvarint(&mut out, e.first_row);
            put_uvarint(&mut out, e.row_count);
        }
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        if buf.len() < 5 || &buf[..4] != INDEX_MAGIC {
            return Err(CodecError::malformed(0, 0, "bad index magic"));
        }
        if buf[4] != crate::packet::WIRE_VERSION {
            return Err(CodecError::VersionUnsupported(buf[4]));
        }
        pos += 5;
        let count = uvarint_len(buf, &mut pos)?;
        let mut entries = Vec::new();
        let mut expect_first = 0u64;
        for _ in 0..count {
            let first_row = uvarint(buf, &mut pos)?;
            let row_count = uvarint(buf, &mut pos)?;
            if first_row != expect_first {
                return Err(CodecError::malformed(pos, 0, "index entries not contiguous"));
            }
            expect_first = first_row + row_count;
            entries.push(IndexEntry {
                first_row,
                row_count,
            });
        }
        if pos != buf.len() {
            return Err(CodecError::malformed(pos, 0, "trailing bytes in index packet"));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_spans_windows() {
        let idx = EventIndex::from_window_sizes([25, 25, 10]);
        assert_eq!(idx.locate(0), Some(0));
        assert_eq!(idx.locate(24), Some(0));
        assert_eq!(idx.locate(25), Some(1));
        assert_eq!(idx.locate(59), Some(2));
        assert_eq!(idx.locate(60), None);
        assert_eq!(idx.total_rows(), 60);
    }

    #[test]
    fn wire_roundtrip() {
        let idx = EventIndex::from_window_sizes([3, 3, 1]);
        let parsed = EventIndex::parse(&idx.encode()).unwrap();
        assert_eq!(parsed, idx);
    }

    #[test]
    fn non_contiguous_rejected() {
        let mut bytes = EventIndex::from_window_sizes([2, 2]).encode();
        // Corrupt the second entry's first_row varint (2 -> 3).
        let p = bytes.len() - 3;
        bytes[p] = 3;
        assert!(EventIndex::parse(&bytes).is_err());
    }
}
