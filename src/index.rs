//! Dense block index
//!
//! Maps linearised grid coordinates to `(file_id, offset, nbytes)`
//! locations. The grid is fixed at creation, so the index is a dense
//! array rather than a map: O(1) lookup on the read hot path and a
//! trivially flat serialisation.

use crate::error::{Error, Result};

/// Serialized size of one index entry
pub const ENTRY_SIZE: usize = 14;

/// Location of one encoded block inside a block file.
///
/// `nbytes == 0` means the block was never written; readers treat it as
/// the absent sentinel, not as a zero-length block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_id: u16,
    pub offset: u64,
    pub nbytes: u32,
}

impl IndexEntry {
    pub const ABSENT: Self = Self {
        file_id: 0,
        offset: 0,
        nbytes: 0,
    };

    pub fn new(file_id: u16, offset: u64, nbytes: u32) -> Self {
        Self {
            file_id,
            offset,
            nbytes,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.nbytes == 0
    }

    /// Byte after the last byte of this block in its file
    pub fn end(&self) -> u64 {
        self.offset + self.nbytes as u64
    }
}

/// The in-memory index: one entry per grid cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
}

impl BlockIndex {
    /// An all-absent index for a grid of `cell_count` cells.
    pub fn new(cell_count: u64) -> Self {
        Self {
            entries: vec![IndexEntry::ABSENT; cell_count as usize],
        }
    }

    /// Number of grid cells
    pub fn cell_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Look up a cell; `None` when the block was never written.
    pub fn get(&self, idx: u64) -> Option<IndexEntry> {
        let entry = self.entries[idx as usize];
        if entry.is_absent() {
            None
        } else {
            Some(entry)
        }
    }

    /// Commit an entry into an empty cell.
    ///
    /// Returns `false` and leaves the cell untouched when it is already
    /// populated; blocks are written at most once, so the first entry
    /// always stands.
    pub fn put(&mut self, idx: u64, entry: IndexEntry) -> bool {
        debug_assert!(!entry.is_absent(), "committed entry must have nbytes > 0");
        let cell = &mut self.entries[idx as usize];
        if !cell.is_absent() {
            return false;
        }
        *cell = entry;
        true
    }

    /// Number of populated cells
    pub fn written_count(&self) -> u64 {
        self.entries.iter().filter(|e| !e.is_absent()).count() as u64
    }

    /// Highest advertised `offset + nbytes` per block file.
    ///
    /// Anything past these ends is undefined and gets truncated away at
    /// open.
    pub fn file_extents(&self, n_files: u16) -> Vec<u64> {
        let mut extents = vec![0u64; n_files as usize];
        for entry in &self.entries {
            if entry.is_absent() {
                continue;
            }
            let end = entry.end();
            let slot = &mut extents[entry.file_id as usize];
            if end > *slot {
                *slot = end;
            }
        }
        extents
    }

    /// Serialise every entry in linear order, 14 bytes each, little-endian.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.entries.len() * ENTRY_SIZE);
        for entry in &self.entries {
            buf.extend_from_slice(&entry.file_id.to_le_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&entry.nbytes.to_le_bytes());
        }
    }

    /// Parse a serialised index of exactly `cell_count` entries.
    pub fn decode(bytes: &[u8], cell_count: u64) -> Result<Self> {
        let expected = cell_count as usize * ENTRY_SIZE;
        if bytes.len() != expected {
            return Err(Error::Format(format!(
                "index section is {} bytes, expected {}",
                bytes.len(),
                expected
            )));
        }
        let mut entries = Vec::with_capacity(cell_count as usize);
        for chunk in bytes.chunks_exact(ENTRY_SIZE) {
            entries.push(IndexEntry {
                file_id: u16::from_le_bytes(chunk[0..2].try_into().unwrap()),
                offset: u64::from_le_bytes(chunk[2..10].try_into().unwrap()),
                nbytes: u32::from_le_bytes(chunk[10..14].try_into().unwrap()),
            });
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_index_is_all_absent() {
        let index = BlockIndex::new(8);
        assert_eq!(index.cell_count(), 8);
        assert_eq!(index.written_count(), 0);
        for idx in 0..8 {
            assert!(index.get(idx).is_none());
        }
    }

    #[test]
    fn test_put_then_get() {
        let mut index = BlockIndex::new(4);
        let entry = IndexEntry::new(1, 128, 64);
        assert!(index.put(2, entry));
        assert_eq!(index.get(2), Some(entry));
        assert_eq!(index.written_count(), 1);
    }

    #[test]
    fn test_put_refuses_populated_cell() {
        let mut index = BlockIndex::new(4);
        let first = IndexEntry::new(0, 0, 10);
        let second = IndexEntry::new(1, 50, 20);
        assert!(index.put(0, first));
        assert!(!index.put(0, second));
        assert_eq!(index.get(0), Some(first));
    }

    #[test]
    fn test_offset_zero_entry_is_present() {
        // The very first append to file 0 lands at offset 0; only
        // nbytes == 0 means absent.
        let mut index = BlockIndex::new(2);
        assert!(index.put(0, IndexEntry::new(0, 0, 32)));
        assert!(index.get(0).is_some());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut index = BlockIndex::new(6);
        index.put(1, IndexEntry::new(0, 0, 100));
        index.put(3, IndexEntry::new(2, 4096, 555));
        index.put(5, IndexEntry::new(1, u64::MAX - 1000, 1));

        let mut buf = Vec::new();
        index.encode_into(&mut buf);
        assert_eq!(buf.len(), 6 * ENTRY_SIZE);

        let decoded = BlockIndex::decode(&buf, 6).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let buf = vec![0u8; 5 * ENTRY_SIZE];
        assert!(matches!(
            BlockIndex::decode(&buf, 6),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_file_extents() {
        let mut index = BlockIndex::new(8);
        index.put(0, IndexEntry::new(0, 0, 100));
        index.put(1, IndexEntry::new(0, 100, 50));
        index.put(2, IndexEntry::new(1, 0, 10));
        let extents = index.file_extents(3);
        assert_eq!(extents, vec![150, 10, 0]);
    }
}
