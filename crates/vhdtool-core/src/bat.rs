//! Block allocation table.
//!
//! The BAT maps each logical block of a dynamic disk to the sector where
//! that block's bitmap and payload begin. Blocks are allocated append-only
//! at the current end of data; nothing is ever freed or moved.

use crate::codec::{align_up, decode_u32_be, encode_u32_be};
use crate::error::{Error, FormatError, Result};
use crate::SECTOR_SIZE;

/// On-disk value of an unallocated entry.
pub const UNALLOCATED: u32 = 0xFFFF_FFFF;

/// Size of the on-disk table for `entries` entries, padded to a whole sector.
pub fn table_size_for(entries: u32) -> u64 {
    align_up(entries as u64 * 4, SECTOR_SIZE)
}

/// In-memory block allocation table with its append-only allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocationTable {
    entries: Vec<Option<u32>>,
    /// Bytes occupied by one allocated block: bitmap plus payload.
    block_span: u64,
    /// Byte offset where the next block will be placed.
    next_free: u64,
}

impl BlockAllocationTable {
    /// Creates an empty table.
    ///
    /// `data_start` is the first byte after the metadata region; the first
    /// allocated block lands there (rounded up to a sector).
    pub fn new(entries: u32, block_span: u64, data_start: u64) -> Self {
        Self {
            entries: vec![None; entries as usize],
            block_span,
            next_free: data_start,
        }
    }

    /// Parses the on-disk table.
    ///
    /// The allocator resumes after the highest allocated block, or at
    /// `data_start` when nothing is allocated.
    pub fn decode(bytes: &[u8], entries: u32, block_span: u64, data_start: u64) -> Result<Self> {
        let needed = entries as usize * 4;
        if bytes.len() < needed {
            return Err(FormatError::inconsistent(format!(
                "block allocation table needs {} bytes, found {}",
                needed,
                bytes.len()
            ))
            .into());
        }

        let entries: Vec<Option<u32>> = bytes[..needed]
            .chunks_exact(4)
            .map(|raw| match decode_u32_be(raw) {
                UNALLOCATED => None,
                sector => Some(sector),
            })
            .collect();

        let next_free = entries
            .iter()
            .flatten()
            .map(|&sector| sector as u64 * SECTOR_SIZE + block_span)
            .max()
            .unwrap_or(0)
            .max(data_start);

        Ok(Self {
            entries,
            block_span,
            next_free,
        })
    }

    /// Serializes the table, padding the final sector with unallocated entries.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0xFFu8; table_size_for(self.len()) as usize];
        for (raw, entry) in buf.chunks_exact_mut(4).zip(&self.entries) {
            raw.copy_from_slice(&encode_u32_be(entry.unwrap_or(UNALLOCATED)));
        }
        buf
    }

    /// Number of entries.
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sector where block `index` starts, or `None` if it is unallocated.
    pub fn lookup(&self, index: u32) -> Result<Option<u32>> {
        self.entries
            .get(index as usize)
            .copied()
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.len(),
            })
    }

    /// Assigns block `index` the next free block span and returns its sector.
    pub fn allocate(&mut self, index: u32) -> Result<u32> {
        let len = self.len();
        let entry = self
            .entries
            .get_mut(index as usize)
            .ok_or(Error::IndexOutOfRange { index, len })?;
        if entry.is_some() {
            return Err(Error::BlockAlreadyAllocated { index });
        }

        let offset = align_up(self.next_free, SECTOR_SIZE);
        let sector = offset / SECTOR_SIZE;
        // The sentinel value itself is not addressable.
        if sector >= UNALLOCATED as u64 {
            return Err(Error::DiskTooLarge {
                size: offset + self.block_span,
                max: UNALLOCATED as u64 * SECTOR_SIZE,
            });
        }

        *entry = Some(sector as u32);
        self.next_free = offset + self.block_span;
        tracing::trace!(index, sector, "allocated block");
        Ok(sector as u32)
    }

    /// Byte offset just past the last allocated block.
    pub fn end_of_data(&self) -> u64 {
        align_up(self.next_free, SECTOR_SIZE)
    }

    /// Bytes occupied by one allocated block.
    pub fn block_span(&self) -> u64 {
        self.block_span
    }

    /// Number of allocated entries.
    pub fn allocated_count(&self) -> u32 {
        self.entries.iter().filter(|e| e.is_some()).count() as u32
    }

    /// Iterates over `(index, sector)` for allocated blocks in index order.
    pub fn allocated(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.map(|sector| (i as u32, sector)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPAN: u64 = 512 + 4096;

    #[test]
    fn test_new_table_is_unallocated() {
        let bat = BlockAllocationTable::new(3, SPAN, 2048);
        assert_eq!(bat.len(), 3);
        assert_eq!(bat.allocated_count(), 0);
        for i in 0..3 {
            assert_eq!(bat.lookup(i).unwrap(), None);
        }
    }

    #[test]
    fn test_allocation_is_monotonic() {
        let mut bat = BlockAllocationTable::new(4, SPAN, 2048);
        assert_eq!(bat.allocate(2).unwrap(), 4);
        assert_eq!(bat.allocate(0).unwrap(), 4 + 9);
        assert_eq!(bat.lookup(2).unwrap(), Some(4));
        assert_eq!(bat.lookup(0).unwrap(), Some(13));
        assert_eq!(bat.end_of_data(), 2048 + 2 * SPAN);
        assert_eq!(bat.allocated().collect::<Vec<_>>(), vec![(0, 13), (2, 4)]);
    }

    #[test]
    fn test_allocation_rounds_to_sector() {
        let mut bat = BlockAllocationTable::new(1, SPAN, 1000);
        assert_eq!(bat.allocate(0).unwrap(), 2);
    }

    #[test]
    fn test_out_of_range() {
        let mut bat = BlockAllocationTable::new(2, SPAN, 2048);
        assert!(matches!(
            bat.lookup(2),
            Err(Error::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert!(matches!(
            bat.allocate(5),
            Err(Error::IndexOutOfRange { index: 5, len: 2 })
        ));
    }

    #[test]
    fn test_double_allocation_rejected() {
        let mut bat = BlockAllocationTable::new(2, SPAN, 2048);
        bat.allocate(1).unwrap();
        assert!(matches!(
            bat.allocate(1),
            Err(Error::BlockAlreadyAllocated { index: 1 })
        ));
    }

    #[test]
    fn test_encode_pads_with_sentinel() {
        let mut bat = BlockAllocationTable::new(3, SPAN, 2048);
        bat.allocate(1).unwrap();
        let bytes = bat.encode();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[0..4], &[0xFF; 4]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 4]);
        assert!(bytes[8..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_decode_resumes_after_last_block() {
        let mut bat = BlockAllocationTable::new(3, SPAN, 2048);
        bat.allocate(0).unwrap();
        bat.allocate(2).unwrap();

        let decoded = BlockAllocationTable::decode(&bat.encode(), 3, SPAN, 2048).unwrap();
        assert_eq!(decoded, bat);
    }

    #[test]
    fn test_decode_short_table() {
        let result = BlockAllocationTable::decode(&[0xFF; 8], 3, SPAN, 2048);
        assert!(matches!(result, Err(Error::Format(FormatError::Inconsistent(_)))));
    }

    #[test]
    fn test_table_size_for() {
        assert_eq!(table_size_for(0), 0);
        assert_eq!(table_size_for(1), 512);
        assert_eq!(table_size_for(128), 512);
        assert_eq!(table_size_for(129), 1024);
    }
}
