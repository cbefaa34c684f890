//! Sparse block store for dynamic disks.
//!
//! Each allocated block is laid out as a sector bitmap (one bit per
//! 512-byte payload sector, most significant bit first, padded to a whole
//! sector) followed by the payload. Blocks whose payload is entirely zero
//! are never allocated; reading them yields zeros.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::bat::BlockAllocationTable;
use crate::codec::align_up;
use crate::error::{Error, Result};
use crate::SECTOR_SIZE;

/// Size of the sector bitmap that precedes each block, padded to a sector.
pub fn bitmap_size(block_size: u32) -> u64 {
    let sectors = (block_size as u64).div_ceil(SECTOR_SIZE);
    align_up(sectors.div_ceil(8), SECTOR_SIZE)
}

/// Bytes one allocated block occupies on disk.
pub fn block_span(block_size: u32) -> u64 {
    bitmap_size(block_size) + block_size as u64
}

/// Whether `sector` is marked present in a block bitmap.
pub fn sector_present(bitmap: &[u8], sector: usize) -> bool {
    bitmap
        .get(sector / 8)
        .is_some_and(|byte| byte & (0x80 >> (sector % 8)) != 0)
}

/// Whether every byte of a block is zero.
pub fn is_zero_block(payload: &[u8]) -> bool {
    // Compare in word-sized chunks; the tail is handled bytewise.
    let mut chunks = payload.chunks_exact(8);
    chunks.all(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) == 0)
        && chunks.remainder().iter().all(|&b| b == 0)
}

/// Reads and writes whole data blocks through a block allocation table.
pub struct SparseBlockStore<F> {
    file: F,
    bat: BlockAllocationTable,
    block_size: u32,
    /// All-present bitmap written in front of every allocated block.
    full_bitmap: Vec<u8>,
}

impl<F> SparseBlockStore<F> {
    /// Creates a store over `file` using `bat` for block placement.
    pub fn new(file: F, bat: BlockAllocationTable, block_size: u32) -> Self {
        Self {
            file,
            bat,
            block_size,
            full_bitmap: vec![0xFF; bitmap_size(block_size) as usize],
        }
    }

    /// The block allocation table.
    pub fn bat(&self) -> &BlockAllocationTable {
        &self.bat
    }

    /// Payload size of one block in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Mutable access to the underlying file.
    pub fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }

    /// Consumes the store, returning the file and the table.
    pub fn into_parts(self) -> (F, BlockAllocationTable) {
        (self.file, self.bat)
    }

    fn check_payload(&self, len: usize) -> Result<()> {
        if len != self.block_size as usize {
            return Err(Error::InvalidPayload {
                expected: self.block_size as usize,
                actual: len,
            });
        }
        Ok(())
    }
}

impl<F: Write + Seek> SparseBlockStore<F> {
    /// Writes block `index`, skipping it entirely if the payload is all zero.
    ///
    /// Returns the sector the block was placed at, or `None` if it was
    /// left unallocated.
    pub fn write_block(&mut self, index: u32, payload: &[u8]) -> Result<Option<u32>> {
        self.check_payload(payload.len())?;
        if is_zero_block(payload) {
            // Still validate the index so callers see out-of-range errors.
            self.bat.lookup(index)?;
            return Ok(None);
        }
        self.write_allocated_block(index, payload).map(Some)
    }

    /// Allocates block `index` and writes it without checking for zeros.
    fn write_allocated_block(&mut self, index: u32, payload: &[u8]) -> Result<u32> {
        self.check_payload(payload.len())?;
        let sector = self.bat.allocate(index)?;
        let offset = sector as u64 * SECTOR_SIZE;

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io_at(e, "seek to block", offset))?;
        self.file
            .write_all(&self.full_bitmap)
            .map_err(|e| Error::io_at(e, "write block bitmap", offset))?;

        let payload_offset = offset + self.full_bitmap.len() as u64;
        self.file
            .write_all(payload)
            .map_err(|e| Error::io_at(e, "write block payload", payload_offset))?;

        Ok(sector)
    }
}

impl<F: Read + Seek> SparseBlockStore<F> {
    /// Reads block `index`; unallocated blocks read as zeros.
    pub fn read_block(&mut self, index: u32) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; self.block_size as usize];
        self.read_block_into(index, &mut payload)?;
        Ok(payload)
    }

    /// Reads block `index` into `payload`.
    ///
    /// Sectors whose bitmap bit is clear read as zero. Returns whether the
    /// block is allocated.
    pub fn read_block_into(&mut self, index: u32, payload: &mut [u8]) -> Result<bool> {
        self.check_payload(payload.len())?;
        let Some(sector) = self.bat.lookup(index)? else {
            payload.fill(0);
            return Ok(false);
        };

        let offset = sector as u64 * SECTOR_SIZE;
        let mut bitmap = vec![0u8; self.full_bitmap.len()];
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io_at(e, "seek to block", offset))?;
        self.file
            .read_exact(&mut bitmap)
            .map_err(|e| Error::io_at(e, "read block bitmap", offset))?;

        let payload_offset = offset + bitmap.len() as u64;
        self.file
            .read_exact(payload)
            .map_err(|e| Error::io_at(e, "read block payload", payload_offset))?;

        for (sector, data) in payload.chunks_mut(SECTOR_SIZE as usize).enumerate() {
            if !sector_present(&bitmap, sector) {
                data.fill(0);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BLOCK: u32 = 4096;

    fn store(entries: u32) -> SparseBlockStore<Cursor<Vec<u8>>> {
        let bat = BlockAllocationTable::new(entries, block_span(BLOCK), 2048);
        SparseBlockStore::new(Cursor::new(vec![0u8; 2048]), bat, BLOCK)
    }

    #[test]
    fn test_bitmap_size() {
        assert_eq!(bitmap_size(512), 512);
        assert_eq!(bitmap_size(4096), 512);
        assert_eq!(bitmap_size(0x20_0000), 512);
        // 2^31 / 512 = 4 Mi sectors -> 512 KiB bitmap
        assert_eq!(bitmap_size(1 << 31), 512 * 1024);
    }

    #[test]
    fn test_sector_present_is_msb_first() {
        let bitmap = [0b1000_0001u8, 0];
        assert!(sector_present(&bitmap, 0));
        assert!(!sector_present(&bitmap, 1));
        assert!(sector_present(&bitmap, 7));
        assert!(!sector_present(&bitmap, 8));
        assert!(!sector_present(&bitmap, 100));
    }

    #[test]
    fn test_is_zero_block() {
        assert!(is_zero_block(&[0u8; 4096]));
        assert!(is_zero_block(&[0u8; 13]));
        let mut data = vec![0u8; 4099];
        data[4098] = 1;
        assert!(!is_zero_block(&data));
        data[4098] = 0;
        data[5] = 1;
        assert!(!is_zero_block(&data));
    }

    #[test]
    fn test_zero_block_stays_unallocated() {
        let mut store = store(2);
        assert_eq!(store.write_block(0, &[0u8; BLOCK as usize]).unwrap(), None);
        assert_eq!(store.bat().allocated_count(), 0);
        assert_eq!(store.read_block(0).unwrap(), vec![0u8; BLOCK as usize]);
    }

    #[test]
    fn test_write_then_read_block() {
        let mut store = store(2);
        let payload: Vec<u8> = (0..BLOCK).map(|i| (i % 251) as u8).collect();
        let sector = store.write_block(1, &payload).unwrap();
        assert_eq!(sector, Some(4));
        assert_eq!(store.read_block(1).unwrap(), payload);
        assert_eq!(store.read_block(0).unwrap(), vec![0u8; BLOCK as usize]);

        let (file, _) = store.into_parts();
        let bytes = file.into_inner();
        assert_eq!(bytes.len(), 2048 + 512 + BLOCK as usize);
        assert!(bytes[2048..2560].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_cleared_bitmap_bits_read_as_zero() {
        let mut store = store(1);
        store.write_block(0, &[0xAB; BLOCK as usize]).unwrap();

        // Clear the bit for sector 1.
        let bitmap_offset = 2048usize;
        store.file_mut().get_mut()[bitmap_offset] = 0b1011_1111;

        let block = store.read_block(0).unwrap();
        assert!(block[..512].iter().all(|&b| b == 0xAB));
        assert!(block[512..1024].iter().all(|&b| b == 0));
        assert!(block[1024..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_wrong_payload_size() {
        let mut store = store(1);
        assert!(matches!(
            store.write_block(0, &[1u8; 10]),
            Err(Error::InvalidPayload { expected: 4096, actual: 10 })
        ));
    }

    #[test]
    fn test_zero_block_out_of_range() {
        let mut store = store(1);
        assert!(matches!(
            store.write_block(3, &[0u8; BLOCK as usize]),
            Err(Error::IndexOutOfRange { index: 3, .. })
        ));
    }
}
