//! Reading existing VHD files.
//!
//! [`VhdFile`] validates the container on open and then serves block and
//! byte-range reads of the virtual disk. Dynamic and fixed disks are
//! supported; differencing disks are rejected.
//!
//! # Example
//!
//! ```no_run
//! use vhdtool_core::image::VhdFile;
//! use std::fs::File;
//! use std::path::Path;
//!
//! let mut vhd = VhdFile::open(Path::new("disk.vhd")).unwrap();
//! println!("{}", vhd.footer());
//! let mut out = File::create("disk.img").unwrap();
//! vhd.write_raw(&mut out).unwrap();
//! ```

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::bat::BlockAllocationTable;
use crate::error::{Error, FormatError, Result};
use crate::footer::{DiskType, Footer, FOOTER_SIZE};
use crate::header::{table_entries_for, DynamicHeader, DEFAULT_BLOCK_SIZE, HEADER_SIZE};
use crate::store::{block_span, SparseBlockStore};
use crate::SECTOR_SIZE;

/// Layout-specific state.
enum Layout<R> {
    /// Flat data at the start of the file.
    Fixed { reader: R },
    /// Blocks addressed through the allocation table.
    Dynamic {
        header: DynamicHeader,
        store: SparseBlockStore<R>,
    },
}

/// An open VHD container.
pub struct VhdFile<R> {
    layout: Layout<R>,
    footer: Footer,
    file_size: u64,
    path: Option<PathBuf>,
    /// Most recently read block, reused by byte-range reads.
    cached: Option<(u32, Vec<u8>)>,
}

impl VhdFile<BufReader<File>> {
    /// Opens and validates the VHD at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, if any structure fails
    /// to decode, or if the structures are inconsistent with each other or
    /// with the file length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let mut vhd = Self::from_reader(BufReader::new(file)).map_err(|e| e.with_path(path))?;
        vhd.path = Some(path.to_path_buf());
        tracing::debug!(
            path = %path.display(),
            disk_type = %vhd.disk_type(),
            capacity = vhd.capacity(),
            "opened VHD"
        );
        Ok(vhd)
    }
}

fn read_exact_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
    operation: &'static str,
) -> Result<()> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io_at(e, operation, offset))?;
    reader
        .read_exact(buf)
        .map_err(|e| Error::io_at(e, operation, offset))
}

/// Every allocated block must sit between the metadata and the trailing
/// footer, and no two blocks may share bytes.
fn check_block_bounds(
    bat: &BlockAllocationTable,
    span: u64,
    metadata_end: u64,
    footer_offset: u64,
) -> Result<()> {
    let mut starts: Vec<(u64, u32)> = bat
        .allocated()
        .map(|(index, sector)| (sector as u64 * SECTOR_SIZE, index))
        .collect();

    for &(start, index) in &starts {
        if start < metadata_end {
            return Err(FormatError::inconsistent(format!(
                "block {} at byte {} overlaps metadata ending at {}",
                index, start, metadata_end
            ))
            .into());
        }
        if start + span > footer_offset {
            return Err(FormatError::inconsistent(format!(
                "block {} at sector {} extends past the trailing footer",
                index,
                start / SECTOR_SIZE
            ))
            .into());
        }
    }

    starts.sort_unstable();
    if let Some(pair) = starts.windows(2).find(|pair| pair[0].0 + span > pair[1].0) {
        return Err(FormatError::inconsistent(format!(
            "blocks {} and {} overlap",
            pair[0].1, pair[1].1
        ))
        .into());
    }
    Ok(())
}

impl<R: Read + Seek> VhdFile<R> {
    /// Validates a VHD container held by `reader`.
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let file_size = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::io_op(e, "determine file size"))?;
        if file_size < FOOTER_SIZE as u64 {
            return Err(FormatError::inconsistent(format!(
                "file is {} bytes, too small to hold a footer",
                file_size
            ))
            .into());
        }

        let footer_offset = file_size - FOOTER_SIZE as u64;
        let mut footer_bytes = [0u8; FOOTER_SIZE];
        read_exact_at(&mut reader, footer_offset, &mut footer_bytes, "read footer")?;
        let footer = Footer::decode(&footer_bytes)?;
        if footer.current_size % SECTOR_SIZE != 0 {
            return Err(FormatError::inconsistent(format!(
                "disk size {} is not a multiple of {}",
                footer.current_size, SECTOR_SIZE
            ))
            .into());
        }

        let layout = match footer.disk_type {
            DiskType::Fixed => {
                if footer.current_size > footer_offset {
                    return Err(FormatError::inconsistent(format!(
                        "fixed disk of {} bytes does not fit in a {} byte file",
                        footer.current_size, file_size
                    ))
                    .into());
                }
                Layout::Fixed { reader }
            }
            DiskType::Dynamic => Self::open_dynamic(reader, &footer, &footer_bytes, footer_offset)?,
            other => return Err(FormatError::UnsupportedDiskType(other).into()),
        };

        Ok(Self {
            layout,
            footer,
            file_size,
            path: None,
            cached: None,
        })
    }

    fn open_dynamic(
        mut reader: R,
        footer: &Footer,
        footer_bytes: &[u8; FOOTER_SIZE],
        footer_offset: u64,
    ) -> Result<Layout<R>> {
        let header_offset = footer.data_offset;
        if header_offset
            .checked_add(HEADER_SIZE as u64)
            .map_or(true, |end| end > footer_offset)
        {
            return Err(FormatError::inconsistent(format!(
                "dynamic header offset {} lies outside the file",
                header_offset
            ))
            .into());
        }

        // Leading footer copy, when the header leaves room for one.
        if header_offset >= FOOTER_SIZE as u64 {
            let mut leading = [0u8; FOOTER_SIZE];
            read_exact_at(&mut reader, 0, &mut leading, "read leading footer")?;
            if &leading != footer_bytes {
                return Err(FormatError::inconsistent(
                    "leading footer copy differs from trailing footer",
                )
                .into());
            }
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        read_exact_at(&mut reader, header_offset, &mut header_bytes, "read dynamic header")?;
        let header = DynamicHeader::decode(&header_bytes)?;

        let needed = table_entries_for(footer.current_size, header.block_size);
        if header.max_table_entries < needed {
            return Err(FormatError::inconsistent(format!(
                "allocation table has {} entries, {} needed for {} bytes",
                header.max_table_entries, needed, footer.current_size
            ))
            .into());
        }

        let table_size = header.table_size();
        if header
            .table_offset
            .checked_add(table_size)
            .map_or(true, |end| end > footer_offset)
        {
            return Err(FormatError::inconsistent(format!(
                "allocation table at {} ({} bytes) lies outside the file",
                header.table_offset, table_size
            ))
            .into());
        }

        let mut table = vec![0u8; table_size as usize];
        read_exact_at(&mut reader, header.table_offset, &mut table, "read block allocation table")?;
        let span = block_span(header.block_size);
        let bat = BlockAllocationTable::decode(
            &table,
            header.max_table_entries,
            span,
            header.table_offset + table_size,
        )?;

        let metadata_end = (header_offset + HEADER_SIZE as u64)
            .max(header.table_offset + table_size)
            .max(FOOTER_SIZE as u64);
        check_block_bounds(&bat, span, metadata_end, footer_offset)?;

        let block_size = header.block_size;
        Ok(Layout::Dynamic {
            header,
            store: SparseBlockStore::new(reader, bat, block_size),
        })
    }

    /// The footer.
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// The dynamic header, for dynamic disks.
    pub fn header(&self) -> Option<&DynamicHeader> {
        match &self.layout {
            Layout::Dynamic { header, .. } => Some(header),
            Layout::Fixed { .. } => None,
        }
    }

    /// The block allocation table, for dynamic disks.
    pub fn bat(&self) -> Option<&BlockAllocationTable> {
        match &self.layout {
            Layout::Dynamic { store, .. } => Some(store.bat()),
            Layout::Fixed { .. } => None,
        }
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    /// Virtual disk size in bytes.
    pub fn capacity(&self) -> u64 {
        self.footer.current_size
    }

    /// Size of the container file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Path the file was opened from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Block size in bytes.
    ///
    /// Fixed disks have no blocks on disk; they are read in units of the
    /// default dynamic block size.
    pub fn block_size(&self) -> u32 {
        match &self.layout {
            Layout::Dynamic { header, .. } => header.block_size,
            Layout::Fixed { .. } => DEFAULT_BLOCK_SIZE,
        }
    }

    /// Number of blocks covering the virtual disk.
    pub fn block_count(&self) -> u32 {
        match &self.layout {
            Layout::Dynamic { store, .. } => store.bat().len(),
            Layout::Fixed { .. } => table_entries_for(self.capacity(), DEFAULT_BLOCK_SIZE),
        }
    }

    /// Number of blocks with storage. Every block of a fixed disk counts.
    pub fn allocated_blocks(&self) -> u32 {
        match &self.layout {
            Layout::Dynamic { store, .. } => store.bat().allocated_count(),
            Layout::Fixed { .. } => self.block_count(),
        }
    }

    /// Reads one full block. Unallocated blocks read as zeros.
    pub fn read_block(&mut self, index: u32) -> Result<Vec<u8>> {
        let count = self.block_count();
        if index >= count {
            return Err(Error::IndexOutOfRange { index, len: count });
        }

        let block_size = self.block_size();
        let capacity = self.capacity();
        match &mut self.layout {
            Layout::Dynamic { store, .. } => store.read_block(index),
            Layout::Fixed { reader } => {
                let offset = index as u64 * block_size as u64;
                let len = (capacity - offset).min(block_size as u64) as usize;
                let mut block = vec![0u8; block_size as usize];
                read_exact_at(reader, offset, &mut block[..len], "read disk data")?;
                Ok(block)
            }
        }
    }

    /// Reads virtual disk bytes starting at `offset` into `buf`.
    ///
    /// Reads stop at the end of the virtual disk. Returns the number of
    /// bytes read, which is 0 at or past the end.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let capacity = self.capacity();
        if offset >= capacity {
            return Ok(0);
        }
        let len = (capacity - offset).min(buf.len() as u64) as usize;
        let block_size = self.block_size() as u64;

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let index = (pos / block_size) as u32;
            let within = (pos % block_size) as usize;
            let take = (len - done).min(block_size as usize - within);

            let block = self.cached_block(index)?;
            buf[done..done + take].copy_from_slice(&block[within..within + take]);
            done += take;
        }
        Ok(len)
    }

    fn cached_block(&mut self, index: u32) -> Result<&[u8]> {
        let block = match self.cached.take() {
            Some((cached, block)) if cached == index => block,
            _ => self.read_block(index)?,
        };
        let (_, block) = self.cached.insert((index, block));
        Ok(block)
    }

    /// Writes the whole virtual disk to `writer` as a raw image.
    ///
    /// Returns the number of bytes written, which equals `capacity()`.
    pub fn write_raw<W: Write>(&mut self, writer: &mut W) -> Result<u64> {
        let capacity = self.capacity();
        let block_size = self.block_size() as u64;
        let mut written = 0u64;

        for index in 0..self.block_count() {
            let block = self.read_block(index)?;
            let len = (capacity - written).min(block_size) as usize;
            writer
                .write_all(&block[..len])
                .map_err(|e| Error::io_at(e, "write raw image", written))?;
            written += len as u64;
        }

        tracing::debug!(bytes = written, "materialized virtual disk");
        Ok(written)
    }

    /// Consumes the image, returning the underlying reader.
    pub fn into_inner(self) -> R {
        match self.layout {
            Layout::Fixed { reader } => reader,
            Layout::Dynamic { store, .. } => store.into_parts().0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{convert_to_writer, ConvertOptions};
    use crate::source::MemoryImage;
    use std::io::Cursor;

    fn dynamic_bytes(data: Vec<u8>) -> Vec<u8> {
        let options = ConvertOptions {
            block_size: 4096,
            ..ConvertOptions::default()
        };
        let mut out = Cursor::new(Vec::new());
        convert_to_writer(&MemoryImage::new(data), &mut out, &options, None).unwrap();
        out.into_inner()
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_open_dynamic() {
        let vhd = VhdFile::from_reader(Cursor::new(dynamic_bytes(patterned(10_240)))).unwrap();
        assert_eq!(vhd.disk_type(), DiskType::Dynamic);
        assert_eq!(vhd.capacity(), 10_240);
        assert_eq!(vhd.block_size(), 4096);
        assert_eq!(vhd.block_count(), 3);
        assert_eq!(vhd.allocated_blocks(), 3);
        assert!(vhd.header().is_some());
    }

    #[test]
    fn test_read_at_spans_blocks() {
        let data = patterned(10_240);
        let mut vhd = VhdFile::from_reader(Cursor::new(dynamic_bytes(data.clone()))).unwrap();

        let mut buf = vec![0u8; 5000];
        assert_eq!(vhd.read_at(3000, &mut buf).unwrap(), 5000);
        assert_eq!(&buf[..], &data[3000..8000]);
    }

    #[test]
    fn test_read_at_clamps_to_capacity() {
        let data = patterned(10_240);
        let mut vhd = VhdFile::from_reader(Cursor::new(dynamic_bytes(data.clone()))).unwrap();

        let mut buf = vec![0xEEu8; 1000];
        assert_eq!(vhd.read_at(10_000, &mut buf).unwrap(), 240);
        assert_eq!(&buf[..240], &data[10_000..]);
        assert!(buf[240..].iter().all(|&b| b == 0xEE));
        assert_eq!(vhd.read_at(10_240, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_block_out_of_range() {
        let mut vhd = VhdFile::from_reader(Cursor::new(dynamic_bytes(patterned(4096)))).unwrap();
        assert!(matches!(
            vhd.read_block(1),
            Err(Error::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_write_raw_round_trip() {
        let mut data = patterned(12_288);
        data[4096..8192].fill(0);
        let mut vhd = VhdFile::from_reader(Cursor::new(dynamic_bytes(data.clone()))).unwrap();
        assert_eq!(vhd.allocated_blocks(), 2);

        let mut out = Vec::new();
        assert_eq!(vhd.write_raw(&mut out).unwrap(), 12_288);
        assert_eq!(out, data);
    }

    #[test]
    fn test_mismatched_leading_footer() {
        let mut bytes = dynamic_bytes(patterned(4096));
        // Flip a byte in the leading copy's reserved area.
        bytes[200] ^= 0x01;
        let result = VhdFile::from_reader(Cursor::new(bytes));
        assert!(matches!(result, Err(Error::Format(FormatError::Inconsistent(_)))));
    }

    #[test]
    fn test_truncated_file() {
        let result = VhdFile::from_reader(Cursor::new(vec![0u8; 100]));
        assert!(matches!(result, Err(Error::Format(FormatError::Inconsistent(_)))));
    }

    #[test]
    fn test_block_past_footer() {
        let mut bytes = dynamic_bytes(patterned(4096));
        // Point block 0 far beyond the end of the file.
        bytes[1536..1540].copy_from_slice(&[0, 0, 0x10, 0]);
        let result = VhdFile::from_reader(Cursor::new(bytes));
        assert!(matches!(result, Err(Error::Format(FormatError::Inconsistent(_)))));
    }

    #[test]
    fn test_block_inside_metadata() {
        let mut bytes = dynamic_bytes(vec![0x11; 4096]);
        // Sector 0 is the leading footer; sector 3 is the BAT.
        for sector in [0u8, 1, 3] {
            bytes[1536..1540].copy_from_slice(&[0, 0, 0, sector]);
            let result = VhdFile::from_reader(Cursor::new(bytes.clone()));
            assert!(
                matches!(result, Err(Error::Format(FormatError::Inconsistent(ref msg))) if msg.contains("metadata")),
                "sector {} should be rejected",
                sector
            );
        }
    }

    #[test]
    fn test_overlapping_blocks() {
        let mut bytes = dynamic_bytes(vec![0x22; 8192]);
        assert_eq!(&bytes[1536..1544], &[0, 0, 0, 4, 0, 0, 0, 13]);

        // Same start as block 0.
        bytes[1540..1544].copy_from_slice(&[0, 0, 0, 4]);
        let result = VhdFile::from_reader(Cursor::new(bytes.clone()));
        assert!(matches!(result, Err(Error::Format(FormatError::Inconsistent(ref msg))) if msg.contains("overlap")));

        // Starts inside block 0.
        bytes[1540..1544].copy_from_slice(&[0, 0, 0, 8]);
        let result = VhdFile::from_reader(Cursor::new(bytes));
        assert!(matches!(result, Err(Error::Format(FormatError::Inconsistent(ref msg))) if msg.contains("overlap")));
    }

    #[test]
    fn test_unaligned_disk_size() {
        let mut bytes = vec![0u8; 1024];
        bytes.extend_from_slice(&Footer::new_fixed(1000).encode());
        let result = VhdFile::from_reader(Cursor::new(bytes));
        assert!(matches!(result, Err(Error::Format(FormatError::Inconsistent(_)))));
    }

    #[test]
    fn test_fixed_disk() {
        let data = patterned(2048);
        let mut out = Cursor::new(Vec::new());
        convert_to_writer(&MemoryImage::new(data.clone()), &mut out, &ConvertOptions::fixed(), None)
            .unwrap();

        let mut vhd = VhdFile::from_reader(Cursor::new(out.into_inner())).unwrap();
        assert_eq!(vhd.disk_type(), DiskType::Fixed);
        assert!(vhd.header().is_none());
        assert_eq!(vhd.block_count(), 1);

        let mut raw = Vec::new();
        vhd.write_raw(&mut raw).unwrap();
        assert_eq!(raw, data);
    }

    #[test]
    fn test_differencing_rejected() {
        let mut footer = Footer::new_dynamic(4096, 512);
        footer.disk_type = DiskType::Differencing;
        let result = VhdFile::from_reader(Cursor::new(footer.encode().to_vec()));
        assert!(matches!(
            result,
            Err(Error::Format(FormatError::UnsupportedDiskType(DiskType::Differencing)))
        ));
    }
}
