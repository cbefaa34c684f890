//! Conversion sources.
//!
//! A source is any flat byte image with a known size that supports
//! positioned reads. Raw image files are memory-mapped so that
//! conversion workers can read disjoint blocks concurrently.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, Result};

/// A flat disk image that can be read at arbitrary offsets.
pub trait ImageReader: Sync {
    /// Size of the image in bytes.
    fn size(&self) -> u64;

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the range extends past the end of
    /// the image.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Path of the backing file, if any.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Whether `len` bytes at `offset` are known to be zero without
    /// reading them. Conversion skips such blocks outright.
    fn is_zero_range(&self, _offset: u64, _len: u64) -> bool {
        false
    }
}

fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange {
            offset,
            len: len as u64,
            size,
        }),
    }
}

/// A memory-mapped raw image file.
///
/// # Example
///
/// ```no_run
/// use vhdtool_core::source::{ImageReader, RawImage};
/// use std::path::Path;
///
/// let image = RawImage::open(Path::new("disk.img")).unwrap();
/// let first_sector = image.read_at(0, 512).unwrap();
/// assert_eq!(first_sector.len(), 512);
/// ```
pub struct RawImage {
    /// `None` for empty files, which cannot be mapped.
    mmap: Option<Mmap>,
    size: u64,
    path: PathBuf,
}

impl RawImage {
    /// Opens and maps a raw image file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        let mmap = if size == 0 {
            None
        } else {
            // Safety: the map is read-only. The file must not be truncated
            // by another process while the image is open.
            Some(unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? })
        };

        tracing::debug!(path = %path.display(), size, "opened raw image");
        Ok(Self {
            mmap,
            size,
            path: path.to_path_buf(),
        })
    }

    /// Direct access to the mapped bytes.
    pub fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl ImageReader for RawImage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size)?;
        let start = offset as usize;
        Ok(self.data()[start..start + len].to_vec())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// An in-memory image, mostly useful for tests and small payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage(Vec<u8>);

impl MemoryImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for MemoryImage {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl ImageReader for MemoryImage {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size())?;
        let start = offset as usize;
        Ok(self.0[start..start + len].to_vec())
    }
}

/// An image of a given size that reads as all zeros.
///
/// Backs blank disk creation without holding the disk in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroImage {
    size: u64,
}

impl ZeroImage {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl ImageReader for ZeroImage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.size)?;
        Ok(vec![0u8; len])
    }

    fn is_zero_range(&self, _offset: u64, _len: u64) -> bool {
        true
    }
}
