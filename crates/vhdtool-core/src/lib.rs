//! VHDTool Core Library
//!
//! This crate reads and writes Virtual Hard Disk (VHD) containers and
//! converts raw disk images into them.
//!
//! # Overview
//!
//! The main entry point is the [`convert`] function, which turns any
//! [`ImageReader`] into a dynamic (sparse) or fixed VHD. Blank disks are
//! made with [`create_dynamic`] and [`create_fixed`]. Existing containers
//! are opened with [`VhdFile::open`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`codec`] - Big-endian fields, ASCII tags and checksums
//! - [`footer`] - The 512-byte footer
//! - [`header`] - The 1024-byte dynamic disk header
//! - [`geometry`] - CHS geometry derivation
//! - [`identity`] - Disk ids and VHD timestamps
//! - [`bat`] - Block allocation table
//! - [`store`] - Sparse block store
//! - [`source`] - Conversion sources
//! - [`pipeline`] - Parallel block processing
//! - [`convert`] - Conversion orchestrator
//! - [`image`] - Reading existing VHD files
//!
//! # Quick Start
//!
//! ```no_run
//! use vhdtool_core::{convert, ConvertOptions, RawImage, VhdFile};
//! use std::path::Path;
//!
//! let source = RawImage::open(Path::new("/path/to/disk.img")).unwrap();
//! let output = Path::new("/path/to/disk.vhd");
//! convert(&source, output, &ConvertOptions::default(), None).unwrap();
//!
//! let vhd = VhdFile::open(output).unwrap();
//! assert_eq!(vhd.capacity(), 512 * 1024 * 1024);
//! ```

pub mod bat;
pub mod codec;
pub mod convert;
pub mod error;
pub mod footer;
pub mod geometry;
pub mod header;
pub mod identity;
pub mod image;
pub mod pipeline;
pub mod source;
pub mod store;

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

pub use error::{ConversionError, Error, FormatError, Result};

// Re-export main conversion functionality for convenience
pub use convert::{
    convert, convert_file, convert_to_writer, create_blank, create_dynamic, create_fixed,
    ConvertOptions, ConvertPhase, ConvertProgress, ConvertSummary, ProgressCallback,
    MAX_DISK_SIZE,
};

pub use bat::BlockAllocationTable;
pub use footer::{DiskType, Footer};
pub use geometry::Geometry;
pub use header::{DynamicHeader, DEFAULT_BLOCK_SIZE};
pub use image::VhdFile;
pub use source::{ImageReader, MemoryImage, RawImage, ZeroImage};
pub use store::SparseBlockStore;
