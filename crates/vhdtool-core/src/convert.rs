//! Raw image to VHD conversion.
//!
//! A conversion walks through a fixed sequence of phases:
//! size validation, geometry, metadata, data blocks and finally the
//! footer. For dynamic disks the output layout is:
//!
//! ```text
//! [footer copy][dynamic header][BAT][data blocks...][footer]
//! ```
//!
//! Blocks that are entirely zero are never allocated. Block reads and zero
//! checks run in parallel batches; allocation and writes happen on the
//! calling thread in block index order, so the output is deterministic
//! apart from the disk id and timestamp.
//!
//! # Example
//!
//! ```no_run
//! use vhdtool_core::convert::{convert, ConvertOptions};
//! use vhdtool_core::source::RawImage;
//! use std::path::Path;
//!
//! let source = RawImage::open(Path::new("disk.img")).unwrap();
//! let summary = convert(&source, Path::new("disk.vhd"), &ConvertOptions::default(), None).unwrap();
//! println!("{} of {} blocks allocated", summary.blocks_allocated, summary.blocks_total);
//! ```

use std::fmt;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use uuid::Uuid;

use crate::bat::{table_size_for, BlockAllocationTable};
use crate::codec::align_up;
use crate::error::{Error, FormatError, Result};
use crate::footer::{DiskType, Footer, FOOTER_SIZE};
use crate::geometry::Geometry;
use crate::header::{
    table_entries_for, validate_block_size, DynamicHeader, DEFAULT_BLOCK_SIZE, HEADER_SIZE,
};
use crate::pipeline::{ensure_complete, Pipeline, PipelineConfig, DEFAULT_BATCH_BLOCKS};
use crate::source::{ImageReader, RawImage, ZeroImage};
use crate::store::{block_span, is_zero_block, SparseBlockStore};
use crate::SECTOR_SIZE;

/// Largest virtual disk a VHD may describe (2040 GiB).
pub const MAX_DISK_SIZE: u64 = 2040 * 1024 * 1024 * 1024;

/// Byte offset of the dynamic header in new files.
const HEADER_OFFSET: u64 = FOOTER_SIZE as u64;

/// Byte offset of the block allocation table in new files.
const TABLE_OFFSET: u64 = HEADER_OFFSET + HEADER_SIZE as u64;

/// Options for a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Payload bytes per block for dynamic disks (default 2 MiB).
    pub block_size: u32,
    /// Output disk type: [`DiskType::Dynamic`] or [`DiskType::Fixed`].
    pub disk_type: DiskType,
    /// Pad sources whose size is not a multiple of 512 with zeros.
    /// When false such sources are rejected.
    pub pad_unaligned: bool,
    /// Blocks read and zero-checked per parallel batch.
    pub batch_blocks: usize,
    /// Number of threads to use (0 = auto).
    pub num_threads: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            disk_type: DiskType::Dynamic,
            pad_unaligned: true,
            batch_blocks: DEFAULT_BATCH_BLOCKS,
            num_threads: 0,
        }
    }
}

impl ConvertOptions {
    /// Create options for a dynamic disk with the given block size and thread count.
    pub fn new(block_size: u32, num_threads: usize) -> Self {
        Self {
            block_size,
            num_threads,
            ..Self::default()
        }
    }

    /// Create options for a fixed disk.
    pub fn fixed() -> Self {
        Self {
            disk_type: DiskType::Fixed,
            ..Self::default()
        }
    }

    /// Checks that the options describe a disk this library can write.
    pub fn validate(&self) -> Result<()> {
        match self.disk_type {
            DiskType::Dynamic => validate_block_size(self.block_size)?,
            DiskType::Fixed => {}
            other => return Err(FormatError::UnsupportedDiskType(other).into()),
        }
        Ok(())
    }
}

/// Phase of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertPhase {
    /// Nothing done yet.
    Start,
    /// Source size checked and padded.
    SizeValidated,
    /// Geometry derived; footer fields fixed.
    GeometryComputed,
    /// Leading metadata written (dynamic disks: footer placeholder, header, BAT).
    HeaderWritten,
    /// All data blocks written.
    BlocksWritten,
    /// Final footer(s) and table written.
    FooterFinalized,
    /// Conversion complete.
    Done,
    /// Conversion aborted. Nothing more is written.
    Failed,
}

impl ConvertPhase {
    /// The phase that follows this one on success.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::SizeValidated),
            Self::SizeValidated => Some(Self::GeometryComputed),
            Self::GeometryComputed => Some(Self::HeaderWritten),
            Self::HeaderWritten => Some(Self::BlocksWritten),
            Self::BlocksWritten => Some(Self::FooterFinalized),
            Self::FooterFinalized => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Failed => !self.is_terminal(),
            _ => self.next() == Some(next),
        }
    }
}

impl fmt::Display for ConvertPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertPhase::Start => write!(f, "Starting"),
            ConvertPhase::SizeValidated => write!(f, "Validating size"),
            ConvertPhase::GeometryComputed => write!(f, "Computing geometry"),
            ConvertPhase::HeaderWritten => write!(f, "Writing header"),
            ConvertPhase::BlocksWritten => write!(f, "Writing blocks"),
            ConvertPhase::FooterFinalized => write!(f, "Finalizing"),
            ConvertPhase::Done => write!(f, "Complete"),
            ConvertPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Progress information for a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertProgress {
    /// Most recently reached phase.
    pub phase: ConvertPhase,
    /// Source bytes processed so far.
    pub bytes_processed: u64,
    /// Total bytes of the (padded) virtual disk.
    pub bytes_total: u64,
    /// Blocks allocated so far.
    pub blocks_allocated: u32,
    /// Blocks in the allocation table (0 for fixed disks).
    pub blocks_total: u32,
}

impl ConvertProgress {
    fn new(bytes_total: u64, blocks_total: u32) -> Self {
        Self {
            phase: ConvertPhase::Start,
            bytes_processed: 0,
            bytes_total,
            blocks_allocated: 0,
            blocks_total,
        }
    }

    /// Calculate overall percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return match self.phase {
                ConvertPhase::Done => 100.0,
                _ => 0.0,
            };
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ConvertProgress) + Send>;

/// Result of a successful conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertSummary {
    /// Disk type written.
    pub disk_type: DiskType,
    /// Virtual disk size in bytes.
    pub disk_size: u64,
    /// Size of the VHD file in bytes.
    pub output_size: u64,
    /// Blocks that received storage.
    pub blocks_allocated: u32,
    /// Blocks in the allocation table (0 for fixed disks).
    pub blocks_total: u32,
    /// Geometry recorded in the footer.
    pub geometry: Geometry,
    /// Unique id of the new disk.
    pub disk_id: Uuid,
}

/// Tracks the phase and forwards progress to the callback.
struct Reporter {
    callback: Option<ProgressCallback>,
    progress: ConvertProgress,
}

impl Reporter {
    fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            progress: ConvertProgress::new(0, 0),
        }
    }

    fn advance(&mut self, next: ConvertPhase) {
        debug_assert!(
            self.progress.phase.can_transition_to(next),
            "illegal phase transition {:?} -> {:?}",
            self.progress.phase,
            next
        );
        tracing::debug!(from = ?self.progress.phase, to = ?next, "conversion phase");
        self.progress.phase = next;
        self.emit();
    }

    fn emit(&self) {
        if let Some(ref callback) = self.callback {
            callback(self.progress.clone());
        }
    }
}

/// Convert `source` into a VHD at `output_path`.
///
/// The VHD is written to a temporary file in the destination directory and
/// renamed over `output_path` only after the conversion succeeds. On
/// failure no output file is left behind.
///
/// # Arguments
///
/// * `source` - The raw image to convert.
/// * `output_path` - Path for the output VHD file.
/// * `options` - Disk type, block size and threading options.
/// * `progress_callback` - Optional callback for progress updates.
pub fn convert<S: ImageReader + ?Sized>(
    source: &S,
    output_path: &Path,
    options: &ConvertOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<ConvertSummary> {
    let dir = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".vhdtool-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io(e, dir))?;

    let summary = {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let summary = convert_to_writer(source, &mut writer, options, progress_callback)
            .map_err(|e| e.with_path(output_path))?;
        writer
            .into_inner()
            .map_err(|e| Error::io(e.into_error(), output_path))?;
        summary
    };

    temp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, output_path))?;
    temp.persist(output_path)
        .map_err(|e| Error::io(e.error, output_path))?;

    tracing::info!(path = %output_path.display(), "wrote VHD");
    Ok(summary)
}

/// Convert the raw image file at `input_path` into a VHD at `output_path`.
pub fn convert_file(
    input_path: &Path,
    output_path: &Path,
    options: &ConvertOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<ConvertSummary> {
    let source = RawImage::open(input_path)?;
    convert(&source, output_path, options, progress_callback)
}

/// Size in bytes of a blank disk of `size_mib` MiB.
///
/// The size is rounded up to whole default-sized blocks.
///
/// # Errors
///
/// Returns [`Error::DiskTooLarge`] if the disk would exceed [`MAX_DISK_SIZE`].
pub fn blank_disk_size(size_mib: u64) -> Result<u64> {
    let size = size_mib
        .checked_mul(1024 * 1024)
        .filter(|&size| size <= MAX_DISK_SIZE)
        .ok_or(Error::DiskTooLarge {
            size: size_mib.saturating_mul(1024 * 1024),
            max: MAX_DISK_SIZE,
        })?;
    Ok(align_up(size, DEFAULT_BLOCK_SIZE as u64))
}

/// Create a blank VHD of `size` bytes at `output_path`.
///
/// Dynamic disks come out with an empty allocation table; fixed disks are
/// written out in full.
pub fn create_blank(
    output_path: &Path,
    size: u64,
    options: &ConvertOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<ConvertSummary> {
    tracing::info!(
        path = %output_path.display(),
        size,
        disk_type = %options.disk_type,
        "creating blank disk"
    );
    convert(&ZeroImage::new(size), output_path, options, progress_callback)
}

/// Create a blank dynamic VHD of `size_mib` MiB with default options.
pub fn create_dynamic(output_path: &Path, size_mib: u64) -> Result<ConvertSummary> {
    let size = blank_disk_size(size_mib)?;
    create_blank(output_path, size, &ConvertOptions::default(), None)
}

/// Create a blank fixed VHD of `size_mib` MiB.
pub fn create_fixed(output_path: &Path, size_mib: u64) -> Result<ConvertSummary> {
    let size = blank_disk_size(size_mib)?;
    create_blank(output_path, size, &ConvertOptions::fixed(), None)
}

/// Convert `source` into a VHD written to `writer`.
///
/// The writer must be positioned nowhere in particular; all writes are
/// absolute. Returns the conversion summary on success.
pub fn convert_to_writer<S, W>(
    source: &S,
    writer: &mut W,
    options: &ConvertOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<ConvertSummary>
where
    S: ImageReader + ?Sized,
    W: Write + Seek,
{
    let mut reporter = Reporter::new(progress_callback);
    let result = run_conversion(source, writer, options, &mut reporter);
    if let Err(ref e) = result {
        tracing::warn!(phase = %reporter.progress.phase, error = %e, "conversion failed");
        reporter.advance(ConvertPhase::Failed);
    }
    result
}

fn run_conversion<S, W>(
    source: &S,
    writer: &mut W,
    options: &ConvertOptions,
    reporter: &mut Reporter,
) -> Result<ConvertSummary>
where
    S: ImageReader + ?Sized,
    W: Write + Seek,
{
    options.validate()?;

    let source_size = source.size();
    let disk_size = validated_size(source_size, options.pad_unaligned)?;
    reporter.progress.bytes_total = disk_size;
    reporter.advance(ConvertPhase::SizeValidated);

    tracing::info!(
        source_size,
        disk_size,
        disk_type = %options.disk_type,
        block_size = options.block_size,
        "starting conversion"
    );

    let pipeline = Pipeline::new(PipelineConfig::new(options.batch_blocks, options.num_threads));

    let summary = match options.disk_type {
        DiskType::Fixed => write_fixed(source, writer, disk_size, &pipeline, reporter)?,
        _ => write_dynamic(source, writer, disk_size, options.block_size, &pipeline, reporter)?,
    };

    writer
        .flush()
        .map_err(|e| Error::io_op(e, "flush output"))?;
    reporter.advance(ConvertPhase::Done);

    tracing::info!(
        blocks_allocated = summary.blocks_allocated,
        blocks_total = summary.blocks_total,
        output_size = summary.output_size,
        "conversion complete"
    );
    Ok(summary)
}

/// Rounds the source size up to a whole sector and checks the VHD limit.
fn validated_size(source_size: u64, pad_unaligned: bool) -> Result<u64> {
    let disk_size = if source_size % SECTOR_SIZE == 0 {
        source_size
    } else if pad_unaligned {
        let padded = align_up(source_size, SECTOR_SIZE);
        tracing::warn!(
            source_size,
            padded,
            "source size is not a multiple of 512, padding with zeros"
        );
        padded
    } else {
        return Err(Error::UnalignedSize { size: source_size });
    };

    if disk_size > MAX_DISK_SIZE {
        return Err(Error::DiskTooLarge {
            size: disk_size,
            max: MAX_DISK_SIZE,
        });
    }
    Ok(disk_size)
}

/// Reads `len` bytes at `offset`, zero-filling whatever lies past the
/// end of the source.
fn read_padded<S: ImageReader + ?Sized>(source: &S, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let size = source.size();
    if offset < size {
        let available = (size - offset).min(len as u64) as usize;
        let data = source.read_at(offset, available)?;
        buf[..available].copy_from_slice(&data);
    }
    Ok(buf)
}

fn write_at<W: Write + Seek>(
    writer: &mut W,
    offset: u64,
    bytes: &[u8],
    operation: &'static str,
) -> Result<()> {
    writer
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io_at(e, operation, offset))?;
    writer
        .write_all(bytes)
        .map_err(|e| Error::io_at(e, operation, offset))
}

fn write_dynamic<S, W>(
    source: &S,
    writer: &mut W,
    disk_size: u64,
    block_size: u32,
    pipeline: &Pipeline,
    reporter: &mut Reporter,
) -> Result<ConvertSummary>
where
    S: ImageReader + ?Sized,
    W: Write + Seek,
{
    let footer = Footer::new_dynamic(disk_size, HEADER_OFFSET);
    let header = DynamicHeader::new(disk_size, TABLE_OFFSET, block_size);
    let entries = header.max_table_entries;
    debug_assert_eq!(entries, table_entries_for(disk_size, block_size));
    reporter.progress.blocks_total = entries;
    tracing::debug!(geometry = %footer.geometry, entries, "computed disk layout");
    reporter.advance(ConvertPhase::GeometryComputed);

    let data_start = TABLE_OFFSET + table_size_for(entries);
    let bat = BlockAllocationTable::new(entries, block_span(block_size), data_start);

    // The leading footer is written last, once the file is complete.
    write_at(writer, 0, &[0u8; FOOTER_SIZE], "write footer placeholder")?;
    write_at(writer, HEADER_OFFSET, &header.encode(), "write dynamic header")?;
    write_at(writer, TABLE_OFFSET, &bat.encode(), "write block allocation table")?;
    reporter.advance(ConvertPhase::HeaderWritten);

    let mut store = SparseBlockStore::new(&mut *writer, bat, block_size);
    for batch in pipeline.batches(entries) {
        let indices: Vec<u32> = batch.clone().collect();
        let expected = indices.len();
        let blocks = pipeline.process(indices, |_, index| {
            let offset = index as u64 * block_size as u64;
            if source.is_zero_range(offset, block_size as u64) {
                return Ok((index, None));
            }
            let payload = read_padded(source, offset, block_size as usize)?;
            Ok((index, (!is_zero_block(&payload)).then_some(payload)))
        })?;
        ensure_complete(&blocks, expected)?;

        // Workers already dropped zero blocks.
        for (index, payload) in blocks {
            if let Some(payload) = payload {
                store.write_block(index, &payload)?;
            }
        }

        let progress = &mut reporter.progress;
        progress.bytes_processed = (batch.end as u64 * block_size as u64).min(disk_size);
        progress.blocks_allocated = store.bat().allocated_count();
        tracing::debug!(
            first = batch.start,
            last = batch.end - 1,
            allocated = progress.blocks_allocated,
            "wrote batch"
        );
        reporter.emit();
    }
    let (writer, bat) = store.into_parts();
    reporter.advance(ConvertPhase::BlocksWritten);

    let footer_bytes = footer.encode();
    let trailing_offset = bat.end_of_data();
    write_at(writer, TABLE_OFFSET, &bat.encode(), "write block allocation table")?;
    write_at(writer, trailing_offset, &footer_bytes, "write trailing footer")?;
    write_at(writer, 0, &footer_bytes, "write leading footer")?;
    reporter.advance(ConvertPhase::FooterFinalized);

    Ok(ConvertSummary {
        disk_type: DiskType::Dynamic,
        disk_size,
        output_size: trailing_offset + FOOTER_SIZE as u64,
        blocks_allocated: bat.allocated_count(),
        blocks_total: entries,
        geometry: footer.geometry,
        disk_id: footer.unique_id,
    })
}

fn write_fixed<S, W>(
    source: &S,
    writer: &mut W,
    disk_size: u64,
    pipeline: &Pipeline,
    reporter: &mut Reporter,
) -> Result<ConvertSummary>
where
    S: ImageReader + ?Sized,
    W: Write + Seek,
{
    const CHUNK: u64 = DEFAULT_BLOCK_SIZE as u64;

    let footer = Footer::new_fixed(disk_size);
    tracing::debug!(geometry = %footer.geometry, "computed disk layout");
    reporter.advance(ConvertPhase::GeometryComputed);

    // Fixed disks carry no leading metadata.
    writer
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::io_at(e, "seek to start", 0))?;
    reporter.advance(ConvertPhase::HeaderWritten);

    let chunks = disk_size.div_ceil(CHUNK);
    let chunks = u32::try_from(chunks).map_err(|_| Error::DiskTooLarge {
        size: disk_size,
        max: MAX_DISK_SIZE,
    })?;

    for batch in pipeline.batches(chunks) {
        let indices: Vec<u32> = batch.clone().collect();
        let expected = indices.len();
        let data = pipeline.process(indices, |_, index| {
            let offset = index as u64 * CHUNK;
            let len = CHUNK.min(disk_size - offset) as usize;
            read_padded(source, offset, len)
        })?;
        ensure_complete(&data, expected)?;

        let mut offset = batch.start as u64 * CHUNK;
        for chunk in data {
            writer
                .write_all(&chunk)
                .map_err(|e| Error::io_at(e, "write disk data", offset))?;
            offset += chunk.len() as u64;
        }

        reporter.progress.bytes_processed = offset;
        reporter.emit();
    }
    reporter.advance(ConvertPhase::BlocksWritten);

    write_at(writer, disk_size, &footer.encode(), "write footer")?;
    reporter.advance(ConvertPhase::FooterFinalized);

    Ok(ConvertSummary {
        disk_type: DiskType::Fixed,
        disk_size,
        output_size: disk_size + FOOTER_SIZE as u64,
        blocks_allocated: 0,
        blocks_total: 0,
        geometry: footer.geometry,
        disk_id: footer.unique_id,
    })
}
