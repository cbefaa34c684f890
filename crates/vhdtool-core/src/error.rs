//! Error types for the VHDTool core library.
//!
//! Two layers: [`FormatError`] describes why an on-disk structure was
//! rejected, [`Error`] is the crate-wide error returned by conversion and
//! I/O operations. Format errors are never repaired; the file is rejected.

use std::fmt;
use std::path::PathBuf;

use crate::footer::DiskType;

/// A structural problem found while decoding a VHD container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The structure does not start with the expected cookie.
    #[error("bad magic in {structure}: expected \"{}\", found \"{}\"", display_tag(.expected), display_tag(.found))]
    BadMagic {
        structure: &'static str,
        expected: [u8; 8],
        found: [u8; 8],
    },

    /// The stored checksum disagrees with the recomputed one.
    #[error("{structure} checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },

    /// The major version of the structure is not 1.
    #[error("unsupported {structure} version 0x{version:08X}")]
    UnsupportedVersion { structure: &'static str, version: u32 },

    /// The block size is not a power of two between 512 and 2^31.
    #[error("invalid block size {0}: must be a power of two between 512 and 2^31")]
    InvalidBlockSize(u32),

    /// The disk type field holds an unknown value.
    #[error("unknown disk type {0}")]
    UnknownDiskType(u32),

    /// The disk type is valid but not handled by this library.
    #[error("unsupported disk type: {0}")]
    UnsupportedDiskType(DiskType),

    /// The structures decode individually but contradict each other or the file.
    #[error("inconsistent VHD layout: {0}")]
    Inconsistent(String),
}

impl FormatError {
    /// Create an inconsistency error.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Inconsistent(message.into())
    }
}

fn display_tag(tag: &[u8; 8]) -> String {
    tag.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

/// Where an I/O failure happened.
#[derive(Debug, Clone, Default)]
pub struct IoContext {
    /// The operation that failed, e.g. "write block payload".
    pub operation: &'static str,
    /// Byte offset in the file, when known.
    pub offset: Option<u64>,
    /// File path, when known.
    pub path: Option<PathBuf>,
}

impl fmt::Display for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.operation.is_empty() {
            write!(f, " during {}", self.operation)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " at offset {offset}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " in '{}'", path.display())?;
        }
        Ok(())
    }
}

/// The main error type for VHDTool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with operation, offset and path context.
    #[error("I/O error{context}: {source}")]
    Io {
        source: std::io::Error,
        context: IoContext,
    },

    /// A VHD structure was rejected.
    #[error("VHD format error: {0}")]
    Format(#[from] FormatError),

    /// The source size is not a multiple of 512 and padding is disabled.
    #[error("source size {size} is not a multiple of 512 bytes")]
    UnalignedSize { size: u64 },

    /// A block index beyond the end of the block allocation table.
    #[error("block index {index} out of range (table has {len} entries)")]
    IndexOutOfRange { index: u32, len: u32 },

    /// A read past the end of a source or virtual disk.
    #[error("read of {len} bytes at offset {offset} is beyond size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// The block already has an on-disk location.
    #[error("block {index} is already allocated")]
    BlockAlreadyAllocated { index: u32 },

    /// The disk (or an allocation within it) exceeds what VHD can address.
    #[error("disk size {size} exceeds the VHD limit of {max} bytes")]
    DiskTooLarge { size: u64, max: u64 },

    /// A block payload of the wrong length.
    #[error("block payload is {actual} bytes, expected {expected}")]
    InvalidPayload { expected: usize, actual: usize },

    /// Error in the processing pipeline.
    #[error("Pipeline error: {message}")]
    Pipeline { message: String },
}

/// Errors that abort a conversion. Conversion shares the crate-wide error type.
pub type ConversionError = Error;

/// A specialized Result type for VHDTool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            context: IoContext {
                path: Some(path.into()),
                ..IoContext::default()
            },
        }
    }

    /// Create an I/O error for an operation at a known file offset.
    pub fn io_at(source: std::io::Error, operation: &'static str, offset: u64) -> Self {
        Self::Io {
            source,
            context: IoContext {
                operation,
                offset: Some(offset),
                path: None,
            },
        }
    }

    /// Create an I/O error for an operation without a meaningful offset.
    pub fn io_op(source: std::io::Error, operation: &'static str) -> Self {
        Self::Io {
            source,
            context: IoContext {
                operation,
                ..IoContext::default()
            },
        }
    }

    /// Create an I/O error without context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io {
            source,
            context: IoContext::default(),
        }
    }

    /// Create a pipeline error.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Attach a path to an I/O error that does not have one yet.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Io {
                source,
                mut context,
            } => {
                if context.path.is_none() {
                    context.path = Some(path.into());
                }
                Self::Io { source, context }
            }
            other => other,
        }
    }

    /// Returns the format error, if this is one.
    pub fn as_format(&self) -> Option<&FormatError> {
        match self {
            Self::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/disk.vhd");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/disk.vhd"));
    }

    #[test]
    fn test_io_error_with_offset() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short write");
        let err = Error::io_at(io_err, "write block payload", 4096);
        let msg = err.to_string();
        assert!(msg.contains("during write block payload"));
        assert!(msg.contains("at offset 4096"));
        assert!(!msg.contains(" in '"));
    }

    #[test]
    fn test_with_path_keeps_operation() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::io_at(io_err, "read footer", 0).with_path("disk.vhd");
        let msg = err.to_string();
        assert!(msg.contains("during read footer"));
        assert!(msg.contains("disk.vhd"));
    }

    #[test]
    fn test_bad_magic_display() {
        let err = FormatError::BadMagic {
            structure: "footer",
            expected: *b"conectix",
            found: [0u8; 8],
        };
        let msg = err.to_string();
        assert!(msg.contains("conectix"));
        assert!(msg.contains("........"));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = FormatError::ChecksumMismatch {
            structure: "dynamic header",
            stored: 0xDEADBEEF,
            computed: 0x12345678,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xDEADBEEF"));
        assert!(msg.contains("0x12345678"));
    }

    #[test]
    fn test_format_error_converts() {
        let err: Error = FormatError::InvalidBlockSize(1000).into();
        assert!(matches!(
            err.as_format(),
            Some(FormatError::InvalidBlockSize(1000))
        ));
        assert!(err.to_string().contains("VHD format error"));
    }

    #[test]
    fn test_pipeline_error() {
        let err = Error::pipeline("worker thread panicked");
        assert!(err.to_string().contains("Pipeline error"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { ref context, .. } if context.path.is_none()));
    }
}
