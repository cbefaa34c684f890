//! The 512-byte VHD footer.
//!
//! Every VHD ends with a footer; dynamic disks also keep an identical copy
//! in the first sector. The footer describes the whole virtual disk: its
//! size, geometry, type and identity.

use std::fmt;
use std::time::UNIX_EPOCH;

use uuid::Uuid;

use crate::codec::{
    checksum, checksum_excluding, decode_ascii_tag, decode_u32_be, decode_u64_be,
    encode_u32_be, encode_u64_be,
};
use crate::error::FormatError;
use crate::geometry::Geometry;
use crate::identity::{from_vhd_timestamp, new_disk_id, vhd_timestamp_now};
use crate::SECTOR_SIZE;

/// Size of the footer in bytes.
pub const FOOTER_SIZE: usize = 512;

/// Footer cookie.
pub const FOOTER_COOKIE: [u8; 8] = *b"conectix";

/// File format version 1.0.
pub const FORMAT_VERSION: u32 = 0x0001_0000;

/// Features: the disk is temporary and may be deleted on shutdown.
pub const FEATURE_TEMPORARY: u32 = 0x0000_0001;

/// Features: reserved bit, always set.
pub const FEATURE_RESERVED: u32 = 0x0000_0002;

/// Data offset used by fixed disks, which have no further structure.
pub const NO_DATA_OFFSET: u64 = u64::MAX;

/// Creator application written by this library.
pub const CREATOR_APPLICATION: [u8; 4] = *b"vhdt";

/// Creator version written by this library (1.0).
pub const CREATOR_VERSION: u32 = 0x0001_0000;

/// Creator host OS tag for Windows.
pub const CREATOR_HOST_WINDOWS: [u8; 4] = *b"Wi2k";

/// Creator host OS tag for macOS.
pub const CREATOR_HOST_MAC: [u8; 4] = *b"Mac ";

const CHECKSUM_FIELD: std::ops::Range<usize> = 64..68;

/// Kind of virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskType {
    /// Flat data followed by a footer.
    Fixed = 2,
    /// Sparse data addressed through a block allocation table.
    Dynamic = 3,
    /// Sparse child of a parent disk.
    Differencing = 4,
}

impl DiskType {
    /// Parses the on-disk value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(Self::Fixed),
            3 => Some(Self::Dynamic),
            4 => Some(Self::Differencing),
            _ => None,
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskType::Fixed => write!(f, "Fixed"),
            DiskType::Dynamic => write!(f, "Dynamic"),
            DiskType::Differencing => write!(f, "Differencing"),
        }
    }
}

/// The VHD footer.
///
/// The cookie and checksum are not stored: the cookie is constant and the
/// checksum is recomputed on every [`encode`](Footer::encode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub features: u32,
    pub format_version: u32,
    /// Absolute offset of the dynamic header, or [`NO_DATA_OFFSET`].
    pub data_offset: u64,
    /// Seconds since the VHD epoch.
    pub timestamp: u32,
    pub creator_application: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: DiskType,
    pub unique_id: Uuid,
    pub saved_state: bool,
}

impl Footer {
    /// Creates a footer for a new dynamic disk whose header sits at `header_offset`.
    pub fn new_dynamic(size: u64, header_offset: u64) -> Self {
        Self::new(size, DiskType::Dynamic, header_offset)
    }

    /// Creates a footer for a new fixed disk.
    pub fn new_fixed(size: u64) -> Self {
        Self::new(size, DiskType::Fixed, NO_DATA_OFFSET)
    }

    fn new(size: u64, disk_type: DiskType, data_offset: u64) -> Self {
        Self {
            features: FEATURE_RESERVED,
            format_version: FORMAT_VERSION,
            data_offset,
            timestamp: vhd_timestamp_now(),
            creator_application: CREATOR_APPLICATION,
            creator_version: CREATOR_VERSION,
            creator_host_os: host_os_tag(),
            original_size: size,
            current_size: size,
            geometry: Geometry::from_capacity(size),
            disk_type,
            unique_id: new_disk_id(),
            saved_state: false,
        }
    }

    /// Serializes the footer, computing its checksum.
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];

        buf[0..8].copy_from_slice(&FOOTER_COOKIE);
        buf[8..12].copy_from_slice(&encode_u32_be(self.features));
        buf[12..16].copy_from_slice(&encode_u32_be(self.format_version));
        buf[16..24].copy_from_slice(&encode_u64_be(self.data_offset));
        buf[24..28].copy_from_slice(&encode_u32_be(self.timestamp));
        buf[28..32].copy_from_slice(&self.creator_application);
        buf[32..36].copy_from_slice(&encode_u32_be(self.creator_version));
        buf[36..40].copy_from_slice(&self.creator_host_os);
        buf[40..48].copy_from_slice(&encode_u64_be(self.original_size));
        buf[48..56].copy_from_slice(&encode_u64_be(self.current_size));
        buf[56..60].copy_from_slice(&self.geometry.to_bytes());
        buf[60..64].copy_from_slice(&encode_u32_be(self.disk_type as u32));
        // 64..68: checksum, filled below
        buf[68..84].copy_from_slice(self.unique_id.as_bytes());
        buf[84] = self.saved_state as u8;
        // 85..512: reserved, zero

        let sum = checksum(&buf);
        buf[CHECKSUM_FIELD].copy_from_slice(&encode_u32_be(sum));
        buf
    }

    /// Parses and validates a footer.
    pub fn decode(bytes: &[u8; FOOTER_SIZE]) -> Result<Self, FormatError> {
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);
        if cookie != FOOTER_COOKIE {
            return Err(FormatError::BadMagic {
                structure: "footer",
                expected: FOOTER_COOKIE,
                found: cookie,
            });
        }

        let stored = decode_u32_be(&bytes[CHECKSUM_FIELD]);
        let computed = checksum_excluding(bytes, CHECKSUM_FIELD);
        if stored != computed {
            return Err(FormatError::ChecksumMismatch {
                structure: "footer",
                stored,
                computed,
            });
        }

        let format_version = decode_u32_be(&bytes[12..16]);
        if format_version >> 16 != FORMAT_VERSION >> 16 {
            return Err(FormatError::UnsupportedVersion {
                structure: "footer",
                version: format_version,
            });
        }

        let raw_type = decode_u32_be(&bytes[60..64]);
        let disk_type = DiskType::from_u32(raw_type).ok_or(FormatError::UnknownDiskType(raw_type))?;

        let mut creator_application = [0u8; 4];
        creator_application.copy_from_slice(&bytes[28..32]);
        let mut creator_host_os = [0u8; 4];
        creator_host_os.copy_from_slice(&bytes[36..40]);
        let mut geometry = [0u8; 4];
        geometry.copy_from_slice(&bytes[56..60]);
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&bytes[68..84]);

        Ok(Self {
            features: decode_u32_be(&bytes[8..12]),
            format_version,
            data_offset: decode_u64_be(&bytes[16..24]),
            timestamp: decode_u32_be(&bytes[24..28]),
            creator_application,
            creator_version: decode_u32_be(&bytes[32..36]),
            creator_host_os,
            original_size: decode_u64_be(&bytes[40..48]),
            current_size: decode_u64_be(&bytes[48..56]),
            geometry: Geometry::from_bytes(geometry),
            disk_type,
            unique_id: Uuid::from_bytes(unique_id),
            saved_state: bytes[84] != 0,
        })
    }

    /// Whether the temporary feature bit is set.
    pub fn is_temporary(&self) -> bool {
        self.features & FEATURE_TEMPORARY != 0
    }

    /// Number of 512-byte sectors in the virtual disk.
    pub fn total_sectors(&self) -> u64 {
        self.current_size / SECTOR_SIZE
    }
}

fn host_os_tag() -> [u8; 4] {
    if cfg!(target_os = "macos") {
        CREATOR_HOST_MAC
    } else {
        CREATOR_HOST_WINDOWS
    }
}

impl fmt::Display for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VHD Footer")?;
        writeln!(f, "----------")?;
        writeln!(f, "{:<20}: {:#010X}", "Features", self.features)?;
        writeln!(
            f,
            "{:<20}: {}.{}",
            "Format version",
            self.format_version >> 16,
            self.format_version & 0xFFFF
        )?;
        writeln!(f, "{:<20}: {:#018X}", "Data offset", self.data_offset)?;
        let unix_secs = from_vhd_timestamp(self.timestamp)
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        writeln!(
            f,
            "{:<20}: {} (unix {})",
            "Timestamp", self.timestamp, unix_secs
        )?;
        writeln!(
            f,
            "{:<20}: {} {}.{}",
            "Creator",
            decode_ascii_tag(&self.creator_application),
            self.creator_version >> 16,
            self.creator_version & 0xFFFF
        )?;
        writeln!(
            f,
            "{:<20}: {}",
            "Creator host OS",
            decode_ascii_tag(&self.creator_host_os)
        )?;
        writeln!(
            f,
            "{:<20}: {} MiB ({} bytes)",
            "Original size",
            self.original_size >> 20,
            self.original_size
        )?;
        writeln!(
            f,
            "{:<20}: {} MiB ({} bytes)",
            "Current size",
            self.current_size >> 20,
            self.current_size
        )?;
        writeln!(f, "{:<20}: {}", "Geometry (C/H/S)", self.geometry)?;
        writeln!(f, "{:<20}: {}", "Disk type", self.disk_type)?;
        writeln!(f, "{:<20}: {}", "Unique id", self.unique_id)?;
        writeln!(f, "{:<20}: {}", "Saved state", self.saved_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Footer {
        Footer {
            features: FEATURE_RESERVED,
            format_version: FORMAT_VERSION,
            data_offset: 512,
            timestamp: 0x2A2B_2C2D,
            creator_application: CREATOR_APPLICATION,
            creator_version: CREATOR_VERSION,
            creator_host_os: CREATOR_HOST_WINDOWS,
            original_size: 10 * 1024 * 1024,
            current_size: 10 * 1024 * 1024,
            geometry: Geometry::from_capacity(10 * 1024 * 1024),
            disk_type: DiskType::Dynamic,
            unique_id: Uuid::from_bytes([7u8; 16]),
            saved_state: false,
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..8], b"conectix");
        assert_eq!(&bytes[12..16], &[0, 1, 0, 0]);
        assert_eq!(decode_u64_be(&bytes[16..24]), 512);
        assert_eq!(&bytes[28..32], b"vhdt");
        assert_eq!(decode_u64_be(&bytes[48..56]), 10 * 1024 * 1024);
        assert_eq!(decode_u32_be(&bytes[60..64]), 3);
        assert_eq!(&bytes[68..84], &[7u8; 16]);
        assert!(bytes[85..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_round_trip() {
        let footer = sample();
        assert_eq!(Footer::decode(&footer.encode()).unwrap(), footer);
    }

    #[test]
    fn test_bad_cookie() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(
            Footer::decode(&bytes),
            Err(FormatError::BadMagic { structure: "footer", .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = sample().encode();
        bytes[100] ^= 0x01;
        assert!(matches!(
            Footer::decode(&bytes),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_minor_version_tolerated() {
        let mut footer = sample();
        footer.format_version = 0x0001_0003;
        assert_eq!(Footer::decode(&footer.encode()).unwrap(), footer);
    }

    #[test]
    fn test_major_version_rejected() {
        let mut footer = sample();
        footer.format_version = 0x0002_0000;
        assert!(matches!(
            Footer::decode(&footer.encode()),
            Err(FormatError::UnsupportedVersion { version: 0x0002_0000, .. })
        ));
    }

    #[test]
    fn test_unknown_disk_type() {
        let mut bytes = sample().encode();
        bytes[60..64].copy_from_slice(&encode_u32_be(9));
        bytes[64..68].fill(0);
        let sum = checksum(&bytes);
        bytes[64..68].copy_from_slice(&encode_u32_be(sum));
        assert_eq!(
            Footer::decode(&bytes),
            Err(FormatError::UnknownDiskType(9))
        );
    }

    #[test]
    fn test_new_fixed_has_no_data_offset() {
        let footer = Footer::new_fixed(1024 * 1024);
        assert_eq!(footer.data_offset, NO_DATA_OFFSET);
        assert_eq!(footer.disk_type, DiskType::Fixed);
        assert_eq!(footer.features, FEATURE_RESERVED);
        assert!(!footer.is_temporary());
    }

    #[test]
    fn test_display_summary() {
        let text = sample().to_string();
        assert!(text.contains("Dynamic"));
        assert!(text.contains("vhdt 1.0"));
        assert!(text.contains("10 MiB"));
        assert!(text.contains("707472429 (unix 1654157229)"));
    }
}
