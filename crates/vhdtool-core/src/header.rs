//! The 1024-byte dynamic disk header.
//!
//! The header follows the leading footer copy in dynamic and differencing
//! disks. It locates the block allocation table and fixes the block size.
//! Parent fields only matter for differencing disks; they are carried
//! through unchanged so that a decoded header re-encodes byte for byte.

use std::fmt;

use uuid::Uuid;

use crate::codec::{
    checksum, checksum_excluding, decode_u32_be, decode_u64_be, encode_u32_be, encode_u64_be,
};
use crate::error::FormatError;
use crate::SECTOR_SIZE;

/// Size of the dynamic header in bytes.
pub const HEADER_SIZE: usize = 1024;

/// Dynamic header cookie.
pub const HEADER_COOKIE: [u8; 8] = *b"cxsparse";

/// Header version 1.0.
pub const HEADER_VERSION: u32 = 0x0001_0000;

/// Default block size (2 MiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 0x0020_0000;

/// Smallest accepted block size: one sector.
pub const MIN_BLOCK_SIZE: u32 = SECTOR_SIZE as u32;

/// Largest accepted block size.
pub const MAX_BLOCK_SIZE: u32 = 1 << 31;

/// Number of parent locator entries in the header.
pub const PARENT_LOCATOR_COUNT: usize = 8;

const CHECKSUM_FIELD: std::ops::Range<usize> = 36..40;
const PARENT_NAME_FIELD: std::ops::Range<usize> = 64..576;
const PARENT_LOCATORS_START: usize = 576;
const PARENT_LOCATOR_SIZE: usize = 24;

/// Checks that a block size is a power of two between 512 and 2^31.
pub fn validate_block_size(block_size: u32) -> Result<(), FormatError> {
    if block_size.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        Ok(())
    } else {
        Err(FormatError::InvalidBlockSize(block_size))
    }
}

/// A parent locator entry: where a differencing disk finds its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParentLocator {
    pub platform_code: u32,
    pub data_space: u32,
    pub data_length: u32,
    pub reserved: u32,
    pub data_offset: u64,
}

impl ParentLocator {
    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&encode_u32_be(self.platform_code));
        buf[4..8].copy_from_slice(&encode_u32_be(self.data_space));
        buf[8..12].copy_from_slice(&encode_u32_be(self.data_length));
        buf[12..16].copy_from_slice(&encode_u32_be(self.reserved));
        buf[16..24].copy_from_slice(&encode_u64_be(self.data_offset));
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            platform_code: decode_u32_be(&buf[0..4]),
            data_space: decode_u32_be(&buf[4..8]),
            data_length: decode_u32_be(&buf[8..12]),
            reserved: decode_u32_be(&buf[12..16]),
            data_offset: decode_u64_be(&buf[16..24]),
        }
    }

    /// Whether the entry is in use.
    pub fn is_used(&self) -> bool {
        self.platform_code != 0
    }
}

/// The dynamic disk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicHeader {
    /// Unused by VHD 1.0; all ones.
    pub data_offset: u64,
    /// Absolute byte offset of the block allocation table.
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_unique_id: Uuid,
    pub parent_timestamp: u32,
    /// Parent file name, stored as UTF-16BE in a 512-byte field.
    pub parent_name: Vec<u16>,
    pub parent_locators: [ParentLocator; PARENT_LOCATOR_COUNT],
}

impl DynamicHeader {
    /// Creates a header for a disk with no parent.
    ///
    /// `max_table_entries` is derived as `ceil(current_size / block_size)`.
    pub fn new(current_size: u64, table_offset: u64, block_size: u32) -> Self {
        Self {
            data_offset: u64::MAX,
            table_offset,
            header_version: HEADER_VERSION,
            max_table_entries: table_entries_for(current_size, block_size),
            block_size,
            parent_unique_id: Uuid::nil(),
            parent_timestamp: 0,
            parent_name: Vec::new(),
            parent_locators: [ParentLocator::default(); PARENT_LOCATOR_COUNT],
        }
    }

    /// Serializes the header, computing its checksum.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..8].copy_from_slice(&HEADER_COOKIE);
        buf[8..16].copy_from_slice(&encode_u64_be(self.data_offset));
        buf[16..24].copy_from_slice(&encode_u64_be(self.table_offset));
        buf[24..28].copy_from_slice(&encode_u32_be(self.header_version));
        buf[28..32].copy_from_slice(&encode_u32_be(self.max_table_entries));
        buf[32..36].copy_from_slice(&encode_u32_be(self.block_size));
        // 36..40: checksum, filled below
        buf[40..56].copy_from_slice(self.parent_unique_id.as_bytes());
        buf[56..60].copy_from_slice(&encode_u32_be(self.parent_timestamp));
        // 60..64: reserved

        let name_field = &mut buf[PARENT_NAME_FIELD];
        for (dst, unit) in name_field.chunks_exact_mut(2).zip(&self.parent_name) {
            dst.copy_from_slice(&unit.to_be_bytes());
        }

        for (i, locator) in self.parent_locators.iter().enumerate() {
            let start = PARENT_LOCATORS_START + i * PARENT_LOCATOR_SIZE;
            locator.encode_into(&mut buf[start..start + PARENT_LOCATOR_SIZE]);
        }
        // 768..1024: reserved

        let sum = checksum(&buf);
        buf[CHECKSUM_FIELD].copy_from_slice(&encode_u32_be(sum));
        buf
    }

    /// Parses and validates a dynamic header.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, FormatError> {
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);
        if cookie != HEADER_COOKIE {
            return Err(FormatError::BadMagic {
                structure: "dynamic header",
                expected: HEADER_COOKIE,
                found: cookie,
            });
        }

        let stored = decode_u32_be(&bytes[CHECKSUM_FIELD]);
        let computed = checksum_excluding(bytes, CHECKSUM_FIELD);
        if stored != computed {
            return Err(FormatError::ChecksumMismatch {
                structure: "dynamic header",
                stored,
                computed,
            });
        }

        let header_version = decode_u32_be(&bytes[24..28]);
        if header_version >> 16 != HEADER_VERSION >> 16 {
            return Err(FormatError::UnsupportedVersion {
                structure: "dynamic header",
                version: header_version,
            });
        }

        let block_size = decode_u32_be(&bytes[32..36]);
        validate_block_size(block_size)?;

        let mut parent_unique_id = [0u8; 16];
        parent_unique_id.copy_from_slice(&bytes[40..56]);

        let mut parent_name: Vec<u16> = bytes[PARENT_NAME_FIELD]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        while parent_name.last() == Some(&0) {
            parent_name.pop();
        }

        let mut parent_locators = [ParentLocator::default(); PARENT_LOCATOR_COUNT];
        for (i, locator) in parent_locators.iter_mut().enumerate() {
            let start = PARENT_LOCATORS_START + i * PARENT_LOCATOR_SIZE;
            *locator = ParentLocator::decode(&bytes[start..start + PARENT_LOCATOR_SIZE]);
        }

        Ok(Self {
            data_offset: decode_u64_be(&bytes[8..16]),
            table_offset: decode_u64_be(&bytes[16..24]),
            header_version,
            max_table_entries: decode_u32_be(&bytes[28..32]),
            block_size,
            parent_unique_id: Uuid::from_bytes(parent_unique_id),
            parent_timestamp: decode_u32_be(&bytes[56..60]),
            parent_name,
            parent_locators,
        })
    }

    /// The parent file name as a string, with invalid UTF-16 replaced.
    pub fn parent_name_lossy(&self) -> String {
        String::from_utf16_lossy(&self.parent_name)
    }

    /// Size of the on-disk BAT in bytes, padded to a whole sector.
    pub fn table_size(&self) -> u64 {
        crate::bat::table_size_for(self.max_table_entries)
    }
}

/// Number of blocks needed to cover `size` bytes.
///
/// Saturates at `u32::MAX`; callers cap disk sizes well below that.
pub fn table_entries_for(size: u64, block_size: u32) -> u32 {
    size.div_ceil(block_size as u64).min(u32::MAX as u64) as u32
}

impl fmt::Display for DynamicHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VHD Dynamic Header")?;
        writeln!(f, "------------------")?;
        writeln!(f, "{:<20}: {:#018X}", "Table offset", self.table_offset)?;
        writeln!(
            f,
            "{:<20}: {}.{}",
            "Header version",
            self.header_version >> 16,
            self.header_version & 0xFFFF
        )?;
        writeln!(f, "{:<20}: {}", "Max table entries", self.max_table_entries)?;
        writeln!(
            f,
            "{:<20}: {} KiB ({} bytes)",
            "Block size",
            self.block_size >> 10,
            self.block_size
        )?;
        writeln!(f, "{:<20}: {}", "Parent id", self.parent_unique_id)?;
        writeln!(f, "{:<20}: {}", "Parent name", self.parent_name_lossy())
    }
}
