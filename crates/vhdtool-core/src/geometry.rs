//! CHS disk geometry for the VHD footer.
//!
//! Hypervisors check the footer geometry against the disk size, so the
//! derivation follows the algorithm published with the VHD format
//! exactly, including its integer truncation.

use std::fmt;

use crate::SECTOR_SIZE;

/// Largest sector count the geometry fields can describe (65535 × 16 × 255).
pub const MAX_GEOMETRY_SECTORS: u64 = 65535 * 16 * 255;

/// Sector count at which the algorithm switches to 255 sectors per track.
const WIDE_TRACK_THRESHOLD: u64 = 65535 * 16 * 63;

/// Cylinder/head/sector geometry as stored in the footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Geometry {
    /// Creates a geometry from explicit values.
    pub fn chs(cylinders: u16, heads: u8, sectors_per_track: u8) -> Self {
        Self {
            cylinders,
            heads,
            sectors_per_track,
        }
    }

    /// Derives the geometry for a disk of `total_sectors` 512-byte sectors.
    pub fn from_total_sectors(total_sectors: u64) -> Self {
        let total = total_sectors.min(MAX_GEOMETRY_SECTORS);

        let (heads, sectors_per_track, cylinders_times_heads) = if total >= WIDE_TRACK_THRESHOLD {
            (16, 255, total / 255)
        } else {
            let mut sectors_per_track = 17;
            let mut cylinders_times_heads = total / sectors_per_track;
            let mut heads = ((cylinders_times_heads + 1023) / 1024).max(4);

            if cylinders_times_heads >= heads * 1024 || heads > 16 {
                sectors_per_track = 31;
                heads = 16;
                cylinders_times_heads = total / sectors_per_track;
            }

            if cylinders_times_heads >= heads * 1024 {
                sectors_per_track = 63;
                heads = 16;
                cylinders_times_heads = total / sectors_per_track;
            }

            (heads, sectors_per_track, cylinders_times_heads)
        };

        // Clamping above keeps every value inside its field width.
        Self {
            cylinders: (cylinders_times_heads / heads) as u16,
            heads: heads as u8,
            sectors_per_track: sectors_per_track as u8,
        }
    }

    /// Derives the geometry for a disk of `capacity` bytes.
    pub fn from_capacity(capacity: u64) -> Self {
        Self::from_total_sectors(capacity / SECTOR_SIZE)
    }

    /// Number of sectors addressable through this geometry.
    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors_per_track as u64
    }

    /// Capacity in bytes addressable through this geometry.
    pub fn capacity(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE
    }

    /// Encodes the geometry as the 4-byte footer field.
    pub fn to_bytes(&self) -> [u8; 4] {
        let [c0, c1] = self.cylinders.to_be_bytes();
        [c0, c1, self.heads, self.sectors_per_track]
    }

    /// Decodes the 4-byte footer field.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors_per_track: bytes[3],
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.cylinders, self.heads, self.sectors_per_track
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_disk_uses_minimum_heads() {
        // 1 MiB = 2048 sectors: 2048/17 = 120, heads = max(4, 1) = 4
        let geo = Geometry::from_total_sectors(2048);
        assert_eq!(geo, Geometry::chs(30, 4, 17));
    }

    #[test]
    fn test_switch_to_31_sectors() {
        // 100 MiB = 204800 sectors
        // 204800/17 = 12047, heads = 12 -> 12047 < 12288, stays at 17
        let geo = Geometry::from_total_sectors(204_800);
        assert_eq!(geo, Geometry::chs(1003, 12, 17));

        // 300 MiB = 614400 sectors: 614400/17 = 36141, heads = 36 > 16
        // -> spt 31, 614400/31 = 19819 >= 16384 -> spt 63, 9752 / 16 = 609
        let geo = Geometry::from_total_sectors(614_400);
        assert_eq!(geo, Geometry::chs(609, 16, 63));
    }

    #[test]
    fn test_wide_track_geometry() {
        let geo = Geometry::from_total_sectors(WIDE_TRACK_THRESHOLD);
        assert_eq!(geo.heads, 16);
        assert_eq!(geo.sectors_per_track, 255);
        assert_eq!(geo.cylinders as u64, WIDE_TRACK_THRESHOLD / 255 / 16);
    }

    #[test]
    fn test_clamped_above_maximum() {
        let geo = Geometry::from_total_sectors(u64::MAX);
        assert_eq!(geo, Geometry::chs(65535, 16, 255));
    }

    #[test]
    fn test_field_round_trip() {
        let geo = Geometry::chs(20805, 16, 63);
        assert_eq!(geo.to_bytes(), [0x51, 0x45, 16, 63]);
        assert_eq!(Geometry::from_bytes(geo.to_bytes()), geo);
    }

    #[test]
    fn test_display() {
        assert_eq!(Geometry::chs(20805, 16, 63).to_string(), "20805/16/63");
    }
}
