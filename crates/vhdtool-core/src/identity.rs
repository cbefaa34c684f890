//! Disk identity: unique ids and VHD-epoch timestamps.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Unix time of 2000-01-01T00:00:00Z, the VHD timestamp epoch.
pub const VHD_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// Generates a fresh random disk id.
pub fn new_disk_id() -> Uuid {
    Uuid::new_v4()
}

/// Converts a system time to seconds since the VHD epoch.
///
/// Times before the epoch map to 0; times past the end of the 32-bit
/// range saturate at `u32::MAX`.
pub fn to_vhd_timestamp(time: SystemTime) -> u32 {
    let unix_secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix_secs
        .saturating_sub(VHD_EPOCH_UNIX_SECS)
        .min(u32::MAX as u64) as u32
}

/// Converts a VHD timestamp back to a system time.
pub fn from_vhd_timestamp(timestamp: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(VHD_EPOCH_UNIX_SECS + timestamp as u64)
}

/// Current time as a VHD timestamp.
pub fn vhd_timestamp_now() -> u32 {
    to_vhd_timestamp(SystemTime::now())
}
