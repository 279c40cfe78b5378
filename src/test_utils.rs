use crate::advertisement::LocalName;
use crate::mac_address::MacAddress;
use crate::registry::DeviceSnapshot;
use std::time::SystemTime;

/// A stable address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Build a `DeviceSnapshot` with plausible defaults.
///
/// Tests override just the fields they care about.
pub fn snapshot_entry(address: MacAddress, signal: i16, distance: f64) -> DeviceSnapshot {
    DeviceSnapshot {
        address,
        name: LocalName::Unknown,
        signal,
        max_signal: signal,
        min_signal: signal,
        last_seen: SystemTime::UNIX_EPOCH,
        distance,
    }
}
