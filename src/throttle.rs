//! Per-device dispatch throttling.
//!
//! Notifications are rate-limited per device, independently of the device
//! registry: each address gets at most one dispatch per interval, no matter
//! how often it advertises.

use crate::mac_address::MacAddress;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often a notification may be sent for each device.
///
/// The first event for a device always passes. A blocked event does not
/// reset the window; only an emitted one does.
#[derive(Debug)]
pub struct Throttle {
    /// Minimum time between dispatches for each device
    interval: Duration,
    /// Last dispatch time for each address
    last_sent: HashMap<MacAddress, Instant>,
}

impl Throttle {
    /// Create a new throttle with the specified minimum interval between
    /// dispatches.
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last_sent: HashMap::new(),
        }
    }

    /// Check whether a dispatch for `address` is allowed now.
    ///
    /// Returns `true` if enough time has passed since the last dispatch for
    /// this device (or if this is the first), and marks the dispatch time
    /// when it does.
    pub fn should_emit(&mut self, address: MacAddress) -> bool {
        self.should_emit_at(address, Instant::now())
    }

    /// Clock-injected variant of [`Throttle::should_emit`] for
    /// deterministic tests.
    pub fn should_emit_at(&mut self, address: MacAddress, now: Instant) -> bool {
        match self.last_sent.get(&address) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_sent.insert(address, now);
                true
            }
        }
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the suffixes `ms`, `s`, `m`, and `h`; a bare number is
/// interpreted as seconds.
///
/// # Examples
/// ```
/// use beacon_listener::throttle::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    const UNITS: [(&str, u64); 4] = [("ms", 1), ("h", 3_600_000), ("m", 60_000), ("s", 1000)];

    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    for (suffix, millis_per_unit) in UNITS {
        if let Some(number) = src.strip_suffix(suffix) {
            let value: u64 = number
                .trim()
                .parse()
                .map_err(|_| format!("invalid duration: {src}"))?;
            return Ok(Duration::from_millis(value * millis_per_unit));
        }
    }

    let seconds: u64 = src
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;
    Ok(Duration::from_secs(seconds))
}
