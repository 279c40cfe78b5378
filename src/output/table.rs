//! Fixed-width console table renderer.

use crate::alias::{self, AliasMap};
use crate::output::SnapshotFormatter;
use crate::registry::DeviceSnapshot;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::time::SystemTime;

/// Default width of the name column.
pub const DEFAULT_NAME_WIDTH: usize = 20;

/// Renders snapshots as a plain-text table: address, name, current/max/min
/// signal, estimated distance, and when the device was last heard from.
pub struct TableFormatter {
    /// Names longer than this are truncated to keep columns aligned
    name_width: usize,
    /// Aliases override advertised names
    aliases: AliasMap,
}

impl TableFormatter {
    pub fn new(name_width: usize, aliases: AliasMap) -> Self {
        TableFormatter {
            name_width,
            aliases,
        }
    }

    fn push_header(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "{:<12}  {:<width$}  {:>4}  {:>4}  {:>4}  {:>8}  {:<8}  {:>5}",
            "ADDRESS",
            "NAME",
            "CUR",
            "MAX",
            "MIN",
            "DIST",
            "SEEN",
            "AGE",
            width = self.name_width,
        );
    }

    fn push_row(&self, out: &mut String, device: &DeviceSnapshot, now: SystemTime) {
        let name = alias::resolve_name(&device.address, device.name.as_str(), &self.aliases);
        let name: String = name.chars().take(self.name_width).collect();
        let seen: DateTime<Local> = device.last_seen.into();
        let age = now
            .duration_since(device.last_seen)
            .unwrap_or_default()
            .as_secs();
        let _ = writeln!(
            out,
            "{:<12}  {:<width$}  {:>4}  {:>4}  {:>4}  {:>8}  {}  {:>4}s",
            device.address.to_string(),
            name,
            device.signal,
            device.max_signal,
            device.min_signal,
            format_distance(device.distance),
            seen.format("%H:%M:%S"),
            age,
            width = self.name_width,
        );
    }
}

/// Distance in meters to two decimals; the infinite sentinel renders as a
/// dash.
fn format_distance(distance: f64) -> String {
    if distance.is_finite() {
        format!("{distance:.2}")
    } else {
        "-".to_string()
    }
}

impl SnapshotFormatter for TableFormatter {
    fn format(
        &self,
        nearby: &[DeviceSnapshot],
        lost: &[DeviceSnapshot],
        now: SystemTime,
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} nearby, {} recently lost",
            nearby.len(),
            lost.len()
        );
        self.push_header(&mut out);
        for device in nearby {
            self.push_row(&mut out, device, now);
        }
        if !lost.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "recently lost:");
            for device in lost {
                self.push_row(&mut out, device, now);
            }
        }
        out
    }
}
