//! Snapshot renderers for periodic reports.
//!
//! This module provides a trait for rendering registry snapshots and a
//! fixed-width console table implementation, with room for other formats.

pub mod table;

use crate::registry::DeviceSnapshot;
use std::time::SystemTime;

/// Escape sequence that clears the terminal before a live redraw.
///
/// Emitted by the run loop, never by a formatter, so formatted output can
/// be asserted on directly in tests.
pub const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Renders a pair of registry snapshots into a textual report.
///
/// `nearby` holds devices seen within the recency window, `lost` the ones
/// beyond it; both arrive sorted nearest-first. Rendering must be pure:
/// formatting the same snapshots twice yields the same text, and registry
/// state is never touched.
pub trait SnapshotFormatter: Send + Sync {
    fn format(
        &self,
        nearby: &[DeviceSnapshot],
        lost: &[DeviceSnapshot],
        now: SystemTime,
    ) -> String;
}
