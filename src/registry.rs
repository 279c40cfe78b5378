//! Time-indexed registry of observed devices.
//!
//! The registry absorbs scan events on the delivery path and hands out
//! snapshots to the periodic reporter. Devices are kept in insertion order
//! so the distance sort has a stable tie-break, and staleness only filters
//! snapshots: nothing is removed unless eviction is asked for explicitly.

use crate::advertisement::{self, LocalName};
use crate::distance::DistanceEstimator;
use crate::mac_address::MacAddress;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Rolling state for one observed device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceObservation {
    pub address: MacAddress,
    /// Best-effort identity; a decoded name is kept even when later
    /// packets carry no name record.
    pub name: LocalName,
    /// Latest raw reading. Independent of the running extrema, so it may
    /// sit outside `min..=max` briefly after extrema widen.
    pub signal: i16,
    pub max_signal: i16,
    pub min_signal: i16,
    pub last_seen: SystemTime,
}

impl DeviceObservation {
    fn absorb(&mut self, parsed: LocalName, signal: i16, now: SystemTime) {
        self.signal = signal;
        self.max_signal = self.max_signal.max(signal);
        self.min_signal = self.min_signal.min(signal);
        self.last_seen = now;
        if parsed.is_known() || (!self.name.is_known() && parsed != LocalName::Unknown) {
            self.name = parsed;
        }
    }
}

/// A copy of one device's state taken at snapshot time, with the distance
/// estimated from its latest reading.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub address: MacAddress,
    pub name: LocalName,
    pub signal: i16,
    pub max_signal: i16,
    pub min_signal: i16,
    pub last_seen: SystemTime,
    pub distance: f64,
}

/// Insertion-ordered device map fed by scan events.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceObservation>,
    index: HashMap<MacAddress, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Number of devices observed since start (or since the last eviction).
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Absorb one scan event.
    ///
    /// The payload's name record is parsed exactly once per call; malformed
    /// payloads never fail, they degrade to an unknown name. Returns the
    /// updated record so the caller can dispatch without a second lookup.
    pub fn observe(
        &mut self,
        address: MacAddress,
        signal: i16,
        payload: &[u8],
        now: SystemTime,
    ) -> &DeviceObservation {
        let parsed = advertisement::parse_local_name(payload);
        let slot = match self.index.get(&address) {
            Some(&slot) => {
                self.devices[slot].absorb(parsed, signal, now);
                slot
            }
            None => {
                let slot = self.devices.len();
                self.index.insert(address, slot);
                self.devices.push(DeviceObservation {
                    address,
                    name: parsed,
                    signal,
                    max_signal: signal,
                    min_signal: signal,
                    last_seen: now,
                });
                slot
            }
        };
        &self.devices[slot]
    }

    fn age(observation: &DeviceObservation, now: SystemTime) -> Duration {
        // A clock step backwards reads as age zero, keeping the device fresh
        now.duration_since(observation.last_seen).unwrap_or_default()
    }

    fn collect(
        &self,
        now: SystemTime,
        estimator: &DistanceEstimator,
        keep: impl Fn(Duration) -> bool,
    ) -> Vec<DeviceSnapshot> {
        let mut entries: Vec<DeviceSnapshot> = self
            .devices
            .iter()
            .filter(|observation| keep(Self::age(observation, now)))
            .map(|observation| DeviceSnapshot {
                address: observation.address,
                name: observation.name.clone(),
                signal: observation.signal,
                max_signal: observation.max_signal,
                min_signal: observation.min_signal,
                last_seen: observation.last_seen,
                distance: estimator.estimate(observation.signal),
            })
            .collect();
        // Stable sort: equidistant devices keep first-seen order
        entries.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        entries
    }

    /// Devices seen within `max_age`, nearest first.
    pub fn snapshot(
        &self,
        now: SystemTime,
        max_age: Duration,
        estimator: &DistanceEstimator,
    ) -> Vec<DeviceSnapshot> {
        self.collect(now, estimator, |age| age <= max_age)
    }

    /// Devices not seen for longer than `max_age`, nearest first.
    pub fn stale_snapshot(
        &self,
        now: SystemTime,
        max_age: Duration,
        estimator: &DistanceEstimator,
    ) -> Vec<DeviceSnapshot> {
        self.collect(now, estimator, |age| age > max_age)
    }

    /// Forget devices unseen for longer than `older_than`.
    ///
    /// Returns how many were removed. Keeps insertion order for the
    /// survivors.
    pub fn evict_stale(&mut self, now: SystemTime, older_than: Duration) -> usize {
        let before = self.devices.len();
        self.devices
            .retain(|observation| Self::age(observation, now) <= older_than);
        let removed = before - self.devices.len();
        if removed > 0 {
            self.index = self
                .devices
                .iter()
                .enumerate()
                .map(|(slot, observation)| (observation.address, slot))
                .collect();
        }
        removed
    }
}
