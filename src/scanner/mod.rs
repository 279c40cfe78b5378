//! BLE scan backends.
//!
//! This module provides a trait-free dispatch over feature-gated scanning
//! backends. Each backend delivers raw advertisement events, who sent what
//! and how loud, over a bounded channel; interpretation happens downstream
//! in the registry.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use thiserror::Error;
use tokio::sync::mpsc;

/// One advertisement as delivered by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    /// Hardware address of the advertiser
    pub address: MacAddress,
    /// Received signal strength in dBm (more negative = weaker)
    pub signal: i16,
    /// Raw advertisement record bytes
    pub payload: Vec<u8>,
}

/// Per-event errors, surfaced on the channel only in verbose mode.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    /// An advertising report that could not be carved into an event
    #[error("Malformed advertising report: {0}")]
    MalformedReport(String),
    /// Transient Bluetooth error while handling a device
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Convenience alias for scan events or per-event errors.
pub type ScanEventResult = Result<ScanEvent, EventError>;

/// Errors that prevent a scan session from starting.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[allow(dead_code)]
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

/// Channel buffer size for scan events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Start scanning for advertisements using the specified backend.
///
/// This is the main entry point for creating a scanner. It dispatches to
/// the appropriate backend implementation based on the `backend` parameter.
///
/// # Arguments
/// * `backend` - The scanner backend to use
/// * `verbose` - If true, per-event errors are sent as Err values;
///   otherwise they're silently dropped.
///
/// # Returns
/// A receiver for scan events (or per-event errors if verbose).
pub async fn start_scan(
    backend: Backend,
    verbose: bool,
) -> Result<mpsc::Receiver<ScanEventResult>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(verbose).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(verbose).await,
    }
}
