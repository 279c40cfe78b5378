//! `beacon-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process
//! exit codes. The core pipeline lives in [`crate::app`] where it can be
//! tested deterministically with an injected scanner, notification poster,
//! and output streams.

pub mod advertisement;
pub mod alias;
pub mod app;
pub mod distance;
pub mod mac_address;
pub mod output;
pub mod registry;
pub mod scanner;
pub mod throttle;
pub mod webhook;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{LocalName, encode_local_name, parse_local_name};
pub use alias::{Alias, AliasMap, parse_alias, to_map};
pub use distance::DistanceEstimator;
pub use mac_address::MacAddress;
pub use output::SnapshotFormatter;
pub use output::table::TableFormatter;
pub use registry::{DeviceObservation, DeviceRegistry, DeviceSnapshot};
pub use scanner::{Backend, EventError, ScanError, ScanEvent, ScanEventResult};
pub use throttle::{Throttle, parse_duration};
pub use webhook::{
    DispatchMode, NotificationPayload, NotificationPoster, ReqwestPoster, WebhookDispatcher,
};
