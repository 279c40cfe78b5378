//! Webhook notification dispatch.
//!
//! Notifications are JSON documents POSTed to an IFTTT-style trigger URL.
//! The HTTP client sits behind a trait so dispatch logic is testable
//! without a network; transport failures are logged by the caller and
//! never reach the scan pipeline.

use crate::alias::{self, AliasMap};
use crate::mac_address::MacAddress;
use crate::registry::DeviceSnapshot;
use log::{debug, warn};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Default notification endpoint base.
pub const DEFAULT_BASE_URL: &str = "https://maker.ifttt.com";

/// Attempts per notification before giving up.
const MAX_ATTEMPTS: u32 = 3;
/// Pause between retry attempts.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Selects when notifications are sent. The two policies are never merged;
/// one must be chosen explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DispatchMode {
    /// Dispatch on every observation, rate-limited per device.
    #[default]
    Event,
    /// Dispatch one notification per tracked device on every reporting
    /// tick, whether or not anything changed.
    Interval,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Event => write!(f, "event"),
            DispatchMode::Interval => write!(f, "interval"),
        }
    }
}

/// JSON body accepted by the notification endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    /// Device address in canonical hex form
    pub value1: String,
    /// Latest signal-strength reading
    pub value2: i16,
    /// Device name, omitted when none was ever decoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value3: Option<String>,
}

/// Errors from notification delivery.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WebhookError {
    #[error("HTTP client setup failed: {0}")]
    Client(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("endpoint returned status {0}")]
    Status(u16),
}

/// HTTP POST abstraction so dispatch can be exercised without a network.
pub trait NotificationPoster: Send + Sync {
    fn post(
        &self,
        url: &str,
        payload: &NotificationPayload,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>>;
}

/// Real poster backed by reqwest.
pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl ReqwestPoster {
    pub fn new() -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(ReqwestPoster { client })
    }
}

impl NotificationPoster for ReqwestPoster {
    fn post(
        &self,
        url: &str,
        payload: &NotificationPayload,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .json(payload);
        Box::pin(async move {
            // The error is stripped of the request URL: the trigger URL
            // embeds the secret key and must not leak into logs
            let response = request
                .send()
                .await
                .map_err(|e| WebhookError::Transport(e.without_url().to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(WebhookError::Status(status.as_u16()));
            }
            Ok(())
        })
    }
}

/// Build the trigger URL for an event/key pair.
pub fn trigger_url(base: &str, event: &str, key: &str) -> String {
    format!(
        "{}/trigger/{}/with/key/{}",
        base.trim_end_matches('/'),
        event,
        key
    )
}

/// Redact a secret key for log output.
pub fn redact_key(key: &str) -> String {
    if key.chars().count() <= 4 {
        "****".to_string()
    } else {
        let prefix: String = key.chars().take(4).collect();
        format!("{prefix}...")
    }
}

/// Sends device notifications with bounded retry.
pub struct WebhookDispatcher {
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: String) -> Self {
        WebhookDispatcher { url }
    }

    /// POST one notification, retrying transient failures a bounded number
    /// of times.
    ///
    /// The final error is returned for the caller to log; delivery failure
    /// never aborts the pipeline.
    pub async fn dispatch(
        &self,
        poster: &dyn NotificationPoster,
        address: MacAddress,
        signal: i16,
        name: Option<&str>,
    ) -> Result<(), WebhookError> {
        let payload = NotificationPayload {
            value1: address.to_string(),
            value2: signal,
            value3: name.map(str::to_owned),
        };

        let mut attempt = 1;
        loop {
            match poster.post(&self.url, &payload).await {
                Ok(()) => {
                    debug!("sent notification for {address} (signal {signal})");
                    return Ok(());
                }
                Err(error) if attempt < MAX_ATTEMPTS => {
                    debug!("notification attempt {attempt} for {address} failed: {error}");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Dispatch one notification per device in a snapshot.
    ///
    /// Failures are logged per device; the sweep always completes.
    pub async fn dispatch_all(
        &self,
        poster: &dyn NotificationPoster,
        devices: &[DeviceSnapshot],
        aliases: &AliasMap,
    ) {
        for device in devices {
            let name = alias::notification_name(&device.address, &device.name, aliases);
            if let Err(error) = self
                .dispatch(poster, device.address, device.signal, name)
                .await
            {
                warn!("notification for {} failed: {error}", device.address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_MAC, snapshot_entry};
    use std::sync::Mutex;

    /// Records every request instead of sending it.
    #[derive(Default)]
    struct RecordingPoster {
        requests: Mutex<Vec<(String, NotificationPayload)>>,
    }

    impl NotificationPoster for RecordingPoster {
        fn post(
            &self,
            url: &str,
            payload: &NotificationPayload,
        ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), payload.clone()));
            Box::pin(async { Ok(()) })
        }
    }

    /// Fails a fixed number of times, then succeeds.
    struct FlakyPoster {
        failures_left: Mutex<u32>,
        attempts: Mutex<u32>,
    }

    impl FlakyPoster {
        fn new(failures: u32) -> Self {
            FlakyPoster {
                failures_left: Mutex::new(failures),
                attempts: Mutex::new(0),
            }
        }

        fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }
    }

    impl NotificationPoster for FlakyPoster {
        fn post(
            &self,
            _url: &str,
            _payload: &NotificationPayload,
        ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
            *self.attempts.lock().unwrap() += 1;
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                Box::pin(async { Err(WebhookError::Status(503)) })
            } else {
                Box::pin(async { Ok(()) })
            }
        }
    }

    #[test]
    fn test_trigger_url() {
        assert_eq!(
            trigger_url(DEFAULT_BASE_URL, "presence", "secret"),
            "https://maker.ifttt.com/trigger/presence/with/key/secret"
        );
        // Trailing slash on the base does not double up
        assert_eq!(
            trigger_url("http://localhost:8080/", "e", "k"),
            "http://localhost:8080/trigger/e/with/key/k"
        );
    }

    #[test]
    fn test_redact_key() {
        assert_eq!(redact_key("abcdef123456"), "abcd...");
        assert_eq!(redact_key("ab"), "****");
        assert_eq!(redact_key(""), "****");
    }

    #[test]
    fn test_payload_wire_shape() {
        let payload = NotificationPayload {
            value1: "aabbccddeeff".to_string(),
            value2: -60,
            value3: Some("Kitchen".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "value1": "aabbccddeeff",
                "value2": -60,
                "value3": "Kitchen",
            })
        );
    }

    #[test]
    fn test_payload_omits_missing_name() {
        let payload = NotificationPayload {
            value1: "aabbccddeeff".to_string(),
            value2: -60,
            value3: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("value3"));
    }

    #[test]
    fn test_dispatch_posts_payload() {
        let poster = RecordingPoster::default();
        let dispatcher = WebhookDispatcher::new("http://example.test/hook".to_string());

        tokio_test::block_on(dispatcher.dispatch(&poster, TEST_MAC, -60, Some("Tag"))).unwrap();

        let requests = poster.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "http://example.test/hook");
        assert_eq!(requests[0].1.value1, "aabbccddeeff");
        assert_eq!(requests[0].1.value2, -60);
        assert_eq!(requests[0].1.value3.as_deref(), Some("Tag"));
    }

    #[test]
    fn test_dispatch_retries_transient_failure() {
        let poster = FlakyPoster::new(2);
        let dispatcher = WebhookDispatcher::new("http://example.test/hook".to_string());

        tokio_test::block_on(dispatcher.dispatch(&poster, TEST_MAC, -60, None)).unwrap();
        assert_eq!(poster.attempts(), 3);
    }

    #[test]
    fn test_dispatch_gives_up_after_bounded_attempts() {
        let poster = FlakyPoster::new(10);
        let dispatcher = WebhookDispatcher::new("http://example.test/hook".to_string());

        let result = tokio_test::block_on(dispatcher.dispatch(&poster, TEST_MAC, -60, None));
        assert_eq!(result, Err(WebhookError::Status(503)));
        assert_eq!(poster.attempts(), 3);
    }

    #[test]
    fn test_dispatch_all_covers_every_device() {
        let poster = RecordingPoster::default();
        let dispatcher = WebhookDispatcher::new("http://example.test/hook".to_string());
        let devices = vec![
            snapshot_entry(TEST_MAC, -60, 1.14),
            snapshot_entry(MacAddress([1, 1, 1, 1, 1, 1]), -80, 9.52),
        ];

        tokio_test::block_on(dispatcher.dispatch_all(&poster, &devices, &AliasMap::new()));

        let requests = poster.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1.value2, -60);
        assert_eq!(requests[1].1.value1, "010101010101");
        // No decoded names in the fixtures, so value3 is absent
        assert_eq!(requests[0].1.value3, None);
    }

    #[test]
    fn test_dispatch_all_uses_alias() {
        let poster = RecordingPoster::default();
        let dispatcher = WebhookDispatcher::new("http://example.test/hook".to_string());
        let mut aliases = AliasMap::new();
        aliases.insert(TEST_MAC, "Kitchen".to_string());

        tokio_test::block_on(dispatcher.dispatch_all(
            &poster,
            &[snapshot_entry(TEST_MAC, -60, 1.14)],
            &aliases,
        ));

        let requests = poster.requests.lock().unwrap();
        assert_eq!(requests[0].1.value3.as_deref(), Some("Kitchen"));
    }
}
