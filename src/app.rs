//! Core application runner (business logic) for `beacon-listener`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit
//! codes so it can be tested deterministically with an injected scanner,
//! notification poster, and output streams.

use crate::alias::{self, Alias, AliasMap};
use crate::distance::{DEFAULT_TX_POWER, DistanceEstimator};
use crate::output::table::{DEFAULT_NAME_WIDTH, TableFormatter};
use crate::output::{CLEAR_SCREEN, SnapshotFormatter};
use crate::registry::DeviceRegistry;
use crate::scanner::{Backend, ScanError, ScanEventResult};
use crate::throttle::{Throttle, parse_duration};
use crate::webhook::{
    DEFAULT_BASE_URL, DispatchMode, NotificationPoster, WebhookDispatcher, redact_key, trigger_url,
};
use clap::Parser;
use log::{debug, info, warn};
use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Reference signal strength at one meter, in dBm, calibrating the
    /// distance estimate.
    #[arg(long, default_value_t = DEFAULT_TX_POWER, allow_negative_numbers = true)]
    pub tx_power: i16,

    /// Devices unseen for longer than this move to the "recently lost"
    /// section. Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    pub max_age: Duration,

    /// Forget devices unseen for longer than this entirely. Unset means
    /// devices are tracked for the lifetime of the process.
    #[arg(long, value_parser = parse_duration)]
    pub evict_after: Option<Duration>,

    /// How often the console table is redrawn and interval-mode
    /// notifications go out.
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub report_interval: Duration,

    /// Width of the name column in the console table.
    #[arg(long, default_value_t = DEFAULT_NAME_WIDTH)]
    pub name_width: usize,

    /// Specify human-readable alias for a device.
    /// Format: --alias aa:bb:cc:dd:ee:ff=Kitchen
    #[arg(long = "alias", value_parser = alias::parse_alias, value_name = "ALIAS")]
    pub aliases: Vec<Alias>,

    /// Webhook event name; enables notification dispatch together with
    /// --webhook-key.
    #[arg(long, requires = "webhook_key")]
    pub webhook_event: Option<String>,

    /// Webhook secret key; treated as opaque and never logged in full.
    #[arg(long, requires = "webhook_event")]
    pub webhook_key: Option<String>,

    /// Base URL of the notification endpoint.
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub webhook_url: String,

    /// When notifications are sent: on each observation (rate-limited per
    /// device) or in bulk on every reporting tick.
    #[arg(long, value_enum, default_value_t)]
    pub dispatch: DispatchMode,

    /// Minimum interval between event-mode notifications per device.
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub cooldown: Duration,

    /// Disable the live console table.
    #[arg(long)]
    pub no_dashboard: bool,

    /// Keep previous renders in the scrollback instead of clearing the
    /// screen before each redraw.
    #[arg(long)]
    pub no_clear: bool,

    /// Verbose output, print per-event scan errors
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Scanner abstraction to enable deterministic unit tests without
/// Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
        verbose: bool,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<ScanEventResult>, ScanError>> + Send + '_>,
    >;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
        verbose: bool,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<ScanEventResult>, ScanError>> + Send + '_>,
    > {
        Box::pin(async move { crate::scanner::start_scan(backend, verbose).await })
    }
}

fn lock_registry(registry: &Mutex<DeviceRegistry>) -> MutexGuard<'_, DeviceRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One reporting tick: evict if configured, render the table, and in
/// interval mode notify every tracked device.
#[allow(clippy::too_many_arguments)]
async fn report(
    registry: &Mutex<DeviceRegistry>,
    options: &Options,
    estimator: &DistanceEstimator,
    formatter: &dyn SnapshotFormatter,
    dispatcher: Option<&WebhookDispatcher>,
    poster: &dyn NotificationPoster,
    aliases: &AliasMap,
    out: &mut dyn Write,
) -> io::Result<()> {
    let now = SystemTime::now();
    let (nearby, lost) = {
        let mut registry = lock_registry(registry);
        if let Some(window) = options.evict_after {
            let evicted = registry.evict_stale(now, window);
            if evicted > 0 {
                debug!("evicted {evicted} stale devices");
            }
        }
        (
            registry.snapshot(now, options.max_age, estimator),
            registry.stale_snapshot(now, options.max_age, estimator),
        )
    };

    if !options.no_dashboard {
        if !options.no_clear {
            write!(out, "{CLEAR_SCREEN}")?;
        }
        write!(out, "{}", formatter.format(&nearby, &lost, now))?;
        out.flush()?;
    }

    if let Some(dispatcher) = dispatcher
        && options.dispatch == DispatchMode::Interval
    {
        dispatcher.dispatch_all(poster, &nearby, aliases).await;
        dispatcher.dispatch_all(poster, &lost, aliases).await;
    }

    Ok(())
}

/// Run the core processing loop.
///
/// Scan events update the registry and, in event dispatch mode, trigger
/// rate-limited notifications. A periodic tick renders the console table to
/// `out` and, in interval dispatch mode, notifies every tracked device.
/// Per-event scan errors go to `err` when verbose. Returns after the scan
/// stream closes, following one final render.
pub async fn run_with_io(
    options: Options,
    scanner: &dyn Scanner,
    poster: &dyn NotificationPoster,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError> {
    let aliases: AliasMap = alias::to_map(&options.aliases);
    let estimator = DistanceEstimator::new(options.tx_power);
    let formatter = TableFormatter::new(options.name_width, aliases.clone());
    let registry = Mutex::new(DeviceRegistry::new());

    let dispatcher = match (&options.webhook_event, &options.webhook_key) {
        (Some(event), Some(key)) => {
            info!("notifying event '{}' (key {})", event, redact_key(key));
            Some(WebhookDispatcher::new(trigger_url(
                &options.webhook_url,
                event,
                key,
            )))
        }
        _ => None,
    };
    let mut throttle = Throttle::new(options.cooldown);

    let mut events = scanner.start_scan(options.backend, options.verbose).await?;

    let mut ticker = tokio::time::interval(options.report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        let now = SystemTime::now();
                        let observation = lock_registry(&registry)
                            .observe(event.address, event.signal, &event.payload, now)
                            .clone();

                        if let Some(dispatcher) = &dispatcher
                            && options.dispatch == DispatchMode::Event
                            && throttle.should_emit(event.address)
                        {
                            let name = alias::notification_name(
                                &observation.address,
                                &observation.name,
                                &aliases,
                            );
                            if let Err(error) = dispatcher
                                .dispatch(poster, observation.address, observation.signal, name)
                                .await
                            {
                                warn!("notification for {} failed: {error}", observation.address);
                            }
                        }
                    }
                    Some(Err(event_error)) => {
                        if options.verbose {
                            writeln!(err, "{event_error}")?;
                        }
                    }
                    None => break,
                }
            },
            _ = ticker.tick() => {
                report(
                    &registry,
                    &options,
                    &estimator,
                    &formatter,
                    dispatcher.as_ref(),
                    poster,
                    &aliases,
                    out,
                )
                .await?;
            }
        }
    }

    // The scan stream is gone; render once more so short sessions still
    // leave a table behind. No dispatch on the way out.
    report(
        &registry, &options, &estimator, &formatter, None, poster, &aliases, out,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::encode_local_name;
    use crate::mac_address::MacAddress;
    use crate::scanner::{EventError, ScanEvent};
    use crate::webhook::{NotificationPayload, WebhookError};

    #[derive(Debug)]
    struct FakeScanner {
        results: Mutex<Vec<ScanEventResult>>,
    }

    impl FakeScanner {
        fn new(results: Vec<ScanEventResult>) -> Self {
            Self {
                results: Mutex::new(results),
            }
        }
    }

    impl Scanner for FakeScanner {
        fn start_scan(
            &self,
            _backend: Backend,
            _verbose: bool,
        ) -> Pin<
            Box<
                dyn Future<Output = Result<mpsc::Receiver<ScanEventResult>, ScanError>>
                    + Send
                    + '_,
            >,
        > {
            let results = self.results.lock().unwrap().clone();
            Box::pin(async move {
                let (tx, rx) = mpsc::channel::<ScanEventResult>(results.len().max(1));
                tokio::spawn(async move {
                    for result in results {
                        let _ = tx.send(result).await;
                    }
                    // drop tx to close channel
                });
                Ok(rx)
            })
        }
    }

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

    fn event(tail: u8, signal: i16, name: &str) -> ScanEventResult {
        Ok(ScanEvent {
            address: MacAddress([tail, tail, tail, tail, tail, tail]),
            signal,
            payload: encode_local_name(name),
        })
    }

    fn options() -> Options {
        Options {
            tx_power: DEFAULT_TX_POWER,
            max_age: Duration::from_secs(60),
            evict_after: None,
            // Long interval and cooldown keep fast tests deterministic
            report_interval: Duration::from_secs(3600),
            name_width: DEFAULT_NAME_WIDTH,
            aliases: vec![],
            webhook_event: None,
            webhook_key: None,
            webhook_url: DEFAULT_BASE_URL.to_string(),
            dispatch: DispatchMode::Event,
            cooldown: Duration::from_secs(3600),
            no_dashboard: false,
            no_clear: true,
            verbose: false,
            backend: Backend::default(),
        }
    }

    async fn run(
        options: Options,
        scanner: &FakeScanner,
        poster: &RecordingPoster,
    ) -> (String, String) {
        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        run_with_io(options, scanner, poster, &mut out, &mut err)
            .await
            .unwrap();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[tokio::test]
    async fn run_renders_devices_sorted_by_distance() {
        let scanner = FakeScanner::new(vec![
            event(1, -80, "charlie"), // farthest
            event(2, -45, "alpha"),   // nearest
            event(3, -60, "bravo"),   // middle
        ]);
        let poster = RecordingPoster::default();

        let (out, err) = run(options(), &scanner, &poster).await;

        assert!(err.is_empty());
        assert!(out.contains("3 nearby, 0 recently lost"));

        // Nearest first in the final render
        let alpha = out.rfind("alpha").unwrap();
        let bravo = out.rfind("bravo").unwrap();
        let charlie = out.rfind("charlie").unwrap();
        assert!(alpha < bravo && bravo < charlie);

        // Distances from the path-loss curve at the default calibration
        assert!(out.contains("0.07")); // -45 dBm
        assert!(out.contains("1.14")); // -60 dBm
        assert!(out.contains("9.52")); // -80 dBm

        assert!(out.contains("020202020202"));
        assert!(poster.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_merges_repeat_observations() {
        let scanner = FakeScanner::new(vec![
            event(1, -60, "tag"),
            event(1, -40, "tag"),
        ]);
        let poster = RecordingPoster::default();

        let (out, _) = run(options(), &scanner, &poster).await;

        assert!(out.contains("1 nearby, 0 recently lost"));
        // Current -40, max -40, min -60 on one row
        assert!(out.contains("-40"));
        assert!(out.contains("-60"));
    }

    #[tokio::test]
    async fn run_event_dispatch_respects_cooldown() {
        let scanner = FakeScanner::new(vec![
            event(1, -60, "tag"),
            event(1, -40, "tag"), // same device inside the cooldown
            event(2, -50, "other"),
        ]);
        let poster = RecordingPoster::default();
        let mut options = options();
        options.webhook_event = Some("presence".to_string());
        options.webhook_key = Some("secret".to_string());
        options.no_dashboard = true;

        run(options, &scanner, &poster).await;

        let requests = poster.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].0,
            "https://maker.ifttt.com/trigger/presence/with/key/secret"
        );
        assert_eq!(requests[0].1.value1, "010101010101");
        assert_eq!(requests[0].1.value2, -60);
        assert_eq!(requests[0].1.value3.as_deref(), Some("tag"));
        assert_eq!(requests[1].1.value1, "020202020202");
    }

    #[tokio::test]
    async fn run_no_dispatch_without_webhook_config() {
        let scanner = FakeScanner::new(vec![event(1, -60, "tag")]);
        let poster = RecordingPoster::default();

        run(options(), &scanner, &poster).await;

        assert!(poster.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_prints_event_errors_only_when_verbose() {
        let results = vec![Err(EventError::MalformedReport("bad packet".to_string()))];

        // non-verbose: nothing written
        let scanner = FakeScanner::new(results.clone());
        let poster = RecordingPoster::default();
        let (_, err) = run(options(), &scanner, &poster).await;
        assert!(err.is_empty());

        // verbose: error is written to err
        let scanner = FakeScanner::new(results);
        let mut verbose = options();
        verbose.verbose = true;
        let (_, err) = run(verbose, &scanner, &poster).await;
        assert!(err.contains("Malformed advertising report: bad packet"));
    }

    #[tokio::test]
    async fn run_applies_alias_to_output_and_dispatch() {
        let scanner = FakeScanner::new(vec![event(1, -60, "advertised")]);
        let poster = RecordingPoster::default();
        let mut options = options();
        options.aliases = vec![Alias {
            address: MacAddress([1, 1, 1, 1, 1, 1]),
            name: "Kitchen".to_string(),
        }];
        options.webhook_event = Some("presence".to_string());
        options.webhook_key = Some("secret".to_string());

        let (out, _) = run(options, &scanner, &poster).await;

        assert!(out.contains("Kitchen"));
        let requests = poster.requests.lock().unwrap();
        assert_eq!(requests[0].1.value3.as_deref(), Some("Kitchen"));
    }

    #[tokio::test]
    async fn run_dashboard_can_be_disabled() {
        let scanner = FakeScanner::new(vec![event(1, -60, "tag")]);
        let poster = RecordingPoster::default();
        let mut options = options();
        options.no_dashboard = true;

        let (out, _) = run(options, &scanner, &poster).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn run_clears_screen_unless_disabled() {
        let scanner = FakeScanner::new(vec![event(1, -60, "tag")]);
        let poster = RecordingPoster::default();
        let mut options = options();
        options.no_clear = false;

        let (out, _) = run(options, &scanner, &poster).await;
        assert!(out.contains(CLEAR_SCREEN));
    }
}
