//! BlueZ D-Bus backend.
//!
//! This backend drives discovery through the `bluer` crate and the
//! `bluetoothd` daemon. BlueZ decodes advertisements before handing them
//! over, so the advertised name is re-encoded into a local-name record;
//! both backends then deliver the exact same event shape.

use super::{EVENT_CHANNEL_BUFFER_SIZE, EventError, ScanError, ScanEvent, ScanEventResult};
use crate::advertisement::encode_local_name;
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, Session};
use futures::{StreamExt, pin_mut};
use tokio::sync::mpsc;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start scanning using the BlueZ D-Bus backend.
///
/// Powers the default adapter, starts device discovery, and forwards every
/// discovered device plus its subsequent RSSI updates as scan events. Runs
/// indefinitely until interrupted.
///
/// # Arguments
/// * `verbose` - If true, per-device Bluetooth errors are sent as Err
///   values; otherwise they're silently dropped.
pub async fn start_scan(verbose: bool) -> Result<mpsc::Receiver<ScanEventResult>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

    // Spawn a task that owns all Bluetooth state and runs the event loop.
    // The discovery stream borrows the adapter, so it is created in here.
    tokio::spawn(async move {
        let _session = session;

        let discovery = match adapter.discover_devices().await {
            Ok(discovery) => discovery,
            Err(e) => {
                let _ = tx.send(Err(EventError::Bluetooth(e.to_string()))).await;
                return;
            }
        };
        pin_mut!(discovery);

        while let Some(event) = discovery.next().await {
            if let AdapterEvent::DeviceAdded(address) = event
                && let Err(e) = watch_device(&adapter, address, &tx).await
                && verbose
            {
                let _ = tx.send(Err(EventError::Bluetooth(e.to_string()))).await;
            }
        }
    });

    Ok(rx)
}

/// Emit the device's current state and follow its RSSI updates from a task
/// of its own.
async fn watch_device(
    adapter: &Adapter,
    address: Address,
    tx: &mpsc::Sender<ScanEventResult>,
) -> bluer::Result<()> {
    let device = adapter.device(address)?;
    let name = device.name().await?;

    if let Some(rssi) = device.rssi().await? {
        let _ = tx
            .send(Ok(advertisement_event(address, rssi, name.as_deref())))
            .await;
    }

    let tx = tx.clone();
    tokio::spawn(async move {
        let events = match device.events().await {
            Ok(events) => events,
            Err(_) => return,
        };
        pin_mut!(events);

        let mut name = name;
        while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
            match property {
                DeviceProperty::Name(updated) => name = Some(updated),
                DeviceProperty::Rssi(rssi) => {
                    let _ = tx
                        .send(Ok(advertisement_event(address, rssi, name.as_deref())))
                        .await;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// Normalize a BlueZ observation into the pipeline's event shape.
fn advertisement_event(address: Address, signal: i16, name: Option<&str>) -> ScanEvent {
    ScanEvent {
        address: address.into(),
        signal,
        payload: name.map(encode_local_name).unwrap_or_default(),
    }
}
