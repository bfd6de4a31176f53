//! Bluetooth LE radio adapter built on `btleplug`.
//!
//! Discovery is filtered by the reader's service UUID. Frames are written to
//! the write characteristic with response, and values notified on the notify
//! characteristic become [`LinkSignal::Notification`]s. Adapter events are
//! watched for the peripheral's disconnection.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::queue::{LinkWriter, WriteError};
use crate::radio::{LinkSignal, RadioAdapter, RadioChannel, RadioConfig};

type CentralEvents = Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>;

/// Capacity of the notification channel between the BLE pump and the
/// transport.
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

fn ble_error(context: &str, e: btleplug::Error) -> TransportError {
    TransportError::connection_failed(format!("{context}: {e}"))
}

/// Radio adapter for the host's first Bluetooth controller.
#[derive(Debug, Default)]
pub struct BleAdapter {
    peripheral: Option<Peripheral>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl BleAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RadioAdapter for BleAdapter {
    type Writer = BleWriter;

    async fn open(&mut self, config: &RadioConfig) -> Result<RadioChannel<BleWriter>> {
        let manager = Manager::new()
            .await
            .map_err(|e| ble_error("bluetooth manager", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ble_error("list adapters", e))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::device_not_found("no bluetooth adapter"))?;

        let mut central_events = adapter
            .events()
            .await
            .map_err(|e| ble_error("adapter events", e))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![config.service_uuid],
            })
            .await
            .map_err(|e| ble_error("start scan", e))?;

        let found = tokio::time::timeout(
            config.discovery_timeout,
            discover(&adapter, &mut central_events, config),
        )
        .await;

        if let Err(e) = adapter.stop_scan().await {
            debug!(error = %e, "Failed to stop scan");
        }

        let (peripheral, device) = match found {
            Ok(result) => result?,
            Err(_) => {
                let wanted = config
                    .device_name
                    .clone()
                    .unwrap_or_else(|| config.service_uuid.to_string());
                return Err(TransportError::device_not_found(wanted));
            }
        };

        peripheral
            .connect()
            .await
            .map_err(|e| ble_error("connect", e))?;
        self.peripheral = Some(peripheral.clone());

        peripheral
            .discover_services()
            .await
            .map_err(|e| ble_error("discover services", e))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: uuid::Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| {
                    TransportError::connection_failed(format!("characteristic {uuid} missing"))
                })
        };
        let write_char = find(config.write_characteristic)?;
        let notify_char = find(config.notify_characteristic)?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| ble_error("subscribe", e))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| ble_error("notifications", e))?;

        let (signals, inbound) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let peripheral_id = peripheral.id();
        let notify_uuid = notify_char.uuid;
        self.pump = Some(tokio::spawn(async move {
            let mut notifications = notifications;
            loop {
                tokio::select! {
                    value = notifications.next() => match value {
                        Some(value) if value.uuid == notify_uuid => {
                            trace!(len = value.value.len(), "BLE notification");
                            if signals
                                .send(LinkSignal::Notification(Bytes::from(value.value)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => {
                            lost(&signals, "notification stream ended").await;
                            break;
                        }
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            lost(&signals, "peripheral disconnected").await;
                            break;
                        }
                        Some(_) => {}
                        None => {
                            lost(&signals, "adapter event stream ended").await;
                            break;
                        }
                    },
                }
            }
        }));

        info!(%device, "BLE reader connected");
        Ok(RadioChannel {
            writer: BleWriter {
                peripheral,
                characteristic: write_char,
            },
            inbound,
            device,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(peripheral) = self.peripheral.take() {
            peripheral
                .disconnect()
                .await
                .map_err(|e| ble_error("disconnect", e))?;
        }
        Ok(())
    }
}

async fn lost(signals: &mpsc::Sender<LinkSignal>, reason: &str) {
    let _ = signals
        .send(LinkSignal::Disconnected(Some(reason.to_string())))
        .await;
}

/// Wait for the first advertised reader matching the configuration.
async fn discover(
    adapter: &Adapter,
    events: &mut CentralEvents,
    config: &RadioConfig,
) -> Result<(Peripheral, String)> {
    while let Some(event) = events.next().await {
        let CentralEvent::DeviceDiscovered(id) = event else {
            continue;
        };
        let Ok(peripheral) = adapter.peripheral(&id).await else {
            continue;
        };
        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };

        if let Some(wanted) = &config.device_name {
            if name.as_deref() != Some(wanted.as_str()) {
                trace!(?name, "Skipping reader with other name");
                continue;
            }
        }

        let device = name.unwrap_or_else(|| peripheral.address().to_string());
        debug!(%device, "Reader discovered");
        return Ok((peripheral, device));
    }

    Err(TransportError::connection_failed("adapter event stream ended"))
}

/// Writes frames to the reader's write characteristic.
#[derive(Debug)]
pub struct BleWriter {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl LinkWriter for BleWriter {
    async fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), WriteError> {
        self.peripheral
            .write(&self.characteristic, bytes, WriteType::WithResponse)
            .await
            .map_err(classify_write_error)
    }
}

/// Timeouts and busy controllers are worth another try; anything else
/// means the link is unusable.
fn classify_write_error(error: btleplug::Error) -> WriteError {
    let message = error.to_string();
    match error {
        btleplug::Error::TimedOut(_) => WriteError::Transient(message),
        _ if message.to_ascii_lowercase().contains("busy") => WriteError::Transient(message),
        _ => {
            warn!(error = %message, "BLE write failed");
            WriteError::Fatal(message)
        }
    }
}
