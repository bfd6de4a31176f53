//! Radio transport over a service/characteristic link.
//!
//! [`RadioTransport`] holds the link-independent half of the radio path:
//! the reliable command queue in front of the write characteristic, the
//! forwarding of notifications as [`TransportEvent::Data`], and clean-up on
//! link loss. The platform half (discovery, GATT setup) lives behind
//! [`RadioAdapter`]; the Bluetooth LE implementation is
//! [`BleAdapter`](crate::ble::BleAdapter) with the `ble` feature.

use bytes::Bytes;
use handheld_core::constants::DEFAULT_DISCOVERY_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::link::{ActiveLink, EVENT_CHANNEL_CAPACITY, LinkSlot, report_link_lost};
use crate::queue::{CommandQueue, LinkWriter, QueueConfig};
use crate::traits::{Transport, TransportEvent, TransportKind, WriteCompletion};

/// Serial-over-GATT service exposed by the reader.
pub const DEFAULT_SERVICE_UUID: Uuid = uuid::uuid!("0000fff0-0000-1000-8000-00805f9b34fb");

/// Characteristic the host writes frames to.
pub const DEFAULT_WRITE_CHARACTERISTIC: Uuid =
    uuid::uuid!("0000fff2-0000-1000-8000-00805f9b34fb");

/// Characteristic the reader notifies frames on.
pub const DEFAULT_NOTIFY_CHARACTERISTIC: Uuid =
    uuid::uuid!("0000fff1-0000-1000-8000-00805f9b34fb");

/// Radio link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Service UUID used as the discovery filter.
    pub service_uuid: Uuid,

    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,

    /// Only connect to a reader advertising this name.
    pub device_name: Option<String>,

    /// How long discovery may take before giving up.
    pub discovery_timeout: Duration,

    pub queue: QueueConfig,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            write_characteristic: DEFAULT_WRITE_CHARACTERISTIC,
            notify_characteristic: DEFAULT_NOTIFY_CHARACTERISTIC,
            device_name: None,
            discovery_timeout: Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS),
            queue: QueueConfig::default(),
        }
    }
}

impl RadioConfig {
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Signal from the platform link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// Value notified on the notify characteristic.
    Notification(Bytes),

    /// The peripheral dropped the connection.
    Disconnected(Option<String>),
}

/// An open link: a writer for the write characteristic and the inbound
/// signal stream.
#[derive(Debug)]
pub struct RadioChannel<W> {
    pub writer: W,
    pub inbound: mpsc::Receiver<LinkSignal>,

    /// Name or address of the connected reader, for logging.
    pub device: String,
}

/// Platform half of the radio link.
pub trait RadioAdapter: Send + 'static {
    type Writer: LinkWriter;

    /// Discover a reader, connect, and subscribe to notifications.
    fn open(
        &mut self,
        config: &RadioConfig,
    ) -> impl Future<Output = Result<RadioChannel<Self::Writer>>> + Send;

    /// Drop the platform connection. Must tolerate being called when
    /// nothing is open.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Radio transport generic over the platform adapter.
#[derive(Debug)]
pub struct RadioTransport<A> {
    adapter: A,
    config: RadioConfig,
    slot: Arc<LinkSlot>,

    /// The adapter holds a platform connection. Outlives the slot when the
    /// peripheral drops the link on its own.
    adapter_open: bool,
}

impl<A: RadioAdapter> RadioTransport<A> {
    pub fn new(adapter: A, config: RadioConfig) -> Self {
        Self {
            adapter,
            config,
            slot: LinkSlot::new(),
            adapter_open: false,
        }
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    /// Stop the link and drop the platform connection, whichever of the
    /// two is still held.
    async fn teardown(&mut self) -> Result<()> {
        if let Some(link) = self.slot.release() {
            link.shutdown();
        }
        if self.adapter_open {
            self.adapter_open = false;
            self.adapter.close().await?;
            info!("Radio link disconnected");
        }
        Ok(())
    }
}

impl<A: RadioAdapter> Transport for RadioTransport<A> {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    async fn connect(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        self.teardown().await?;

        info!(service = %self.config.service_uuid, "Connecting radio link");
        let channel = match self.adapter.open(&self.config).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Radio link failed");
                // Leave nothing half-open.
                if let Err(close_err) = self.adapter.close().await {
                    debug!(error = %close_err, "Adapter close after failed open");
                }
                return Err(e);
            }
        };

        let RadioChannel {
            writer,
            inbound,
            device,
        } = channel;
        self.adapter_open = true;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let queue = CommandQueue::spawn(writer, self.config.queue.clone());
        self.slot.install(ActiveLink::new(queue));

        let _ = events_tx.send(TransportEvent::Connected).await;
        let task = tokio::spawn(forward_inbound(inbound, events_tx, Arc::clone(&self.slot)));
        self.slot.attach(task);

        info!(%device, "Radio link connected");
        Ok(events_rx)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.teardown().await
    }

    fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    fn write(&self, bytes: Bytes) -> Result<WriteCompletion> {
        self.slot.submit(bytes)
    }
}

async fn forward_inbound(
    mut inbound: mpsc::Receiver<LinkSignal>,
    events: mpsc::Sender<TransportEvent>,
    slot: Arc<LinkSlot>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(LinkSignal::Notification(bytes)) => {
                if events.send(TransportEvent::Data(bytes)).await.is_err() {
                    break Some("event receiver dropped".to_string());
                }
            }
            Some(LinkSignal::Disconnected(reason)) => break reason,
            None => break Some("radio link closed".to_string()),
        }
    };

    report_link_lost(&slot, &events, reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportError;
    use crate::queue::WriteError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Default)]
    struct FakeWriter {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        failures: Arc<Mutex<VecDeque<WriteError>>>,
    }

    impl LinkWriter for FakeWriter {
        async fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), WriteError> {
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            self.written.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    /// Adapter whose link is driven by the test through `peripheral`.
    #[derive(Default)]
    struct FakeAdapter {
        writer: FakeWriter,
        peripheral: Arc<Mutex<Option<mpsc::Sender<LinkSignal>>>>,
        refuse: bool,
        opens: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
    }

    impl FakeAdapter {
        fn peripheral(&self) -> Arc<Mutex<Option<mpsc::Sender<LinkSignal>>>> {
            Arc::clone(&self.peripheral)
        }
    }

    impl RadioAdapter for FakeAdapter {
        type Writer = FakeWriter;

        async fn open(&mut self, _config: &RadioConfig) -> Result<RadioChannel<FakeWriter>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(TransportError::device_not_found("HH-01"));
            }
            let (tx, inbound) = mpsc::channel(16);
            *self.peripheral.lock().unwrap() = Some(tx);
            Ok(RadioChannel {
                writer: self.writer.clone(),
                inbound,
                device: "HH-01".into(),
            })
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.peripheral.lock().unwrap().take();
            Ok(())
        }
    }

    fn signal(peripheral: &Arc<Mutex<Option<mpsc::Sender<LinkSignal>>>>) -> mpsc::Sender<LinkSignal> {
        peripheral.lock().unwrap().clone().unwrap()
    }

    #[tokio::test]
    async fn test_connect_forwards_notifications() {
        let adapter = FakeAdapter::default();
        let peripheral = adapter.peripheral();
        let mut radio = RadioTransport::new(adapter, RadioConfig::default());

        let mut events = radio.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(radio.is_connected());

        signal(&peripheral)
            .send(LinkSignal::Notification(Bytes::from_static(&[0xA7, 0xB3])))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Data(Bytes::from_static(&[0xA7, 0xB3])))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_go_through_retrying_queue() {
        let adapter = FakeAdapter::default();
        let writer = adapter.writer.clone();
        writer
            .failures
            .lock()
            .unwrap()
            .extend([WriteError::Transient("busy".into())]);
        let mut radio = RadioTransport::new(adapter, RadioConfig::default());
        let _events = radio.connect().await.unwrap();

        radio
            .write(Bytes::from_static(&[1, 2, 3]))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(*writer.written.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_external_disconnect_reported_once_and_handles_cleared() {
        let adapter = FakeAdapter::default();
        let peripheral = adapter.peripheral();
        let closes = Arc::clone(&adapter.closes);
        let mut radio = RadioTransport::new(adapter, RadioConfig::default());
        let mut events = radio.connect().await.unwrap();
        events.recv().await;

        let link = signal(&peripheral);
        link.send(LinkSignal::Disconnected(Some("supervision timeout".into())))
            .await
            .unwrap();
        // A second drop signal must not produce a second event.
        let _ = link.send(LinkSignal::Disconnected(None)).await;

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected {
                reason: Some("supervision timeout".into())
            })
        );
        assert_eq!(events.recv().await, None);
        assert!(!radio.is_connected());
        assert!(matches!(
            radio.write(Bytes::from_static(&[1])),
            Err(TransportError::NotConnected)
        ));

        // The link is gone but the platform connection is still held.
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        radio.disconnect().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(peripheral.lock().unwrap().is_none());

        radio.disconnect().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_link_loss_closes_stale_adapter() {
        let adapter = FakeAdapter::default();
        let peripheral = adapter.peripheral();
        let closes = Arc::clone(&adapter.closes);
        let opens = Arc::clone(&adapter.opens);
        let mut radio = RadioTransport::new(adapter, RadioConfig::default());
        let mut events = radio.connect().await.unwrap();
        events.recv().await;

        signal(&peripheral)
            .send(LinkSignal::Disconnected(None))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected { reason: None })
        );

        let mut events = radio.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(radio.is_connected());
    }

    #[tokio::test]
    async fn test_failed_open_leaves_nothing_behind() {
        let adapter = FakeAdapter {
            refuse: true,
            ..FakeAdapter::default()
        };
        let closes = Arc::clone(&adapter.closes);
        let mut radio = RadioTransport::new(adapter, RadioConfig::default());

        assert!(matches!(
            radio.connect().await,
            Err(TransportError::DeviceNotFound { .. })
        ));
        assert!(!radio.is_connected());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            radio.write(Bytes::from_static(&[1])),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let adapter = FakeAdapter::default();
        let closes = Arc::clone(&adapter.closes);
        let opens = Arc::clone(&adapter.opens);
        let mut radio = RadioTransport::new(adapter, RadioConfig::default());
        let mut events = radio.connect().await.unwrap();
        events.recv().await;

        radio.disconnect().await.unwrap();
        radio.disconnect().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Explicit disconnect ends the stream without a Disconnected event.
        assert_eq!(events.recv().await, None);

        let _events = radio.connect().await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(radio.is_connected());
    }
}
