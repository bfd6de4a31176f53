//! Simulated reader for development and testing.
//!
//! [`SimulatedTransport`] runs a small device actor that speaks the real wire
//! protocol: it parses the frames written by the host and answers with
//! encoded notifications. No I/O is involved, so sessions can be exercised
//! end to end without hardware.
//!
//! Writes still go through the [`CommandQueue`], which lets tests inject
//! transient write failures with [`SimulatorHandle::fail_next_writes`] and
//! watch the retry path work.

use bytes::{Bytes, BytesMut};
use handheld_core::{BarcodeRead, BatteryStatus, Epc, ReaderMode, TagReading, TriggerState};
use handheld_protocol::{Command, Notification, Opcode, ParsedFrame, StreamParser};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::link::{ActiveLink, EVENT_CHANNEL_CAPACITY, LinkSlot, report_link_lost};
use crate::queue::{CommandQueue, LinkWriter, QueueConfig, WriteError};
use crate::traits::{Transport, TransportEvent, TransportKind, WriteCompletion};

/// Ack status the simulator uses for commands it cannot honour.
const STATUS_REJECTED: u8 = 0x01;

/// Behaviour of the simulated reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Time `connect` takes, standing in for discovery.
    pub connect_delay: Duration,

    /// Delay before each command is answered.
    pub response_delay: Duration,

    /// Period of unsolicited battery reports; `None` disables them.
    pub battery_interval: Option<Duration>,

    /// Battery level reported until changed through the handle.
    pub battery: BatteryStatus,

    /// Tags in the field during inventory.
    pub tags: Vec<Epc>,

    /// Period between inventory rounds.
    pub tag_interval: Duration,

    /// Rounds before the reader reports scan completed; `None` streams
    /// until stopped.
    pub inventory_rounds: Option<u32>,

    /// Symbology and content of the barcode returned by a scan.
    pub barcode_symbology: u8,
    pub barcode: String,

    pub queue: QueueConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        let tags = [
            "E28011606000020D6A7B1F01",
            "E28011606000020D6A7B1F02",
            "300833B2DDD9014000000003",
        ]
        .iter()
        .filter_map(|hex| Epc::from_hex(hex).ok())
        .collect();

        Self {
            connect_delay: Duration::ZERO,
            response_delay: Duration::from_millis(20),
            battery_interval: Some(Duration::from_secs(30)),
            battery: BatteryStatus::new(4100, 85),
            tags,
            tag_interval: Duration::from_millis(100),
            inventory_rounds: None,
            barcode_symbology: 0x0B,
            barcode: "4006381333931".to_string(),
            queue: QueueConfig::default(),
        }
    }
}

impl SimulatorConfig {
    pub fn with_tags(mut self, tags: Vec<Epc>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_battery_interval(mut self, interval: Option<Duration>) -> Self {
        self.battery_interval = interval;
        self
    }

    pub fn with_inventory_rounds(mut self, rounds: Option<u32>) -> Self {
        self.inventory_rounds = rounds;
        self
    }

    pub fn with_barcode(mut self, data: impl Into<String>) -> Self {
        self.barcode = data.into();
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Out-of-band control of the simulated device.
#[derive(Debug)]
enum SimControl {
    Trigger(TriggerState),
    Battery(BatteryStatus),
    Disconnect(Option<String>),
    Inject(Bytes),
}

/// Simulated reader transport.
///
/// # Examples
///
/// ```
/// use handheld_transport::{SimulatedTransport, SimulatorConfig, Transport, TransportEvent};
/// use handheld_protocol::{Notification, NotificationDecoder};
/// use handheld_core::TriggerState;
///
/// # #[tokio::main]
/// # async fn main() -> handheld_transport::Result<()> {
/// let (mut transport, handle) = SimulatedTransport::new(SimulatorConfig::default());
/// let mut events = transport.connect().await?;
/// assert_eq!(events.recv().await, Some(TransportEvent::Connected));
///
/// handle.press_trigger();
/// let Some(TransportEvent::Data(bytes)) = events.recv().await else { panic!() };
/// let decoded = NotificationDecoder::new().decode(&bytes);
/// assert_eq!(decoded, vec![Notification::Trigger(TriggerState::Pressed)]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SimulatedTransport {
    config: SimulatorConfig,
    slot: Arc<LinkSlot>,
    control: Arc<Mutex<mpsc::UnboundedReceiver<SimControl>>>,
    fail_writes: Arc<AtomicU32>,
}

impl SimulatedTransport {
    /// Create a simulated reader and the handle that drives it.
    pub fn new(config: SimulatorConfig) -> (Self, SimulatorHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let fail_writes = Arc::new(AtomicU32::new(0));

        let transport = Self {
            config,
            slot: LinkSlot::new(),
            control: Arc::new(Mutex::new(control_rx)),
            fail_writes: Arc::clone(&fail_writes),
        };
        let handle = SimulatorHandle {
            control: control_tx,
            fail_writes,
        };

        (transport, handle)
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }
}

impl Transport for SimulatedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    async fn connect(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        if let Some(link) = self.slot.release() {
            link.shutdown();
        }
        if !self.config.connect_delay.is_zero() {
            tokio::time::sleep(self.config.connect_delay).await;
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (host_tx, host_rx) = mpsc::channel(self.config.queue.capacity.max(1));

        let writer = SimulatedWriter {
            to_device: host_tx,
            fail_writes: Arc::clone(&self.fail_writes),
        };
        let queue = CommandQueue::spawn(writer, self.config.queue.clone());
        self.slot.install(ActiveLink::new(queue));

        let _ = events_tx.send(TransportEvent::Connected).await;

        let actor = DeviceActor::new(self.config.clone(), events_tx);
        let task = tokio::spawn(actor.run(
            host_rx,
            Arc::clone(&self.control),
            Arc::clone(&self.slot),
        ));
        self.slot.attach(task);

        info!(tags = self.config.tags.len(), "Simulated reader connected");
        Ok(events_rx)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(link) = self.slot.release() {
            link.shutdown();
            info!("Simulated reader disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    fn write(&self, bytes: Bytes) -> Result<WriteCompletion> {
        self.slot.submit(bytes)
    }
}

/// Handle for controlling a simulated reader.
///
/// Cloneable; every clone drives the same device. Calls made while the
/// reader is disconnected are applied on the next connection.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    control: mpsc::UnboundedSender<SimControl>,
    fail_writes: Arc<AtomicU32>,
}

impl SimulatorHandle {
    pub fn press_trigger(&self) {
        self.send(SimControl::Trigger(TriggerState::Pressed));
    }

    pub fn release_trigger(&self) {
        self.send(SimControl::Trigger(TriggerState::Released));
    }

    /// Change the battery level and report it immediately.
    pub fn set_battery(&self, status: BatteryStatus) {
        self.send(SimControl::Battery(status));
    }

    /// Drop the link as if the reader went out of range.
    pub fn force_disconnect(&self, reason: impl Into<String>) {
        self.send(SimControl::Disconnect(Some(reason.into())));
    }

    /// Make the next `count` writes fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Deliver raw bytes to the host as if the reader sent them.
    pub fn inject_bytes(&self, bytes: impl Into<Bytes>) {
        self.send(SimControl::Inject(bytes.into()));
    }

    fn send(&self, control: SimControl) {
        if self.control.send(control).is_err() {
            debug!("Simulated reader dropped, control ignored");
        }
    }
}

struct SimulatedWriter {
    to_device: mpsc::Sender<Bytes>,
    fail_writes: Arc<AtomicU32>,
}

impl LinkWriter for SimulatedWriter {
    async fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), WriteError> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(WriteError::Transient("injected write failure".into()));
        }

        self.to_device
            .send(Bytes::copy_from_slice(bytes))
            .await
            .map_err(|_| WriteError::Fatal("simulated reader stopped".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanJob {
    Inventory,
    Locate(Epc),
}

/// The simulated device itself.
struct DeviceActor {
    config: SimulatorConfig,
    events: mpsc::Sender<TransportEvent>,
    parser: StreamParser,
    battery: BatteryStatus,
    mode: ReaderMode,
    scan: Option<ScanJob>,
    rounds: u32,
}

impl DeviceActor {
    fn new(config: SimulatorConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            battery: config.battery,
            config,
            events,
            parser: StreamParser::new(),
            mode: ReaderMode::Idle,
            scan: None,
            rounds: 0,
        }
    }

    async fn run(
        mut self,
        mut from_host: mpsc::Receiver<Bytes>,
        control: Arc<Mutex<mpsc::UnboundedReceiver<SimControl>>>,
        slot: Arc<LinkSlot>,
    ) {
        let mut controls = control.lock().await;
        let mut battery_tick = self.config.battery_interval.map(|period| {
            let mut tick = tokio::time::interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });
        let mut tag_tick =
            tokio::time::interval(self.config.tag_interval.max(Duration::from_millis(1)));
        tag_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                Some(bytes) = from_host.recv() => {
                    if !self.on_host_bytes(&bytes, &mut tag_tick).await {
                        break Some("event receiver dropped".to_string());
                    }
                }
                Some(control) = controls.recv() => {
                    match control {
                        SimControl::Disconnect(reason) => break reason,
                        other => {
                            if !self.on_control(other).await {
                                break Some("event receiver dropped".to_string());
                            }
                        }
                    }
                }
                _ = tick_opt(&mut battery_tick) => {
                    trace!("Simulated battery report");
                    if !self.emit(&[Notification::Battery(self.battery)]).await {
                        break Some("event receiver dropped".to_string());
                    }
                }
                _ = tag_tick.tick(), if self.scan.is_some() => {
                    if !self.inventory_round().await {
                        break Some("event receiver dropped".to_string());
                    }
                }
            }
        };

        report_link_lost(&slot, &self.events, reason).await;
    }

    async fn on_host_bytes(&mut self, bytes: &[u8], tag_tick: &mut Interval) -> bool {
        self.parser.feed(bytes);
        let frames: Vec<_> = self.parser.drain_frames().collect();

        for item in frames {
            let frame = match item {
                ParsedFrame::Frame(frame) => frame,
                ParsedFrame::Malformed { error, .. } => {
                    warn!(%error, "Simulator received malformed frame");
                    continue;
                }
            };
            match Command::from_frame(&frame) {
                Ok(command) => {
                    if !self.respond(&command, tag_tick).await {
                        return false;
                    }
                }
                Err(error) => warn!(%error, "Simulator received unknown command"),
            }
        }
        true
    }

    async fn respond(&mut self, command: &Command, tag_tick: &mut Interval) -> bool {
        tokio::time::sleep(self.config.response_delay).await;

        let opcode = command.opcode();
        let ack = Notification::Ack {
            opcode: opcode.as_u16(),
        };
        let reject = Notification::Error {
            opcode: opcode.as_u16(),
            status: STATUS_REJECTED,
        };
        debug!(%opcode, "Simulator handling command");

        let replies = match opcode {
            Opcode::QueryBattery => vec![ack, Notification::Battery(self.battery)],
            Opcode::QueryTrigger => vec![ack, Notification::Trigger(TriggerState::Released)],
            Opcode::SetReaderMode => match command.payload().first().map(|b| ReaderMode::from_u8(*b))
            {
                Some(Ok(mode)) => {
                    self.mode = mode;
                    vec![ack]
                }
                _ => vec![reject],
            },
            Opcode::ApplySettings if command.payload().len() == 3 => vec![ack],
            Opcode::StartInventory => self.start(ScanJob::Inventory, ack, tag_tick),
            Opcode::StartLocate => match locate_target(command.payload()) {
                Some(epc) => self.start(ScanJob::Locate(epc), ack, tag_tick),
                None => vec![reject],
            },
            Opcode::StopInventory => {
                if self.scan.take().is_some() {
                    vec![ack, Notification::ScanCompleted]
                } else {
                    vec![ack]
                }
            }
            Opcode::ScanBarcode => vec![
                ack,
                Notification::BarcodeRead(BarcodeRead::new(
                    self.config.barcode_symbology,
                    self.config.barcode.clone(),
                )),
                Notification::ScanCompleted,
            ],
            Opcode::StopBarcode => vec![ack],
            _ => vec![reject],
        };

        self.emit(&replies).await
    }

    fn start(
        &mut self,
        job: ScanJob,
        ack: Notification,
        tag_tick: &mut Interval,
    ) -> Vec<Notification> {
        self.scan = Some(job);
        self.rounds = 0;
        tag_tick.reset();
        vec![ack]
    }

    async fn on_control(&mut self, control: SimControl) -> bool {
        match control {
            SimControl::Trigger(state) => self.emit(&[Notification::Trigger(state)]).await,
            SimControl::Battery(status) => {
                self.battery = status;
                self.emit(&[Notification::Battery(status)]).await
            }
            SimControl::Inject(bytes) => self.send(TransportEvent::Data(bytes)).await,
            SimControl::Disconnect(_) => true,
        }
    }

    /// One pass over the tags in the field, sent as a single chunk.
    async fn inventory_round(&mut self) -> bool {
        let Some(job) = self.scan.clone() else {
            return true;
        };

        let mut tags: Vec<Notification> = match &job {
            ScanJob::Inventory => self
                .config
                .tags
                .iter()
                .enumerate()
                .map(|(i, epc)| {
                    let rssi = -40 - i8::try_from(i % 30).unwrap_or(0);
                    Notification::TagRead(TagReading::new(epc.clone(), rssi, 1))
                })
                .collect(),
            ScanJob::Locate(epc) => {
                let rssi = -70 + i8::try_from(self.rounds % 30).unwrap_or(0);
                vec![Notification::TagRead(TagReading::new(epc.clone(), rssi, 1))]
            }
        };

        self.rounds += 1;
        if let Some(limit) = self.config.inventory_rounds {
            if self.rounds >= limit {
                self.scan = None;
                tags.push(Notification::ScanCompleted);
            }
        }

        self.emit(&tags).await
    }

    /// Encode notifications into one inbound chunk.
    async fn emit(&mut self, notifications: &[Notification]) -> bool {
        let mut chunk = BytesMut::new();
        for notification in notifications {
            if let Some(frame) = notification.encode() {
                frame.encode_into(&mut chunk);
            }
        }
        if chunk.is_empty() {
            return true;
        }
        self.send(TransportEvent::Data(chunk.freeze())).await
    }

    async fn send(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn locate_target(payload: &[u8]) -> Option<Epc> {
    let (&len, rest) = payload.split_first()?;
    if rest.len() != usize::from(len) {
        return None;
    }
    Epc::new(rest.to_vec()).ok()
}
