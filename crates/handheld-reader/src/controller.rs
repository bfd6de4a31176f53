//! Device controller actor.
//!
//! The controller task exclusively owns the transport and the reader state
//! machine. The session talks to it through a request channel and hears back
//! through an event channel; nothing else touches the link.
//!
//! Writes are submitted to the transport's queue and their completions are
//! collected in the select loop, so notifications keep flowing while a
//! command waits out a retry delay. The queue keeps the writes themselves
//! strictly ordered.
//!
//! Scan rules:
//!
//! - only `Connected` may start a scan; the state flips to `Scanning` when
//!   the start command is queued and back if the write fails
//! - a mode change requested while scanning is held until the scan ends;
//!   a newer request replaces it and the older caller gets `Superseded`
//! - on scan completion with `continuous` set, a restart is scheduled after
//!   the settle delay and re-validated against the flag and the state when
//!   it fires
//! - trigger reports are forwarded as events and never start a scan

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use handheld_core::{ReaderMode, ReaderState, ScanSettings, TagReading};
use handheld_protocol::{Command, Notification, NotificationDecoder};
use handheld_transport::{
    AnyTransport, ConnectedTransport, SimulatorHandle, Transport, TransportEvent, TransportFactory,
    TransportKind,
};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{ReaderError, Result};
use crate::events::ReaderEvent;
use crate::state::{ReaderStateMachine, StateHistory};

pub(crate) type Reply = oneshot::Sender<Result<()>>;

/// Requests accepted by the controller.
#[derive(Debug)]
pub(crate) enum ControlRequest {
    SetMode { mode: ReaderMode, reply: Reply },
    SetSettings { settings: ScanSettings, reply: Reply },
    StartScanning { reply: Reply },
    StopScanning { reply: Reply },
    History { reply: oneshot::Sender<StateHistory> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Where the controller gets its transport from.
#[derive(Debug)]
pub(crate) enum TransportSource {
    Factory(TransportFactory),
    Prebuilt(AnyTransport),
}

#[derive(Debug, Clone)]
pub(crate) struct ControllerConfig {
    pub settle_delay: Duration,
    pub battery_poll_interval: Option<Duration>,
    pub request_capacity: usize,
}

impl From<&SessionConfig> for ControllerConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            settle_delay: config.settle_delay,
            battery_poll_interval: config.battery_poll_interval,
            request_capacity: config.event_capacity.max(1),
        }
    }
}

/// What the session keeps of a running controller.
#[derive(Debug)]
pub(crate) struct ControllerLink {
    pub requests: mpsc::Sender<ControlRequest>,
    pub state: watch::Receiver<ReaderState>,
    pub kind: TransportKind,
    pub simulator: Option<SimulatorHandle>,
}

/// Spawn a controller and wait until its transport is connected.
///
/// On failure the controller has already exited and the transport holds no
/// resources.
pub(crate) async fn start(
    source: TransportSource,
    config: ControllerConfig,
    events: mpsc::Sender<ReaderEvent>,
) -> Result<ControllerLink> {
    let (state_tx, state_rx) = watch::channel(ReaderState::Disconnected);
    let (requests_tx, requests_rx) = mpsc::channel(config.request_capacity);
    let (ready_tx, ready_rx) = oneshot::channel();

    let lifecycle = Lifecycle {
        machine: ReaderStateMachine::new(),
        state: state_tx,
        events,
    };
    tokio::spawn(run(source, config, lifecycle, requests_rx, ready_tx));

    let (kind, simulator) = ready_rx.await.map_err(|_| ReaderError::SessionClosed)??;
    Ok(ControllerLink {
        requests: requests_tx,
        state: state_rx,
        kind,
        simulator,
    })
}

type Ready = oneshot::Sender<Result<(TransportKind, Option<SimulatorHandle>)>>;

async fn run(
    source: TransportSource,
    config: ControllerConfig,
    mut lifecycle: Lifecycle,
    requests: mpsc::Receiver<ControlRequest>,
    ready: Ready,
) {
    lifecycle.enter(ReaderState::Connecting).await;

    let connected = match open(source).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(error = %e, "Reader connection failed");
            lifecycle.enter(ReaderState::Disconnected).await;
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let ConnectedTransport {
        transport,
        events,
        simulator,
    } = connected;
    let kind = transport.kind();

    lifecycle.enter(ReaderState::Connected).await;
    if ready.send(Ok((kind, simulator))).is_err() {
        debug!("Session gave up before the reader connected");
    }

    info!(transport = %kind, "Reader controller running");
    DeviceController::new(transport, lifecycle, config)
        .run(requests, events)
        .await;
}

async fn open(source: TransportSource) -> handheld_transport::Result<ConnectedTransport> {
    match source {
        TransportSource::Factory(factory) => factory.connect().await,
        TransportSource::Prebuilt(mut transport) => {
            let events = transport.connect().await?;
            Ok(ConnectedTransport {
                transport,
                events,
                simulator: None,
            })
        }
    }
}

/// State machine plus the channels that publish it.
struct Lifecycle {
    machine: ReaderStateMachine,
    state: watch::Sender<ReaderState>,
    events: mpsc::Sender<ReaderEvent>,
}

impl Lifecycle {
    fn current(&self) -> ReaderState {
        self.machine.current()
    }

    async fn enter(&mut self, to: ReaderState) {
        match self.machine.transition_to(to) {
            Ok(transition) => {
                self.state.send_replace(to);
                debug!(from = %transition.from, to = %transition.to, "Reader state changed");
                self.emit(ReaderEvent::StateChanged {
                    from: transition.from,
                    to: transition.to,
                })
                .await;
            }
            Err(e) => warn!(error = %e, "Reader state change rejected"),
        }
    }

    async fn emit(&self, event: ReaderEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Session no longer listening");
        }
    }
}

/// What a queued write was for.
#[derive(Debug)]
enum Op {
    SetMode {
        mode: ReaderMode,
    },
    ApplySettings {
        settings: ScanSettings,
        previous: Option<ScanSettings>,
    },
    StartScan,
    StopScan,
    Query(&'static str),
}

struct Completed {
    op: Op,
    reply: Option<Reply>,
    result: handheld_transport::Result<()>,
}

enum Exit {
    Shutdown(Option<oneshot::Sender<()>>),
    Lost(Option<String>),
}

struct DeviceController {
    transport: AnyTransport,
    lifecycle: Lifecycle,
    config: ControllerConfig,
    decoder: NotificationDecoder,

    /// Mode the reader is believed to be in (including queued changes).
    mode: Option<ReaderMode>,

    /// Last mode the reader acknowledged.
    confirmed_mode: Option<ReaderMode>,

    /// Mode writes queued or in flight.
    mode_writes: usize,
    settings: Option<ScanSettings>,

    /// Mode of the scan in progress, for picking the stop command.
    scan_mode: Option<ReaderMode>,
    deferred_mode: Option<(ReaderMode, Reply)>,
    stop_requested: bool,
    restart_at: Option<Instant>,

    inflight: FuturesUnordered<BoxFuture<'static, Completed>>,
}

impl DeviceController {
    fn new(transport: AnyTransport, lifecycle: Lifecycle, config: ControllerConfig) -> Self {
        Self {
            transport,
            lifecycle,
            config,
            decoder: NotificationDecoder::new(),
            mode: None,
            confirmed_mode: None,
            mode_writes: 0,
            settings: None,
            scan_mode: None,
            deferred_mode: None,
            stop_requested: false,
            restart_at: None,
            inflight: FuturesUnordered::new(),
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        self.submit(Command::query_battery(), Op::Query("battery"), None);
        self.submit(Command::query_trigger(), Op::Query("trigger"), None);

        let mut battery_poll = self.config.battery_poll_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let exit = loop {
            let restart_at = self.restart_at;

            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        if let ControlFlow::Break(reply) = self.handle_request(request).await {
                            break Exit::Shutdown(Some(reply));
                        }
                    }
                    None => break Exit::Shutdown(None),
                },
                event = transport_events.recv() => match event {
                    Some(TransportEvent::Disconnected { reason }) => break Exit::Lost(reason),
                    Some(event) => self.handle_transport_event(event).await,
                    None => break Exit::Lost(Some("transport event stream ended".to_string())),
                },
                Some(done) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.on_completed(done).await;
                }
                _ = tokio::time::sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.on_restart_due().await;
                }
                _ = tick(&mut battery_poll), if battery_poll.is_some() => {
                    self.submit(Command::query_battery(), Op::Query("battery"), None);
                }
            }
        };

        self.finish(exit).await;
    }

    async fn handle_request(&mut self, request: ControlRequest) -> ControlFlow<oneshot::Sender<()>> {
        match request {
            ControlRequest::SetMode { mode, reply } => self.set_mode(mode, reply),
            ControlRequest::SetSettings { settings, reply } => self.set_settings(settings, reply),
            ControlRequest::StartScanning { reply } => self.start_scanning(reply).await,
            ControlRequest::StopScanning { reply } => self.stop_scanning(reply),
            ControlRequest::History { reply } => {
                let _ = reply.send(self.lifecycle.machine.snapshot());
            }
            ControlRequest::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    /// Queue a command. On immediate rejection the reply (if any) gets the
    /// error and `false` is returned.
    fn submit(&mut self, command: Command, op: Op, reply: Option<Reply>) -> bool {
        let opcode = command.opcode();
        match self.transport.write(command.encode()) {
            Ok(completion) => {
                trace!(?opcode, "Command queued");
                self.inflight.push(
                    async move {
                        let result = completion.await;
                        Completed { op, reply, result }
                    }
                    .boxed(),
                );
                true
            }
            Err(e) => {
                warn!(?opcode, error = %e, "Command rejected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
                false
            }
        }
    }

    fn set_mode(&mut self, mode: ReaderMode, reply: Reply) {
        if self.lifecycle.current() == ReaderState::Scanning {
            if self.mode == Some(mode) {
                self.supersede_deferred();
                let _ = reply.send(Ok(()));
                return;
            }
            debug!(%mode, "Mode change deferred until the scan stops");
            self.supersede_deferred();
            self.deferred_mode = Some((mode, reply));
            return;
        }

        self.apply_mode(mode, Some(reply));
    }

    fn supersede_deferred(&mut self) {
        if let Some((mode, reply)) = self.deferred_mode.take() {
            let _ = reply.send(Err(ReaderError::Superseded { mode }));
        }
    }

    fn apply_mode(&mut self, mode: ReaderMode, reply: Option<Reply>) {
        // A change still in flight may fail, so only a settled mode counts.
        if self.mode == Some(mode) && self.mode_writes == 0 {
            trace!(%mode, "Mode already active");
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }

        // A pending continuous restart belongs to the old mode.
        self.restart_at = None;
        let previous = self.mode.replace(mode);
        if self.submit(Command::set_reader_mode(mode), Op::SetMode { mode }, reply) {
            self.mode_writes += 1;
        } else {
            self.mode = previous;
        }
    }

    fn set_settings(&mut self, settings: ScanSettings, reply: Reply) {
        if let Err(e) = settings.validate() {
            let _ = reply.send(Err(e.into()));
            return;
        }
        if self.settings.as_ref() == Some(&settings) {
            let _ = reply.send(Ok(()));
            return;
        }

        let command = Command::apply_settings(&settings);
        let previous = self.settings.replace(settings.clone());
        let op = Op::ApplySettings {
            settings,
            previous: previous.clone(),
        };
        if !self.submit(command, op, Some(reply)) {
            self.settings = previous;
        }
    }

    fn scan_settings(&self) -> ScanSettings {
        self.settings.clone().unwrap_or_default()
    }

    fn scan_command(&self, mode: ReaderMode) -> Result<Command> {
        let settings = self.scan_settings();
        match mode {
            ReaderMode::Idle => Err(ReaderError::invalid_request(
                "no scan mode selected (reader is idle)",
            )),
            ReaderMode::Inventory => Ok(Command::start_inventory(&settings)),
            ReaderMode::Locate => settings
                .locate_target
                .as_ref()
                .map(Command::start_locate)
                .ok_or_else(|| ReaderError::invalid_request("locate mode needs a target EPC")),
            ReaderMode::Barcode => Ok(Command::scan_barcode()),
        }
    }

    async fn start_scanning(&mut self, reply: Reply) {
        match self.lifecycle.current() {
            ReaderState::Scanning => {
                let _ = reply.send(Ok(()));
                return;
            }
            ReaderState::Connected => {}
            state => {
                let _ = reply.send(Err(ReaderError::invalid_request(format!(
                    "cannot start scanning while {state}"
                ))));
                return;
            }
        }

        let mode = self.mode.unwrap_or_default();
        match self.scan_command(mode) {
            Ok(command) => self.begin_scan(mode, command, Some(reply)).await,
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn begin_scan(&mut self, mode: ReaderMode, command: Command, reply: Option<Reply>) {
        self.restart_at = None;
        self.stop_requested = false;
        self.scan_mode = Some(mode);
        self.lifecycle.enter(ReaderState::Scanning).await;

        if !self.submit(command, Op::StartScan, reply) {
            self.leave_scanning().await;
        }
    }

    fn stop_scanning(&mut self, reply: Reply) {
        if self.restart_at.take().is_some() {
            debug!("Continuous restart cancelled");
        }
        if self.lifecycle.current() != ReaderState::Scanning {
            let _ = reply.send(Ok(()));
            return;
        }

        let command = match self.scan_mode {
            Some(ReaderMode::Barcode) => Command::stop_barcode(),
            _ => Command::stop_inventory(),
        };
        self.stop_requested = true;
        if !self.submit(command, Op::StopScan, Some(reply)) {
            self.stop_requested = false;
        }
    }

    /// Back to `Connected`, applying a deferred mode change.
    ///
    /// Returns whether a deferred mode was applied.
    async fn leave_scanning(&mut self) -> bool {
        if self.lifecycle.current() != ReaderState::Scanning {
            return false;
        }
        self.scan_mode = None;
        self.stop_requested = false;
        self.lifecycle.enter(ReaderState::Connected).await;

        match self.deferred_mode.take() {
            Some((mode, reply)) => {
                debug!(%mode, "Applying deferred mode change");
                self.apply_mode(mode, Some(reply));
                true
            }
            None => false,
        }
    }

    async fn on_completed(&mut self, done: Completed) {
        let Completed { op, reply, result } = done;

        match (&op, &result) {
            (Op::SetMode { mode }, Ok(())) => {
                self.mode_writes = self.mode_writes.saturating_sub(1);
                if self.mode_writes == 0 {
                    self.mode = Some(*mode);
                }
                if self.confirmed_mode.replace(*mode) != Some(*mode) {
                    info!(%mode, "Reader mode changed");
                    self.lifecycle.emit(ReaderEvent::ModeChanged(*mode)).await;
                }
            }
            (Op::SetMode { mode }, Err(e)) => {
                warn!(%mode, error = %e, "Mode change failed");
                self.mode_writes = self.mode_writes.saturating_sub(1);
                if self.mode_writes == 0 {
                    self.mode = self.confirmed_mode;
                }
            }
            (Op::ApplySettings { settings, previous }, Err(e)) => {
                warn!(error = %e, "Applying scan settings failed");
                if self.settings.as_ref() == Some(settings) {
                    self.settings = previous.clone();
                }
            }
            (Op::ApplySettings { .. }, Ok(())) => debug!("Scan settings applied"),
            (Op::StartScan, Ok(())) => debug!("Scan started"),
            (Op::StartScan, Err(e)) => {
                warn!(error = %e, "Scan start failed");
                self.leave_scanning().await;
            }
            (Op::StopScan, Ok(())) => {
                debug!("Scan stopped");
                self.leave_scanning().await;
            }
            (Op::StopScan, Err(e)) => {
                warn!(error = %e, "Scan stop failed");
                self.stop_requested = false;
            }
            (Op::Query(what), Err(e)) => debug!(query = what, error = %e, "Status query failed"),
            (Op::Query(_), Ok(())) => {}
        }

        if let Some(reply) = reply {
            let _ = reply.send(result.map_err(ReaderError::from));
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(bytes) => self.on_data(&bytes).await,
            TransportEvent::Error { message } => warn!(%message, "Transport reported an error"),
            TransportEvent::Connected => trace!("Transport connected again"),
            // Handled by the select loop.
            TransportEvent::Disconnected { .. } => {}
        }
    }

    async fn on_data(&mut self, bytes: &[u8]) {
        let mut tags = Vec::new();

        for notification in self.decoder.decode(bytes) {
            trace!(kind = notification.kind(), "Notification");
            if let Notification::TagRead(tag) = notification {
                tags.push(tag);
                continue;
            }
            self.flush_tags(&mut tags).await;

            match notification {
                Notification::BarcodeRead(barcode) => {
                    self.lifecycle.emit(ReaderEvent::BarcodeRead(barcode)).await;
                }
                Notification::Battery(status) => {
                    self.lifecycle.emit(ReaderEvent::BatteryUpdate(status)).await;
                }
                Notification::Trigger(trigger) => {
                    debug!(?trigger, "Trigger changed");
                    self.lifecycle.emit(ReaderEvent::TriggerChanged(trigger)).await;
                }
                Notification::ScanCompleted => self.on_scan_completed().await,
                Notification::Ack { opcode } => trace!(opcode = format_args!("{opcode:#06x}"), "Ack"),
                Notification::Error { opcode, status } => warn!(
                    opcode = format_args!("{opcode:#06x}"),
                    status, "Reader rejected command"
                ),
                Notification::Unrecognized(frame) => debug!(
                    reason = ?frame.reason,
                    len = frame.raw.len(),
                    "Unrecognized frame ignored"
                ),
                Notification::TagRead(_) => {}
            }
        }

        self.flush_tags(&mut tags).await;
    }

    async fn flush_tags(&mut self, tags: &mut Vec<TagReading>) {
        if !tags.is_empty() {
            trace!(count = tags.len(), "Tags read");
            self.lifecycle
                .emit(ReaderEvent::TagRead(std::mem::take(tags)))
                .await;
        }
    }

    async fn on_scan_completed(&mut self) {
        if self.lifecycle.current() != ReaderState::Scanning {
            trace!("Scan completion outside a scan");
            return;
        }

        let stop_requested = self.stop_requested;
        let deferred_applied = self.leave_scanning().await;
        let continuous = self.settings.as_ref().is_some_and(|s| s.continuous);

        if continuous && !stop_requested && !deferred_applied {
            let delay = self.config.settle_delay;
            debug!(delay_ms = delay.as_millis() as u64, "Continuous scan restart scheduled");
            self.restart_at = Some(Instant::now() + delay);
        }
    }

    async fn on_restart_due(&mut self) {
        self.restart_at = None;

        let continuous = self.settings.as_ref().is_some_and(|s| s.continuous);
        if !continuous || self.lifecycle.current() != ReaderState::Connected {
            debug!("Continuous restart skipped");
            return;
        }

        let mode = self.mode.unwrap_or_default();
        match self.scan_command(mode) {
            Ok(command) => self.begin_scan(mode, command, None).await,
            Err(e) => warn!(error = %e, "Continuous restart not possible"),
        }
    }

    async fn finish(mut self, exit: Exit) {
        self.restart_at = None;
        if let Some((_, reply)) = self.deferred_mode.take() {
            let _ = reply.send(Err(ReaderError::SessionClosed));
        }

        match exit {
            Exit::Shutdown(reply) => {
                if let Err(e) = self.transport.disconnect().await {
                    warn!(error = %e, "Transport disconnect failed");
                }
                self.lifecycle.enter(ReaderState::Disconnected).await;
                info!("Reader controller stopped");
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Exit::Lost(reason) => {
                warn!(reason = reason.as_deref().unwrap_or("unknown"), "Reader link lost");
                if let Err(e) = self.transport.disconnect().await {
                    debug!(error = %e, "Cleanup after link loss failed");
                }
                self.lifecycle.enter(ReaderState::Disconnected).await;
                self.lifecycle
                    .emit(ReaderEvent::TransportDisconnected { reason })
                    .await;
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
