//! Bridge server.
//!
//! Listens for proxy clients and serves one at a time. A client connects,
//! sends `{"type":"connect","device":<class>}`, and once the backing reader
//! link is up gets `{"type":"connected"}`. From then on `write` requests go
//! to the reader and everything the reader sends comes back as
//! `notification` messages.
//!
//! ```text
//!  host ──TCP/JSON lines──► BridgeServer ──► Transport ──► reader
//!                                  ▲              │
//!                                  └── events ◄───┘
//! ```
//!
//! Clients arriving while another one is served get an `error` message and
//! are closed.

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::SinkExt;
use handheld_core::constants::DEFAULT_BRIDGE_REQUEST_TIMEOUT_MS;
use handheld_transport::proxy::{DEFAULT_BRIDGE_PORT, DEFAULT_DEVICE_CLASS, line_codec, to_line};
use handheld_transport::{
    AnyTransport, ConnectedTransport, ProxyMessage, ProxyRequest, SimulatorConfig, Transport,
    TransportConfig, TransportEvent, TransportFactory, WriteCompletion,
};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, trace, warn};

use crate::error::{BridgeError, Result};

type LineFramed = Framed<TcpStream, LinesCodec>;

/// Reason sent to the client when the bridge stops.
const SHUTDOWN_REASON: &str = "bridge shutting down";

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,

    /// Device class clients must name in their `connect` request.
    pub device_class: String,

    /// How long a client may take to send `connect`.
    pub handshake_timeout: Duration,

    /// Link to the reader, opened per client.
    pub transport: TransportConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BRIDGE_PORT)),
            device_class: DEFAULT_DEVICE_CLASS.to_string(),
            handshake_timeout: Duration::from_millis(DEFAULT_BRIDGE_REQUEST_TIMEOUT_MS),
            transport: TransportConfig::simulated(SimulatorConfig::default()),
        }
    }
}

impl BridgeConfig {
    pub fn new(bind_addr: SocketAddr, transport: TransportConfig) -> Self {
        Self {
            bind_addr,
            transport,
            ..Self::default()
        }
    }

    pub fn with_device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = class.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// TCP server relaying one proxy client to one reader link.
#[derive(Debug)]
pub struct BridgeServer {
    listener: TcpListener,
    config: BridgeConfig,
}

impl BridgeServer {
    /// Bind the listener. Clients are served once [`run`](Self::run) is
    /// called.
    pub async fn bind(config: BridgeConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| BridgeError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        info!(
            addr = %config.bind_addr,
            device_class = %config.device_class,
            "Bridge listening"
        );
        Ok(Self { listener, config })
    }

    /// Actual listening address (useful when bound to port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Serve clients until the process ends.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve clients until `shutdown` resolves, then close the active client
    /// and its reader link.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut active: Option<JoinHandle<()>> = None;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept client");
                        continue;
                    }
                },
                () = &mut shutdown => break,
            };

            if active.as_ref().is_some_and(|task| !task.is_finished()) {
                warn!(%peer, "Bridge busy, turning client away");
                tokio::spawn(turn_away(stream, peer));
                continue;
            }

            info!(%peer, "Client connected");
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "Could not disable Nagle");
            }
            let client = ClientConnection {
                framed: Framed::new(stream, line_codec()),
                peer,
            };
            active = Some(tokio::spawn(client.serve(
                self.config.clone(),
                stop_rx.clone(),
            )));
        }

        info!("Bridge shutting down");
        let _ = stop_tx.send(true);
        if let Some(task) = active {
            if let Err(e) = task.await {
                error!(error = %e, "Client task failed");
            }
        }
        Ok(())
    }
}

async fn turn_away(stream: TcpStream, peer: SocketAddr) {
    let mut framed = Framed::new(stream, line_codec());
    let busy = ProxyMessage::Error {
        error: "bridge busy: another client is connected".to_string(),
    };
    if let Err(e) = send(&mut framed, &busy).await {
        debug!(%peer, error = %e, "Busy notice not delivered");
    }
}

async fn send(framed: &mut LineFramed, message: &ProxyMessage) -> Result<()> {
    let line = to_line(message)?;
    framed
        .send(line)
        .await
        .map_err(|e| BridgeError::Codec(e.to_string()))
}

/// Why a relay session ended.
#[derive(Debug)]
enum Exit {
    /// The client sent `disconnect`.
    Requested,
    ClientGone(Option<String>),
    ReaderLost(Option<String>),
    Shutdown,
}

/// A client that has not yet been handed a reader.
struct ClientConnection {
    framed: LineFramed,
    peer: SocketAddr,
}

impl ClientConnection {
    async fn serve(mut self, config: BridgeConfig, stop: watch::Receiver<bool>) {
        let peer = self.peer;
        match self.open(&config).await {
            Ok(connected) => {
                let relay = Relay {
                    framed: self.framed,
                    peer,
                    transport: connected.transport,
                    pending: FuturesUnordered::new(),
                };
                relay.run(connected.events, stop).await;
            }
            Err(e) => {
                warn!(%peer, error = %e, "Client session not opened");
                if !matches!(e, BridgeError::ClientClosed) {
                    let refusal = ProxyMessage::Error {
                        error: e.to_string(),
                    };
                    if let Err(e) = send(&mut self.framed, &refusal).await {
                        debug!(%peer, error = %e, "Refusal not delivered");
                    }
                }
            }
        }
    }

    /// Wait for `connect`, open the reader link and confirm it.
    async fn open(&mut self, config: &BridgeConfig) -> Result<ConnectedTransport> {
        let timeout = config.handshake_timeout;
        let request = tokio::time::timeout(timeout, self.next_request())
            .await
            .map_err(|_| BridgeError::HandshakeTimeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        match request {
            ProxyRequest::Connect { device } if device == config.device_class => {
                debug!(peer = %self.peer, %device, "Connect requested");
            }
            ProxyRequest::Connect { device } => return Err(BridgeError::UnknownDevice { device }),
            other => {
                return Err(BridgeError::UnexpectedRequest {
                    request: format!("{other:?}"),
                });
            }
        }

        let factory = TransportFactory::new(config.transport.clone());
        let mut connected = factory.connect().await?;

        if let Err(e) = send(&mut self.framed, &ProxyMessage::Connected).await {
            let _ = connected.transport.disconnect().await;
            return Err(e);
        }
        info!(
            peer = %self.peer,
            transport = %connected.transport.kind(),
            "Reader connected for client"
        );
        Ok(connected)
    }

    async fn next_request(&mut self) -> Result<ProxyRequest> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(serde_json::from_str(&line)?),
            Some(Err(e)) => Err(BridgeError::Codec(e.to_string())),
            None => Err(BridgeError::ClientClosed),
        }
    }
}

/// A connected client and its reader link.
struct Relay {
    framed: LineFramed,
    peer: SocketAddr,
    transport: AnyTransport,
    pending: FuturesUnordered<WriteCompletion>,
}

impl Relay {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        let exit = loop {
            let flow = tokio::select! {
                line = self.framed.next() => match line {
                    Some(Ok(line)) => self.on_line(&line).await,
                    Some(Err(e)) => ControlFlow::Break(Exit::ClientGone(Some(e.to_string()))),
                    None => ControlFlow::Break(Exit::ClientGone(None)),
                },
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => ControlFlow::Break(Exit::ReaderLost(None)),
                },
                Some(result) = self.pending.next(), if !self.pending.is_empty() => {
                    match result {
                        Ok(()) => ControlFlow::Continue(()),
                        Err(e) => self.reply(ProxyMessage::Error { error: e.to_string() }).await,
                    }
                }
                _ = async { stop.wait_for(|stop| *stop).await.map(drop) } => ControlFlow::Break(Exit::Shutdown),
            };
            if let ControlFlow::Break(exit) = flow {
                break exit;
            }
        };

        self.finish(exit).await;
    }

    async fn on_line(&mut self, line: &str) -> ControlFlow<Exit> {
        let request = match serde_json::from_str::<ProxyRequest>(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Malformed client request");
                return self
                    .reply(ProxyMessage::Error {
                        error: format!("malformed request: {e}"),
                    })
                    .await;
            }
        };

        match request {
            ProxyRequest::Write { data } => {
                trace!(peer = %self.peer, len = data.len(), "Client write");
                match self.transport.write(Bytes::from(data)) {
                    Ok(completion) => {
                        self.pending.push(completion);
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        self.reply(ProxyMessage::Error {
                            error: e.to_string(),
                        })
                        .await
                    }
                }
            }
            ProxyRequest::Disconnect => ControlFlow::Break(Exit::Requested),
            ProxyRequest::Connect { .. } => {
                self.reply(ProxyMessage::Error {
                    error: "already connected".to_string(),
                })
                .await
            }
        }
    }

    async fn on_event(&mut self, event: TransportEvent) -> ControlFlow<Exit> {
        match event {
            TransportEvent::Data(bytes) => {
                self.reply(ProxyMessage::Notification {
                    data: bytes.to_vec(),
                })
                .await
            }
            TransportEvent::Error { message } => {
                self.reply(ProxyMessage::Error { error: message }).await
            }
            TransportEvent::Connected => ControlFlow::Continue(()),
            TransportEvent::Disconnected { reason } => ControlFlow::Break(Exit::ReaderLost(reason)),
        }
    }

    async fn reply(&mut self, message: ProxyMessage) -> ControlFlow<Exit> {
        match send(&mut self.framed, &message).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(Exit::ClientGone(Some(e.to_string()))),
        }
    }

    async fn finish(mut self, exit: Exit) {
        let peer = self.peer;
        if let Err(e) = self.transport.disconnect().await {
            warn!(%peer, error = %e, "Reader disconnect failed");
        }

        let notice = match exit {
            Exit::Requested => {
                info!(%peer, "Client disconnected");
                None
            }
            Exit::ClientGone(reason) => {
                info!(%peer, reason = reason.as_deref().unwrap_or("closed"), "Client went away");
                None
            }
            Exit::ReaderLost(reason) => {
                warn!(%peer, reason = reason.as_deref().unwrap_or("unknown"), "Reader link lost");
                Some(ProxyMessage::Disconnected { reason })
            }
            Exit::Shutdown => Some(ProxyMessage::Disconnected {
                reason: Some(SHUTDOWN_REASON.to_string()),
            }),
        };

        if let Some(notice) = notice {
            if let Err(e) = send(&mut self.framed, &notice).await {
                debug!(%peer, error = %e, "Disconnect notice not delivered");
            }
        }
    }
}
