//! Proxy transport: the reader link lives in a bridge process reached over TCP.
//!
//! Messages are JSON objects, one per line, tagged by `type`:
//!
//! ```text
//! host -> bridge   {"type":"connect","device":"handheld"}
//!                  {"type":"write","data":[167,179,...]}
//!                  {"type":"disconnect"}
//! bridge -> host   {"type":"connected"}
//!                  {"type":"notification","data":[...]}
//!                  {"type":"error","error":"..."}
//!                  {"type":"disconnected","reason":"..."}
//! ```
//!
//! The TCP connect is tried `connect_attempts` times with a fixed delay. The
//! session is live once the bridge answers the `connect` request with
//! `connected` within the handshake timeout.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use handheld_core::constants::{
    DEFAULT_PROXY_CONNECT_ATTEMPTS, DEFAULT_PROXY_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_PROXY_RETRY_DELAY_MS,
};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::link::{ActiveLink, EVENT_CHANNEL_CAPACITY, LinkSlot, report_link_lost};
use crate::queue::{CommandQueue, LinkWriter, QueueConfig, WriteError};
use crate::traits::{Transport, TransportEvent, TransportKind, WriteCompletion};

/// Port the bridge listens on by default.
pub const DEFAULT_BRIDGE_PORT: u16 = 7878;

/// Longest accepted JSON line. A full frame as a number array fits easily.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Device class requested when none is configured.
pub const DEFAULT_DEVICE_CLASS: &str = "handheld";

/// Message sent by the host to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyRequest {
    Connect { device: String },
    Write { data: Vec<u8> },
    Disconnect,
}

/// Message sent by the bridge to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyMessage {
    Connected,
    Notification {
        data: Vec<u8>,
    },
    Error {
        error: String,
    },
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Line codec shared by both ends of the proxy link.
pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

/// Serialize a proxy message to a single JSON line.
pub fn to_line<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub(crate) fn codec_error(error: LinesCodecError) -> TransportError {
    match error {
        LinesCodecError::Io(e) => TransportError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            TransportError::connection_failed("proxy line exceeds maximum length")
        }
    }
}

/// Proxy link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bridge address.
    pub addr: SocketAddr,

    /// Device class named in the `connect` request.
    pub device_class: String,

    /// Number of TCP connect attempts before giving up.
    pub connect_attempts: u32,

    /// Fixed delay between connect attempts.
    pub retry_delay: Duration,

    /// How long the bridge may take to confirm the device connection,
    /// including its own discovery of the reader.
    pub handshake_timeout: Duration,

    pub queue: QueueConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BRIDGE_PORT)),
            device_class: DEFAULT_DEVICE_CLASS.to_string(),
            connect_attempts: DEFAULT_PROXY_CONNECT_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_PROXY_RETRY_DELAY_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_PROXY_HANDSHAKE_TIMEOUT_MS),
            queue: QueueConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    pub fn with_device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = class.into();
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

type LineFramed = Framed<TcpStream, LinesCodec>;
type LineSink = Arc<Mutex<SplitSink<LineFramed, String>>>;
type LineStream = SplitStream<LineFramed>;

/// Transport that talks to a bridge process over TCP.
///
/// # Example
///
/// ```no_run
/// use handheld_transport::{ProxyConfig, ProxyTransport, Transport};
///
/// # async fn example() -> handheld_transport::Result<()> {
/// let mut proxy = ProxyTransport::new(ProxyConfig::new("192.168.0.20:7878".parse().unwrap()));
/// let mut events = proxy.connect().await?;
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProxyTransport {
    config: ProxyConfig,
    slot: Arc<LinkSlot>,
    sink: Option<LineSink>,
}

impl ProxyTransport {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            slot: LinkSlot::new(),
            sink: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    async fn open_stream(&self) -> Result<TcpStream> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!(addr = %self.config.addr, attempt, attempts, "Connecting to bridge");
            match TcpStream::connect(self.config.addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(addr = %self.config.addr, attempt, error = %e, "Bridge connect failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(TransportError::connection_failed(format!(
            "bridge {} unreachable after {attempts} attempt(s): {reason}",
            self.config.addr
        )))
    }

    async fn handshake(&self, sink: &LineSink, stream: &mut LineStream) -> Result<()> {
        let request = ProxyRequest::Connect {
            device: self.config.device_class.clone(),
        };
        sink.lock()
            .await
            .send(to_line(&request)?)
            .await
            .map_err(codec_error)?;

        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, await_connected(stream)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::handshake_timeout(timeout.as_millis() as u64)),
        }
    }

    async fn release_link(&mut self) {
        if let Some(link) = self.slot.release() {
            link.shutdown();
            if let Some(sink) = &self.sink {
                let mut sink = sink.lock().await;
                if let Ok(line) = to_line(&ProxyRequest::Disconnect) {
                    if let Err(e) = sink.send(line).await {
                        debug!(error = %e, "Bridge gone before disconnect");
                    }
                }
                let _ = sink.close().await;
            }
            info!(addr = %self.config.addr, "Proxy link disconnected");
        }
        self.sink = None;
    }
}

/// Read bridge messages until the device connection is confirmed or refused.
async fn await_connected(stream: &mut LineStream) -> Result<()> {
    while let Some(line) = stream.next().await {
        let line = line.map_err(codec_error)?;
        match serde_json::from_str::<ProxyMessage>(&line)? {
            ProxyMessage::Connected => return Ok(()),
            ProxyMessage::Error { error } => {
                return Err(TransportError::connection_failed(format!(
                    "bridge refused connection: {error}"
                )));
            }
            ProxyMessage::Disconnected { reason } => {
                return Err(TransportError::connection_failed(format!(
                    "bridge reported disconnect: {}",
                    reason.as_deref().unwrap_or("no reason given")
                )));
            }
            ProxyMessage::Notification { data } => {
                trace!(len = data.len(), "Notification before handshake ignored");
            }
        }
    }

    Err(TransportError::connection_failed(
        "bridge closed connection during handshake",
    ))
}

impl Transport for ProxyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Proxy
    }

    async fn connect(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        self.release_link().await;

        let stream = self.open_stream().await?;
        let (sink, mut lines) = Framed::new(stream, line_codec()).split();
        let sink = Arc::new(Mutex::new(sink));

        if let Err(e) = self.handshake(&sink, &mut lines).await {
            warn!(addr = %self.config.addr, error = %e, "Bridge handshake failed");
            return Err(e);
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let writer = ProxyWriter {
            sink: Arc::clone(&sink),
        };
        let queue = CommandQueue::spawn(writer, self.config.queue.clone());
        self.slot.install(ActiveLink::new(queue));
        self.sink = Some(sink);

        let _ = events_tx.send(TransportEvent::Connected).await;
        let task = tokio::spawn(read_bridge(lines, events_tx, Arc::clone(&self.slot)));
        self.slot.attach(task);

        info!(addr = %self.config.addr, device = %self.config.device_class, "Proxy link connected");
        Ok(events_rx)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.release_link().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    fn write(&self, bytes: Bytes) -> Result<WriteCompletion> {
        self.slot.submit(bytes)
    }
}

/// Forward bridge messages as transport events until the link ends.
async fn read_bridge(
    mut lines: LineStream,
    events: mpsc::Sender<TransportEvent>,
    slot: Arc<LinkSlot>,
) {
    let reason = loop {
        let event = match lines.next().await {
            Some(Ok(line)) => match serde_json::from_str::<ProxyMessage>(&line) {
                Ok(ProxyMessage::Notification { data }) => TransportEvent::Data(Bytes::from(data)),
                Ok(ProxyMessage::Error { error }) => TransportEvent::Error { message: error },
                Ok(ProxyMessage::Disconnected { reason }) => {
                    break reason.or_else(|| Some("bridge reported disconnect".to_string()));
                }
                Ok(ProxyMessage::Connected) => {
                    trace!("Duplicate connected message");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Malformed bridge message");
                    TransportEvent::Error {
                        message: format!("malformed bridge message: {e}"),
                    }
                }
            },
            Some(Err(e)) => break Some(e.to_string()),
            None => break Some("bridge closed connection".to_string()),
        };

        if events.send(event).await.is_err() {
            break Some("event receiver dropped".to_string());
        }
    };

    report_link_lost(&slot, &events, reason).await;
}

/// Sends queued frames as `write` messages. Socket errors end the link, so
/// every failure is fatal.
struct ProxyWriter {
    sink: LineSink,
}

impl LinkWriter for ProxyWriter {
    async fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), WriteError> {
        let line = to_line(&ProxyRequest::Write {
            data: bytes.to_vec(),
        })
        .map_err(|e| WriteError::Fatal(e.to_string()))?;

        self.sink
            .lock()
            .await
            .send(line)
            .await
            .map_err(|e| WriteError::Fatal(e.to_string()))
    }
}
