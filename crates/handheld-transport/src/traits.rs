//! Transport trait definitions.
//!
//! A transport owns one link to a reader. The controller drives it through
//! [`Transport`]: `connect` hands back the inbound event stream, `write`
//! submits encoded frames, `disconnect` tears everything down.
//!
//! All traits use native `async fn` methods (Edition 2024 RPITIT). They are
//! not object-safe; use [`AnyTransport`](crate::devices::AnyTransport) for
//! dispatch over the concrete links.

#![allow(async_fn_in_trait)]

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, TransportError};

/// Concrete link kind behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bluetooth LE link to the reader.
    Radio,

    /// TCP connection to a bridge process that owns the radio.
    Proxy,

    /// In-process simulator.
    Simulated,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Radio => "radio",
            TransportKind::Proxy => "proxy",
            TransportKind::Simulated => "simulated",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event pushed by a transport after `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link is up and ready for writes.
    Connected,

    /// Link was lost. Sent at most once per connection.
    Disconnected { reason: Option<String> },

    /// Raw inbound bytes, in arrival order, with arbitrary chunking.
    Data(Bytes),

    /// Non-fatal problem reported by the link.
    Error { message: String },
}

/// Resolves when a submitted write has been delivered or has failed.
///
/// Dropping the completion does not cancel the write.
#[derive(Debug)]
#[must_use = "a write completion reports whether the write was delivered"]
pub struct WriteCompletion {
    inner: CompletionInner,
}

#[derive(Debug)]
enum CompletionInner {
    Pending(oneshot::Receiver<Result<()>>),
    Ready(Option<Result<()>>),
}

impl WriteCompletion {
    /// Completion fed by the command queue.
    pub(crate) fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            inner: CompletionInner::Pending(rx),
        }
    }

    /// Completion that is already resolved.
    pub fn ready(result: Result<()>) -> Self {
        Self {
            inner: CompletionInner::Ready(Some(result)),
        }
    }
}

impl Future for WriteCompletion {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            // Sender dropped without an answer: the queue went away.
            CompletionInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(TransportError::Cancelled))),
            CompletionInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(TransportError::Cancelled)))
            }
        }
    }
}

/// One link to a reader.
///
/// # Contract
///
/// - `connect` either returns the event stream of a live link or an error
///   that leaves the transport disconnected with nothing half-open.
/// - Unexpected link loss is pushed as [`TransportEvent::Disconnected`]
///   exactly once; the stream ends afterwards.
/// - `write` never waits: submission is accepted or rejected immediately
///   (for example with [`TransportError::QueueFull`]), and the returned
///   [`WriteCompletion`] resolves once the write succeeded or failed.
/// - Writes are delivered in submission order, one at a time.
/// - `disconnect` is idempotent and cancels pending writes.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use handheld_transport::{SimulatedTransport, SimulatorConfig, Transport, TransportEvent};
///
/// # #[tokio::main]
/// # async fn main() -> handheld_transport::Result<()> {
/// let (mut transport, _handle) = SimulatedTransport::new(SimulatorConfig::default());
/// let mut events = transport.connect().await?;
/// assert_eq!(events.recv().await, Some(TransportEvent::Connected));
///
/// let query = handheld_protocol::Command::query_battery().encode();
/// transport.write(query)?.await?;
///
/// transport.disconnect().await?;
/// assert!(!transport.is_connected());
/// # Ok(())
/// # }
/// ```
pub trait Transport: Send {
    /// Kind of link behind this transport.
    fn kind(&self) -> TransportKind;

    /// Establish the link and return its event stream.
    async fn connect(&mut self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Tear the link down. Safe to call at any time, any number of times.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Submit an encoded frame for delivery.
    fn write(&self, bytes: Bytes) -> Result<WriteCompletion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_completion() {
        assert!(WriteCompletion::ready(Ok(())).await.is_ok());
        assert!(matches!(
            WriteCompletion::ready(Err(TransportError::NotConnected)).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_pending_completion_resolves() {
        let (tx, rx) = oneshot::channel();
        let completion = WriteCompletion::pending(rx);
        tx.send(Ok(())).unwrap();
        assert!(completion.await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_sender_means_cancelled() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);
        assert!(matches!(
            WriteCompletion::pending(rx).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Radio.to_string(), "radio");
        assert_eq!(TransportKind::Simulated.as_str(), "simulated");
    }
}
