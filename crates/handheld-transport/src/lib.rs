//! Links between the host and a handheld reader.
//!
//! Every link implements [`Transport`]: `connect` returns a stream of
//! [`TransportEvent`]s, `write` submits an encoded frame and returns a
//! [`WriteCompletion`], and `disconnect` tears the link down. Writes pass
//! through a bounded [`CommandQueue`](queue::CommandQueue) that keeps one
//! frame in flight and retries transient failures.
//!
//! # Transports
//!
//! - [`RadioTransport`]: Bluetooth LE service/characteristic link (the
//!   platform adapter needs the `ble` feature)
//! - [`ProxyTransport`]: JSON lines over TCP to a bridge process
//! - [`SimulatedTransport`]: in-process reader speaking the wire protocol
//!
//! [`AnyTransport`] dispatches over them and [`TransportFactory`] picks one
//! from a [`TransportConfig`].
//!
//! # Example
//!
//! ```
//! use handheld_protocol::{Command, Notification, NotificationDecoder};
//! use handheld_transport::{SimulatedTransport, SimulatorConfig, Transport, TransportEvent};
//!
//! # #[tokio::main]
//! # async fn main() -> handheld_transport::Result<()> {
//! let (mut reader, _handle) = SimulatedTransport::new(SimulatorConfig::default());
//! let mut events = reader.connect().await?;
//! assert_eq!(events.recv().await, Some(TransportEvent::Connected));
//!
//! reader.write(Command::query_battery().encode())?.await?;
//!
//! let mut decoder = NotificationDecoder::new();
//! while let Some(TransportEvent::Data(bytes)) = events.recv().await {
//!     if decoder
//!         .decode(&bytes)
//!         .iter()
//!         .any(|n| matches!(n, Notification::Battery(_)))
//!     {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod devices;
pub mod error;
pub mod factory;
mod link;
pub mod proxy;
pub mod queue;
pub mod radio;
pub mod simulated;
pub mod traits;

#[cfg(feature = "ble")]
pub mod ble;

pub use devices::AnyTransport;
pub use error::{Result, TransportError};
pub use factory::{
    BuiltTransport, ConnectedTransport, TRANSPORT_ENV_VAR, TransportConfig, TransportFactory,
    TransportPreference,
};
pub use proxy::{ProxyConfig, ProxyMessage, ProxyRequest, ProxyTransport};
pub use queue::{QueueConfig, RetryPolicy};
pub use radio::{RadioAdapter, RadioConfig, RadioTransport};
pub use simulated::{SimulatedTransport, SimulatorConfig, SimulatorHandle};
pub use traits::{Transport, TransportEvent, TransportKind, WriteCompletion};

#[cfg(feature = "ble")]
pub use ble::BleAdapter;
