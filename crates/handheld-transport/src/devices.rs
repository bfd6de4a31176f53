//! Enum wrapper for transport dispatch.
//!
//! [`Transport`] uses native `async fn` methods, which are not object-safe,
//! so `Box<dyn Transport>` is unavailable. [`AnyTransport`] dispatches over
//! the concrete links instead, and the radio variant only exists with the
//! `ble` feature.
//!
//! ```
//! use handheld_transport::{AnyTransport, SimulatedTransport, SimulatorConfig, Transport, TransportKind};
//!
//! let (simulator, _handle) = SimulatedTransport::new(SimulatorConfig::default());
//! let transport = AnyTransport::from(simulator);
//! assert_eq!(transport.kind(), TransportKind::Simulated);
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

#[cfg(feature = "ble")]
use crate::ble::BleAdapter;
use crate::error::Result;
use crate::proxy::ProxyTransport;
#[cfg(feature = "ble")]
use crate::radio::RadioTransport;
use crate::simulated::SimulatedTransport;
use crate::traits::{Transport, TransportEvent, TransportKind, WriteCompletion};

/// Any of the concrete transports.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyTransport {
    /// Bluetooth LE link.
    #[cfg(feature = "ble")]
    Radio(RadioTransport<BleAdapter>),

    /// TCP link to a bridge process.
    Proxy(ProxyTransport),

    /// In-process simulator.
    Simulated(SimulatedTransport),
}

impl Transport for AnyTransport {
    fn kind(&self) -> TransportKind {
        match self {
            #[cfg(feature = "ble")]
            Self::Radio(transport) => transport.kind(),
            Self::Proxy(transport) => transport.kind(),
            Self::Simulated(transport) => transport.kind(),
        }
    }

    async fn connect(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        match self {
            #[cfg(feature = "ble")]
            Self::Radio(transport) => transport.connect().await,
            Self::Proxy(transport) => transport.connect().await,
            Self::Simulated(transport) => transport.connect().await,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "ble")]
            Self::Radio(transport) => transport.disconnect().await,
            Self::Proxy(transport) => transport.disconnect().await,
            Self::Simulated(transport) => transport.disconnect().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            #[cfg(feature = "ble")]
            Self::Radio(transport) => transport.is_connected(),
            Self::Proxy(transport) => transport.is_connected(),
            Self::Simulated(transport) => transport.is_connected(),
        }
    }

    fn write(&self, bytes: Bytes) -> Result<WriteCompletion> {
        match self {
            #[cfg(feature = "ble")]
            Self::Radio(transport) => transport.write(bytes),
            Self::Proxy(transport) => transport.write(bytes),
            Self::Simulated(transport) => transport.write(bytes),
        }
    }
}

#[cfg(feature = "ble")]
impl From<RadioTransport<BleAdapter>> for AnyTransport {
    fn from(transport: RadioTransport<BleAdapter>) -> Self {
        Self::Radio(transport)
    }
}

impl From<ProxyTransport> for AnyTransport {
    fn from(transport: ProxyTransport) -> Self {
        Self::Proxy(transport)
    }
}

impl From<SimulatedTransport> for AnyTransport {
    fn from(transport: SimulatedTransport) -> Self {
        Self::Simulated(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyConfig;
    use crate::simulated::SimulatorConfig;

    #[tokio::test]
    async fn test_any_transport_simulated() {
        let (simulator, _handle) = SimulatedTransport::new(SimulatorConfig::default());
        let mut transport = AnyTransport::from(simulator);
        assert!(!transport.is_connected());

        let mut events = transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(transport.is_connected());

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_any_transport_proxy_kind() {
        let transport = AnyTransport::from(ProxyTransport::new(ProxyConfig::default()));
        assert_eq!(transport.kind(), TransportKind::Proxy);
        assert!(!transport.is_connected());
    }
}
