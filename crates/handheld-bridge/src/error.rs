//! Error types for the bridge.

use std::net::SocketAddr;

use handheld_transport::TransportError;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The client did not send its `connect` request in time.
    #[error("Handshake timeout after {duration_ms}ms")]
    HandshakeTimeout { duration_ms: u64 },

    /// The client asked for a device class this bridge does not serve.
    #[error("Unknown device class: {device}")]
    UnknownDevice { device: String },

    #[error("Expected connect request, got {request}")]
    UnexpectedRequest { request: String },

    #[error("Client closed the connection")]
    ClientClosed,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing reader link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_client_readable() {
        let error = BridgeError::UnknownDevice {
            device: "scale".to_string(),
        };
        assert_eq!(error.to_string(), "Unknown device class: scale");

        let error = BridgeError::from(TransportError::connection_failed("no reader"));
        assert_eq!(error.to_string(), "Connection failed: no reader");
    }
}
