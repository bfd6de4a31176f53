//! Error types for transport operations.
//!
//! Covers link establishment, submission backpressure and write outcomes.
//! Transient write failures never show up here: the command queue retries
//! them and only reports the final result.

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while establishing or using a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link could not be established.
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// No reader matched the discovery filter.
    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    /// The remote side did not confirm the session in time.
    #[error("Handshake timeout after {duration_ms}ms")]
    HandshakeTimeout { duration_ms: u64 },

    /// Operation needs a live link.
    #[error("Transport not connected")]
    NotConnected,

    /// Submission rejected because the command queue is at its bound.
    #[error("Command queue full ({capacity} commands pending)")]
    QueueFull { capacity: usize },

    /// Write failed permanently or ran out of retries.
    #[error("Write failed after {attempts} attempt(s): {message}")]
    WriteFailed { attempts: u32, message: String },

    /// Write was dropped because the link was torn down.
    #[error("Write cancelled")]
    Cancelled,

    /// Operation is not available on this transport.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Configuration value could not be used.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Frame encoding error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] handheld_core::Error),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed proxy message.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn device_not_found(device: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            device: device.into(),
        }
    }

    pub fn handshake_timeout(duration_ms: u64) -> Self {
        Self::HandshakeTimeout { duration_ms }
    }

    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    pub fn write_failed(attempts: u32, message: impl Into<String>) -> Self {
        Self::WriteFailed {
            attempts,
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this error happened while bringing the link up.
    ///
    /// The transport factory falls back to the next candidate on these.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::DeviceNotFound { .. }
                | Self::HandshakeTimeout { .. }
                | Self::Unsupported { .. }
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_error() {
        let error = TransportError::queue_full(32);
        assert!(matches!(error, TransportError::QueueFull { capacity: 32 }));
        assert_eq!(error.to_string(), "Command queue full (32 commands pending)");
    }

    #[test]
    fn test_write_failed_error() {
        let error = TransportError::write_failed(4, "GATT busy");
        assert_eq!(
            error.to_string(),
            "Write failed after 4 attempt(s): GATT busy"
        );
    }

    #[test]
    fn test_handshake_timeout_error() {
        let error = TransportError::handshake_timeout(3000);
        assert_eq!(error.to_string(), "Handshake timeout after 3000ms");
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(TransportError::connection_failed("refused").is_connection_error());
        assert!(TransportError::device_not_found("HH-01").is_connection_error());
        assert!(TransportError::handshake_timeout(10).is_connection_error());
        assert!(!TransportError::NotConnected.is_connection_error());
        assert!(!TransportError::Cancelled.is_connection_error());
        assert!(!TransportError::queue_full(1).is_connection_error());
        assert!(!TransportError::invalid_config("transport 'usb'").is_connection_error());
    }
}
