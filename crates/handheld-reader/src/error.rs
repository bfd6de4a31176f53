//! Error types for reader sessions.

use handheld_transport::TransportError;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, ReaderError>;

/// Errors returned by [`DeviceManager`](crate::DeviceManager) operations.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Another session is live in the same registry.
    #[error("A reader session is already active (session {session_id})")]
    SessionActive { session_id: u64 },

    /// The session was destroyed or lost its link.
    #[error("Reader session closed")]
    SessionClosed,

    /// The request cannot be honoured in the current state.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// A deferred mode change was replaced by a newer one.
    #[error("Mode change to {mode} superseded by a newer request")]
    Superseded { mode: handheld_core::ReaderMode },

    /// Link or write failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReaderError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}

impl From<handheld_core::Error> for ReaderError {
    fn from(error: handheld_core::Error) -> Self {
        Self::invalid_request(error.to_string())
    }
}
