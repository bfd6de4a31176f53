use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Framing errors
    #[error("Frame too large: {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    // Payload errors
    #[error("Unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    #[error("Invalid payload for opcode {opcode:#06x}: {message}")]
    InvalidPayload { opcode: u16, message: String },

    // Domain validation errors
    #[error("Invalid EPC: {0}")]
    InvalidEpc(String),

    #[error("Invalid scan setting: {0}")]
    InvalidSetting(String),

    #[error("Invalid reader mode: {0}")]
    InvalidMode(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl Error {
    /// Create an invalid payload error for the given opcode.
    pub fn invalid_payload(opcode: u16, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            opcode,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
