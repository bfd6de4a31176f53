//! Wire protocol of the handheld RFID/barcode reader.
//!
//! Pure encode/decode functions with no I/O:
//!
//! - [`Frame`]: one binary frame (`A7 B3 | LEN | MODULE | OPCODE | PAYLOAD | XOR`)
//! - [`Command`]: host-to-device instructions and their encoding
//! - [`Notification`]: typed device-to-host events
//! - [`StreamParser`]: framing state machine tolerant to arbitrary chunking
//! - [`NotificationDecoder`]: streaming bytes-to-notifications decoder
//!
//! # Example
//!
//! ```
//! use handheld_protocol::{Command, Notification, NotificationDecoder};
//!
//! let ack = Notification::Ack { opcode: Command::query_battery().opcode().as_u16() };
//! let wire = ack.encode().unwrap().encode();
//!
//! let mut decoder = NotificationDecoder::new();
//! let (first, rest) = wire.split_at(3);
//! assert!(decoder.decode(first).is_empty());
//! assert_eq!(decoder.decode(rest), vec![ack]);
//! ```

pub mod commands;
pub mod decoder;
pub mod frame;
pub mod notification;
pub mod stream_parser;

pub use commands::{Command, Opcode};
pub use decoder::NotificationDecoder;
pub use frame::{Frame, checksum};
pub use notification::{Notification, UnrecognizedFrame, UnrecognizedReason};
pub use stream_parser::{DrainFrames, ParsedFrame, ParserState, StreamParser};
