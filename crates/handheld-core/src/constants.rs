//! Core constants for the handheld reader wire protocol.
//!
//! This module defines the protocol-level constants shared by the codec,
//! the transports and the device controller. Keeping them in one place keeps
//! the encoder, the streaming decoder and the simulator in agreement.
//!
//! # Frame Structure
//!
//! Every frame exchanged with the reader has the same layout:
//!
//! ```text
//! A7 B3  LEN  MODULE  OP_HI OP_LO  PAYLOAD...  XOR
//! ^^^^^  ^^^  ^^^^^^  ^^^^^^^^^^^  ^^^^^^^^^^  ^^^
//! sync   len  module  opcode (BE)  0..=252 B   checksum
//! ```
//!
//! Where:
//! - `sync` - Fixed two byte header ([`SYNC_HEADER`])
//! - `LEN` - Number of bytes in MODULE + OPCODE + PAYLOAD (3..=255)
//! - `MODULE` - Module/class identifier of the addressed subsystem
//! - `OPCODE` - Big-endian command or notification code
//! - `XOR` - XOR of every byte from `LEN` through the last payload byte
//!
//! # Usage
//!
//! ```
//! use handheld_core::constants::*;
//!
//! assert_eq!(SYNC_HEADER, [0xA7, 0xB3]);
//! assert_eq!(MIN_FRAME_LEN, FRAME_OVERHEAD + BODY_HEADER_LEN);
//! ```

// ============================================================================
// Framing
// ============================================================================

/// Fixed sync header opening every frame.
pub const SYNC_HEADER: [u8; 2] = [0xA7, 0xB3];

/// Bytes of framing around the body: sync (2) + length (1) + checksum (1).
pub const FRAME_OVERHEAD: usize = 4;

/// Bytes of the body before the payload: module (1) + opcode (2).
pub const BODY_HEADER_LEN: usize = 3;

/// Smallest possible frame (empty payload).
pub const MIN_FRAME_LEN: usize = FRAME_OVERHEAD + BODY_HEADER_LEN;

/// Largest value the length byte may carry.
pub const MAX_BODY_LEN: usize = u8::MAX as usize;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_BODY_LEN - BODY_HEADER_LEN;

/// Largest possible frame on the wire.
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_BODY_LEN;

// ============================================================================
// Modules
// ============================================================================

/// Device/system module (battery, trigger, reader mode).
pub const MODULE_DEVICE: u8 = 0x01;

/// UHF RFID module (inventory, locate, radio settings).
pub const MODULE_RFID: u8 = 0x02;

/// Barcode imager module.
pub const MODULE_BARCODE: u8 = 0x03;

// ============================================================================
// Opcodes (host -> device)
// ============================================================================

pub const OP_QUERY_BATTERY: u16 = 0x0101;
pub const OP_QUERY_TRIGGER: u16 = 0x0102;
pub const OP_SET_READER_MODE: u16 = 0x0103;
pub const OP_START_INVENTORY: u16 = 0x0201;
pub const OP_STOP_INVENTORY: u16 = 0x0202;
pub const OP_START_LOCATE: u16 = 0x0203;
pub const OP_APPLY_SETTINGS: u16 = 0x0204;
pub const OP_SCAN_BARCODE: u16 = 0x0301;
pub const OP_STOP_BARCODE: u16 = 0x0302;

// ============================================================================
// Opcodes (device -> host)
// ============================================================================

/// Generic acknowledgement: acked opcode (u16 BE) + status (u8).
pub const OP_ACK: u16 = 0x8000;
/// Battery report: millivolts (u16 BE) + percent (u8).
pub const OP_BATTERY_REPORT: u16 = 0x8101;
/// Trigger report: 1 = pressed, 0 = released.
pub const OP_TRIGGER_REPORT: u16 = 0x8102;
/// Tag report: EPC length (u8) + EPC + RSSI (i8) + antenna (u8).
pub const OP_TAG_REPORT: u16 = 0x8201;
/// Inventory, locate or barcode cycle finished.
pub const OP_SCAN_COMPLETED: u16 = 0x8202;
/// Barcode report: symbology (u8) + data bytes.
pub const OP_BARCODE_REPORT: u16 = 0x8301;

/// Ack status meaning success.
pub const ACK_STATUS_OK: u8 = 0x00;

// ============================================================================
// Domain limits
// ============================================================================

/// Minimum EPC length in bytes (a 16-bit EPC).
pub const MIN_EPC_LENGTH: usize = 2;

/// Maximum EPC length in bytes (496-bit EPC memory bank).
pub const MAX_EPC_LENGTH: usize = 62;

/// Lowest transmit power the RFID module accepts, in dBm.
pub const MIN_TX_POWER_DBM: u8 = 5;

/// Highest transmit power the RFID module accepts, in dBm.
pub const MAX_TX_POWER_DBM: u8 = 33;

/// Highest Gen2 session number.
pub const MAX_SESSION: u8 = 3;

/// Highest Gen2 Q value.
pub const MAX_Q_VALUE: u8 = 15;

// ============================================================================
// Timing defaults
// ============================================================================

/// Default escalating retry schedule for transient write failures.
pub const DEFAULT_RETRY_SCHEDULE_MS: [u64; 3] = [50, 200, 500];

/// Default number of retries after the first write attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default bound of the reliable command queue (waiting + in flight).
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default number of TCP connection attempts for the proxy transport.
pub const DEFAULT_PROXY_CONNECT_ATTEMPTS: u32 = 3;

/// Default fixed delay between proxy connection attempts.
pub const DEFAULT_PROXY_RETRY_DELAY_MS: u64 = 1000;

/// Default radio discovery window.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

/// Time a bridge may spend beyond discovery to connect and subscribe.
pub const BRIDGE_SETUP_MARGIN_MS: u64 = 5_000;

/// Default time to wait for the bridge to confirm the device connection.
///
/// The bridge opens its own link before answering, so this covers a full
/// radio discovery.
pub const DEFAULT_PROXY_HANDSHAKE_TIMEOUT_MS: u64 =
    DEFAULT_DISCOVERY_TIMEOUT_MS + BRIDGE_SETUP_MARGIN_MS;

/// Default time a bridge waits for a new client's `connect` request.
pub const DEFAULT_BRIDGE_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Default settle delay before a continuous scan is restarted.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 100;
