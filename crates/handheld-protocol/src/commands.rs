//! Opcodes and host-to-device commands.
//!
//! Every outgoing instruction is a [`Command`]: an [`Opcode`] plus payload.
//! Commands know which module they address, so the encoder only needs the
//! command itself to produce a [`Frame`].

use bytes::Bytes;
use handheld_core::{Epc, Error, ReaderMode, Result, ScanSettings, constants::*};
use std::fmt;

use crate::frame::Frame;

/// Every opcode understood by the reader, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // Host -> device
    QueryBattery = OP_QUERY_BATTERY,
    QueryTrigger = OP_QUERY_TRIGGER,
    SetReaderMode = OP_SET_READER_MODE,
    StartInventory = OP_START_INVENTORY,
    StopInventory = OP_STOP_INVENTORY,
    StartLocate = OP_START_LOCATE,
    ApplySettings = OP_APPLY_SETTINGS,
    ScanBarcode = OP_SCAN_BARCODE,
    StopBarcode = OP_STOP_BARCODE,

    // Device -> host
    Ack = OP_ACK,
    BatteryReport = OP_BATTERY_REPORT,
    TriggerReport = OP_TRIGGER_REPORT,
    TagReport = OP_TAG_REPORT,
    ScanCompleted = OP_SCAN_COMPLETED,
    BarcodeReport = OP_BARCODE_REPORT,
}

impl Opcode {
    /// Look up a raw opcode.
    pub fn from_u16(value: u16) -> Option<Self> {
        let opcode = match value {
            OP_QUERY_BATTERY => Opcode::QueryBattery,
            OP_QUERY_TRIGGER => Opcode::QueryTrigger,
            OP_SET_READER_MODE => Opcode::SetReaderMode,
            OP_START_INVENTORY => Opcode::StartInventory,
            OP_STOP_INVENTORY => Opcode::StopInventory,
            OP_START_LOCATE => Opcode::StartLocate,
            OP_APPLY_SETTINGS => Opcode::ApplySettings,
            OP_SCAN_BARCODE => Opcode::ScanBarcode,
            OP_STOP_BARCODE => Opcode::StopBarcode,
            OP_ACK => Opcode::Ack,
            OP_BATTERY_REPORT => Opcode::BatteryReport,
            OP_TRIGGER_REPORT => Opcode::TriggerReport,
            OP_TAG_REPORT => Opcode::TagReport,
            OP_SCAN_COMPLETED => Opcode::ScanCompleted,
            OP_BARCODE_REPORT => Opcode::BarcodeReport,
            _ => return None,
        };
        Some(opcode)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this opcode travels from the host to the device.
    pub fn is_command(self) -> bool {
        self.as_u16() & 0x8000 == 0
    }

    /// Module addressed by this opcode.
    ///
    /// The high byte of the opcode (without the direction bit) is the module
    /// id; the generic ack belongs to the device module.
    pub fn module(self) -> u8 {
        module_of(self.as_u16())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({:#06x})", self.as_u16())
    }
}

/// Module id encoded in the high byte of a raw opcode.
pub(crate) fn module_of(opcode: u16) -> u8 {
    match ((opcode >> 8) & 0x7F) as u8 {
        0 => MODULE_DEVICE,
        module => module,
    }
}

/// An outgoing instruction for the reader.
///
/// # Examples
///
/// ```
/// use handheld_protocol::{Command, Opcode};
/// use handheld_core::ReaderMode;
///
/// let command = Command::set_reader_mode(ReaderMode::Barcode);
/// assert_eq!(command.opcode(), Opcode::SetReaderMode);
/// assert_eq!(command.payload(), &[3]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    payload: Bytes,
}

impl Command {
    fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn query_battery() -> Self {
        Self::new(Opcode::QueryBattery, Bytes::new())
    }

    pub fn query_trigger() -> Self {
        Self::new(Opcode::QueryTrigger, Bytes::new())
    }

    /// Select which module the trigger and scan commands target.
    pub fn set_reader_mode(mode: ReaderMode) -> Self {
        Self::new(Opcode::SetReaderMode, vec![mode.as_u8()])
    }

    /// Start a UHF inventory round: `[session, q]`.
    pub fn start_inventory(settings: &ScanSettings) -> Self {
        Self::new(
            Opcode::StartInventory,
            vec![settings.session, settings.q_value],
        )
    }

    pub fn stop_inventory() -> Self {
        Self::new(Opcode::StopInventory, Bytes::new())
    }

    /// Start locating a single tag: `[epc_len, epc...]`.
    pub fn start_locate(epc: &Epc) -> Self {
        let mut payload = Vec::with_capacity(epc.len() + 1);
        // Epc length is bounded well below u8::MAX.
        payload.push(u8::try_from(epc.len()).unwrap_or(u8::MAX));
        payload.extend_from_slice(epc.as_bytes());
        Self::new(Opcode::StartLocate, payload)
    }

    /// Push radio settings: `[tx_power_dbm, session, q]`.
    pub fn apply_settings(settings: &ScanSettings) -> Self {
        Self::new(
            Opcode::ApplySettings,
            vec![settings.tx_power_dbm, settings.session, settings.q_value],
        )
    }

    pub fn scan_barcode() -> Self {
        Self::new(Opcode::ScanBarcode, Bytes::new())
    }

    pub fn stop_barcode() -> Self {
        Self::new(Opcode::StopBarcode, Bytes::new())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Frame carrying this command.
    pub fn to_frame(&self) -> Frame {
        // Command payloads are at most 63 bytes, far below the frame limit.
        Frame::from_parts(
            self.opcode.module(),
            self.opcode.as_u16(),
            self.payload.clone(),
        )
    }

    /// Wire encoding of this command.
    pub fn encode(&self) -> Bytes {
        self.to_frame().encode()
    }

    /// Recover a command from a frame written by the host.
    ///
    /// # Errors
    /// Returns `Error::UnknownOpcode` for notification or unknown opcodes.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match Opcode::from_u16(frame.opcode()) {
            Some(opcode) if opcode.is_command() => {
                Ok(Self::new(opcode, Bytes::copy_from_slice(frame.payload())))
            }
            _ => Err(Error::UnknownOpcode(frame.opcode())),
        }
    }
}
