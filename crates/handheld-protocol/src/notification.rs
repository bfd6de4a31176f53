//! Typed device-to-host notifications.
//!
//! [`Notification::from_frame`] never fails: frames with an unknown opcode
//! or a payload that does not match its opcode become
//! [`Notification::Unrecognized`], so one bad frame never stops the stream.
//! [`Notification::encode`] produces the device-side frame for a
//! notification, which the simulator and the tests rely on.

use bytes::Bytes;
use handheld_core::{
    BarcodeRead, BatteryStatus, Epc, Error, Result, TagReading, TriggerState, constants::*,
};

use crate::commands::{Opcode, module_of};
use crate::frame::Frame;

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// One tag seen during inventory or locate.
    TagRead(TagReading),

    /// One barcode decoded by the imager.
    BarcodeRead(BarcodeRead),

    /// Battery report.
    Battery(BatteryStatus),

    /// Trigger pressed or released.
    Trigger(TriggerState),

    /// Inventory, locate or barcode cycle finished.
    ScanCompleted,

    /// Command accepted by the device.
    Ack { opcode: u16 },

    /// Command rejected by the device with a non-zero status.
    Error { opcode: u16, status: u8 },

    /// Frame that could not be mapped to a known notification.
    Unrecognized(UnrecognizedFrame),
}

/// Why a frame was not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnrecognizedReason {
    /// Well-formed frame with an opcode this host does not know.
    UnknownOpcode { module: u8, opcode: u16 },

    /// Known opcode whose payload does not match its layout.
    InvalidPayload(Error),

    /// Bytes that looked like a frame but failed validation.
    Malformed(Error),
}

/// An unrecognized frame together with its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedFrame {
    pub reason: UnrecognizedReason,
    pub raw: Bytes,
}

impl Notification {
    /// Map a complete frame to a notification.
    pub fn from_frame(frame: &Frame) -> Self {
        match Self::try_from_frame(frame) {
            Ok(notification) => notification,
            Err(Error::UnknownOpcode(opcode)) => Self::unrecognized(
                UnrecognizedReason::UnknownOpcode {
                    module: frame.module(),
                    opcode,
                },
                frame,
            ),
            Err(err) => Self::unrecognized(UnrecognizedReason::InvalidPayload(err), frame),
        }
    }

    /// Notification standing for bytes that failed frame validation.
    pub fn malformed(error: Error, raw: Bytes) -> Self {
        Notification::Unrecognized(UnrecognizedFrame {
            reason: UnrecognizedReason::Malformed(error),
            raw,
        })
    }

    fn unrecognized(reason: UnrecognizedReason, frame: &Frame) -> Self {
        Notification::Unrecognized(UnrecognizedFrame {
            reason,
            raw: frame.encode(),
        })
    }

    fn try_from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame.opcode();
        let payload = frame.payload();

        match Opcode::from_u16(opcode) {
            Some(Opcode::Ack) => {
                expect_len(opcode, payload, 3)?;
                let acked = u16::from_be_bytes([payload[0], payload[1]]);
                let status = payload[2];
                if status == ACK_STATUS_OK {
                    Ok(Notification::Ack { opcode: acked })
                } else {
                    Ok(Notification::Error {
                        opcode: acked,
                        status,
                    })
                }
            }
            Some(Opcode::BatteryReport) => {
                expect_len(opcode, payload, 3)?;
                let millivolts = u16::from_be_bytes([payload[0], payload[1]]);
                Ok(Notification::Battery(BatteryStatus::new(
                    millivolts, payload[2],
                )))
            }
            Some(Opcode::TriggerReport) => {
                expect_len(opcode, payload, 1)?;
                match payload[0] {
                    0 => Ok(Notification::Trigger(TriggerState::Released)),
                    1 => Ok(Notification::Trigger(TriggerState::Pressed)),
                    other => Err(Error::invalid_payload(
                        opcode,
                        format!("trigger state {other}"),
                    )),
                }
            }
            Some(Opcode::TagReport) => decode_tag_report(opcode, payload),
            Some(Opcode::ScanCompleted) => Ok(Notification::ScanCompleted),
            Some(Opcode::BarcodeReport) => {
                let Some((&symbology, data)) = payload.split_first() else {
                    return Err(Error::invalid_payload(opcode, "empty barcode report"));
                };
                Ok(Notification::BarcodeRead(BarcodeRead::new(
                    symbology,
                    String::from_utf8_lossy(data),
                )))
            }
            // Host-to-device opcodes are never valid inbound.
            Some(_) | None => Err(Error::UnknownOpcode(opcode)),
        }
    }

    /// Device-side frame carrying this notification.
    ///
    /// Returns `None` for [`Notification::Unrecognized`], which has no
    /// canonical encoding.
    pub fn encode(&self) -> Option<Frame> {
        let frame = match self {
            Notification::TagRead(tag) => {
                let mut payload = Vec::with_capacity(tag.epc.len() + 3);
                payload.push(u8::try_from(tag.epc.len()).ok()?);
                payload.extend_from_slice(tag.epc.as_bytes());
                payload.push(tag.rssi.to_be_bytes()[0]);
                payload.push(tag.antenna);
                Frame::from_parts(MODULE_RFID, OP_TAG_REPORT, payload.into())
            }
            Notification::BarcodeRead(barcode) => {
                let mut payload = Vec::with_capacity(barcode.data.len() + 1);
                payload.push(barcode.symbology);
                payload.extend_from_slice(barcode.data.as_bytes());
                Frame::new(MODULE_BARCODE, OP_BARCODE_REPORT, payload).ok()?
            }
            Notification::Battery(status) => {
                let [hi, lo] = status.millivolts.to_be_bytes();
                Frame::from_parts(
                    MODULE_DEVICE,
                    OP_BATTERY_REPORT,
                    Bytes::copy_from_slice(&[hi, lo, status.percent]),
                )
            }
            Notification::Trigger(state) => Frame::from_parts(
                MODULE_DEVICE,
                OP_TRIGGER_REPORT,
                Bytes::copy_from_slice(&[u8::from(state.is_pressed())]),
            ),
            Notification::ScanCompleted => {
                Frame::from_parts(MODULE_RFID, OP_SCAN_COMPLETED, Bytes::new())
            }
            Notification::Ack { opcode } => ack_frame(*opcode, ACK_STATUS_OK),
            Notification::Error { opcode, status } => ack_frame(*opcode, *status),
            Notification::Unrecognized(_) => return None,
        };
        Some(frame)
    }

    /// Short name of the notification kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::TagRead(_) => "tag",
            Notification::BarcodeRead(_) => "barcode",
            Notification::Battery(_) => "battery",
            Notification::Trigger(_) => "trigger",
            Notification::ScanCompleted => "scan_completed",
            Notification::Ack { .. } => "ack",
            Notification::Error { .. } => "error",
            Notification::Unrecognized(_) => "unrecognized",
        }
    }
}

fn ack_frame(opcode: u16, status: u8) -> Frame {
    let [hi, lo] = opcode.to_be_bytes();
    Frame::from_parts(
        module_of(opcode),
        OP_ACK,
        Bytes::copy_from_slice(&[hi, lo, status]),
    )
}

fn expect_len(opcode: u16, payload: &[u8], len: usize) -> Result<()> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(Error::invalid_payload(
            opcode,
            format!("expected {len} payload bytes, got {}", payload.len()),
        ))
    }
}

/// Tag report: `[epc_len, epc..., rssi, antenna]`.
fn decode_tag_report(opcode: u16, payload: &[u8]) -> Result<Notification> {
    let Some((&epc_len, rest)) = payload.split_first() else {
        return Err(Error::invalid_payload(opcode, "empty tag report"));
    };
    let epc_len = usize::from(epc_len);

    if rest.len() != epc_len + 2 {
        return Err(Error::invalid_payload(
            opcode,
            format!(
                "EPC length {epc_len} needs {} bytes after it, got {}",
                epc_len + 2,
                rest.len()
            ),
        ));
    }

    let (epc, trailer) = rest.split_at(epc_len);
    let epc = Epc::new(epc.to_vec()).map_err(|e| Error::invalid_payload(opcode, e.to_string()))?;
    let rssi = i8::from_be_bytes([trailer[0]]);
    let antenna = trailer[1];

    Ok(Notification::TagRead(TagReading::new(epc, rssi, antenna)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decode(frame: &Frame) -> Notification {
        Notification::from_frame(&Frame::parse(&frame.encode()).unwrap())
    }

    #[test]
    fn test_tag_report_roundtrip() {
        let tag = TagReading::new(Epc::from_hex("E28011606000020D").unwrap(), -52, 2);
        let frame = Notification::TagRead(tag.clone()).encode().unwrap();

        match decode(&frame) {
            Notification::TagRead(read) => {
                assert_eq!(read.epc, tag.epc);
                assert_eq!(read.rssi, -52);
                assert_eq!(read.antenna, 2);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_barcode_report() {
        let frame = Frame::new(MODULE_BARCODE, OP_BARCODE_REPORT, b"\x0b4006381333931".to_vec())
            .unwrap();
        match decode(&frame) {
            Notification::BarcodeRead(read) => {
                assert_eq!(read.symbology, 0x0B);
                assert_eq!(read.data, "4006381333931");
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_battery_report() {
        let frame = Frame::new(MODULE_DEVICE, OP_BATTERY_REPORT, vec![0x10, 0x04, 87]).unwrap();
        assert_eq!(
            decode(&frame),
            Notification::Battery(BatteryStatus::new(4100, 87))
        );
    }

    #[rstest]
    #[case(0, TriggerState::Released)]
    #[case(1, TriggerState::Pressed)]
    fn test_trigger_report(#[case] byte: u8, #[case] state: TriggerState) {
        let frame = Frame::new(MODULE_DEVICE, OP_TRIGGER_REPORT, vec![byte]).unwrap();
        assert_eq!(decode(&frame), Notification::Trigger(state));
    }

    #[test]
    fn test_ack_and_error_status() {
        let ok = Notification::Ack {
            opcode: OP_START_INVENTORY,
        };
        assert_eq!(decode(&ok.encode().unwrap()), ok);

        let rejected = Notification::Error {
            opcode: OP_START_LOCATE,
            status: 0x05,
        };
        let frame = rejected.encode().unwrap();
        assert_eq!(frame.module(), MODULE_RFID);
        assert_eq!(decode(&frame), rejected);
    }

    #[test]
    fn test_scan_completed() {
        let frame = Notification::ScanCompleted.encode().unwrap();
        assert_eq!(decode(&frame), Notification::ScanCompleted);
    }

    #[test]
    fn test_unknown_opcode_is_unrecognized() {
        let frame = Frame::new(0x09, 0x8999, vec![1, 2, 3]).unwrap();
        match decode(&frame) {
            Notification::Unrecognized(UnrecognizedFrame { reason, raw }) => {
                assert_eq!(
                    reason,
                    UnrecognizedReason::UnknownOpcode {
                        module: 0x09,
                        opcode: 0x8999
                    }
                );
                assert_eq!(raw, frame.encode());
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_command_opcode_inbound_is_unrecognized() {
        let frame = Frame::new(MODULE_RFID, OP_START_INVENTORY, vec![1, 4]).unwrap();
        assert!(matches!(decode(&frame), Notification::Unrecognized(_)));
    }

    #[rstest]
    #[case(OP_BATTERY_REPORT, vec![0x10])]
    #[case(OP_TRIGGER_REPORT, vec![7])]
    #[case(OP_ACK, vec![0x01])]
    #[case(OP_TAG_REPORT, vec![])]
    #[case(OP_TAG_REPORT, vec![4, 0xE2, 0x00, 0xC4, 0x01])]
    #[case(OP_TAG_REPORT, vec![1, 0xE2, 0xC4, 0x01])]
    #[case(OP_BARCODE_REPORT, vec![])]
    fn test_invalid_payload_is_unrecognized(#[case] opcode: u16, #[case] payload: Vec<u8>) {
        let frame = Frame::new(module_of(opcode), opcode, payload).unwrap();
        match decode(&frame) {
            Notification::Unrecognized(UnrecognizedFrame {
                reason: UnrecognizedReason::InvalidPayload(_),
                ..
            }) => {}
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_has_no_encoding() {
        let notification = Notification::malformed(
            Error::InvalidFrame("test".to_string()),
            Bytes::from_static(&[0xA7]),
        );
        assert!(notification.encode().is_none());
        assert_eq!(notification.kind(), "unrecognized");
    }

    #[rstest]
    #[case(Notification::ScanCompleted, "scan_completed")]
    #[case(Notification::Trigger(TriggerState::Pressed), "trigger")]
    #[case(Notification::Battery(BatteryStatus::new(3900, 60)), "battery")]
    #[case(Notification::Ack { opcode: OP_QUERY_BATTERY }, "ack")]
    #[case(Notification::Error { opcode: OP_QUERY_BATTERY, status: 1 }, "error")]
    fn test_kind_names(#[case] notification: Notification, #[case] expected: &str) {
        assert_eq!(notification.kind(), expected);
    }
}
