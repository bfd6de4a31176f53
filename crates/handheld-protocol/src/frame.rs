use bytes::{BufMut, Bytes, BytesMut};
use handheld_core::{Error, Result, constants::*};
use std::fmt;

/// Frame represents the byte-level wire format shared by commands and notifications.
///
/// # Wire Format
/// ```text
/// A7 B3 | LEN | MODULE | OP_HI OP_LO | PAYLOAD... | XOR
/// ```
/// - `LEN` counts MODULE + OPCODE + PAYLOAD, so it is always at least 3
/// - `XOR` is the XOR of every byte from `LEN` through the end of the payload
///
/// # Basic Usage
/// ```
/// use handheld_protocol::Frame;
/// use handheld_core::constants::{MODULE_DEVICE, OP_QUERY_BATTERY};
///
/// let frame = Frame::new(MODULE_DEVICE, OP_QUERY_BATTERY, Vec::new()).unwrap();
/// let wire = frame.encode();
/// assert_eq!(&wire[..], &[0xA7, 0xB3, 0x03, 0x01, 0x01, 0x01, 0x02]);
///
/// let parsed = Frame::parse(&wire).unwrap();
/// assert_eq!(parsed, frame);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Module/class identifier
    module: u8,

    /// Command or notification code
    opcode: u16,

    /// Opcode specific payload
    payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    ///
    /// # Errors
    /// Returns `Error::FrameTooLarge` if the payload does not fit the length byte.
    pub fn new(module: u8, opcode: u16, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::FrameTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Frame {
            module,
            opcode,
            payload,
        })
    }

    /// Build a frame whose payload is known to fit.
    pub(crate) fn from_parts(module: u8, opcode: u16, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        Frame {
            module,
            opcode,
            payload,
        }
    }

    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Value of the length byte for this frame.
    pub fn body_len(&self) -> usize {
        BODY_HEADER_LEN + self.payload.len()
    }

    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.body_len()
    }

    /// Append the wire encoding of this frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        let start = dst.len();

        dst.put_slice(&SYNC_HEADER);
        // Payload length is checked in `new`, body_len always fits a byte.
        dst.put_u8(u8::try_from(self.body_len()).unwrap_or(u8::MAX));
        dst.put_u8(self.module);
        dst.put_u16(self.opcode);
        dst.put_slice(&self.payload);

        let sum = checksum(&dst[start + SYNC_HEADER.len()..]);
        dst.put_u8(sum);
    }

    /// Encode this frame into its wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse exactly one complete frame.
    ///
    /// # Errors
    /// Returns an error if the sync header, the length byte or the checksum
    /// does not match, or if `bytes` holds more or less than one frame.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "frame must be at least {MIN_FRAME_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        if bytes[..2] != SYNC_HEADER {
            return Err(Error::InvalidFrame(format!(
                "bad sync header {:02X} {:02X}",
                bytes[0], bytes[1]
            )));
        }

        let body_len = usize::from(bytes[2]);
        if body_len < BODY_HEADER_LEN {
            return Err(Error::InvalidFrame(format!(
                "length byte {body_len} shorter than header"
            )));
        }

        let expected_len = FRAME_OVERHEAD + body_len;
        if bytes.len() != expected_len {
            return Err(Error::InvalidFrame(format!(
                "length byte announces {expected_len} bytes, got {}",
                bytes.len()
            )));
        }

        let checksum_pos = expected_len - 1;
        let expected = checksum(&bytes[2..checksum_pos]);
        let actual = bytes[checksum_pos];
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let module = bytes[3];
        let opcode = u16::from_be_bytes([bytes[4], bytes[5]]);
        let payload = Bytes::copy_from_slice(&bytes[6..checksum_pos]);

        Frame::new(module, opcode, payload)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module={:#04x} opcode={:#06x} payload=[",
            self.module, self.opcode
        )?;
        for (i, byte) in self.payload.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        write!(f, "]")
    }
}

/// XOR checksum used by the frame trailer.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> Frame {
        Frame::new(MODULE_RFID, OP_TAG_REPORT, vec![0x02, 0xAB, 0xCD, 0xC4, 0x01]).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let wire = sample().encode();

        assert_eq!(&wire[..2], &SYNC_HEADER);
        assert_eq!(wire[2], 8); // module + opcode + 5 payload bytes
        assert_eq!(wire[3], MODULE_RFID);
        assert_eq!(&wire[4..6], &OP_TAG_REPORT.to_be_bytes());
        assert_eq!(wire.len(), sample().encoded_len());
        assert_eq!(wire[wire.len() - 1], checksum(&wire[2..wire.len() - 1]));
    }

    #[test]
    fn test_parse_roundtrip() {
        let frame = sample();
        assert_eq!(Frame::parse(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::new();
        sample().encode_into(&mut buf);
        sample().encode_into(&mut buf);
        assert_eq!(buf.len(), sample().encoded_len() * 2);
        assert_eq!(&buf[sample().encoded_len()..], &sample().encode()[..]);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(MODULE_DEVICE, OP_QUERY_TRIGGER, Vec::new()).unwrap();
        assert_eq!(frame.encoded_len(), MIN_FRAME_LEN);
        assert_eq!(Frame::parse(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_payload_too_large() {
        let result = Frame::new(MODULE_BARCODE, OP_BARCODE_REPORT, vec![0; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
        assert!(Frame::new(MODULE_BARCODE, OP_BARCODE_REPORT, vec![0; MAX_PAYLOAD_LEN]).is_ok());
    }

    #[test]
    fn test_parse_detects_checksum_mismatch() {
        let mut wire = sample().encode().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(matches!(
            Frame::parse(&wire),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[rstest]
    #[case(&[0xA7, 0xB3, 0x03, 0x01])]
    #[case(&[0x00, 0xB3, 0x03, 0x01, 0x01, 0x01, 0x02])]
    #[case(&[0xA7, 0xB3, 0x02, 0x01, 0x01, 0x01, 0x02])]
    #[case(&[0xA7, 0xB3, 0x04, 0x01, 0x01, 0x01, 0x02])]
    fn test_parse_rejects_malformed(#[case] bytes: &[u8]) {
        assert!(matches!(Frame::parse(bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_display() {
        let frame = Frame::new(MODULE_DEVICE, OP_TRIGGER_REPORT, vec![0x01]).unwrap();
        assert_eq!(frame.to_string(), "module=0x01 opcode=0x8102 payload=[01]");
    }
}
