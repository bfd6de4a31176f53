use crate::notification::Notification;
use crate::stream_parser::{ParsedFrame, StreamParser};

/// Streaming decoder from raw inbound bytes to [`Notification`]s.
///
/// Wraps a [`StreamParser`] and maps each parsed item: valid frames through
/// [`Notification::from_frame`], rejected candidates to
/// [`Notification::Unrecognized`]. Decoding never fails and never stops on a
/// bad frame.
#[derive(Debug, Default)]
pub struct NotificationDecoder {
    parser: StreamParser,
}

impl NotificationDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound chunk and return the notifications it completes.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Notification> {
        self.parser.feed(bytes);
        self.parser
            .drain_frames()
            .map(|item| match item {
                ParsedFrame::Frame(frame) => Notification::from_frame(&frame),
                ParsedFrame::Malformed { raw, error } => Notification::malformed(error, raw),
            })
            .collect()
    }

    /// Bytes held for a frame that is not complete yet.
    pub fn pending_bytes(&self) -> usize {
        self.parser.buffered_len()
    }

    /// Drop any partial frame, e.g. after the link was re-established.
    pub fn reset(&mut self) {
        self.parser.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::UnrecognizedReason;
    use handheld_core::{BatteryStatus, TriggerState};

    #[test]
    fn test_decode_across_chunks() {
        let battery = Notification::Battery(BatteryStatus::new(3900, 64));
        let trigger = Notification::Trigger(TriggerState::Pressed);
        let mut wire = battery.encode().unwrap().encode().to_vec();
        wire.extend_from_slice(&trigger.encode().unwrap().encode());

        let mut decoder = NotificationDecoder::new();
        let mut out = decoder.decode(&wire[..5]);
        assert!(out.is_empty());
        assert_eq!(decoder.pending_bytes(), 5);

        out.extend(decoder.decode(&wire[5..]));
        assert_eq!(out, vec![battery, trigger]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_corrupted_frame_becomes_unrecognized() {
        let mut wire = Notification::ScanCompleted.encode().unwrap().encode().to_vec();
        let last = wire.len() - 1;
        wire[last] = wire[last].wrapping_add(1);

        let mut decoder = NotificationDecoder::new();
        match decoder.decode(&wire).as_slice() {
            [Notification::Unrecognized(frame)] => {
                assert!(matches!(frame.reason, UnrecognizedReason::Malformed(_)));
                assert_eq!(&frame.raw[..], &wire[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let wire = Notification::ScanCompleted.encode().unwrap().encode();
        let mut decoder = NotificationDecoder::new();
        decoder.decode(&wire[..4]);
        decoder.reset();

        assert!(decoder.decode(&wire[4..]).is_empty());
        assert_eq!(decoder.decode(&wire), vec![Notification::ScanCompleted]);
    }
}
