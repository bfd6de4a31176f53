//! Stream parser for reader frames.
//!
//! The radio link and the proxy both deliver bytes in chunks that have no
//! relation to frame boundaries: a chunk may hold part of a frame, several
//! frames, or noise. [`StreamParser`] buffers what it is fed and extracts
//! frames with a two-state machine driven by the sync header and the length
//! byte.
//!
//! # Usage
//!
//! ```
//! use handheld_protocol::{Command, ParsedFrame, StreamParser};
//!
//! let wire = Command::query_battery().encode();
//! let mut parser = StreamParser::new();
//!
//! parser.feed(&wire[..4]);
//! assert!(parser.next_frame().is_none());
//!
//! parser.feed(&wire[4..]);
//! assert!(matches!(parser.next_frame(), Some(ParsedFrame::Frame(_))));
//! ```
//!
//! # Recovery
//!
//! A candidate frame whose length byte or checksum is invalid is reported as
//! [`ParsedFrame::Malformed`] and the parser resumes the sync search one byte
//! after the rejected sync header. A valid frame following corrupted bytes is
//! therefore still found.

use bytes::{Bytes, BytesMut};
use handheld_core::{Error, constants::*};
use std::collections::VecDeque;

use crate::frame::Frame;

/// Initial buffer capacity, enough for a handful of full frames.
const INITIAL_BUFFER_CAPACITY: usize = 4 * MAX_FRAME_LEN;

/// Initial capacity of the output queue.
const INITIAL_FRAME_QUEUE_CAPACITY: usize = 8;

/// Bytes needed before the length byte can be read.
const LENGTH_PREFIX_LEN: usize = SYNC_HEADER.len() + 1;

/// State machine states for frame extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Scanning for the `A7 B3` sync header.
    ///
    /// Bytes before the header are discarded, except a trailing `A7` that
    /// may be the first half of a header split across chunks.
    WaitingSync,

    /// Sync header found at the start of the buffer; waiting for the length
    /// byte and the rest of the frame.
    ReadingFrame,
}

/// One item produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFrame {
    /// A frame that passed length and checksum validation.
    Frame(Frame),

    /// Bytes that started with a sync header but failed validation.
    Malformed { raw: Bytes, error: Error },
}

/// Stateful parser turning a chunked byte stream into frames.
///
/// ```text
/// ┌─────────────┐  A7 B3 found  ┌──────────────┐  LEN + 4 bytes  ┌─────────────┐
/// │ WaitingSync │──────────────>│ ReadingFrame │────────────────>│ Frame ready │
/// └─────────────┘               └──────────────┘                 └─────────────┘
///       ^                              │                                │
///       │     bad length / checksum    │                                │
///       │     (drop one byte)          │                                │
///       └──────────────────────────────┴────────────────────────────────┘
/// ```
///
/// The buffer never holds more than one incomplete frame, so its size is
/// bounded by [`MAX_FRAME_LEN`] plus the last chunk fed.
#[derive(Debug)]
pub struct StreamParser {
    buffer: BytesMut,
    state: ParserState,
    frames: VecDeque<ParsedFrame>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            state: ParserState::WaitingSync,
            frames: VecDeque::with_capacity(INITIAL_FRAME_QUEUE_CAPACITY),
        }
    }

    /// Append bytes and extract every frame they complete.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        while self.try_extract_frame() {}
    }

    /// Next parsed item, in stream order.
    pub fn next_frame(&mut self) -> Option<ParsedFrame> {
        self.frames.pop_front()
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Number of parsed items waiting to be taken.
    pub fn frames_available(&self) -> usize {
        self.frames.len()
    }

    /// Bytes held for an incomplete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discard buffered bytes and queued items, and restart the sync search.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.frames.clear();
        self.state = ParserState::WaitingSync;
    }

    /// Iterator over the items already parsed.
    ///
    /// Does not consume more input; call [`feed()`] first.
    ///
    /// [`feed()`]: StreamParser::feed
    pub fn drain_frames(&mut self) -> DrainFrames<'_> {
        DrainFrames { parser: self }
    }

    /// Run the state machine once. Returns `true` while progress is made.
    fn try_extract_frame(&mut self) -> bool {
        match self.state {
            ParserState::WaitingSync => self.handle_waiting_sync(),
            ParserState::ReadingFrame => self.handle_reading_frame(),
        }
    }

    fn handle_waiting_sync(&mut self) -> bool {
        match find_sync(&self.buffer) {
            SyncSearch::Found(pos) => {
                let _ = self.buffer.split_to(pos);
                self.state = ParserState::ReadingFrame;
                true
            }
            SyncSearch::Partial(pos) => {
                let _ = self.buffer.split_to(pos);
                false
            }
            SyncSearch::NotFound => {
                self.buffer.clear();
                false
            }
        }
    }

    fn handle_reading_frame(&mut self) -> bool {
        if self.buffer.len() < LENGTH_PREFIX_LEN {
            return false;
        }

        let body_len = usize::from(self.buffer[SYNC_HEADER.len()]);
        if body_len < BODY_HEADER_LEN {
            let raw = Bytes::copy_from_slice(&self.buffer[..LENGTH_PREFIX_LEN]);
            self.reject(
                raw,
                Error::InvalidFrame(format!("length byte {body_len} shorter than header")),
            );
            return true;
        }

        let frame_len = FRAME_OVERHEAD + body_len;
        if self.buffer.len() < frame_len {
            return false;
        }

        match Frame::parse(&self.buffer[..frame_len]) {
            Ok(frame) => {
                let _ = self.buffer.split_to(frame_len);
                self.frames.push_back(ParsedFrame::Frame(frame));
                self.state = ParserState::WaitingSync;
            }
            Err(error) => {
                let raw = Bytes::copy_from_slice(&self.buffer[..frame_len]);
                self.reject(raw, error);
            }
        }
        true
    }

    /// Report a rejected candidate and resync one byte past its start.
    fn reject(&mut self, raw: Bytes, error: Error) {
        self.frames.push_back(ParsedFrame::Malformed { raw, error });
        let _ = self.buffer.split_to(1);
        self.state = ParserState::WaitingSync;
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

enum SyncSearch {
    /// Full header starts at this offset.
    Found(usize),
    /// Buffer ends with the first header byte at this offset.
    Partial(usize),
    NotFound,
}

fn find_sync(buffer: &[u8]) -> SyncSearch {
    let [first, second] = SYNC_HEADER;
    for (pos, &byte) in buffer.iter().enumerate() {
        if byte != first {
            continue;
        }
        match buffer.get(pos + 1) {
            Some(&next) if next == second => return SyncSearch::Found(pos),
            Some(_) => {}
            None => return SyncSearch::Partial(pos),
        }
    }
    SyncSearch::NotFound
}

/// Iterator that drains parsed items from a [`StreamParser`].
///
/// Created by [`StreamParser::drain_frames`].
pub struct DrainFrames<'a> {
    parser: &'a mut StreamParser,
}

impl<'a> Iterator for DrainFrames<'a> {
    type Item = ParsedFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_frame()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.parser.frames_available();
        (len, Some(len))
    }
}

impl<'a> ExactSizeIterator for DrainFrames<'a> {
    fn len(&self) -> usize {
        self.parser.frames_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;
    use handheld_core::ReaderMode;

    fn frame_bytes(mode: ReaderMode) -> Bytes {
        Command::set_reader_mode(mode).encode()
    }

    fn expect_frame(parser: &mut StreamParser) -> Frame {
        match parser.next_frame() {
            Some(ParsedFrame::Frame(frame)) => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_new_parser() {
        let parser = StreamParser::new();
        assert_eq!(parser.state(), ParserState::WaitingSync);
        assert_eq!(parser.frames_available(), 0);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_complete_frame_single_feed() {
        let mut parser = StreamParser::new();
        parser.feed(&frame_bytes(ReaderMode::Inventory));

        assert_eq!(parser.frames_available(), 1);
        let frame = expect_frame(&mut parser);
        assert_eq!(frame.opcode(), OP_SET_READER_MODE);
        assert_eq!(frame.payload(), &[1]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_byte_by_byte_feeding() {
        let mut parser = StreamParser::new();
        let wire = frame_bytes(ReaderMode::Barcode);

        for (i, byte) in wire.iter().enumerate() {
            parser.feed(&[*byte]);
            let complete = i == wire.len() - 1;
            assert_eq!(parser.frames_available(), usize::from(complete));
        }
        assert_eq!(expect_frame(&mut parser).payload(), &[3]);
    }

    #[test]
    fn test_multiple_frames_in_single_buffer() {
        let mut parser = StreamParser::new();
        let mut data = frame_bytes(ReaderMode::Inventory).to_vec();
        data.extend_from_slice(&frame_bytes(ReaderMode::Locate));
        parser.feed(&data);

        let payloads: Vec<_> = parser
            .drain_frames()
            .map(|item| match item {
                ParsedFrame::Frame(frame) => frame.payload().to_vec(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(payloads, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_garbage_before_sync_is_discarded() {
        let mut parser = StreamParser::new();
        let mut data = b"\x00\xFFnoise\xA7\x01".to_vec();
        data.extend_from_slice(&frame_bytes(ReaderMode::Idle));
        parser.feed(&data);

        assert_eq!(parser.frames_available(), 1);
        assert_eq!(expect_frame(&mut parser).payload(), &[0]);
    }

    #[test]
    fn test_sync_split_across_feeds() {
        let mut parser = StreamParser::new();
        let wire = frame_bytes(ReaderMode::Inventory);

        parser.feed(&[0x55, 0x55, wire[0]]);
        assert_eq!(parser.buffered_len(), 1);
        assert_eq!(parser.state(), ParserState::WaitingSync);

        parser.feed(&wire[1..]);
        assert_eq!(expect_frame(&mut parser).payload(), &[1]);
    }

    #[test]
    fn test_incomplete_frame_remains_buffered() {
        let mut parser = StreamParser::new();
        let wire = frame_bytes(ReaderMode::Inventory);

        parser.feed(&wire[..wire.len() - 1]);
        assert_eq!(parser.state(), ParserState::ReadingFrame);
        assert_eq!(parser.frames_available(), 0);

        parser.feed(&wire[wire.len() - 1..]);
        assert_eq!(parser.state(), ParserState::WaitingSync);
        assert_eq!(parser.frames_available(), 1);
    }

    #[test]
    fn test_bad_checksum_is_reported_and_next_frame_recovered() {
        let mut parser = StreamParser::new();
        let mut corrupted = frame_bytes(ReaderMode::Inventory).to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x5A;
        corrupted.extend_from_slice(&frame_bytes(ReaderMode::Barcode));

        parser.feed(&corrupted);

        match parser.next_frame() {
            Some(ParsedFrame::Malformed { raw, error }) => {
                assert_eq!(raw.len(), MIN_FRAME_LEN + 1);
                assert!(matches!(error, Error::ChecksumMismatch { .. }));
            }
            other => panic!("expected malformed, got {other:?}"),
        }
        assert_eq!(expect_frame(&mut parser).payload(), &[3]);
        assert!(parser.next_frame().is_none());
    }

    #[test]
    fn test_short_length_byte_is_reported() {
        let mut parser = StreamParser::new();
        let mut data = vec![0xA7, 0xB3, 0x01];
        data.extend_from_slice(&frame_bytes(ReaderMode::Locate));

        parser.feed(&data);

        assert!(matches!(
            parser.next_frame(),
            Some(ParsedFrame::Malformed {
                error: Error::InvalidFrame(_),
                ..
            })
        ));
        assert_eq!(expect_frame(&mut parser).payload(), &[2]);
    }

    #[test]
    fn test_clear_resets_parser() {
        let mut parser = StreamParser::new();
        let wire = frame_bytes(ReaderMode::Inventory);
        parser.feed(&wire[..5]);
        assert_eq!(parser.state(), ParserState::ReadingFrame);

        parser.clear();
        assert_eq!(parser.state(), ParserState::WaitingSync);
        assert_eq!(parser.buffered_len(), 0);

        parser.feed(&wire);
        assert_eq!(parser.frames_available(), 1);
    }

    #[test]
    fn test_drain_frames_exact_size() {
        let mut parser = StreamParser::new();
        for mode in [ReaderMode::Idle, ReaderMode::Inventory, ReaderMode::Barcode] {
            parser.feed(&frame_bytes(mode));
        }

        let drain = parser.drain_frames();
        assert_eq!(drain.len(), 3);
        assert_eq!(drain.count(), 3);
        assert_eq!(parser.frames_available(), 0);
    }
}
