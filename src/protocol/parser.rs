//! Stream reassembler
//!
//! Turns an arbitrarily chunked byte stream back into discrete messages.
//! Garbage between frames is skipped, and a frame that fails validation costs
//! exactly that frame.

use bytes::BytesMut;
use tracing::{debug, warn};

use super::codec::{decode, FrameHeader};
use super::{Message, CHECKSUM_SIZE, HEADER_SIZE, MAX_FRAME_SIZE, PROTOCOL_MAGIC};

/// Where the reassembler is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingMagic,
    AwaitingHeader,
    AwaitingPayload,
    AwaitingChecksum,
}

/// Incremental frame parser carrying partial-frame state across calls
pub struct StreamReassembler {
    state: ParseState,
    /// Bytes of the in-progress candidate frame, starting at its magic byte
    buffer: BytesMut,
    /// Buffer length at which the current state is satisfied
    expected_len: usize,
    frames_decoded: u64,
    frames_rejected: u64,
    bytes_discarded: u64,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self {
            state: ParseState::AwaitingMagic,
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
            expected_len: 1,
            frames_decoded: 0,
            frames_rejected: 0,
            bytes_discarded: 0,
        }
    }

    /// Drop any partial frame and wait for the next magic byte
    pub fn reset(&mut self) {
        self.state = ParseState::AwaitingMagic;
        self.buffer.clear();
        self.expected_len = 1;
    }

    /// Consume a chunk of any size, returning every frame it completes
    pub fn feed(&mut self, data: &[u8]) -> Vec<Message> {
        let mut out = Vec::new();
        self.consume(data, &mut out);
        out
    }

    fn consume(&mut self, mut data: &[u8], out: &mut Vec<Message>) {
        while !data.is_empty() {
            if self.state == ParseState::AwaitingMagic {
                match data.iter().position(|&b| b == PROTOCOL_MAGIC) {
                    Some(pos) => {
                        if pos > 0 {
                            self.discard(pos);
                        }
                        self.buffer.extend_from_slice(&data[pos..pos + 1]);
                        self.state = ParseState::AwaitingHeader;
                        self.expected_len = HEADER_SIZE;
                        data = &data[pos + 1..];
                    }
                    None => {
                        self.discard(data.len());
                        return;
                    }
                }
                continue;
            }

            let take = (self.expected_len - self.buffer.len()).min(data.len());
            if self.buffer.len() + take > MAX_FRAME_SIZE {
                warn!(
                    buffered = self.buffer.len(),
                    "Frame exceeds maximum size, resetting parser"
                );
                self.reject();
                continue;
            }

            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buffer.len() == self.expected_len {
                self.advance(out);
            }
        }
    }

    fn advance(&mut self, out: &mut Vec<Message>) {
        match self.state {
            ParseState::AwaitingMagic => {}
            ParseState::AwaitingHeader => match FrameHeader::parse(&self.buffer) {
                Ok(header) => {
                    if header.payload_len > 0 {
                        self.state = ParseState::AwaitingPayload;
                        self.expected_len = HEADER_SIZE + header.payload_len;
                    } else {
                        self.state = ParseState::AwaitingChecksum;
                        self.expected_len = HEADER_SIZE + CHECKSUM_SIZE;
                    }
                }
                Err(e) => {
                    debug!("Rejected frame header: {}", e);
                    // The magic byte was spurious; the rest of the candidate
                    // may hold the start of a real frame.
                    let tail = self.buffer.split_off(1);
                    self.reject();
                    self.consume(&tail, out);
                }
            },
            ParseState::AwaitingPayload => {
                self.state = ParseState::AwaitingChecksum;
                self.expected_len += CHECKSUM_SIZE;
            }
            ParseState::AwaitingChecksum => {
                match decode(&self.buffer) {
                    Ok(message) => {
                        debug!(
                            kind = %message.kind,
                            len = message.payload.len(),
                            "Frame reassembled"
                        );
                        self.frames_decoded += 1;
                        out.push(message);
                        self.reset();
                    }
                    Err(e) => {
                        warn!("Discarding frame: {}", e);
                        self.reject();
                    }
                }
            }
        }
    }

    fn reject(&mut self) {
        self.frames_rejected += 1;
        self.bytes_discarded += self.buffer.len() as u64;
        self.reset();
    }

    fn discard(&mut self, count: usize) {
        self.bytes_discarded += count as u64;
        debug!(count, "Skipping bytes while scanning for magic");
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Bytes still required to satisfy the current state. Advisory only.
    pub fn bytes_needed(&self) -> usize {
        self.expected_len.saturating_sub(self.buffer.len())
    }

    pub fn has_partial_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            frames_decoded: self.frames_decoded,
            frames_rejected: self.frames_rejected,
            bytes_discarded: self.bytes_discarded,
        }
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub bytes_discarded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, MessageKind, PROTOCOL_VERSION};

    fn frame(kind: MessageKind, payload: &'static [u8], ts: u32) -> Vec<u8> {
        encode(&Message::new(kind, payload, ts)).unwrap().to_vec()
    }

    #[test]
    fn test_single_frame_one_call() {
        let mut parser = StreamReassembler::new();
        let msgs = parser.feed(&frame(MessageKind::Text, b"hello", 5));

        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].payload[..], b"hello");
        assert_eq!(parser.state(), ParseState::AwaitingMagic);
        assert!(!parser.has_partial_data());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut parser = StreamReassembler::new();
        let bytes = frame(MessageKind::Status, b"{\"status\":\"ok\"}", 99);

        let mut msgs = Vec::new();
        for b in &bytes {
            msgs.extend(parser.feed(std::slice::from_ref(b)));
        }
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].timestamp, 99);
    }

    #[test]
    fn test_bytes_needed_tracks_state() {
        let mut parser = StreamReassembler::new();
        let bytes = frame(MessageKind::Text, b"abcd", 0);

        assert_eq!(parser.bytes_needed(), 1);
        parser.feed(&bytes[..3]);
        assert_eq!(parser.state(), ParseState::AwaitingHeader);
        assert_eq!(parser.bytes_needed(), HEADER_SIZE - 3);

        parser.feed(&bytes[3..HEADER_SIZE]);
        assert_eq!(parser.state(), ParseState::AwaitingPayload);
        assert_eq!(parser.bytes_needed(), 4);

        parser.feed(&bytes[HEADER_SIZE..HEADER_SIZE + 4]);
        assert_eq!(parser.state(), ParseState::AwaitingChecksum);
        assert_eq!(parser.bytes_needed(), 2);
    }

    #[test]
    fn test_empty_payload_goes_straight_to_checksum() {
        let mut parser = StreamReassembler::new();
        let bytes = frame(MessageKind::Ping, b"", 1);
        parser.feed(&bytes[..HEADER_SIZE]);
        assert_eq!(parser.state(), ParseState::AwaitingChecksum);
        assert_eq!(parser.feed(&bytes[HEADER_SIZE..]).len(), 1);
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let mut parser = StreamReassembler::new();
        let mut stream = vec![0x00, 0x13, 0xAA, 0xFF];
        stream.extend(frame(MessageKind::Text, b"x", 1));

        let msgs = parser.feed(&stream);
        assert_eq!(msgs.len(), 1);
        assert_eq!(parser.stats().bytes_discarded, 4);
    }

    #[test]
    fn test_corrupted_frame_costs_one_frame() {
        let mut parser = StreamReassembler::new();
        let mut bad = frame(MessageKind::Text, b"first", 1);
        bad[12] ^= 0x40;
        let good = frame(MessageKind::Text, b"second", 2);

        let mut stream = bad;
        stream.extend(&good);
        let msgs = parser.feed(&stream);

        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].payload[..], b"second");
        assert_eq!(parser.stats().frames_rejected, 1);
    }

    #[test]
    fn test_spurious_magic_does_not_swallow_next_frame() {
        let mut parser = StreamReassembler::new();
        // Magic followed by a bad version, then a real frame
        let mut stream = vec![PROTOCOL_MAGIC, PROTOCOL_VERSION + 1];
        stream.extend(frame(MessageKind::Pong, b"{}", 3));

        let msgs = parser.feed(&stream);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::Pong);
    }

    #[test]
    fn test_oversized_declared_length_resets() {
        let mut parser = StreamReassembler::new();
        let mut stream = vec![PROTOCOL_MAGIC, PROTOCOL_VERSION, 0x11, 0x00, 0xFF, 0xFF, 0, 0, 0, 0];
        stream.extend(frame(MessageKind::Text, b"ok", 4));

        let msgs = parser.feed(&stream);
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].payload[..], b"ok");
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut parser = StreamReassembler::new();
        let mut stream = frame(MessageKind::Response, b"a", 1);
        stream.extend(frame(MessageKind::Response, b"b", 2));
        stream.extend(frame(MessageKind::ResponseFinal, b"c", 3));

        let msgs = parser.feed(&stream);
        let kinds: Vec<_> = msgs.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::Response, MessageKind::Response, MessageKind::ResponseFinal]
        );
        assert_eq!(parser.stats().frames_decoded, 3);
    }
}
