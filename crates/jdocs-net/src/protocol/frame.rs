//! WebSocket frame parsing and encoding (RFC 6455, server side).
//!
//! The parser is incremental: it accepts any split of the byte stream and
//! yields one frame at a time. Client frames must be masked; server frames
//! are written unmasked.

use jdocs_core::constants::MAX_MESSAGE_SIZE;

pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;

    #[inline]
    pub fn is_control(op: u8) -> bool {
        op & 0x8 != 0
    }
}

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const PAYLOAD_TOO_BIG: u16 = 1009;
    pub const EXTENSION_REQUIRED: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
}

pub fn close_reason(code: u16) -> &'static str {
    match code {
        close_code::NORMAL => "connection successfully closed",
        close_code::GOING_AWAY => "endpoint is going away",
        close_code::PROTOCOL_ERROR => "encountered protocol error",
        close_code::UNSUPPORTED_DATA => "received a type of data it cannot accept",
        close_code::INVALID_PAYLOAD => "message data inconsistent with its type",
        close_code::POLICY_VIOLATION => "message violates policy",
        close_code::PAYLOAD_TOO_BIG => "message too big to process",
        close_code::EXTENSION_REQUIRED => "expected extension not negotiated",
        close_code::INTERNAL_ERROR => "encountered an unexpected condition",
        _ => "unknown reason",
    }
}

/// One decoded (unmasked) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// All input consumed, frame not complete yet.
    NeedMore,
    Frame(Frame),
    /// Protocol violation; the value is the close code to answer with.
    Error(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Length,
    ExtLength,
    Mask,
    Payload,
}

#[derive(Debug)]
pub struct FrameParser {
    state: State,
    fin: bool,
    opcode: u8,
    ext: [u8; 8],
    ext_len: usize,
    filled: usize,
    mask: [u8; 4],
    length: usize,
    payload: Vec<u8>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: State::Header,
            fin: false,
            opcode: 0,
            ext: [0; 8],
            ext_len: 0,
            filled: 0,
            mask: [0; 4],
            length: 0,
            payload: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consume bytes from `data`. Returns the number consumed and the status.
    ///
    /// After `Frame` the parser is ready for the next frame; unconsumed bytes
    /// belong to it. After `Error` the stream is unusable.
    pub fn parse(&mut self, data: &[u8]) -> (usize, ParseStatus) {
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            match self.state {
                State::Header => {
                    if b & 0x70 != 0 {
                        return (i, ParseStatus::Error(close_code::PROTOCOL_ERROR));
                    }
                    self.fin = b & 0x80 != 0;
                    self.opcode = b & 0x0F;
                    self.state = State::Length;
                    i += 1;
                }
                State::Length => {
                    if b & 0x80 == 0 {
                        return (i, ParseStatus::Error(close_code::PROTOCOL_ERROR));
                    }
                    let len = (b & 0x7F) as usize;
                    if opcode::is_control(self.opcode) && (len > 125 || !self.fin) {
                        return (i, ParseStatus::Error(close_code::PROTOCOL_ERROR));
                    }
                    i += 1;
                    match len {
                        126 => self.begin_ext(2),
                        127 => self.begin_ext(8),
                        n => {
                            self.length = n;
                            self.begin_mask();
                        }
                    }
                }
                State::ExtLength => {
                    self.ext[self.filled] = b;
                    self.filled += 1;
                    i += 1;
                    if self.filled == self.ext_len {
                        let len = self.ext[..self.ext_len]
                            .iter()
                            .fold(0u64, |acc, &x| (acc << 8) | x as u64);
                        if len > MAX_MESSAGE_SIZE as u64 {
                            return (i, ParseStatus::Error(close_code::PAYLOAD_TOO_BIG));
                        }
                        self.length = len as usize;
                        self.begin_mask();
                    }
                }
                State::Mask => {
                    self.mask[self.filled] = b;
                    self.filled += 1;
                    i += 1;
                    if self.filled == 4 {
                        if self.length == 0 {
                            return (i, ParseStatus::Frame(self.finish()));
                        }
                        self.payload.reserve_exact(self.length);
                        self.state = State::Payload;
                    }
                }
                State::Payload => {
                    let want = self.length - self.payload.len();
                    let take = want.min(data.len() - i);
                    let base = self.payload.len();
                    self.payload.extend(
                        data[i..i + take]
                            .iter()
                            .enumerate()
                            .map(|(k, &x)| x ^ self.mask[(base + k) % 4]),
                    );
                    i += take;
                    if self.payload.len() == self.length {
                        return (i, ParseStatus::Frame(self.finish()));
                    }
                }
            }
        }
        (i, ParseStatus::NeedMore)
    }

    fn begin_ext(&mut self, n: usize) {
        self.ext_len = n;
        self.filled = 0;
        self.state = State::ExtLength;
    }

    fn begin_mask(&mut self) {
        self.filled = 0;
        self.state = State::Mask;
    }

    fn finish(&mut self) -> Frame {
        let frame = Frame {
            fin: self.fin,
            opcode: self.opcode,
            payload: std::mem::take(&mut self.payload),
        };
        self.reset();
        frame
    }
}

/// Header bytes needed for a payload of `len`.
#[inline]
pub fn header_len(len: usize) -> usize {
    if len < 126 {
        2
    } else if len <= 0xFFFF {
        4
    } else {
        10
    }
}

/// Largest slice of `remaining` that fits in one frame of `capacity` bytes.
pub fn affordable_payload(remaining: usize, capacity: usize) -> usize {
    if capacity <= 2 {
        return 0;
    }
    remaining.min(capacity.saturating_sub(header_len(remaining)))
}

/// Write an unmasked frame into `out`. Returns bytes written, or 0 if it does not fit.
pub fn encode_frame(fin: bool, op: u8, payload: &[u8], out: &mut [u8]) -> usize {
    let len = payload.len();
    let head = header_len(len);
    if head + len > out.len() {
        return 0;
    }
    out[0] = ((fin as u8) << 7) | (op & 0x0F);
    match head {
        2 => out[1] = len as u8,
        4 => {
            out[1] = 126;
            out[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            out[1] = 127;
            out[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out[head..head + len].copy_from_slice(payload);
    head + len
}

/// Close frame carrying `code` and no reason text.
pub fn encode_close(code: u16, out: &mut [u8]) -> usize {
    encode_frame(true, opcode::CLOSE, &code.to_be_bytes(), out)
}

#[cfg(test)]
pub(crate) fn mask_frame(fin: bool, op: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(((fin as u8) << 7) | op);
    match payload.len() {
        n if n < 126 => out.push(0x80 | n as u8),
        n if n <= 0xFFFF => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&key);
    out.extend(payload.iter().enumerate().map(|(i, &b)| b ^ key[i % 4]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_parse_rfc_masked_hello() {
        // RFC 6455 5.7: masked "Hello"
        let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut p = FrameParser::new();
        let (used, status) = p.parse(&wire);
        assert_eq!(used, wire.len());
        assert_eq!(
            status,
            ParseStatus::Frame(Frame { fin: true, opcode: opcode::TEXT, payload: b"Hello".to_vec() })
        );
    }

    #[test]
    fn test_parse_byte_by_byte() {
        let wire = mask_frame(true, opcode::BINARY, &[7u8; 300], KEY);
        let mut p = FrameParser::new();
        for (i, b) in wire.iter().enumerate() {
            let (used, status) = p.parse(std::slice::from_ref(b));
            assert_eq!(used, 1);
            if i + 1 < wire.len() {
                assert_eq!(status, ParseStatus::NeedMore);
            } else {
                match status {
                    ParseStatus::Frame(f) => assert_eq!(f.payload, vec![7u8; 300]),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_parse_two_frames_one_buffer() {
        let mut wire = mask_frame(true, opcode::TEXT, b"one", KEY);
        wire.extend(mask_frame(true, opcode::PING, b"", KEY));
        let mut p = FrameParser::new();
        let (used, first) = p.parse(&wire);
        assert!(matches!(first, ParseStatus::Frame(ref f) if f.payload == b"one"));
        let (used2, second) = p.parse(&wire[used..]);
        assert_eq!(used + used2, wire.len());
        assert!(matches!(second, ParseStatus::Frame(ref f) if f.opcode == opcode::PING));
    }

    #[test]
    fn test_parse_rejects_unmasked() {
        let mut p = FrameParser::new();
        let (_, status) = p.parse(&[0x81, 0x05, b'h']);
        assert_eq!(status, ParseStatus::Error(close_code::PROTOCOL_ERROR));
    }

    #[test]
    fn test_parse_rejects_oversize() {
        let mut p = FrameParser::new();
        let mut wire = vec![0x82, 0x80 | 127];
        wire.extend_from_slice(&((MAX_MESSAGE_SIZE as u64) + 1).to_be_bytes());
        let (_, status) = p.parse(&wire);
        assert_eq!(status, ParseStatus::Error(close_code::PAYLOAD_TOO_BIG));
    }

    #[test]
    fn test_parse_rejects_fragmented_control() {
        let mut p = FrameParser::new();
        let (_, status) = p.parse(&mask_frame(false, opcode::PING, b"x", KEY));
        assert_eq!(status, ParseStatus::Error(close_code::PROTOCOL_ERROR));
    }

    #[test]
    fn test_parse_rejects_rsv_bits() {
        let mut p = FrameParser::new();
        let (_, status) = p.parse(&[0xC1, 0x80]);
        assert_eq!(status, ParseStatus::Error(close_code::PROTOCOL_ERROR));
    }

    #[test]
    fn test_header_len_and_affordable() {
        assert_eq!(header_len(125), 2);
        assert_eq!(header_len(126), 4);
        assert_eq!(header_len(0xFFFF), 4);
        assert_eq!(header_len(0x10000), 10);

        assert_eq!(affordable_payload(100, 2048), 100);
        assert_eq!(affordable_payload(5000, 2048), 2044);
        assert_eq!(affordable_payload(1 << 20, 2048), 2038);
        assert_eq!(affordable_payload(10, 2), 0);
    }

    #[test]
    fn test_encode_frame_sizes() {
        let mut out = [0u8; 2048];
        assert_eq!(encode_frame(true, opcode::TEXT, b"hi", &mut out), 4);
        assert_eq!(&out[..4], &[0x81, 2, b'h', b'i']);

        let payload = vec![1u8; 2044];
        assert_eq!(encode_frame(false, opcode::TEXT, &payload, &mut out), 2048);
        assert_eq!(&out[..4], &[0x01, 126, 0x07, 0xFC]);

        assert_eq!(encode_frame(true, opcode::TEXT, &[0u8; 2045], &mut out), 0);
    }

    #[test]
    fn test_encode_close() {
        let mut out = [0u8; 8];
        assert_eq!(encode_close(close_code::PAYLOAD_TOO_BIG, &mut out), 4);
        assert_eq!(&out[..4], &[0x88, 2, 0x03, 0xF1]);
        assert_eq!(close_reason(close_code::NORMAL), "connection successfully closed");
    }
}
