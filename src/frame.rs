//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! A frame is the atomic unit of transmission: protocol metadata plus a payload.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! The RSV bits are always zero here: no extensions are negotiated.
//!
//! A [`Frame`] always holds its payload in clear text. The mask key, when present,
//! records that the frame travels (or travelled) masked on the wire; the
//! [`codec`](crate::codec) applies or removes the XOR at the byte boundary.
//!
//! ```rust
//! use hyperserve_ws::{close::CloseCode, Frame, OpCode};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! assert!(text.validate().is_ok());
//!
//! let close = Frame::close(CloseCode::Normal, "bye");
//! assert_eq!(close.opcode, OpCode::Close);
//! assert_eq!(close.close_code(), Some(CloseCode::Normal));
//! ```
use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, Result, WebSocketError};

/// Largest possible frame head: 2 fixed bytes, 8 bytes of extended length and a 4-byte mask key.
pub const MAX_HEAD_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code (OpCode) that determines the semantic meaning of a frame.
///
/// # Data Frame OpCodes
/// - `Continuation`: Continues a fragmented message started by another data frame
/// - `Text`: Contains UTF-8 encoded text data
/// - `Binary`: Contains raw binary data
///
/// # Control Frame OpCodes
/// - `Close`: Initiates or confirms connection closure
/// - `Ping`: Tests connection liveness, requiring a `Pong` response
/// - `Pong`: Responds to a `Ping` frame
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved. They have no variant here, so a
/// reserved value can only exist as a raw byte and is rejected by [`OpCode::try_from`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return Err(WebSocketError::InvalidOpCode(value)),
        })
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// One WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether this is the final fragment of a message.
    pub fin: bool,
    /// The frame type.
    pub opcode: OpCode,
    /// Masking key used on the wire, if any.
    pub mask: Option<[u8; 4]>,
    /// Clear-text payload.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame. The payload is taken as clear text.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final frame with no mask key.
    pub fn from_parts(opcode: OpCode, payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, opcode, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::from_parts(OpCode::Text, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::from_parts(OpCode::Binary, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::from_parts(OpCode::Ping, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::from_parts(OpCode::Pong, payload)
    }

    /// Creates a close frame carrying `code` and `reason`.
    ///
    /// The reason is truncated so the payload stays within the 125-byte control
    /// frame limit. Truncation never splits a UTF-8 character.
    pub fn close(code: CloseCode, reason: impl AsRef<str>) -> Self {
        let reason = truncate_reason(reason.as_ref(), MAX_CONTROL_PAYLOAD - 2);

        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());

        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with an arbitrary raw payload.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::from_parts(OpCode::Close, payload)
    }

    /// Returns `true` if the frame carries a mask key.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Sets the mask key. The payload itself is left untouched.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Sets a random mask key if none is present.
    pub fn mask(&mut self) {
        if self.mask.is_none() {
            self.mask = Some(rand::random());
        }
    }

    /// Consumes the frame, returning its opcode and frozen payload.
    pub fn into_parts(self) -> (OpCode, Bytes) {
        (self.opcode, self.payload.freeze())
    }

    /// Checks the frame-level invariants.
    ///
    /// A control frame must be final and carry at most [`MAX_CONTROL_PAYLOAD`]
    /// bytes. Opcode validity is enforced by the [`OpCode`] type itself.
    pub fn validate(&self) -> Result<()> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }
        Ok(())
    }

    /// Status code of a close frame, if the payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        Some(CloseCode::from(code))
    }

    /// Reason text of a close frame, if present and valid UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        if self.opcode != OpCode::Close || self.payload.len() <= 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }

    /// Writes the frame head into `head`, returning the number of bytes used.
    ///
    /// Uses the shortest length encoding that fits the payload. `head` must be
    /// at least [`MAX_HEAD_SIZE`] bytes long.
    pub fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(key) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&key);
            size + 4
        } else {
            size
        }
    }
}

fn truncate_reason(reason: &str, max: usize) -> &str {
    if reason.len() <= max {
        return reason;
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
            assert!(!OpCode::Continuation.is_control());
        }

        #[test]
        fn test_try_from_u8_valid() {
            for code in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
                let opcode = OpCode::try_from(code).unwrap();
                assert_eq!(u8::from(opcode), code);
            }
        }

        #[test]
        fn test_reserved_opcodes_rejected() {
            for code in [0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }
    }

    mod validate_tests {
        use super::*;

        #[test]
        fn test_fragmented_ping_is_invalid() {
            let frame = Frame::new(false, OpCode::Ping, None, BytesMut::new());
            assert!(matches!(
                frame.validate(),
                Err(WebSocketError::ControlFrameFragmented)
            ));
        }

        #[test]
        fn test_oversized_ping_is_invalid() {
            let frame = Frame::ping(vec![0u8; 126]);
            assert!(matches!(
                frame.validate(),
                Err(WebSocketError::ControlFrameTooLarge)
            ));
            assert!(Frame::ping(vec![0u8; 125]).validate().is_ok());
        }

        #[test]
        fn test_large_data_frames_are_valid() {
            assert!(Frame::binary(vec![0u8; 70_000]).validate().is_ok());
            let partial = Frame::new(false, OpCode::Text, None, BytesMut::from("part"));
            assert!(partial.validate().is_ok());
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_payload_layout() {
            let frame = Frame::close(CloseCode::Normal, "Normal closure");
            assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
            assert_eq!(&frame.payload[2..], b"Normal closure");
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
            assert_eq!(frame.close_reason(), Some("Normal closure"));
        }

        #[test]
        fn test_close_reason_truncated_on_char_boundary() {
            let reason = "é".repeat(100);
            let frame = Frame::close(CloseCode::Away, &reason);
            assert!(frame.payload.len() <= MAX_CONTROL_PAYLOAD);
            assert!(frame.validate().is_ok());
            assert!(frame.close_reason().is_some());
        }

        #[test]
        fn test_close_without_payload() {
            let frame = Frame::close_raw(b"");
            assert_eq!(frame.close_code(), None);
            assert_eq!(frame.close_reason(), None);
        }

        #[test]
        fn test_head_length_encoding() {
            let mut head = [0u8; MAX_HEAD_SIZE];
            for (len, expected) in [(0usize, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
                let frame = Frame::binary(vec![0u8; len]);
                assert_eq!(frame.fmt_head(&mut head), expected, "len {len}");
                assert_eq!(head[0], 0x82);
            }
        }

        #[test]
        fn test_head_with_mask() {
            let frame = Frame::text("Hi").with_mask([1, 2, 3, 4]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);
            assert_eq!(size, 6);
            assert_eq!(&head[..6], &[0x81, 0x82, 1, 2, 3, 4]);
        }

        #[test]
        fn test_random_mask_only_when_absent() {
            let mut frame = Frame::text("x").with_mask([9, 9, 9, 9]);
            frame.mask();
            assert_eq!(frame.mask, Some([9, 9, 9, 9]));

            let mut frame = Frame::text("x");
            frame.mask();
            assert!(frame.is_masked());
        }

        #[test]
        fn test_into_parts() {
            let (opcode, payload) = Frame::binary([0xDEu8, 0xAD]).into_parts();
            assert_eq!(opcode, OpCode::Binary);
            assert_eq!(payload, Bytes::from_static(&[0xDE, 0xAD]));
        }
    }
}
