//! Frame-level codec for use with [`tokio_util::codec`].
//!
//! The [`Decoder`] and [`Encoder`] are bound to a [`Role`]: a server must receive
//! masked frames and sends unmasked ones, a client the other way around.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    OpCode, Role, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The two fixed bytes were consumed, waiting for the rest of the head.
    Header(Header),
    /// The head was consumed, waiting for the payload.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    /// Indicates if this is the final fragment in a message.
    fin: bool,
    /// Indicates if the frame is masked.
    masked: bool,
    /// The operation code of the frame.
    opcode: OpCode,
    /// Number of extended length bytes (0, 2 or 8).
    extra: usize,
    /// The 7-bit length field.
    length_code: u8,
    /// Bytes still to read before the payload starts.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding of WebSocket frames.
///
/// Mostly useful with [`tokio_util::codec::Framed`] when both directions of a
/// stream are driven from one place, as in tests or a raw client.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for `role` with the given maximum inbound payload size.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload_size),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        codec::Decoder::decode(&mut self.decoder, src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        codec::Encoder::encode(&mut self.encoder, item, dst)
    }
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` keeps the partially parsed head between calls, so it can be fed
/// arbitrary slices of the stream. It rejects:
/// - set RSV bits and reserved opcodes,
/// - frames masked the wrong way for its [`Role`],
/// - fragmented or oversized control frames, before reading their payload,
/// - payloads larger than the configured maximum or the address space.
pub struct Decoder {
    role: Role,
    /// Current reading state (header or payload).
    state: Option<ReadState>,
    /// Maximum allowed size for the frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for frames received by `role`.
    ///
    /// # Parameters
    /// - `role`: The side of the connection doing the reading.
    /// - `max_payload_size`: The maximum allowed payload size, in bytes.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete frame with its payload unmasked.
    /// - `Ok(None)`: more data is needed.
    /// - `Err(WebSocketError)`: a protocol violation. The stream is unusable afterwards.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    match (self.role, masked) {
                        (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
                        (Role::Client, true) => return Err(WebSocketError::UnexpectedMask),
                        _ => {}
                    }

                    // Control frames are checked before their payload is buffered.
                    if opcode.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => usize::from(src.get_u16()),
                        _ => {
                            let length = src.get_u64();
                            // the most significant bit must be 0
                            if length >> 63 != 0 {
                                return Err(WebSocketError::PayloadLengthOverflow);
                            }
                            usize::try_from(length)
                                .map_err(|_| WebSocketError::PayloadLengthOverflow)?
                        }
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    let payload_len = header_and_mask.payload_len;
                    if src.remaining() < payload_len {
                        src.reserve(payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask { header, mask, .. } = header_and_mask;

                    let mut payload = src.split_to(payload_len);
                    if let Some(key) = mask {
                        apply_mask(&mut payload, key);
                    }

                    let frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.validate()?;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Serializes frames for sending as `role`.
///
/// The frame is validated first. A server strips any mask key; a client masks
/// every frame, picking a random key when the frame has none.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates an encoder for frames sent by `role`.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.validate()?;

        match self.role {
            Role::Server => frame.mask = None,
            Role::Client => frame.mask(),
        }

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(key) = frame.mask {
            apply_mask(&mut dst[start..], key);
        }

        Ok(())
    }
}
