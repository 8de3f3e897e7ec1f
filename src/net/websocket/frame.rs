//! WebSocket frame codec (RFC 6455 Section 5).
//!
//! Covers what the upgrade core needs after the handshake: single frames,
//! client masking, control-frame rules and a payload limit. Fragmented
//! messages are delivered frame by frame and never reassembled; extension
//! bits are rejected.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  Masking-key, if MASK set     |          Payload Data         |
//! +-------------------------------+-------------------------------+
//! ```

use crate::codec::{Decoder, Encoder};
use crate::net::websocket::CloseCode;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    /// Returns true for Close, Ping and Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Parses the 4-bit opcode field.
    pub fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::InvalidOpcode(value)),
        }
    }
}

/// One WebSocket frame, unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Payload data.
    pub payload: Bytes,
}

impl Frame {
    /// A final frame with `opcode` and `payload`.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// A text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// A binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// A ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// A pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// A close frame with an optional status code and reason.
    ///
    /// A reason without a code is dropped; the wire format has no place for it.
    #[must_use]
    pub fn close(code: Option<u16>, reason: Option<&str>) -> Self {
        let Some(code) = code else {
            return Self::new(Opcode::Close, Bytes::new());
        };
        let reason = reason.unwrap_or_default();
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, buf.freeze())
    }

    /// True for a close frame.
    #[must_use]
    pub fn is_close(&self) -> bool {
        self.opcode == Opcode::Close
    }

    /// Status code carried by a close frame, if any.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        if !self.is_close() || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Frame codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WsError {
    /// Reserved opcode value.
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),
    /// Reserved bits set without a negotiated extension.
    #[error("reserved bits set without extension")]
    ReservedBitsSet,
    /// Payload exceeds the configured maximum.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Declared payload size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),
    /// Control frame without FIN.
    #[error("control frame cannot be fragmented")]
    FragmentedControlFrame,
    /// A server received an unmasked frame.
    #[error("client frame must be masked")]
    UnmaskedClientFrame,
    /// A client received a masked frame.
    #[error("server frame must not be masked")]
    MaskedServerFrame,
    /// Text frame payload is not UTF-8.
    #[error("invalid UTF-8 in text frame")]
    InvalidUtf8,
    /// Close frame payload is a lone byte or carries a reserved code.
    #[error("invalid close frame payload")]
    InvalidClosePayload,
}

impl WsError {
    /// Status code to send in the close frame answering this error.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::PayloadTooLarge { .. } => CloseCode::MessageTooBig,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Which end of the connection a codec serves; decides masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Masks outbound frames, rejects masked inbound frames.
    Client,
    /// Sends unmasked frames, requires masked inbound frames.
    Server,
}

/// Parsed fixed part of a frame header.
#[derive(Debug, Clone, Copy)]
struct Header {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
    header_len: usize,
}

/// Frame encoder and decoder for one side of a connection.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_payload_size: usize,
    /// Header of a frame whose payload has not fully arrived yet.
    pending: Option<Header>,
}

impl FrameCodec {
    /// Default maximum payload size (64 KiB).
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

    /// Creates a codec for `role`.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_payload_size: Self::DEFAULT_MAX_PAYLOAD_SIZE,
            pending: None,
        }
    }

    /// Client-role codec.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Server-role codec.
    #[must_use]
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Sets the maximum payload size.
    #[must_use]
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// The codec's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Parses the header at the front of `src` without consuming it.
    fn peek_header(&self, src: &[u8]) -> Result<Option<Header>, WsError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (src[0], src[1]);
        if b0 & 0x70 != 0 {
            return Err(WsError::ReservedBitsSet);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;
        match (self.role, masked) {
            (Role::Server, false) => return Err(WsError::UnmaskedClientFrame),
            (Role::Client, true) => return Err(WsError::MaskedServerFrame),
            _ => {}
        }

        let len7 = b1 & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(WsError::FragmentedControlFrame);
            }
            if usize::from(len7) > MAX_CONTROL_PAYLOAD {
                return Err(WsError::ControlFrameTooLarge(usize::from(len7)));
            }
        }

        let (declared, mut offset) = match len7 {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            short => (u64::from(short), 2),
        };
        let payload_len = usize::try_from(declared)
            .ok()
            .filter(|&len| len <= self.max_payload_size)
            .ok_or(WsError::PayloadTooLarge {
                size: declared,
                max: self.max_payload_size,
            })?;

        let mask = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&src[offset..offset + 4]);
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(Header {
            fin,
            opcode,
            mask,
            payload_len,
            header_len: offset,
        }))
    }
}

fn validate_payload(header: &Header, payload: &[u8]) -> Result<(), WsError> {
    match header.opcode {
        Opcode::Text if header.fin => {
            std::str::from_utf8(payload).map_err(|_| WsError::InvalidUtf8)?;
        }
        Opcode::Close => {
            if payload.len() == 1 {
                return Err(WsError::InvalidClosePayload);
            }
            if payload.len() >= 2 {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseCode::is_valid_code(code) {
                    return Err(WsError::InvalidClosePayload);
                }
                std::str::from_utf8(&payload[2..]).map_err(|_| WsError::InvalidUtf8)?;
            }
        }
        _ => {}
    }
    Ok(())
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WsError> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                let Some(header) = self.peek_header(src)? else {
                    return Ok(None);
                };
                src.advance(header.header_len);
                self.pending = Some(header);
                header
            }
        };
        if src.len() < header.payload_len {
            return Ok(None);
        }
        self.pending = None;

        let mut payload = src.split_to(header.payload_len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }
        validate_payload(&header, &payload)?;
        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WsError> {
        let len = frame.payload.len();
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(WsError::FragmentedControlFrame);
            }
            if len > MAX_CONTROL_PAYLOAD {
                return Err(WsError::ControlFrameTooLarge(len));
            }
        }

        let mask = (self.role == Role::Client).then(generate_mask_key);
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        dst.reserve(14 + len);
        dst.put_u8(u8::from(frame.fin) << 7 | frame.opcode as u8);
        if let Some(short) = u8::try_from(len).ok().filter(|&l| l <= 125) {
            dst.put_u8(mask_bit | short);
        } else if let Ok(short) = u16::try_from(len) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(short);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&frame.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&frame.payload),
        }
        Ok(())
    }
}

/// XORs `payload` in place with the repeating 4-byte `mask_key`.
///
/// Masking and unmasking are the same operation.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// RFC 6455 Section 5.3 requires masking keys from a strong entropy source.
fn generate_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    getrandom::fill(&mut key).expect("OS RNG unavailable");
    key
}
