//! RFC 6455 frame codec
//!
//! Pure transcoding between wire bytes and [`Frame`] values plus the
//! per-connection fragment reassembly state. No I/O happens here: the
//! connection layer feeds bytes in and writes encoded bytes out.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload accepted for one frame and for one reassembled message.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Control frames never carry more than this (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Close status code carried in a close frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
}

/// Validation failures while decoding or reassembling client frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("client frame is not masked")]
    UnmaskedFrame,

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u64, max: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

impl FrameError {
    /// The close code the connection must send in response.
    pub fn close_code(&self) -> CloseCode {
        match self {
            FrameError::FrameTooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            FrameError::UnmaskedFrame | FrameError::ProtocolViolation(_) => {
                CloseCode::PROTOCOL_ERROR
            }
        }
    }
}

/// One WebSocket frame. `mask_key` is present only on client frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(true, Opcode::Text, Bytes::from(text.into()))
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(true, Opcode::Pong, payload)
    }

    pub fn close(code: CloseCode) -> Self {
        Self::new(true, Opcode::Close, code.0.to_be_bytes().to_vec())
    }

    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }
}

/// Read the status code out of a close frame payload. An empty payload has
/// no code; a one-byte payload is malformed.
pub fn parse_close_code(payload: &[u8]) -> Result<Option<CloseCode>, FrameError> {
    match payload {
        [] => Ok(None),
        [_] => Err(FrameError::ProtocolViolation("close payload of one byte")),
        [hi, lo, ..] => Ok(Some(CloseCode(u16::from_be_bytes([*hi, *lo])))),
    }
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Frame decoder for one direction of a connection
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    max_payload: usize,
    require_mask: bool,
}

impl Decoder {
    /// Decoder for frames sent by clients: masking is mandatory.
    pub fn server(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: true,
        }
    }

    /// Decoder that also accepts unmasked frames, for reading server output.
    #[cfg(test)]
    pub fn client(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: false,
        }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole frame; nothing
    /// is consumed in that case. Header-level violations (unmasked frame,
    /// oversized length) are reported as soon as the header is readable,
    /// before the payload arrives.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let fin = b0 & 0x80 != 0;
        // RSV1-3 are ignored: no extensions are ever negotiated.
        let opcode =
            Opcode::from_u8(b0 & 0x0F).ok_or(FrameError::ProtocolViolation("reserved opcode"))?;
        let masked = b1 & 0x80 != 0;
        if self.require_mask && !masked {
            return Err(FrameError::UnmaskedFrame);
        }

        let (payload_len, mut header_len) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            short => (u64::from(short), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::ProtocolViolation("fragmented control frame"));
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ProtocolViolation(
                    "control frame payload over 125 bytes",
                ));
            }
        }
        if payload_len > self.max_payload as u64 {
            return Err(FrameError::FrameTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }
        let payload_len = payload_len as usize;

        let mask_offset = header_len;
        if masked {
            header_len += 4;
        }
        if buf.len() < header_len + payload_len {
            return Ok(None);
        }

        let mask_key = masked.then(|| {
            [
                buf[mask_offset],
                buf[mask_offset + 1],
                buf[mask_offset + 2],
                buf[mask_offset + 3],
            ]
        });
        buf.advance(header_len);
        let mut payload = buf.split_to(payload_len);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask_key,
            payload: payload.freeze(),
        }))
    }
}

/// Append the wire form of `frame` to `dst`. Server frames carry no mask
/// key and go out unmasked.
pub fn encode(frame: &Frame, dst: &mut BytesMut) {
    let len = frame.payload.len();
    dst.reserve(14 + len);

    let fin_bit = if frame.fin { 0x80 } else { 0 };
    dst.put_u8(fin_bit | frame.opcode.as_u8());

    let mask_bit = if frame.is_masked() { 0x80 } else { 0 };
    if len < 126 {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match frame.mask_key {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(&frame.payload),
    }
}

/// A complete data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Reassembly state for a message split across several frames
#[derive(Debug)]
pub struct FragmentAssembly {
    opcode: Option<Opcode>,
    buffer: BytesMut,
    max_message: usize,
}

impl FragmentAssembly {
    pub fn new(max_message: usize) -> Self {
        Self {
            opcode: None,
            buffer: BytesMut::new(),
            max_message,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Feed one data frame. Yields the message once its final fragment has
    /// arrived.
    pub fn push(&mut self, frame: Frame) -> Result<Option<DataMessage>, FrameError> {
        match frame.opcode {
            Opcode::Continuation => {
                let Some(opcode) = self.opcode else {
                    return Err(FrameError::ProtocolViolation(
                        "continuation frame with no message in progress",
                    ));
                };
                let size = self.buffer.len() + frame.payload.len();
                if size > self.max_message {
                    self.reset();
                    return Err(FrameError::FrameTooLarge {
                        size: size as u64,
                        max: self.max_message,
                    });
                }
                self.buffer.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                let payload = self.buffer.split().freeze();
                self.opcode = None;
                Ok(Some(DataMessage { opcode, payload }))
            }
            Opcode::Text | Opcode::Binary => {
                if self.in_progress() {
                    return Err(FrameError::ProtocolViolation(
                        "new data frame while a fragmented message is in progress",
                    ));
                }
                if frame.payload.len() > self.max_message {
                    return Err(FrameError::FrameTooLarge {
                        size: frame.payload.len() as u64,
                        max: self.max_message,
                    });
                }
                if frame.fin {
                    return Ok(Some(DataMessage {
                        opcode: frame.opcode,
                        payload: frame.payload,
                    }));
                }
                self.opcode = Some(frame.opcode);
                self.buffer.extend_from_slice(&frame.payload);
                Ok(None)
            }
            Opcode::Close | Opcode::Ping | Opcode::Pong => Err(FrameError::ProtocolViolation(
                "control frame fed to fragment assembly",
            )),
        }
    }

    fn reset(&mut self) {
        self.opcode = None;
        self.buffer.clear();
    }
}
