//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! A frame is the atomic unit of transmission: a small header followed by the payload.
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
//! Frames come in two categories:
//!
//! - **Data Frames** (`Text`, `Binary`, `Continuation`) carry application payload and may be
//!   split into several frames, the last of which has `fin` set.
//! - **Control Frames** (`Close`, `Ping`, `Pong`) manage the connection. They are never
//!   fragmented and carry at most 125 bytes.
//!
//! ```rust
//! use wsengine::{frame::Frame, close::CloseCode};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let first = Frame::binary(vec![1, 2, 3]).with_fin(false);
//! let last = Frame::continuation(vec![4, 5]);
//! let ping = Frame::ping("are you there?");
//! let close = Frame::close(CloseCode::Normal, b"Normal closure");
//! ```
use bytes::Bytes;

use crate::{close::CloseCode, ProtocolError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible header: 2 fixed bytes, 8 bytes of extended length and 4 bytes of mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
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

/// A WebSocket frame.
///
/// Decoded frames are always unmasked: the codec removes the mask before handing the frame out.
/// On the way out the masking key is normally picked by the encoder; [`Frame::with_mask`] pins it.
///
/// **Note:** most users should not build frames by hand. [`crate::Connection`] builds the frames
/// for messages and control operations and enforces the ordering rules between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// Set on the first frame of a message compressed with permessage-deflate.
    pub rsv1: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Masking key to use when encoding, if pinned.
    pub(crate) mask: Option<[u8; 4]>,
    /// The payload of the frame, never masked.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    /// Creates a final continuation frame.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Creates a close frame with a close code and reason.
    ///
    /// This does not validate the code or the reason length, see [`crate::CloseInfo::to_payload`].
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);

        Self::new(true, OpCode::Close, payload)
    }

    /// Creates a close frame with a raw payload.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, payload)
    }

    /// Sets the `fin` flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets the RSV1 (compressed) flag.
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Pins the masking key used when this frame is encoded by a client.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Checks the invariants every control frame must hold before it is encoded.
    pub(crate) fn validate_control(&self) -> Result<(), ProtocolError> {
        if self.opcode.is_control() {
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlPayloadTooLarge);
            }
            if !self.fin || self.rsv1 {
                return Err(ProtocolError::InvalidControlFrame);
            }
        }
        Ok(())
    }

    /// Formats the frame header into `head` and returns its size.
    ///
    /// `mask` is the key announced in the header, if any.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8], mask: Option<[u8; 4]>) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv1 as u8) << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        match mask {
            Some(key) => {
                head[1] |= 0x80;
                head[size..size + 4].copy_from_slice(&key);
                size + 4
            }
            None => size,
        }
    }
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

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_byte_conversions() {
            for opcode in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(opcode)), Ok(opcode));
            }
        }

        #[test]
        fn test_reserved_opcodes() {
            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert_eq!(
                    OpCode::try_from(code),
                    Err(ProtocolError::InvalidOpCode(code))
                );
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_constructors() {
            let frame = Frame::text("Hello");
            assert!(frame.fin);
            assert!(!frame.rsv1);
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.payload, Bytes::from("Hello"));

            let frame = Frame::binary(vec![1, 2, 3]).with_fin(false);
            assert!(!frame.fin);
            assert_eq!(frame.opcode, OpCode::Binary);

            let frame = Frame::continuation("tail");
            assert!(frame.fin);
            assert_eq!(frame.opcode, OpCode::Continuation);
        }

        #[test]
        fn test_close_payload() {
            let frame = Frame::close(CloseCode::Normal, "Normal closure");
            assert_eq!(frame.opcode, OpCode::Close);

            let mut expected = 1000u16.to_be_bytes().to_vec();
            expected.extend_from_slice(b"Normal closure");
            assert_eq!(frame.payload, Bytes::from(expected));
        }

        #[test]
        fn test_validate_control() {
            assert!(Frame::ping(vec![0u8; 125]).validate_control().is_ok());
            assert_eq!(
                Frame::ping(vec![0u8; 126]).validate_control(),
                Err(ProtocolError::ControlPayloadTooLarge)
            );
            assert_eq!(
                Frame::pong("x").with_fin(false).validate_control(),
                Err(ProtocolError::InvalidControlFrame)
            );
            // data frames are not bound by control limits
            assert!(Frame::text(vec![b'a'; 4096]).validate_control().is_ok());
        }

        #[test]
        fn test_fmt_head_small() {
            let mask_key = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::text("Header test");

            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head, Some(mask_key));

            assert_eq!(size, 2 + 4);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &mask_key);
        }

        #[test]
        fn test_fmt_head_extended_lengths() {
            let mut head = [0u8; MAX_HEAD_SIZE];

            let frame = Frame::binary(vec![0u8; 126]).with_rsv1(true);
            assert_eq!(frame.fmt_head(&mut head, None), 4);
            assert_eq!(head[0], 0x80 | 0x40 | 0x2);
            assert_eq!(head[1], 126);
            assert_eq!(&head[2..4], &126u16.to_be_bytes());

            let frame = Frame::binary(vec![0u8; 65536]).with_fin(false);
            assert_eq!(frame.fmt_head(&mut head, None), 10);
            assert_eq!(head[0], 0x2);
            assert_eq!(head[1], 127);
            assert_eq!(&head[2..10], &65536u64.to_be_bytes());
        }
    }
}
