//! Wire codec for WebSocket frames, usable on its own with `tokio_util::codec::Framed`.
//!
//! The decoder is resumable: it only consumes bytes from the source buffer once a whole frame
//! is available, so the caller can keep appending bytes as they arrive and call it again.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::{apply_mask, MaskKeys},
    ProtocolError, Role, WebSocketError,
};

/// Header fields of a frame whose header is fully buffered.
struct Head {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    /// Size of the header, including the extended length and the masking key.
    header_size: usize,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding of WebSocket frames.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for `role`, rejecting frames above `max_payload_read` bytes.
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self::from((Decoder::new(role, max_payload_read), Encoder::new(role)))
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
        Ok(self.decoder.decode_frame(src)?)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(self.encoder.encode_frame(item, dst)?)
    }
}

/// A decoder for WebSocket frames.
///
/// Frames sent by a client must be masked and frames sent by a server must not be, so the
/// decoder checks the mask bit against the role it is decoding for.
pub struct Decoder {
    role: Role,
    /// Maximum allowed size for a frame payload.
    max_payload_read: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for the given role.
    ///
    /// # Parameters
    /// - `role`: The role of the endpoint that *receives* the frames.
    /// - `max_payload_read`: The maximum allowed payload size, in bytes.
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self {
            role,
            max_payload_read,
        }
    }

    /// Parses the header at the start of `src` without consuming anything.
    ///
    /// Returns `Ok(None)` while the header is incomplete. Control frame and masking rules are
    /// checked as soon as the first two bytes are in, so a bad frame fails before its payload
    /// arrives.
    fn parse_head(&self, src: &[u8]) -> Result<Option<Head>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        let rsv1 = src[0] & 0b0100_0000 != 0;

        if src[0] & 0b0011_0000 != 0 {
            return Err(ProtocolError::ReservedBitsNotZero);
        }

        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        if opcode.is_control() {
            if !fin || usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::InvalidControlFrame);
            }
            if rsv1 {
                return Err(ProtocolError::ReservedBitsNotZero);
            }
        }

        match (self.role, masked) {
            (Role::Client, true) => return Err(ProtocolError::UnexpectedMask),
            (Role::Server, false) => return Err(ProtocolError::MissingMask),
            _ => {}
        }

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + if masked { 4 } else { 0 };
        if src.len() < header_size {
            return Ok(None);
        }

        let payload_len = match extra {
            0 => u64::from(length_code),
            2 => u64::from(u16::from_be_bytes([src[2], src[3]])),
            _ => {
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(len);
                if len >> 63 != 0 {
                    return Err(ProtocolError::InvalidLength);
                }
                len
            }
        };

        if payload_len > self.max_payload_read as u64 {
            return Err(ProtocolError::FrameTooLarge);
        }
        let payload_len =
            usize::try_from(payload_len).map_err(|_| ProtocolError::FrameTooLarge)?;

        let mask = masked.then(|| {
            let at = header_size - 4;
            [src[at], src[at + 1], src[at + 2], src[at + 3]]
        });

        Ok(Some(Head {
            fin,
            rsv1,
            opcode,
            mask,
            header_size,
            payload_len,
        }))
    }
}

impl Decoder {
    /// Decodes a single frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete, unmasked frame. Exactly its bytes were consumed.
    /// - `Ok(None)`: more data is needed. Nothing was consumed.
    /// - `Err(ProtocolError)`: the buffered bytes violate the protocol.
    pub fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let Some(head) = self.parse_head(&src[..])? else {
            return Ok(None);
        };

        let frame_len = head.header_size + head.payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(head.header_size);
        let mut payload = src.split_to(head.payload_len);
        if let Some(key) = head.mask {
            apply_mask(&mut payload, key);
        }

        let frame = Frame::new(head.fin, head.opcode, payload.freeze()).with_rsv1(head.rsv1);
        Ok(Some(frame))
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_frame(src)?)
    }
}

/// WebSocket frame encoder.
///
/// A client encoder masks every frame with a fresh key; a server encoder never masks.
pub struct Encoder {
    role: Role,
    keys: MaskKeys,
}

impl Encoder {
    /// Creates a new `Encoder` for the role of the endpoint that *sends* the frames.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            keys: MaskKeys::new(),
        }
    }
}

impl Encoder {
    /// Appends the wire representation of `frame` to `dst`.
    ///
    /// Fails without writing anything if a control frame is fragmented or too large.
    pub fn encode_frame(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        frame.validate_control()?;

        let mask = match self.role {
            Role::Client => Some(frame.mask.unwrap_or_else(|| self.keys.next_key())),
            Role::Server => None,
        };

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head, mask);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(key) = mask {
            apply_mask(&mut dst[start..], key);
        }

        Ok(())
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(self.encode_frame(frame, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const MAX: usize = 1 << 20;

    fn encode(role: Role, frame: Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        Encoder::new(role).encode(frame, &mut dst).unwrap();
        dst
    }

    fn decode_err(role: Role, bytes: &[u8]) -> ProtocolError {
        let mut src = BytesMut::from(bytes);
        match Decoder::new(role, MAX).decode(&mut src) {
            Err(WebSocketError::Protocol(err)) => err,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_lengths() {
        for opcode in [OpCode::Text, OpCode::Binary, OpCode::Continuation] {
            for len in [0usize, 1, 125, 126, 127, 65535, 65536, 70000] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let frame = Frame::new(true, opcode, payload.clone());

                // client -> server
                let mut wire = encode(Role::Client, frame.clone());
                let decoded = Decoder::new(Role::Server, MAX)
                    .decode(&mut wire)
                    .unwrap()
                    .unwrap();
                assert!(wire.is_empty());
                assert_eq!(decoded, frame);

                // server -> client
                let mut wire = encode(Role::Server, frame.clone());
                let decoded = Decoder::new(Role::Client, MAX)
                    .decode(&mut wire)
                    .unwrap()
                    .unwrap();
                assert_eq!(decoded, frame);
            }
        }
    }

    #[test]
    fn test_round_trip_control_and_flags() {
        let frames = [
            Frame::ping("ping"),
            Frame::pong(Bytes::new()),
            Frame::close_raw(&b"\x03\xE8bye"[..]),
            Frame::binary("compressed").with_rsv1(true).with_fin(false),
        ];
        for frame in frames {
            let mut wire = encode(Role::Server, frame.clone());
            let decoded = Decoder::new(Role::Client, MAX)
                .decode(&mut wire)
                .unwrap()
                .unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_decode_is_resumable() {
        let frame = Frame::text(vec![b'x'; 300]);
        let wire = encode(Role::Client, frame.clone());

        let mut decoder = Decoder::new(Role::Server, MAX);
        let mut src = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            src.extend_from_slice(&[*byte]);
            let res = decoder.decode(&mut src).unwrap();
            if i + 1 < wire.len() {
                assert!(res.is_none());
                // nothing consumed while incomplete
                assert_eq!(src.len(), i + 1);
            } else {
                assert_eq!(res.unwrap(), frame);
                assert!(src.is_empty());
            }
        }
    }

    #[test]
    fn test_decode_leaves_following_frames() {
        let mut wire = encode(Role::Server, Frame::text("one"));
        wire.extend_from_slice(&encode(Role::Server, Frame::text("two")));
        wire.extend_from_slice(&encode(Role::Server, Frame::ping("three"))[..3]);

        let mut decoder = Decoder::new(Role::Client, MAX);
        assert_eq!(
            decoder.decode(&mut wire).unwrap().unwrap().payload,
            Bytes::from("one")
        );
        assert_eq!(
            decoder.decode(&mut wire).unwrap().unwrap().payload,
            Bytes::from("two")
        );
        assert!(decoder.decode(&mut wire).unwrap().is_none());
        assert_eq!(wire.len(), 3);
    }

    #[test]
    fn test_client_frames_are_masked() {
        let payload = b"same payload every time";
        let mut keys = Vec::new();
        for _ in 0..8 {
            let wire = encode(Role::Client, Frame::text(&payload[..]));
            assert_eq!(wire[1] & 0x80, 0x80);
            keys.push([wire[2], wire[3], wire[4], wire[5]]);
            // payload is not sent in clear unless the key happens to be zero
            if keys.last() != Some(&[0; 4]) {
                assert_ne!(&wire[6..], &payload[..]);
            }
        }
        assert!(keys.iter().any(|key| *key != keys[0]));
    }

    #[test]
    fn test_pinned_mask() {
        let wire = encode(Role::Client, Frame::text("Hi").with_mask([1, 2, 3, 4]));
        assert_eq!(&wire[..], &[0x81, 0x82, 1, 2, 3, 4, b'H' ^ 1, b'i' ^ 2]);
    }

    #[test]
    fn test_server_frames_are_not_masked() {
        let wire = encode(Role::Server, Frame::text("Hi"));
        assert_eq!(&wire[..], &[0x81, 0x02, b'H', b'i']);
    }

    #[test]
    fn test_encode_control_limits() {
        let mut dst = BytesMut::new();
        let mut encoder = Encoder::new(Role::Client);

        assert!(encoder.encode(Frame::ping(vec![0u8; 125]), &mut dst).is_ok());
        let written = dst.len();

        for frame in [Frame::ping(vec![0u8; 126]), Frame::pong(vec![0u8; 126])] {
            let err = encoder.encode(frame, &mut dst).unwrap_err();
            assert_eq!(
                err.as_protocol(),
                Some(&ProtocolError::ControlPayloadTooLarge)
            );
        }
        assert_eq!(dst.len(), written);
    }

    #[test]
    fn test_decode_invalid_control_frames() {
        // ping without fin
        assert_eq!(
            decode_err(Role::Client, &[0x09, 0x00]),
            ProtocolError::InvalidControlFrame
        );
        // close with a 126 length escape
        assert_eq!(
            decode_err(Role::Client, &[0x88, 126, 0x00, 0x7E]),
            ProtocolError::InvalidControlFrame
        );
        // compressed pong
        assert_eq!(
            decode_err(Role::Client, &[0xCA, 0x00]),
            ProtocolError::ReservedBitsNotZero
        );
    }

    #[test]
    fn test_decode_invalid_length() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(1u64 << 63 | 5).to_be_bytes());
        assert_eq!(decode_err(Role::Client, &wire), ProtocolError::InvalidLength);
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut src = BytesMut::from(&[0x82u8, 126, 0x01, 0x00][..]);
        let err = Decoder::new(Role::Client, 255).decode(&mut src).unwrap_err();
        assert_eq!(err.as_protocol(), Some(&ProtocolError::FrameTooLarge));
    }

    #[test]
    fn test_decode_mask_direction() {
        assert_eq!(
            decode_err(Role::Client, &[0x81, 0x81, 1, 2, 3, 4, b'a' ^ 1]),
            ProtocolError::UnexpectedMask
        );
        assert_eq!(
            decode_err(Role::Server, &[0x81, 0x01, b'a']),
            ProtocolError::MissingMask
        );
    }

    #[test]
    fn test_decode_reserved_bits_and_opcodes() {
        assert_eq!(
            decode_err(Role::Client, &[0xA1, 0x00]),
            ProtocolError::ReservedBitsNotZero
        );
        assert_eq!(
            decode_err(Role::Client, &[0x83, 0x00]),
            ProtocolError::InvalidOpCode(0x3)
        );
    }
}
