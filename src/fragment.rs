//! # Fragmentation
//!
//! A message can be carried by several frames ([RFC 6455 Section 5.4](https://datatracker.ietf.org/doc/html/rfc6455#section-5.4)):
//! the first one has the `Text` or `Binary` opcode, the following ones are `Continuation` frames,
//! and the last one has `fin` set. Control frames may show up between the fragments of a message
//! but are never fragmented themselves.
//!
//! ```text
//! Text(fin=0, "Hello") -> Ping -> Continuation(fin=0, " server ") -> Continuation(fin=1, ":)")
//!
//! Assembler:  None ---> Control(Ping) ---> None ---> Message(Text, "Hello server :)")
//! ```
//!
//! The [`Assembler`] rebuilds messages on the receiving side and the [`Fragmenter`] keeps track
//! of which message is being streamed on the sending side.
use bytes::{Bytes, BytesMut};

use crate::{
    frame::{Frame, OpCode},
    ProtocolError,
};

/// Validates UTF-8, with `simdutf8` when the `simd` feature is enabled.
#[inline]
pub(crate) fn is_utf8(bytes: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(bytes).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(bytes).is_ok()
    }
}

/// Kind of a data message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl From<MessageKind> for OpCode {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        }
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Creates a text message. The payload is expected to be UTF-8.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, payload)
    }

    /// Returns the payload as a string slice for text messages.
    pub fn as_str(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }
}

/// Output of the [`Assembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A data message is complete. `compressed` is the RSV1 flag of its first frame.
    Message { message: Message, compressed: bool },
    /// A control frame, handed back untouched.
    Control(Frame),
}

#[derive(Debug, Copy, Clone)]
struct Fragment {
    kind: MessageKind,
    compressed: bool,
}

/// Rebuilds messages out of received data frames.
pub struct Assembler {
    in_progress: Option<Fragment>,
    accumulated: BytesMut,
    max_message_size: usize,
}

impl Assembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            in_progress: None,
            accumulated: BytesMut::new(),
            max_message_size,
        }
    }

    /// Returns `true` while a fragmented message is being assembled.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Drops the message being assembled, if any.
    pub fn reset(&mut self) {
        self.in_progress = None;
        self.accumulated = BytesMut::new();
    }

    /// Processes a received frame.
    ///
    /// Returns `Ok(None)` while a fragmented message still waits for more frames. Any error drops
    /// the message being assembled.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Option<Assembled>, ProtocolError> {
        let result = self.assemble(frame);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Assembled>, ProtocolError> {
        let kind = match frame.opcode {
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                return Ok(Some(Assembled::Control(frame)))
            }
            OpCode::Continuation => return self.on_continuation(frame),
            OpCode::Text => MessageKind::Text,
            OpCode::Binary => MessageKind::Binary,
        };

        if self.is_in_progress() {
            return Err(ProtocolError::AlreadyInProgress);
        }
        if frame.payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooBig);
        }

        if frame.fin {
            return Ok(Some(Assembled::Message {
                message: Message::new(kind, frame.payload),
                compressed: frame.rsv1,
            }));
        }

        self.in_progress = Some(Fragment {
            kind,
            compressed: frame.rsv1,
        });
        self.accumulated.extend_from_slice(&frame.payload);

        Ok(None)
    }

    fn on_continuation(&mut self, frame: Frame) -> Result<Option<Assembled>, ProtocolError> {
        let fragment = self
            .in_progress
            .ok_or(ProtocolError::UnexpectedContinuation)?;

        // RSV1 only marks the first frame of a compressed message
        if frame.rsv1 {
            return Err(ProtocolError::ReservedBitsNotZero);
        }
        if self.accumulated.len() + frame.payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooBig);
        }

        self.accumulated.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        self.in_progress = None;
        let payload = std::mem::take(&mut self.accumulated).freeze();

        Ok(Some(Assembled::Message {
            message: Message::new(fragment.kind, payload),
            compressed: fragment.compressed,
        }))
    }
}

/// Tracks the message being streamed with explicit fragment boundaries.
#[derive(Debug, Default)]
pub struct Fragmenter {
    in_progress: Option<MessageKind>,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Checks that a complete message may start now.
    pub fn check_whole(&self) -> Result<(), ProtocolError> {
        if self.is_in_progress() {
            return Err(ProtocolError::InterleavedSend);
        }
        Ok(())
    }

    /// Returns the opcode of the next chunk of a `kind` message without changing any state.
    ///
    /// The first chunk carries the message kind, the following ones are continuations.
    pub fn opcode_for(&self, kind: MessageKind) -> Result<OpCode, ProtocolError> {
        match self.in_progress {
            None => Ok(kind.into()),
            Some(current) if current == kind => Ok(OpCode::Continuation),
            Some(_) => Err(ProtocolError::InterleavedSend),
        }
    }

    /// Records that a chunk of a `kind` message was sent.
    pub fn record(&mut self, kind: MessageKind, fin: bool) {
        self.in_progress = if fin { None } else { Some(kind) };
    }

    /// Drops the message being streamed.
    pub fn reset(&mut self) {
        self.in_progress = None;
    }
}

/// Splits `payload` into chunks of at most `fragment_size` bytes.
///
/// An empty payload, or a `fragment_size` of zero, yields a single chunk.
pub fn split(mut payload: Bytes, fragment_size: usize) -> Vec<Bytes> {
    if fragment_size == 0 || payload.len() <= fragment_size {
        return vec![payload];
    }

    let mut chunks = Vec::with_capacity(payload.len().div_ceil(fragment_size));
    while payload.len() > fragment_size {
        chunks.push(payload.split_to(fragment_size));
    }
    chunks.push(payload);

    chunks
}
