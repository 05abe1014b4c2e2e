//! # wsengine
//! A sans-io implementation of the client side of the WebSocket protocol (RFC 6455) with
//! permessage-deflate compression (RFC 7692), message fragmentation and the close handshake.
//!
//! The protocol engine, [`Connection`], never touches a socket. Bytes read from the transport are
//! handed to it, and it hands back [`Event`]s and the bytes that must be written to the transport.
//! This keeps the protocol logic deterministic and easy to test, and lets the caller pick whatever
//! runtime, TLS stack or HTTP client it already uses for the upgrade handshake.
//!
//! For tokio users, [`WebSocketStream`] drives a [`Connection`] over any already-upgraded
//! `AsyncRead + AsyncWrite` transport.
//!
//! # Features
//! The crate provides several optional features that can be enabled in your `Cargo.toml`:
//!
//! - `zlib`: Uses a zlib backend for flate2, which enables the `client_max_window_bits` and
//!   `server_max_window_bits` parameters of permessage-deflate.
//!
//! - `logging`: Enables debug logging of negotiation, phase transitions and protocol failures
//!   using the `log` crate.
//!
//! - `simd`: Validates UTF-8 of text messages using `simdutf8`.
//!
//! - `json`: Enables [`WebSocketStream::send_json`].
//!
//! # Driving a connection by hand
//! ```rust
//! use wsengine::{Connection, Event, Message, Options, Role};
//!
//! # fn main() -> wsengine::Result<()> {
//! let mut client = Connection::new(Role::Client, Options::default());
//! let mut server = Connection::new(Role::Server, Options::default());
//! client.open()?;
//! server.open()?;
//!
//! client.send(Message::text("Hello server!"))?;
//!
//! let events = server.receive(&client.take_output());
//! assert_eq!(events[0], Event::Opened);
//! assert!(matches!(&events[1], Event::MessageReceived(msg) if msg.as_str() == Some("Hello server!")));
//! # Ok(())
//! # }
//! ```
//!
//! # Memory Safety
//! - Maximum frame payload size limits (configurable, default 1 MiB)
//! - Maximum reassembled/inflated message size (configurable, default 2 MiB)
//! - Automatic handling of control frames
//! - UTF-8 validation of every completed text message

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod fragment;
pub mod frame;
mod mask;
pub mod options;
mod stream;

use thiserror::Error;

pub use close::{CloseCode, CloseInfo};
pub use connection::{CloseEvent, Connection, ConnectionPhase, Event};
pub use fragment::{Message, MessageKind};
pub use frame::{Frame, OpCode};
pub use options::{CompressionLevel, DeflateOptions, Options, MAX_MESSAGE_SIZE, MAX_PAYLOAD_READ};
pub use stream::WebSocketStream;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// The role the engine is taking on the connection.
///
/// A client masks every frame it sends and refuses masked frames from the server.
/// A server does the opposite. The role only affects masking and which side of the
/// permessage-deflate parameters applies to each direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Violations of RFC 6455 / RFC 7692 detected while encoding or decoding.
///
/// Errors raised while receiving are fatal to the connection: the engine reports them with
/// [`Event::Errored`] and moves to [`ConnectionPhase::Closed`]. The caller-contract variants
/// ([`ProtocolError::InterleavedSend`], [`ProtocolError::ControlPayloadTooLarge`] and
/// [`ProtocolError::InvalidCloseCode`] for a local close) are returned synchronously from the
/// offending call and leave the connection untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A control frame arrived fragmented or with a declared payload above 125 bytes.
    #[error("Invalid control frame")]
    InvalidControlFrame,

    /// The 64-bit extended payload length had its most significant bit set.
    #[error("Invalid payload length")]
    InvalidLength,

    /// A client received a masked frame from the server.
    #[error("Unexpected masked frame")]
    UnexpectedMask,

    /// A server received an unmasked frame from the client.
    #[error("Frame is not masked")]
    MissingMask,

    /// Reserved bits are set in a way no negotiated extension allows.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The frame carries an opcode reserved by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A frame's declared payload is above the configured maximum.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A message (reassembled or inflated) grew above the configured maximum.
    #[error("Message too big")]
    MessageTooBig,

    /// The peer's deflate stream could not be inflated.
    #[error("Decompression failed")]
    DecompressionFailed,

    /// A compressed frame arrived on a connection where permessage-deflate was not negotiated.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// The caller started a new message while a fragmented send was still incomplete.
    #[error("Interleaved fragmented send")]
    InterleavedSend,

    /// The peer started a new data message while another one was still being assembled.
    #[error("Fragmented message already in progress")]
    AlreadyInProgress,

    /// A continuation frame arrived with no message being assembled.
    #[error("Unexpected continuation frame")]
    UnexpectedContinuation,

    /// A completed text message or a close reason is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUtf8,

    /// A ping, pong or close payload would exceed 125 bytes.
    #[error("Control frame payload too large")]
    ControlPayloadTooLarge,

    /// A close frame payload of exactly one byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close code that must not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,
}

impl ProtocolError {
    /// The status code sent in the best-effort close frame when this error aborts a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUtf8 | Self::DecompressionFailed => CloseCode::Invalid,
            Self::FrameTooLarge | Self::MessageTooBig => CloseCode::Size,
            _ => CloseCode::Protocol,
        }
    }
}

/// Errors about the lifecycle of the connection rather than its wire format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The operation requires the connection to be open.
    #[error("Connection is not open")]
    NotOpen,

    /// [`Connection::open`] was called outside of the connecting phase.
    #[error("Connection was already opened")]
    AlreadyOpened,

    /// The connection is closed; no further communication is possible.
    #[error("Connection is closed")]
    ConnectionClosed,
}

/// Represents errors that can occur during WebSocket operations.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// See [`ConnectionError`].
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Wraps standard I/O errors raised by the transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Returns the wrapped [`ProtocolError`], if any.
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}
