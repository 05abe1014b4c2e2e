//! # Close
//!
//! Status codes carried by close frames ([RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4))
//! and the parsing/validation of close frame payloads.
//!
//! A close payload is either empty, or a big-endian `u16` code followed by an optional UTF-8
//! reason. Since control frames carry at most 125 bytes, the reason is limited to 123 bytes.
use bytes::{BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Maximum length of a close reason: the 125-byte control payload minus the 2-byte code.
pub const MAX_REASON_LEN: usize = 123;

/// Status code used to indicate why an endpoint is closing the WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Indicates a normal closure, meaning that the purpose for
    /// which the connection was established has been fulfilled.
    Normal,
    /// Indicates that an endpoint is "going away", such as a server
    /// going down or a browser having navigated away from a page.
    Away,
    /// Indicates that an endpoint is terminating the connection due
    /// to a protocol error.
    Protocol,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a type of data it cannot accept.
    Unsupported,
    /// Indicates that no status code was present. Never sent on the wire.
    Status,
    /// Indicates that the connection was closed abnormally, without a
    /// close frame. Never sent on the wire.
    Abnormal,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received data within a message that was not
    /// consistent with the type of the message (e.g., non-UTF-8 data
    /// within a text message).
    Invalid,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a message that violates its policy.
    Policy,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a message that is too big for it to
    /// process.
    Size,
    /// Indicates that the client is terminating the connection because
    /// the server didn't negotiate an extension it expected.
    Extension,
    /// Indicates that a server is terminating the connection because
    /// it encountered an unexpected condition.
    Error,
    /// Indicates that the server is restarting.
    Restart,
    /// Indicates that the server is overloaded and the client should try again later.
    Again,
    /// Indicates that a gateway or proxy received an invalid response from the upstream server.
    BadGateway,
    /// Indicates a failed TLS handshake. Never sent on the wire.
    Tls,
    /// Codes reserved by RFC 6455 for future use.
    Reserved(u16),
    /// Codes registered with IANA (3000-3999), passed through as is.
    Iana(u16),
    /// Application-defined codes (4000-4999), passed through as is.
    Library(u16),
    /// Codes outside of every valid range.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if the code may be carried by a close frame.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Bad(_) | Self::Reserved(_) | Self::Status | Self::Abnormal | Self::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1014 => Self::BadGateway,
            1015 => Self::Tls,
            1004 | 1016..=2999 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::BadGateway => 1014,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Code and reason of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parses the payload of a received close frame.
    ///
    /// An empty payload yields `Ok(None)`: the peer did not say why it is closing.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(ProtocolError::InvalidCloseFrame),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_allowed() {
                    return Err(ProtocolError::InvalidCloseCode);
                }

                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| ProtocolError::InvalidUtf8)?
                    .to_owned();

                Ok(Some(Self { code, reason }))
            }
        }
    }

    /// Serializes the close info into a close frame payload, validating it for sending.
    pub fn to_payload(&self) -> Result<Bytes, ProtocolError> {
        if !self.code.is_allowed() {
            return Err(ProtocolError::InvalidCloseCode);
        }
        if self.reason.len() > MAX_REASON_LEN {
            return Err(ProtocolError::ControlPayloadTooLarge);
        }

        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(self.code.into());
        payload.extend_from_slice(self.reason.as_bytes());
        Ok(payload.freeze())
    }
}
