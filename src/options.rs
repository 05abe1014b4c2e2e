//! Connection configuration and the negotiated permessage-deflate parameters.
use std::{str::FromStr, time::Duration};

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult, Parser,
};

use crate::{
    compression::{Compressor, Decompressor},
    Role,
};

/// The default maximum payload size for reading WebSocket frames, set to 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The default maximum size of a reassembled or inflated message, set to 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// How long a best-effort close frame may take to be written by [`crate::WebSocketStream`].
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Compression level used by the deflate compressor.
pub type CompressionLevel = flate2::Compression;

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Configuration options for a WebSocket connection.
///
/// Every field left as `None` falls back to its default when the connection is created.
///
/// ```rust
/// use wsengine::{CompressionLevel, Options};
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .with_compression_level(CompressionLevel::fast())
///     .client_no_context_takeover();
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Maximum allowed payload size of a single incoming frame, in bytes.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum size of an incoming message, once reassembled and inflated.
    ///
    /// Default: 2 MiB as defined in [`MAX_MESSAGE_SIZE`], or twice the configured
    /// `max_payload_read` if that is set.
    pub max_message_size: Option<usize>,

    /// The negotiated permessage-deflate parameters. `None` means the extension is not in use,
    /// and a compressed frame from the peer is a protocol error.
    pub compression: Option<DeflateOptions>,

    /// Bound on the best-effort close write of [`crate::WebSocketStream`].
    ///
    /// Default: 5 seconds as defined in [`CLOSE_TIMEOUT`]
    pub close_timeout: Option<Duration>,
}

impl Options {
    /// Sets the compression level for outgoing messages, enabling permessage-deflate.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;

        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Uses the given negotiated permessage-deflate parameters.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression for the connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the maximum allowed payload size of incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of an incoming message.
    ///
    /// This bounds both the buffer accumulating fragments and the output of the decompressor.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Sets how long [`crate::WebSocketStream`] waits for a best-effort close frame to be written.
    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: Some(timeout),
            ..self
        }
    }

    /// Disables context takeover for the messages the server compresses.
    ///
    /// The server resets its compression window after every message, and the client resets the
    /// matching decompression window.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for the messages the client compresses.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the LZ77 window of the messages the client compresses.
    ///
    /// Only honoured when compiled with the `zlib` feature.
    pub fn with_client_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the LZ77 window of the messages the server compresses.
    ///
    /// Only honoured when compiled with the `zlib` feature.
    pub fn with_server_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Resolves the defaults.
    pub(crate) fn negotiate(self) -> Negotiation {
        let max_payload_read = self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ);
        let max_message_size = self.max_message_size.unwrap_or_else(|| {
            self.max_payload_read
                .map(|size| size.saturating_mul(2))
                .unwrap_or(MAX_MESSAGE_SIZE)
        });

        Negotiation {
            compression: self.compression,
            max_payload_read,
            max_message_size,
            close_timeout: self.close_timeout.unwrap_or(CLOSE_TIMEOUT),
        }
    }
}

/// Negotiated parameters of the permessage-deflate extension ([RFC 7692 Section 7](https://datatracker.ietf.org/doc/html/rfc7692#section-7)).
///
/// The `client_*` parameters apply to the messages the client compresses and the server
/// inflates, the `server_*` ones to the opposite direction.
///
/// The value of a `Sec-WebSocket-Extensions` response header can be parsed directly:
///
/// ```rust
/// use wsengine::DeflateOptions;
///
/// let opts: DeflateOptions = "permessage-deflate; client_no_context_takeover; server_max_window_bits=10"
///     .parse()
///     .unwrap();
/// assert!(opts.client_no_context_takeover);
/// assert!(!opts.server_no_context_takeover);
/// assert_eq!(opts.server_max_window_bits, Some(10));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateOptions {
    /// Compression level of outgoing messages. Not part of the negotiation.
    pub level: CompressionLevel,

    /// Window size (8-15 bits) of the messages the server compresses.
    pub server_max_window_bits: Option<u8>,

    /// Window size (8-15 bits) of the messages the client compresses.
    pub client_max_window_bits: Option<u8>,

    /// The server resets its compression window after every message.
    pub server_no_context_takeover: bool,

    /// The client resets its compression window after every message.
    pub client_no_context_takeover: bool,
}

impl DeflateOptions {
    /// Parses the parameters that follow the extension name.
    fn parse_params<'a>(&mut self, mut input: &'a str) -> IResult<&'a str, ()> {
        while !input.trim_end().is_empty() {
            let (remaining, (key, value)) = parse_param(input)?;
            match key {
                "client_no_context_takeover" => self.client_no_context_takeover = true,
                "server_no_context_takeover" => self.server_no_context_takeover = true,
                "server_max_window_bits" => self.server_max_window_bits = window_bits(value),
                "client_max_window_bits" => self.client_max_window_bits = window_bits(value),
                _ => {}
            }

            input = remaining;
        }

        Ok((input, ()))
    }
}

/// `; key` or `; key=value`
fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        (space0, tag(";"), space0),
        pair(
            take_while1(|c: char| c.is_alphanumeric() || c == '_'),
            opt(preceded(tag("="), digit1)),
        ),
    )
    .parse(input)
}

/// Window bits outside of 8-15, or without a value, leave the default window.
fn window_bits(value: Option<&str>) -> Option<u8> {
    value
        .and_then(|value| value.parse::<u8>().ok())
        .filter(|bits| (8..=15).contains(bits))
}

impl FromStr for DeflateOptions {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut this = Self::default();
        let extension = tag::<_, _, nom::error::Error<&str>>(PERMESSAGE_DEFLATE);
        let (remaining, _) = preceded(space0, extension)
            .parse(input)
            .map_err(|err| err.to_string())?;
        this.parse_params(remaining).map_err(|err| err.to_string())?;
        Ok(this)
    }
}

impl std::fmt::Display for DeflateOptions {
    /// Formats the parameters as a `Sec-WebSocket-Extensions` header value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", PERMESSAGE_DEFLATE)?;

        if let Some(bits) = self.server_max_window_bits {
            write!(f, "; server_max_window_bits={}", bits)?;
        }
        if let Some(bits) = self.client_max_window_bits {
            write!(f, "; client_max_window_bits={}", bits)?;
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }

        Ok(())
    }
}

/// [`Options`] with every default resolved, as used by a connection.
#[derive(Debug, Clone)]
pub(crate) struct Negotiation {
    pub(crate) compression: Option<DeflateOptions>,
    pub(crate) max_payload_read: usize,
    pub(crate) max_message_size: usize,
    pub(crate) close_timeout: Duration,
}

impl Negotiation {
    /// Builds the decompressor for the messages the peer sends to `role`.
    pub(crate) fn decompressor(&self, role: Role) -> Option<Decompressor> {
        let config = self.compression.as_ref()?;

        // the client inflates what the server compressed, and the other way around
        let (no_context_takeover, _window_bits) = match role {
            Role::Client => (
                config.server_no_context_takeover,
                config.server_max_window_bits,
            ),
            Role::Server => (
                config.client_no_context_takeover,
                config.client_max_window_bits,
            ),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "Established decompressor for {role} with settings \
            no_context_takeover={no_context_takeover} max_window_bits={_window_bits:?}"
        );

        let max = self.max_message_size;
        Some(match _window_bits {
            #[cfg(feature = "zlib")]
            Some(bits) => Decompressor::new_with_window_bits(max, bits.max(9))
                .with_no_context_takeover(no_context_takeover),
            _ if no_context_takeover => Decompressor::no_context_takeover(max),
            _ => Decompressor::new(max),
        })
    }

    /// Builds the compressor for the messages `role` sends.
    pub(crate) fn compressor(&self, role: Role) -> Option<Compressor> {
        let config = self.compression.as_ref()?;

        let (no_context_takeover, _window_bits) = match role {
            Role::Client => (
                config.client_no_context_takeover,
                config.client_max_window_bits,
            ),
            Role::Server => (
                config.server_no_context_takeover,
                config.server_max_window_bits,
            ),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "Established compressor for {role} with settings \
            no_context_takeover={no_context_takeover} max_window_bits={_window_bits:?} level={}",
            config.level.level()
        );

        Some(match _window_bits {
            #[cfg(feature = "zlib")]
            Some(bits) => Compressor::new_with_window_bits(config.level, bits.max(9))
                .with_no_context_takeover(no_context_takeover),
            _ if no_context_takeover => Compressor::no_context_takeover(config.level),
            _ => Compressor::new(config.level),
        })
    }
}
