//! permessage-deflate ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)) message transforms.
//!
//! Each direction of a connection owns its own deflate window: the [`Compressor`] for outgoing
//! messages and the [`Decompressor`] for incoming ones. With context takeover the window is kept
//! across messages, otherwise it is reset once a message is complete.
use std::io;

use bytes::Bytes;
use flate2::{CompressError, FlushCompress, FlushDecompress, Status};

use crate::{CompressionLevel, ProtocolError};

/// Tail of a sync flush. Senders strip it from the end of every message and receivers put it back.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Compresses outgoing message payloads.
pub struct Compressor {
    compress: flate2::Compress,
    /// Reset the window after every message.
    no_context_takeover: bool,
}

impl Compressor {
    /// Creates a compressor that keeps its window across messages.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
            no_context_takeover: false,
        }
    }

    /// Creates a compressor with a specific LZ77 window size, available when `zlib` is enabled.
    #[cfg(feature = "zlib")]
    pub fn new_with_window_bits(level: CompressionLevel, window_bits: u8) -> Self {
        Self {
            compress: flate2::Compress::new_with_window_bits(level, false, window_bits),
            no_context_takeover: false,
        }
    }

    /// Creates a compressor that resets its window after every message.
    pub fn no_context_takeover(level: CompressionLevel) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
            no_context_takeover: true,
        }
    }

    /// Switches the compressor to reset its window after every message.
    #[cfg(feature = "zlib")]
    pub(crate) fn with_no_context_takeover(mut self, no_context_takeover: bool) -> Self {
        self.no_context_takeover = no_context_takeover;
        self
    }

    /// Compresses `input` and flushes the output to a byte boundary.
    ///
    /// `fin` tells whether `input` ends the message. Only then is the trailing `00 00 ff ff`
    /// removed and the window reset (without context takeover), so that compressing a message in
    /// several chunks produces the same kind of payload a receiver would get from a single call.
    pub fn compress(&mut self, mut input: &[u8], fin: bool) -> io::Result<Bytes> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(1024));
            }

            let before_in = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut output, FlushCompress::Sync)
                .map_err(deflate_error)?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            input = &input[consumed..];

            // the flush is complete once zlib stops short of filling the buffer
            if input.is_empty() && output.len() < output.capacity() {
                break;
            }
        }

        if fin {
            if output.ends_with(&DEFLATE_TRAILER) {
                output.truncate(output.len() - DEFLATE_TRAILER.len());
            }
            if self.no_context_takeover {
                self.compress.reset();
            }
        }

        Ok(Bytes::from(output))
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Compression error: {}", err),
    )
}

/// Decompresses incoming message payloads.
pub struct Decompressor {
    decompress: flate2::Decompress,
    /// Reset the window after every message.
    no_context_takeover: bool,
    /// Upper bound of an inflated message.
    max_message_size: usize,
}

impl Decompressor {
    /// Creates a decompressor that keeps its window across messages.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
            no_context_takeover: false,
            max_message_size,
        }
    }

    /// Creates a decompressor with a specific LZ77 window size, available when `zlib` is enabled.
    #[cfg(feature = "zlib")]
    pub fn new_with_window_bits(max_message_size: usize, window_bits: u8) -> Self {
        Self {
            decompress: flate2::Decompress::new_with_window_bits(false, window_bits),
            no_context_takeover: false,
            max_message_size,
        }
    }

    /// Creates a decompressor that resets its window after every message.
    pub fn no_context_takeover(max_message_size: usize) -> Self {
        Self {
            no_context_takeover: true,
            ..Self::new(max_message_size)
        }
    }

    #[cfg(feature = "zlib")]
    pub(crate) fn with_no_context_takeover(mut self, no_context_takeover: bool) -> Self {
        self.no_context_takeover = no_context_takeover;
        self
    }

    /// Inflates the payload of a complete message.
    ///
    /// # Errors
    /// - [`ProtocolError::DecompressionFailed`] if the deflate stream is corrupt. The window is
    ///   unusable afterwards, so the connection has to be dropped.
    /// - [`ProtocolError::MessageTooBig`] if the output grows past the configured maximum.
    pub fn decompress(&mut self, input: &[u8]) -> Result<Bytes, ProtocolError> {
        let mut output = Vec::with_capacity((input.len() * 2).clamp(64, 64 * 1024));
        let mut stream_end = false;

        for mut segment in [input, &DEFLATE_TRAILER[..]] {
            while !stream_end {
                if output.len() == output.capacity() {
                    output.reserve(output.capacity().max(1024));
                }

                let before_in = self.decompress.total_in();
                let before_out = self.decompress.total_out();
                let status = self
                    .decompress
                    .decompress_vec(segment, &mut output, FlushDecompress::Sync)
                    .map_err(|_| ProtocolError::DecompressionFailed)?;
                let consumed = (self.decompress.total_in() - before_in) as usize;
                let produced = self.decompress.total_out() - before_out;
                segment = &segment[consumed..];

                if output.len() > self.max_message_size {
                    return Err(ProtocolError::MessageTooBig);
                }

                match status {
                    // the peer closed the deflate stream with a final block
                    Status::StreamEnd => stream_end = true,
                    _ if segment.is_empty() && output.len() < output.capacity() => break,
                    _ if consumed == 0 && produced == 0 => {
                        return Err(ProtocolError::DecompressionFailed)
                    }
                    _ => {}
                }
            }
        }

        if stream_end || self.no_context_takeover {
            self.decompress.reset(false);
        }

        Ok(Bytes::from(output))
    }
}
