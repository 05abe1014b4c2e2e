//! # Connection
//!
//! The sans-io protocol engine. A [`Connection`] owns everything a WebSocket endpoint needs once
//! the HTTP upgrade is done: the frame codec, the fragmentation state of both directions, the
//! permessage-deflate windows and the close handshake. It performs no I/O.
//!
//! ```text
//!             open()              close() / close received
//! Connecting -------> Open ------------------------------------> ClosingLocal / ClosingRemote
//!                       |                                                   |
//!                       | protocol error, transport_closed()                | close reply
//!                       +-----------------------> Closed <------------------+
//! ```
//!
//! Bytes read from the transport go in through [`Connection::feed`] and come out as [`Event`]s
//! from [`Connection::poll_event`]. Every frame the engine produces, whether requested by the
//! caller or sent on its own (pongs, close replies), is appended in order to a single outgoing
//! buffer drained with [`Connection::take_output`].
use std::{collections::VecDeque, time::Duration};

use bytes::{Bytes, BytesMut};

use crate::{
    close::{CloseCode, CloseInfo},
    codec,
    compression::{Compressor, Decompressor},
    fragment::{self, Assembled, Assembler, Fragmenter, Message, MessageKind},
    frame::{Frame, OpCode},
    ConnectionError, Options, ProtocolError, Result, Role,
};

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Created, waiting for [`Connection::open`].
    Connecting,
    /// Messages flow in both directions.
    Open,
    /// A close frame was sent, waiting for the peer's reply.
    ClosingLocal,
    /// A close frame was received and the reply is being sent.
    ClosingRemote,
    /// Nothing more is sent or received.
    Closed,
}

/// Why and how a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: CloseCode,
    pub reason: String,
    /// `true` when both close frames were exchanged.
    pub was_clean: bool,
}

impl CloseEvent {
    /// End of a completed handshake, described by the peer's close frame.
    fn clean(peer: Option<CloseInfo>) -> Self {
        match peer {
            Some(info) => Self {
                code: info.code,
                reason: info.reason,
                was_clean: true,
            },
            // the peer did not give a status code
            None => Self {
                code: CloseCode::Status,
                reason: String::new(),
                was_clean: true,
            },
        }
    }
}

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened,
    MessageReceived(Message),
    /// The pong reply has already been queued.
    PingReceived(Bytes),
    PongReceived(Bytes),
    Closed(CloseEvent),
    /// A protocol violation. Always followed by [`Event::Closed`].
    Errored(ProtocolError),
}

/// A WebSocket endpoint without I/O.
///
/// ```rust
/// use wsengine::{CloseCode, Connection, Event, Options, Role};
///
/// # fn main() -> wsengine::Result<()> {
/// let mut client = Connection::new(Role::Client, Options::default());
/// let mut server = Connection::new(Role::Server, Options::default());
/// client.open()?;
/// server.open()?;
///
/// client.close(CloseCode::Normal, "done")?;
/// let events = server.receive(&client.take_output());
/// assert!(matches!(&events[..], [Event::Opened, Event::Closed(close)] if close.was_clean));
///
/// // the server replied on its own
/// let events = client.receive(&server.take_output());
/// assert!(matches!(&events[..], [Event::Opened, Event::Closed(_)]));
/// assert!(client.is_closed());
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    role: Role,
    phase: ConnectionPhase,
    decoder: codec::Decoder,
    encoder: codec::Encoder,
    assembler: Assembler,
    fragmenter: Fragmenter,
    compressor: Option<Compressor>,
    decompressor: Option<Decompressor>,
    /// Received bytes not yet decoded.
    read_buf: BytesMut,
    /// Encoded frames waiting for [`Connection::take_output`].
    write_buf: BytesMut,
    events: VecDeque<Event>,
    /// A close frame was written to `write_buf`.
    close_sent: bool,
    /// Close frame received while open, reported once the reply is sent.
    peer_close: Option<CloseInfo>,
    close_timeout: Duration,
}

impl Connection {
    /// Creates a connection for `role`, in [`ConnectionPhase::Connecting`].
    pub fn new(role: Role, options: Options) -> Self {
        let negotiation = options.negotiate();

        Self {
            role,
            phase: ConnectionPhase::Connecting,
            decoder: codec::Decoder::new(role, negotiation.max_payload_read),
            encoder: codec::Encoder::new(role),
            assembler: Assembler::new(negotiation.max_message_size),
            fragmenter: Fragmenter::new(),
            compressor: negotiation.compressor(role),
            decompressor: negotiation.decompressor(role),
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::new(),
            events: VecDeque::new(),
            close_sent: false,
            peer_close: None,
            close_timeout: negotiation.close_timeout,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// Returns `true` if permessage-deflate is in use.
    pub fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    /// Bound on the best-effort close write, see [`Options::with_close_timeout`].
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Marks the upgrade as complete and queues [`Event::Opened`].
    pub fn open(&mut self) -> Result<()> {
        if self.phase != ConnectionPhase::Connecting {
            return Err(ConnectionError::AlreadyOpened.into());
        }

        self.set_phase(ConnectionPhase::Open);
        self.events.push_back(Event::Opened);

        Ok(())
    }

    /// Sends a complete message in a single frame.
    ///
    /// # Errors
    /// - [`ConnectionError::NotOpen`] outside of [`ConnectionPhase::Open`].
    /// - [`ProtocolError::InterleavedSend`] while a [`Connection::send_fragment`] message is
    ///   incomplete. Nothing is written.
    pub fn send(&mut self, message: Message) -> Result<()> {
        self.ensure_open()?;
        self.fragmenter.check_whole()?;

        let (payload, compressed) = self.compress(&message.payload, true)?;
        self.write_frame(Frame::new(true, message.kind.into(), payload).with_rsv1(compressed))?;

        Ok(())
    }

    /// Sends one chunk of a message whose boundaries are chosen by the caller.
    ///
    /// The first chunk carries the message kind, the following ones are sent as continuation
    /// frames, and `fin` marks the last one. Pings, pongs and close may be sent between chunks,
    /// a different message may not.
    pub fn send_fragment(
        &mut self,
        kind: MessageKind,
        chunk: impl Into<Bytes>,
        fin: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let opcode = self.fragmenter.opcode_for(kind)?;

        let chunk = chunk.into();
        let (payload, compressed) = self.compress(&chunk, fin)?;
        // only the first frame of a compressed message carries RSV1
        let rsv1 = compressed && opcode != OpCode::Continuation;
        self.write_frame(Frame::new(fin, opcode, payload).with_rsv1(rsv1))?;
        self.fragmenter.record(kind, fin);

        Ok(())
    }

    /// Sends a complete message split into frames of at most `fragment_size` bytes.
    ///
    /// With permessage-deflate the message is compressed first and the compressed payload is
    /// what gets split.
    pub fn send_fragmented(
        &mut self,
        kind: MessageKind,
        payload: impl Into<Bytes>,
        fragment_size: usize,
    ) -> Result<()> {
        self.ensure_open()?;
        self.fragmenter.check_whole()?;

        let payload = payload.into();
        let (payload, compressed) = self.compress(&payload, true)?;

        let chunks = fragment::split(payload, fragment_size);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let frame = if i == 0 {
                Frame::new(i == last, kind.into(), chunk).with_rsv1(compressed)
            } else {
                Frame::new(i == last, OpCode::Continuation, chunk)
            };
            self.write_frame(frame)?;
        }

        Ok(())
    }

    /// Sends a ping. The payload is limited to 125 bytes.
    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        self.write_frame(Frame::ping(payload))?;
        Ok(())
    }

    /// Sends an unsolicited pong. The payload is limited to 125 bytes.
    pub fn pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        self.write_frame(Frame::pong(payload))?;
        Ok(())
    }

    /// Starts the close handshake.
    ///
    /// # Errors
    /// - [`ProtocolError::ControlPayloadTooLarge`] if `reason` is longer than 123 bytes.
    /// - [`ProtocolError::InvalidCloseCode`] for codes that must not be sent, such as 1005 or 1006.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        match self.phase {
            ConnectionPhase::Open | ConnectionPhase::ClosingRemote => {}
            ConnectionPhase::Closed => return Err(ConnectionError::ConnectionClosed.into()),
            ConnectionPhase::Connecting | ConnectionPhase::ClosingLocal => {
                return Err(ConnectionError::NotOpen.into())
            }
        }

        self.send_close(CloseInfo::new(code, reason))?;
        Ok(())
    }

    /// Reports that the transport is gone. The connection closes abnormally without writing.
    pub fn transport_closed(&mut self) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }

        self.finish(CloseEvent {
            code: CloseCode::Abnormal,
            reason: String::new(),
            was_clean: false,
        });
    }

    /// Appends bytes read from the transport.
    ///
    /// Input is ignored while connecting and once closed.
    pub fn feed(&mut self, bytes: &[u8]) {
        match self.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Closed => {
                #[cfg(feature = "logging")]
                log::debug!(
                    "{} ignoring {} bytes while {:?}",
                    self.role,
                    bytes.len(),
                    self.phase
                );
            }
            _ => self.read_buf.extend_from_slice(bytes),
        }
    }

    /// Returns the next event, decoding buffered input as needed.
    ///
    /// `None` means more input is required (or the connection is closed and every event was
    /// returned).
    pub fn poll_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }

            if !self.is_receiving() {
                return None;
            }

            match self.decoder.decode_frame(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    if let Err(err) = self.on_frame(frame) {
                        self.fail(err);
                    }
                }
                Ok(None) => return None,
                Err(err) => self.fail(err),
            }
        }
    }

    /// Feeds `bytes` and returns every event that became available.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<Event> {
        self.feed(bytes);
        std::iter::from_fn(|| self.poll_event()).collect()
    }

    /// Returns `true` if frames are waiting to be written.
    pub fn has_output(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Drains the bytes that must be written to the transport, in order.
    pub fn take_output(&mut self) -> Bytes {
        self.write_buf.split().freeze()
    }

    fn is_receiving(&self) -> bool {
        matches!(
            self.phase,
            ConnectionPhase::Open | ConnectionPhase::ClosingLocal | ConnectionPhase::ClosingRemote
        )
    }

    fn ensure_open(&self) -> Result<()> {
        match self.phase {
            ConnectionPhase::Open => Ok(()),
            ConnectionPhase::Closed => Err(ConnectionError::ConnectionClosed.into()),
            _ => Err(ConnectionError::NotOpen.into()),
        }
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        #[cfg(feature = "logging")]
        log::debug!("{} {:?} -> {:?}", self.role, self.phase, phase);

        self.phase = phase;
    }

    fn compress(&mut self, payload: &Bytes, fin: bool) -> Result<(Bytes, bool)> {
        match self.compressor.as_mut() {
            Some(compressor) => Ok((compressor.compress(payload, fin)?, true)),
            None => Ok((payload.clone(), false)),
        }
    }

    fn write_frame(&mut self, frame: Frame) -> std::result::Result<(), ProtocolError> {
        self.encoder.encode_frame(frame, &mut self.write_buf)
    }

    fn send_close(&mut self, info: CloseInfo) -> std::result::Result<(), ProtocolError> {
        let payload = info.to_payload()?;
        self.write_frame(Frame::close_raw(payload))?;
        self.close_sent = true;

        if self.phase == ConnectionPhase::ClosingRemote {
            let peer = self.peer_close.take();
            self.finish(CloseEvent::clean(peer));
        } else {
            self.set_phase(ConnectionPhase::ClosingLocal);
        }

        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> std::result::Result<(), ProtocolError> {
        if frame.rsv1 && self.decompressor.is_none() {
            return Err(ProtocolError::CompressionNotSupported);
        }

        match self.assembler.on_frame(frame)? {
            None => Ok(()),
            Some(Assembled::Control(frame)) => self.on_control(frame),
            Some(Assembled::Message {
                message,
                compressed,
            }) => self.on_message(message, compressed),
        }
    }

    fn on_message(
        &mut self,
        message: Message,
        compressed: bool,
    ) -> std::result::Result<(), ProtocolError> {
        let payload = if compressed {
            self.decompressor
                .as_mut()
                .ok_or(ProtocolError::CompressionNotSupported)?
                .decompress(&message.payload)?
        } else {
            message.payload
        };

        if message.kind == MessageKind::Text && !fragment::is_utf8(&payload) {
            return Err(ProtocolError::InvalidUtf8);
        }

        self.events
            .push_back(Event::MessageReceived(Message::new(message.kind, payload)));

        Ok(())
    }

    fn on_control(&mut self, frame: Frame) -> std::result::Result<(), ProtocolError> {
        match frame.opcode {
            OpCode::Ping => {
                if self.phase == ConnectionPhase::Open {
                    self.write_frame(Frame::pong(frame.payload.clone()))?;
                }
                self.events.push_back(Event::PingReceived(frame.payload));
            }
            OpCode::Pong => self.events.push_back(Event::PongReceived(frame.payload)),
            OpCode::Close => self.on_close(frame)?,
            // the assembler keeps data frames
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {}
        }

        Ok(())
    }

    fn on_close(&mut self, frame: Frame) -> std::result::Result<(), ProtocolError> {
        let info = CloseInfo::parse(&frame.payload)?;

        #[cfg(feature = "logging")]
        log::debug!("{} received close {:?} while {:?}", self.role, info, self.phase);

        match self.phase {
            ConnectionPhase::Open => {
                self.set_phase(ConnectionPhase::ClosingRemote);
                let code = info.as_ref().map_or(CloseCode::Normal, |info| info.code);
                self.peer_close = info;
                self.send_close(CloseInfo::new(code, ""))?;
            }
            ConnectionPhase::ClosingLocal => self.finish(CloseEvent::clean(info)),
            _ => {}
        }

        Ok(())
    }

    /// Aborts the connection after a protocol violation.
    fn fail(&mut self, err: ProtocolError) {
        #[cfg(feature = "logging")]
        log::debug!("{} protocol error: {}", self.role, err);

        let code = err.close_code();
        let reason = err.to_string();

        if !self.close_sent {
            match self.write_frame(Frame::close(code, &reason)) {
                Ok(()) => self.close_sent = true,
                Err(_err) => {
                    #[cfg(feature = "logging")]
                    log::debug!("{} could not write close frame: {}", self.role, _err);
                }
            }
        }

        self.events.push_back(Event::Errored(err));
        self.finish(CloseEvent {
            code,
            reason,
            was_clean: false,
        });
    }

    fn finish(&mut self, event: CloseEvent) {
        self.set_phase(ConnectionPhase::Closed);
        self.read_buf.clear();
        self.assembler.reset();
        self.fragmenter.reset();
        self.peer_close = None;
        self.events.push_back(Event::Closed(event));
    }
}
