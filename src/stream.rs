use std::io;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};

use crate::{
    close::CloseCode,
    connection::{Connection, ConnectionPhase, Event},
    fragment::{Message, MessageKind},
    Options, Result, Role,
};

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 8 * 1024;

/// Drives a [`Connection`] over an already-upgraded tokio transport.
///
/// Every call hands its frames to the engine and writes whatever the engine produced before
/// returning. Replies the engine sends on its own (pongs, close replies) are written while
/// [`WebSocketStream::next_event`] reads.
///
/// ```rust
/// use wsengine::{Event, Message, Options, Role, WebSocketStream};
///
/// # #[tokio::main]
/// # async fn main() -> wsengine::Result<()> {
/// let (client_io, server_io) = tokio::io::duplex(4096);
/// let mut client = WebSocketStream::new(client_io, Role::Client, Options::default());
/// let mut server = WebSocketStream::new(server_io, Role::Server, Options::default());
///
/// client.send(Message::text("Hello server!")).await?;
///
/// assert_eq!(server.next_event().await, Some(Event::Opened));
/// assert_eq!(
///     server.next_event().await,
///     Some(Event::MessageReceived(Message::text("Hello server!")))
/// );
/// # Ok(())
/// # }
/// ```
pub struct WebSocketStream<S> {
    io: S,
    conn: Connection,
    read_buf: BytesMut,
    /// When to give up on the peer's close reply, set once our close frame was sent.
    close_deadline: Option<Instant>,
}

impl<S> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `io`, on which the upgrade handshake is already complete, and opens the connection.
    pub fn new(io: S, role: Role, options: Options) -> Self {
        let mut conn = Connection::new(role, options);
        // a new connection is always connecting, so this cannot fail
        let _ = conn.open();

        Self {
            io,
            conn,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            close_deadline: None,
        }
    }

    /// The protocol engine.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.conn.phase()
    }

    /// Returns the transport.
    pub fn into_inner(self) -> S {
        self.io
    }

    /// Sends a complete message.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.conn.send(message)?;
        self.flush().await
    }

    /// Sends one chunk of a message, see [`Connection::send_fragment`].
    pub async fn send_fragment(
        &mut self,
        kind: MessageKind,
        chunk: impl Into<Bytes>,
        fin: bool,
    ) -> Result<()> {
        self.conn.send_fragment(kind, chunk, fin)?;
        self.flush().await
    }

    /// Sends a message as frames of at most `fragment_size` bytes.
    pub async fn send_fragmented(
        &mut self,
        kind: MessageKind,
        payload: impl Into<Bytes>,
        fragment_size: usize,
    ) -> Result<()> {
        self.conn.send_fragmented(kind, payload, fragment_size)?;
        self.flush().await
    }

    /// Serializes data to JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn send_json<T: serde::Serialize>(&mut self, data: &T) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        self.send(Message::text(bytes)).await
    }

    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.conn.ping(payload)?;
        self.flush().await
    }

    pub async fn pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.conn.pong(payload)?;
        self.flush().await
    }

    /// Starts the close handshake. Keep calling [`WebSocketStream::next_event`] to receive the
    /// peer's reply.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.conn.close(code, reason)?;
        self.flush().await
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once [`Event::Closed`] was returned. A transport that fails or reaches
    /// end of file closes the connection abnormally, and so does a peer that does not answer
    /// our close frame within [`Options::with_close_timeout`].
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.conn.poll_event() {
                if let Err(_err) = self.flush().await {
                    #[cfg(feature = "logging")]
                    log::debug!("{} failed to write: {}", self.conn.role(), _err);
                    self.conn.transport_closed();
                }

                if matches!(event, Event::Closed(_)) {
                    let shutdown = self.io.shutdown();
                    let _ = tokio::time::timeout(self.conn.close_timeout(), shutdown).await;
                }

                return Some(event);
            }

            if self.conn.is_closed() {
                return None;
            }

            if self.conn.phase() == ConnectionPhase::ClosingLocal && self.close_deadline.is_none() {
                self.close_deadline = Some(Instant::now() + self.conn.close_timeout());
            }

            self.read_buf.reserve(READ_CHUNK);
            let read = self.io.read_buf(&mut self.read_buf);
            let read = match self.close_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, read).await {
                    Ok(read) => read,
                    Err(_) => {
                        #[cfg(feature = "logging")]
                        log::debug!("{} peer did not answer the close frame", self.conn.role());
                        self.conn.transport_closed();
                        continue;
                    }
                },
                None => read.await,
            };

            match read {
                Ok(0) => {
                    #[cfg(feature = "logging")]
                    log::debug!("{} transport reached end of file", self.conn.role());
                    self.conn.transport_closed();
                }
                Ok(_) => {
                    self.conn.feed(&self.read_buf);
                    self.read_buf.clear();
                }
                Err(_err) => {
                    #[cfg(feature = "logging")]
                    log::debug!("{} failed to read: {}", self.conn.role(), _err);
                    self.conn.transport_closed();
                }
            }
        }
    }

    /// Turns the stream into a [`Stream`] of events, ending after [`Event::Closed`].
    pub fn into_stream(self) -> impl Stream<Item = Event> {
        futures::stream::unfold(self, |mut ws| async move {
            let event = ws.next_event().await?;
            Some((event, ws))
        })
    }

    /// Writes the engine's output.
    ///
    /// Once the close handshake has started the write is bounded by the close timeout, so a peer
    /// that stopped reading cannot hold the connection open.
    async fn flush(&mut self) -> Result<()> {
        if !self.conn.has_output() {
            return Ok(());
        }

        let output = self.conn.take_output();
        let bounded = self.conn.phase() != ConnectionPhase::Open;
        let close_timeout = self.conn.close_timeout();

        let transport = &mut self.io;
        let write = async move {
            transport.write_all(&output).await?;
            transport.flush().await
        };

        if bounded {
            tokio::time::timeout(close_timeout, write)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "close write timed out"))??;
        } else {
            write.await?;
        }

        Ok(())
    }
}
