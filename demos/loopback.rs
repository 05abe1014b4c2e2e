//! Runs a client and a server engine against each other over an in-memory transport.
//!
//! The client sends a fragmented greeting, a text and a binary message and a ping, answers the
//! server's ping with a delayed pong, sends a compressed message and finally closes the connection.
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use wsengine::{
    CloseCode, ConnectionPhase, Event, Message, MessageKind, Options, Role, WebSocketStream,
};

/// Echoes every message and pings the client once.
async fn server<S>(mut ws: WebSocketStream<S>) -> wsengine::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(event) = ws.next_event().await {
        match event {
            Event::Opened => ws.ping("Hello client! :]").await?,
            Event::MessageReceived(message) => {
                log::info!("server <- {:?}", message.as_str().unwrap_or("<binary>"));
                ws.send(message).await?;
            }
            Event::PingReceived(payload) => {
                log::info!("server <- PING: {}", String::from_utf8_lossy(&payload))
            }
            Event::PongReceived(payload) => {
                log::info!("server <- PONG: {}", String::from_utf8_lossy(&payload))
            }
            Event::Closed(close) => {
                log::info!("server CLOSE: {} - {}", close.code, close.reason);
            }
            Event::Errored(err) => log::error!("server ERROR: {err}"),
        }
    }

    Ok(())
}

async fn client(mut ws: WebSocketStream<DuplexStream>) -> anyhow::Result<()> {
    let mut echoes = 0;

    while let Some(event) = ws.next_event().await {
        match event {
            Event::Opened => {
                log::info!("CONNECTED!");

                ws.send_fragment(MessageKind::Text, "Hello", false).await?;
                ws.send_fragment(MessageKind::Text, " server ", false).await?;
                ws.send_fragment(MessageKind::Text, ":)", true).await?;

                ws.send(Message::text("Hello server!")).await?;
                ws.send(Message::binary("Hello !server")).await?;
                ws.send_fragmented(MessageKind::Text, "Hello server! #1 | #2 | #3", 8)
                    .await?;

                ws.ping("Hello Server! :]").await?;
            }
            Event::MessageReceived(message) => {
                log::info!("{}", String::from_utf8_lossy(&message.payload));

                echoes += 1;
                if echoes == 4 {
                    ws.close(CloseCode::Normal, "Bye :(").await?;
                }
            }
            Event::PingReceived(payload) => {
                log::info!("PING: {}", String::from_utf8_lossy(&payload));
                tokio::time::sleep(Duration::from_secs(1)).await;
                if ws.phase() == ConnectionPhase::Open {
                    ws.pong("Hi server! :]").await?;
                }
            }
            Event::PongReceived(payload) => {
                log::info!("PONG: {}", String::from_utf8_lossy(&payload));
            }
            Event::Closed(close) => {
                log::info!("CLOSE: {} - {} (clean: {})", close.code, close.reason, close.was_clean);
            }
            Event::Errored(err) => log::error!("ERROR: {err}"),
        }
    }

    Ok(())
}

async fn run(options: Options) -> anyhow::Result<()> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(server(WebSocketStream::new(
        server_io,
        Role::Server,
        options.clone(),
    )));
    client(WebSocketStream::new(client_io, Role::Client, options)).await?;
    server.await??;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    log::info!("--- plain ---");
    run(Options::default()).await?;

    log::info!("--- permessage-deflate, client_no_context_takeover ---");
    run(Options::default().client_no_context_takeover()).await?;

    Ok(())
}
