use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use wsengine::{codec::Codec, frame::OpCode, Frame, ProtocolError, Role, MAX_PAYLOAD_READ};

#[tokio::test]
async fn test_frames_over_framed() -> anyhow::Result<()> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut client = Framed::new(client_io, Codec::new(Role::Client, MAX_PAYLOAD_READ));
    let mut server = Framed::new(server_io, Codec::new(Role::Server, MAX_PAYLOAD_READ));

    client.send(Frame::text("framed")).await?;
    client.send(Frame::binary(vec![0u8; 70_000])).await?;

    let frame = server.next().await.expect("text frame")?;
    assert_eq!(frame.opcode, OpCode::Text);
    assert_eq!(frame.payload, Bytes::from_static(b"framed"));

    let frame = server.next().await.expect("binary frame")?;
    assert_eq!(frame.payload.len(), 70_000);

    server.send(Frame::pong("pong")).await?;
    let frame = client.next().await.expect("pong frame")?;
    assert_eq!(frame.opcode, OpCode::Pong);

    Ok(())
}

#[tokio::test]
async fn test_framed_protocol_error() -> anyhow::Result<()> {
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let mut client = Framed::new(client_io, Codec::new(Role::Client, MAX_PAYLOAD_READ));

    // a masked frame from the server side
    server_io
        .write_all(&[0x81, 0x81, 0x01, 0x02, 0x03, 0x04, b'a' ^ 0x01])
        .await?;

    let err = client.next().await.expect("decoding error").unwrap_err();
    assert_eq!(err.as_protocol(), Some(&ProtocolError::UnexpectedMask));

    Ok(())
}
