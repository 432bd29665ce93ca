//! Data connections: the byte stream handed to `dial()` callers and the pump
//! that carries it over a WebSocket.
//!
//! Both ends of a data connection speak plain binary WebSocket frames. The
//! server wraps its end in a [`Connection`] backed by an in-memory pipe; the
//! agent splices its end straight into the local target with [`pump`].

use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the in-memory pipe behind a server-side [`Connection`].
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Largest payload put in a single binary frame.
const CHUNK_SIZE: usize = 32 * 1024;

/// How long to keep draining the peer after our side finished writing.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// What a frame means to the pump.
pub enum Frame {
    Data(Bytes),
    Close,
    /// Ping/pong and other frames with no payload for the stream.
    Control,
}

/// The subset of a WebSocket message type the pump needs. Implemented for
/// both the axum (server) and tungstenite (agent) message types.
pub trait WsFrame: Sized {
    fn binary(data: Bytes) -> Self;
    fn close() -> Self;
    fn into_frame(self) -> Frame;
}

impl WsFrame for axum::extract::ws::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn close() -> Self {
        Self::Close(Some(axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: "".into(),
        }))
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(data) => Frame::Data(data),
            Self::Text(text) => Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Self::Close(_) => Frame::Close,
            Self::Ping(_) | Self::Pong(_) => Frame::Control,
        }
    }
}

impl WsFrame for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn close() -> Self {
        Self::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
            reason: "".into(),
        }))
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(data) => Frame::Data(data),
            Self::Text(text) => Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Self::Close(_) => Frame::Close,
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Frame::Control,
        }
    }
}

/// Byte counts for one finished pump.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    /// Bytes received from the WebSocket and written to the byte stream.
    pub to_io: u64,
    /// Bytes read from the byte stream and sent over the WebSocket.
    pub from_io: u64,
}

/// Copy binary frames from `ws` into `io` and bytes from `io` into binary
/// frames until either side closes or `cancel` fires.
///
/// A close frame (or read error) from the peer ends both directions. EOF on
/// `io` sends a close frame, then keeps draining the peer for a short linger
/// so bytes already in flight still land.
pub async fn pump<S, M, E, IO>(ws: S, io: IO, cancel: CancellationToken) -> SpliceStats
where
    S: Stream<Item = Result<M, E>> + Sink<M>,
    M: WsFrame + Unpin,
    E: Display,
    IO: AsyncRead + AsyncWrite,
{
    let (mut sink, mut frames) = ws.split();
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut to_io = 0u64;
    let mut from_io = 0u64;

    {
        let inbound = async {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(msg) => match msg.into_frame() {
                        Frame::Data(data) => {
                            if writer.write_all(&data).await.is_err() {
                                break;
                            }
                            to_io += data.len() as u64;
                        }
                        Frame::Close => break,
                        Frame::Control => {}
                    },
                    Err(e) => {
                        debug!(error = %e, "data connection read failed");
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        };

        let outbound = async {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if sink
                            .send(M::binary(Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        from_io += n as u64;
                    }
                    Err(e) => {
                        debug!(error = %e, "data connection source read failed");
                        break;
                    }
                }
            }
            let _ = sink.send(M::close()).await;
        };

        tokio::pin!(inbound, outbound);
        tokio::select! {
            () = &mut inbound => {}
            () = &mut outbound => {
                tokio::select! {
                    _ = tokio::time::timeout(CLOSE_LINGER, &mut inbound) => {}
                    () = cancel.cancelled() => {}
                }
            }
            () = cancel.cancelled() => {}
        }
    }

    let _ = sink.close().await;
    SpliceStats { to_io, from_io }
}

/// A logical byte stream to one agent's local target.
///
/// Owned exclusively by the caller of `dial()`. Dropping it (or shutting down
/// its write half) closes only this stream, never the agent's control
/// connection.
#[derive(Debug)]
pub struct Connection {
    key: String,
    id: String,
    io: DuplexStream,
}

impl Connection {
    /// Wrap one end of an in-memory pipe.
    pub fn from_duplex(key: impl Into<String>, id: impl Into<String>, io: DuplexStream) -> Self {
        Self {
            key: key.into(),
            id: id.into(),
            io,
        }
    }

    /// Wrap an accepted pickup WebSocket. Spawns the pump that feeds the pipe.
    pub fn from_ws(key: String, id: String, socket: axum::extract::ws::WebSocket) -> Self {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let log_key = key.clone();
        let log_id = id.clone();
        tokio::spawn(async move {
            let stats = pump(socket, far, CancellationToken::new()).await;
            debug!(
                key = %log_key,
                id = %log_id,
                bytes_in = stats.to_io,
                bytes_out = stats.from_io,
                "Data connection closed"
            );
        });
        Self::from_duplex(key, id, near)
    }

    /// Agent key this stream leads to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Correlation ID the stream was matched on.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
