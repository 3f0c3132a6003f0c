//! Framebuffer proxy: bridges one WebSocket to one TCP upstream at byte
//! granularity. The framebuffer protocol itself is never interpreted.

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket, close_code},
    futures::{SinkExt, stream::StreamExt},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    },
    tracing::{debug, warn},
};

const READ_BUF_BYTES: usize = 16 * 1024;

/// What a WebSocket frame contributes to the byte stream.
enum Frame {
    /// Payload bytes to forward upstream (binary or text, coalesced).
    Data(Vec<u8>),
    /// Ping/pong, answered by the transport; nothing to forward.
    Control,
    /// Peer is closing.
    Close,
}

fn classify(message: Message) -> Frame {
    match message {
        Message::Binary(bytes) => Frame::Data(bytes.to_vec()),
        Message::Text(text) => Frame::Data(text.as_bytes().to_vec()),
        Message::Ping(_) | Message::Pong(_) => Frame::Control,
        Message::Close(_) => Frame::Close,
    }
}

/// Run one proxy session: connect upstream, pump bytes both ways, tear both
/// sides down when either reports close or error.
///
/// Teardown is reached exactly once per session regardless of how many
/// error/close events race in, and no write is attempted on the surviving
/// side after the loop observes a close.
pub async fn run_session(ws: WebSocket, upstream: &str) {
    let stream = match TcpStream::connect(upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(upstream, error = %e, "framebuffer upstream connect failed");
            close_with_error(ws, "upstream unavailable").await;
            return;
        },
    };
    debug!(upstream, "framebuffer session open");
    pump(ws, stream).await;
    debug!(upstream, "framebuffer session closed");
}

async fn close_with_error(mut ws: WebSocket, reason: &'static str) {
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: reason.into(),
        })))
        .await;
}

async fn pump(ws: WebSocket, tcp: TcpStream) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut tcp_rx, mut tcp_tx) = tcp.into_split();
    let mut buf = vec![0u8; READ_BUF_BYTES];

    loop {
        tokio::select! {
            read = tcp_rx.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx
                        .send(Message::Binary(buf[..n].to_vec().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                },
            },
            message = ws_rx.next() => match message {
                Some(Ok(message)) => match classify(message) {
                    Frame::Data(bytes) => {
                        if tcp_tx.write_all(&bytes).await.is_err() {
                            break;
                        }
                    },
                    Frame::Control => {},
                    Frame::Close => break,
                },
                Some(Err(_)) | None => break,
            },
        }
    }

    // Symmetric teardown. Both calls tolerate an already-dead peer.
    let _ = tcp_tx.shutdown().await;
    let _ = ws_tx.close().await;
}
