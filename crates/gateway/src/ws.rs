//! Main WebSocket server: the long-lived connection surface behind every
//! upgrade the framebuffer and canvas paths do not claim.
//!
//! Authorization happens at upgrade time; by the time a socket reaches
//! [`handle_connection`] it is authenticated, so its registry entry is what
//! the machine-scoped sibling fallback consults. The entry lives exactly as
//! long as the connection.

use std::{net::IpAddr, sync::Arc, time::Instant};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    serde_json::json,
    tokio::sync::mpsc,
    tracing::{debug, info},
};

use crate::state::{ConnectedClient, GatewayState};

/// Handle a single authenticated WebSocket connection through its full
/// lifecycle: register → message loop → deregister.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, client_ip: IpAddr) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, client_ip = %client_ip, "ws: connection open");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    // Write loop: forwards frames from the registry sender to the socket.
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    let hello = json!({ "event": "hello", "version": state.version }).to_string();
    let _ = client_tx.send(hello);

    state
        .register_client(ConnectedClient {
            conn_id: conn_id.clone(),
            client_ip,
            sender: client_tx,
            connected_at: Instant::now(),
        })
        .await;

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => {
                if let Some(reply) = handle_frame(&text) {
                    let clients = state.clients.read().await;
                    if let Some(client) = clients.get(&conn_id) {
                        client.send(&reply);
                    }
                }
            },
            Message::Close(_) => break,
            // Binary frames carry nothing on the main surface; ping/pong is
            // answered by the transport.
            _ => {},
        }
    }

    state.remove_client(&conn_id).await;
    write_handle.abort();
    info!(conn_id = %conn_id, "ws: connection closed");
}

/// Answer a client frame, if it warrants one.
fn handle_frame(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value.get("method").and_then(|m| m.as_str()) {
        Some("ping") => Some(json!({ "event": "pong" }).to_string()),
        _ => None,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_gets_pong() {
        let reply = handle_frame(r#"{"method":"ping"}"#).unwrap();
        assert_eq!(reply, r#"{"event":"pong"}"#);
    }

    #[test]
    fn unknown_frames_get_nothing() {
        assert!(handle_frame(r#"{"method":"nope"}"#).is_none());
        assert!(handle_frame("not json").is_none());
        assert!(handle_frame(r#"{"no_method":1}"#).is_none());
    }
}
