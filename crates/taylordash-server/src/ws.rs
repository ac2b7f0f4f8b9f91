//! WebSocket bridge between browser sandboxes and the event router.
//!
//! Each socket is one sandbox communication handle. The handshake's
//! `Origin` header is the transport origin of every message on the socket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, warn};

use taylordash_plugin::{EventRouter, HostMessage, QueueChannel, SandboxHandle};

use crate::AppState;

/// GET /plugins/events — attach a sandbox
pub async fn plugin_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Browsers always send Origin on WebSocket handshakes; absent means opaque.
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("null")
        .to_string();
    ws.on_upgrade(move |socket| serve_socket(socket, state, origin))
}

async fn serve_socket(socket: WebSocket, state: Arc<AppState>, origin: String) {
    let (sink, stream) = socket.split();
    bridge(
        sink,
        stream,
        Arc::clone(&state.router),
        origin,
        state.config.channel_capacity,
    )
    .await;
}

/// Pump one sandbox connection until its inbound stream ends.
///
/// Text frames go to the router tagged with `origin`; host messages for
/// this handle are encoded as JSON text frames on `sink`.
pub async fn bridge<Tx, Rx, E>(
    mut sink: Tx,
    mut stream: Rx,
    router: Arc<EventRouter>,
    origin: String,
    capacity: usize,
) where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let (channel, mut outbound) = QueueChannel::<HostMessage>::new(capacity);
    let handle: SandboxHandle = Arc::new(channel);
    debug!(origin = %origin, "sandbox socket opened");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode host message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                router.handle_incoming_message(text.as_str(), &origin, Arc::clone(&handle));
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(bytes)) => {
                debug!(origin = %origin, len = bytes.len(), "ignoring binary frame from sandbox");
            }
            // Ping/pong are answered by axum.
            Ok(_) => {}
            Err(e) => {
                debug!(origin = %origin, "sandbox socket error: {e}");
                break;
            }
        }
    }

    router.channel_closed(&handle);
    writer.abort();
    debug!(origin = %origin, "sandbox socket closed");
}
