//! Websocket adapter: bridges one socket to one `ConnectionSession`.
//!
//! The socket is split; a writer task owns the sink and drains the
//! session's `FrameSender`, while the session reads the stream half.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{BoxStream, SplitStream};
use futures_util::{SinkExt, StreamExt};

use crate::provider::ChatStreamProvider;
use crate::session::{ConnectionSession, FrameSender, OUTBOUND_CAPACITY};

use super::AppState;

const TRACING_TARGET: &str = "chatrelay_core::server::ws";

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.chat, state.deadline))
}

async fn handle_socket(socket: WebSocket, provider: Arc<dyn ChatStreamProvider>, deadline: Duration) {
    let (mut sink, stream) = socket.split();
    let (out, mut frames) = FrameSender::channel(OUTBOUND_CAPACITY);
    let session = ConnectionSession::new(provider, deadline);
    let session_id = session.id();

    let writer = tokio::spawn(async move {
        let mut sent = 0usize;
        while let Some(frame) = frames.recv().await {
            if sink
                .send(Message::Text(Utf8Bytes::from(frame.to_json())))
                .await
                .is_err()
            {
                tracing::debug!(
                    target: TRACING_TARGET,
                    session_id = %session_id,
                    "failed to send frame, client disconnected"
                );
                break;
            }
            sent += 1;
        }
        let _ = sink.close().await;
        sent
    });

    session.run(client_messages(stream), out).await;

    // The session dropped its sender; the writer flushes what is queued and exits.
    match writer.await {
        Ok(sent) => tracing::debug!(target: TRACING_TARGET, session_id = %session_id, frames_sent = sent, "writer finished"),
        Err(e) => tracing::error!(target: TRACING_TARGET, session_id = %session_id, error = %e, "writer task panicked"),
    }
}

/// Client payloads as strings, ending at close or the first transport error.
fn client_messages(stream: SplitStream<WebSocket>) -> BoxStream<'static, String> {
    stream
        .take_while(|msg| ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                Ok(Message::Binary(data)) => Some(String::from_utf8_lossy(&data).into_owned()),
                // ping/pong are answered by the transport
                _ => None,
            })
        })
        .boxed()
}
