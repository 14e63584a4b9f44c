//! `/stream`: WebSocket side of the streaming transport.
//!
//! The first text frame must be `hello` (bearer token on the upgrade
//! request, or `?token=`) or `resume` (signed resumption token). After the
//! handshake, frames queued by the transport are written to the socket and
//! frames read from it are handed to [`StreamingTransport::handle_frame`].
//!
//! [`StreamingTransport::handle_frame`]: parley_wire::StreamingTransport::handle_frame

use crate::routes::{bearer_token, AppState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parley_types::error::ErrorBody;
use parley_wire::frame::MAX_FRAME_SIZE;
use parley_wire::{decode_frame, encode_frame, Attachment, StreamFrame, WireError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a client has to send its handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /stream
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = bearer_token(&headers).map(str::to_string).or(query.token);
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let transport = state.coordinator.transport.clone();

    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream)).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => {
            reject(&mut sink, e.to_body()).await;
            return;
        }
        Ok(None) => {
            debug!("Stream closed before handshake");
            return;
        }
        Err(_) => {
            let err = WireError::HandshakeFailed("handshake timed out".to_string());
            reject(&mut sink, err.to_body()).await;
            return;
        }
    };

    let Attachment {
        connection,
        epoch,
        mut outbound,
    } = match transport.open(token.as_deref(), first) {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!(error = %e, "Stream handshake rejected");
            reject(&mut sink, e.to_body()).await;
            return;
        }
    };

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let closing = matches!(frame, StreamFrame::Close { .. });
                if write_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
                if closing {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                    Ok(frame) => transport.handle_frame(&connection, frame).await,
                    Err(e) => {
                        connection.push_frame(StreamFrame::Error { error: e.to_body() });
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    transport.detach(&connection, epoch);
    info!(
        agent = %connection.key.agent_id,
        session = %connection.key.session_id,
        "Stream socket ended"
    );
}

/// Read until the first text frame.
async fn read_handshake(
    stream: &mut SplitStream<WebSocket>,
) -> Option<Result<StreamFrame, WireError>> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(decode_frame(text.as_str())),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &StreamFrame,
) -> Result<(), axum::Error> {
    let text = match encode_frame(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(frame = frame.name(), error = %e, "Failed to encode stream frame");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}

/// Send an error frame followed by a close.
async fn reject(sink: &mut SplitSink<WebSocket, Message>, error: ErrorBody) {
    let _ = write_frame(sink, &StreamFrame::Error { error }).await;
    let _ = sink.send(Message::Close(None)).await;
}
