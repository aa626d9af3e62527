//! Voice over WebSocket.
//!
//! Client → server: binary frames are 16-bit little-endian PCM, text frames
//! are JSON control events (`{"type":"activate"}`, `{"type":"stop"}`, ...).
//! Server → client: JSON [`VoiceOutput`] text frames, binary frames with
//! synthesized audio, and `{"type":"stop_playback"}` when a reply is cut off.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wayfarer_core::{AudioFrame, AudioSink, VoiceEvent, VoiceOutput};
use wayfarer_gateway::{GatewayError, VoiceSession};
use wayfarer_schema::AuthLevel;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VoiceQuery {
    #[serde(default)]
    pub level: AuthLevel,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/{user_id}", get(voice_socket))
}

/// Sends synthesized audio down the socket. The client plays it; we wait
/// out the clip length so `Speaking` lasts as long as the audio does.
struct SocketSink {
    out: mpsc::UnboundedSender<Message>,
    sample_rate: u32,
}

#[async_trait]
impl AudioSink for SocketSink {
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<()> {
        let samples = audio.len() / 2;
        let clip = Duration::from_secs_f64(samples as f64 / self.sample_rate.max(1) as f64);
        self.out
            .send(Message::Binary(audio.into()))
            .map_err(|_| anyhow::anyhow!("voice socket closed"))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                let stop = serde_json::json!({ "type": "stop_playback" }).to_string();
                let _ = self.out.send(Message::Text(stop.into()));
            }
            _ = tokio::time::sleep(clip) => {}
        }
        Ok(())
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::VoiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::VoiceBusy(_) => StatusCode::CONFLICT,
        GatewayError::MissingUser | GatewayError::EmptyMessage => StatusCode::BAD_REQUEST,
    }
}

async fn voice_socket(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<VoiceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let sink = Arc::new(SocketSink {
        out: out_tx.clone(),
        sample_rate: state.gateway.voice_sample_rate().unwrap_or(16_000),
    });

    let session = match state.gateway.open_voice(&user_id, query.level, sink) {
        Ok(session) => session,
        Err(e) => return (status_for(&e), e.to_string()).into_response(),
    };

    // The session's lease frees the user's slot if the upgrade never completes.
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, session, out_tx, out_rx))
}

async fn handle_socket(
    socket: WebSocket,
    user_id: String,
    session: VoiceSession,
    out_tx: mpsc::UnboundedSender<Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let VoiceSession {
        handle,
        mut outputs,
        lease,
    } = session;

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let forward_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(output) = outputs.recv().await {
            match serde_json::to_string(&output) {
                Ok(json) => {
                    if forward_tx.send(Message::Text(json.into())).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!("unserializable voice output: {e}"),
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(user_id = %user_id, "voice websocket receive error: {err}");
                break;
            }
        };

        let event = match message {
            Message::Binary(data) => VoiceEvent::Audio(AudioFrame::from_le_bytes(&data)),
            Message::Text(text) => match serde_json::from_str::<VoiceEvent>(text.as_str()) {
                Ok(event) => event,
                Err(e) => {
                    let cue = VoiceOutput::ErrorCue {
                        message: format!("invalid control frame: {e}"),
                    };
                    if let Ok(json) = serde_json::to_string(&cue) {
                        let _ = out_tx.send(Message::Text(json.into()));
                    }
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(payload) => {
                let _ = out_tx.send(Message::Pong(payload));
                continue;
            }
            Message::Pong(_) => continue,
        };

        if handle.send(event).await.is_err() {
            break;
        }
    }

    drop(lease);
    drop(handle);
    let _ = forwarder.await;
    drop(out_tx);
    let _ = writer.await;
}
