//! WebSocket transport for companion devices
//!
//! Devices stream microphone audio in and receive synthesized speech out.
//! Audio arrives either as binary frames (8-byte big-endian sequence number
//! followed by 16-bit little-endian PCM) or as JSON `audio` messages with
//! base64 PCM.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::ApiState;
use crate::pipeline::{ConversationState, OutputFrame, SessionHandle, TurnId};
use crate::voice::{AudioChunk, pcm_from_le_bytes};
use crate::{Error, Result};

/// Length of the sequence-number prefix on binary audio frames
const SEQ_PREFIX: usize = 8;

/// Incoming WebSocket message from a device
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// One chunk of microphone audio
    Audio {
        seq: u64,
        /// Base64 16-bit little-endian PCM
        audio: String,
    },
    /// Abandon the current turn and clear queued work
    Reset,
    /// Ping to keep connection alive
    Ping,
}

/// Outgoing WebSocket message to a device
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    /// Connection established
    Connected { session_id: String },
    /// Synthesized speech for one sentence
    AudioSegment {
        turn_id: TurnId,
        sentence_index: usize,
        text: String,
        /// Base64 audio as returned by the synthesizer
        audio: String,
    },
    /// No more audio for this turn
    EndOfTurn {
        turn_id: TurnId,
        segments: usize,
        skipped: usize,
    },
    /// Text shown when speech could not be produced
    Cue { turn_id: TurnId, text: String },
    /// Conversation state changed
    State {
        state: ConversationState,
        turn_id: Option<TurnId>,
    },
    /// Error occurred
    Error { code: String, message: String },
    /// Pong response
    Pong,
}

impl From<OutputFrame> for WsOutgoing {
    fn from(frame: OutputFrame) -> Self {
        match frame {
            OutputFrame::Segment {
                turn_id,
                sentence_index,
                text,
                audio,
            } => Self::AudioSegment {
                turn_id,
                sentence_index,
                text,
                audio: STANDARD.encode(audio),
            },
            OutputFrame::EndOfTurn {
                turn_id,
                segments,
                skipped,
            } => Self::EndOfTurn {
                turn_id,
                segments,
                skipped,
            },
            OutputFrame::Cue { turn_id, text } => Self::Cue { turn_id, text },
            OutputFrame::State { state, turn_id } => Self::State { state, turn_id },
        }
    }
}

impl WsOutgoing {
    fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Decode a binary audio frame
///
/// # Errors
///
/// Returns `Error::Audio` if the frame is too short or the PCM is not
/// whole samples
pub fn decode_binary(bytes: &[u8]) -> Result<AudioChunk> {
    if bytes.len() < SEQ_PREFIX {
        return Err(Error::Audio(format!(
            "frame of {} bytes has no sequence number",
            bytes.len()
        )));
    }
    let (prefix, pcm) = bytes.split_at(SEQ_PREFIX);
    if pcm.len() % 2 != 0 {
        return Err(Error::Audio("odd number of PCM bytes".to_string()));
    }

    let mut seq = [0u8; SEQ_PREFIX];
    seq.copy_from_slice(prefix);
    Ok(AudioChunk::new(u64::from_be_bytes(seq), pcm_from_le_bytes(pcm)))
}

/// Decode a base64 audio message
///
/// # Errors
///
/// Returns `Error::Audio` if the payload is not valid base64 PCM
pub fn decode_base64(seq: u64, audio: &str) -> Result<AudioChunk> {
    let pcm = STANDARD
        .decode(audio)
        .map_err(|e| Error::Audio(format!("invalid base64 audio: {e}")))?;
    if pcm.len() % 2 != 0 {
        return Err(Error::Audio("odd number of PCM bytes".to_string()));
    }
    Ok(AudioChunk::new(seq, pcm_from_le_bytes(&pcm)))
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{device_id}", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, device_id))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, device_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, replaced) = state.connections.register(&device_id).await;
    let mut session = state.coordinator.spawn(&device_id);
    let Some(mut frames) = session.take_output() else {
        session.shutdown().await;
        state.connections.release(&device_id, conn_id).await;
        return;
    };

    tracing::info!(device_id = %device_id, "device connected");

    // Create channel for sending messages back to the device
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(32);
    let _ = tx
        .send(WsOutgoing::Connected {
            session_id: device_id.clone(),
        })
        .await;

    // Forward pipeline output into the outgoing channel
    let forward_tx = tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if forward_tx.send(WsOutgoing::from(frame)).await.is_err() {
                break;
            }
        }
    });

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            () = replaced.cancelled() => {
                tracing::info!(device_id = %device_id, "connection replaced");
                break;
            }
            _ = &mut send_task => break,
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };
                let handled = match msg {
                    Message::Binary(bytes) => match decode_binary(&bytes) {
                        Ok(chunk) => session.send_audio(chunk).await,
                        Err(e) => {
                            reject(&tx, &e).await;
                            Ok(())
                        }
                    },
                    Message::Text(text) => handle_text(&text, &mut session, &tx).await,
                    Message::Close(_) => break,
                    _ => Ok(()),
                };
                if let Err(e) = handled {
                    tracing::warn!(device_id = %device_id, error = %e, "session stopped accepting input");
                    break;
                }
            }
        }
    }

    session.shutdown().await;
    forward_task.abort();
    send_task.abort();
    state.connections.release(&device_id, conn_id).await;

    tracing::info!(device_id = %device_id, "device disconnected");
}

/// Handle one JSON message; errors end the connection
async fn handle_text(
    text: &str,
    session: &mut SessionHandle,
    tx: &mpsc::Sender<WsOutgoing>,
) -> Result<()> {
    let incoming = match serde_json::from_str::<WsIncoming>(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            let _ = tx
                .send(WsOutgoing::error("invalid_message", e.to_string()))
                .await;
            return Ok(());
        }
    };

    match incoming {
        WsIncoming::Audio { seq, audio } => match decode_base64(seq, &audio) {
            Ok(chunk) => session.send_audio(chunk).await,
            Err(e) => {
                reject(tx, &e).await;
                Ok(())
            }
        },
        WsIncoming::Reset => session.reset().await,
        WsIncoming::Ping => {
            let _ = tx.send(WsOutgoing::Pong).await;
            Ok(())
        }
    }
}

/// Report a malformed audio frame without ending the connection
async fn reject(tx: &mpsc::Sender<WsOutgoing>, error: &Error) {
    tracing::debug!(error = %error, "rejected audio frame");
    let _ = tx.send(WsOutgoing::error("invalid_audio", error.to_string())).await;
}
