//! Generation coordinator.
//!
//! Orchestrates one `generate` request against the active provider:
//! validates preconditions before acknowledging, snapshots the provider
//! handle, then runs the provider call in a spawned task so the session
//! loop keeps accepting messages (and interrupts stay deliverable).
//!
//! Exactly one terminal reply is emitted per request: the spawned task is
//! the only writer of `generate_done`/`generate_stream_done` for its id,
//! and the provider contract resolves each call exactly once.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::core::tts::{ChunkSink, GenError, GenParams, StreamChunk, TextToSpeech};
use crate::state::AppState;

use super::messages::{encode_audio_frame, MessageRoute, OutgoingMessage};

/// Handle a `generate` request, synchronous or streaming.
///
/// Requests against an empty provider slot and requests with empty input
/// are rejected before any acknowledgement: logged, no reply, connection
/// kept open.
pub async fn handle_generate(
    request_id: String,
    input: String,
    params: GenParams,
    stream: bool,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    info!("received generate message");

    // Stable handle snapshot: a concurrent load cannot redirect this call.
    let provider = match &*app_state.provider.read().await {
        Some(active) => active.tts.clone(),
        None => {
            error!("failed to generate, no provider is currently loaded");
            return true;
        }
    };

    if input.is_empty() {
        error!("field \"input\" of a generate message must be a non-empty string");
        return true;
    }

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::GenerateAck {
            unique_request_id: request_id.clone(),
        }))
        .await;

    let message_tx = message_tx.clone();
    tokio::spawn(async move {
        if stream {
            run_stream_generation(provider, request_id, input, params, message_tx).await;
        } else {
            run_sync_generation(provider, request_id, input, params, message_tx).await;
        }
    });

    true
}

async fn run_sync_generation(
    provider: Arc<dyn TextToSpeech>,
    request_id: String,
    input: String,
    params: GenParams,
    message_tx: mpsc::Sender<MessageRoute>,
) {
    let (error, response) = match provider.generate(&input, &params).await {
        Ok(audio) => (GenError::Success, Some(audio)),
        Err(error) => (error, None),
    };

    if error.is_error() {
        error!("error during generation: {error}");
    }

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::GenerateDone {
            unique_request_id: request_id,
            is_error: error.is_error(),
            error,
            response,
        }))
        .await;
}

async fn run_stream_generation(
    provider: Arc<dyn TextToSpeech>,
    request_id: String,
    input: String,
    params: GenParams,
    message_tx: mpsc::Sender<MessageRoute>,
) {
    let sink: ChunkSink = {
        let frame_tx = message_tx.clone();
        let frame_id = request_id.clone();
        Box::new(move |chunk: StreamChunk| {
            let frame_tx = frame_tx.clone();
            let frame_id = frame_id.clone();
            Box::pin(async move {
                // The terminal chunk becomes the JSON done reply below; it
                // is never forwarded as a frame.
                if chunk.done {
                    return;
                }
                let frame = encode_audio_frame(&frame_id, &chunk.data);
                let _ = frame_tx.send(MessageRoute::Binary(frame)).await;
            })
        })
    };

    let error = provider.generate_stream(&input, &params, sink).await;

    if error.is_error() {
        error!("error during streamed generation: {error}");
    }

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::GenerateStreamDone {
            unique_request_id: request_id,
            is_error: error.is_error(),
            error,
        }))
        .await;
}
