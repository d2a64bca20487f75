//! Axum WebSocket handler.
//!
//! Owns the per-connection socket loop: a sender task drains a channel of
//! outbound routes (JSON replies and binary audio frames) while the main
//! loop validates inbound envelopes and hands them to the router. Long
//! running work (provider init, generation) runs in spawned tasks so the
//! loop keeps accepting messages, which is what makes mid-generation
//! interrupts deliverable.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::state::AppState;

use super::{
    messages::{IncomingMessage, MessageRoute},
    processor::handle_incoming_message,
};

const CHANNEL_BUFFER_SIZE: usize = 1024;

/// How long the close path waits for queued replies to flush before the
/// process exits.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler for the TTS protocol endpoint.
pub async fn ws_tts_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("client connection upgrade requested");
    ws.on_upgrade(move |socket| handle_tts_socket(socket, state))
}

/// Manages one client session from upgrade to teardown.
async fn handle_tts_socket(socket: WebSocket, app_state: Arc<AppState>) {
    info!("socket connected to server");

    let (mut sender, mut receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);

    let sender_task = tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            let result = match route {
                MessageRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("failed to serialize outgoing message: {e}");
                        continue;
                    }
                },
                MessageRoute::Binary(frame) => sender.send(Message::Binary(frame)).await,
            };

            if let Err(e) = result {
                error!("failed to send message to client: {e}");
                break;
            }
        }
    });

    let mut shutdown_requested = false;
    while let Some(received) = receiver.next().await {
        match received {
            Ok(Message::Text(text)) => {
                if !process_text_message(&text, &message_tx, &app_state).await {
                    shutdown_requested = true;
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!("ignoring unexpected binary message from client");
            }
            Ok(Message::Close(_)) => {
                info!("socket closed by client");
                break;
            }
            // Ping/pong handled by axum.
            Ok(_) => {}
            Err(e) => {
                warn!("socket error: {e}");
                break;
            }
        }
    }

    // Our clone of the channel closes here; spawned generation tasks may
    // still hold clones, so the close path bounds the flush wait.
    drop(message_tx);

    if shutdown_requested {
        let _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, sender_task).await;
        info!("close requested, shutting down");
        std::process::exit(0);
    }

    sender_task.abort();
    info!("socket session terminated");
}

/// Validates the envelope of one inbound text message and dispatches it.
///
/// Malformed JSON, non-object payloads, payloads missing `type` or
/// `unique_request_id`, and unknown kinds are logged and dropped without
/// a reply; none of them terminate the connection.
///
/// Returns `false` when the session should shut down (`close` received).
async fn process_text_message(
    text: &str,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            error!("failed to parse incoming message as JSON: {e}");
            return true;
        }
    };

    let Some(object) = value.as_object() else {
        error!("incoming message is not a JSON object");
        return true;
    };

    info!("received: {}", redacted(object));

    if object.get("type").is_none() {
        error!("incoming message is missing the required \"type\" field");
        error!(
            "valid types are: load, generate, interrupt, close, get_providers, get_models, \
             get_stream_format, clear_temp_files"
        );
        return true;
    }

    if object.get("unique_request_id").is_none() {
        error!("incoming message is missing the required \"unique_request_id\" field");
        error!(
            "the client must attach a unique string to each request in order to correlate replies"
        );
        return true;
    }

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let incoming: IncomingMessage = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(e) => {
            error!("invalid incoming \"{kind}\" message: {e}");
            log_expected_shape(&kind);
            return true;
        }
    };

    handle_incoming_message(incoming, message_tx, app_state).await
}

/// Copy of the message with credential fields masked, for logging.
fn redacted(object: &serde_json::Map<String, Value>) -> Value {
    let mut copy = object.clone();
    if copy.contains_key("api_key") {
        copy.insert("api_key".to_string(), Value::from("hidden"));
    }
    Value::Object(copy)
}

/// Logs an example of the expected message shape so a caller can
/// self-correct without consulting the protocol documentation.
fn log_expected_shape(kind: &str) {
    match kind {
        "load" => error!(
            "expected shape: {}",
            r#"{"type":"load","unique_request_id":"<id>","provider":"fishaudio","api_key":"<api key>"}"#
        ),
        "generate" => error!(
            "expected shape: {}",
            r#"{"type":"generate","unique_request_id":"<id>","input":"<text>","params":{"model_id":"","voice_id":"<voice id>","timeout_ms":5000,"convert":null},"stream":false}"#
        ),
        _ => error!(
            "valid types are: load, generate, interrupt, close, get_providers, get_models, \
             get_stream_format, clear_temp_files"
        ),
    }
}
