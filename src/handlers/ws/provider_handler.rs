//! Provider lifecycle and introspection handlers.
//!
//! Covers `load`, `interrupt`, `close`, `get_providers`, `get_models`,
//! `get_stream_format` and `clear_temp_files`. The active-provider slot is
//! swapped under its write lock so no request can be dispatched against a
//! provider that is mid-free or mid-init.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::tts::{create_provider, provider_names, GenError, ProviderName};
use crate::state::{ActiveProvider, AppState};

use super::messages::{MessageRoute, OutgoingMessage};

/// Handle a `load` request: acknowledge, then swap the active provider in
/// a spawned task and report the outcome in `load_done`.
///
/// An unknown provider name is answered with `INVALID_PROVIDER` and leaves
/// any previously active provider untouched.
pub async fn handle_load(
    request_id: String,
    provider: String,
    request: serde_json::Map<String, Value>,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    info!("received load message");

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::LoadAck {
            unique_request_id: request_id.clone(),
            provider: provider.clone(),
        }))
        .await;

    let Some(name) = ProviderName::parse(&provider) else {
        error!("unknown provider \"{provider}\"");
        error!("available providers: {}", provider_names().join(", "));
        let _ = message_tx
            .send(MessageRoute::Outgoing(OutgoingMessage::LoadDone {
                unique_request_id: request_id,
                provider,
                is_error: true,
                error: GenError::InvalidProvider,
            }))
            .await;
        return true;
    };

    let message_tx = message_tx.clone();
    let app_state = app_state.clone();
    tokio::spawn(async move {
        let error = install_provider(&app_state, name, request).await;
        if !error.is_error() {
            info!("successfully loaded provider: {name}");
        }
        let _ = message_tx
            .send(MessageRoute::Outgoing(OutgoingMessage::LoadDone {
                unique_request_id: request_id,
                provider,
                is_error: error.is_error(),
                error,
            }))
            .await;
    });

    true
}

/// Swap the active provider: free the old instance, install the new one,
/// run its `init`, and propagate whatever error kind `init` returns.
///
/// The write lock is held across the whole swap. On any non-success
/// outcome the slot is left empty, so no provider is considered loaded.
async fn install_provider(
    app_state: &AppState,
    name: ProviderName,
    request: serde_json::Map<String, Value>,
) -> GenError {
    let mut slot = app_state.provider.write().await;

    if let Some(previous) = slot.take() {
        debug!("freeing previously active provider: {}", previous.name);
        previous.tts.free().await;
    }

    let tts = create_provider(name, &app_state.config);
    let error = tts.init(&Value::Object(request)).await;

    if error.is_error() {
        error!("failed to load provider {name}: {error}");
    } else {
        *slot = Some(ActiveProvider { name, tts });
    }
    error
}

/// Handle an `interrupt` request: acknowledge, then signal the active
/// provider. Interrupt with no provider loaded is a reported, non-fatal
/// anomaly.
pub async fn handle_interrupt(
    request_id: String,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    info!("received interrupt message");

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::InterruptAck {
            unique_request_id: request_id,
        }))
        .await;

    match &*app_state.provider.read().await {
        Some(active) => active.tts.interrupt(),
        None => error!("cannot interrupt, no provider is currently loaded"),
    }
    true
}

/// Handle a `close` request: acknowledge and ask the session loop to shut
/// the process down once the ack has flushed.
pub async fn handle_close(request_id: String, message_tx: &mpsc::Sender<MessageRoute>) -> bool {
    warn!("received close message");

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::CloseAck {
            unique_request_id: request_id,
        }))
        .await;
    false
}

/// Handle `get_providers`: enumerate the closed provider registry.
pub async fn handle_get_providers(
    request_id: String,
    message_tx: &mpsc::Sender<MessageRoute>,
) -> bool {
    info!("received get_providers message");

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::GetProvidersDone {
            unique_request_id: request_id,
            providers: provider_names(),
        }))
        .await;
    true
}

/// Handle `get_models`. With no provider loaded the request is logged and
/// dropped without a reply; the protocol has no reply kind for it.
pub async fn handle_get_models(
    request_id: String,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    info!("received get_models message");

    let tts = match &*app_state.provider.read().await {
        Some(active) => active.tts.clone(),
        None => {
            error!("cannot get models, no provider is currently loaded");
            return true;
        }
    };

    let models = tts.models().await;
    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::GetModelsDone {
            unique_request_id: request_id,
            models,
        }))
        .await;
    true
}

/// Handle `get_stream_format`. Same no-provider policy as `get_models`.
pub async fn handle_get_stream_format(
    request_id: String,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    info!("received get_stream_format message");

    let format = match &*app_state.provider.read().await {
        Some(active) => active.tts.stream_format(),
        None => {
            error!("cannot get stream format, no provider is currently loaded");
            return true;
        }
    };

    let _ = message_tx
        .send(MessageRoute::Outgoing(
            OutgoingMessage::GetStreamFormatDone {
                unique_request_id: request_id,
                format,
            },
        ))
        .await;
    true
}

/// Handle `clear_temp_files`: delete every file in the audio directory.
/// Per-file failures are logged and skipped; the ack is sent regardless.
pub async fn handle_clear_temp_files(
    request_id: String,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    info!("received clear_temp_files message");

    match tokio::fs::read_dir(&app_state.config.audio_dir).await {
        Ok(mut entries) => loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                        debug!("failed to remove {}: {e}", entry.path().display());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to walk audio directory: {e}");
                    break;
                }
            }
        },
        Err(e) => warn!(
            "failed to read audio directory {}: {e}",
            app_state.config.audio_dir.display()
        ),
    }

    let _ = message_tx
        .send(MessageRoute::Outgoing(OutgoingMessage::ClearTempFilesAck {
            unique_request_id: request_id,
        }))
        .await;
    true
}
