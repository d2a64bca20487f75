//! Message router.
//!
//! Dispatches validated incoming messages over the closed set of message
//! kinds, delegating to the provider lifecycle handlers and the
//! generation coordinator.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::state::AppState;

use super::{
    generate_handler::handle_generate,
    messages::{IncomingMessage, MessageRoute},
    provider_handler::{
        handle_clear_temp_files, handle_close, handle_get_models, handle_get_providers,
        handle_get_stream_format, handle_interrupt, handle_load,
    },
};

/// Routes one incoming message to its handler.
///
/// Returns `true` to keep the session alive, `false` to shut down.
pub async fn handle_incoming_message(
    message: IncomingMessage,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    match message {
        IncomingMessage::Load {
            unique_request_id,
            provider,
            request,
        } => handle_load(unique_request_id, provider, request, message_tx, app_state).await,
        IncomingMessage::Generate {
            unique_request_id,
            input,
            params,
            stream,
        } => handle_generate(unique_request_id, input, params, stream, message_tx, app_state).await,
        IncomingMessage::Interrupt { unique_request_id } => {
            handle_interrupt(unique_request_id, message_tx, app_state).await
        }
        IncomingMessage::Close { unique_request_id } => {
            handle_close(unique_request_id, message_tx).await
        }
        IncomingMessage::GetProviders { unique_request_id } => {
            handle_get_providers(unique_request_id, message_tx).await
        }
        IncomingMessage::GetModels { unique_request_id } => {
            handle_get_models(unique_request_id, message_tx, app_state).await
        }
        IncomingMessage::GetStreamFormat { unique_request_id } => {
            handle_get_stream_format(unique_request_id, message_tx, app_state).await
        }
        IncomingMessage::ClearTempFiles { unique_request_id } => {
            handle_clear_temp_files(unique_request_id, message_tx, app_state).await
        }
    }
}
