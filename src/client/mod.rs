//! Client-side request correlation layer.
//!
//! [`TtsClient`] speaks the daemon's protocol over one long-lived
//! WebSocket connection. Every request registers one-shot waiters keyed by
//! `(reply kind, request id)` before it is sent, then races the service's
//! acknowledgement against a fixed timeout: when the timeout wins the
//! request is treated as abandoned and every listener registered under
//! that id (including any binary-chunk subscription) is discarded, so an
//! unanswered request never leaks correlation state. Losing the
//! transport discards every pending waiter, so outstanding requests
//! resolve with a connection-closed error instead of hanging.
//!
//! Replies with no matching waiter are protocol anomalies: logged, never
//! fatal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::core::tts::{GenError, GenParams, StreamFormat, SyncAudio};
use crate::handlers::ws::messages::{decode_audio_frame, OutgoingMessage};

/// How long a caller waits for the acknowledgement (or, for ack-less
/// introspection requests, the done reply) before treating a request as
/// abandoned.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Listeners = Arc<Mutex<HashMap<(String, String), oneshot::Sender<OutgoingMessage>>>>;
type StreamListeners = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0} timed out waiting for a reply, the TTS service may be gone")]
    AckTimeout(&'static str),
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
    #[error("request failed with error kind {0}")]
    Failed(GenError),
    #[error("unexpected reply shape: {0}")]
    Protocol(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Correlation-aware client for the TTS service daemon.
pub struct TtsClient {
    writer: Mutex<SplitSink<Socket, Message>>,
    listeners: Listeners,
    stream_listeners: StreamListeners,
    reader_task: tokio::task::JoinHandle<()>,
}

impl TtsClient {
    /// Connect to a running service, e.g. `ws://127.0.0.1:7563`.
    pub async fn connect(url: &str) -> ClientResult<Self> {
        let (socket, _) = connect_async(url).await?;
        let (writer, mut reader) = socket.split();

        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let stream_listeners: StreamListeners = Arc::new(Mutex::new(HashMap::new()));

        let reader_task = {
            let listeners = listeners.clone();
            let stream_listeners = stream_listeners.clone();
            tokio::spawn(async move {
                while let Some(received) = reader.next().await {
                    match received {
                        Ok(message) => {
                            route_incoming(message, &listeners, &stream_listeners).await;
                        }
                        Err(e) => {
                            warn!("client socket error: {e}");
                            break;
                        }
                    }
                }
                // Connection gone: dropping every pending sender resolves
                // its waiter with a closed-channel error, so no request
                // outlives the transport.
                listeners.lock().await.clear();
                stream_listeners.lock().await.clear();
            })
        };

        Ok(Self {
            writer: Mutex::new(writer),
            listeners,
            stream_listeners,
            reader_task,
        })
    }

    /// Load a provider. `params` carries provider-specific credential
    /// fields that are merged into the load request object.
    pub async fn load_provider(&self, provider: &str, params: Value) -> ClientResult<()> {
        let id = new_request_id();
        let mut payload = json!({
            "type": "load",
            "unique_request_id": id,
            "provider": provider,
        });
        if let (Some(object), Some(extra)) = (payload.as_object_mut(), params.as_object()) {
            for (key, value) in extra {
                object.insert(key.clone(), value.clone());
            }
        }

        match self
            .ack_then_done("load", payload, "load_ack", "load_done", &id)
            .await?
        {
            OutgoingMessage::LoadDone {
                is_error, error, ..
            } => {
                if is_error {
                    Err(ClientError::Failed(error))
                } else {
                    Ok(())
                }
            }
            other => Err(ClientError::Protocol(format!("{other:?}"))),
        }
    }

    /// Generate a complete audio artifact.
    pub async fn generate(&self, input: &str, params: &GenParams) -> ClientResult<SyncAudio> {
        let id = new_request_id();
        let payload = json!({
            "type": "generate",
            "unique_request_id": id,
            "input": input,
            "params": params,
            "stream": false,
        });

        match self
            .ack_then_done("generate", payload, "generate_ack", "generate_done", &id)
            .await?
        {
            OutgoingMessage::GenerateDone {
                is_error,
                error,
                response,
                ..
            } => {
                if is_error {
                    Err(ClientError::Failed(error))
                } else {
                    response.ok_or_else(|| {
                        ClientError::Protocol("generate_done without a response value".to_string())
                    })
                }
            }
            other => Err(ClientError::Protocol(format!("{other:?}"))),
        }
    }

    /// Generate audio as a stream, invoking `on_chunk` for every binary
    /// frame tagged with this request's id.
    pub async fn generate_stream<F>(
        &self,
        input: &str,
        params: &GenParams,
        mut on_chunk: F,
    ) -> ClientResult<()>
    where
        F: FnMut(Bytes) + Send,
    {
        let id = new_request_id();
        let ack = self.listen_to("generate_ack", &id).await;
        let mut done = self.listen_to("generate_stream_done", &id).await;

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        self.stream_listeners
            .lock()
            .await
            .insert(id.clone(), chunk_tx);

        let payload = json!({
            "type": "generate",
            "unique_request_id": id,
            "input": input,
            "params": params,
            "stream": true,
        });
        if let Err(e) = self.send(payload).await {
            self.remove_all_listeners(&id).await;
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
            Err(_) => {
                self.remove_all_listeners(&id).await;
                return Err(ClientError::AckTimeout("generate_stream"));
            }
            Ok(Err(_)) => {
                self.remove_all_listeners(&id).await;
                return Err(ClientError::ConnectionClosed);
            }
            Ok(Ok(_)) => {}
        }

        let done_message = loop {
            tokio::select! {
                reply = &mut done => match reply {
                    Ok(message) => break message,
                    Err(_) => {
                        self.remove_all_listeners(&id).await;
                        return Err(ClientError::ConnectionClosed);
                    }
                },
                Some(chunk) = chunk_rx.recv() => on_chunk(chunk),
            }
        };

        // Frames routed before the done reply may still sit in the channel.
        while let Ok(chunk) = chunk_rx.try_recv() {
            on_chunk(chunk);
        }
        self.remove_all_listeners(&id).await;

        match done_message {
            OutgoingMessage::GenerateStreamDone {
                is_error, error, ..
            } => {
                if is_error {
                    Err(ClientError::Failed(error))
                } else {
                    Ok(())
                }
            }
            other => Err(ClientError::Protocol(format!("{other:?}"))),
        }
    }

    /// Stop any in-flight generation.
    pub async fn interrupt(&self) -> ClientResult<()> {
        let id = new_request_id();
        let payload = json!({"type": "interrupt", "unique_request_id": id});
        self.ack_only("interrupt", payload, "interrupt_ack", &id)
            .await
    }

    /// Ask the service process to shut down; resolves once the close is
    /// acknowledged.
    pub async fn close(&self) -> ClientResult<()> {
        let id = new_request_id();
        let payload = json!({"type": "close", "unique_request_id": id});
        self.ack_only("close", payload, "close_ack", &id).await
    }

    /// Delete every generated audio artifact on the service side.
    pub async fn clear_temp_files(&self) -> ClientResult<()> {
        let id = new_request_id();
        let payload = json!({"type": "clear_temp_files", "unique_request_id": id});
        self.ack_only("clear_temp_files", payload, "clear_temp_files_ack", &id)
            .await
    }

    /// List installable providers.
    pub async fn get_providers(&self) -> ClientResult<Vec<String>> {
        let id = new_request_id();
        let payload = json!({"type": "get_providers", "unique_request_id": id});
        match self
            .done_only("get_providers", payload, "get_providers_done", &id)
            .await?
        {
            OutgoingMessage::GetProvidersDone { providers, .. } => Ok(providers),
            other => Err(ClientError::Protocol(format!("{other:?}"))),
        }
    }

    /// List the active provider's model identifiers.
    ///
    /// Times out when no provider is loaded: the service drops the request
    /// without a reply in that case.
    pub async fn get_models(&self) -> ClientResult<Vec<String>> {
        let id = new_request_id();
        let payload = json!({"type": "get_models", "unique_request_id": id});
        match self
            .done_only("get_models", payload, "get_models_done", &id)
            .await?
        {
            OutgoingMessage::GetModelsDone { models, .. } => Ok(models),
            other => Err(ClientError::Protocol(format!("{other:?}"))),
        }
    }

    /// PCM layout of the active provider's streamed chunks. Same
    /// no-provider behavior as [`Self::get_models`].
    pub async fn get_stream_format(&self) -> ClientResult<StreamFormat> {
        let id = new_request_id();
        let payload = json!({"type": "get_stream_format", "unique_request_id": id});
        match self
            .done_only("get_stream_format", payload, "get_stream_format_done", &id)
            .await?
        {
            OutgoingMessage::GetStreamFormatDone { format, .. } => Ok(format),
            other => Err(ClientError::Protocol(format!("{other:?}"))),
        }
    }

    async fn send(&self, payload: Value) -> ClientResult<()> {
        self.writer
            .lock()
            .await
            .send(Message::Text(payload.to_string().into()))
            .await?;
        Ok(())
    }

    /// Register a one-shot waiter for `(kind, id)`.
    async fn listen_to(&self, kind: &str, id: &str) -> oneshot::Receiver<OutgoingMessage> {
        let (tx, rx) = oneshot::channel();
        self.listeners
            .lock()
            .await
            .insert((kind.to_string(), id.to_string()), tx);
        rx
    }

    /// Drop every waiter registered under `id`, JSON and binary alike.
    /// Idempotent.
    async fn remove_all_listeners(&self, id: &str) {
        self.listeners
            .lock()
            .await
            .retain(|(_, listener_id), _| listener_id != id);
        self.stream_listeners.lock().await.remove(id);
    }

    /// Acknowledge-then-result flow: send, race the ack against the
    /// timeout, then wait for the terminal reply.
    async fn ack_then_done(
        &self,
        label: &'static str,
        payload: Value,
        ack_kind: &str,
        done_kind: &str,
        id: &str,
    ) -> ClientResult<OutgoingMessage> {
        let ack = self.listen_to(ack_kind, id).await;
        let done = self.listen_to(done_kind, id).await;

        if let Err(e) = self.send(payload).await {
            self.remove_all_listeners(id).await;
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
            Err(_) => {
                self.remove_all_listeners(id).await;
                Err(ClientError::AckTimeout(label))
            }
            Ok(Err(_)) => {
                self.remove_all_listeners(id).await;
                Err(ClientError::ConnectionClosed)
            }
            Ok(Ok(_)) => done.await.map_err(|_| ClientError::ConnectionClosed),
        }
    }

    /// Flow for requests whose only reply is an acknowledgement.
    async fn ack_only(
        &self,
        label: &'static str,
        payload: Value,
        ack_kind: &str,
        id: &str,
    ) -> ClientResult<()> {
        let ack = self.listen_to(ack_kind, id).await;

        if let Err(e) = self.send(payload).await {
            self.remove_all_listeners(id).await;
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
            Err(_) => {
                self.remove_all_listeners(id).await;
                Err(ClientError::AckTimeout(label))
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Flow for introspection requests that reply with a done message and
    /// no acknowledgement. The same timeout applies because the service
    /// silently drops these when no provider is loaded.
    async fn done_only(
        &self,
        label: &'static str,
        payload: Value,
        done_kind: &str,
        id: &str,
    ) -> ClientResult<OutgoingMessage> {
        let done = self.listen_to(done_kind, id).await;

        if let Err(e) = self.send(payload).await {
            self.remove_all_listeners(id).await;
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, done).await {
            Err(_) => {
                self.remove_all_listeners(id).await;
                Err(ClientError::AckTimeout(label))
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(message)) => Ok(message),
        }
    }
}

impl Drop for TtsClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Demultiplex one inbound message to its registered waiter.
async fn route_incoming(
    message: Message,
    listeners: &Listeners,
    stream_listeners: &StreamListeners,
) {
    match message {
        Message::Binary(data) => {
            let Some((id, payload)) = decode_audio_frame(&data) else {
                error!("received unhandled binary message");
                return;
            };
            let id = id.to_string();
            let payload = Bytes::copy_from_slice(payload);

            let mut subscriptions = stream_listeners.lock().await;
            match subscriptions.get(&id) {
                Some(subscriber) => {
                    if subscriber.send(payload).is_err() {
                        subscriptions.remove(&id);
                    }
                }
                None => error!("received unhandled audio frame for request {id}"),
            }
        }
        Message::Text(text) => {
            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    error!("failed to parse reply from server: {e}");
                    return;
                }
            };

            let (Some(kind), Some(id)) = (
                value.get("type").and_then(Value::as_str),
                value.get("unique_request_id").and_then(Value::as_str),
            ) else {
                error!("reply from server is missing type or unique_request_id: {value}");
                return;
            };
            let key = (kind.to_string(), id.to_string());

            let waiter = listeners.lock().await.remove(&key);
            match waiter {
                None => {
                    error!("received unhandled message from server: {value}");
                    error!("this might be due to an out-of-date client or service");
                }
                Some(waiter) => match serde_json::from_value::<OutgoingMessage>(value) {
                    Ok(reply) => {
                        let _ = waiter.send(reply);
                    }
                    Err(e) => error!("malformed reply from server: {e}"),
                },
            }
        }
        _ => {}
    }
}
