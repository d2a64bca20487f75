//! End-to-end protocol tests against a live server on an ephemeral port.
//!
//! A mock provider is installed directly into the active slot so these
//! tests exercise the protocol surface and the generation coordinator
//! without any network backend.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::protocol::Message, WebSocketStream,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use voxd::client::{ClientError, TtsClient};
use voxd::core::tts::{
    fishaudio::FISHAUDIO_TTS_URL, AudioFormat, ChunkSink, GenError, GenParams, ProviderName,
    StreamChunk, StreamFormat, SyncAudio, TextToSpeech,
};
use voxd::handlers::ws::messages::encode_audio_frame;
use voxd::state::{ActiveProvider, AppState};
use voxd::{routes, ServerConfig};

const MOCK_FORMAT: StreamFormat = StreamFormat {
    bit_depth: 16,
    frequency: 44_100,
    channels_nb: 1,
};

struct MockTts {
    interrupted: AtomicBool,
    /// Shared flag set by `free`, so tests can observe provider teardown.
    freed: Arc<AtomicBool>,
    chunks: Vec<Bytes>,
    /// Streams indefinitely until interrupted instead of replaying
    /// `chunks`.
    endless: bool,
}

impl MockTts {
    fn with_chunks(chunks: Vec<Bytes>) -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            freed: Arc::new(AtomicBool::new(false)),
            chunks,
            endless: false,
        }
    }

    fn endless() -> Self {
        Self {
            endless: true,
            ..Self::with_chunks(Vec::new())
        }
    }

    fn with_freed_flag(freed: Arc<AtomicBool>) -> Self {
        Self {
            freed,
            ..Self::with_chunks(Vec::new())
        }
    }
}

#[async_trait]
impl TextToSpeech for MockTts {
    async fn init(&self, _load_request: &Value) -> GenError {
        GenError::Success
    }

    async fn free(&self) {
        self.freed.store(true, Ordering::SeqCst);
    }

    async fn generate(&self, input: &str, _params: &GenParams) -> Result<SyncAudio, GenError> {
        Ok(SyncAudio {
            path: format!("/tmp/mock-{}.wav", input.len()),
            audio_format: AudioFormat {
                format: "wav".to_string(),
                pcm: MOCK_FORMAT,
            },
        })
    }

    async fn generate_stream(
        &self,
        _input: &str,
        _params: &GenParams,
        mut sink: ChunkSink,
    ) -> GenError {
        if self.endless {
            loop {
                if self.interrupted.load(Ordering::SeqCst) {
                    sink(StreamChunk {
                        done: true,
                        data: Bytes::new(),
                    })
                    .await;
                    return GenError::Interrupt;
                }
                sink(StreamChunk {
                    done: false,
                    data: Bytes::from_static(&[0u8; 64]),
                })
                .await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        for chunk in &self.chunks {
            sink(StreamChunk {
                done: false,
                data: chunk.clone(),
            })
            .await;
        }
        sink(StreamChunk {
            done: true,
            data: Bytes::new(),
        })
        .await;
        GenError::Success
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    async fn models(&self) -> Vec<String> {
        vec!["mock-model".to_string()]
    }

    fn stream_format(&self) -> StreamFormat {
        MOCK_FORMAT
    }
}

fn test_config(audio_dir: PathBuf) -> ServerConfig {
    config_with_backend(audio_dir, FISHAUDIO_TTS_URL.to_string())
}

fn config_with_backend(audio_dir: PathBuf, fishaudio_url: String) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        audio_dir,
        fishaudio_url,
    }
}

/// Binds the router to an ephemeral port and returns its ws:// URL.
async fn spawn_server(state: Arc<AppState>) -> String {
    let app = routes::ws::create_ws_router().with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{address}")
}

/// Runs one scripted session against the first client that connects;
/// for wire behaviors the real server never exhibits.
async fn spawn_scripted_server<F, Fut>(script: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let socket = accept_async(stream).await.unwrap();
        script(socket).await;
    });
    format!("ws://{address}")
}

async fn install_mock(state: &AppState, mock: MockTts) {
    *state.provider.write().await = Some(ActiveProvider {
        name: ProviderName::FishAudio,
        tts: Arc::new(mock),
    });
}

fn gen_params() -> GenParams {
    GenParams {
        model_id: "mock-model".to_string(),
        voice_id: "mock-voice".to_string(),
        timeout_ms: Some(5_000),
        convert: None,
    }
}

#[tokio::test]
async fn sync_generation_returns_audio_path() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    install_mock(&state, MockTts::with_chunks(Vec::new())).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    let audio = client.generate("hello", &gen_params()).await.unwrap();
    assert_eq!(audio.path, "/tmp/mock-5.wav");
    assert_eq!(audio.audio_format.format, "wav");
    assert_eq!(audio.audio_format.pcm, MOCK_FORMAT);
}

#[tokio::test]
async fn streamed_generation_delivers_data_chunks_only() {
    let chunks = vec![
        Bytes::from_static(b"first"),
        Bytes::from_static(b"second"),
        Bytes::from_static(b"third"),
    ];
    let state = AppState::new(test_config(std::env::temp_dir()));
    install_mock(&state, MockTts::with_chunks(chunks.clone())).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    let mut received = Vec::new();
    client
        .generate_stream("hello", &gen_params(), |chunk| received.push(chunk))
        .await
        .unwrap();

    // The terminal done chunk is never framed, only the data chunks are.
    assert_eq!(received, chunks);
}

#[tokio::test]
async fn generate_without_provider_times_out_and_connection_survives() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    let result = client.generate("hello", &gen_params()).await;
    assert!(matches!(result, Err(ClientError::AckTimeout(_))));

    // The request was dropped, not the connection.
    let providers = client.get_providers().await.unwrap();
    assert_eq!(providers, vec!["fishaudio".to_string()]);
}

#[tokio::test]
async fn generate_with_empty_input_is_dropped_before_the_ack() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    install_mock(&state, MockTts::with_chunks(Vec::new())).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    let result = client.generate("", &gen_params()).await;
    assert!(matches!(result, Err(ClientError::AckTimeout(_))));
}

#[tokio::test]
async fn loading_an_unknown_provider_keeps_the_active_one() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    install_mock(&state, MockTts::with_chunks(Vec::new())).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    let result = client.load_provider("definitely-not-a-provider", json!({})).await;
    assert!(matches!(
        result,
        Err(ClientError::Failed(GenError::InvalidProvider))
    ));

    // The previously installed provider still answers.
    let models = client.get_models().await.unwrap();
    assert_eq!(models, vec!["mock-model".to_string()]);
}

#[tokio::test]
async fn interrupt_stops_an_in_flight_stream() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    install_mock(&state, MockTts::endless()).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();

    let params = gen_params();
    let stream = client.generate_stream("endless", &params, |_| {});
    let interrupt = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.interrupt().await
    };

    let (stream_result, interrupt_result) = tokio::join!(stream, interrupt);
    interrupt_result.unwrap();
    assert!(matches!(
        stream_result,
        Err(ClientError::Failed(GenError::Interrupt))
    ));
}

#[tokio::test]
async fn interrupt_without_provider_is_still_acknowledged() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    client.interrupt().await.unwrap();
}

#[tokio::test]
async fn introspection_reports_the_active_provider() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    install_mock(&state, MockTts::with_chunks(Vec::new())).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    assert_eq!(client.get_providers().await.unwrap(), vec!["fishaudio"]);
    assert_eq!(client.get_models().await.unwrap(), vec!["mock-model"]);
    assert_eq!(client.get_stream_format().await.unwrap(), MOCK_FORMAT);
}

#[tokio::test]
async fn introspection_without_provider_is_dropped() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    assert!(matches!(
        client.get_models().await,
        Err(ClientError::AckTimeout(_))
    ));
    assert!(matches!(
        client.get_stream_format().await,
        Err(ClientError::AckTimeout(_))
    ));
}

#[tokio::test]
async fn clear_temp_files_empties_the_audio_dir() {
    let audio_dir = tempfile::tempdir().unwrap();
    for name in ["a.wav", "b.wav"] {
        std::fs::write(audio_dir.path().join(name), b"riff").unwrap();
    }

    let state = AppState::new(test_config(audio_dir.path().to_path_buf()));
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    client.clear_temp_files().await.unwrap();

    let remaining = std::fs::read_dir(audio_dir.path()).unwrap().count();
    assert_eq!(remaining, 0);
}

/// Raw-socket view of a synchronous generation: exactly one ack and one
/// terminal reply, in order, and nothing else on the wire.
#[tokio::test]
async fn sync_generation_resolves_exactly_once() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    install_mock(&state, MockTts::with_chunks(Vec::new())).await;
    let url = spawn_server(state).await;

    let (mut socket, _) = connect_async(&url).await.unwrap();
    let request = json!({
        "type": "generate",
        "unique_request_id": "raw-1",
        "input": "hi",
        "params": {"model_id": "mock-model", "voice_id": "v", "timeout_ms": null},
        "stream": false,
    });
    socket
        .send(Message::Text(request.to_string().into()))
        .await
        .unwrap();

    let ack: Value = next_json(&mut socket).await;
    assert_eq!(ack["type"], "generate_ack");
    assert_eq!(ack["unique_request_id"], "raw-1");

    let done: Value = next_json(&mut socket).await;
    assert_eq!(done["type"], "generate_done");
    assert_eq!(done["is_error"], false);
    assert_eq!(done["error"], "SUCCESS");
    assert_eq!(done["response"]["path"], "/tmp/mock-2.wav");

    // Probe with another request; the next reply must belong to it,
    // proving the generation produced no extra terminal message.
    let probe = json!({"type": "get_providers", "unique_request_id": "raw-2"});
    socket
        .send(Message::Text(probe.to_string().into()))
        .await
        .unwrap();
    let reply: Value = next_json(&mut socket).await;
    assert_eq!(reply["type"], "get_providers_done");
    assert_eq!(reply["unique_request_id"], "raw-2");
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing_the_connection() {
    let state = AppState::new(test_config(std::env::temp_dir()));
    let url = spawn_server(state).await;

    let (mut socket, _) = connect_async(&url).await.unwrap();
    for bad in [
        "this is not json",
        r#"{"unique_request_id":"x"}"#,
        r#"{"type":"get_providers"}"#,
        r#"{"type":"reboot","unique_request_id":"x"}"#,
    ] {
        socket
            .send(Message::Text(bad.to_string().into()))
            .await
            .unwrap();
    }

    let probe = json!({"type": "get_providers", "unique_request_id": "after-garbage"});
    socket
        .send(Message::Text(probe.to_string().into()))
        .await
        .unwrap();
    let reply: Value = next_json(&mut socket).await;
    assert_eq!(reply["type"], "get_providers_done");
    assert_eq!(reply["unique_request_id"], "after-garbage");
}

#[tokio::test]
async fn failed_provider_load_frees_the_old_instance_and_clears_the_slot() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&backend)
        .await;

    let state = AppState::new(config_with_backend(std::env::temp_dir(), backend.uri()));
    let freed = Arc::new(AtomicBool::new(false));
    install_mock(&state, MockTts::with_freed_flag(freed.clone())).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    let result = client
        .load_provider("fishaudio", json!({"api_key": "wrong"}))
        .await;
    assert!(matches!(
        result,
        Err(ClientError::Failed(GenError::Authorization))
    ));

    // The old provider was released before init ran, and the failed init
    // left the slot empty.
    assert!(freed.load(Ordering::SeqCst));
    assert!(matches!(
        client.get_models().await,
        Err(ClientError::AckTimeout(_))
    ));
}

#[tokio::test]
async fn loading_a_new_provider_frees_the_installed_one() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let state = AppState::new(config_with_backend(std::env::temp_dir(), backend.uri()));
    let freed = Arc::new(AtomicBool::new(false));
    install_mock(&state, MockTts::with_freed_flag(freed.clone())).await;
    let url = spawn_server(state).await;

    let client = TtsClient::connect(&url).await.unwrap();
    client
        .load_provider("fishaudio", json!({"api_key": "valid"}))
        .await
        .unwrap();
    assert!(freed.load(Ordering::SeqCst));

    // The mock is gone; the fishaudio provider reports no models.
    assert_eq!(client.get_models().await.unwrap(), Vec::<String>::new());
}

#[tokio::test]
async fn connection_loss_after_the_ack_fails_the_pending_request() {
    let url = spawn_scripted_server(|mut socket| async move {
        // Acknowledge the generate request, then drop the connection
        // without ever sending a terminal reply.
        let request = next_json(&mut socket).await;
        let ack = json!({
            "type": "generate_ack",
            "unique_request_id": request["unique_request_id"],
        });
        socket
            .send(Message::Text(ack.to_string().into()))
            .await
            .unwrap();
        socket.close(None).await.unwrap();
    })
    .await;

    let client = TtsClient::connect(&url).await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        client.generate("hello", &gen_params()),
    )
    .await
    .expect("request must fail, not hang");
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
}

#[tokio::test]
async fn unmatched_audio_frames_do_not_disturb_later_replies() {
    let url = spawn_scripted_server(|mut socket| async move {
        // A stray frame for an id nobody subscribed to, then a normal
        // reply to the introspection request.
        let frame = encode_audio_frame("nobody", b"pcm");
        socket.send(Message::Binary(frame)).await.unwrap();

        let request = next_json(&mut socket).await;
        let reply = json!({
            "type": "get_providers_done",
            "unique_request_id": request["unique_request_id"],
            "providers": ["fishaudio"],
        });
        socket
            .send(Message::Text(reply.to_string().into()))
            .await
            .unwrap();
        // Hold the connection open until the client hangs up.
        let _ = socket.next().await;
    })
    .await;

    let client = TtsClient::connect(&url).await.unwrap();
    assert_eq!(client.get_providers().await.unwrap(), vec!["fishaudio"]);
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a reply")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}
