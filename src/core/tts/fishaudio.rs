//! fish.audio TTS provider.
//!
//! Talks to the fish.audio REST endpoint, which accepts msgpack-encoded
//! request bodies and streams raw audio back. Synchronous generation
//! writes a complete `wav` artifact into the audio directory; streaming
//! generation forwards bounded PCM chunks through the caller's sink.
//!
//! Interruption is cooperative: `interrupt` cancels the token armed by the
//! current generation, and the transfer loop checks it at every chunk
//! boundary. Timeouts abort the underlying transfer by dropping the
//! response stream.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use super::base::{
    AudioFormat, ChunkSink, GenError, GenParams, StreamChunk, StreamFormat, SyncAudio,
    TextToSpeech,
};

/// Production endpoint for fish.audio speech synthesis.
pub const FISHAUDIO_TTS_URL: &str = "https://api.fish.audio/v1/tts";

/// Upper bound on a single streamed chunk. Keeps the socket responsive and
/// gives the interrupt and timeout checks a chance between frames.
pub const STREAM_CHUNK_SIZE: usize = 2048;

/// Public reference voice used by the credential probe in `init`.
const PROBE_VOICE_ID: &str = "e58b0d7efca34eb38d5c4985e378abcb";

const STREAM_FORMAT: StreamFormat = StreamFormat {
    bit_depth: 16,
    frequency: 44_100,
    channels_nb: 1,
};

/// msgpack body of a fish.audio synthesis request.
#[derive(Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    format: &'a str,
    reference_id: &'a str,
    normalize: bool,
    latency: &'a str,
}

/// Decrements the provider's in-flight counter exactly once on drop,
/// clamped at zero.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

pub struct FishAudioTts {
    client: reqwest::Client,
    base_url: String,
    /// Destination directory for synchronous generation artifacts.
    audio_dir: PathBuf,
    /// Set by a successful `init`, cleared by `free`.
    api_key: RwLock<Option<String>>,
    /// Token armed by the current generation; `interrupt` cancels it.
    interrupt: Mutex<CancellationToken>,
    /// Descriptive telemetry, not a mutex: number of generations currently
    /// inside the provider.
    in_flight: AtomicUsize,
}

impl FishAudioTts {
    /// Creates an uninitialized provider targeting `base_url`, usually
    /// [`FISHAUDIO_TTS_URL`].
    pub fn with_base_url(audio_dir: PathBuf, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            audio_dir,
            api_key: RwLock::new(None),
            interrupt: Mutex::new(CancellationToken::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of generations currently inside the provider.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Replaces the interrupt token with a fresh one, clearing any pending
    /// interrupt, and returns the token the new generation should watch.
    fn arm_interrupt(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.interrupt.lock() = fresh.clone();
        fresh
    }

    async fn send_synthesis_request(
        &self,
        text: &str,
        format: &str,
        voice_id: &str,
    ) -> Result<reqwest::Response, GenError> {
        let Some(api_key) = self.api_key.read().clone() else {
            error!("fishaudio provider used before a successful init");
            return Err(GenError::Unexpected);
        };

        let body = rmp_serde::to_vec_named(&SynthesisBody {
            text,
            format,
            reference_id: voice_id,
            normalize: false,
            latency: "balanced",
        })
        .map_err(|e| {
            error!("failed to encode fishaudio request body: {e}");
            GenError::Unexpected
        })?;

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(api_key)
            .header("content-type", "application/msgpack")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("fishaudio request failed: {e}");
                GenError::Unexpected
            })?;

        if !response.status().is_success() {
            error!("fishaudio request failed with status {}", response.status());
            return Err(GenError::Unexpected);
        }

        Ok(response)
    }

    async fn generate_inner(
        &self,
        input: &str,
        params: &GenParams,
        cancel: &CancellationToken,
    ) -> Result<SyncAudio, GenError> {
        let response = self
            .send_synthesis_request(input, "wav", &params.voice_id)
            .await?;

        let path = self.audio_dir.join(format!("{}.wav", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
            error!("failed to create audio file {}: {e}", path.display());
            GenError::Unexpected
        })?;

        let mut stream = response.bytes_stream();
        let mut interrupted = false;
        while let Some(next) = stream.next().await {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let chunk = next.map_err(|e| {
                error!("fishaudio transfer failed mid-stream: {e}");
                GenError::Unexpected
            })?;
            file.write_all(&chunk).await.map_err(|e| {
                error!("failed to write audio file {}: {e}", path.display());
                GenError::Unexpected
            })?;
        }
        file.flush().await.map_err(|e| {
            error!("failed to flush audio file {}: {e}", path.display());
            GenError::Unexpected
        })?;

        if interrupted || cancel.is_cancelled() {
            debug!("generation interrupted, discarding result");
            return Err(GenError::Interrupt);
        }

        Ok(SyncAudio {
            path: path.to_string_lossy().into_owned(),
            audio_format: AudioFormat {
                format: "wav".to_string(),
                pcm: STREAM_FORMAT,
            },
        })
    }

    async fn stream_inner(
        &self,
        input: &str,
        params: &GenParams,
        cancel: &CancellationToken,
        sink: &mut ChunkSink,
    ) -> GenError {
        let response = match self
            .send_synthesis_request(input, "pcm", &params.voice_id)
            .await
        {
            Ok(response) => response,
            Err(error) => return error,
        };

        let timeout = params.timeout_ms.map(Duration::from_millis);
        // Placeholder duration when no timeout was requested; the branch is
        // disabled by the select guard in that case.
        let deadline = tokio::time::sleep(timeout.unwrap_or(Duration::from_secs(86_400)));
        tokio::pin!(deadline);

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = &mut deadline, if timeout.is_some() => {
                    error!(
                        "generate_stream timed out, request took longer than {} ms",
                        params.timeout_ms.unwrap_or_default()
                    );
                    return GenError::Timeout;
                }
                _ = cancel.cancelled() => return GenError::Interrupt,
                next = stream.next() => match next {
                    None => break,
                    Some(Err(e)) => {
                        error!("fishaudio transfer failed mid-stream: {e}");
                        return GenError::Unexpected;
                    }
                    Some(Ok(chunk)) => chunk,
                },
            };

            for piece in chunk.chunks(STREAM_CHUNK_SIZE) {
                if cancel.is_cancelled() {
                    return GenError::Interrupt;
                }
                sink(StreamChunk {
                    done: false,
                    data: Bytes::copy_from_slice(piece),
                })
                .await;
                // The deadline is per-chunk: progress refreshes it.
                if let Some(timeout) = timeout {
                    deadline.as_mut().reset(tokio::time::Instant::now() + timeout);
                }
            }
        }

        if cancel.is_cancelled() {
            GenError::Interrupt
        } else {
            GenError::Success
        }
    }
}

#[async_trait]
impl TextToSpeech for FishAudioTts {
    async fn init(&self, load_request: &serde_json::Value) -> GenError {
        let Some(api_key) = load_request.get("api_key").and_then(|v| v.as_str()) else {
            error!("request to load the fishaudio provider is missing the \"api_key\" field");
            error!(
                "expected shape: {}",
                r#"{"type":"load","unique_request_id":"<id>","provider":"fishaudio","api_key":"<api key>"}"#
            );
            return GenError::Authorization;
        };

        // Probe request validating the credentials before the provider is
        // considered ready.
        let body = match rmp_serde::to_vec_named(&SynthesisBody {
            text: "This is a test",
            format: "wav",
            reference_id: PROBE_VOICE_ID,
            normalize: false,
            latency: "balanced",
        }) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode fishaudio probe body: {e}");
                return GenError::Unexpected;
            }
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(api_key)
            .header("content-type", "application/msgpack")
            .body(body)
            .send()
            .await;

        match response {
            Err(e) => {
                error!("probe request to fishaudio failed, assuming invalid API key: {e}");
                GenError::Authorization
            }
            Ok(response) if !response.status().is_success() => {
                error!(
                    "probe request to fishaudio failed with status {}, assuming invalid API key",
                    response.status()
                );
                GenError::Authorization
            }
            Ok(_) => {
                *self.api_key.write() = Some(api_key.to_string());
                GenError::Success
            }
        }
    }

    async fn free(&self) {
        *self.api_key.write() = None;
    }

    async fn generate(&self, input: &str, params: &GenParams) -> Result<SyncAudio, GenError> {
        let cancel = self.arm_interrupt();
        let _guard = InFlightGuard::enter(&self.in_flight);

        match params.timeout_ms {
            Some(ms) => {
                // The transfer future is dropped when the timer wins, which
                // aborts the underlying connection.
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    self.generate_inner(input, params, &cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        error!("generate timed out, request took longer than {ms} ms");
                        Err(GenError::Timeout)
                    }
                }
            }
            None => self.generate_inner(input, params, &cancel).await,
        }
    }

    async fn generate_stream(
        &self,
        input: &str,
        params: &GenParams,
        mut sink: ChunkSink,
    ) -> GenError {
        let cancel = self.arm_interrupt();
        let status = {
            let _guard = InFlightGuard::enter(&self.in_flight);
            self.stream_inner(input, params, &cancel, &mut sink).await
        };

        // Terminal chunk fires on every exit path, including failure.
        sink(StreamChunk {
            done: true,
            data: Bytes::new(),
        })
        .await;

        status
    }

    fn interrupt(&self) {
        self.interrupt.lock().cancel();
    }

    async fn models(&self) -> Vec<String> {
        Vec::new()
    }

    fn stream_format(&self) -> StreamFormat {
        STREAM_FORMAT
    }
}
