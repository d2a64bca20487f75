//! # Provider contract
//!
//! This module defines the capability contract every TTS provider must
//! satisfy, along with the wire-visible error kinds and the audio data
//! types shared between providers and the protocol layer.
//!
//! A provider is installed behind an `Arc<dyn TextToSpeech>` handle; the
//! generation coordinator snapshots that handle at dispatch time, so a
//! provider swap never redirects an in-flight call.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

/// Wire-visible outcome of a provider operation.
///
/// `Success` is a member of the enum rather than a separate `Ok` case
/// because the protocol carries the error kind inside every terminal reply,
/// including successful ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenError {
    Success,
    Unexpected,
    Authorization,
    InvalidProvider,
    InvalidModel,
    Timeout,
    Interrupt,
}

impl GenError {
    /// Whether this kind counts as an error in `is_error` reply fields.
    pub fn is_error(self) -> bool {
        self != GenError::Success
    }

    /// The exact string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            GenError::Success => "SUCCESS",
            GenError::Unexpected => "UNEXPECTED",
            GenError::Authorization => "AUTHORIZATION",
            GenError::InvalidProvider => "INVALID_PROVIDER",
            GenError::InvalidModel => "INVALID_MODEL",
            GenError::Timeout => "TIMEOUT",
            GenError::Interrupt => "INTERRUPT",
        }
    }
}

impl fmt::Display for GenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PCM layout of streamed audio chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub bit_depth: u16,
    pub frequency: u32,
    pub channels_nb: u16,
}

/// Format descriptor attached to a finished audio artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Container format of the artifact, currently always `"wav"`.
    pub format: String,
    #[serde(flatten)]
    pub pcm: StreamFormat,
}

/// Result payload of a successful synchronous generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAudio {
    /// Filesystem path of the produced audio file.
    pub path: String,
    pub audio_format: AudioFormat,
}

/// Optional post-generation conversion parameters.
///
/// Accepted on the wire for compatibility; the bundled provider does not
/// perform conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertParams {
    pub format: String,
    pub bit_depth: u16,
    pub frequency: u32,
    pub channels_nb: u16,
    pub bit_rate: u32,
}

/// Parameters of a generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenParams {
    /// Model identifier; valid values come from `TextToSpeech::models`.
    pub model_id: String,
    /// Provider-specific voice identifier.
    pub voice_id: String,
    /// Per-call timeout in milliseconds; must be present on the wire,
    /// `null` disables the timeout.
    #[serde(deserialize_with = "nullable_timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub convert: Option<ConvertParams>,
}

/// A plain `Option` field is optional to serde; routing it through
/// `deserialize_with` makes the key required while keeping `null` valid.
fn nullable_timeout<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::deserialize(deserializer)
}

/// One chunk of streamed audio.
///
/// A stream is a sequence of chunks with `done == false` followed by
/// exactly one chunk with `done == true` and an empty payload, emitted on
/// every exit path including failure, timeout and interruption.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub done: bool,
    pub data: Bytes,
}

/// Per-chunk callback handed to `TextToSpeech::generate_stream`.
pub type ChunkSink =
    Box<dyn FnMut(StreamChunk) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Capability contract for a pluggable TTS backend.
///
/// Implementations are shared behind `Arc`, so all methods take `&self`
/// and interior state must be synchronized by the provider itself.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Performs all backend setup, including credential validation.
    ///
    /// Receives the full load request object so providers can read their
    /// own credential fields. Must not return `Success` until the provider
    /// can serve requests. Returns `Authorization` when credential
    /// validation fails and `Unexpected` for any other setup failure.
    async fn init(&self, load_request: &serde_json::Value) -> GenError;

    /// Releases every resource acquired by `init`, leaving the provider as
    /// if it was never initialized.
    async fn free(&self);

    /// Produces a complete audio artifact, suspending until the generation
    /// finishes, times out or is interrupted.
    async fn generate(&self, input: &str, params: &GenParams) -> Result<SyncAudio, GenError>;

    /// Produces audio incrementally, invoking `sink` once per data chunk
    /// and exactly once more with a terminal `done` chunk regardless of
    /// the outcome. Returns the terminal error kind.
    async fn generate_stream(&self, input: &str, params: &GenParams, sink: ChunkSink)
        -> GenError;

    /// Requests cooperative cancellation of any in-flight generation.
    ///
    /// Non-blocking; the generation loop observes the signal at chunk
    /// boundaries and resolves with `Interrupt`.
    fn interrupt(&self);

    /// Model identifiers accepted as `model_id` in generate requests.
    async fn models(&self) -> Vec<String>;

    /// PCM layout of the chunks produced by `generate_stream`.
    fn stream_format(&self) -> StreamFormat;
}
