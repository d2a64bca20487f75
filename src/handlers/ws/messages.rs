//! Wire message types and binary audio framing.
//!
//! Incoming and outgoing messages are tagged JSON objects; every reply
//! carries the caller-generated `unique_request_id` so a client with
//! multiple outstanding requests can demultiplex. Streamed audio travels
//! out-of-band as binary frames tagged with the same id.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::tts::{GenError, GenParams, StreamFormat, SyncAudio};

/// Delimiter between the request id and the PCM payload of a binary
/// frame. Guaranteed absent from any request id.
pub const FRAME_ID_SENTINEL: &str = "<|end_of_id|>";

/// Messages accepted from the client, dispatched by the `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    #[serde(rename = "load")]
    Load {
        unique_request_id: String,
        provider: String,
        /// Provider-specific fields (credentials and the like); handed to
        /// the provider's `init` untouched.
        #[serde(flatten)]
        request: serde_json::Map<String, Value>,
    },
    #[serde(rename = "generate")]
    Generate {
        unique_request_id: String,
        input: String,
        params: GenParams,
        stream: bool,
    },
    #[serde(rename = "interrupt")]
    Interrupt { unique_request_id: String },
    #[serde(rename = "close")]
    Close { unique_request_id: String },
    #[serde(rename = "get_providers")]
    GetProviders { unique_request_id: String },
    #[serde(rename = "get_models")]
    GetModels { unique_request_id: String },
    #[serde(rename = "get_stream_format")]
    GetStreamFormat { unique_request_id: String },
    #[serde(rename = "clear_temp_files")]
    ClearTempFiles { unique_request_id: String },
}

/// Replies sent to the client. A closed tagged union: each kind uniquely
/// determines its payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "load_ack")]
    LoadAck {
        unique_request_id: String,
        provider: String,
    },
    #[serde(rename = "load_done")]
    LoadDone {
        unique_request_id: String,
        provider: String,
        is_error: bool,
        error: GenError,
    },
    #[serde(rename = "generate_ack")]
    GenerateAck { unique_request_id: String },
    #[serde(rename = "generate_done")]
    GenerateDone {
        unique_request_id: String,
        is_error: bool,
        error: GenError,
        response: Option<SyncAudio>,
    },
    #[serde(rename = "generate_stream_done")]
    GenerateStreamDone {
        unique_request_id: String,
        is_error: bool,
        error: GenError,
    },
    #[serde(rename = "interrupt_ack")]
    InterruptAck { unique_request_id: String },
    #[serde(rename = "close_ack")]
    CloseAck { unique_request_id: String },
    #[serde(rename = "get_providers_done")]
    GetProvidersDone {
        unique_request_id: String,
        providers: Vec<String>,
    },
    #[serde(rename = "get_models_done")]
    GetModelsDone {
        unique_request_id: String,
        models: Vec<String>,
    },
    #[serde(rename = "get_stream_format_done")]
    GetStreamFormatDone {
        unique_request_id: String,
        format: StreamFormat,
    },
    #[serde(rename = "clear_temp_files_ack")]
    ClearTempFilesAck { unique_request_id: String },
}

/// Route for the per-connection sender task.
pub enum MessageRoute {
    Outgoing(OutgoingMessage),
    Binary(Bytes),
}

/// Encodes one streamed audio chunk as a binary frame:
/// `'$' + request_id + sentinel + payload`.
pub fn encode_audio_frame(request_id: &str, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(
        1 + request_id.len() + FRAME_ID_SENTINEL.len() + payload.len(),
    );
    frame.put_u8(b'$');
    frame.put_slice(request_id.as_bytes());
    frame.put_slice(FRAME_ID_SENTINEL.as_bytes());
    frame.put_slice(payload);
    frame.freeze()
}

/// Splits a binary frame into `(request_id, payload)`.
///
/// Returns `None` when the frame does not start with `'$'`, the sentinel
/// is missing, or the id is not valid UTF-8.
pub fn decode_audio_frame(frame: &[u8]) -> Option<(&str, &[u8])> {
    let rest = frame.strip_prefix(b"$")?;
    let sentinel = FRAME_ID_SENTINEL.as_bytes();
    let at = rest
        .windows(sentinel.len())
        .position(|window| window == sentinel)?;
    let id = std::str::from_utf8(&rest[..at]).ok()?;
    Some((id, &rest[at + sentinel.len()..]))
}
