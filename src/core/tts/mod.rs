//! TTS provider registry.
//!
//! Providers form a closed set: each name maps to a statically compiled
//! implementation of the [`TextToSpeech`] contract. Contract adherence is
//! enforced by the trait itself, so a provider that compiles is a provider
//! that satisfies the full capability set.

mod base;
pub mod fishaudio;

pub use base::{
    AudioFormat, ChunkSink, ConvertParams, GenError, GenParams, StreamChunk, StreamFormat,
    SyncAudio, TextToSpeech,
};
pub use fishaudio::FishAudioTts;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;

/// Closed set of installable providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    FishAudio,
}

impl ProviderName {
    /// Resolves a wire-level provider name. `None` for unknown names.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "fishaudio" => Some(ProviderName::FishAudio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderName::FishAudio => "fishaudio",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of every installable provider, in registry order.
pub fn provider_names() -> Vec<String> {
    [ProviderName::FishAudio]
        .iter()
        .map(|name| name.as_str().to_string())
        .collect()
}

/// Creates an uninitialized provider instance.
///
/// The instance is not usable until `init` succeeds; the registry itself
/// never runs `init` so a failed load can clear the active slot without a
/// half-installed provider remaining reachable.
pub fn create_provider(name: ProviderName, config: &ServerConfig) -> Arc<dyn TextToSpeech> {
    match name {
        ProviderName::FishAudio => Arc::new(FishAudioTts::with_base_url(
            config.audio_dir.clone(),
            config.fishaudio_url.clone(),
        )),
    }
}
