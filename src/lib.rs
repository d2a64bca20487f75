pub mod client;
pub mod config;
pub mod core;
pub mod handlers;
pub mod routes;
pub mod state;

// Re-export commonly used items for convenience
pub use client::TtsClient;
pub use config::ServerConfig;
pub use core::tts::{GenError, GenParams, StreamFormat, SyncAudio, TextToSpeech};
pub use state::AppState;
