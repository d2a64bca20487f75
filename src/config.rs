//! Server configuration.
//!
//! Configuration comes from environment variables (a `.env` file is
//! honored when present); the first CLI argument, when given, overrides
//! the configured port to match how supervising processes launch the
//! daemon.

use std::env;
use std::path::PathBuf;

use crate::core::tts::fishaudio::FISHAUDIO_TTS_URL;

/// Configuration for the TTS service daemon.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory receiving generated audio artifacts; created at startup,
    /// emptied by `clear_temp_files`.
    pub audio_dir: PathBuf,
    /// fish.audio endpoint; overridable for proxy and test setups.
    pub fishaudio_url: String,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    /// Returns an error when `VOXD_PORT` is set but not a valid port.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let _ = dotenvy::dotenv();

        let host = env::var("VOXD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("VOXD_PORT")
            .unwrap_or_else(|_| "7563".to_string())
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;
        let audio_dir = env::var("VOXD_AUDIO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("audio"));
        let fishaudio_url =
            env::var("VOXD_FISHAUDIO_URL").unwrap_or_else(|_| FISHAUDIO_TTS_URL.to_string());

        Ok(Self {
            host,
            port,
            audio_dir,
            fishaudio_url,
        })
    }

    /// Socket address string the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
