use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::core::tts::{ProviderName, TextToSpeech};

/// The currently installed provider.
///
/// At most one instance is ever active. An in-flight generation holds its
/// own `Arc` clone of `tts`, so swapping the slot never redirects or
/// tears down a running call; the old instance is dropped when the last
/// handle goes away.
pub struct ActiveProvider {
    pub name: ProviderName,
    pub tts: Arc<dyn TextToSpeech>,
}

/// Application state shared across connection handlers.
pub struct AppState {
    pub config: ServerConfig,
    /// Single active-provider slot. Writers (the load handler) hold the
    /// write lock across the whole free/install/init swap.
    pub provider: RwLock<Option<ActiveProvider>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider: RwLock::new(None),
        })
    }
}
