//! WebSocket protocol surface: envelope validation, message routing,
//! provider lifecycle handlers and the generation coordinator.

mod generate_handler;
mod handler;
pub mod messages;
mod processor;
mod provider_handler;

pub use handler::ws_tts_handler;
