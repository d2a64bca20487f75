use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::handlers::ws;
use crate::state::AppState;

/// Create the WebSocket router.
///
/// The protocol lives on a single endpoint at the server root; clients
/// connect to `ws://host:port/` and speak the typed message protocol over
/// that one long-lived connection.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(ws::ws_tts_handler))
        .layer(TraceLayer::new_for_http())
}
