use std::env;

use anyhow::anyhow;
use tokio::net::TcpListener;

use voxd::{routes, state::AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let mut config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;

    // The first CLI argument, when present, overrides the configured port.
    let mut args = env::args();
    let _ = args.next();
    if let Some(port_arg) = args.next() {
        config.port = port_arg
            .parse()
            .map_err(|_| anyhow!("Invalid first argument '{port_arg}': expected a port number"))?;
        if let Some(extra) = args.next() {
            anyhow::bail!("Unexpected argument '{extra}' after the port");
        }
    }

    tokio::fs::create_dir_all(&config.audio_dir).await?;

    let address = config.address();
    let app_state = AppState::new(config);
    let app = routes::ws::create_ws_router().with_state(app_state);

    let listener = TcpListener::bind(&address).await?;
    tracing::info!("TTS module listening on {address}");

    axum::serve(listener, app).await?;

    Ok(())
}
