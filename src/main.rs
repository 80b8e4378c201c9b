use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::config::{self, Cli, Config};
use chat_relay::provider;
use chat_relay::server::api::{build_router, AppState};
use chat_relay::server::metrics::RelayMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Export `.env` before parsing so CLI env fallbacks and API keys see it.
    let dotenv = config::load_dotenv(Path::new(".env"));

    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "chat_relay=debug,tower_http=debug"
    } else {
        "chat_relay=info,tower_http=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("chat-relay v{}", env!("CARGO_PKG_VERSION"));

    if dotenv? {
        info!("Loaded environment from .env");
    }

    // Load configuration. A missing API key stops the process here.
    let config = Arc::new(Config::from_cli(&cli)?);

    info!(
        provider = %config.provider,
        listen = config.server.listen,
        public_dir = %config.server.public_dir.display(),
        request_timeout_secs = config.server.request_timeout_secs,
        "Configuration loaded"
    );

    if !config.server.public_dir.is_dir() {
        warn!(
            "Public directory {:?} does not exist; static files will 404",
            config.server.public_dir
        );
    }

    let provider = provider::from_config(&config)?;
    info!(
        provider = provider.name(),
        text_model = provider.models().text_model,
        vision_model = provider.models().vision_model,
        "Provider ready"
    );

    let metrics = RelayMetrics::new()?;
    let state = Arc::new(AppState::new(config.clone(), provider, metrics));

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen_addr()?;
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Server is running on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
