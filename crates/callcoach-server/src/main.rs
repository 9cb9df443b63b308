//! Callcoach server binary.
//!
//! Starts the axum signaling server with structured logging, the media
//! worker pool, and graceful shutdown on SIGTERM/SIGINT.

use callcoach_pipeline::llm::gemini::GeminiChatModel;
use callcoach_pipeline::stt::deepgram::DeepgramConnector;
use callcoach_server::{app, config, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("CALLCOACH_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

/// Reads a vendor API key, warning when it is absent.
fn vendor_api_key(var: &str) -> String {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            tracing::warn!(var, "vendor api key not set; sessions will fail to connect");
            String::new()
        }
    }
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Vendor backends
    let stt_connector = Arc::new(DeepgramConnector::new(vendor_api_key("DEEPGRAM_API_KEY")));
    let chat_model = Arc::new(GeminiChatModel::new(
        vendor_api_key("GEMINI_API_KEY"),
        config.llm.clone(),
    ));

    let addr = SocketAddr::new(config.server.host, config.server.port);

    // Build the resource graph: worker pool, registries, gateway.
    let state = AppState::new(config, stt_connector, chat_model);
    let app = app(state);

    tracing::info!(%addr, "starting callcoach server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("callcoach server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
