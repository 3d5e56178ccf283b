//! codex-console - supervised interactive sessions over HTTP/WebSocket.
//!
//! Each session runs the configured command under its own PTY. Operators
//! create sessions over HTTP, attach over WebSocket, and can panic-stop a
//! session at any time.

use clap::Parser as ClapParser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codex_console::{
    api,
    config::Config,
    manager::SessionManager,
    metrics::Metrics,
};

#[derive(ClapParser, Debug)]
#[command(name = "codex-console", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.config;
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }

    let metrics = std::sync::Arc::new(Metrics::new());
    let manager = SessionManager::new(config.session_config(), config.max_concurrent, metrics);
    let state = api::AppState::new(manager.clone());
    let app = api::router(
        state,
        api::RouterConfig {
            require_proxy: config.require_proxy,
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        command = %config.command,
        max_concurrent = manager.max_concurrent(),
        require_proxy = config.require_proxy,
        "codex-console listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown();
    tracing::info!("codex-console stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "codex_console=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(?e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(?e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
