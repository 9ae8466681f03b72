mod gateway;
mod git;
mod metrics;
mod settings;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::gateway::cgi::GitHttpBackend;
use crate::gateway::handler::{create_router, GatewayState};
use crate::metrics::MetricsRegistry;
use crate::settings::SettingsStore;

/// Upper bound on concurrently running CGI backend processes.
const MAX_CONCURRENT_CGI: usize = 32;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitbridge", about = "Git smart-HTTP gateway backed by git-http-backend")]
struct Cli {
    /// Path to the JSON settings file (created with defaults when absent).
    #[arg(short, long, default_value = "BackendSettings.json")]
    settings: String,

    /// Socket address for the HTTP listener.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(settings_path = %cli.settings, "starting gitbridge");

    // ---- Settings store ----
    let store = Arc::new(SettingsStore::open(&cli.settings)?);
    let metrics = MetricsRegistry::new();

    // Hook order matters: migration transforms each candidate snapshot
    // before it is persisted; provisioning side effects run before any
    // other observer sees the committed snapshot.
    store.before_persist(gateway::auth::migrate_clear_passwords);
    store.on_change(git::provision::ensure_declared_repositories);
    store.on_change({
        let reloads = metrics.settings_reloads_total.clone();
        move |_| {
            reloads.inc();
        }
    });

    // ---- Tool resolution (fatal on failure) ----
    let tools = git::resolve_tools(&store.current())
        .context("cannot serve repositories without git and git-http-backend")?;
    tracing::info!(
        git = %tools.command_file_path.display(),
        backend = %tools.backend_file_path.display(),
        "resolved version-control tools"
    );

    // Committing the resolved paths also migrates any clear-text password
    // and provisions every repository declared in the access rights.
    store.update(move |s| tools.apply(s), true)?;

    // ---- Watch for external settings edits ----
    store.watch()?;

    // ---- HTTP server ----
    let state = Arc::new(GatewayState {
        settings: Arc::clone(&store),
        cgi: Arc::new(GitHttpBackend::new(MAX_CONCURRENT_CGI)),
        metrics,
    });
    let app = create_router(state);

    let listen_addr: SocketAddr = cli.listen.parse().context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    // Release the file watcher before the store goes away.
    store.close();
    tracing::info!("gitbridge shut down cleanly");
    Ok(())
}
