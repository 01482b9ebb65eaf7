//! TopPet Server - Main entry point.
//!
//! This binary starts the contest broadcast hub with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background rate limiter cleanup
//!
//! # Configuration
//!
//! See [`toppet_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (no auth)
//! TOPPET_UNSAFE_NO_AUTH=true cargo run --bin toppet-server
//!
//! # Production mode
//! TOPPET_PUBLIC_KEYS="vote-service:base64pubkey" \
//! TOPPET_USER_TOKENS="token1:17,token2:42" \
//! PORT=8080 \
//! cargo run --release --bin toppet-server
//! ```

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use toppet_server::config::Config;
use toppet_server::error::{Result, ServerError};
use toppet_server::routes::{create_router, AppState};

/// Cleanup interval for stale rate limiter entries (30 seconds).
const RATE_LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// How long open connections get to finish once shutdown starts.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(ServerError::Config(err)) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled):");
            eprintln!("  TOPPET_USER_TOKENS     - Format: token1:user_id1,token2:user_id2");
            eprintln!("  TOPPET_PUBLIC_KEYS     - Format: source1:pubkey1,source2:pubkey2");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                   - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG               - Log level filter (default: info)");
            eprintln!("  TOPPET_UNSAFE_NO_AUTH  - Disable auth (dev only, set to 'true')");
            eprintln!("  TOPPET_KEEPALIVE_SECS  - WebSocket ping interval, 0 disables");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(error = %err, "Server failed");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let auth_mode = if config.unsafe_no_auth {
        "disabled (UNSAFE)"
    } else {
        "enabled"
    };
    info!(
        port = config.port,
        auth_mode = auth_mode,
        user_token_count = config.user_tokens.len(),
        public_key_count = config.public_keys.len(),
        "TopPet hub starting"
    );

    let port = config.port;
    let state = AppState::new(config);

    let ingest_cleanup = state
        .ingest_limiter
        .spawn_cleanup_task("ingest", RATE_LIMITER_CLEANUP_INTERVAL);
    let chat_cleanup = state
        .chat_limiter
        .spawn_cleanup_task("chat", RATE_LIMITER_CLEANUP_INTERVAL);
    info!(
        interval_secs = RATE_LIMITER_CLEANUP_INTERVAL.as_secs(),
        "Rate limiter cleanup tasks started"
    );

    let hub = state.hub.clone();
    let app = create_router(state);

    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(address)
        .await
        .map_err(|err| ServerError::bind(address, err))?;
    info!(address = %address, "Server listening");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .into_future();
    info!("Server ready to accept connections");

    // Open WebSockets hold graceful shutdown until they end; bound the wait.
    let result = tokio::select! {
        result = served => result.map_err(ServerError::Serve),
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT).await;
        } => {
            warn!(
                timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
                "Connections still open after shutdown timeout, stopping"
            );
            Ok(())
        }
    };

    ingest_cleanup.abort();
    chat_cleanup.abort();
    let stats = hub.stats().await;
    info!(
        connections = stats.connections,
        rooms = stats.rooms,
        "Server shutting down"
    );

    result
}

/// Initializes the tracing subscriber with JSON formatting.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` level if not set.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
