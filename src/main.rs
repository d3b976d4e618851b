//! Keyboardia session coordinator binary
//!
//! Parses CLI configuration, sets up structured logging, builds the
//! [`keyboardia::server`] router, and serves it with graceful shutdown on
//! ctrl-c/SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use keyboardia::persistence::Persistence;
use keyboardia::registry::SessionRegistry;
use keyboardia::server;
use keyboardia::version::Version;

/// Keyboardia is the authoritative coordinator for a real-time
/// collaborative step sequencer.
#[derive(Parser, Debug)]
#[command(version = format!("{}", Version::default()))]
struct Cli {
    /// IP address to bind the WebSocket server to.
    #[arg(short, long, default_value_t = String::from("0.0.0.0"))]
    ip: String,

    /// Port to bind the WebSocket server to.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Directory for hot/cold-tier session persistence. Defaults to an
    /// OS-convention data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Disable colors. Overrides the `NO_COLOR` environment variable.
    #[arg(long = "no-color", default_value_t = false)]
    disable_colors: bool,
}

/// Default data directory, following the OS-convention lookup.
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .expect("documentation states that this function should work on all platforms")
        .join("keyboardia")
}

/// Directory for rolling daily log files. Kept alongside session data so a
/// bug report only needs one directory.
fn log_path(data_dir: &PathBuf) -> PathBuf {
    data_dir.join("logs")
}

/// Initialize the tracing subscriber: a colored stdout layer plus a
/// rolling daily file layer, matching `harmonia.rs::setup_logging_system`.
fn setup_logging_system(cli: &Cli, data_dir: &PathBuf) -> tracing_appender::non_blocking::WorkerGuard {
    let log_file_appender = tracing_appender::rolling::daily(log_path(data_dir), "logs");
    let (log_file_appender, guard) = tracing_appender::non_blocking(log_file_appender);

    let disable_colors = cli.disable_colors
        || std::env::var("NO_COLOR")
            .map(|x| !x.is_empty())
            .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyboardia=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(!disable_colors)
                .and_then(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(log_file_appender),
                ),
        )
        .init();
    guard
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    if let Err(err) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {data_dir:?}: {err}");
        return ExitCode::FAILURE;
    }

    let _guard = setup_logging_system(&cli, &data_dir);
    tracing::info!("starting up version {}", Version::default());

    let persistence = match Persistence::open(&data_dir).await {
        Ok(persistence) => persistence,
        Err(err) => {
            tracing::error!(error = %err, "failed to open persistence store");
            return ExitCode::FAILURE;
        }
    };
    let registry = SessionRegistry::new(persistence);

    let app = server::router(registry.clone());

    let ip: IpAddr = match cli.ip.parse() {
        Ok(ip) => ip,
        Err(err) => {
            tracing::error!(error = %err, "invalid --ip");
            return ExitCode::FAILURE;
        }
    };
    let addr = SocketAddr::from((ip, cli.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(_) => {
            tracing::error!("address already in use at {addr}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("keyboardia coordinator listening on ws://{addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    registry.shutdown_all().await;
    ExitCode::SUCCESS
}

/// Wait for ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL-C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install terminate signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
