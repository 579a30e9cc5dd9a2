mod cli;
mod observability;
mod router;

use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use tensorzero_core::cache::InferenceCache;
use tensorzero_core::config_parser::Config;
use tensorzero_core::gateway_util::AppStateData;
use tensorzero_core::observability::ClickHouseConnectionInfo;

use cli::{Args, Command};

#[tokio::main]
async fn main() {
    observability::setup_logs();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(cli::EXIT_USAGE_ERROR);
        }
    };

    if matches!(args.command, Some(Command::Validate)) {
        match load_config(&args) {
            Ok(_) => {
                tracing::info!("Config is valid");
                std::process::exit(cli::EXIT_OK);
            }
            Err(e) => {
                tracing::error!("Config is invalid: {e}");
                std::process::exit(cli::EXIT_CONFIG_ERROR);
            }
        }
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {e}");
            std::process::exit(cli::EXIT_CONFIG_ERROR);
        }
    };
    let config = Arc::new(config);

    let prometheus_address = std::env::var("TENSORZERO_PROMETHEUS_ADDRESS")
        .ok()
        .and_then(|addr| addr.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9090)));
    observability::setup_metrics(prometheus_address).expect_pretty("Failed to set up metrics");

    let clickhouse = match std::env::var("CLICKHOUSE_URL") {
        Ok(url) => ClickHouseConnectionInfo::new(&url, "tensorzero").expect_pretty("Invalid CLICKHOUSE_URL"),
        Err(_) => {
            tracing::warn!(
                "CLICKHOUSE_URL is not set; inference and feedback records will not be persisted."
            );
            ClickHouseConnectionInfo::new_disabled()
        }
    };

    let cache = Arc::new(InferenceCache::default());
    let app_state =
        AppStateData::new(config.clone(), clickhouse, cache).expect_pretty("Failed to initialize app state");

    let router = router::build_router(app_state);

    let bind_address: SocketAddr = config
        .gateway
        .bind_address
        .parse()
        .expect_pretty("Invalid [gateway.bind_address] in config");

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to {bind_address}: {e}. Is another process already using port {}?",
                bind_address.port()
            );
            std::process::exit(cli::EXIT_INTERNAL_ERROR);
        }
        Err(e) => {
            tracing::error!("Failed to bind to {bind_address}: {e}");
            std::process::exit(cli::EXIT_INTERNAL_ERROR);
        }
    };

    tracing::info!("TensorZero Gateway listening on {bind_address}");
    tracing::info!("Prometheus metrics listening on {prometheus_address}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Server error");
}

fn load_config(args: &Args) -> Result<Config, tensorzero_core::Error> {
    match &args.config_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                tensorzero_core::ErrorDetails::Config {
                    message: format!("Failed to read config file `{}`: {e}", path.display()),
                }
            })?;
            let base_path = path.parent().unwrap_or_else(|| Path::new("."));
            Config::load_from_toml(&contents, base_path)
        }
        None => {
            tracing::warn!(
                "No --config-file provided; starting with no functions, models, or tools configured. Use --config-file path/to/tensorzero.toml to configure the gateway."
            );
            Config::load_from_toml("", Path::new("."))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}

/// Escape hatch for initialization-time failures: `main` is the one place in this workspace
/// allowed to log-and-exit instead of propagating a `Result`.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(cli::EXIT_INTERNAL_ERROR);
            }
        }
    }
}
