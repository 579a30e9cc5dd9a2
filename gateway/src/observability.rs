//! Process-wide logging and metrics bootstrap: a `tracing-subscriber` JSON layer plus a
//! standalone Prometheus listener rather than a `/metrics` route on the main router.

use std::net::SocketAddr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn setup_logs() {
    let log_level = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gateway=debug,tensorzero_core=debug,warn".into());

    tracing_subscriber::registry()
        .with(log_level)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_target(false),
        )
        .init();
}

pub fn setup_metrics(prometheus_address: SocketAddr) -> Result<(), anyhow::Error> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(prometheus_address)
        .install()?;
    Ok(())
}
