use csi_driver::config::Config;
use csi_driver::{metrics, services};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));

    // Initialize the logger. RUST_LOG wins; the default keeps the driver
    // chatty enough to follow stage/publish flows.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        controller = config.run_controller,
        node = config.run_node,
        "starting rds-csi"
    );

    if let Some(addr) = config.metrics_endpoint {
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr).await {
                error!(error = %e, "metrics endpoint failed");
            }
        });
    }

    // Note that this tries a kubeconfig file first, then falls back on an
    // in-cluster configuration.
    let client = kube::Client::try_default().await?;

    services::serve(config, client, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for the shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
