use anyhow::Result;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod backoff;
mod cluster;
mod config;
mod error;
mod interconnect_controller;
mod metrics;
mod status;
#[cfg(test)]
mod testing;
mod workload;

use config::OperatorConfig;
use interconnect_controller::InterconnectController;
use metrics::Metrics;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::from_env()?;
    init_tracing(config.json_logs);

    info!("Starting interconnect-operator...");

    let client = Client::try_default().await?;
    let metrics = Metrics::new()?;

    // Serve /metrics and /healthz
    let metrics_addr = config.metrics_addr;
    let server_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr, server_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Runs until SIGTERM or ctrl-c
    let controller = InterconnectController::new(client, config, metrics);
    controller.run().await?;

    info!("Shutdown signal received, exiting...");
    Ok(())
}
