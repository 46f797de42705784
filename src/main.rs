use std::path::PathBuf;

use ::tracing::{error, info, info_span};
use anyhow::Result;
use clap::Parser;
use service::Service;

mod config;
#[cfg(test)]
mod integration_test;
mod proto;
mod service;
#[cfg(test)]
mod testing;
mod tracing;
mod volume_api;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::NodeConfig::from_path(&path)?,
        None => config::NodeConfig::from_env()?,
    };

    let tracing_provider = setup_tracing(&config).inspect_err(|e| {
        eprintln!("Error setting up tracing: {:?}", e);
    })?;
    let meter_provider = metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        std::time::Duration::from_secs(config.telemetry.metrics_interval_secs),
        &config.instance_id(),
        env!("CARGO_PKG_VERSION"),
    )?;

    let root_span = info_span!(
        "qsd-node",
        env = config.env,
        "qsd-instance" = config.instance_id()
    );
    let _guard = root_span.enter();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build_timestamp = env!("VERGEN_BUILD_TIMESTAMP"),
        "starting qsd-node"
    );

    match Service::new(config).await {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("Error starting service: {:?}", err);
            }
        }
        Err(err) => error!("Error creating service: {:?}", err),
    }

    // export telemetry before shutdown
    if let Some(meter_provider) = meter_provider {
        if let Err(err) = meter_provider.shutdown() {
            error!("Error shutting down meter provider: {:?}", err);
        }
    }
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    Ok(())
}
