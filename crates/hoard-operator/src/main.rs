//! hoard operator - reconciles cacheable Datasets

mod cli;
mod runner;
mod startup;

use clap::Parser;
use kube::Client;

use hoard_common::registry::ResourceRegistry;
use hoard_common::telemetry::{init_telemetry, shutdown_telemetry};

use crate::cli::{Cli, ControllerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let registry = ResourceRegistry::with_hoard_types();

    if cli.crd {
        println!("{}", startup::render_crds(&registry)?);
        return Ok(());
    }

    let args = cli.controller_args();

    init_telemetry(args.telemetry_config())?;
    let result = run_controller(&registry, &args).await;
    if let Err(e) = &result {
        tracing::error!(error = ?e, "operator exited with error");
    }
    shutdown_telemetry();
    result
}

async fn run_controller(registry: &ResourceRegistry, args: &ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting hoard operator");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    startup::ensure_crds_installed(&client, registry).await?;
    runner::run_dataset_controller(client, args.controller_config()).await;
    Ok(())
}
