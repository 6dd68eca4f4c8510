//! Zentinel Mock Registry - CLI Entry Point
//!
//! Starts every server declared in a batch file inside one context, prints
//! the published properties and stops everything on Ctrl-C.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_mock_registry::{
    BatchFile, ConfigurationResolver, LifecycleCoordinator, TestContext, WireMockFactory,
};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-mock-registry",
    about = "Run named mock HTTP servers declared in a YAML batch file",
    version
)]
struct Args {
    /// Path to the batch file
    #[arg(short, long, default_value = "mock-servers.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print an example batch file and exit
    #[arg(long)]
    print_config: bool,

    /// Validate the batch file and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-servers.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    if !args.config.exists() {
        anyhow::bail!("Batch file not found: {:?}", args.config);
    }
    info!(path = ?args.config, "Loading batch file");
    let batch = BatchFile::from_file(&args.config)?;

    if args.validate {
        println!(
            "Batch file is valid ({} servers defined)",
            batch.servers.len()
        );
        return Ok(());
    }

    let coordinator = LifecycleCoordinator::new(WireMockFactory::new())
        .with_resolver(ConfigurationResolver::from_settings(&batch.settings));
    let ctx = TestContext::new();

    let instances = match coordinator.register_source(&*ctx, &batch).await {
        Ok(instances) => instances,
        Err(e) => {
            error!(error = %e, "Failed to start mock servers");
            ctx.close().await;
            return Err(e.into());
        }
    };

    for instance in &instances {
        println!("{:<24} {}", instance.name, instance.base_url);
    }
    for (key, value) in ctx.environment() {
        println!("{}={}", key, value);
    }

    info!(servers = instances.len(), "Mock servers running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let report = ctx.close().await;
    for failure in &report.failures {
        error!(error = %failure, "Mock server did not stop cleanly");
    }
    if !report.is_clean() {
        anyhow::bail!("{} mock servers failed to stop", report.failures.len());
    }
    info!(stopped = report.completed.len(), "All mock servers stopped");
    Ok(())
}
