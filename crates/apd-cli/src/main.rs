use std::path::PathBuf;

use anyhow::Result;
use apd_adapters::{AisGeocoder, PortalReportClient, PortalUrlScraper, S3Bucket};
use apd_etl::{EtlConfig, EtlPipeline};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "apd")]
#[command(about = "Asbestos permit dashboard data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Log at debug level unless RUST_LOG overrides it.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the incremental daily update.
    Update {
        /// Lookback window for the report download, in days.
        #[arg(long, default_value_t = 30)]
        ndays: i64,
    },
    /// Rebuild the published datasets from a raw export file.
    Etl {
        /// Raw report to rebuild from; defaults to the newest export.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Keep going when addresses cannot be geocoded, for inspection runs.
        #[arg(long)]
        allow_unresolved_geocodes: bool,
    },
}

fn build_pipeline(config: EtlConfig) -> Result<EtlPipeline> {
    Ok(EtlPipeline::new(
        config,
        Box::new(AisGeocoder::from_env()?),
        Box::new(PortalReportClient::from_env()?),
        Box::new(PortalUrlScraper::from_env()?),
        Box::new(S3Bucket::from_env()?),
    )?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = EtlConfig::from_env();
    match cli.command {
        Commands::Update { ndays } => {
            config.lookback_days = ndays;
            let mut pipeline = build_pipeline(config)?;
            let summary = pipeline.run_update().await?;
            println!(
                "update complete: run_id={} permits={} schools={} refreshed={} appended={}",
                summary.run_id,
                summary.permits_published,
                summary.schools_published,
                summary.refreshed,
                summary.appended
            );
        }
        Commands::Etl {
            file,
            allow_unresolved_geocodes,
        } => {
            config.allow_unresolved_geocodes |= allow_unresolved_geocodes;
            let mut pipeline = build_pipeline(config)?;
            let summary = pipeline.run_etl(file).await?;
            println!(
                "etl complete: run_id={} permits={} schools={}",
                summary.run_id, summary.permits_published, summary.schools_published
            );
        }
    }

    Ok(())
}
