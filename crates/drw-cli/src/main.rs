use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use drw_sync::{SyncConfig, SyncError, SyncPipeline};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "drw")]
#[command(about = "Design review watch: scrape, enrich and store upcoming design reviews")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed, enrich every project and store the new ones.
    New {
        /// Drop the collection before loading.
        #[arg(long)]
        overwrite: bool,
    },
    /// Write the stored collection to a batch file.
    Export {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Replace the stored collection with a batch file.
    Import { path: PathBuf },
    /// Retry geocoding for records with a null latitude.
    ResolveGeo {
        /// Work on a batch file instead of the store.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Append newly published projects to a batch file.
    Update {
        path: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run `update` against the configured batch file on a schedule.
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("Hello world!");
        return ExitCode::SUCCESS;
    };

    match run(command, SyncConfig::from_env()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("command failed: {err:#}");
            eprintln!("error: {err:#}");
            let code = err.downcast_ref::<SyncError>().map_or(1, SyncError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(command: Commands, config: SyncConfig) -> Result<()> {
    match command {
        Commands::New { overwrite } => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let store = drw_sync::connect_store(&config).await?;
            let summary = pipeline.create_new(&store, overwrite).await?;
            println!(
                "new: run_id={} fetched={} inserted={} duplicates={} geocoded={} images={}",
                summary.run_id,
                summary.fetched,
                summary.inserted,
                summary.duplicates,
                summary.stages.geocoded,
                summary.stages.images_attached
            );
        }
        Commands::Export { path } => {
            let store = drw_sync::connect_store(&config).await?;
            let path = path.unwrap_or_else(|| config.export_path.clone());
            let summary = drw_sync::export_store(&store, &path).await?;
            println!("export: records={} path={}", summary.exported, summary.path);
        }
        Commands::Import { path } => {
            let store = drw_sync::connect_store(&config).await?;
            let summary = drw_sync::import_file(&store, &path).await?;
            println!(
                "import: records={} collection={}",
                summary.imported, summary.collection
            );
        }
        Commands::ResolveGeo { file } => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let summary = match file {
                Some(path) => pipeline.backfill_batch_file(&path).await?,
                None => {
                    let store = drw_sync::connect_store(&config).await?;
                    pipeline.backfill_store(&store).await?
                }
            };
            println!(
                "resolve-geo: scanned={} attempted={} resolved={}",
                summary.scanned, summary.attempted, summary.resolved
            );
        }
        Commands::Update { path, out } => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let summary = pipeline.update_batch_file(&path, out.as_deref()).await?;
            println!(
                "update: run_id={} fetched={} appended={} last_pub_date={}",
                summary.run_id,
                summary.fetched,
                summary.appended,
                summary
                    .last_pub_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        Commands::Watch => drw_sync::run_watch(&config).await?,
    }

    Ok(())
}
