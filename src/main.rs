//! # `dwh` command-line entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dwh_etl::{
    config::ConfigLoader,
    db,
    pipeline::{self, PipelineOptions},
    staging, telemetry,
};
use sea_orm::ConnectionTrait;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "dwh", version, about = "Song-play data warehouse loader")]
struct Cli {
    /// Directory holding the layered `.env` files.
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drop and recreate the staging and warehouse tables.
    CreateTables,
    /// Load the staging tables, then populate the warehouse tables.
    Etl,
    /// Print the row count of every table.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match cli.config_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    info!(profile = %config.profile, "configuration loaded");
    match config.redacted_json() {
        Ok(redacted) => debug!(config = %redacted, "effective configuration"),
        Err(err) => warn!(error = %err, "could not render configuration"),
    }

    let db = db::connect(&config)
        .await
        .context("connecting to the warehouse")?;
    db::health_check(&db)
        .await
        .context("warehouse health check")?;
    let options = PipelineOptions::from_config(&config, db.get_database_backend())?;
    info!(dialect = %options.dialect, "connected");

    match cli.command {
        Command::CreateTables => {
            let report = pipeline::create_tables(&db, &options).await?;
            info!(statements = report.statements, "tables created");
        }
        Command::Etl => {
            let source = staging::loader_from_config(&config)?;
            let report = pipeline::run_etl(&db, &options, source.as_ref()).await?;
            info!(
                staged_rows = report.staging.rows_affected,
                inserted_rows = report.transform.rows_affected,
                "etl complete"
            );
        }
        Command::Status => {
            for (table, rows) in pipeline::table_counts(&db).await? {
                println!("{table}\t{rows}");
            }
        }
    }

    db.close().await.context("closing the warehouse connection")?;
    Ok(())
}
