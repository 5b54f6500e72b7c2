use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use ephem_storage::PgEphemerisStore;
use ephem_sync::{
    build_pipeline, load_env_files, run_scheduler, verify_month, write_database_url_from_env,
    BatchRunner, PipelineConfig, RunOptions, RunOutcome,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ephem")]
#[command(about = "Daily technology ephemeris generator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate the ephemeris for one date (default: tomorrow in the configured zone).
    Generate(GenerateArgs),
    /// Regenerate a list of dates in order.
    Backfill(BackfillArgs),
    /// Report which days of a month have an ephemeris.
    Verify(VerifyArgs),
    /// Apply SQL migrations to the write database.
    Migrate,
    /// Serve today's ephemeris over HTTP.
    Serve,
    /// Run the daily generation on a cron schedule.
    Schedule,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Target date as YYYY-MM-DD.
    #[arg(long, env = "TARGET_DATE")]
    date: Option<String>,
    /// Regenerate even when the date already has a record.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct BackfillArgs {
    /// Dates as YYYY-MM-DD, processed in the given order.
    #[arg(required = true)]
    dates: Vec<String>,
    #[arg(long)]
    force: bool,
    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    year: i32,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    month: u32,
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_files();
    init_tracing();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or_else(|| {
        Commands::Generate(GenerateArgs {
            date: std::env::var("TARGET_DATE").ok(),
            force: false,
        })
    });

    match command {
        Commands::Generate(args) => {
            let config = PipelineConfig::from_env()?;
            let pipeline = build_pipeline(&config).await?;
            let outcome = pipeline
                .run(args.date.as_deref(), RunOptions { force: args.force })
                .await?;
            match outcome {
                RunOutcome::Skipped { key } => {
                    println!("ephemeris for {key} already exists, nothing to do")
                }
                RunOutcome::Persisted { key, write, record } => println!(
                    "ephemeris for {key} saved ({write:?}): [{}] {}",
                    record.category, record.title
                ),
            }
        }
        Commands::Backfill(args) => {
            let config = PipelineConfig::from_env()?;
            let pipeline = build_pipeline(&config).await?;
            let summary = BatchRunner::new(&pipeline)
                .with_delay(config.batch_delay)
                .with_options(RunOptions { force: args.force })
                .run(&args.dates)
                .await;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.to_text());
            }
            if !summary.is_success() {
                bail!("{} of {} dates failed", summary.failed, summary.total);
            }
        }
        Commands::Verify(args) => {
            let store = PgEphemerisStore::connect(&write_database_url_from_env()?).await?;
            let coverage = verify_month(&store, args.year, args.month).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&coverage)?);
            } else {
                println!("{}", coverage.to_text());
            }
        }
        Commands::Migrate => {
            let store = PgEphemerisStore::connect(&write_database_url_from_env()?).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            ephem_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = PipelineConfig::from_env()?;
            let pipeline = Arc::new(build_pipeline(&config).await?);
            run_scheduler(pipeline, &config.cron).await?;
        }
    }

    Ok(())
}
