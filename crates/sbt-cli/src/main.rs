use anyhow::Result;
use clap::{Parser, Subcommand};
use sbt_adapters::ProfileSource;
use sbt_sync::{OutcomeStatus, TrackerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sbt-cli")]
#[command(about = "Skills badge tracker: scrape public profiles into a progress sheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the trigger endpoint (default).
    Serve,
    /// Run one sync over the profiles file and print the summary.
    Sync,
    /// Fetch and classify a single profile without touching the sheet.
    Fetch { url: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            sbt_web::serve_from_env().await?;
        }
        Commands::Sync => {
            let summary = sbt_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} urls={} inserted={} updated={} failed={}",
                summary.run_id, summary.urls, summary.inserted, summary.updated, summary.failed
            );
            for outcome in &summary.outcomes {
                if let OutcomeStatus::Failed { stage, reason } = &outcome.status {
                    eprintln!("line {} ({:?}): {}: {}", outcome.line, stage, outcome.url, reason);
                }
            }
        }
        Commands::Fetch { url } => {
            let source = sbt_sync::profile_source_from_config(&TrackerConfig::from_env()).await?;
            let record = source.fetch_profile(&url).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}
