use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nightlist_core::DayOfWeek;
use nightlist_storage::EventStore;
use nightlist_sync::{
    event_line, weekly_summary_markdown, RenderMode, RunController, RunOutcome, ScrapeConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nightlist")]
#[command(about = "Scrape tonight's EDM listings into weekday buckets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the listing page once and persist the results.
    Run,
    /// Print the latest pointer document.
    Status,
    /// Print one stored weekday bucket.
    Day {
        day: DayOfWeek,
        #[arg(long)]
        json: bool,
    },
    /// Markdown summary of every stored weekday.
    Week,
    /// Extract events from a saved HTML page without writing anything.
    Extract { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ScrapeConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let controller = RunController::from_config(&config)?;
            let outcome = controller.run_once().await;
            match &outcome {
                RunOutcome::Succeeded(report) => println!(
                    "run complete: run_id={} day={} events={} bucket={}",
                    report.run_id,
                    report.day,
                    report.events_written,
                    report.day_bucket.display()
                ),
                RunOutcome::PartialSuccess { report, error } => {
                    println!(
                        "run partially complete: run_id={} day={} events={} bucket={}",
                        report.run_id,
                        report.day,
                        report.events_written,
                        report.day_bucket.display()
                    );
                    eprintln!("latest pointer not replaced: {error}");
                }
                RunOutcome::Failed {
                    run_id,
                    stage,
                    error,
                } => eprintln!(
                    "run failed: run_id={run_id} stage={stage} kind={} error={error}",
                    error.kind()
                ),
            }
            std::process::exit(outcome.exit_code());
        }
        Commands::Status => {
            let document = store(&config).load_latest(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        Commands::Day { day, json } => match store(&config).load_day(day).await? {
            Some(events) if json => println!("{}", serde_json::to_string_pretty(&events)?),
            Some(events) => {
                println!("{day}: {} events", events.len());
                for event in &events {
                    println!("{}", event_line(event));
                }
            }
            None => eprintln!("no scrape stored for {day}"),
        },
        Commands::Week => {
            let week = store(&config).load_week().await?;
            println!("{}", weekly_summary_markdown(&week));
        }
        Commands::Extract { file } => {
            let html = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let offline = ScrapeConfig {
                render_mode: RenderMode::Snapshot,
                snapshot_file: Some(file),
                ..config
            };
            let controller = RunController::from_config(&offline)?;
            let processed = controller.preview(&html, Utc::now())?;
            eprintln!(
                "cards={} skipped={} drafts_skipped={} duplicates={} events={}",
                processed.cards_seen,
                processed.cards_skipped,
                processed.drafts_skipped,
                processed.duplicates_dropped,
                processed.events.len()
            );
            println!("{}", serde_json::to_string_pretty(&processed.events)?);
        }
    }

    Ok(())
}

fn store(config: &ScrapeConfig) -> EventStore {
    EventStore::new(config.data_dir.clone()).with_latest_path(config.latest_path())
}
