use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobtrack_storage::load_state;
use jobtrack_sync::{run_guarded_from_env, RunOutcome, TrackerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "jobtrack")]
#[command(about = "Jobs tracker: reconcile scraped listings, export snapshots, notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape (if configured), reconcile and notify once.
    Run,
    /// Serve the JSON trigger API.
    Serve,
    /// Print the persisted run state.
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => match run_guarded_from_env().await? {
            RunOutcome::Completed(report) => {
                println!(
                    "run complete: run_id={} raw={} jobs={} new={} today={} soon={}",
                    report.run_id,
                    report.raw_jobs,
                    report.jobs,
                    report.new_jobs,
                    report.closing_today,
                    report.closing_soon
                );
            }
            RunOutcome::AlreadyRunning(holder) => match holder {
                Some(record) => println!("already running (pid {})", record.pid),
                None => println!("already running"),
            },
        },
        Commands::Serve => jobtrack_web::serve_from_env().await?,
        Commands::State => {
            let config = TrackerConfig::from_env();
            let state = load_state(&config.data().state()).await;
            let text = serde_json::to_string_pretty(&state).context("serializing run state")?;
            println!("{text}");
        }
    }

    Ok(())
}
