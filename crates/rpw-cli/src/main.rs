use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rpw-cli")]
#[command(about = "Research Paper Watchlist command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle over the configured sources.
    Cycle,
    /// Stay resident and run cycles on the configured cron cadence.
    Watch,
    /// Print a markdown digest of the most recent cycle reports.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Cycle) {
        Commands::Cycle => {
            let summary = rpw_recon::run_cycle_once_from_env().await?;
            println!(
                "cycle complete: run_id={} sources={} candidates={} (rejected={}) retained={} new={} updated={} old={} notified={} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.candidate_records,
                summary.rejected_rows,
                summary.retained,
                summary.new,
                summary.updated,
                summary.old,
                summary.notified,
                summary.reports_dir
            );
        }
        Commands::Watch => {
            let config = rpw_recon::CycleConfig::from_env();
            let pipeline = rpw_recon::CyclePipeline::new(config);
            match pipeline.maybe_build_scheduler().await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    tracing::info!("scheduler running; press ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                }
                None => eprintln!("scheduler disabled; set RPW_SCHEDULER_ENABLED=1 to use watch"),
            }
        }
        Commands::Report { runs } => {
            let digest = rpw_recon::report_recent_cycles(runs, None)?;
            println!("{digest}");
        }
    }

    Ok(())
}
