use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cfr_core::ProcessingDate;
use cfr_sync::RunConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cfr-cli")]
#[command(about = "Courier fee reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process every store for every processing date.
    Run(RunArgs),
    /// Rebuild the final file of one date from its batch files.
    Merge {
        #[arg(long, value_name = "DD/MM/YYYY")]
        date: String,
        #[command(flatten)]
        paths: PathArgs,
    },
    /// Remove leftover batch files.
    Clean {
        #[command(flatten)]
        paths: PathArgs,
    },
}

#[derive(Debug, Default, Args)]
struct PathArgs {
    #[arg(long)]
    workspace_root: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    fixtures: Option<PathBuf>,
    #[command(flatten)]
    paths: PathArgs,
}

impl PathArgs {
    fn apply(self, config: &mut RunConfig) {
        if let Some(root) = self.workspace_root {
            config.workspace_root = root;
        }
    }
}

impl RunArgs {
    fn apply(self, config: &mut RunConfig) {
        if let Some(workers) = self.workers {
            config.worker_count = workers.max(1);
        }
        if let Some(fixtures) = self.fixtures {
            config.fixtures_dir = fixtures;
        }
        self.paths.apply(config);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = RunConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            args.apply(&mut config);
            let summary = cfr_sync::run_with_config(config)
                .await
                .inspect_err(|err| tracing::error!(error = %format!("{err:#}"), "run aborted"))?;
            for day in &summary.dates {
                println!(
                    "{}: success={} warning={} pending={} rows={} fee_total={}",
                    day.date,
                    day.counts.success,
                    day.counts.success_with_quality_warning,
                    day.counts.pending,
                    day.rows,
                    day.fee_totals.courier_fee_total
                );
            }
            println!(
                "run complete: run_id={} stores={} batches={} reports={}",
                summary.run_id, summary.active_stores, summary.batches, summary.reports_dir
            );
        }
        Commands::Merge { date, paths } => {
            paths.apply(&mut config);
            let date = ProcessingDate::parse(&date)
                .with_context(|| format!("invalid date {date:?}, expected DD/MM/YYYY"))?;
            match cfr_sync::merge_date_from_disk(&config, date).await? {
                Some(merged) => println!(
                    "merged {} rows into {} (snapshot {})",
                    merged.final_file.rows,
                    merged.final_file.path.display(),
                    merged.snapshot_path.display()
                ),
                None => println!("no batch files found for {date}"),
            }
        }
        Commands::Clean { paths } => {
            paths.apply(&mut config);
            let removed = cfr_sync::clean(&config).await?;
            println!("removed {removed} batch files");
        }
    }

    Ok(())
}
