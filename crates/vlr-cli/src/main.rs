use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vlr_core::ResolutionStatus;
use vlr_reconcile::{
    report_runs_markdown, validate_store, CancelHandle, ReconcileConfig, ReconcilePipeline,
};

#[derive(Debug, Parser)]
#[command(name = "vlr-cli")]
#[command(about = "Venue link reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass over the store.
    Reconcile(ReconcileArgs),
    /// Load and validate a store without querying any provider.
    Validate {
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Print recent run summaries.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run reconciliation on the configured cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct ReconcileArgs {
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long)]
    providers: Option<PathBuf>,
    /// Reconcile in memory and report, without saving the store.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "vlr=info,info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = ReconcileConfig::from_env();

    match cli
        .command
        .unwrap_or(Commands::Reconcile(ReconcileArgs::default()))
    {
        Commands::Reconcile(args) => {
            if let Some(store) = args.store {
                config.store_path = store;
            }
            if let Some(providers) = args.providers {
                config.providers_file = providers;
            }
            config.dry_run = args.dry_run;
            let pipeline = ReconcilePipeline::new(config)?;

            let cancel = CancelHandle::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; letting in-flight lookups finish");
                    on_interrupt.cancel();
                }
            });

            let report = pipeline.run_once(cancel.token()).await?;
            let totals = report.summary.totals();
            println!(
                "reconcile complete: run_id={} accepted={} unchanged={} rejected={} ambiguous={} errored={} manual={} cancelled={} reports={}",
                report.summary.run_id,
                totals.accepted,
                totals.no_change(),
                totals.rejected,
                totals.ambiguous,
                totals.errored,
                totals.skipped_manual,
                report.summary.cancelled,
                report.reports_dir.display()
            );
        }
        Commands::Validate { store } => {
            let path = store.unwrap_or(config.store_path);
            let stats = validate_store(&path).await?;
            println!("{}: {} records, {} manual references", path.display(), stats.records, stats.manual);
            for provider_id in stats.providers.keys() {
                let counts = [
                    ResolutionStatus::Resolved,
                    ResolutionStatus::Unresolved,
                    ResolutionStatus::Ambiguous,
                    ResolutionStatus::Stale,
                ]
                .map(|status| format!("{status}={}", stats.count(provider_id, status)));
                println!("  {provider_id}: {}", counts.join(" "));
            }
        }
        Commands::Report { runs } => {
            let markdown = report_runs_markdown(runs, Some(config.workspace_root))?;
            println!("{markdown}");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(ReconcilePipeline::new(config)?);
            let cron = pipeline.config().reconcile_cron.clone();
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
