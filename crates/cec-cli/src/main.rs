use std::process::ExitCode;

use anyhow::{Context, Result};
use cec_core::EquipmentCategory;
use cec_sync::{
    maybe_build_scheduler, report_recent_markdown, CancellationFlag, Orchestrator, RunSelection,
    SyncConfig,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cec-cli")]
#[command(about = "CEC solar equipment list ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and reconcile equipment lists.
    Sync {
        /// Restrict the run to these categories; repeatable.
        #[arg(long = "category", value_name = "CATEGORY")]
        categories: Vec<EquipmentCategory>,
    },
    /// Create or evolve every category table.
    Migrate,
    /// Show the stored columns of a category table.
    Columns { category: EquipmentCategory },
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run syncs on `CEC_SYNC_CRON` until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("cec=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { categories: vec![] }) {
        Commands::Sync { categories } => {
            let orchestrator = Orchestrator::from_sync_config(&config).await?;
            let selection = if categories.is_empty() {
                RunSelection::All
            } else {
                RunSelection::Only(categories)
            };

            let cancel = CancellationFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; categories not yet started will be skipped");
                    on_interrupt.cancel();
                }
            });

            let report = orchestrator.run_and_record(selection, &cancel).await?;
            orchestrator.store().close().await;
            for category in &report.categories {
                println!("{}", category.summary_line());
            }
            println!(
                "sync {:?}: run_id={} reports={}",
                report.status,
                report.run_id,
                config.reports_dir.join(report.run_id.to_string()).display()
            );
            return Ok(exit_code(report.status.exit_code()));
        }
        Commands::Migrate => {
            let orchestrator = Orchestrator::from_sync_config(&config).await?;
            orchestrator.migrate().await?;
            orchestrator.store().close().await;
            println!("migrated {} categories", orchestrator.registry().categories().count());
        }
        Commands::Columns { category } => {
            let orchestrator = Orchestrator::from_sync_config(&config).await?;
            let schema = orchestrator.registry().schema(category)?;
            orchestrator
                .store()
                .ensure_namespace(schema)
                .await
                .with_context(|| format!("preparing {category}"))?;
            for column in orchestrator.store().columns(schema).await? {
                println!(
                    "{}\t{}\t{}{}",
                    column.name,
                    column.declared_type,
                    if column.not_null { "NOT NULL" } else { "NULL" },
                    if column.primary_key { "\tPRIMARY KEY" } else { "" }
                );
            }
            orchestrator.store().close().await;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(&config.reports_dir, runs)?);
        }
        Commands::Schedule => {
            let orchestrator = Orchestrator::from_sync_config(&config).await?;
            let scheduling = SyncConfig {
                scheduler_enabled: true,
                ..config.clone()
            };
            let Some(sched) = maybe_build_scheduler(&orchestrator, &scheduling).await? else {
                return Ok(ExitCode::FAILURE);
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %scheduling.sync_cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            info!("scheduler stopping");
            orchestrator.store().close().await;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
