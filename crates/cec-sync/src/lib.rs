//! Configuration, reconciliation and orchestration of category sync runs.

mod config;
mod orchestrator;
mod reconcile;
mod report;
mod scheduler;

pub use config::{CategorySource, PipelineConfig, SourceEntry, SourceRegistry, SyncConfig};
pub use orchestrator::{
    CancellationFlag, CategoryError, Orchestrator, OrchestratorError, RunSelection,
};
pub use reconcile::{plan_changes, reconcile, ReconcilePlan};
pub use report::{
    report_recent_markdown, CategoryFailure, CategoryOutcome, CategoryReport, FailureKind,
    ReportWriter, RunReport, RunStats, RunStatus, SourceSummary, RUN_BRIEF_FILE, RUN_REPORT_FILE,
};
pub use scheduler::maybe_build_scheduler;

pub const CRATE_NAME: &str = "cec-sync";
