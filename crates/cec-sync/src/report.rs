use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cec_core::{EquipmentCategory, FieldWarning, QuarantineEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

pub const RUN_REPORT_FILE: &str = "run_report.json";
pub const RUN_BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Partial,
}

impl RunStatus {
    /// Process exit code for a run that produced a report.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Complete => 0,
            RunStatus::Partial => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    SchemaDrift,
    MalformedSource,
    StoreCommit,
    /// The category task ended without reporting back.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub quarantined: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub location: String,
    pub sha256: String,
    pub bytes: usize,
    pub archived_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub category: EquipmentCategory,
    pub outcome: CategoryOutcome,
    pub failure: Option<CategoryFailure>,
    pub stats: RunStats,
    pub quarantine: Vec<QuarantineEntry>,
    pub warnings: Vec<FieldWarning>,
    pub unmapped_columns: Vec<String>,
    /// Sheet row numbers of the detected header and skipped units row.
    #[serde(default)]
    pub header_row: Option<usize>,
    #[serde(default)]
    pub units_row: Option<usize>,
    pub source: Option<SourceSummary>,
}

impl CategoryReport {
    pub fn new(category: EquipmentCategory, outcome: CategoryOutcome) -> Self {
        Self {
            category,
            outcome,
            failure: None,
            stats: RunStats::default(),
            quarantine: Vec::new(),
            warnings: Vec::new(),
            unmapped_columns: Vec::new(),
            header_row: None,
            units_row: None,
            source: None,
        }
    }

    pub fn failed(
        category: EquipmentCategory,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        let mut report = Self::new(category, CategoryOutcome::Failed);
        report.failure = Some(CategoryFailure {
            kind,
            message: message.into(),
        });
        report
    }

    pub fn summary_line(&self) -> String {
        match (&self.outcome, &self.failure) {
            (CategoryOutcome::Failed, Some(failure)) => format!(
                "{}: failed ({:?}): {}",
                self.category, failure.kind, failure.message
            ),
            (CategoryOutcome::Cancelled, _) => format!("{}: cancelled", self.category),
            _ => format!(
                "{}: inserted={} updated={} unchanged={} quarantined={}",
                self.category,
                self.stats.inserted,
                self.stats.updated,
                self.stats.unchanged,
                self.stats.quarantined
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub categories: Vec<CategoryReport>,
}

impl RunReport {
    pub fn category(&self, category: EquipmentCategory) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn status_for(categories: &[CategoryReport]) -> RunStatus {
        if categories
            .iter()
            .all(|c| c.outcome == CategoryOutcome::Succeeded)
        {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        }
    }

    pub fn brief_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# CEC Equipment Sync\n");
        let _ = writeln!(out, "- Run ID: `{}`", self.run_id);
        let _ = writeln!(out, "- Started: {}", self.started_at);
        let _ = writeln!(out, "- Finished: {}", self.finished_at);
        let _ = writeln!(out, "- Status: {:?}\n", self.status);
        let _ = writeln!(
            out,
            "| Category | Outcome | Inserted | Updated | Unchanged | Quarantined |"
        );
        let _ = writeln!(out, "|---|---|---:|---:|---:|---:|");
        for c in &self.categories {
            let _ = writeln!(
                out,
                "| {} | {:?} | {} | {} | {} | {} |",
                c.category,
                c.outcome,
                c.stats.inserted,
                c.stats.updated,
                c.stats.unchanged,
                c.stats.quarantined
            );
        }

        for c in &self.categories {
            if c.failure.is_none()
                && c.units_row.is_none()
                && c.quarantine.is_empty()
                && c.warnings.is_empty()
            {
                continue;
            }
            let _ = writeln!(out, "\n## {}\n", c.category);
            if let Some(failure) = &c.failure {
                let _ = writeln!(out, "- Failure ({:?}): {}", failure.kind, failure.message);
            }
            if let Some(row) = c.units_row {
                let _ = writeln!(out, "- Units row {row} skipped");
            }
            for entry in &c.quarantine {
                let _ = writeln!(out, "- Quarantined {entry}");
            }
            for warning in &c.warnings {
                let _ = writeln!(
                    out,
                    "- Warning row {}: {} {:?} set to unknown",
                    warning.row, warning.field, warning.raw
                );
            }
        }
        out
    }
}

/// Persists run reports under `<root>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn write(&self, report: &RunReport) -> Result<PathBuf> {
        let dir = self.root.join(report.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(dir.join(RUN_REPORT_FILE), json)
            .await
            .with_context(|| format!("writing {RUN_REPORT_FILE}"))?;
        fs::write(dir.join(RUN_BRIEF_FILE), report.brief_markdown())
            .await
            .with_context(|| format!("writing {RUN_BRIEF_FILE}"))?;
        Ok(dir)
    }
}

/// Markdown summary of the latest `runs` reports found under `reports_dir`.
pub fn report_recent_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
    {
        let path = entry?.path().join(RUN_REPORT_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let report: RunReport = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        reports.push(report);
    }
    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# CEC Equipment Sync Runs".to_string(), String::new()];
    if reports.is_empty() {
        lines.push("_No runs recorded._".to_string());
    }
    for report in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({:?})", report.run_id, report.status));
        lines.push(format!("- started: {}", report.started_at));
        for category in &report.categories {
            lines.push(format!("- {}", category.summary_line()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
