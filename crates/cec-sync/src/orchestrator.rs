use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use cec_adapters::{
    normalize, LocationFetcher, NormalizeError, SheetError, SourceError, SourceFetcher,
};
use cec_core::{CategorySchema, EquipmentCategory, RegistryError, RunContext, SchemaRegistry};
use cec_storage::{HttpFetcher, RecordStore, StoreError, VintageArchive};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{PipelineConfig, SyncConfig};
use crate::reconcile::reconcile;
use crate::report::{
    CategoryFailure, CategoryOutcome, CategoryReport, FailureKind, ReportWriter, RunReport,
    SourceSummary,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSelection {
    /// Every enabled configured category.
    All,
    Only(Vec<EquipmentCategory>),
}

/// Trips once; categories that have not started when it does are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Failure of one category's pipeline. Never aborts sibling categories.
#[derive(Debug, Error)]
pub enum CategoryError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),
    #[error("required columns not found: {}", missing.join(", "))]
    SchemaDrift { missing: Vec<String> },
    #[error("malformed source: {0}")]
    MalformedSource(#[source] SheetError),
    #[error("store commit failed: {0}")]
    StoreCommit(#[source] StoreError),
}

impl CategoryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CategoryError::SourceUnavailable(_) => FailureKind::SourceUnavailable,
            CategoryError::SchemaDrift { .. } => FailureKind::SchemaDrift,
            CategoryError::MalformedSource(_) => FailureKind::MalformedSource,
            CategoryError::StoreCommit(_) => FailureKind::StoreCommit,
        }
    }
}

impl From<NormalizeError> for CategoryError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::SchemaDrift { missing, .. } => CategoryError::SchemaDrift { missing },
            NormalizeError::Malformed { source, .. } => CategoryError::MalformedSource(source),
        }
    }
}

/// Configuration problems that stop a run before any category starts.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no source configured for {0}")]
    NotConfigured(EquipmentCategory),
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<PipelineConfig>,
    registry: Arc<SchemaRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
    store: RecordStore,
    archive: Option<VintageArchive>,
    locks: HashMap<EquipmentCategory, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        registry: Arc<SchemaRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        store: RecordStore,
    ) -> Self {
        let archive = config.archive_dir.clone().map(VintageArchive::new);
        let locks = EquipmentCategory::ALL
            .into_iter()
            .map(|c| (c, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                fetcher,
                store,
                archive,
                locks,
            }),
        }
    }

    /// Wire the production stack: built-in registry, location fetcher over
    /// HTTP and files, and the SQLite store at `CEC_DATABASE_URL`.
    pub async fn from_sync_config(sync: &SyncConfig) -> Result<Self> {
        let config = Arc::new(PipelineConfig::from_sync_config(sync)?);
        let registry = Arc::new(SchemaRegistry::builtin().context("building schema registry")?);
        let http = Arc::new(HttpFetcher::new(sync.http_client_config())?);
        let sources = config
            .sources
            .iter()
            .map(|(category, source)| (*category, source.spec.clone()))
            .collect();
        let fetcher = Arc::new(LocationFetcher::new(http, sources));
        let store = RecordStore::connect(&sync.database_url)
            .await
            .with_context(|| format!("opening store {}", sync.database_url))?;
        Ok(Self::new(config, registry, fetcher, store))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    /// Create or evolve the table of every registered category.
    pub async fn migrate(&self) -> Result<()> {
        for category in self.inner.registry.categories() {
            let schema = self.inner.registry.schema(category)?;
            self.inner
                .store
                .ensure_namespace(schema)
                .await
                .with_context(|| format!("migrating {category}"))?;
        }
        Ok(())
    }

    /// Run fetch, normalize and reconcile for each selected category.
    ///
    /// Categories run in parallel up to the configured limit; a failure in one
    /// is recorded in its report entry and never stops the others.
    pub async fn run(
        &self,
        selection: RunSelection,
        cancel: &CancellationFlag,
    ) -> Result<RunReport, OrchestratorError> {
        let planned = self.resolve(selection)?;
        let ctx = RunContext::new();
        info!(run_id = %ctx.run_id, categories = planned.len(), "starting sync run");

        let limit = Arc::new(Semaphore::new(self.inner.config.parallelism.max(1)));
        let mut tasks = JoinSet::new();
        for (idx, schema) in planned.iter().cloned().enumerate() {
            let inner = self.inner.clone();
            let limit = limit.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let category = schema.category();
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (idx, CategoryReport::new(category, CategoryOutcome::Cancelled));
                    }
                };
                if cancel.is_cancelled() {
                    info!(%category, "run cancelled before category started");
                    return (idx, CategoryReport::new(category, CategoryOutcome::Cancelled));
                }
                (idx, inner.run_category(&ctx, &schema).await)
            });
        }

        let mut slots: Vec<Option<CategoryReport>> = vec![None; planned.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, report)) => slots[idx] = Some(report),
                Err(err) => {
                    error!(run_id = %ctx.run_id, error = %err, "category task ended abnormally")
                }
            }
        }

        let categories = slots
            .into_iter()
            .zip(&planned)
            .map(|(slot, schema)| {
                slot.unwrap_or_else(|| {
                    CategoryReport::failed(
                        schema.category(),
                        FailureKind::Aborted,
                        "category task ended without a report",
                    )
                })
            })
            .collect::<Vec<_>>();
        let status = RunReport::status_for(&categories);
        info!(run_id = %ctx.run_id, ?status, "sync run finished");

        Ok(RunReport {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            status,
            categories,
        })
    }

    /// `run` followed by persisting the report under the reports directory.
    pub async fn run_and_record(
        &self,
        selection: RunSelection,
        cancel: &CancellationFlag,
    ) -> Result<RunReport> {
        let report = self.run(selection, cancel).await?;
        let dir = ReportWriter::new(&self.inner.config.reports_dir)
            .write(&report)
            .await?;
        info!(run_id = %report.run_id, reports = %dir.display(), "run report written");
        Ok(report)
    }

    fn resolve(&self, selection: RunSelection) -> Result<Vec<CategorySchema>, OrchestratorError> {
        let categories = match selection {
            RunSelection::All => self.inner.config.enabled_categories().collect::<Vec<_>>(),
            RunSelection::Only(requested) => {
                let mut unique = Vec::with_capacity(requested.len());
                for category in requested {
                    if !unique.contains(&category) {
                        unique.push(category);
                    }
                }
                unique
            }
        };

        categories
            .into_iter()
            .map(|category| {
                let schema = self.inner.registry.schema(category)?.clone();
                if !self.inner.config.sources.contains_key(&category) {
                    return Err(OrchestratorError::NotConfigured(category));
                }
                Ok(schema)
            })
            .collect()
    }
}

impl Inner {
    async fn run_category(&self, ctx: &RunContext, schema: &CategorySchema) -> CategoryReport {
        let category = schema.category();
        let span = info_span!("category_pipeline", run_id = %ctx.run_id, %category);
        async {
            let lock = self.locks.get(&category).cloned().unwrap_or_default();
            let _guard = lock.lock().await;

            let mut report = CategoryReport::new(category, CategoryOutcome::Succeeded);
            match self.pipeline(ctx, schema, &mut report).await {
                Ok(()) => info!(
                    inserted = report.stats.inserted,
                    updated = report.stats.updated,
                    unchanged = report.stats.unchanged,
                    quarantined = report.stats.quarantined,
                    "category reconciled"
                ),
                Err(err) => {
                    error!(kind = ?err.kind(), error = %err, "category failed");
                    report.outcome = CategoryOutcome::Failed;
                    report.failure = Some(CategoryFailure {
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn pipeline(
        &self,
        ctx: &RunContext,
        schema: &CategorySchema,
        report: &mut CategoryReport,
    ) -> Result<(), CategoryError> {
        let category = schema.category();
        let raw = self
            .fetcher
            .fetch(ctx, category)
            .await
            .map_err(CategoryError::SourceUnavailable)?;

        let mut source = SourceSummary {
            location: raw.location.clone(),
            sha256: VintageArchive::sha256_hex(&raw.bytes),
            bytes: raw.bytes.len(),
            archived_path: None,
        };
        if let Some(archive) = &self.archive {
            match archive
                .store(raw.fetched_at, category, &raw.extension(), &raw.bytes)
                .await
            {
                Ok(vintage) => source.archived_path = Some(vintage.relative_path),
                Err(err) => warn!(error = %err, "raw vintage not archived"),
            }
        }
        report.source = Some(source);

        let batch = normalize(schema, &raw.bytes)?;
        report.header_row = Some(batch.layout.header_row);
        report.units_row = batch.layout.units_row;
        report.unmapped_columns = batch.layout.unmapped_columns;
        report.warnings = batch.warnings;
        report.quarantine = batch.quarantine;
        report.stats.quarantined = report.quarantine.len();

        let plan = reconcile(&self.store, schema, ctx, batch.records)
            .await
            .map_err(CategoryError::StoreCommit)?;
        report.stats.inserted = plan.stats.inserted;
        report.stats.updated = plan.stats.updated;
        report.stats.unchanged = plan.stats.unchanged;
        report.stats.quarantined += plan.stats.quarantined;
        report.quarantine.extend(plan.quarantine);
        Ok(())
    }
}
