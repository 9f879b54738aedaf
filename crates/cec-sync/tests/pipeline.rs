use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cec_adapters::{RawSource, SourceError, SourceFetcher, SourceLocation, SourceSpec};
use cec_core::{
    CategorySchema, EquipmentCategory, EquipmentRecord, FieldValue, QuarantineReason, RunContext,
    SchemaRegistry,
};
use cec_storage::{FetchError, RecordStore};
use cec_sync::{
    CancellationFlag, CategoryOutcome, CategorySource, FailureKind, Orchestrator,
    OrchestratorError, PipelineConfig, RunSelection, RunStats, RunStatus, RUN_REPORT_FILE,
};
use chrono::Utc;
use tempfile::TempDir;

const METERS_HEADER: &str = "Manufacturer,Model Number,Display Type,Note,Meter Listing Date";

/// Serves in-memory spreadsheets; a category mapped to `None` is unreachable.
#[derive(Default)]
struct ScriptedFetcher {
    sources: Mutex<HashMap<EquipmentCategory, Option<Vec<u8>>>>,
}

impl ScriptedFetcher {
    fn serve(&self, category: EquipmentCategory, body: impl Into<Vec<u8>>) {
        self.sources
            .lock()
            .expect("lock")
            .insert(category, Some(body.into()));
    }

    fn break_source(&self, category: EquipmentCategory) {
        self.sources.lock().expect("lock").insert(category, None);
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _ctx: &RunContext,
        category: EquipmentCategory,
    ) -> Result<RawSource, SourceError> {
        let entry = self.sources.lock().expect("lock").get(&category).cloned();
        let location = format!("memory://{category}.csv");
        match entry {
            Some(Some(bytes)) => Ok(RawSource {
                category,
                location,
                content_type: Some("text/csv".into()),
                bytes,
                fetched_at: Utc::now(),
            }),
            Some(None) => Err(SourceError::Http {
                category,
                location: location.clone(),
                source: FetchError::HttpStatus {
                    status: 503,
                    url: location,
                },
            }),
            None => Err(SourceError::NotConfigured(category)),
        }
    }
}

struct Harness {
    dir: TempDir,
    fetcher: Arc<ScriptedFetcher>,
    orchestrator: Orchestrator,
}

impl Harness {
    async fn new(categories: &[EquipmentCategory]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let sources = categories
            .iter()
            .map(|&category| {
                let source = CategorySource {
                    display_name: category.to_string(),
                    enabled: true,
                    spec: SourceSpec {
                        location: SourceLocation::File(dir.path().join(format!("{category}.csv"))),
                        expected_content_types: vec![],
                    },
                };
                (category, source)
            })
            .collect::<BTreeMap<_, _>>();
        let config = PipelineConfig {
            sources,
            parallelism: 2,
            archive_dir: Some(dir.path().join("artifacts")),
            reports_dir: dir.path().join("reports"),
        };
        let store = RecordStore::open_path(dir.path().join("cec.db"))
            .await
            .expect("store");
        let fetcher = Arc::new(ScriptedFetcher::default());
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            Arc::new(SchemaRegistry::builtin().expect("registry")),
            fetcher.clone(),
            store,
        );
        Self {
            dir,
            fetcher,
            orchestrator,
        }
    }

    fn schema(&self, category: EquipmentCategory) -> CategorySchema {
        self.orchestrator
            .registry()
            .schema(category)
            .expect("schema")
            .clone()
    }

    async fn run(&self, selection: RunSelection) -> cec_sync::RunReport {
        self.orchestrator
            .run(selection, &CancellationFlag::new())
            .await
            .expect("run")
    }

    async fn stats(&self, category: EquipmentCategory) -> RunStats {
        let report = self.run(RunSelection::Only(vec![category])).await;
        let entry = report.category(category).expect("category report");
        assert_eq!(entry.outcome, CategoryOutcome::Succeeded, "{:?}", entry.failure);
        entry.stats
    }

    async fn records(&self, category: EquipmentCategory) -> Vec<EquipmentRecord> {
        self.orchestrator
            .store()
            .load_records(&self.schema(category))
            .await
            .expect("load")
    }
}

#[derive(Clone)]
struct MeterRow {
    model: String,
    display: String,
    note: String,
    listed: String,
}

fn meter_rows(n: usize) -> Vec<MeterRow> {
    (1..=n)
        .map(|i| MeterRow {
            model: format!("M-{i:03}"),
            display: if i % 2 == 0 { "LCD".into() } else { "LED".into() },
            note: format!("rev {i}"),
            listed: "2024-01-15".into(),
        })
        .collect()
}

/// Regulator-style export: a title preamble and a blank line above the header.
fn meters_csv(rows: &[MeterRow]) -> String {
    let mut out = format!("Solar Equipment Lists - Meters,,,,\n,,,,\n{METERS_HEADER}\n");
    for row in rows {
        out.push_str(&format!(
            "Acme Metering,{},{},{},{}\n",
            row.model, row.display, row.note, row.listed
        ));
    }
    out
}

fn stats(inserted: usize, updated: usize, unchanged: usize, quarantined: usize) -> RunStats {
    RunStats {
        inserted,
        updated,
        unchanged,
        quarantined,
    }
}

#[tokio::test]
async fn second_run_over_identical_source_changes_nothing() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&meter_rows(25)));

    assert_eq!(h.stats(EquipmentCategory::Meters).await, stats(25, 0, 0, 0));
    let before = h.records(EquipmentCategory::Meters).await;

    assert_eq!(h.stats(EquipmentCategory::Meters).await, stats(0, 0, 25, 0));
    assert_eq!(h.records(EquipmentCategory::Meters).await, before);
}

#[tokio::test]
async fn natural_keys_and_surrogate_ids_stay_unique() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    let mut rows = meter_rows(5);
    let mut shouted = rows[1].clone();
    shouted.model = format!("  {}  ", rows[1].model.to_lowercase());
    rows.push(shouted);
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));

    let report = h.run(RunSelection::All).await;
    let meters = report.category(EquipmentCategory::Meters).expect("meters");
    assert_eq!(meters.stats, stats(5, 0, 0, 1));
    assert_eq!(
        meters.quarantine[0].reason,
        QuarantineReason::DuplicateNaturalKey { first_row: 5 }
    );

    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&meter_rows(8)));
    h.stats(EquipmentCategory::Meters).await;

    let records = h.records(EquipmentCategory::Meters).await;
    assert_eq!(records.len(), 8);
    let keys = records.iter().map(|r| r.natural_key.clone()).collect::<HashSet<_>>();
    let ids = records.iter().map(|r| r.surrogate_id).collect::<HashSet<_>>();
    assert_eq!(keys.len(), 8);
    assert_eq!(ids, (1..=8).collect::<HashSet<i64>>());
}

#[tokio::test]
async fn single_attribute_change_updates_only_that_record() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    let mut rows = meter_rows(10);
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));
    h.stats(EquipmentCategory::Meters).await;
    let before = h.records(EquipmentCategory::Meters).await;

    rows[3].display = "E-ink".into();
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));
    assert_eq!(h.stats(EquipmentCategory::Meters).await, stats(0, 1, 9, 0));

    let after = h.records(EquipmentCategory::Meters).await;
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.surrogate_id, new.surrogate_id);
        assert_eq!(old.first_seen_at, new.first_seen_at);
        if old.surrogate_id == 4 {
            assert_eq!(new.attribute("display_type"), &FieldValue::Text("E-ink".into()));
            assert_ne!(new.content_hash, old.content_hash);
            assert!(new.last_updated_at > old.last_updated_at);
        } else {
            assert_eq!(old, new);
        }
    }
}

#[tokio::test]
async fn failed_commit_leaves_the_store_untouched() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    let mut rows = meter_rows(6);
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));
    h.stats(EquipmentCategory::Meters).await;
    let before = h.records(EquipmentCategory::Meters).await;

    sqlx::query(
        "CREATE TRIGGER reject_poison BEFORE INSERT ON meters \
         WHEN NEW.model_number = 'POISON' \
         BEGIN SELECT RAISE(ABORT, 'poisoned row'); END",
    )
    .execute(h.orchestrator.store().pool())
    .await
    .expect("trigger");

    rows[0].note = "changed".into();
    let mut fresh = rows[1].clone();
    fresh.model = "M-NEW".into();
    let mut poison = rows[1].clone();
    poison.model = "POISON".into();
    rows.push(fresh);
    rows.push(poison);
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));

    let report = h.run(RunSelection::All).await;
    assert_eq!(report.status, RunStatus::Partial);
    let meters = report.category(EquipmentCategory::Meters).expect("meters");
    assert_eq!(meters.outcome, CategoryOutcome::Failed);
    assert_eq!(
        meters.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::StoreCommit)
    );
    assert_eq!(h.records(EquipmentCategory::Meters).await, before);
}

#[tokio::test]
async fn unavailable_source_only_fails_its_category() {
    let h = Harness::new(&[EquipmentCategory::Modules, EquipmentCategory::Meters]).await;
    h.fetcher.break_source(EquipmentCategory::Modules);
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&meter_rows(12)));

    let report = h.run(RunSelection::All).await;
    assert_eq!(report.status, RunStatus::Partial);

    let modules = report.category(EquipmentCategory::Modules).expect("modules");
    assert_eq!(modules.outcome, CategoryOutcome::Failed);
    assert_eq!(
        modules.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::SourceUnavailable)
    );
    assert_eq!(modules.stats, RunStats::default());

    let meters = report.category(EquipmentCategory::Meters).expect("meters");
    assert_eq!(meters.outcome, CategoryOutcome::Succeeded);
    assert_eq!(meters.stats, stats(12, 0, 0, 0));
    assert_eq!(
        report.categories.iter().map(|c| c.category).collect::<Vec<_>>(),
        vec![EquipmentCategory::Modules, EquipmentCategory::Meters]
    );
}

#[tokio::test]
async fn quarantine_report_names_each_offending_field() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    let mut rows = meter_rows(10);
    rows[2].model = String::new();
    rows[5].listed = "N/A".into();
    rows[8].listed = "someday".into();
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));

    let report = h.run(RunSelection::All).await;
    let meters = report.category(EquipmentCategory::Meters).expect("meters");
    assert_eq!(meters.stats, stats(7, 0, 0, 3));
    let fields = meters
        .quarantine
        .iter()
        .map(|q| (q.row, q.field.as_str()))
        .collect::<Vec<_>>();
    // Three preamble/header lines precede the first data row.
    assert_eq!(
        fields,
        vec![(6, "model_number"), (9, "listing_date"), (12, "listing_date")]
    );
    assert_eq!(
        meters.quarantine[2].reason,
        QuarantineReason::InvalidValue {
            raw: "someday".into()
        }
    );
    assert_eq!(h.records(EquipmentCategory::Meters).await.len(), 7);
}

#[tokio::test]
async fn five_hundred_row_lifecycle() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    let mut rows = meter_rows(500);
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));

    assert_eq!(h.stats(EquipmentCategory::Meters).await, stats(500, 0, 0, 0));
    let first = h.records(EquipmentCategory::Meters).await;
    assert_eq!(
        first.iter().map(|r| r.surrogate_id).collect::<Vec<_>>(),
        (1..=500).collect::<Vec<i64>>()
    );

    assert_eq!(h.stats(EquipmentCategory::Meters).await, stats(0, 0, 500, 0));

    for idx in [10, 200, 321] {
        rows[idx].note = format!("revised {idx}");
    }
    for idx in [42, 499] {
        rows[idx].model = "--".into();
    }
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&rows));
    assert_eq!(h.stats(EquipmentCategory::Meters).await, stats(0, 3, 495, 2));

    let third = h.records(EquipmentCategory::Meters).await;
    assert_eq!(third.len(), 500);
    for (before, after) in first.iter().zip(&third) {
        assert_eq!(before.surrogate_id, after.surrogate_id);
        assert_eq!(before.natural_key, after.natural_key);
        assert_eq!(before.first_seen_at, after.first_seen_at);
    }
    let updated = third
        .iter()
        .zip(&first)
        .filter(|(after, before)| after.last_updated_at != before.last_updated_at)
        .map(|(after, _)| after.surrogate_id)
        .collect::<Vec<_>>();
    assert_eq!(updated, vec![11, 201, 322]);
}

#[tokio::test]
async fn schema_drift_fails_the_category_without_writes() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&meter_rows(3)));
    h.stats(EquipmentCategory::Meters).await;
    let before = h.records(EquipmentCategory::Meters).await;

    h.fetcher.serve(
        EquipmentCategory::Meters,
        "Manufacturer,Model Number,Display Type\nAcme Metering,M-001,LCD\n",
    );
    let report = h.run(RunSelection::All).await;
    let meters = report.category(EquipmentCategory::Meters).expect("meters");
    assert_eq!(
        meters.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::SchemaDrift)
    );
    assert!(meters
        .failure
        .as_ref()
        .is_some_and(|f| f.message.contains("listing_date")));
    assert_eq!(h.records(EquipmentCategory::Meters).await, before);
}

#[tokio::test]
async fn cancelled_run_starts_no_category() {
    let h = Harness::new(&[EquipmentCategory::Modules, EquipmentCategory::Meters]).await;
    h.fetcher.serve(EquipmentCategory::Meters, meters_csv(&meter_rows(3)));
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let report = h
        .orchestrator
        .run(RunSelection::All, &cancel)
        .await
        .expect("run");
    assert_eq!(report.status, RunStatus::Partial);
    assert!(report
        .categories
        .iter()
        .all(|c| c.outcome == CategoryOutcome::Cancelled));
    assert_eq!(
        h.orchestrator
            .store()
            .count(&h.schema(EquipmentCategory::Meters))
            .await
            .ok(),
        None,
        "meters table should not have been created"
    );
}

#[tokio::test]
async fn unconfigured_category_is_a_fatal_error() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    let err = h
        .orchestrator
        .run(
            RunSelection::Only(vec![EquipmentCategory::Meters, EquipmentCategory::Inverters]),
            &CancellationFlag::new(),
        )
        .await
        .expect_err("fatal");
    assert!(matches!(
        err,
        OrchestratorError::NotConfigured(EquipmentCategory::Inverters)
    ));
}

#[tokio::test]
async fn recorded_runs_archive_the_vintage_and_write_reports() {
    let h = Harness::new(&[EquipmentCategory::Meters]).await;
    let body = meters_csv(&meter_rows(4));
    h.fetcher.serve(EquipmentCategory::Meters, body.clone());

    let report = h
        .orchestrator
        .run_and_record(RunSelection::All, &CancellationFlag::new())
        .await
        .expect("run");
    assert_eq!(report.status, RunStatus::Complete);

    let source = report
        .category(EquipmentCategory::Meters)
        .and_then(|c| c.source.clone())
        .expect("source summary");
    assert_eq!(source.bytes, body.len());
    let archived = h
        .dir
        .path()
        .join("artifacts")
        .join(source.archived_path.expect("archived"));
    assert_eq!(std::fs::read(&archived).expect("archived bytes"), body.as_bytes());
    assert!(archived
        .file_name()
        .is_some_and(|n| n.to_string_lossy() == format!("{}.csv", source.sha256)));

    let report_file = h
        .dir
        .path()
        .join("reports")
        .join(report.run_id.to_string())
        .join(RUN_REPORT_FILE);
    assert!(Path::new(&report_file).is_file());
}
