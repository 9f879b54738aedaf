use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use cec_core::{CategorySchema, EquipmentRecord, FieldType, FieldValue, NaturalKey};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Sqlx {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("table {table} exists but is not a managed equipment table (missing {column})")]
    IncompatibleTable { table: String, column: String },
    #[error("table {table}: update matched no row for surrogate id {surrogate_id}")]
    MissingRow { table: String, surrogate_id: i64 },
    #[error("table {table}: unreadable row {surrogate_id}: {detail}")]
    Corrupt {
        table: String,
        surrogate_id: i64,
        detail: String,
    },
}

trait SqlxContext<T> {
    fn store_context(self, context: impl FnOnce() -> String) -> Result<T, StoreError>;
}

impl<T> SqlxContext<T> for Result<T, sqlx::Error> {
    fn store_context(self, context: impl FnOnce() -> String) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Sqlx {
            context: context(),
            source,
        })
    }
}

/// Stored identity and change-tracking columns of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub surrogate_id: i64,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Everything one category run writes. Applied as a single transaction.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub inserts: Vec<EquipmentRecord>,
    pub updates: Vec<EquipmentRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// SQLite-backed store with one table per equipment category.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .store_context(|| format!("parsing database url {database_url}"))?;
        Self::open(options).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(SqliteConnectOptions::new().filename(path.as_ref())).await
    }

    async fn open(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .store_context(|| "opening sqlite store".to_string())?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the category's table and indexes, adding columns for canonical
    /// fields introduced since the table was created.
    pub async fn ensure_namespace(&self, schema: &CategorySchema) -> Result<(), StoreError> {
        let table = schema.table_name();
        let mut column_defs = vec![
            "surrogate_id INTEGER PRIMARY KEY".to_string(),
            "natural_key TEXT NOT NULL".to_string(),
        ];
        column_defs.extend(
            schema
                .fields()
                .iter()
                .map(|f| format!("{} {}", quote_ident(f.name), sql_type(f.field_type))),
        );
        column_defs.extend([
            "content_hash TEXT NOT NULL".to_string(),
            "first_seen_at TEXT NOT NULL".to_string(),
            "last_updated_at TEXT NOT NULL".to_string(),
        ]);

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            column_defs.join(", ")
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .store_context(|| format!("creating table {table}"))?;

        let existing = self.columns(schema).await?;
        for required in [
            "surrogate_id",
            "natural_key",
            "content_hash",
            "first_seen_at",
            "last_updated_at",
        ] {
            if !existing.iter().any(|c| c.name == required) {
                return Err(StoreError::IncompatibleTable {
                    table: table.to_string(),
                    column: required.to_string(),
                });
            }
        }
        for field in schema.fields() {
            if existing.iter().any(|c| c.name == field.name) {
                continue;
            }
            let alter = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                quote_ident(field.name),
                sql_type(field.field_type)
            );
            sqlx::query(&alter)
                .execute(&self.pool)
                .await
                .store_context(|| format!("adding column {} to {table}", field.name))?;
            info!(table, column = field.name, "added canonical column");
        }

        let index = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (natural_key)",
            quote_ident(&format!("{table}_natural_key_idx")),
            quote_ident(table)
        );
        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .store_context(|| format!("indexing {table}"))?;
        Ok(())
    }

    pub async fn columns(&self, schema: &CategorySchema) -> Result<Vec<ColumnInfo>, StoreError> {
        let table = schema.table_name();
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&self.pool)
            .await
            .store_context(|| format!("reading columns of {table}"))?;
        rows.iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    declared_type: row.try_get("type")?,
                    not_null: row.try_get::<i64, _>("notnull")? != 0,
                    primary_key: row.try_get::<i64, _>("pk")? != 0,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .store_context(|| format!("decoding columns of {table}"))
    }

    pub async fn count(&self, schema: &CategorySchema) -> Result<i64, StoreError> {
        let table = schema.table_name();
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.pool)
            .await
            .store_context(|| format!("counting {table}"))
    }

    /// Identity columns of every stored record, keyed by natural key.
    pub async fn identities(
        &self,
        schema: &CategorySchema,
    ) -> Result<HashMap<NaturalKey, StoredIdentity>, StoreError> {
        let table = schema.table_name();
        let sql = format!(
            "SELECT surrogate_id, natural_key, content_hash, first_seen_at, last_updated_at \
             FROM {}",
            quote_ident(table)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .store_context(|| format!("reading identities from {table}"))?;

        let mut identities = HashMap::with_capacity(rows.len());
        for row in rows {
            let (surrogate_id, natural_key) = decode_key(table, &row)?;
            let identity = StoredIdentity {
                surrogate_id,
                content_hash: row
                    .try_get("content_hash")
                    .store_context(|| format!("decoding {table} row {surrogate_id}"))?,
                first_seen_at: row
                    .try_get("first_seen_at")
                    .store_context(|| format!("decoding {table} row {surrogate_id}"))?,
                last_updated_at: row
                    .try_get("last_updated_at")
                    .store_context(|| format!("decoding {table} row {surrogate_id}"))?,
            };
            identities.insert(natural_key, identity);
        }
        Ok(identities)
    }

    /// Every stored record of the category, ordered by surrogate id.
    pub async fn load_records(
        &self,
        schema: &CategorySchema,
    ) -> Result<Vec<EquipmentRecord>, StoreError> {
        let table = schema.table_name();
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} ORDER BY surrogate_id",
            quote_ident(table)
        ))
        .fetch_all(&self.pool)
        .await
        .store_context(|| format!("loading {table}"))?;

        rows.iter().map(|row| decode_record(schema, row)).collect()
    }

    /// Apply one run's inserts and updates atomically. Any failure rolls the
    /// whole change set back.
    pub async fn commit(
        &self,
        schema: &CategorySchema,
        changes: &ChangeSet,
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let table = schema.table_name();
        let insert_sql = insert_statement(schema);
        let update_sql = update_statement(schema);

        let mut tx = self
            .pool
            .begin()
            .await
            .store_context(|| format!("opening transaction on {table}"))?;

        for record in &changes.inserts {
            let mut query = sqlx::query(&insert_sql)
                .bind(record.surrogate_id)
                .bind(record.natural_key.storage_key());
            for field in schema.fields() {
                query = bind_value(query, record.attribute(field.name));
            }
            query
                .bind(record.content_hash.clone())
                .bind(record.first_seen_at)
                .bind(record.last_updated_at)
                .execute(&mut *tx)
                .await
                .store_context(|| {
                    format!("inserting {} into {table}", record.natural_key)
                })?;
        }

        for record in &changes.updates {
            let mut query = sqlx::query(&update_sql);
            for field in schema.fields() {
                query = bind_value(query, record.attribute(field.name));
            }
            let result = query
                .bind(record.content_hash.clone())
                .bind(record.last_updated_at)
                .bind(record.surrogate_id)
                .execute(&mut *tx)
                .await
                .store_context(|| format!("updating {} in {table}", record.natural_key))?;
            if result.rows_affected() != 1 {
                return Err(StoreError::MissingRow {
                    table: table.to_string(),
                    surrogate_id: record.surrogate_id,
                });
            }
        }

        tx.commit()
            .await
            .store_context(|| format!("committing {table}"))?;
        debug!(
            table,
            inserted = changes.inserts.len(),
            updated = changes.updates.len(),
            "committed change set"
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text | FieldType::Date => "TEXT",
        FieldType::Number => "REAL",
        FieldType::Boolean => "INTEGER",
    }
}

fn insert_statement(schema: &CategorySchema) -> String {
    let mut columns = vec!["surrogate_id".to_string(), "natural_key".to_string()];
    columns.extend(schema.fields().iter().map(|f| quote_ident(f.name)));
    columns.extend([
        "content_hash".to_string(),
        "first_seen_at".to_string(),
        "last_updated_at".to_string(),
    ]);
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(schema.table_name()),
        columns.join(", "),
        placeholders
    )
}

fn update_statement(schema: &CategorySchema) -> String {
    let mut assignments = schema
        .fields()
        .iter()
        .map(|f| format!("{} = ?", quote_ident(f.name)))
        .collect::<Vec<_>>();
    assignments.push("content_hash = ?".to_string());
    assignments.push("last_updated_at = ?".to_string());
    format!(
        "UPDATE {} SET {} WHERE surrogate_id = ?",
        quote_ident(schema.table_name()),
        assignments.join(", ")
    )
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &FieldValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        FieldValue::Unknown => query.bind(None::<String>),
        FieldValue::Text(v) => query.bind(v.clone()),
        FieldValue::Number(v) => query.bind(*v),
        FieldValue::Date(v) => query.bind(v.format("%Y-%m-%d").to_string()),
        FieldValue::Boolean(v) => query.bind(*v),
    }
}

fn decode_key(table: &str, row: &SqliteRow) -> Result<(i64, NaturalKey), StoreError> {
    let surrogate_id: i64 = row
        .try_get("surrogate_id")
        .store_context(|| format!("decoding surrogate id in {table}"))?;
    let stored: String = row
        .try_get("natural_key")
        .store_context(|| format!("decoding {table} row {surrogate_id}"))?;
    let natural_key = NaturalKey::from_storage_key(&stored).map_err(|err| StoreError::Corrupt {
        table: table.to_string(),
        surrogate_id,
        detail: format!("natural key {stored:?}: {err}"),
    })?;
    Ok((surrogate_id, natural_key))
}

fn decode_record(schema: &CategorySchema, row: &SqliteRow) -> Result<EquipmentRecord, StoreError> {
    let table = schema.table_name();
    let (surrogate_id, natural_key) = decode_key(table, row)?;
    let ctx = || format!("decoding {table} row {surrogate_id}");

    let mut attributes = BTreeMap::new();
    for field in schema.fields() {
        let value = match field.field_type {
            FieldType::Text => row
                .try_get::<Option<String>, _>(field.name)
                .store_context(ctx)?
                .map(FieldValue::Text),
            FieldType::Number => row
                .try_get::<Option<f64>, _>(field.name)
                .store_context(ctx)?
                .map(FieldValue::Number),
            FieldType::Boolean => row
                .try_get::<Option<bool>, _>(field.name)
                .store_context(ctx)?
                .map(FieldValue::Boolean),
            FieldType::Date => match row
                .try_get::<Option<String>, _>(field.name)
                .store_context(ctx)?
            {
                Some(text) => Some(FieldValue::Date(
                    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|err| {
                        StoreError::Corrupt {
                            table: table.to_string(),
                            surrogate_id,
                            detail: format!("{} {text:?}: {err}", field.name),
                        }
                    })?,
                )),
                None => None,
            },
        };
        attributes.insert(field.name.to_string(), value.unwrap_or_default());
    }

    Ok(EquipmentRecord {
        category: schema.category(),
        surrogate_id,
        natural_key,
        attributes,
        content_hash: row.try_get("content_hash").store_context(ctx)?,
        first_seen_at: row.try_get("first_seen_at").store_context(ctx)?,
        last_updated_at: row.try_get("last_updated_at").store_context(ctx)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cec_core::{EquipmentCategory, FieldSpec, SchemaRegistry};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn meters() -> CategorySchema {
        SchemaRegistry::builtin()
            .expect("registry")
            .schema(EquipmentCategory::Meters)
            .expect("meters")
            .clone()
    }

    async fn store() -> (TempDir, RecordStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open_path(dir.path().join("store.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().expect("ts")
    }

    fn record(
        schema: &CategorySchema,
        id: i64,
        model: &str,
        note: Option<&str>,
    ) -> EquipmentRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert("manufacturer".to_string(), FieldValue::Text("Acme".into()));
        attributes.insert("model_number".to_string(), FieldValue::Text(model.into()));
        attributes.insert("pbi_meter".to_string(), FieldValue::Boolean(true));
        attributes.insert(
            "listing_date".to_string(),
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 15).expect("date")),
        );
        if let Some(note) = note {
            attributes.insert("note".to_string(), FieldValue::Text(note.into()));
        }
        let content_hash = schema.content_hash(&attributes);
        EquipmentRecord {
            category: EquipmentCategory::Meters,
            surrogate_id: id,
            natural_key: NaturalKey::from_parts(["Acme", model]),
            attributes,
            content_hash,
            first_seen_at: ts(6),
            last_updated_at: ts(6),
        }
    }

    #[tokio::test]
    async fn ensure_namespace_is_idempotent_and_typed() {
        let schema = meters();
        let (_dir, store) = store().await;
        store.ensure_namespace(&schema).await.expect("first");
        store.ensure_namespace(&schema).await.expect("second");

        let columns = store.columns(&schema).await.expect("columns");
        let find = |name: &str| columns.iter().find(|c| c.name == name).expect(name);
        assert!(find("surrogate_id").primary_key);
        assert_eq!(find("pbi_meter").declared_type, "INTEGER");
        assert_eq!(find("listing_date").declared_type, "TEXT");
        assert!(find("content_hash").not_null);
    }

    #[tokio::test]
    async fn new_canonical_fields_are_added_in_place() {
        let full = meters();
        let narrow = CategorySchema::new(
            EquipmentCategory::Meters,
            "meters",
            full.fields()
                .iter()
                .filter(|f| f.name != "note")
                .cloned()
                .collect::<Vec<FieldSpec>>(),
            vec!["manufacturer", "model_number"],
        )
        .expect("narrow schema");

        let (_dir, store) = store().await;
        store.ensure_namespace(&narrow).await.expect("narrow");
        store
            .commit(
                &narrow,
                &ChangeSet {
                    inserts: vec![record(&narrow, 1, "M-1", None)],
                    updates: vec![],
                },
            )
            .await
            .expect("insert");

        store.ensure_namespace(&full).await.expect("widen");
        let records = store.load_records(&full).await.expect("load");
        assert_eq!(records.len(), 1);
        assert!(records[0].attribute("note").is_unknown());
    }

    #[tokio::test]
    async fn commit_round_trips_typed_attributes() {
        let schema = meters();
        let (_dir, store) = store().await;
        store.ensure_namespace(&schema).await.expect("ensure");

        let inserted = record(&schema, 1, "M-1", Some("revenue grade"));
        store
            .commit(
                &schema,
                &ChangeSet {
                    inserts: vec![inserted.clone()],
                    updates: vec![],
                },
            )
            .await
            .expect("commit");

        let loaded = store.load_records(&schema).await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].surrogate_id, 1);
        assert_eq!(loaded[0].natural_key, inserted.natural_key);
        assert_eq!(loaded[0].attribute("note"), &FieldValue::Text("revenue grade".into()));
        assert_eq!(loaded[0].attribute("pbi_meter"), &FieldValue::Boolean(true));
        assert!(loaded[0].attribute("display_type").is_unknown());
        assert_eq!(loaded[0].first_seen_at, ts(6));
        assert_eq!(schema.content_hash(&loaded[0].attributes), inserted.content_hash);

        let identities = store.identities(&schema).await.expect("identities");
        assert_eq!(identities[&inserted.natural_key].surrogate_id, 1);
    }

    #[tokio::test]
    async fn duplicate_natural_key_rolls_back_the_whole_change_set() {
        let schema = meters();
        let (_dir, store) = store().await;
        store.ensure_namespace(&schema).await.expect("ensure");

        let err = store
            .commit(
                &schema,
                &ChangeSet {
                    inserts: vec![
                        record(&schema, 1, "M-1", None),
                        record(&schema, 2, "M-2", None),
                        record(&schema, 3, "m-1", None),
                    ],
                    updates: vec![],
                },
            )
            .await
            .expect_err("unique violation");
        assert!(matches!(err, StoreError::Sqlx { .. }));
        assert_eq!(store.count(&schema).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn update_of_unknown_row_fails_and_rolls_back() {
        let schema = meters();
        let (_dir, store) = store().await;
        store.ensure_namespace(&schema).await.expect("ensure");

        let err = store
            .commit(
                &schema,
                &ChangeSet {
                    inserts: vec![record(&schema, 1, "M-1", None)],
                    updates: vec![record(&schema, 7, "M-7", Some("ghost"))],
                },
            )
            .await
            .expect_err("missing row");
        assert!(matches!(err, StoreError::MissingRow { surrogate_id: 7, .. }));
        assert_eq!(store.count(&schema).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn foreign_tables_are_not_adopted() {
        let schema = meters();
        let (_dir, store) = store().await;
        sqlx::query("CREATE TABLE meters (meter_id TEXT PRIMARY KEY, \"Manufacturer\" TEXT)")
            .execute(store.pool())
            .await
            .expect("legacy table");
        let err = store.ensure_namespace(&schema).await.expect_err("incompatible");
        assert!(matches!(err, StoreError::IncompatibleTable { .. }));
    }
}
