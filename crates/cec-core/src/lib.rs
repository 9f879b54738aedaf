//! Core domain model for the CEC equipment-certification store.

mod registry;

pub use registry::{normalize_header, CategorySchema, FieldSpec, RegistryError, SchemaRegistry};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cec-core";

static UNKNOWN: FieldValue = FieldValue::Unknown;

/// Equipment category tag. Partitions schemas, sources and store namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentCategory {
    Modules,
    Inverters,
    EnergyStorage,
    Batteries,
    Meters,
}

impl EquipmentCategory {
    pub const ALL: [EquipmentCategory; 5] = [
        EquipmentCategory::Modules,
        EquipmentCategory::Inverters,
        EquipmentCategory::EnergyStorage,
        EquipmentCategory::Batteries,
        EquipmentCategory::Meters,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EquipmentCategory::Modules => "modules",
            EquipmentCategory::Inverters => "inverters",
            EquipmentCategory::EnergyStorage => "energy_storage",
            EquipmentCategory::Batteries => "batteries",
            EquipmentCategory::Meters => "meters",
        }
    }
}

impl fmt::Display for EquipmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown equipment category {0:?}")]
pub struct ParseCategoryError(pub String);

impl FromStr for EquipmentCategory {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "modules" | "module" | "pv_modules" => Ok(EquipmentCategory::Modules),
            "inverters" | "inverter" => Ok(EquipmentCategory::Inverters),
            "energy_storage" | "storage" => Ok(EquipmentCategory::EnergyStorage),
            "batteries" | "battery" => Ok(EquipmentCategory::Batteries),
            "meters" | "meter" => Ok(EquipmentCategory::Meters),
            _ => Err(ParseCategoryError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Boolean,
}

impl FieldType {
    pub fn tag(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
        }
    }
}

/// Typed canonical value. `Unknown` covers blank and sentinel cells and is
/// distinct from zero, empty text and `false`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    #[default]
    Unknown,
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Boolean(bool),
}

impl FieldValue {
    pub fn is_unknown(&self) -> bool {
        matches!(self, FieldValue::Unknown)
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Unknown => None,
            FieldValue::Text(_) => Some(FieldType::Text),
            FieldValue::Number(_) => Some(FieldType::Number),
            FieldValue::Date(_) => Some(FieldType::Date),
            FieldValue::Boolean(_) => Some(FieldType::Boolean),
        }
    }

    /// Stable encoding used for content hashing.
    pub(crate) fn hash_repr(&self) -> String {
        match self {
            FieldValue::Unknown => "?".to_string(),
            FieldValue::Text(v) => format!("s:{v}"),
            FieldValue::Number(v) => format!("n:{}", format_number(*v)),
            FieldValue::Date(v) => format!("d:{}", v.format("%Y-%m-%d")),
            FieldValue::Boolean(v) => format!("b:{v}"),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Unknown => Ok(()),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Number(v) => f.write_str(&format_number(*v)),
            FieldValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            FieldValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Renders a number without a trailing `.0` for integral values.
pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Ordered, normalised natural-key tuple identifying a product within a category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            parts
                .into_iter()
                .map(|p| Self::normalize_part(p.as_ref()))
                .collect(),
        )
    }

    /// Trim, collapse interior whitespace and upper-case.
    pub fn normalize_part(raw: &str) -> String {
        raw.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase()
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// JSON array form persisted in the store's `natural_key` column.
    pub fn storage_key(&self) -> String {
        serde_json::Value::from(self.0.clone()).to_string()
    }

    pub fn from_storage_key(stored: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Vec<String>>(stored).map(Self)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" / "))
    }
}

/// Normalised spreadsheet row, before identity resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub category: EquipmentCategory,
    /// 1-based row number in the source sheet.
    pub source_row: usize,
    pub attributes: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    pub fn new(category: EquipmentCategory, source_row: usize) -> Self {
        Self {
            category,
            source_row,
            attributes: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> &FieldValue {
        self.attributes.get(field).unwrap_or(&UNKNOWN)
    }

    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.attributes.insert(field.into(), value);
    }
}

/// Persisted equipment record with stable identity and change tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentRecord {
    pub category: EquipmentCategory,
    pub surrogate_id: i64,
    pub natural_key: NaturalKey,
    pub attributes: BTreeMap<String, FieldValue>,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl EquipmentRecord {
    pub fn attribute(&self, field: &str) -> &FieldValue {
        self.attributes.get(field).unwrap_or(&UNKNOWN)
    }
}

/// Identity of one pipeline run; `started_at` stamps every write of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuarantineReason {
    Missing,
    InvalidValue { raw: String },
    DuplicateNaturalKey { first_row: usize },
}

/// A row excluded from a run, with the field that disqualified it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub row: usize,
    pub field: String,
    pub reason: QuarantineReason,
}

impl fmt::Display for QuarantineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            QuarantineReason::Missing => write!(f, "row {}: missing {}", self.row, self.field),
            QuarantineReason::InvalidValue { raw } => {
                write!(f, "row {}: invalid {} {:?}", self.row, self.field, raw)
            }
            QuarantineReason::DuplicateNaturalKey { first_row } => write!(
                f,
                "row {}: duplicate {} (first seen on row {})",
                self.row, self.field, first_row
            ),
        }
    }
}

/// Optional field that failed coercion and was stored as Unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWarning {
    pub row: usize,
    pub field: String,
    pub raw: String,
}
