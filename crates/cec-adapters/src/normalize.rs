//! Raw spreadsheet rows to canonical records.
//!
//! The header is located by content rather than position: regulator lists
//! carry a variable-length preamble above the column titles, and some
//! vintages add a units row beneath them.

use std::collections::BTreeSet;

use cec_core::{
    format_number, CanonicalRecord, CategorySchema, EquipmentCategory, FieldSpec, FieldType,
    FieldValue, FieldWarning, QuarantineEntry, QuarantineReason,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sheet::{read_rows, RawCell, SheetError, SheetRow};

/// Rows scanned for the header before giving up.
pub const HEADER_SCAN_ROWS: usize = 40;

const UNKNOWN_SENTINELS: &[&str] = &[
    "", "-", "--", "n/a", "na", "none", "null", "tbd", "unknown", "?",
];
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%y",
    "%m/%d/%Y",
    "%Y/%m/%d",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const TRUE_WORDS: &[&str] = &["y", "yes", "true", "t", "x", "1"];
const FALSE_WORDS: &[&str] = &["n", "no", "false", "f", "0"];

const EXCEL_SERIAL_MAX: f64 = 2_958_465.0;
const UNIX_SECONDS_MIN: f64 = 1e9;
const UNIX_MILLIS_MIN: f64 = 1e12;
const UNITS_CELL_MAX_CHARS: usize = 12;
const UNIT_LABELS: &[&str] = &[
    "w", "kw", "mw", "wh", "kwh", "mwh", "v", "vac", "vdc", "a", "ah", "%", "c", "°c", "f",
    "°f", "hz", "va", "kva", "w/m2", "w/m²", "mm", "kg", "lbs", "hrs", "years",
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{category}: required columns not found: {}", missing.join(", "))]
    SchemaDrift {
        category: EquipmentCategory,
        missing: Vec<String>,
    },
    #[error("{category}: unreadable spreadsheet: {source}")]
    Malformed {
        category: EquipmentCategory,
        #[source]
        source: SheetError,
    },
}

/// Where the table sits within the sheet and which columns were ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SheetLayout {
    pub header_row: usize,
    pub units_row: Option<usize>,
    /// Non-blank rows below the header; each is accepted or quarantined.
    pub data_rows: usize,
    pub unmapped_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub category: EquipmentCategory,
    pub records: Vec<CanonicalRecord>,
    pub quarantine: Vec<QuarantineEntry>,
    pub warnings: Vec<FieldWarning>,
    pub layout: SheetLayout,
}

/// Parse `bytes` and map every data row onto `schema`.
pub fn normalize(schema: &CategorySchema, bytes: &[u8]) -> Result<NormalizedBatch, NormalizeError> {
    let category = schema.category();
    let rows = read_rows(bytes).map_err(|source| NormalizeError::Malformed { category, source })?;

    let header_idx = locate_header(schema, &rows)?;
    let header = &rows[header_idx];
    let (columns, unmapped_columns) = map_columns(schema, header);
    if !unmapped_columns.is_empty() {
        debug!(%category, columns = ?unmapped_columns, "ignoring unmapped source columns");
    }

    let mut body_start = header_idx + 1;
    let mut units_row = None;
    if let Some(candidate) = rows.get(body_start) {
        if is_units_row(schema, &columns, candidate) {
            units_row = Some(candidate.number);
            body_start += 1;
        }
    }

    let mut batch = NormalizedBatch {
        category,
        records: Vec::new(),
        quarantine: Vec::new(),
        warnings: Vec::new(),
        layout: SheetLayout {
            header_row: header.number,
            units_row,
            data_rows: 0,
            unmapped_columns,
        },
    };

    for row in rows[body_start..].iter().filter(|row| !row.is_blank()) {
        batch.layout.data_rows += 1;
        match normalize_row(schema, &columns, row, &mut batch.warnings) {
            Ok(record) => batch.records.push(record),
            Err(entry) => batch.quarantine.push(entry),
        }
    }
    Ok(batch)
}

/// Column index per schema field, in schema order.
type ColumnMap = Vec<Option<usize>>;

fn resolved_fields(schema: &CategorySchema, row: &SheetRow) -> BTreeSet<&'static str> {
    row.cells
        .iter()
        .filter_map(|cell| schema.resolve_column(&cell.display_text()))
        .map(|field| field.name)
        .collect()
}

fn locate_header(schema: &CategorySchema, rows: &[SheetRow]) -> Result<usize, NormalizeError> {
    let mut best: Option<(usize, BTreeSet<&'static str>)> = None;
    for (idx, row) in rows.iter().enumerate().take(HEADER_SCAN_ROWS) {
        let found = resolved_fields(schema, row);
        if schema.required_fields().all(|f| found.contains(f.name)) {
            return Ok(idx);
        }
        if best.as_ref().map_or(true, |(_, b)| found.len() > b.len()) {
            best = Some((idx, found));
        }
    }

    let found = best.map(|(_, found)| found).unwrap_or_default();
    let missing = schema
        .required_fields()
        .filter(|f| !found.contains(f.name))
        .map(|f| f.name.to_string())
        .collect::<Vec<_>>();
    warn!(
        category = %schema.category(),
        ?missing,
        "source layout no longer carries required columns"
    );
    Err(NormalizeError::SchemaDrift {
        category: schema.category(),
        missing,
    })
}

fn map_columns(schema: &CategorySchema, header: &SheetRow) -> (ColumnMap, Vec<String>) {
    let mut columns: ColumnMap = vec![None; schema.fields().len()];
    let mut unmapped = Vec::new();
    for (col, cell) in header.cells.iter().enumerate() {
        let raw = cell.display_text();
        if raw.is_empty() {
            continue;
        }
        let slot = schema
            .resolve_column(&raw)
            .and_then(|field| schema.fields().iter().position(|f| f.name == field.name));
        match slot {
            Some(idx) if columns[idx].is_none() => columns[idx] = Some(col),
            _ => unmapped.push(raw),
        }
    }
    (columns, unmapped)
}

/// A row directly under the header counts as a units row only when every
/// non-blank cell is a unit label. Bare labels such as `W` are trusted under
/// numeric and date columns; text and boolean columns need `(unit)` form.
fn is_units_row(schema: &CategorySchema, columns: &ColumnMap, row: &SheetRow) -> bool {
    let required_blank = schema
        .fields()
        .iter()
        .zip(columns)
        .filter(|(field, _)| field.required)
        .all(|(_, col)| col.map_or(true, |c| row.cell(c).is_blank()));
    if !required_blank || row.is_blank() {
        return false;
    }
    row.cells
        .iter()
        .enumerate()
        .filter(|(_, cell)| !cell.is_blank())
        .all(|(col, cell)| {
            let RawCell::Text(text) = cell else {
                return false;
            };
            let field_type = columns
                .iter()
                .position(|mapped| *mapped == Some(col))
                .map(|idx| schema.fields()[idx].field_type);
            match field_type {
                Some(FieldType::Text | FieldType::Boolean) => is_bracketed_unit(text),
                _ => is_bracketed_unit(text) || is_unit_label(text),
            }
        })
}

fn is_bracketed_unit(text: &str) -> bool {
    let text = text.trim();
    let inner = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .or_else(|| text.strip_prefix('[').and_then(|t| t.strip_suffix(']')));
    inner.is_some_and(|inner| {
        let inner = inner.trim();
        !inner.is_empty()
            && inner.chars().count() <= UNITS_CELL_MAX_CHARS
            && (is_unit_label(inner) || !inner.chars().any(|c| c.is_ascii_digit()))
    })
}

fn is_unit_label(text: &str) -> bool {
    let text = text.trim();
    UNIT_LABELS.iter().any(|unit| unit.eq_ignore_ascii_case(text))
}

fn normalize_row(
    schema: &CategorySchema,
    columns: &ColumnMap,
    row: &SheetRow,
    warnings: &mut Vec<FieldWarning>,
) -> Result<CanonicalRecord, QuarantineEntry> {
    let mut record = CanonicalRecord::new(schema.category(), row.number);
    let mut rejection: Option<QuarantineEntry> = None;

    for (field, col) in schema.fields().iter().zip(columns) {
        let cell = col.map_or(&RawCell::Empty, |c| row.cell(c));
        let value = match coerce(field.field_type, cell) {
            Ok(value) => value,
            Err(raw) if field.required => {
                if rejection.is_none() {
                    rejection = Some(QuarantineEntry {
                        row: row.number,
                        field: field.name.to_string(),
                        reason: QuarantineReason::InvalidValue { raw },
                    });
                }
                continue;
            }
            Err(raw) => {
                warnings.push(FieldWarning {
                    row: row.number,
                    field: field.name.to_string(),
                    raw,
                });
                FieldValue::Unknown
            }
        };
        if field.required && value.is_unknown() && rejection.is_none() {
            rejection = Some(missing(row, field));
        }
        record.set(field.name, value);
    }

    match rejection {
        Some(entry) => Err(entry),
        None => Ok(record),
    }
}

fn missing(row: &SheetRow, field: &FieldSpec) -> QuarantineEntry {
    QuarantineEntry {
        row: row.number,
        field: field.name.to_string(),
        reason: QuarantineReason::Missing,
    }
}

pub fn is_unknown_sentinel(text: &str) -> bool {
    let trimmed = text.trim();
    UNKNOWN_SENTINELS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(trimmed))
}

/// Coerce a cell to `field_type`. Blank and sentinel cells become Unknown;
/// `Err` carries the raw text of a cell that could not be coerced.
pub fn coerce(field_type: FieldType, cell: &RawCell) -> Result<FieldValue, String> {
    if let RawCell::Text(text) = cell {
        if is_unknown_sentinel(text) {
            return Ok(FieldValue::Unknown);
        }
    }
    match (field_type, cell) {
        (_, RawCell::Empty) => Ok(FieldValue::Unknown),
        (FieldType::Text, cell) => Ok(FieldValue::Text(coerce_text(cell))),
        (FieldType::Number, RawCell::Number(n)) => Ok(FieldValue::Number(*n)),
        (FieldType::Number, RawCell::Text(text)) => parse_number(text)
            .map(FieldValue::Number)
            .ok_or_else(|| text.trim().to_string()),
        (FieldType::Date, RawCell::DateTime(n) | RawCell::Number(n)) => date_from_numeric(*n)
            .map(FieldValue::Date)
            .ok_or_else(|| format_number(*n)),
        (FieldType::Date, RawCell::Text(text)) => parse_date(text)
            .map(FieldValue::Date)
            .ok_or_else(|| text.trim().to_string()),
        (FieldType::Boolean, RawCell::Bool(b)) => Ok(FieldValue::Boolean(*b)),
        (FieldType::Boolean, RawCell::Number(n)) if *n == 1.0 || *n == 0.0 => {
            Ok(FieldValue::Boolean(*n == 1.0))
        }
        (FieldType::Boolean, RawCell::Text(text)) => parse_boolean(text)
            .map(FieldValue::Boolean)
            .ok_or_else(|| text.trim().to_string()),
        (_, cell) => Err(cell.display_text()),
    }
}

fn coerce_text(cell: &RawCell) -> String {
    match cell {
        RawCell::DateTime(n) => date_from_numeric(*n)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| format_number(*n)),
        other => other.display_text(),
    }
}

/// Tolerates thousands separators and a trailing unit suffix such as `W`,
/// `kWh` or `%`.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', "");
    if let Ok(value) = cleaned.parse::<f64>() {
        return value.is_finite().then_some(value);
    }
    let split = cleaned
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+')))
        .unwrap_or(cleaned.len());
    let (number, unit) = cleaned.split_at(split);
    let unit = unit.trim();
    if number.is_empty() || unit.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return Some(datetime.date());
        }
    }
    if text.len() == 7 && text.as_bytes()[4] == b'-' {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{text}-01"), "%Y-%m-%d") {
            return Some(date);
        }
    }
    text.parse::<f64>().ok().and_then(date_from_numeric)
}

/// Excel serial day numbers, or Unix timestamps in seconds or milliseconds.
pub fn date_from_numeric(value: f64) -> Option<NaiveDate> {
    if !value.is_finite() {
        return None;
    }
    if value >= UNIX_MILLIS_MIN {
        return DateTime::from_timestamp_millis(value as i64).map(|dt| dt.date_naive());
    }
    if value >= UNIX_SECONDS_MIN {
        return DateTime::from_timestamp(value as i64, 0).map(|dt| dt.date_naive());
    }
    if (1.0..=EXCEL_SERIAL_MAX).contains(&value) {
        let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
        return epoch.checked_add_signed(Duration::days(value.floor() as i64));
    }
    None
}

pub fn parse_boolean(text: &str) -> Option<bool> {
    let lowered = text.trim().to_ascii_lowercase();
    if TRUE_WORDS.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSE_WORDS.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}
