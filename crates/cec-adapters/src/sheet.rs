//! Format-agnostic view of the first worksheet of a spreadsheet.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use cec_core::format_number;
use thiserror::Error;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetFormat {
    /// ZIP container: xlsx, xlsb or ods.
    Workbook,
    /// OLE2 compound document: legacy xls.
    LegacyWorkbook,
    Csv,
}

impl SheetFormat {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(ZIP_MAGIC) {
            SheetFormat::Workbook
        } else if bytes.starts_with(OLE2_MAGIC) {
            SheetFormat::LegacyWorkbook
        } else {
            SheetFormat::Csv
        }
    }

    pub fn default_extension(self) -> &'static str {
        match self {
            SheetFormat::Workbook => "xlsx",
            SheetFormat::LegacyWorkbook => "xls",
            SheetFormat::Csv => "csv",
        }
    }
}

/// A single cell as read from the source, before any coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Excel serial date-time.
    DateTime(f64),
}

impl RawCell {
    pub fn is_blank(&self) -> bool {
        match self {
            RawCell::Empty => true,
            RawCell::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    /// Cell rendered as header text.
    pub fn display_text(&self) -> String {
        match self {
            RawCell::Empty => String::new(),
            RawCell::Text(text) => text.trim().to_string(),
            RawCell::Number(n) | RawCell::DateTime(n) => format_number(*n),
            RawCell::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    /// 1-based row number within the sheet.
    pub number: usize,
    pub cells: Vec<RawCell>,
}

impl SheetRow {
    pub fn cell(&self, column: usize) -> &RawCell {
        self.cells.get(column).unwrap_or(&RawCell::Empty)
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(RawCell::is_blank)
    }
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("workbook could not be opened: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("workbook has no worksheets")]
    NoWorksheet,
    #[error("csv could not be read: {0}")]
    Csv(#[from] csv::Error),
}

pub fn read_rows(bytes: &[u8]) -> Result<Vec<SheetRow>, SheetError> {
    match SheetFormat::detect(bytes) {
        SheetFormat::Workbook | SheetFormat::LegacyWorkbook => read_workbook(bytes),
        SheetFormat::Csv => read_csv(bytes),
    }
}

fn read_workbook(bytes: &[u8]) -> Result<Vec<SheetRow>, SheetError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(SheetError::NoWorksheet)??;
    let (first_row, first_col) = range
        .start()
        .map(|(row, col)| (row as usize, col as usize))
        .unwrap_or_default();

    Ok(range
        .rows()
        .enumerate()
        .map(|(idx, row)| {
            let mut cells = vec![RawCell::Empty; first_col];
            cells.extend(row.iter().map(workbook_cell));
            SheetRow {
                number: first_row + idx + 1,
                cells,
            }
        })
        .collect())
}

fn workbook_cell(data: &Data) -> RawCell {
    match data {
        Data::Empty => RawCell::Empty,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => RawCell::Text(s.clone()),
        Data::Float(f) => RawCell::Number(*f),
        Data::Int(i) => RawCell::Number(*i as f64),
        Data::Bool(b) => RawCell::Bool(*b),
        Data::DateTime(dt) => RawCell::DateTime(dt.as_f64()),
        Data::Error(err) => RawCell::Text(format!("#{err}")),
    }
}

fn read_csv(bytes: &[u8]) -> Result<Vec<SheetRow>, SheetError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let cells = record
            .iter()
            .map(|field| {
                if field.is_empty() {
                    RawCell::Empty
                } else {
                    RawCell::Text(field.to_string())
                }
            })
            .collect();
        rows.push(SheetRow {
            number: idx + 1,
            cells,
        });
    }
    Ok(rows)
}
