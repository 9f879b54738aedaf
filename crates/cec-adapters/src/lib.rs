//! Source fetcher contract, spreadsheet reading and normalization.

mod normalize;
mod sheet;
mod source;

pub use normalize::{
    coerce, date_from_numeric, is_unknown_sentinel, normalize, parse_boolean, parse_date,
    parse_number, NormalizeError, NormalizedBatch, SheetLayout, HEADER_SCAN_ROWS,
};
pub use sheet::{read_rows, RawCell, SheetError, SheetFormat, SheetRow};
pub use source::{
    LocationFetcher, RawSource, SourceError, SourceFetcher, SourceLocation, SourceSpec,
};

pub const CRATE_NAME: &str = "cec-adapters";
