//! Raw-vintage archive, HTTP fetch utilities and the transactional record store.

mod archive;
mod http;
mod records;

pub use archive::{ArchivedVintage, VintageArchive};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use records::{ChangeSet, ColumnInfo, RecordStore, StoreError, StoredIdentity};

pub const CRATE_NAME: &str = "cec-storage";
