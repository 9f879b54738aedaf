use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cec_core::{EquipmentCategory, RunContext};
use cec_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::sheet::SheetFormat;

const KNOWN_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods", "csv"];

/// Spreadsheet bytes for one category as delivered by its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSource {
    pub category: EquipmentCategory,
    pub location: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl RawSource {
    /// File extension for archiving: the location's own when recognisable,
    /// otherwise derived from the content.
    pub fn extension(&self) -> String {
        let from_location = self
            .location
            .rsplit(['/', '\\'])
            .next()
            .and_then(|name| name.split(['?', '#']).next())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()));
        from_location
            .unwrap_or_else(|| SheetFormat::detect(&self.bytes).default_extension().to_string())
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no source configured for {0}")]
    NotConfigured(EquipmentCategory),
    #[error("{category}: fetching {location} failed: {source}")]
    Http {
        category: EquipmentCategory,
        location: String,
        #[source]
        source: FetchError,
    },
    #[error("{category}: reading {} failed: {source}", path.display())]
    Io {
        category: EquipmentCategory,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{category}: {location} is empty")]
    Empty {
        category: EquipmentCategory,
        location: String,
    },
}

/// Retrieves the current spreadsheet for a category.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        ctx: &RunContext,
        category: EquipmentCategory,
    ) -> Result<RawSource, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Http(String),
    File(PathBuf),
}

impl SourceLocation {
    /// `http(s)://` URLs are fetched over the network; `file://` URLs and bare
    /// paths are read from disk, relative paths resolving against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Self {
        let raw = raw.trim();
        let lowered = raw.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return SourceLocation::Http(raw.to_string());
        }
        let path = Path::new(raw.strip_prefix("file://").unwrap_or(raw));
        if path.is_absolute() {
            SourceLocation::File(path.to_path_buf())
        } else {
            SourceLocation::File(base_dir.join(path))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SourceLocation::Http(url) => url.clone(),
            SourceLocation::File(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub location: SourceLocation,
    /// Accepted `Content-Type` media types; empty accepts any.
    pub expected_content_types: Vec<String>,
}

/// Fetches each category from its configured location.
#[derive(Debug, Clone)]
pub struct LocationFetcher {
    http: Arc<HttpFetcher>,
    sources: HashMap<EquipmentCategory, SourceSpec>,
}

impl LocationFetcher {
    pub fn new(http: Arc<HttpFetcher>, sources: HashMap<EquipmentCategory, SourceSpec>) -> Self {
        Self { http, sources }
    }

    pub fn spec(&self, category: EquipmentCategory) -> Option<&SourceSpec> {
        self.sources.get(&category)
    }
}

#[async_trait]
impl SourceFetcher for LocationFetcher {
    async fn fetch(
        &self,
        ctx: &RunContext,
        category: EquipmentCategory,
    ) -> Result<RawSource, SourceError> {
        let spec = self
            .sources
            .get(&category)
            .ok_or(SourceError::NotConfigured(category))?;

        let (location, content_type, bytes) = match &spec.location {
            SourceLocation::Http(url) => {
                let response = self
                    .http
                    .fetch_bytes(ctx.run_id, category.as_str(), url, &spec.expected_content_types)
                    .await
                    .map_err(|source| SourceError::Http {
                        category,
                        location: url.clone(),
                        source,
                    })?;
                (response.final_url, response.content_type, response.body)
            }
            SourceLocation::File(path) => {
                let bytes = fs::read(path).await.map_err(|source| SourceError::Io {
                    category,
                    path: path.clone(),
                    source,
                })?;
                (path.display().to_string(), None, bytes)
            }
        };

        if bytes.is_empty() {
            return Err(SourceError::Empty { category, location });
        }
        debug!(%category, %location, bytes = bytes.len(), "source fetched");
        Ok(RawSource {
            category,
            location,
            content_type,
            bytes,
            fetched_at: Utc::now(),
        })
    }
}
