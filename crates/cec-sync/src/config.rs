use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cec_adapters::{SourceLocation, SourceSpec};
use cec_core::EquipmentCategory;
use cec_storage::{BackoffPolicy, HttpClientConfig};
use serde::Deserialize;

/// Process-level settings read from `CEC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub parallelism: usize,
    pub archive_raw: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key).map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
        };
        Self {
            database_url: lookup("CEC_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://cec_equipment.db".to_string()),
            artifacts_dir: lookup("CEC_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            reports_dir: lookup("CEC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            sources_file: lookup("CEC_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            user_agent: lookup("CEC_USER_AGENT")
                .unwrap_or_else(|| format!("cec-sync/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: parsed(&lookup, "CEC_HTTP_TIMEOUT_SECS").unwrap_or(60),
            http_max_retries: parsed(&lookup, "CEC_HTTP_MAX_RETRIES").unwrap_or(3),
            parallelism: parsed::<usize>(&lookup, "CEC_PARALLELISM").unwrap_or(2).max(1),
            archive_raw: flag("CEC_ARCHIVE_RAW").unwrap_or(true),
            scheduler_enabled: flag("CEC_SCHEDULER_ENABLED").unwrap_or(false),
            sync_cron: lookup("CEC_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub category: EquipmentCategory,
    pub location: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub expected_content_types: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        for (idx, entry) in registry.sources.iter().enumerate() {
            if registry.sources[..idx].iter().any(|e| e.category == entry.category) {
                bail!("category {} is configured more than once", entry.category);
            }
            if entry.location.trim().is_empty() {
                bail!("category {} has an empty location", entry.category);
            }
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySource {
    pub display_name: String,
    pub enabled: bool,
    pub spec: SourceSpec,
}

/// Immutable configuration handed to the orchestrator for the lifetime of a
/// process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub sources: BTreeMap<EquipmentCategory, CategorySource>,
    pub parallelism: usize,
    /// Raw vintages are archived here when set.
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
}

impl PipelineConfig {
    pub fn from_sync_config(sync: &SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&sync.sources_file)?;
        let base_dir = sync
            .sources_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            sources: Self::resolve_sources(registry, &base_dir),
            parallelism: sync.parallelism.max(1),
            archive_dir: sync.archive_raw.then(|| sync.artifacts_dir.clone()),
            reports_dir: sync.reports_dir.clone(),
        })
    }

    pub fn resolve_sources(
        registry: SourceRegistry,
        base_dir: &Path,
    ) -> BTreeMap<EquipmentCategory, CategorySource> {
        registry
            .sources
            .into_iter()
            .map(|entry| {
                let source = CategorySource {
                    display_name: entry
                        .display_name
                        .unwrap_or_else(|| entry.category.to_string()),
                    enabled: entry.enabled,
                    spec: SourceSpec {
                        location: SourceLocation::parse(&entry.location, base_dir),
                        expected_content_types: entry.expected_content_types,
                    },
                };
                (entry.category, source)
            })
            .collect()
    }

    pub fn enabled_categories(&self) -> impl Iterator<Item = EquipmentCategory> + '_ {
        self.sources
            .iter()
            .filter(|(_, source)| source.enabled)
            .map(|(category, _)| *category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SOURCES: &str = r#"
sources:
  - category: modules
    display_name: PV Modules
    location: https://solarequipment.energy.ca.gov/Home/DownloadtoExcel?filename=PVModuleList
    expected_content_types:
      - application/vnd.openxmlformats-officedocument.spreadsheetml.sheet
  - category: meters
    location: fixtures/meters/sample.csv
  - category: batteries
    location: file:///srv/cec/batteries.xlsx
    enabled: false
"#;

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, "sqlite://cec_equipment.db");
        assert_eq!(config.http_timeout_secs, 60);
        assert_eq!(config.http_max_retries, 3);
        assert_eq!(config.parallelism, 2);
        assert!(config.archive_raw);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.sync_cron, "0 0 6 * * *");
    }

    #[test]
    fn environment_overrides_are_parsed() {
        let env = HashMap::from([
            ("CEC_PARALLELISM", "0"),
            ("CEC_ARCHIVE_RAW", "false"),
            ("CEC_SCHEDULER_ENABLED", "TRUE"),
            ("CEC_HTTP_MAX_RETRIES", "5"),
            ("CEC_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.parallelism, 1);
        assert!(!config.archive_raw);
        assert!(config.scheduler_enabled);
        assert_eq!(config.http_client_config().backoff.max_retries, 5);
        assert_eq!(config.http_timeout_secs, 60);
    }

    #[test]
    fn sources_resolve_against_the_registry_file() {
        let registry = SourceRegistry::parse(SOURCES).expect("parse");
        let sources = PipelineConfig::resolve_sources(registry, Path::new("/etc/cec"));

        assert_eq!(sources[&EquipmentCategory::Modules].display_name, "PV Modules");
        assert!(matches!(
            sources[&EquipmentCategory::Modules].spec.location,
            SourceLocation::Http(_)
        ));
        assert_eq!(
            sources[&EquipmentCategory::Meters].spec.location,
            SourceLocation::File(PathBuf::from("/etc/cec/fixtures/meters/sample.csv"))
        );
        assert_eq!(sources[&EquipmentCategory::Meters].display_name, "meters");

        let config = PipelineConfig {
            sources,
            parallelism: 2,
            archive_dir: None,
            reports_dir: PathBuf::from("reports"),
        };
        assert_eq!(
            config.enabled_categories().collect::<Vec<_>>(),
            vec![EquipmentCategory::Modules, EquipmentCategory::Meters]
        );
    }

    #[test]
    fn duplicate_categories_are_rejected() {
        let text = "sources:\n  - {category: meters, location: a.csv}\n  \
                    - {category: meters, location: b.csv}\n";
        let err = SourceRegistry::parse(text).expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn unknown_categories_fail_to_parse() {
        let text = "sources:\n  - {category: chargers, location: a.csv}\n";
        assert!(SourceRegistry::parse(text).is_err());
    }

    #[test]
    fn pipeline_config_loads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("sources.yaml");
        std::fs::write(&file, SOURCES).expect("write");
        let sync = SyncConfig {
            sources_file: file,
            archive_raw: false,
            ..SyncConfig::from_lookup(|_| None)
        };
        let config = PipelineConfig::from_sync_config(&sync).expect("load");
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.archive_dir, None);
        assert_eq!(
            config.sources[&EquipmentCategory::Meters].spec.location,
            SourceLocation::File(dir.path().join("fixtures/meters/sample.csv"))
        );
    }
}
