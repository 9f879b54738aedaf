use std::path::{Path, PathBuf};

use anyhow::Context;
use cec_core::EquipmentCategory;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// A fetched spreadsheet vintage as persisted in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedVintage {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived under this path.
    pub deduplicated: bool,
}

/// Write-once, hash-addressed store of raw source bytes, one file per
/// category and fetch timestamp.
#[derive(Debug, Clone)]
pub struct VintageArchive {
    root: PathBuf,
}

impl VintageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn vintage_relative_path(
        fetched_at: DateTime<Utc>,
        category: EquipmentCategory,
        sha256: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(category.as_str())
            .join(format!("{sha256}.{ext}"))
    }

    /// Persist `bytes` through a temp file and an atomic rename; a file that
    /// already exists at the target path is left untouched.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        category: EquipmentCategory,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedVintage> {
        let sha256 = Self::sha256_hex(bytes);
        let relative_path = Self::vintage_relative_path(fetched_at, category, &sha256, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let vintage = |deduplicated| ArchivedVintage {
            sha256: sha256.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(vintage(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("writing archive temp file {}", temp_path.display()));
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(vintage(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(vintage(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
