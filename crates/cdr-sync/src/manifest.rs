//! Staging manifest
//!
//! Written next to the artifacts once a period has been fully converted. Its
//! presence marks the staging as complete; the per-file checksums decide
//! whether a retained staging may be reused on a later run.

use crate::artifact::TableArtifact;
use crate::error::{Result, SyncError};
use crate::layout::write_atomic;
use crate::period::Period;
use cdr_common::checksum::sha256_file;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub table_name: String,
    /// File name relative to the artifact directory
    pub file: String,
    pub row_count: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingManifest {
    pub period: Period,
    pub created_at: DateTime<Utc>,
    pub tables: Vec<ManifestEntry>,
}

impl StagingManifest {
    pub fn new(period: &Period, artifacts: &[TableArtifact]) -> Result<Self> {
        let tables = artifacts
            .iter()
            .map(|artifact| {
                let file = artifact
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        SyncError::conversion(
                            period,
                            Some(artifact.table_name.as_str()),
                            "artifact path has no file name",
                        )
                    })?;
                Ok(ManifestEntry {
                    table_name: artifact.table_name.clone(),
                    file,
                    row_count: artifact.row_count,
                    sha256: artifact.checksum.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            period: period.clone(),
            created_at: Utc::now(),
            tables,
        })
    }

    pub fn save(&self, artifact_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(&artifact_dir.join(MANIFEST_FILE), content.as_bytes())
    }

    pub fn load(artifact_dir: &Path) -> Result<Option<Self>> {
        let path = artifact_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Artifacts of a previously completed staging, if every file is intact
    ///
    /// Returns `None` when there is no manifest, when it belongs to another
    /// period, or when any artifact is missing or fails its checksum.
    pub fn load_verified(artifact_dir: &Path, period: &Period) -> Result<Option<Vec<TableArtifact>>> {
        let manifest = match Self::load(artifact_dir) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(period = %period, error = %e, "Unreadable staging manifest, restaging");
                return Ok(None);
            },
        };

        if &manifest.period != period || manifest.tables.is_empty() {
            return Ok(None);
        }

        let mut artifacts = Vec::with_capacity(manifest.tables.len());
        for entry in manifest.tables {
            let path = artifact_dir.join(&entry.file);
            if !path.exists() {
                warn!(period = %period, file = %entry.file, "Staged artifact missing, restaging");
                return Ok(None);
            }
            let actual = sha256_file(&path)?;
            if !actual.eq_ignore_ascii_case(&entry.sha256) {
                warn!(period = %period, file = %entry.file, "Staged artifact checksum mismatch, restaging");
                return Ok(None);
            }
            artifacts.push(TableArtifact {
                table_name: entry.table_name,
                path,
                row_count: entry.row_count,
                checksum: entry.sha256,
            });
        }

        debug!(period = %period, tables = artifacts.len(), "Verified staged artifacts");
        Ok(Some(artifacts))
    }
}
