// Local staging directory layout
//
//   {root}/archives/call_{period}.zip    raw download, deleted after commit
//   {root}/extracted/{period}/           unpacked schedules, deleted after commit
//   {root}/artifacts/{period}/           columnar artifacts + manifest, retained

use crate::error::{Result, SyncError};
use crate::period::Period;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_DATA_DIR: &str = "data/raw";

#[derive(Debug, Clone)]
pub struct StagingLayout {
    root: PathBuf,
}

impl StagingLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, period: &Period) -> PathBuf {
        self.root
            .join("archives")
            .join(format!("call_{}.zip", period.id()))
    }

    pub fn extract_dir(&self, period: &Period) -> PathBuf {
        self.root.join("extracted").join(period.id())
    }

    pub fn artifact_dir(&self, period: &Period) -> PathBuf {
        self.root.join("artifacts").join(period.id())
    }
}

impl Default for StagingLayout {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

/// Replace `path` with `contents` through a synced temp file in the same
/// directory, so readers see either the old file or the new one
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SyncError::Io(e.error))?;
    Ok(())
}
