//! Columnar table artifacts
//!
//! One artifact holds one schedule for one period, laid out column-major and
//! written as gzip-compressed JSON. Cells are kept as the exact strings read
//! from the source file; nothing is typed or trimmed.

use crate::error::{Result, SyncError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const ARTIFACT_EXTENSION: &str = "cols.json.gz";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarArtifact {
    pub format_version: u32,
    pub table: String,
    pub period: String,
    pub columns: Vec<Column>,
}

impl ColumnarArtifact {
    /// Build from row-major data; every row must be as wide as `header`
    pub fn from_rows(
        table: impl Into<String>,
        period: impl Into<String>,
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> Result<Self> {
        let table = table.into();
        let period = period.into();
        let mut columns: Vec<Column> = header
            .into_iter()
            .map(|name| Column {
                name,
                values: Vec::with_capacity(rows.len()),
            })
            .collect();

        for (idx, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(SyncError::conversion(
                    &period,
                    Some(table.as_str()),
                    format!(
                        "row {} has {} fields, expected {}",
                        idx + 1,
                        row.len(),
                        columns.len()
                    ),
                ));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value);
            }
        }

        Ok(Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            table,
            period,
            columns,
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }

    /// Materialize rows in `range` back into row-major order
    pub fn rows(&self, range: Range<usize>) -> Vec<Vec<String>> {
        let end = range.end.min(self.row_count());
        (range.start.min(end)..end)
            .map(|row| self.columns.iter().map(|c| c.values[row].clone()).collect())
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let artifact: Self = serde_json::from_reader(decoder)?;

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(SyncError::conversion(
                &artifact.period,
                Some(artifact.table.as_str()),
                format!(
                    "unsupported artifact format version {}",
                    artifact.format_version
                ),
            ));
        }
        Ok(artifact)
    }
}

/// Handle on an artifact written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableArtifact {
    pub table_name: String,
    pub path: PathBuf,
    pub row_count: u64,
    /// Hex SHA-256 of the file at `path`
    pub checksum: String,
}

pub fn artifact_file_name(table: &str) -> String {
    format!("{}.{}", table, ARTIFACT_EXTENSION)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_rows_slice_back_to_row_major() {
        let artifact = ColumnarArtifact::from_rows(
            "RC",
            "2024Q1",
            strings(&["IDRSSD", "RCFD2170"]),
            vec![strings(&["1", "100"]), strings(&["2", ""]), strings(&["3", "300"])],
        )
        .unwrap();

        assert_eq!(artifact.row_count(), 3);
        assert_eq!(artifact.rows(1..3), vec![strings(&["2", ""]), strings(&["3", "300"])]);
        assert_eq!(artifact.rows(2..10), vec![strings(&["3", "300"])]);
        assert!(artifact.rows(5..9).is_empty());
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        let err = ColumnarArtifact::from_rows(
            "RC",
            "2024Q1",
            strings(&["a", "b"]),
            vec![strings(&["1"])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("table 'RC'"));
    }

    #[test]
    fn test_file_preserves_cells_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(artifact_file_name("RI"));
        let artifact = ColumnarArtifact::from_rows(
            "RI",
            "2024Q1",
            strings(&["name"]),
            vec![strings(&["  Caf\u{e9} Bank  "]), strings(&["\"quoted\""])],
        )
        .unwrap();

        artifact.write(&path).unwrap();
        assert_eq!(ColumnarArtifact::read(&path).unwrap(), artifact);
    }
}
