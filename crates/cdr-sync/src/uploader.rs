//! Batched upload of one table artifact
//!
//! The artifact's rows are split into disjoint, contiguous ranges that cover
//! every row exactly once. Each range is one remote write, retried under the
//! configured [`RetryPolicy`]. Rows a previous attempt left behind for the same
//! period are purged first, and the downstream count is checked afterwards, so
//! a write that timed out after the store accepted it cannot leave duplicates
//! behind unnoticed.

use crate::artifact::{ColumnarArtifact, TableArtifact};
use crate::error::UploadError;
use crate::period::Period;
use crate::retry::RetryPolicy;
use crate::store::{RemoteStore, BOOKKEEPING_COLUMNS};
use chrono::Utc;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 5_000;

/// Outcome of a fully uploaded table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub table_name: String,
    pub rows_uploaded: u64,
    pub batches: usize,
}

/// Split `total` rows into ranges of at most `batch_size`
pub fn batch_ranges(total: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..total)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(total))
        .collect()
}

#[derive(Clone)]
pub struct BatchUploader {
    store: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    batch_size: usize,
}

impl BatchUploader {
    pub fn new(store: Arc<dyn RemoteStore>, policy: RetryPolicy, batch_size: usize) -> Self {
        Self {
            store,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Rows per write for a table with `columns` source columns
    pub fn effective_batch_size(&self, columns: usize) -> usize {
        match self.store.max_bind_params() {
            Some(limit) => {
                let per_row = columns + BOOKKEEPING_COLUMNS;
                self.batch_size.min((limit / per_row).max(1))
            },
            None => self.batch_size,
        }
    }

    /// Push every row of `artifact` to the remote table for `period`
    pub async fn upload_table(
        &self,
        period: &Period,
        artifact: &TableArtifact,
    ) -> Result<UploadResult, UploadError> {
        let table = artifact.table_name.as_str();
        let fail = |rows_uploaded: u64, rows_total: u64, reason: String| UploadError {
            table_name: table.to_string(),
            rows_uploaded,
            rows_total,
            reason,
        };

        let data = load_artifact(&artifact.path)
            .await
            .map_err(|reason| fail(0, artifact.row_count, reason))?;
        let rows_total = data.row_count() as u64;
        let columns = data.column_names();

        self.policy
            .run("ensure table", || self.store.ensure_table(table, &columns))
            .await
            .map_err(|e| fail(0, rows_total, e.to_string()))?;

        let purged = self
            .policy
            .run("purge period", || self.store.purge_period(table, period.id()))
            .await
            .map_err(|e| fail(0, rows_total, e.to_string()))?;
        if purged > 0 {
            warn!(period = %period, table, purged, "Removed rows left by an earlier attempt");
        }

        let batch_size = self.effective_batch_size(columns.len());
        let ranges = batch_ranges(data.row_count(), batch_size);
        let uploaded_at = Utc::now();
        let mut rows_uploaded = 0u64;

        debug!(
            period = %period,
            table,
            rows = rows_total,
            batches = ranges.len(),
            batch_size,
            "Uploading table"
        );

        for (idx, range) in ranges.iter().enumerate() {
            let rows = data.rows(range.clone());
            let label = format!("insert batch {}/{} of {}", idx + 1, ranges.len(), table);

            let written = self
                .policy
                .run(&label, || {
                    self.store
                        .insert_batch(table, &columns, period.id(), uploaded_at, &rows)
                })
                .await
                .map_err(|e| fail(rows_uploaded, rows_total, e.to_string()))?;

            if written != rows.len() as u64 {
                return Err(fail(
                    rows_uploaded,
                    rows_total,
                    format!("batch {} wrote {} of {} rows", idx + 1, written, rows.len()),
                ));
            }
            rows_uploaded += written;
        }

        let downstream = self
            .policy
            .run("verify row count", || {
                self.store.count_period_rows(table, period.id())
            })
            .await
            .map_err(|e| fail(rows_uploaded, rows_total, e.to_string()))?;

        if downstream != rows_total {
            return Err(fail(
                rows_uploaded,
                rows_total,
                format!(
                    "remote table holds {} rows for period {}, expected {}",
                    downstream, period, rows_total
                ),
            ));
        }

        info!(period = %period, table, rows = rows_uploaded, "Table uploaded");
        Ok(UploadResult {
            table_name: table.to_string(),
            rows_uploaded,
            batches: ranges.len(),
        })
    }

    /// Remove everything this period wrote to `tables`
    ///
    /// Best effort: every table is attempted and the failures are returned.
    pub async fn rollback(&self, period: &Period, tables: &[String]) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        for table in tables {
            match self
                .policy
                .run("rollback period", || self.store.purge_period(table, period.id()))
                .await
            {
                Ok(removed) => debug!(period = %period, table = %table, removed, "Rolled back"),
                Err(e) => {
                    warn!(period = %period, table = %table, error = %e, "Rollback failed");
                    failures.push((table.clone(), e.to_string()));
                },
            }
        }
        failures
    }
}

async fn load_artifact(path: &Path) -> Result<ColumnarArtifact, String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || ColumnarArtifact::read(&path))
        .await
        .map_err(|e| format!("artifact reader task failed: {}", e))?
        .map_err(|e| format!("cannot read artifact: {}", e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{write_artifact, MemoryStore};
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
        }
    }

    proptest! {
        #[test]
        fn prop_batches_partition_rows(total in 0usize..5_000, size in 1usize..700) {
            let ranges = batch_ranges(total, size);
            prop_assert_eq!(ranges.len(), total.div_ceil(size));

            let mut next = 0;
            for range in &ranges {
                prop_assert_eq!(range.start, next);
                prop_assert!(range.end > range.start);
                prop_assert!(range.len() <= size);
                next = range.end;
            }
            prop_assert_eq!(next, total);
        }
    }

    #[test]
    fn test_batch_size_respects_bind_limit() {
        let store = Arc::new(MemoryStore::new().with_max_bind_params(1_000));
        let uploader = BatchUploader::new(store, fast_policy(), 5_000);
        // 98 source columns + 2 bookkeeping = 100 binds per row
        assert_eq!(uploader.effective_batch_size(98), 10);

        let unlimited = BatchUploader::new(Arc::new(MemoryStore::new()), fast_policy(), 250);
        assert_eq!(unlimited.effective_batch_size(98), 250);
    }

    #[tokio::test]
    async fn test_upload_in_ceil_batches() {
        let dir = TempDir::new().unwrap();
        let period = Period::parse("2024Q1").unwrap();
        let artifact = write_artifact(dir.path(), &period, "RC", 1_050);
        let store = Arc::new(MemoryStore::new());
        let uploader = BatchUploader::new(store.clone(), fast_policy(), 100);

        let result = uploader.upload_table(&period, &artifact).await.unwrap();

        assert_eq!(result.rows_uploaded, 1_050);
        assert_eq!(result.batches, 11);
        assert_eq!(store.insert_calls("RC"), 11);
        assert_eq!(store.row_count("RC", "2024Q1"), 1_050);
    }

    #[tokio::test]
    async fn test_single_retry_does_not_double_count() {
        let dir = TempDir::new().unwrap();
        let period = Period::parse("2024Q1").unwrap();
        let artifact = write_artifact(dir.path(), &period, "RC", 300);
        let store = Arc::new(MemoryStore::new());
        store.fail_next_inserts("RC", 1);
        let uploader = BatchUploader::new(store.clone(), fast_policy(), 100);

        let result = uploader.upload_table(&period, &artifact).await.unwrap();

        assert_eq!(result.rows_uploaded, 300);
        assert_eq!(store.insert_calls("RC"), 4);
        assert_eq!(store.row_count("RC", "2024Q1"), 300);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_partial_progress() {
        let dir = TempDir::new().unwrap();
        let period = Period::parse("2024Q1").unwrap();
        let artifact = write_artifact(dir.path(), &period, "RC", 250);
        let store = Arc::new(MemoryStore::new());
        store.fail_inserts_after("RC", 2);
        let uploader = BatchUploader::new(store.clone(), fast_policy(), 100);

        let err = uploader.upload_table(&period, &artifact).await.unwrap_err();

        assert_eq!(err.table_name, "RC");
        assert_eq!(err.rows_uploaded, 200);
        assert_eq!(err.rows_total, 250);
        assert!(artifact.path.exists());
    }

    #[tokio::test]
    async fn test_leftover_rows_are_purged_first() {
        let dir = TempDir::new().unwrap();
        let period = Period::parse("2024Q1").unwrap();
        let artifact = write_artifact(dir.path(), &period, "RC", 40);
        let store = Arc::new(MemoryStore::new());
        store.seed_rows("RC", "2024Q1", 17);
        store.seed_rows("RC", "2023Q4", 5);
        let uploader = BatchUploader::new(store.clone(), fast_policy(), 100);

        uploader.upload_table(&period, &artifact).await.unwrap();

        assert_eq!(store.row_count("RC", "2024Q1"), 40);
        assert_eq!(store.row_count("RC", "2023Q4"), 5);
    }

    #[tokio::test]
    async fn test_rollback_clears_only_the_period() {
        let period = Period::parse("2024Q1").unwrap();
        let store = Arc::new(MemoryStore::new());
        store.seed_rows("RC", "2024Q1", 10);
        store.seed_rows("RI", "2024Q1", 3);
        store.seed_rows("RI", "2023Q4", 8);
        let uploader = BatchUploader::new(store.clone(), fast_policy(), 100);

        let failures = uploader
            .rollback(&period, &["RC".to_string(), "RI".to_string(), "ENT".to_string()])
            .await;

        assert!(failures.is_empty());
        assert_eq!(store.row_count("RC", "2024Q1"), 0);
        assert_eq!(store.row_count("RI", "2024Q1"), 0);
        assert_eq!(store.row_count("RI", "2023Q4"), 8);
    }
}
