//! In-memory doubles for the source, converter and remote store

use crate::artifact::{artifact_file_name, ColumnarArtifact, TableArtifact};
use crate::error::{Result, StoreError, SyncError};
use crate::period::Period;
use crate::source::PeriodSource;
use crate::staging::StagingConverter;
use crate::store::{check_columns, RemoteStore};
use async_trait::async_trait;
use cdr_common::checksum::sha256_file;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// Write a two-column artifact with `rows` rows into `dir`
pub fn write_artifact(dir: &Path, period: &Period, table: &str, rows: usize) -> TableArtifact {
    let header = vec!["IDRSSD".to_string(), "VALUE".to_string()];
    let data = (0..rows)
        .map(|i| vec![i.to_string(), format!("{}-{}", table, i)])
        .collect();
    let artifact = ColumnarArtifact::from_rows(table, period.id(), header, data).unwrap();

    let path = dir.join(artifact_file_name(table));
    artifact.write(&path).unwrap();
    TableArtifact {
        table_name: table.to_string(),
        checksum: sha256_file(&path).unwrap(),
        path,
        row_count: rows as u64,
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Default)]
struct MemoryTable {
    columns: Vec<String>,
    /// (period, row)
    rows: Vec<(String, Vec<String>)>,
}

#[derive(Default)]
struct MemoryInner {
    tables: HashMap<String, MemoryTable>,
    insert_calls: HashMap<String, usize>,
    /// Fail this many upcoming inserts, then recover
    fail_next: HashMap<String, usize>,
    /// Allow this many more inserts, then fail every one
    fail_after: HashMap<String, usize>,
    /// Apply this many upcoming inserts but report them as failed
    lose_acks: HashMap<String, usize>,
    hang: HashSet<String>,
}

enum InsertPlan {
    Hang,
    Fail,
    Apply { ack: bool },
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    max_bind_params: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_bind_params(mut self, limit: usize) -> Self {
        self.max_bind_params = Some(limit);
        self
    }

    pub fn fail_next_inserts(&self, table: &str, n: usize) {
        self.inner.lock().unwrap().fail_next.insert(table.to_string(), n);
    }

    pub fn fail_inserts_after(&self, table: &str, successes: usize) {
        self.inner
            .lock()
            .unwrap()
            .fail_after
            .insert(table.to_string(), successes);
    }

    pub fn lose_next_acks(&self, table: &str, n: usize) {
        self.inner.lock().unwrap().lose_acks.insert(table.to_string(), n);
    }

    pub fn hang_inserts(&self, table: &str) {
        self.inner.lock().unwrap().hang.insert(table.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next.clear();
        inner.fail_after.clear();
        inner.lose_acks.clear();
        inner.hang.clear();
    }

    pub fn seed_rows(&self, table: &str, period: &str, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.tables.entry(table.to_string()).or_default();
        for i in 0..n {
            entry.rows.push((period.to_string(), vec![format!("seed-{}", i)]));
        }
    }

    pub fn row_count(&self, table: &str, period: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.rows.iter().filter(|(p, _)| p == period).count())
            .unwrap_or(0)
    }

    pub fn insert_calls(&self, table: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .insert_calls
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_insert_calls(&self) -> usize {
        self.inner.lock().unwrap().insert_calls.values().sum()
    }

    fn plan_insert(&self, table: &str) -> InsertPlan {
        let mut inner = self.inner.lock().unwrap();
        *inner.insert_calls.entry(table.to_string()).or_default() += 1;

        if inner.hang.contains(table) {
            return InsertPlan::Hang;
        }
        if let Some(n) = inner.fail_next.get_mut(table) {
            if *n > 0 {
                *n -= 1;
                return InsertPlan::Fail;
            }
        }
        if let Some(n) = inner.fail_after.get_mut(table) {
            if *n == 0 {
                return InsertPlan::Fail;
            }
            *n -= 1;
        }
        if let Some(n) = inner.lose_acks.get_mut(table) {
            if *n > 0 {
                *n -= 1;
                return InsertPlan::Apply { ack: false };
            }
        }
        InsertPlan::Apply { ack: true }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn ensure_table(&self, table: &str, columns: &[String]) -> std::result::Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.tables.entry(table.to_string()).or_default();
        if entry.columns.is_empty() {
            entry.columns = columns.to_vec();
            Ok(())
        } else {
            check_columns(table, &entry.columns, columns)
        }
    }

    async fn purge_period(&self, table: &str, period: &str) -> std::result::Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = entry.rows.len();
        entry.rows.retain(|(p, _)| p != period);
        Ok((before - entry.rows.len()) as u64)
    }

    async fn insert_batch(
        &self,
        table: &str,
        _columns: &[String],
        period: &str,
        _uploaded_at: DateTime<Utc>,
        rows: &[Vec<String>],
    ) -> std::result::Result<u64, StoreError> {
        let ack = match self.plan_insert(table) {
            InsertPlan::Hang => std::future::pending::<bool>().await,
            InsertPlan::Fail => {
                return Err(StoreError::Rejected(format!("injected failure on {}", table)))
            },
            InsertPlan::Apply { ack } => ack,
        };

        let mut inner = self.inner.lock().unwrap();
        let entry = inner.tables.entry(table.to_string()).or_default();
        for row in rows {
            entry.rows.push((period.to_string(), row.clone()));
        }
        drop(inner);

        if ack {
            Ok(rows.len() as u64)
        } else {
            Err(StoreError::Timeout(std::time::Duration::from_secs(1)))
        }
    }

    async fn count_period_rows(&self, table: &str, period: &str) -> std::result::Result<u64, StoreError> {
        Ok(self.row_count(table, period) as u64)
    }

    fn max_bind_params(&self) -> Option<usize> {
        self.max_bind_params
    }
}

// ============================================================================
// FakeSource
// ============================================================================

#[derive(Default)]
struct SourceInner {
    fetches: Vec<String>,
    failing: HashSet<String>,
    listing_fails: bool,
}

pub struct FakeSource {
    periods: Vec<Period>,
    inner: Mutex<SourceInner>,
}

impl FakeSource {
    pub fn new(periods: Vec<Period>) -> Self {
        Self {
            periods,
            inner: Mutex::new(SourceInner::default()),
        }
    }

    pub fn fail_fetch(&self, period: &Period) {
        self.inner
            .lock()
            .unwrap()
            .failing
            .insert(period.id().to_string());
    }

    pub fn fail_listing(&self) {
        self.inner.lock().unwrap().listing_fails = true;
    }

    pub fn fetch_count(&self, period: &Period) -> usize {
        self.inner
            .lock()
            .unwrap()
            .fetches
            .iter()
            .filter(|id| id.as_str() == period.id())
            .count()
    }

    pub fn fetch_order(&self) -> Vec<String> {
        self.inner.lock().unwrap().fetches.clone()
    }
}

#[async_trait]
impl PeriodSource for FakeSource {
    async fn list_periods(&self) -> Result<Vec<Period>> {
        if self.inner.lock().unwrap().listing_fails {
            return Err(SyncError::Discovery("listing unavailable".to_string()));
        }
        Ok(self.periods.clone())
    }

    async fn fetch_archive(&self, period: &Period, dest: &Path) -> Result<u64> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.fetches.push(period.id().to_string());
            if inner.failing.contains(period.id()) {
                return Err(SyncError::fetch(period, "HTTP 503 Service Unavailable"));
            }
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = format!("archive for {}", period);
        std::fs::write(dest, &body)?;
        Ok(body.len() as u64)
    }
}

// ============================================================================
// FakeConverter
// ============================================================================

#[derive(Default)]
struct ConverterInner {
    tables: HashMap<String, Vec<(String, usize)>>,
    failing: HashMap<String, String>,
    converts: HashMap<String, usize>,
}

/// Writes synthetic artifacts without reading the archive
#[derive(Default)]
pub struct FakeConverter {
    inner: Mutex<ConverterInner>,
}

impl FakeConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tables(&self, period: &Period, tables: &[(&str, usize)]) {
        self.inner.lock().unwrap().tables.insert(
            period.id().to_string(),
            tables.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
        );
    }

    pub fn fail_period(&self, period: &Period, table: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing
            .insert(period.id().to_string(), table.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failing.clear();
    }

    pub fn convert_count(&self, period: &Period) -> usize {
        self.inner
            .lock()
            .unwrap()
            .converts
            .get(period.id())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StagingConverter for FakeConverter {
    async fn convert(
        &self,
        period: &Period,
        archive: &Path,
        extract_dir: &Path,
        artifact_dir: &Path,
    ) -> Result<Vec<TableArtifact>> {
        let tables = {
            let mut inner = self.inner.lock().unwrap();
            *inner.converts.entry(period.id().to_string()).or_default() += 1;
            if let Some(table) = inner.failing.get(period.id()) {
                return Err(SyncError::conversion(period, Some(table.as_str()), "malformed row 3"));
            }
            inner.tables.get(period.id()).cloned().unwrap_or_default()
        };

        assert!(archive.exists(), "converter called without an archive");
        std::fs::create_dir_all(extract_dir)?;
        std::fs::create_dir_all(artifact_dir)?;

        Ok(tables
            .iter()
            .map(|(table, rows)| write_artifact(artifact_dir, period, table, *rows))
            .collect())
    }
}
