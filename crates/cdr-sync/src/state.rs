//! Durable per-period completion state
//!
//! The state file is the only record of what has reached the remote store. It
//! is a pretty-printed JSON document keyed by period id so operators can read
//! it, and delete an entry to force a period to be processed again.
//!
//! Every mutation re-reads the file, applies the change and writes the whole
//! document to a temporary file in the same directory before renaming it over
//! the original. A crash mid-write leaves either the old or the new document,
//! never a torn one.

use crate::error::{Result, SyncError};
use crate::layout::write_atomic;
use crate::period::Period;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATE_FORMAT_VERSION: u32 = 1;

/// Completion status of one period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl PeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Pending => "pending",
            PeriodStatus::InProgress => "in_progress",
            PeriodStatus::Complete => "complete",
            PeriodStatus::Failed => "failed",
        }
    }
}

/// One entry of the state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub period: Period,
    pub status: PeriodStatus,

    /// Schedules staged for this period (empty until staging finishes)
    #[serde(default)]
    pub tables: Vec<String>,

    /// Rows confirmed downstream; only meaningful once complete
    #[serde(default)]
    pub rows_uploaded: u64,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Why the last attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Run that last touched the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,

    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default)]
    last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    periods: BTreeMap<String, StateRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            last_run: None,
            periods: BTreeMap::new(),
        }
    }
}

/// Handle on the state file for one run
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    stale_after: Duration,
    run_id: Uuid,
    document: StateDocument,
}

impl StateStore {
    /// Open the state file at `path`, creating an empty one if absent
    ///
    /// `stale_after` is how long an `in_progress` record written by another
    /// run keeps blocking [`StateStore::begin`].
    pub fn open(path: impl Into<PathBuf>, stale_after: std::time::Duration) -> Result<Self> {
        let path = path.into();
        let stale_after = Duration::from_std(stale_after)
            .map_err(|e| SyncError::config(format!("stale_after out of range: {}", e)))?;

        let document = if path.exists() {
            read_document(&path)?
        } else {
            info!(path = %path.display(), "State file not found, creating a new one");
            let document = StateDocument::default();
            write_document(&path, &document)?;
            document
        };

        Ok(Self {
            path,
            stale_after,
            run_id: Uuid::new_v4(),
            document,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.document.last_run
    }

    pub fn record(&self, period: &Period) -> Option<&StateRecord> {
        self.document.periods.get(period.id())
    }

    /// All records, ordered chronologically
    pub fn records(&self) -> Vec<&StateRecord> {
        let mut records: Vec<&StateRecord> = self.document.periods.values().collect();
        records.sort_by(|a, b| a.period.cmp(&b.period));
        records
    }

    /// Periods from `all_known` that still need to be uploaded, oldest first
    ///
    /// Anything without a `complete` record is pending: absent, failed, and
    /// in-progress records left behind by an interrupted run alike.
    pub fn pending_periods(&self, all_known: &[Period]) -> Vec<Period> {
        let mut pending: Vec<Period> = all_known
            .iter()
            .filter(|period| {
                !matches!(
                    self.record(period).map(|r| r.status),
                    Some(PeriodStatus::Complete)
                )
            })
            .cloned()
            .collect();

        pending.sort();
        pending.dedup();
        pending
    }

    /// Mark `period` as in progress for this run
    ///
    /// Fails with [`SyncError::ConcurrentRun`] when another run holds a fresh
    /// `in_progress` record for the same period.
    pub fn begin(&mut self, period: &Period, tables: &[String]) -> Result<()> {
        let run_id = self.run_id;
        let stale_after = self.stale_after;

        self.update(|document| {
            let now = Utc::now();

            if let Some(existing) = document.periods.get(period.id()) {
                let other_run = existing.run_id.filter(|id| *id != run_id);
                if existing.status == PeriodStatus::InProgress {
                    if let Some(other) = other_run {
                        if now - existing.updated_at < stale_after {
                            return Err(SyncError::ConcurrentRun {
                                period: period.id().to_string(),
                                run_id: other,
                                updated_at: existing.updated_at,
                            });
                        }
                        warn!(
                            period = %period,
                            stale_run = %other,
                            "Taking over stale in-progress record"
                        );
                    }
                }
            }

            let attempts = document
                .periods
                .get(period.id())
                .map(|r| r.attempts)
                .unwrap_or(0);

            document.periods.insert(
                period.id().to_string(),
                StateRecord {
                    period: period.clone(),
                    status: PeriodStatus::InProgress,
                    tables: tables.to_vec(),
                    rows_uploaded: 0,
                    started_at: Some(now),
                    updated_at: now,
                    completed_at: None,
                    reason: None,
                    run_id: Some(run_id),
                    attempts: attempts + 1,
                },
            );
            Ok(())
        })?;

        debug!(period = %period, "State: in_progress");
        Ok(())
    }

    /// Record the staged table names once they are known
    pub fn set_tables(&mut self, period: &Period, tables: &[String]) -> Result<()> {
        let run_id = self.run_id;
        self.update(|document| {
            let record = owned_in_progress(document, period, run_id)?;
            record.tables = tables.to_vec();
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Flip `period` to complete
    ///
    /// Only valid for a period this run began; call it after every table of
    /// the period has been confirmed downstream.
    pub fn commit(&mut self, period: &Period, rows_uploaded: u64) -> Result<()> {
        let run_id = self.run_id;
        self.update(|document| {
            let record = owned_in_progress(document, period, run_id)?;
            let now = Utc::now();
            record.status = PeriodStatus::Complete;
            record.rows_uploaded = rows_uploaded;
            record.completed_at = Some(now);
            record.updated_at = now;
            record.reason = None;
            Ok(())
        })?;

        info!(period = %period, rows_uploaded, "State: complete");
        Ok(())
    }

    /// Flip `period` to failed, keeping `reason` for the operator
    pub fn fail(&mut self, period: &Period, reason: &str) -> Result<()> {
        let run_id = self.run_id;
        self.update(|document| {
            let now = Utc::now();
            let record = document
                .periods
                .entry(period.id().to_string())
                .or_insert_with(|| StateRecord {
                    period: period.clone(),
                    status: PeriodStatus::Pending,
                    tables: Vec::new(),
                    rows_uploaded: 0,
                    started_at: None,
                    updated_at: now,
                    completed_at: None,
                    reason: None,
                    run_id: None,
                    attempts: 0,
                });

            if record.status == PeriodStatus::Complete {
                return Err(SyncError::state(format!(
                    "refusing to mark complete period {} as failed",
                    period
                )));
            }

            record.status = PeriodStatus::Failed;
            record.rows_uploaded = 0;
            record.reason = Some(reason.to_string());
            record.updated_at = now;
            record.run_id = Some(run_id);
            Ok(())
        })?;

        warn!(period = %period, reason, "State: failed");
        Ok(())
    }

    /// Drop the record for `period_id` so the next run processes it again
    pub fn remove(&mut self, period_id: &str) -> Result<bool> {
        let mut removed = false;
        self.update(|document| {
            removed = document.periods.remove(period_id).is_some();
            Ok(())
        })?;
        Ok(removed)
    }

    /// Stamp the document with the start time of this run
    pub fn mark_run_started(&mut self) -> Result<()> {
        self.update(|document| {
            document.last_run = Some(Utc::now());
            Ok(())
        })
    }

    fn update<F>(&mut self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut StateDocument) -> Result<()>,
    {
        let mut document = if self.path.exists() {
            read_document(&self.path)?
        } else {
            StateDocument::default()
        };

        apply(&mut document)?;
        write_document(&self.path, &document)?;
        self.document = document;
        Ok(())
    }
}

fn owned_in_progress<'a>(
    document: &'a mut StateDocument,
    period: &Period,
    run_id: Uuid,
) -> Result<&'a mut StateRecord> {
    match document.periods.get_mut(period.id()) {
        Some(record)
            if record.status == PeriodStatus::InProgress && record.run_id == Some(run_id) =>
        {
            Ok(record)
        },
        Some(record) => Err(SyncError::state(format!(
            "period {} is {} and not owned by this run",
            period,
            record.status.as_str()
        ))),
        None => Err(SyncError::state(format!(
            "period {} has no state record; begin() was not called",
            period
        ))),
    }
}

fn read_document(path: &Path) -> Result<StateDocument> {
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(StateDocument::default());
    }

    let document: StateDocument = serde_json::from_str(&content).map_err(|e| {
        SyncError::state(format!("cannot parse {}: {}", path.display(), e))
    })?;

    if document.version > STATE_FORMAT_VERSION {
        return Err(SyncError::state(format!(
            "{} uses format version {}, newer than supported version {}",
            path.display(),
            document.version,
            STATE_FORMAT_VERSION
        )));
    }

    Ok(document)
}

fn write_document(path: &Path, document: &StateDocument) -> Result<()> {
    let mut content = serde_json::to_string_pretty(document)?;
    content.push('\n');
    write_atomic(path, content.as_bytes())
}
