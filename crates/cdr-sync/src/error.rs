//! Error taxonomy for a sync run
//!
//! Errors split along the period boundary. Anything that happens while one
//! period is being staged or uploaded is attributed to that period and never
//! aborts the run on its own; discovery, state-file and concurrency failures
//! abort the run because continuing would risk the state record.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The upstream period listing could not be read or parsed
    #[error("Period discovery failed: {0}")]
    Discovery(String),

    /// The raw archive for one period could not be downloaded
    #[error("Failed to fetch archive for period {period}: {reason}")]
    Fetch { period: String, reason: String },

    /// The raw archive could not be turned into table artifacts
    #[error("Failed to convert {} for period {period}: {reason}", describe_table(.table))]
    Conversion {
        period: String,
        table: Option<String>,
        reason: String,
    },

    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Another run appears to be working on the same period
    #[error(
        "Period {period} is in progress in run {run_id} (last update {updated_at}). \
         Wait for that run to finish or edit the state file."
    )]
    ConcurrentRun {
        period: String,
        run_id: Uuid,
        updated_at: DateTime<Utc>,
    },

    #[error("State file error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn describe_table(table: &Option<String>) -> String {
    match table {
        Some(name) => format!("table '{}'", name),
        None => "archive".to_string(),
    }
}

impl SyncError {
    pub fn fetch(period: impl ToString, reason: impl ToString) -> Self {
        Self::Fetch {
            period: period.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn conversion(period: impl ToString, table: Option<&str>, reason: impl ToString) -> Self {
        Self::Conversion {
            period: period.to_string(),
            table: table.map(str::to_string),
            reason: reason.to_string(),
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error must abort the whole run rather than one period
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SyncError::Fetch { .. } | SyncError::Conversion { .. } | SyncError::Upload(_)
        )
    }
}

impl From<cdr_common::CommonError> for SyncError {
    fn from(err: cdr_common::CommonError) -> Self {
        match err {
            cdr_common::CommonError::Io(e) => SyncError::Io(e),
            cdr_common::CommonError::Serialization(e) => SyncError::Serialization(e),
            other => SyncError::State(other.to_string()),
        }
    }
}

/// A table could not be fully uploaded
///
/// Carries the partial progress for diagnostics only; any non-total upload
/// fails the whole period.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Upload of table '{table_name}' failed after {rows_uploaded}/{rows_total} rows: {reason}"
)]
pub struct UploadError {
    pub table_name: String,
    pub rows_uploaded: u64,
    pub rows_total: u64,
    pub reason: String,
}

/// Failure of a single call against the remote store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_error_names_table() {
        let err = SyncError::conversion("03-31-2024", Some("Schedule_RC"), "bad row");
        assert_eq!(
            err.to_string(),
            "Failed to convert table 'Schedule_RC' for period 03-31-2024: bad row"
        );

        let err = SyncError::conversion("03-31-2024", None, "not a zip");
        assert!(err.to_string().starts_with("Failed to convert archive"));
    }

    #[test]
    fn test_fatality_follows_period_boundary() {
        assert!(!SyncError::fetch("2024Q1", "503").is_fatal());
        assert!(!SyncError::conversion("2024Q1", None, "x").is_fatal());
        assert!(SyncError::Discovery("offline".into()).is_fatal());
        assert!(SyncError::state("torn").is_fatal());
    }
}
