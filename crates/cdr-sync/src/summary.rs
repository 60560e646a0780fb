//! Run summary

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::period::Period;

/// Lifecycle of one period within a run
///
/// `Discovered -> Staging -> Uploading -> Committed`, or `Failed` from any
/// state before `Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodPhase {
    Discovered,
    Staging,
    Uploading,
    Committed,
    Failed,
}

impl PeriodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodPhase::Discovered => "discovered",
            PeriodPhase::Staging => "staging",
            PeriodPhase::Uploading => "uploading",
            PeriodPhase::Committed => "committed",
            PeriodPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub name: String,
    pub rows_uploaded: u64,
    pub rows_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodReport {
    pub period: Period,
    /// `Committed` or `Failed`
    pub phase: PeriodPhase,
    /// Phase the period was in when it failed
    pub failed_in: Option<PeriodPhase>,
    pub tables: Vec<TableReport>,
    pub reason: Option<String>,
    pub reused_staging: bool,
}

impl PeriodReport {
    pub fn committed(period: &Period, tables: Vec<TableReport>, reused_staging: bool) -> Self {
        Self {
            period: period.clone(),
            phase: PeriodPhase::Committed,
            failed_in: None,
            tables,
            reason: None,
            reused_staging,
        }
    }

    pub fn failed(
        period: &Period,
        failed_in: PeriodPhase,
        reason: impl Into<String>,
        tables: Vec<TableReport>,
    ) -> Self {
        Self {
            period: period.clone(),
            phase: PeriodPhase::Failed,
            failed_in: Some(failed_in),
            tables,
            reason: Some(reason.into()),
            reused_staging: false,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.phase == PeriodPhase::Committed
    }

    pub fn rows_uploaded(&self) -> u64 {
        if self.is_committed() {
            self.tables.iter().map(|t| t.rows_uploaded).sum()
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Periods the source listed
    pub discovered: usize,
    /// Periods that were not yet complete
    pub pending: usize,
    pub periods: Vec<PeriodReport>,
    /// The run ended before every pending period was attempted
    pub stopped_early: bool,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, discovered: usize, pending: usize) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            discovered,
            pending,
            periods: Vec::new(),
            stopped_early: false,
            interrupted: false,
        }
    }

    pub fn attempted(&self) -> usize {
        self.periods.len()
    }

    pub fn committed(&self) -> usize {
        self.periods.iter().filter(|p| p.is_committed()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.committed()
    }

    pub fn total_rows(&self) -> u64 {
        self.periods.iter().map(PeriodReport::rows_uploaded).sum()
    }

    /// Every attempted period reached `Committed`
    pub fn all_committed(&self) -> bool {
        self.failed() == 0 && !self.interrupted
    }

    pub fn log(&self) {
        for report in &self.periods {
            match report.phase {
                PeriodPhase::Committed => info!(
                    period = %report.period,
                    tables = report.tables.len(),
                    rows = report.rows_uploaded(),
                    reused_staging = report.reused_staging,
                    "Period committed"
                ),
                _ => warn!(
                    period = %report.period,
                    failed_in = report.failed_in.map(|p| p.as_str()).unwrap_or("unknown"),
                    reason = report.reason.as_deref().unwrap_or(""),
                    "Period failed"
                ),
            }
        }

        info!(
            run_id = %self.run_id,
            discovered = self.discovered,
            pending = self.pending,
            attempted = self.attempted(),
            committed = self.committed(),
            failed = self.failed(),
            rows = self.total_rows(),
            stopped_early = self.stopped_early,
            "Sync run finished"
        );
    }
}
