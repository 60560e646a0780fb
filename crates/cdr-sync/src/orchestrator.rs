//! Incremental sync orchestrator
//!
//! Diffs what the source publishes against the state file and walks every
//! pending period, oldest first, through staging, upload and commit. A period
//! is only marked complete after every one of its tables has been uploaded
//! and verified; a table failure rolls the whole period back downstream.
//!
//! Staging failures skip to the next period. Upload failures stop the run
//! unless `continue_on_failure` is set, since they usually mean the store is
//! unhealthy and later periods would fail the same way.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::artifact::TableArtifact;
use crate::error::{Result, SyncError, UploadError};
use crate::layout::StagingLayout;
use crate::manifest::StagingManifest;
use crate::period::Period;
use crate::source::PeriodSource;
use crate::staging::StagingConverter;
use crate::state::StateStore;
use crate::summary::{PeriodPhase, PeriodReport, RunSummary, TableReport};
use crate::uploader::{BatchUploader, UploadResult};

pub const INTERRUPTED_REASON: &str = "interrupted before completion";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub continue_on_failure: bool,
    pub upload_concurrency: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            upload_concurrency: crate::config::DEFAULT_UPLOAD_CONCURRENCY,
        }
    }
}

pub struct Orchestrator {
    source: Arc<dyn PeriodSource>,
    converter: Arc<dyn StagingConverter>,
    uploader: BatchUploader,
    state: StateStore,
    layout: StagingLayout,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn PeriodSource>,
        converter: Arc<dyn StagingConverter>,
        uploader: BatchUploader,
        state: StateStore,
        layout: StagingLayout,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            source,
            converter,
            uploader,
            state,
            layout,
            options,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// One full pass over every pending period
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`Orchestrator::run`], stopping early once `shutdown` resolves
    ///
    /// The period in flight at that moment is rolled back and marked failed,
    /// so the next run retries it without waiting for it to go stale.
    pub async fn run_until<S>(&mut self, shutdown: S) -> Result<RunSummary>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let started_at = Utc::now();
        let run_id = self.state.run_id();
        info!(run_id = %run_id, "Starting sync run");

        let all_known = self.source.list_periods().await?;
        let pending = self.state.pending_periods(&all_known);
        info!(
            discovered = all_known.len(),
            pending = pending.len(),
            "Diffed published periods against state"
        );

        let mut summary = RunSummary::new(run_id, started_at, all_known.len(), pending.len());
        if pending.is_empty() {
            // Leave the state file untouched when there is nothing to do.
            info!("Nothing new to upload");
        } else {
            self.state.mark_run_started()?;
        }

        for (idx, period) in pending.iter().enumerate() {
            let span = info_span!("period", period = %period, n = idx + 1, of = pending.len());

            let outcome = tokio::select! {
                biased;
                report = self.process_period(period).instrument(span) => Some(report),
                _ = &mut shutdown => None,
            };

            let report = match outcome {
                Some(report) => report?,
                None => {
                    warn!(period = %period, "Shutdown requested, abandoning period");
                    let phase = self.abandon(period).await?;
                    summary.periods.push(PeriodReport::failed(
                        period,
                        phase,
                        INTERRUPTED_REASON,
                        Vec::new(),
                    ));
                    summary.interrupted = true;
                    summary.stopped_early = idx + 1 < pending.len();
                    break;
                },
            };

            let hard_failure = report.failed_in == Some(PeriodPhase::Uploading);
            summary.periods.push(report);

            if hard_failure && !self.options.continue_on_failure && idx + 1 < pending.len() {
                warn!(
                    remaining = pending.len() - idx - 1,
                    "Upload failed, stopping run (set run.continue_on_failure to keep going)"
                );
                summary.stopped_early = true;
                break;
            }
        }

        summary.finished_at = Some(Utc::now());
        summary.log();
        Ok(summary)
    }

    /// Stage, upload and commit one period
    ///
    /// Per-period failures are recorded and reported; only errors that make
    /// the state untrustworthy are returned.
    async fn process_period(&mut self, period: &Period) -> Result<PeriodReport> {
        debug!(phase = PeriodPhase::Discovered.as_str(), "Period pending");
        self.state.begin(period, &[])?;

        debug!(phase = PeriodPhase::Staging.as_str(), "Staging period");
        let staged = self
            .stage(period)
            .await
            .map_err(|e| staging_error(period, e));
        let (artifacts, reused_staging) = match staged {
            Ok(staged) => staged,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let reason = e.to_string();
                warn!(error = %reason, "Staging failed, continuing with next period");
                self.state.fail(period, &reason)?;
                return Ok(PeriodReport::failed(
                    period,
                    PeriodPhase::Staging,
                    reason,
                    Vec::new(),
                ));
            },
        };

        let table_names: Vec<String> = artifacts.iter().map(|a| a.table_name.clone()).collect();
        self.state.set_tables(period, &table_names)?;

        debug!(
            phase = PeriodPhase::Uploading.as_str(),
            tables = artifacts.len(),
            "Uploading period"
        );
        let results = self.upload_all(period, &artifacts).await;

        let mut tables = Vec::with_capacity(results.len());
        let mut failures: Vec<UploadError> = Vec::new();
        for (artifact, result) in artifacts.iter().zip(results) {
            match result {
                Ok(uploaded) => tables.push(TableReport {
                    name: uploaded.table_name,
                    rows_uploaded: uploaded.rows_uploaded,
                    rows_total: artifact.row_count,
                }),
                Err(e) => {
                    tables.push(TableReport {
                        name: e.table_name.clone(),
                        rows_uploaded: e.rows_uploaded,
                        rows_total: e.rows_total,
                    });
                    failures.push(e);
                },
            }
        }

        if !failures.is_empty() {
            let mut reason = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");

            let rollback_failures = self.uploader.rollback(period, &table_names).await;
            if !rollback_failures.is_empty() {
                let names: Vec<&str> = rollback_failures.iter().map(|(t, _)| t.as_str()).collect();
                reason.push_str(&format!(
                    " (rollback incomplete for {}; the next attempt purges them)",
                    names.join(", ")
                ));
            }

            warn!(
                failed_tables = failures.len(),
                tables = artifacts.len(),
                "Upload failed, period rolled back"
            );
            self.state.fail(period, &reason)?;
            return Ok(PeriodReport::failed(
                period,
                PeriodPhase::Uploading,
                reason,
                tables,
            ));
        }

        let rows_uploaded: u64 = tables.iter().map(|t| t.rows_uploaded).sum();
        self.state.commit(period, rows_uploaded)?;
        debug!(phase = PeriodPhase::Committed.as_str(), rows_uploaded, "Period committed");

        self.cleanup(period);
        Ok(PeriodReport::committed(period, tables, reused_staging))
    }

    /// Artifacts for `period`, reusing whatever a previous run left behind
    async fn stage(&self, period: &Period) -> Result<(Vec<TableArtifact>, bool)> {
        let artifact_dir = self.layout.artifact_dir(period);
        if let Some(artifacts) = StagingManifest::load_verified(&artifact_dir, period)? {
            info!(tables = artifacts.len(), "Reusing staged artifacts");
            return Ok((artifacts, true));
        }

        let archive = self.layout.archive_path(period);
        if archive.exists() {
            info!(path = %archive.display(), "Reusing downloaded archive");
        } else {
            let bytes = self.source.fetch_archive(period, &archive).await?;
            info!(bytes, "Archive downloaded");
        }

        if artifact_dir.exists() {
            // Leftovers of a conversion that never wrote its manifest.
            std::fs::remove_dir_all(&artifact_dir)?;
        }

        let extract_dir = self.layout.extract_dir(period);
        let artifacts = self
            .converter
            .convert(period, &archive, &extract_dir, &artifact_dir)
            .await?;

        if artifacts.is_empty() {
            return Err(SyncError::conversion(
                period,
                None,
                "no tables produced",
            ));
        }

        StagingManifest::new(period, &artifacts)?.save(&artifact_dir)?;
        info!(tables = artifacts.len(), "Period staged");
        Ok((artifacts, false))
    }

    /// Upload every artifact, `upload_concurrency` at a time
    ///
    /// Results come back in artifact order. All uploads run to completion
    /// before this returns.
    async fn upload_all(
        &self,
        period: &Period,
        artifacts: &[TableArtifact],
    ) -> Vec<std::result::Result<UploadResult, UploadError>> {
        let uploader = &self.uploader;
        let mut results: Vec<(usize, std::result::Result<UploadResult, UploadError>)> =
            stream::iter(artifacts.iter().enumerate())
                .map(|(idx, artifact)| async move {
                    (idx, uploader.upload_table(period, artifact).await)
                })
                .buffer_unordered(self.options.upload_concurrency.max(1))
                .collect()
                .await;

        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Roll back and fail an interrupted period, returning the phase it was in
    async fn abandon(&mut self, period: &Period) -> Result<PeriodPhase> {
        let tables = self
            .state
            .record(period)
            .map(|record| record.tables.clone())
            .unwrap_or_default();

        let phase = if tables.is_empty() {
            PeriodPhase::Staging
        } else {
            self.uploader.rollback(period, &tables).await;
            PeriodPhase::Uploading
        };

        self.state.fail(period, INTERRUPTED_REASON)?;
        Ok(phase)
    }

    /// Drop the raw archive and extracted originals; artifacts stay
    fn cleanup(&self, period: &Period) {
        remove_path(&self.layout.archive_path(period));
        remove_path(&self.layout.extract_dir(period));
    }
}

/// Local file errors while staging only affect the period being staged
fn staging_error(period: &Period, err: SyncError) -> SyncError {
    match err {
        SyncError::Io(e) => SyncError::conversion(period, None, e),
        SyncError::Serialization(e) => SyncError::conversion(period, None, e),
        other => other,
    }
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        return;
    };

    match result {
        Ok(()) => debug!(path = %path.display(), "Removed staging file"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging file"),
    }
}
