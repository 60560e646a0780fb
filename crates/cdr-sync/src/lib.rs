//! CDR Sync Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental upload of FFIEC Call Report bulk releases into a remote
//! analytical store.
//!
//! # Overview
//!
//! Each quarter the publisher releases one archive of tab-separated schedules
//! per reporting period. A sync run:
//!
//! - **Discovers** the published periods ([`source::PeriodSource`])
//! - **Diffs** them against the local state file ([`state::StateStore`])
//! - **Stages** each pending archive into columnar artifacts
//!   ([`staging::StagingConverter`])
//! - **Uploads** every table in bounded batches with retries
//!   ([`uploader::BatchUploader`])
//! - **Commits** the period only once every table is verified downstream
//!
//! The [`orchestrator::Orchestrator`] drives those steps and produces a
//! [`summary::RunSummary`].
//!
//! # Example
//!
//! ```no_run
//! use cdr_sync::config::SyncConfig;
//! use cdr_sync::state::StateStore;
//!
//! fn pending() -> cdr_sync::Result<()> {
//!     let config = SyncConfig::load(None)?;
//!     let state = StateStore::open(&config.state.path, config.state.stale_after())?;
//!     for record in state.records() {
//!         tracing::info!(period = %record.period, status = record.status.as_str(), "state");
//!     }
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod orchestrator;
pub mod period;
pub mod retry;
pub mod source;
pub mod staging;
pub mod state;
pub mod store;
pub mod summary;
pub mod uploader;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod testing;

pub use config::SyncConfig;
pub use error::{Result, StoreError, SyncError, UploadError};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use period::Period;
pub use state::{PeriodStatus, StateRecord, StateStore};
pub use summary::RunSummary;
