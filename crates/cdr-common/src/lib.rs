//! CDR Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the CDR sync workspace.
//!
//! - **Logging**: `tracing` subscriber setup (console, rolling file, JSON)
//! - **Checksums**: SHA-256 helpers used to verify staged artifacts
//! - **Errors**: the small error type those helpers return
//!
//! # Example
//!
//! ```no_run
//! use cdr_common::checksum::sha256_file;
//!
//! fn describe(path: &str) -> cdr_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(%digest, "artifact digest");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
