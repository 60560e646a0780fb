//! Configuration management
//!
//! Layers, lowest precedence first:
//!
//! 1. built-in defaults (the `DEFAULT_*` constants below)
//! 2. an optional TOML file (`cdr-sync.toml`, or the path given with `--config`)
//! 3. `CDR_`-prefixed environment variables, `__` separating nested keys,
//!    e.g. `CDR_UPLOAD__BATCH_SIZE=2000`
//!
//! `.env` is loaded first, and `DATABASE_URL` fills `upload.database_url` when
//! nothing else set it.

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_CONFIG_FILE: &str = "cdr-sync.toml";
pub const ENV_PREFIX: &str = "CDR";

pub const DEFAULT_LISTING_URL: &str = "https://cdr.ffiec.gov/public/PWS/DownloadBulkData.aspx";

/// Three years of quarters
pub const DEFAULT_MAX_PERIODS: usize = 12;

/// Bulk archives are large; allow five minutes per request.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_STATE_PATH: &str = "state.json";

/// How long another run's `in_progress` record blocks this run
pub const DEFAULT_STALE_AFTER_SECS: u64 = 2 * 60 * 60;

pub const DEFAULT_BATCH_SIZE: usize = crate::uploader::DEFAULT_BATCH_SIZE;
pub const DEFAULT_MAX_ATTEMPTS: u32 = crate::retry::DEFAULT_MAX_ATTEMPTS;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Placeholders accepted in `source.archive_url_template`
pub const TEMPLATE_PLACEHOLDERS: [&str; 3] = ["{period}", "{date}", "{label}"];

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub staging: StagingConfig,
    pub state: StateConfig,
    pub upload: UploadConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Page whose `<option>` elements list the published periods
    pub listing_url: String,

    /// Direct download URL for one period's archive; see [`TEMPLATE_PLACEHOLDERS`]
    pub archive_url_template: String,

    /// Keep only the newest N periods from the listing (0 = all)
    pub max_periods: usize,

    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            archive_url_template: String::new(),
            max_periods: DEFAULT_MAX_PERIODS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            user_agent: format!("cdr-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub data_dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(crate::layout::DEFAULT_DATA_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
    pub stale_after_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STATE_PATH),
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

impl StateConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub database_url: String,
    /// Schema holding one table per schedule
    pub schema: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_secs: u64,
    /// Tables of one period uploaded at the same time
    pub concurrency: usize,
    pub max_connections: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            schema: crate::store::DEFAULT_SCHEMA.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Keep going with later periods after a period fails to upload
    pub continue_on_failure: bool,
}

// ============================================================================
// Loading
// ============================================================================

impl SyncConfig {
    /// Load from defaults, the config file and the process environment
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::from_sources(path, Environment::with_prefix(ENV_PREFIX))?;
        if config.upload.database_url.is_empty() {
            if let Ok(url) = std::env::var("DATABASE_URL") {
                config.upload.database_url = url;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Layer `path` and `env` over the defaults without validating
    pub fn from_sources(path: Option<&Path>, env: Environment) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::from(Path::new(DEFAULT_CONFIG_FILE))
                .format(FileFormat::Toml)
                .required(false),
        };

        Config::builder()
            .add_source(file)
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| SyncError::config(e.to_string()))
    }

    /// Checks every command needs
    pub fn validate(&self) -> Result<()> {
        if self.state.path.as_os_str().is_empty() {
            return Err(SyncError::config("state.path cannot be empty"));
        }
        if self.staging.data_dir.as_os_str().is_empty() {
            return Err(SyncError::config("staging.data_dir cannot be empty"));
        }
        if self.upload.batch_size == 0 {
            return Err(SyncError::config("upload.batch_size must be greater than 0"));
        }
        if self.upload.max_attempts == 0 {
            return Err(SyncError::config("upload.max_attempts must be greater than 0"));
        }
        if self.upload.concurrency == 0 {
            return Err(SyncError::config("upload.concurrency must be greater than 0"));
        }
        if self.upload.max_connections == 0 {
            return Err(SyncError::config("upload.max_connections must be greater than 0"));
        }
        if self.upload.call_timeout_secs == 0 {
            return Err(SyncError::config("upload.call_timeout_secs must be greater than 0"));
        }
        if self.upload.initial_backoff_ms > self.upload.max_backoff_ms {
            return Err(SyncError::config(format!(
                "upload.initial_backoff_ms ({}) cannot exceed upload.max_backoff_ms ({})",
                self.upload.initial_backoff_ms, self.upload.max_backoff_ms
            )));
        }
        if self.upload.schema.trim().is_empty() {
            return Err(SyncError::config("upload.schema cannot be empty"));
        }
        Ok(())
    }

    /// Extra checks before a sync run, which needs the network and the store
    pub fn validate_for_run(&self) -> Result<()> {
        if self.upload.database_url.trim().is_empty() {
            return Err(SyncError::config(
                "upload.database_url is empty; set CDR_UPLOAD__DATABASE_URL or DATABASE_URL",
            ));
        }
        if self.source.listing_url.trim().is_empty() {
            return Err(SyncError::config("source.listing_url cannot be empty"));
        }
        let template = &self.source.archive_url_template;
        if template.trim().is_empty() {
            return Err(SyncError::config(
                "source.archive_url_template is not set; point it at a direct download URL",
            ));
        }
        if !TEMPLATE_PLACEHOLDERS.iter().any(|p| template.contains(p)) {
            return Err(SyncError::config(format!(
                "source.archive_url_template must contain one of {}",
                TEMPLATE_PLACEHOLDERS.join(", ")
            )));
        }
        Ok(())
    }
}
