//! Upstream period discovery and archive download

use crate::config::SourceConfig;
use crate::error::{Result, SyncError};
use crate::period::Period;
use async_trait::async_trait;
use futures::StreamExt;
use scraper::{Html, Selector};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[async_trait]
pub trait PeriodSource: Send + Sync {
    /// Periods currently published upstream, in no guaranteed order
    async fn list_periods(&self) -> Result<Vec<Period>>;

    /// Download the raw archive for `period` to `dest`, returning its size
    async fn fetch_archive(&self, period: &Period, dest: &Path) -> Result<u64>;
}

/// Reads the period drop-down of the publisher's bulk download page and
/// fetches archives from a URL template
pub struct HttpPeriodSource {
    client: reqwest::Client,
    listing_url: String,
    archive_url_template: String,
    max_periods: usize,
}

impl HttpPeriodSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            listing_url: config.listing_url.clone(),
            archive_url_template: config.archive_url_template.clone(),
            max_periods: config.max_periods,
        })
    }

    pub fn archive_url(&self, period: &Period) -> Result<Url> {
        expand_template(&self.archive_url_template, period)
    }
}

#[async_trait]
impl PeriodSource for HttpPeriodSource {
    async fn list_periods(&self) -> Result<Vec<Period>> {
        info!(url = %self.listing_url, "Discovering published periods");

        let response = self
            .client
            .get(&self.listing_url)
            .send()
            .await
            .map_err(|e| SyncError::Discovery(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Discovery(format!(
                "listing returned HTTP {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Discovery(format!("cannot read listing: {}", e)))?;

        let periods = parse_listing(&body, self.max_periods)?;
        if let (Some(oldest), Some(newest)) = (periods.first(), periods.last()) {
            info!(count = periods.len(), %oldest, %newest, "Discovered periods");
        }
        Ok(periods)
    }

    async fn fetch_archive(&self, period: &Period, dest: &Path) -> Result<u64> {
        let url = self.archive_url(period)?;
        info!(period = %period, url = %url, "Downloading archive");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::fetch(period, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::fetch(period, format!("HTTP {}", status)));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = dest.with_extension("zip.part");
        let mut file = std::fs::File::create(&partial)?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    discard(&partial);
                    return Err(SyncError::fetch(period, format!("download interrupted: {}", e)));
                },
            };
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
        }
        file.sync_all()?;
        drop(file);

        if downloaded == 0 {
            discard(&partial);
            return Err(SyncError::fetch(period, "empty response body"));
        }

        std::fs::rename(&partial, dest)?;
        debug!(period = %period, bytes = downloaded, path = %dest.display(), "Archive saved");
        Ok(downloaded)
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Could not remove partial download");
    }
}

/// Period options from the listing page, the newest `max_periods` in
/// chronological order
///
/// Options whose text is not an `m/d/yyyy` date (product names, placeholders)
/// are ignored.
pub fn parse_listing(html: &str, max_periods: usize) -> Result<Vec<Period>> {
    let document = Html::parse_document(html);
    let option_selector = Selector::parse("option")
        .map_err(|e| SyncError::Discovery(format!("bad selector: {:?}", e)))?;

    let mut periods: Vec<Period> = document
        .select(&option_selector)
        .map(|option| option.text().collect::<String>())
        .map(|text| text.trim().to_string())
        .filter(|text| text.matches('/').count() == 2)
        .filter_map(|text| Period::parse(&text).ok())
        .collect();

    if periods.is_empty() {
        return Err(SyncError::Discovery(
            "no reporting periods found on listing page".to_string(),
        ));
    }

    periods.sort_by(|a, b| b.cmp(a));
    periods.dedup();
    if max_periods > 0 {
        periods.truncate(max_periods);
    }
    periods.reverse();
    Ok(periods)
}

/// Fill `{period}`, `{date}` (yyyymmdd) and `{label}` (m/d/yyyy) in `template`
pub fn expand_template(template: &str, period: &Period) -> Result<Url> {
    let expanded = template
        .replace("{period}", period.id())
        .replace("{date}", &period.date().format("%Y%m%d").to_string())
        .replace("{label}", &period.listing_label());

    Url::parse(&expanded)
        .map_err(|e| SyncError::fetch(period, format!("invalid archive URL '{}': {}", expanded, e)))
}
