use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use scraper::{ElementRef, Selector};
use thiserror::Error;

use crate::domain::listing::RawListing;
use crate::models::config::{HarvestConfig, SourceConfig};

pub mod autocosmos;
pub mod mercadolibre;
pub mod tucarro;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("failed to build scraper: {0}")]
    Build(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// An abstraction over listing-site scrapers that produce [`RawListing`]s
/// one page at a time.
///
/// Adapters only know how to fetch and parse a single page; pacing, retry
/// and failure accounting live in [`harvest_source`] so every source gets
/// the same discipline.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    /// Stable identifier recorded on every listing this adapter produces.
    fn source_id(&self) -> &str;

    /// Fetches and parses one page of search results. Page numbers start
    /// at 1. An empty vector is a valid outcome (past the last page).
    async fn fetch_page(&self, page: u32) -> ScrapeResult<Vec<RawListing>>;
}

/// Everything one adapter run produced, successful or not.
#[derive(Debug)]
pub struct HarvestOutcome {
    pub source_id: String,
    pub listings: Vec<RawListing>,
    pub pages_skipped: u32,
    /// Set when the adapter aborted its own run (fails closed); the cycle
    /// keeps whatever pages were harvested before the abort.
    pub failure: Option<String>,
}

/// Drives one adapter over its page range: per-page bounded retry with
/// backoff, inter-request delay, and abort after too many consecutive
/// page failures. Never panics into the cycle.
pub async fn harvest_source(
    scraper: &dyn SourceScraper,
    pages: u32,
    cfg: &HarvestConfig,
) -> HarvestOutcome {
    let mut outcome = HarvestOutcome {
        source_id: scraper.source_id().to_string(),
        listings: Vec::new(),
        pages_skipped: 0,
        failure: None,
    };
    let mut consecutive_failures = 0u32;

    for page in 1..=pages {
        if page > 1 && cfg.request_delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(cfg.request_delay_secs)).await;
        }

        match fetch_page_with_retry(scraper, page, cfg).await {
            Ok(listings) => {
                consecutive_failures = 0;
                if listings.is_empty() {
                    log::info!("{}: page {page} empty, stopping", scraper.source_id());
                    break;
                }
                outcome.listings.extend(listings);
            }
            Err(e) => {
                log::warn!("{}: skipping page {page}: {e}", scraper.source_id());
                outcome.pages_skipped += 1;
                consecutive_failures += 1;
                if consecutive_failures >= cfg.max_consecutive_failures {
                    let reason = format!(
                        "aborted after {consecutive_failures} consecutive page failures: {e}"
                    );
                    log::error!("{}: {reason}", scraper.source_id());
                    outcome.failure = Some(reason);
                    break;
                }
            }
        }
    }

    outcome
}

async fn fetch_page_with_retry(
    scraper: &dyn SourceScraper,
    page: u32,
    cfg: &HarvestConfig,
) -> ScrapeResult<Vec<RawListing>> {
    let mut last_error = ScrapeError::Http("no attempts made".to_string());
    for attempt in 0..cfg.page_retries.max(1) {
        if attempt > 0 {
            let backoff = Duration::from_millis(
                500u64.saturating_mul(1 << attempt.min(6))
                    + rand::thread_rng().gen_range(0..250),
            );
            tokio::time::sleep(backoff).await;
        }
        match scraper.fetch_page(page).await {
            Ok(listings) => return Ok(listings),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

/// Maps a configured source selector to its adapter.
pub fn build_scraper(source: &SourceConfig) -> ScrapeResult<Box<dyn SourceScraper>> {
    match source.selector.as_str() {
        "tucarro" => Ok(Box::new(tucarro::TucarroScraper::new()?)),
        "mercadolibre" => Ok(Box::new(mercadolibre::MercadolibreScraper::new()?)),
        "autocosmos" => Ok(Box::new(autocosmos::AutocosmosScraper::new()?)),
        other => Err(ScrapeError::Build(format!("unknown source selector: {other}"))),
    }
}

pub(crate) fn build_reqwest_client() -> ScrapeResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ScrapeError::Build(e.to_string()))
}

/// Returns the text of the first element matched by any selector in
/// `candidates`, tried in order. Upstream markup drifts; an ordered
/// fallback list degrades extraction instead of zeroing it out.
pub(crate) fn select_first_text(element: ElementRef<'_>, candidates: &[&str]) -> Option<String> {
    for raw in candidates {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(found) = element.select(&selector).next() {
            let text = found.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Like [`select_first_text`] but reads an attribute value.
pub(crate) fn select_first_attr(
    element: ElementRef<'_>,
    candidates: &[&str],
    attr: &str,
) -> Option<String> {
    for raw in candidates {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for found in element.select(&selector) {
            if let Some(value) = found.value().attr(attr) {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
