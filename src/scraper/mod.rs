pub mod cleaner;
pub mod fetcher;
pub mod http_client;
pub mod parsers;
pub mod schedule;

use crate::config::ScraperConfig;
use crate::errors::FetchError;
use crate::models::{Company, FetchTarget};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use self::http_client::HttpClient;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Where report pages come from. Swappable so the pipeline can run against
/// canned pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, target: &FetchTarget) -> Result<String, FetchError>;
}

// ── nepalstock.com scraper ────────────────────────────────────────────────────

pub struct NepseScraper {
    client: HttpClient,
    reference_url: String,
}

impl NepseScraper {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
            reference_url: config.reference_url.clone(),
        })
    }

    /// Download the security list feed.
    pub async fn fetch_companies(&self) -> Result<Vec<Company>> {
        info!("Fetching security list ({})", self.reference_url);

        let body = self
            .client
            .get_text(&self.reference_url)
            .await
            .context("Failed to fetch security list")?;

        crate::loader::parse_companies(&body)
    }
}

#[async_trait]
impl PageSource for NepseScraper {
    async fn fetch_page(&self, target: &FetchTarget) -> Result<String, FetchError> {
        self.client.get_text(&target.url).await
    }
}
