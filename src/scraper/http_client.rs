use crate::config::ScraperConfig;
use crate::errors::FetchError;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct HttpClient {
    inner: reqwest::Client,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
        })
    }

    /// Fetch a URL as text, retrying retryable failures with jittered
    /// exponential backoff (base×2, base×4, … capped at 30s).
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_delay_ms)
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.max_retries as usize);

        RetryIf::start(
            strategy,
            || self.get_once(url),
            |e: &FetchError| {
                let retry = e.is_retryable();
                if retry {
                    warn!("GET {} failed ({}), retrying", url, e);
                }
                retry
            },
        )
        .await
    }

    async fn get_once(&self, url: &str) -> Result<String, FetchError> {
        debug!("GET {}", url);

        let resp = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        resp.text().await.map_err(|e| FetchError::from_reqwest(url, e))
    }
}
