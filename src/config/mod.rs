use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub layout: TableLayout,
}

/// Scraper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_reference_url")]
    pub reference_url: String,

    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Anchor for backward pagination. Today (UTC) when unset.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    #[serde(default = "default_day_count")]
    pub day_count: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_true")]
    pub skip_completed: bool,

    #[serde(default = "default_true")]
    pub fail_fast: bool,

    #[serde(default = "default_true")]
    pub refresh_companies: bool,
}

/// Where the trading rows live in a report page.
///
/// The upstream table has no semantic markers, so rows and columns are
/// addressed by position. A layout change on the exchange site should only
/// require editing these values.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TableLayout {
    #[serde(default = "default_table_selector")]
    pub table_selector: String,

    #[serde(default = "default_metadata_selector")]
    pub metadata_selector: String,

    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,

    /// Leading rows that are not data (metadata + column headings).
    #[serde(default = "default_skip_header_rows")]
    pub skip_header_rows: usize,

    /// Trailing summary rows.
    #[serde(default = "default_skip_footer_rows")]
    pub skip_footer_rows: usize,

    #[serde(default)]
    pub columns: ColumnMap,
}

/// Cell index of each extracted field within a data row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ColumnMap {
    pub security_name: usize,
    pub total_trades: usize,
    pub high_price: usize,
    pub low_price: usize,
    pub close_price: usize,
    pub total_traded_quantity: usize,
    pub total_traded_value: usize,
    pub previous_day_close_price: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "http://www.nepalstock.com".to_string()
}
fn default_reference_url() -> String {
    "https://newweb.nepalstock.com/api/nots/security?nonDelisted=true".to_string()
}
fn default_page_limit() -> u32 {
    300
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_request_delay_ms() -> u64 {
    1000
}
fn default_jitter_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_user_agent() -> String {
    "nepse-history/0.1 (historical price archive backfill)".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/nepse.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_day_count() -> usize {
    3800
}
fn default_workers() -> usize {
    5
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_table_selector() -> String {
    ".table.table-condensed.table-hover tbody".to_string()
}
fn default_metadata_selector() -> String {
    ".pull-left".to_string()
}
fn default_metadata_prefix() -> String {
    "As of ".to_string()
}
fn default_skip_header_rows() -> usize {
    2
}
fn default_skip_footer_rows() -> usize {
    4
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            reference_url: default_reference_url(),
            page_limit: default_page_limit(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_date: None,
            day_count: default_day_count(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            skip_completed: true,
            fail_fast: true,
            refresh_companies: true,
        }
    }
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            table_selector: default_table_selector(),
            metadata_selector: default_metadata_selector(),
            metadata_prefix: default_metadata_prefix(),
            skip_header_rows: default_skip_header_rows(),
            skip_footer_rows: default_skip_footer_rows(),
            columns: ColumnMap::default(),
        }
    }
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            security_name: 1,
            total_trades: 2,
            high_price: 3,
            low_price: 4,
            close_price: 5,
            total_traded_quantity: 6,
            total_traded_value: 7,
            previous_day_close_price: 8,
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("NEPSE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}
