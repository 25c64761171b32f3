//! Pipeline orchestrator: ties scraper → parser → resolver → storage together.
//!
//! ## Run
//!
//! 1. Open the store, bootstrap the schema, refresh the security list.
//! 2. Schedule one report URL per day, newest first, skipping dates an
//!    earlier run already finished.
//! 3. A bounded worker pool fetches pages under the rate limit.
//! 4. Every fetched page is parsed and its rows resolved + upserted
//!    concurrently; the page is done once all of its writes have returned.
//!
//! Idempotent: re-running a date range rewrites the same rows
//! (ON CONFLICT DO UPDATE), never duplicates them.

pub mod resolver;

use crate::config::{AppConfig, TableLayout};
use crate::errors::ParseError;
use crate::models::ReportHeader;
use crate::scraper::fetcher::RateLimitedFetcher;
use crate::scraper::parsers::parse_report;
use crate::scraper::schedule::ReportUrls;
use crate::scraper::{NepseScraper, PageSource};
use crate::storage::{PageStatus, Repository};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::resolver::RecordResolver;

pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<RunReport> {
        let repo = Arc::new(
            Repository::open(&self.config.storage.db_path)
                .context("Failed to open DuckDB")?,
        );

        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }

        let scraper = Arc::new(
            NepseScraper::new(&self.config.scraper)
                .context("Failed to build scraper")?,
        );

        // ── 1. Reference data, before any row can be resolved ────────────────
        if self.config.pipeline.refresh_companies {
            info!("=== Step 1: Refreshing security list ===");
            let companies = scraper.fetch_companies().await?;
            repo.replace_companies(&companies)?;
        } else {
            info!("=== Step 1: Using stored security list ({} companies) ===", repo.company_count()?);
        }

        self.run_with(scraper, repo).await
    }

    /// Steps 2–5 against any page source and an already initialised store.
    pub async fn run_with<S: PageSource + 'static>(
        &self,
        source: Arc<S>,
        repo: Arc<Repository>,
    ) -> Result<RunReport> {
        let cfg = &self.config.pipeline;
        let mut report = RunReport::default();

        // ── 2. Schedule ───────────────────────────────────────────────────────
        let today = Utc::now().date_naive();
        let start = cfg.start_date.unwrap_or(today);
        let urls = ReportUrls::new(&self.config.scraper.base_url, self.config.scraper.page_limit);
        let mut targets = urls
            .targets(start, cfg.day_count)
            .context("Failed to build report URLs")?;

        if cfg.skip_completed {
            if let Some(oldest) = targets.last().map(|t| t.date) {
                let done = repo.completed_fetch_dates(oldest, start)?;
                targets.retain(|t| !done.contains(&t.date));
                report.already_done = done.len();
            }
        }

        info!(
            "=== Step 2: {} report dates from {} back ({} already ingested) ===",
            targets.len(), start, report.already_done
        );

        let fetcher = RateLimitedFetcher::from_config(source, cfg, &self.config.scraper);
        let mut fetch_run = fetcher.start(targets)?;
        let run_id = repo.begin_scrape_run()?;

        // ── 3. Fetch, handing each page to its own write task ─────────────────
        info!("=== Step 3: Fetching with {} workers ===", cfg.workers);

        let resolver = Arc::new(RecordResolver::new(Arc::clone(&repo)));
        let layout = Arc::new(self.config.layout.clone());
        let mut pages: Vec<(NaiveDate, JoinHandle<PageResult>)> = Vec::new();

        while let Some(outcome) = fetch_run.next().await {
            let date = outcome.target.date;
            match outcome.result {
                Ok(body) => {
                    let handle = tokio::spawn(process_page(
                        date,
                        body,
                        Arc::clone(&layout),
                        Arc::clone(&resolver),
                        Arc::clone(&repo),
                        today,
                    ));
                    pages.push((date, handle));
                }
                Err(e) => {
                    error!("{}: fetch failed: {}", date, e);
                    report.failed.push(FailedFetch {
                        date,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    if cfg.fail_fast && !fetch_run.is_cancelled() {
                        warn!("Cancelling remaining fetches; in-flight pages will finish");
                        fetch_run.cancel();
                    }
                }
            }
        }

        report.not_attempted = fetch_run.finish().await.into_iter().map(|t| t.date).collect();

        // ── 4. Page barriers ──────────────────────────────────────────────────
        for (date, handle) in pages {
            match handle.await {
                Ok(PageResult::Written { rows, write_errors }) => {
                    report.rows_written += rows;
                    report.write_errors += write_errors;
                    if write_errors == 0 {
                        report.completed.push(date);
                    } else {
                        report.incomplete.push(date);
                    }
                }
                Ok(PageResult::Skipped(reason)) => {
                    report.skipped.push(SkippedPage { date, reason });
                }
                Err(e) => {
                    error!("{}: page task panicked: {}", date, e);
                    report.incomplete.push(date);
                }
            }
        }

        // ── 5. Done ───────────────────────────────────────────────────────────
        report.completed.sort_unstable_by(|a, b| b.cmp(a));
        let error_msg = report.failure_summary();
        repo.finish_scrape_run(run_id, report.completed.len(), report.rows_written, error_msg.as_deref())?;

        let (min_date, max_date) = repo.date_range().unwrap_or((None, None));
        info!(
            "=== Done: {} pages | {} rows | {} skipped | {} failed | {} write errors | DB range: {:?} → {:?} ===",
            report.completed.len(), report.rows_written, report.skipped.len(),
            report.failed.len(), report.write_errors, min_date, max_date,
        );

        Ok(report)
    }
}

enum PageResult {
    Written { rows: usize, write_errors: usize },
    Skipped(String),
}

/// Parse one page and write all of its rows, one blocking task per row.
async fn process_page<L: resolver::CompanyLookup + 'static>(
    fetch_date: NaiveDate,
    body: String,
    layout: Arc<TableLayout>,
    resolver: Arc<RecordResolver<L>>,
    repo: Arc<Repository>,
    today: NaiveDate,
) -> PageResult {
    let page = match parse_report(&body, &layout) {
        Ok(page) => page,
        Err(e) => {
            warn_skipped(fetch_date, &e);
            return PageResult::Skipped(e.to_string());
        }
    };

    debug!("{}: {} data rows", fetch_date, page.row_count());
    let (header, rows) = page.into_rows();
    if header.business_date != fetch_date {
        debug!("{}: report is dated {}", fetch_date, header.business_date);
    }

    let handles: Vec<_> = rows
        .map(|row| {
            let header: ReportHeader = header.clone();
            let resolver = Arc::clone(&resolver);
            let repo = Arc::clone(&repo);
            tokio::task::spawn_blocking(move || {
                let record = resolver.resolve(row, &header);
                repo.upsert_trading_record(&record)?;
                debug!("{} {} ({}) written", record.business_date, record.symbol, record.security_name);
                Ok::<(), anyhow::Error>(())
            })
        })
        .collect();

    let mut written = 0usize;
    let mut write_errors = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => written += 1,
            Ok(Err(e)) => {
                warn!("{}: {:#}", fetch_date, e);
                write_errors += 1;
            }
            Err(e) => {
                error!("{}: write task panicked: {}", fetch_date, e);
                write_errors += 1;
            }
        }
    }

    if fetch_date >= today {
        // Today's report keeps changing until the market closes.
        debug!("{}: not marking the current day done", fetch_date);
    } else if write_errors == 0 {
        let status = if written == 0 { PageStatus::Empty } else { PageStatus::Complete };
        if let Err(e) = repo.mark_page_done(fetch_date, Some(header.business_date), written, status) {
            warn!("{}: {:#}", fetch_date, e);
            write_errors += 1;
        }
    }

    if written == 0 && write_errors == 0 {
        info!("{}: no trading rows (report dated {})", fetch_date, header.business_date);
    } else {
        info!("{}: {} rows written, {} failed (report dated {})",
            fetch_date, written, write_errors, header.business_date);
    }

    PageResult::Written { rows: written, write_errors }
}

fn warn_skipped(date: NaiveDate, e: &ParseError) {
    warn!("{}: page skipped: {}", date, e);
}

// ── Run report ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FailedFetch {
    pub date: NaiveDate,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SkippedPage {
    pub date: NaiveDate,
    pub reason: String,
}

/// What a backfill run achieved, per fetch date.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Pages whose rows were all stored, newest first.
    pub completed: Vec<NaiveDate>,
    /// Pages with at least one failed row write.
    pub incomplete: Vec<NaiveDate>,
    /// Pages without a usable report table.
    pub skipped: Vec<SkippedPage>,
    pub failed: Vec<FailedFetch>,
    /// Dates still queued when the run was cancelled.
    pub not_attempted: Vec<NaiveDate>,
    pub already_done: usize,
    pub rows_written: usize,
    pub write_errors: usize,
}

impl RunReport {
    /// A run fails when any page could not be fetched or stored in full.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.incomplete.is_empty() && self.write_errors == 0
    }

    pub fn failure_summary(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let mut parts = Vec::new();
        if !self.failed.is_empty() {
            let dates: Vec<String> = self
                .failed
                .iter()
                .map(|f| format!("{} ({})", f.date, f.kind))
                .collect();
            parts.push(format!(
                "{} fetch failures: {}; {} dates not attempted",
                self.failed.len(),
                dates.join(", "),
                self.not_attempted.len()
            ));
        }
        if !self.incomplete.is_empty() || self.write_errors > 0 {
            let dates: Vec<String> = self.incomplete.iter().map(|d| d.to_string()).collect();
            parts.push(format!(
                "{} row writes failed on {} pages: {}",
                self.write_errors,
                self.incomplete.len(),
                dates.join(", ")
            ));
        }
        Some(parts.join("; "))
    }
}
