mod config;
mod errors;
mod export;
mod loader;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::scraper::NepseScraper;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "nepse-history", about = "NEPSE daily price history backfill", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one report page per day, walking backward from the start date
    Backfill {
        /// Newest report date to fetch (default: config, then today)
        #[arg(long)]
        start_date: Option<NaiveDate>,

        /// Number of days to walk back
        #[arg(long)]
        days: Option<usize>,

        /// Concurrent fetch workers
        #[arg(long)]
        workers: Option<usize>,

        /// Re-fetch dates an earlier run already ingested
        #[arg(long)]
        no_skip: bool,

        /// Keep the stored security list instead of refreshing it
        #[arg(long)]
        no_refresh: bool,
    },

    /// Load the security list from the exchange feed or a saved JSON file
    LoadCompanies {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Write stored trading records to CSV
    Export {
        #[arg(short, long)]
        out: PathBuf,

        #[arg(long)]
        from: Option<NaiveDate>,

        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Show database statistics
    Stats,

    /// List stored companies
    Companies,

    /// Apply schema migrations without loading data
    Migrate,
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "nepse_history=info,warn",
        1 => "nepse_history=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Backfill { start_date, days, workers, no_skip, no_refresh } => {
            if start_date.is_some() {
                config.pipeline.start_date = start_date;
            }
            if let Some(days) = days {
                config.pipeline.day_count = days;
            }
            if let Some(workers) = workers {
                config.pipeline.workers = workers;
            }
            config.pipeline.skip_completed &= !no_skip;
            config.pipeline.refresh_companies &= !no_refresh;

            let _t = utils::Timer::start("Backfill");
            let report = Pipeline::new(config).run().await?;

            for s in &report.skipped {
                warn!("skipped {}: {}", s.date, s.reason);
            }
            if !report.incomplete.is_empty() {
                warn!("{} pages had write errors and will be retried next run", report.incomplete.len());
            }
            if !report.is_success() {
                for f in &report.failed {
                    warn!("failed {} [{}]: {}", f.date, f.kind, f.message);
                }
                bail!(
                    "backfill failed: {}",
                    report.failure_summary().unwrap_or_default()
                );
            }
            info!(
                "Done: {} pages, {} rows, newest {}",
                report.completed.len(),
                report.rows_written,
                utils::fmt_date(report.completed.first().copied())
            );
        }

        Command::LoadCompanies { file } => {
            let _t = utils::Timer::start("Security list load");
            let companies = match file {
                Some(path) => loader::read_companies_file(&path)?,
                None => NepseScraper::new(&config.scraper)?.fetch_companies().await?,
            };
            let repo = open_repo(&config)?;
            let n = repo.replace_companies(&companies)?;
            info!("Done: {} companies", n);
        }

        Command::Export { out, from, to } => {
            let repo = open_repo(&config)?;
            let (min, max) = repo.date_range()?;
            let (Some(from), Some(to)) = (from.or(min), to.or(max)) else {
                println!("No records — run `nepse-history backfill` first.");
                return Ok(());
            };
            let records = repo.trading_records_between(from, to)?;
            let n = export::write_csv(&records, &out)?;
            println!("{} records ({} → {}) written to {:?}", utils::fmt_number(n as i64), from, to, out);
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let records = repo.record_count()?;
            let companies = repo.company_count()?;
            let (min, max) = repo.date_range()?;
            let (pages, oldest, newest) = repo.progress_range()?;
            let last_run = repo.last_scrape_run()?;
            println!("─────────────────────────────────");
            println!("  NEPSE history — Database Stats");
            println!("─────────────────────────────────");
            println!("  Companies : {}", utils::fmt_number(companies));
            println!("  Records   : {}", utils::fmt_number(records));
            println!("  From      : {}", utils::fmt_date(min));
            println!("  To        : {}", utils::fmt_date(max));
            println!("  Pages     : {} ({} → {})", utils::fmt_number(pages), utils::fmt_date(oldest), utils::fmt_date(newest));
            if let Some(run) = last_run {
                println!(
                    "  Last run  : #{} {} [{}] {} pages, {} rows",
                    run.id, run.started_at, run.status, run.pages_completed, run.rows_written
                );
            }
            println!("─────────────────────────────────");
        }

        Command::Companies => {
            let repo = open_repo(&config)?;
            let companies = repo.list_companies()?;
            if companies.is_empty() {
                println!("No companies — run `nepse-history load-companies` first.");
            } else {
                println!("{} companies:", companies.len());
                for c in &companies {
                    println!("  {:<10} {:>6}  {} [{}]", c.symbol, c.id, c.security_name, c.active_status);
                }
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
