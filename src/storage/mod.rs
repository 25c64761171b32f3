use crate::models::{Company, CompanyRef, TradingRecord, ACTIVE_STATUS};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use duckdb::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id              BIGINT PRIMARY KEY,
    symbol          VARCHAR NOT NULL DEFAULT '',
    security_name   VARCHAR NOT NULL DEFAULT '',
    name            VARCHAR NOT NULL DEFAULT '',
    active_status   VARCHAR NOT NULL DEFAULT '',
    created_at      TIMESTAMP NOT NULL,
    updated_at      TIMESTAMP NOT NULL,
    -- Set when a refresh no longer lists the company
    deleted_at      TIMESTAMP
);

CREATE TABLE IF NOT EXISTS stock_records (
    business_date               DATE     NOT NULL,
    -- Empty when the security name had no reference match
    symbol                      VARCHAR  NOT NULL DEFAULT '',
    security_name               VARCHAR  NOT NULL,
    security_id                 BIGINT   NOT NULL DEFAULT 0,
    remote_id                   VARCHAR,
    last_updated_time           VARCHAR  NOT NULL DEFAULT '',
    open_price                  DOUBLE   NOT NULL DEFAULT 0,
    high_price                  DOUBLE   NOT NULL DEFAULT 0,
    low_price                   DOUBLE   NOT NULL DEFAULT 0,
    close_price                 DOUBLE   NOT NULL DEFAULT 0,
    previous_day_close_price    DOUBLE   NOT NULL DEFAULT 0,
    total_traded_quantity       DOUBLE   NOT NULL DEFAULT 0,
    total_traded_value          DOUBLE   NOT NULL DEFAULT 0,
    total_trades                BIGINT   NOT NULL DEFAULT 0,
    fifty_two_week_high         DOUBLE   NOT NULL DEFAULT 0,
    fifty_two_week_low          DOUBLE   NOT NULL DEFAULT 0,
    last_updated_price          DOUBLE   NOT NULL DEFAULT 0,
    average_traded_price        DOUBLE   NOT NULL DEFAULT 0,
    market_capitalization       DOUBLE   NOT NULL DEFAULT 0,
    created_at                  TIMESTAMP NOT NULL,
    updated_at                  TIMESTAMP NOT NULL,
    PRIMARY KEY (business_date, symbol, security_name)
);

CREATE TABLE IF NOT EXISTS ingest_progress (
    fetch_date      DATE PRIMARY KEY,
    business_date   DATE,
    rows_written    BIGINT NOT NULL DEFAULT 0,
    status          VARCHAR NOT NULL,
    completed_at    TIMESTAMP NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS scrape_runs_id_seq START 1;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('scrape_runs_id_seq'),
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    pages_completed     BIGINT DEFAULT 0,
    rows_written        BIGINT DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const UPSERT_RECORD: &str = r#"
    INSERT INTO stock_records (
        business_date, symbol, security_name, security_id, remote_id, last_updated_time,
        open_price, high_price, low_price, close_price, previous_day_close_price,
        total_traded_quantity, total_traded_value, total_trades,
        fifty_two_week_high, fifty_two_week_low, last_updated_price,
        average_traded_price, market_capitalization,
        created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (business_date, symbol, security_name) DO UPDATE SET
        security_id              = excluded.security_id,
        remote_id                = excluded.remote_id,
        last_updated_time        = excluded.last_updated_time,
        open_price               = excluded.open_price,
        high_price               = excluded.high_price,
        low_price                = excluded.low_price,
        close_price              = excluded.close_price,
        previous_day_close_price = excluded.previous_day_close_price,
        total_traded_quantity    = excluded.total_traded_quantity,
        total_traded_value       = excluded.total_traded_value,
        total_trades             = excluded.total_trades,
        fifty_two_week_high      = excluded.fifty_two_week_high,
        fifty_two_week_low       = excluded.fifty_two_week_low,
        last_updated_price       = excluded.last_updated_price,
        average_traded_price     = excluded.average_traded_price,
        market_capitalization    = excluded.market_capitalization,
        updated_at               = excluded.updated_at
"#;

const SELECT_RECORDS: &str = r#"
    SELECT business_date, last_updated_time, security_name, symbol, security_id, remote_id,
           open_price, high_price, low_price, close_price, previous_day_close_price,
           total_traded_quantity, total_traded_value, total_trades,
           fifty_two_week_high, fifty_two_week_low, last_updated_price,
           average_traded_price, market_capitalization
    FROM stock_records
    WHERE business_date BETWEEN ? AND ?
    ORDER BY business_date, symbol, security_name
"#;

// ── Repository ────────────────────────────────────────────────────────────────

/// Whether a completed fetch date carried data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Complete,
    Empty,
}

impl PageStatus {
    fn as_str(self) -> &'static str {
        match self {
            PageStatus::Complete => "complete",
            PageStatus::Empty => "empty",
        }
    }
}

/// Summary of the most recent backfill run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub status: String,
    pub pages_completed: i64,
    pub rows_written: i64,
}

/// DuckDB-backed store. One connection, serialized behind a mutex, so the
/// repository can be shared across tasks; every statement runs atomically.
pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("DuckDB connection mutex poisoned"))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn()?;
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Companies ─────────────────────────────────────────────────────────────

    /// Load a full security list in one transaction: listed companies are
    /// upserted, companies missing from the list are soft-deleted.
    pub fn replace_companies(&self, companies: &[Company]) -> Result<usize> {
        if companies.is_empty() {
            bail!("Refusing to replace companies with an empty security list");
        }
        let now = Utc::now().naive_utc();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for c in companies {
            tx.execute(
                r#"INSERT INTO companies
                       (id, symbol, security_name, name, active_status, created_at, updated_at, deleted_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
                   ON CONFLICT (id) DO UPDATE SET
                       symbol        = excluded.symbol,
                       security_name = excluded.security_name,
                       name          = excluded.name,
                       active_status = excluded.active_status,
                       updated_at    = excluded.updated_at,
                       deleted_at    = NULL"#,
                params![c.id, c.symbol, c.security_name, c.name, c.active_status, now, now],
            )
            .with_context(|| format!("upsert company {} ({})", c.id, c.symbol))?;
        }

        let retired = tx.execute(
            "UPDATE companies SET deleted_at = ? WHERE deleted_at IS NULL AND updated_at < ?",
            params![now, now],
        )?;

        tx.commit()?;
        info!("{} companies loaded, {} retired", companies.len(), retired);
        Ok(companies.len())
    }

    /// Reference match by exact security name. When several companies share
    /// a name the active one wins, then the lowest id.
    pub fn find_company_by_security_name(&self, security_name: &str) -> Result<Option<CompanyRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, symbol FROM companies
               WHERE security_name = ? AND deleted_at IS NULL
               ORDER BY (active_status = ?) DESC, id
               LIMIT 1"#,
        )?;
        let mut rows = stmt.query(params![security_name, ACTIVE_STATUS])?;
        match rows.next()? {
            Some(row) => Ok(Some(CompanyRef { id: row.get(0)?, symbol: row.get(1)? })),
            None => Ok(None),
        }
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, symbol, security_name, name, active_status FROM companies
               WHERE deleted_at IS NULL ORDER BY symbol"#,
        )?;
        let companies = stmt
            .query_map([], |r| {
                Ok(Company {
                    id: r.get(0)?,
                    symbol: r.get(1)?,
                    security_name: r.get(2)?,
                    name: r.get(3)?,
                    active_status: r.get(4)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(companies)
    }

    pub fn company_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT COUNT(*) FROM companies WHERE deleted_at IS NULL")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Trading records ───────────────────────────────────────────────────────

    /// Insert, or overwrite every non-key field of the row sharing
    /// `(business_date, symbol, security_name)`.
    pub fn upsert_trading_record(&self, r: &TradingRecord) -> Result<()> {
        let now = Utc::now().naive_utc();
        let conn = self.conn()?;
        conn.execute(
            UPSERT_RECORD,
            params![
                r.business_date, r.symbol, r.security_name, r.security_id, r.remote_id,
                r.last_updated_time,
                r.open_price, r.high_price, r.low_price, r.close_price,
                r.previous_day_close_price,
                r.total_traded_quantity, r.total_traded_value, r.total_trades,
                r.fifty_two_week_high, r.fifty_two_week_low, r.last_updated_price,
                r.average_traded_price, r.market_capitalization,
                now, now,
            ],
        )
        .with_context(|| format!("upsert {} {} ({})", r.business_date, r.symbol, r.security_name))?;
        Ok(())
    }

    pub fn trading_records_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<TradingRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(SELECT_RECORDS)?;
        let records = stmt
            .query_map(params![from, to], |r| {
                Ok(TradingRecord {
                    business_date: r.get(0)?,
                    last_updated_time: r.get(1)?,
                    security_name: r.get(2)?,
                    symbol: r.get(3)?,
                    security_id: r.get(4)?,
                    remote_id: r.get(5)?,
                    open_price: r.get(6)?,
                    high_price: r.get(7)?,
                    low_price: r.get(8)?,
                    close_price: r.get(9)?,
                    previous_day_close_price: r.get(10)?,
                    total_traded_quantity: r.get(11)?,
                    total_traded_value: r.get(12)?,
                    total_trades: r.get(13)?,
                    fifty_two_week_high: r.get(14)?,
                    fifty_two_week_low: r.get(15)?,
                    last_updated_price: r.get(16)?,
                    average_traded_price: r.get(17)?,
                    market_capitalization: r.get(18)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn record_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT COUNT(*) FROM stock_records")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT MIN(business_date), MAX(business_date) FROM stock_records")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    // ── Ingest progress ───────────────────────────────────────────────────────

    /// Record that every row of the page fetched for `fetch_date` is stored.
    pub fn mark_page_done(
        &self,
        fetch_date: NaiveDate,
        business_date: Option<NaiveDate>,
        rows_written: usize,
        status: PageStatus,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO ingest_progress (fetch_date, business_date, rows_written, status, completed_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (fetch_date) DO UPDATE SET
                   business_date = excluded.business_date,
                   rows_written  = excluded.rows_written,
                   status        = excluded.status,
                   completed_at  = excluded.completed_at"#,
            params![fetch_date, business_date, rows_written as i64, status.as_str(), Utc::now().naive_utc()],
        )
        .with_context(|| format!("mark page {} done", fetch_date))?;
        Ok(())
    }

    /// Fetch dates in `[from, to]` already ingested by an earlier run.
    pub fn completed_fetch_dates(&self, from: NaiveDate, to: NaiveDate) -> Result<HashSet<NaiveDate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT fetch_date FROM ingest_progress WHERE fetch_date BETWEEN ? AND ?")?;
        let dates = stmt
            .query_map(params![from, to], |r| r.get(0))?
            .collect::<duckdb::Result<HashSet<NaiveDate>>>()?;
        Ok(dates)
    }

    pub fn progress_range(&self) -> Result<(i64, Option<NaiveDate>, Option<NaiveDate>)> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT COUNT(*), MIN(fetch_date), MAX(fetch_date) FROM ingest_progress")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?)
    }

    // ── Scrape run log ────────────────────────────────────────────────────────

    pub fn begin_scrape_run(&self) -> Result<i64> {
        let conn = self.conn()?;
        let id: i64 = conn.query_row(
            "INSERT INTO scrape_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_scrape_run(
        &self, run_id: i64, pages: usize, rows: usize, error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE scrape_runs SET
               finished_at = ?, status = ?,
               pages_completed = ?, rows_written = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                pages as i64, rows as i64, error, run_id,
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn last_scrape_run(&self) -> Result<Option<RunSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, started_at, status, pages_completed, rows_written
               FROM scrape_runs ORDER BY id DESC LIMIT 1"#,
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(r) => Ok(Some(RunSummary {
                id: r.get(0)?,
                started_at: r.get(1)?,
                status: r.get(2)?,
                pages_completed: r.get(3)?,
                rows_written: r.get(4)?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn company(id: i64, symbol: &str, security_name: &str, status: &str) -> Company {
        Company {
            id,
            symbol: symbol.into(),
            security_name: security_name.into(),
            name: security_name.into(),
            active_status: status.into(),
        }
    }

    fn record(name: &str, symbol: &str, close: f64) -> TradingRecord {
        TradingRecord {
            business_date: date(2021, 6, 24),
            last_updated_time: "15:00".into(),
            security_name: name.into(),
            symbol: symbol.into(),
            close_price: close,
            ..Default::default()
        }
    }

    #[test]
    fn test_migrations_are_rerunnable() {
        let repo = repo();
        repo.run_migrations().unwrap();
        assert_eq!(repo.record_count().unwrap(), 0);
    }

    #[test]
    fn test_upsert_is_idempotent_and_last_write_wins() {
        let repo = repo();
        repo.upsert_trading_record(&record("ABC Bank Ltd.", "ABC", 500.0)).unwrap();
        repo.upsert_trading_record(&record("ABC Bank Ltd.", "ABC", 500.0)).unwrap();
        repo.upsert_trading_record(&record("ABC Bank Ltd.", "ABC", 501.0)).unwrap();

        let rows = repo.trading_records_between(date(2021, 6, 1), date(2021, 6, 30)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close_price, 501.0);
    }

    #[test]
    fn test_unresolved_and_resolved_rows_have_distinct_keys() {
        let repo = repo();
        repo.upsert_trading_record(&record("ABC Bank Ltd.", "", 500.0)).unwrap();
        repo.upsert_trading_record(&record("ABC Bank Ltd.", "ABC", 500.0)).unwrap();
        assert_eq!(repo.record_count().unwrap(), 2);
    }

    #[test]
    fn test_record_round_trips_every_field() {
        let repo = repo();
        let r = TradingRecord {
            security_id: 42,
            remote_id: Some("r-1".into()),
            open_price: 1.0,
            high_price: 2.0,
            low_price: 0.5,
            previous_day_close_price: 1.1,
            total_traded_quantity: 10.0,
            total_traded_value: 15.0,
            total_trades: 3,
            fifty_two_week_high: 9.0,
            fifty_two_week_low: 0.1,
            last_updated_price: 1.4,
            average_traded_price: 1.5,
            market_capitalization: 1e9,
            ..record("Alpha Ltd.", "ALP", 1.4)
        };
        repo.upsert_trading_record(&r).unwrap();
        let stored = repo.trading_records_between(r.business_date, r.business_date).unwrap();
        assert_eq!(stored, vec![r]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_keep_one_row_per_key() {
        let repo = Arc::new(repo());

        for close in [100.0, 200.0] {
            let handles: Vec<_> = (0..40)
                .map(|i| {
                    let repo = Arc::clone(&repo);
                    tokio::task::spawn_blocking(move || {
                        let name = format!("Company {}", i);
                        repo.upsert_trading_record(&record(&name, &format!("C{}", i), close + i as f64))
                    })
                })
                .collect();
            for h in handles {
                h.await.unwrap().unwrap();
            }
        }

        let rows = repo.trading_records_between(date(2021, 6, 24), date(2021, 6, 24)).unwrap();
        assert_eq!(rows.len(), 40);
        assert!(rows.iter().all(|r| r.close_price >= 200.0));
    }

    #[test]
    fn test_company_lookup_prefers_active() {
        let repo = repo();
        repo.replace_companies(&[
            company(3, "ABCS", "ABC Bank Ltd.", "S"),
            company(5, "ABC", "ABC Bank Ltd.", "A"),
            company(9, "XYZ", "XYZ Ltd.", "A"),
        ])
        .unwrap();

        let hit = repo.find_company_by_security_name("ABC Bank Ltd.").unwrap().unwrap();
        assert_eq!(hit, CompanyRef { id: 5, symbol: "ABC".into() });
        assert!(repo.find_company_by_security_name("abc bank ltd.").unwrap().is_none());
    }

    #[test]
    fn test_refresh_soft_deletes_missing_companies() {
        let repo = repo();
        repo.replace_companies(&[company(1, "ABC", "ABC Bank Ltd.", "A"), company(2, "OLD", "Old Co.", "A")])
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.replace_companies(&[company(1, "ABC", "ABC Bank Ltd.", "A")]).unwrap();

        assert_eq!(repo.company_count().unwrap(), 1);
        assert!(repo.find_company_by_security_name("Old Co.").unwrap().is_none());
        assert_eq!(repo.list_companies().unwrap()[0].symbol, "ABC");
    }

    #[test]
    fn test_empty_security_list_keeps_stored_companies() {
        let repo = repo();
        repo.replace_companies(&[company(1, "ABC", "ABC Bank Ltd.", "A")]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(repo.replace_companies(&[]).is_err());
        assert_eq!(repo.company_count().unwrap(), 1);
        let found = repo.find_company_by_security_name("ABC Bank Ltd.").unwrap().unwrap();
        assert_eq!(found.symbol, "ABC");
    }

    #[test]
    fn test_progress_marks() {
        let repo = repo();
        repo.mark_page_done(date(2021, 6, 24), Some(date(2021, 6, 24)), 150, PageStatus::Complete).unwrap();
        repo.mark_page_done(date(2021, 6, 26), None, 0, PageStatus::Empty).unwrap();
        repo.mark_page_done(date(2021, 6, 26), None, 0, PageStatus::Empty).unwrap();

        let done = repo.completed_fetch_dates(date(2021, 6, 20), date(2021, 6, 25)).unwrap();
        assert_eq!(done, HashSet::from([date(2021, 6, 24)]));

        let (count, min, max) = repo.progress_range().unwrap();
        assert_eq!(count, 2);
        assert_eq!(min, Some(date(2021, 6, 24)));
        assert_eq!(max, Some(date(2021, 6, 26)));
    }

    #[test]
    fn test_scrape_run_log() {
        let repo = repo();
        let first = repo.begin_scrape_run().unwrap();
        let second = repo.begin_scrape_run().unwrap();
        assert!(second > first);

        repo.finish_scrape_run(second, 3, 120, None).unwrap();
        let last = repo.last_scrape_run().unwrap().unwrap();
        assert_eq!(last.id, second);
        assert_eq!(last.status, "success");
        assert_eq!(last.rows_written, 120);
    }
}
