use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Reference company ─────────────────────────────────────────────────────────

/// One entry of the exchange's security list feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: i64,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub security_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active_status: String,
}

impl Company {
    pub fn is_active(&self) -> bool {
        self.active_status == ACTIVE_STATUS
    }
}

/// `activeStatus` value the feed uses for listed, trading securities.
pub const ACTIVE_STATUS: &str = "A";

/// The part of a company a trading record needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyRef {
    pub id: i64,
    pub symbol: String,
}

// ── Report page ───────────────────────────────────────────────────────────────

/// Business date/time printed at the top of a report table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportHeader {
    pub business_date: NaiveDate,
    pub last_updated_time: String,
}

/// A trading row as read off the report table, before resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRow {
    pub security_name: String,
    pub total_trades: i64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub total_traded_quantity: f64,
    pub total_traded_value: f64,
    pub previous_day_close_price: f64,
}

/// Everything extracted from one report page.
#[derive(Debug, Clone)]
pub struct ReportPage {
    pub header: ReportHeader,
    rows: Vec<ParsedRow>,
}

impl ReportPage {
    pub fn new(header: ReportHeader, rows: Vec<ParsedRow>) -> Self {
        Self { header, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Consume the page, yielding its rows once.
    pub fn into_rows(self) -> (ReportHeader, impl Iterator<Item = ParsedRow>) {
        (self.header, self.rows.into_iter())
    }
}

// ── Trading record ────────────────────────────────────────────────────────────

/// One security's trading summary for one business day.
///
/// Natural key: `(business_date, symbol, security_name)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TradingRecord {
    pub business_date: NaiveDate,
    pub last_updated_time: String,
    pub security_name: String,
    pub symbol: String,
    pub security_id: i64,
    pub remote_id: Option<String>,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub previous_day_close_price: f64,
    pub total_traded_quantity: f64,
    pub total_traded_value: f64,
    pub total_trades: i64,
    pub fifty_two_week_high: f64,
    pub fifty_two_week_low: f64,
    pub last_updated_price: f64,
    pub average_traded_price: f64,
    pub market_capitalization: f64,
}

// ── Fetch target ──────────────────────────────────────────────────────────────

/// A report date and the URL that serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub date: NaiveDate,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_company_from_feed_json() {
        let json = r#"{"id":131,"symbol":"NABIL","securityName":"Nabil Bank Limited","name":"Nabil Bank Limited","activeStatus":"A"}"#;
        let c: Company = serde_json::from_str(json).unwrap();
        assert_eq!(c.id, 131);
        assert_eq!(c.symbol, "NABIL");
        assert_eq!(c.security_name, "Nabil Bank Limited");
        assert!(c.is_active());
    }

    #[test]
    fn test_company_tolerates_missing_fields() {
        let c: Company = serde_json::from_str(r#"{"id":7,"symbol":"XYZ"}"#).unwrap();
        assert_eq!(c.security_name, "");
        assert!(!c.is_active());
    }
}
