use crate::models::{CompanyRef, ParsedRow, ReportHeader, TradingRecord};
use crate::storage::Repository;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reference store lookup by exact security name.
pub trait CompanyLookup: Send + Sync {
    fn find_by_security_name(&self, security_name: &str) -> Result<Option<CompanyRef>>;
}

impl CompanyLookup for Repository {
    fn find_by_security_name(&self, security_name: &str) -> Result<Option<CompanyRef>> {
        self.find_company_by_security_name(security_name)
    }
}

/// Turns a parsed row into a trading record with its company attached.
///
/// An unmatched name still yields a record, with an empty symbol and a zero
/// id, so delisted or renamed securities are not dropped from the archive.
pub struct RecordResolver<L> {
    lookup: Arc<L>,
}

impl<L: CompanyLookup> RecordResolver<L> {
    pub fn new(lookup: Arc<L>) -> Self {
        Self { lookup }
    }

    pub fn resolve(&self, row: ParsedRow, header: &ReportHeader) -> TradingRecord {
        let company = match self.lookup.find_by_security_name(&row.security_name) {
            Ok(Some(c)) => Some(c),
            Ok(None) => {
                debug!("no reference company named {:?}", row.security_name);
                None
            }
            Err(e) => {
                warn!("reference lookup for {:?} failed: {:#}", row.security_name, e);
                None
            }
        };
        let (security_id, symbol) = company.map(|c| (c.id, c.symbol)).unwrap_or_default();

        TradingRecord {
            business_date: header.business_date,
            last_updated_time: header.last_updated_time.clone(),
            security_name: row.security_name,
            symbol,
            security_id,
            total_trades: row.total_trades,
            high_price: row.high_price,
            low_price: row.low_price,
            close_price: row.close_price,
            total_traded_quantity: row.total_traded_quantity,
            total_traded_value: row.total_traded_value,
            previous_day_close_price: row.previous_day_close_price,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    struct MapLookup(HashMap<String, CompanyRef>);

    impl CompanyLookup for MapLookup {
        fn find_by_security_name(&self, security_name: &str) -> Result<Option<CompanyRef>> {
            Ok(self.0.get(security_name).cloned())
        }
    }

    struct BrokenLookup;

    impl CompanyLookup for BrokenLookup {
        fn find_by_security_name(&self, _: &str) -> Result<Option<CompanyRef>> {
            Err(anyhow!("connection lost"))
        }
    }

    fn header() -> ReportHeader {
        ReportHeader {
            business_date: NaiveDate::from_ymd_opt(2021, 6, 24).unwrap(),
            last_updated_time: "15:00".into(),
        }
    }

    fn row(name: &str) -> ParsedRow {
        ParsedRow {
            security_name: name.into(),
            total_trades: 120,
            high_price: 505.0,
            low_price: 495.0,
            close_price: 500.0,
            total_traded_quantity: 10000.0,
            total_traded_value: 5_000_000.0,
            previous_day_close_price: 498.0,
        }
    }

    fn abc_lookup() -> Arc<MapLookup> {
        Arc::new(MapLookup(HashMap::from([(
            "ABC Bank Ltd.".to_string(),
            CompanyRef { id: 1, symbol: "ABC".into() },
        )])))
    }

    #[test]
    fn test_match_fills_symbol_and_id() {
        let resolver = RecordResolver::new(abc_lookup());
        let record = resolver.resolve(row("ABC Bank Ltd."), &header());

        assert_eq!(record.symbol, "ABC");
        assert_eq!(record.security_id, 1);
        assert_eq!(record.business_date, header().business_date);
        assert_eq!(record.last_updated_time, "15:00");
        assert_eq!(record.total_trades, 120);
        assert_eq!(record.previous_day_close_price, 498.0);
        assert_eq!(record.open_price, 0.0);
        assert_eq!(record.remote_id, None);
    }

    #[test]
    fn test_miss_keeps_row() {
        let resolver = RecordResolver::new(abc_lookup());
        let record = resolver.resolve(row("Unknown Hydro Ltd."), &header());

        assert_eq!(record.symbol, "");
        assert_eq!(record.security_id, 0);
        assert_eq!(record.security_name, "Unknown Hydro Ltd.");
        assert_eq!(record.close_price, 500.0);
    }

    #[test]
    fn test_lookup_error_is_treated_as_miss() {
        let resolver = RecordResolver::new(Arc::new(BrokenLookup));
        let record = resolver.resolve(row("ABC Bank Ltd."), &header());
        assert_eq!(record.security_id, 0);
        assert_eq!(record.symbol, "");
    }
}
