use crate::models::FetchTarget;
use chrono::{Datelike, Days, NaiveDate};
use url::Url;

/// `start, start-1, …, start-(count-1)`. Stops early only if the calendar
/// runs out.
pub fn dates_back_from(start: NaiveDate, count: usize) -> impl Iterator<Item = NaiveDate> {
    (0..count as u64).map_while(move |i| start.checked_sub_days(Days::new(i)))
}

/// Report dates are sent unpadded: 2021-6-4.
pub fn report_date_param(date: NaiveDate) -> String {
    format!("{}-{}-{}", date.year(), date.month(), date.day())
}

/// Builds the per-day report URLs for one host.
#[derive(Debug, Clone)]
pub struct ReportUrls {
    base: String,
    page_limit: u32,
}

impl ReportUrls {
    pub fn new(base_url: &str, page_limit: u32) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            page_limit,
        }
    }

    /// `<base>/todaysprice?startDate=<yyyy-M-d>&_limit=<page_limit>`
    pub fn report_url(&self, date: NaiveDate) -> Result<Url, url::ParseError> {
        Url::parse_with_params(
            &format!("{}/todaysprice", self.base),
            &[
                ("startDate", report_date_param(date)),
                ("_limit", self.page_limit.to_string()),
            ],
        )
    }

    /// One fetch target per day, newest first.
    pub fn targets(&self, start: NaiveDate, count: usize) -> Result<Vec<FetchTarget>, url::ParseError> {
        dates_back_from(start, count)
            .map(|date| {
                Ok(FetchTarget {
                    date,
                    url: self.report_url(date)?.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_dates_are_consecutive_and_descending() {
        let dates: Vec<_> = dates_back_from(d(2021, 3, 2), 4).collect();
        assert_eq!(dates, vec![d(2021, 3, 2), d(2021, 3, 1), d(2021, 2, 28), d(2021, 2, 27)]);
    }

    #[test]
    fn test_long_range_has_no_duplicates() {
        let dates: Vec<_> = dates_back_from(d(2021, 6, 24), 3800).collect();
        assert_eq!(dates.len(), 3800);
        assert!(dates.windows(2).all(|w| w[0] - w[1] == chrono::Duration::days(1)));
        assert_eq!(dates.iter().collect::<HashSet<_>>().len(), 3800);
    }

    #[test]
    fn test_zero_count_is_empty() {
        assert_eq!(dates_back_from(d(2021, 6, 24), 0).count(), 0);
        let urls = ReportUrls::new("http://www.nepalstock.com", 300);
        assert!(urls.targets(d(2021, 6, 24), 0).unwrap().is_empty());
    }

    #[test]
    fn test_calendar_underflow_stops_early() {
        assert_eq!(dates_back_from(NaiveDate::MIN, 3).count(), 1);
    }

    #[test]
    fn test_report_url_format() {
        let urls = ReportUrls::new("http://www.nepalstock.com/", 300);
        let targets = urls.targets(d(2021, 6, 4), 2).unwrap();
        assert_eq!(targets[0].date, d(2021, 6, 4));
        assert_eq!(
            targets[0].url,
            "http://www.nepalstock.com/todaysprice?startDate=2021-6-4&_limit=300"
        );
        assert_eq!(
            targets[1].url,
            "http://www.nepalstock.com/todaysprice?startDate=2021-6-3&_limit=300"
        );
    }
}
