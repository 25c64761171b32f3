//! Report table extraction.
//!
//! The daily report is one HTML table with no semantic markers:
//!
//! ```text
//! row 0            "As of 2021-06-24<NBSP>15:00:00"   metadata
//! row 1            S.N. | Company | No. of Transactions | Max | Min | Closing | ...
//! rows 2..len-4    data rows
//! last 4 rows      totals / pagination footer
//! ```
//!
//! Positions come from [`TableLayout`] so a layout change is a config edit.

use crate::config::{ColumnMap, TableLayout};
use crate::errors::ParseError;
use crate::models::{ParsedRow, ReportHeader, ReportPage};
use crate::scraper::cleaner::{count_or_zero, parse_date, price_or_zero};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

const HEADER_SEPARATOR: char = '\u{a0}';

fn selector(s: &str) -> Result<Selector, ParseError> {
    Selector::parse(s).map_err(|e| ParseError::InvalidSelector {
        selector: s.to_string(),
        reason: format!("{:?}", e),
    })
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Extract the report header and its data rows from one page body.
pub fn parse_report(html: &str, layout: &TableLayout) -> Result<ReportPage, ParseError> {
    let table_sel = selector(&layout.table_selector)?;
    let meta_sel = selector(&layout.metadata_selector)?;
    let td_sel = selector("td")?;

    let doc = Html::parse_document(html);

    let body = doc
        .select(&table_sel)
        .next()
        .ok_or_else(|| ParseError::TableNotFound(layout.table_selector.clone()))?;

    let rows: Vec<ElementRef<'_>> = body
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "tr")
        .collect();

    let meta_row = rows.first().ok_or(ParseError::MissingMetadata)?;
    let meta_text = meta_row
        .select(&meta_sel)
        .next()
        .map(text_of)
        .unwrap_or_else(|| text_of(*meta_row));
    let header = parse_header(&meta_text, &layout.metadata_prefix)?;

    let end = rows.len().saturating_sub(layout.skip_footer_rows);
    let mut window = 0usize;
    let mut parsed = Vec::new();

    for (i, tr) in rows.iter().enumerate().take(end).skip(layout.skip_header_rows) {
        window += 1;
        let cells: Vec<String> = tr.select(&td_sel).map(text_of).collect();
        let row = row_from_cells(&cells, &layout.columns);

        if row.security_name.is_empty() {
            debug!("row {}: no security name, skipping", i);
            continue;
        }
        parsed.push(row);
    }

    // A populated window with no usable name means the columns moved, not
    // that the market was closed.
    if window > 0 && parsed.is_empty() {
        return Err(ParseError::UnnamedRows(window));
    }

    Ok(ReportPage::new(header, parsed))
}

/// Split `As of <date><NBSP><time>` into its parts.
pub fn parse_header(text: &str, prefix: &str) -> Result<ReportHeader, ParseError> {
    let body = text.trim();
    let body = body.strip_prefix(prefix).unwrap_or(body);

    let mut parts = body.split(HEADER_SEPARATOR);
    let date_token = parts.next().unwrap_or_default().trim();
    let time_token = parts.next().unwrap_or_default().trim();

    let business_date =
        parse_date(date_token).ok_or_else(|| ParseError::MalformedMetadata(text.to_string()))?;

    Ok(ReportHeader {
        business_date,
        last_updated_time: time_token.to_string(),
    })
}

fn row_from_cells(cells: &[String], cols: &ColumnMap) -> ParsedRow {
    let cell = |i: usize| cells.get(i).map(String::as_str).unwrap_or_default();

    ParsedRow {
        security_name: cell(cols.security_name).to_string(),
        total_trades: count_or_zero(cell(cols.total_trades)),
        high_price: price_or_zero(cell(cols.high_price)),
        low_price: price_or_zero(cell(cols.low_price)),
        close_price: price_or_zero(cell(cols.close_price)),
        total_traded_quantity: price_or_zero(cell(cols.total_traded_quantity)),
        total_traded_value: price_or_zero(cell(cols.total_traded_value)),
        previous_day_close_price: price_or_zero(cell(cols.previous_day_close_price)),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Builds a report page the way the exchange renders it: metadata row,
    /// column headings, data rows, then four footer rows.
    pub fn report_html(date: &str, time: &str, rows: &[[&str; 8]]) -> String {
        let mut body = String::new();
        body.push_str(&format!(
            "<tr><td colspan=\"10\"><div class=\"pull-left\">As of {}&nbsp;{}</div></td></tr>\n",
            date, time
        ));
        body.push_str(
            "<tr class=\"unique\"><td>S.N.</td><td>Traded Companies</td><td>No. Of Transaction</td>\
             <td>Max Price</td><td>Min Price</td><td>Closing Price</td><td>Traded Shares</td>\
             <td>Amount</td><td>Previous Closing</td><td>Difference Rs.</td></tr>\n",
        );
        for (i, r) in rows.iter().enumerate() {
            body.push_str(&format!("<tr><td>{}</td>", i + 1));
            for c in r {
                body.push_str(&format!("<td>{}</td>", c));
            }
            body.push_str("<td>0.00</td></tr>\n");
        }
        body.push_str("<tr><td colspan=\"10\">Total Amount</td></tr>\n");
        body.push_str("<tr><td colspan=\"10\">Total Quantity</td></tr>\n");
        body.push_str("<tr><td colspan=\"10\">Total Number of Transactions</td></tr>\n");
        body.push_str("<tr><td colspan=\"10\"><a href=\"?page=2\">Next</a></td></tr>\n");

        format!(
            "<html><body><div id=\"home-contents\">\
             <table class=\"table table-condensed table-hover\"><tbody>\n{}</tbody></table>\
             </div></body></html>",
            body
        )
    }

    pub const ABC_ROW: [&str; 8] = [
        "ABC Bank Ltd.", "120", "505.0", "495.0", "500.0", "10000", "5000000", "498.0",
    ];
}
