use chrono::NaiveDate;

// ── Parsers ───────────────────────────────────────────────────────────────────

fn is_blank(s: &str) -> bool {
    s.is_empty() || s == "N/A" || s == "-" || s == "—"
}

/// Parse price: drop thousands separators and whitespace, nothing else.
/// "1,234.56" → 1234.56 | "610.00" → 610.0 | "Rs. 500" → None
pub fn parse_price(s: &str) -> Option<f64> {
    let s = s.trim();
    if is_blank(s) {
        return None;
    }
    let cleaned: String = s
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') {
        return None;
    }
    cleaned.parse().ok()
}

/// Parse an integer count, tolerating thousands separators.
/// "1,204" → 1204 | "120" → 120 | "12.0" → None
pub fn parse_count(s: &str) -> Option<i64> {
    let s = s.trim().replace(',', "");
    if is_blank(&s) {
        return None;
    }
    s.parse().ok()
}

/// Best-effort numeric cells: upstream formatting is inconsistent, so a
/// malformed cell becomes zero instead of rejecting the row.
pub fn price_or_zero(s: &str) -> f64 {
    parse_price(s).unwrap_or(0.0)
}

pub fn count_or_zero(s: &str) -> i64 {
    parse_count(s).unwrap_or(0)
}

/// Parse dates: ISO first (what the report header prints), then the
/// unpadded and day-first variants seen on older pages.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y/%m/%d") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d/%m/%Y") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%b %d, %Y") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d %b %Y") {
        return Some(d);
    }

    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────
