//! Reference company loader: the exchange's security list as a JSON array.

use crate::models::Company;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Parse the security list feed body.
pub fn parse_companies(body: &str) -> Result<Vec<Company>> {
    let companies: Vec<Company> =
        serde_json::from_str(body).context("Security list is not a JSON array of companies")?;
    warn_on_duplicate_names(&companies);
    info!(
        "{} companies in security list ({} active)",
        companies.len(),
        companies.iter().filter(|c| c.is_active()).count()
    );
    Ok(companies)
}

/// Read a saved copy of the security list.
pub fn read_companies_file(path: &Path) -> Result<Vec<Company>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    parse_companies(&body).with_context(|| format!("Failed to parse {:?}", path))
}

/// Security name is the join key for trading rows, but the feed does not
/// promise it is unique.
fn warn_on_duplicate_names(companies: &[Company]) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for c in companies {
        *seen.entry(c.security_name.as_str()).or_default() += 1;
    }
    for (name, n) in seen.into_iter().filter(|(_, n)| *n > 1) {
        warn!("{} companies share the security name {:?}", n, name);
    }
}
