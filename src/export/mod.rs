//! CSV export of stored trading records.

use crate::models::TradingRecord;
use anyhow::{Context, Result};
use std::path::Path;

pub fn write_csv(records: &[TradingRecord], path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    for r in records {
        writer
            .serialize(r)
            .with_context(|| format!("write {} {}", r.business_date, r.security_name))?;
    }
    writer.flush()?;
    Ok(records.len())
}
