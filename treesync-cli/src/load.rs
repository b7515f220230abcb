use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use tracing::error;
use treesync_core::SyncPairConfig;

/// Read the pair list from a JSON (`.json`) or YAML (anything else) file.
///
/// The file itself must parse as a list; a record that does not fit the
/// pair schema is logged and skipped so the remaining pairs still run.
pub fn load_pairs(path: &Path) -> Result<Vec<SyncPairConfig>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read config {} failed", path.display()))?;

    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let records: Vec<serde_json::Value> = match ext {
        "json" => serde_json::from_str(&text)
            .with_context(|| format!("parse {} as a JSON list", path.display()))?,
        _ => serde_yaml::from_str(&text)
            .with_context(|| format!("parse {} as a YAML list", path.display()))?,
    };
    if records.is_empty() {
        return Err(anyhow!("no sync pairs defined in {}", path.display()));
    }

    let mut pairs = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let label = record
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{idx}"));
        match serde_json::from_value::<SyncPairConfig>(record) {
            Ok(cfg) => pairs.push(cfg),
            Err(e) => error!(pair = %label, error = %e, "malformed pair record, skipping"),
        }
    }
    Ok(pairs)
}
