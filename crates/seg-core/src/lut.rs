//! Lookup-table loaders
//!
//! Two on-disk formats feed the label mapper: whitespace-separated color
//! tables (`<id> <name> <R> <G> <B> <A>`, FreeSurfer style, optionally with
//! a header row) and JSON tables of the form `{"labels": {...}}` mapping
//! label names either to names in another space or to integer ids.

use crate::mapper::LabelMap;
use cereb_seg_common::{Result, SegError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Load a tabular color lookup table into a name -> id mapping.
///
/// Comment lines (`#`) and blank lines are skipped; when `has_header` is
/// set, the first remaining line is a header row and is skipped too.
pub fn load_tsv_lut(path: &Path, has_header: bool) -> Result<LabelMap<String, i64>> {
    let text = fs::read_to_string(path).map_err(|e| {
        SegError::Config(format!("cannot read lookup table {}: {e}", path.display()))
    })?;

    let mut pairs = Vec::new();
    let mut header_pending = has_header;
    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if header_pending {
            header_pending = false;
            continue;
        }
        let mut fields = line.split_whitespace();
        let id_field = fields.next().ok_or_else(|| {
            SegError::Config(format!(
                "{}:{}: empty lookup table row",
                path.display(),
                line_no + 1
            ))
        })?;
        let id: i64 = id_field.parse().map_err(|_| {
            SegError::Config(format!(
                "{}:{}: invalid label id '{id_field}'",
                path.display(),
                line_no + 1
            ))
        })?;
        let name = fields.next().ok_or_else(|| {
            SegError::Config(format!(
                "{}:{}: missing label name for id {id}",
                path.display(),
                line_no + 1
            ))
        })?;
        pairs.push((name.to_string(), id));
    }
    LabelMap::from_pairs(pairs)
}

#[derive(Deserialize)]
struct JsonLut<T> {
    labels: BTreeMap<String, T>,
}

fn load_json_lut<T>(path: &Path) -> Result<LabelMap<String, T>>
where
    T: DeserializeOwned + Clone,
{
    let text = fs::read_to_string(path).map_err(|e| {
        SegError::Config(format!("cannot read lookup table {}: {e}", path.display()))
    })?;
    let table: JsonLut<T> = serde_json::from_str(&text).map_err(|e| {
        SegError::Config(format!("invalid JSON lookup table {}: {e}", path.display()))
    })?;
    LabelMap::from_pairs(table.labels)
}

/// Load a JSON lookup table mapping label names to names in another space
pub fn load_json_name_lut(path: &Path) -> Result<LabelMap<String, String>> {
    load_json_lut(path)
}

/// Load a JSON lookup table mapping label names to integer ids
pub fn load_json_id_lut(path: &Path) -> Result<LabelMap<String, i64>> {
    load_json_lut(path)
}
