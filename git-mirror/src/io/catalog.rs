//! Mirror catalog loading.
//!
//! A catalog is either JSON (an array of `{"source", "mirror"}` records, or an
//! object with a `mirrors` array) or, for `.toml` files, a list of
//! `[[mirrors]]` tables.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::entry::MirrorEntry;
use crate::error::CatalogError;

#[derive(Debug, Deserialize)]
struct TomlCatalog {
    #[serde(default)]
    mirrors: Vec<MirrorEntry>,
}

/// Load and validate the catalog at `path`.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_catalog(path: &Path) -> Result<Vec<MirrorEntry>, CatalogError> {
    if !path.exists() {
        return Err(CatalogError::NotFound(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let entries = if is_toml {
        parse_toml(&contents)
    } else {
        parse_json(&contents)
    }
    .map_err(|reason| CatalogError::Malformed {
        path: path.to_path_buf(),
        reason,
    })?;

    info!(count = entries.len(), "loaded mirrors file");
    Ok(entries)
}

/// Parse JSON catalog content.
pub fn parse_json(contents: &str) -> Result<Vec<MirrorEntry>, String> {
    let value: Value = serde_json::from_str(contents).map_err(|e| e.to_string())?;
    let records = match value {
        Value::Array(records) => records,
        Value::Object(mut map) => match map.remove("mirrors") {
            Some(Value::Array(records)) => records,
            _ => return Err("expected a `mirrors` array".to_string()),
        },
        _ => return Err("expected an array of mirror records".to_string()),
    };

    let mut entries = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let entry: MirrorEntry =
            serde_json::from_value(record).map_err(|e| format!("entry {idx}: {e}"))?;
        entries.push(entry);
    }
    validate_entries(&entries)?;
    Ok(entries)
}

/// Parse TOML catalog content.
pub fn parse_toml(contents: &str) -> Result<Vec<MirrorEntry>, String> {
    let catalog: TomlCatalog = toml::from_str(contents).map_err(|e| e.to_string())?;
    validate_entries(&catalog.mirrors)?;
    Ok(catalog.mirrors)
}

fn validate_entries(entries: &[MirrorEntry]) -> Result<(), String> {
    for (idx, entry) in entries.iter().enumerate() {
        if entry.source.trim().is_empty() {
            return Err(format!("entry {idx}: field `source` is empty"));
        }
        if entry.target.trim().is_empty() {
            return Err(format!("entry {idx}: field `mirror` is empty"));
        }
        debug!(idx, source = %entry.source, target = %entry.target, "catalog entry");
    }
    Ok(())
}
