use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::aggregate::SubstanceBands;
use crate::utils::write_json_atomic;

/// Final result: display name -> bands, in output order.
#[derive(Debug, Default)]
pub struct DoseReport(pub Vec<(String, SubstanceBands)>);

impl Serialize for DoseReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

/// Matching key for substance names: lowercase, no hyphens, spaces or commas.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | ' ' | ','))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Canonical matches first, in canonical order and under the canonical name;
/// then labels that matched nothing, in their original order. When several
/// labels map to one canonical name the last of them supplies the data.
pub fn sort_by_canonical<T>(entries: Vec<(String, T)>, canonical: &[String]) -> Vec<(String, T)> {
    let canonical_keys: HashMap<String, &str> = canonical
        .iter()
        .rev()
        .map(|name| (normalize_name(name), name.as_str()))
        .collect();

    let mut matched: HashMap<String, T> = HashMap::new();
    let mut unknown = Vec::new();
    for (label, data) in entries {
        let key = normalize_name(&label);
        let Some(name) = canonical_keys.get(&key) else {
            unknown.push((label, data));
            continue;
        };
        if matched.insert(key, data).is_some() {
            debug!("Label {:?} replaces an earlier match for {}", label, name);
        }
    }

    let mut ordered = Vec::with_capacity(matched.len() + unknown.len());
    for name in canonical {
        if let Some(data) = matched.remove(&normalize_name(name)) {
            ordered.push((name.clone(), data));
        }
    }
    ordered.extend(unknown);
    ordered
}

pub fn output_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    dir.join(format!("extracted_doses_{}.json", stamp))
}

/// Write the report to a fresh timestamped file under `dir`.
pub fn write_report(dir: &Path, report: &DoseReport) -> Result<PathBuf> {
    let path = output_path(dir);
    write_json_atomic(&path, report)?;
    Ok(path)
}

/// Re-sort an existing result file in place. Returns (canonical, other) counts.
pub fn reorder_file(path: &Path, canonical: &[String]) -> Result<(usize, usize)> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read result file {}", path.display()))?;
    let Value::Object(map) = serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("Failed to parse result file {}", path.display()))?
    else {
        bail!("Result file {} is not a JSON object", path.display());
    };

    let total = map.len();
    let ordered = sort_by_canonical(map.into_iter().collect(), canonical);
    let canonical_hits = ordered
        .iter()
        .filter(|(k, _)| canonical.contains(k))
        .count();
    let out: Map<String, Value> = ordered.into_iter().collect();
    write_json_atomic(path, &out)?;
    Ok((canonical_hits, total - canonical_hits))
}
