use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Report category pages for one substance, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstanceLinks {
    pub substance: String,
    pub categories: Vec<(String, String)>,
}

/// substance -> {category name -> category URL}, produced upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMap {
    pub entries: Vec<SubstanceLinks>,
}

impl LinkMap {
    pub fn load(path: &Path) -> Result<Self> {
        let root = read_required_object(path, "link map")?;
        let map = Self::from_json(root);
        info!("Loaded links for {} substances from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn from_json(root: Map<String, Value>) -> Self {
        let entries = root
            .into_iter()
            .filter_map(|(substance, cats)| {
                let Value::Object(cats) = cats else {
                    debug!("Ignoring non-object link entry for {}", substance);
                    return None;
                };
                let categories = cats
                    .into_iter()
                    .filter_map(|(name, url)| match url {
                        Value::String(url) => Some((name, url)),
                        _ => None,
                    })
                    .collect();
                Some(SubstanceLinks {
                    substance,
                    categories,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered `pretty_name` values from the substance database, in file order.
pub fn load_canonical_order(path: &Path) -> Result<Vec<String>> {
    let root = read_required_object(path, "canonical order")?;
    let order = canonical_order_from_json(&root);
    info!("Loaded {} canonical names from {}", order.len(), path.display());
    Ok(order)
}

pub fn canonical_order_from_json(root: &Map<String, Value>) -> Vec<String> {
    root.values()
        .filter_map(|v| v.get("pretty_name")?.as_str().map(str::to_string))
        .collect()
}

fn read_required_object(path: &Path, what: &str) -> Result<Map<String, Value>> {
    if !path.exists() {
        bail!("Required {} file not found: {}", what, path.display());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file {}", what, path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {} file {}", what, path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{} file {} is not a JSON object", what, path.display()),
    }
}
