use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::extract::DoseRecord;
use crate::utils::write_json_atomic;

static REPORT_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"ID=(\d+)").unwrap());

const FILE_PREFIX: &str = "dose_";

/// Extraction result for a single report, one file per report id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub url: String,
    pub doses: Vec<DoseRecord>,
    pub timestamp: String,
}

/// Stable key for a report URL: the numeric `ID=` parameter when present,
/// otherwise the SHA-256 of the whole URL.
pub fn report_id(url: &str) -> String {
    if let Some(caps) = REPORT_ID_RE.captures(url) {
        return caps[1].to_string();
    }
    let digest = Sha256::digest(url.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create report store {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}{}.json", FILE_PREFIX, report_id(url)))
    }

    /// Write (or overwrite) the result for `url`.
    pub fn save(&self, url: &str, doses: &[DoseRecord]) -> Result<PathBuf> {
        let report = StoredReport {
            url: url.to_string(),
            doses: doses.to_vec(),
            timestamp: chrono::Local::now().to_rfc3339(),
        };
        let path = self.path_for(url);
        write_json_atomic(&path, &report)?;
        Ok(path)
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read report store {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.files()?.len())
    }

    /// Load every stored report in file-name order. Unreadable or malformed
    /// files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<StoredReport>> {
        let files = self.files()?;
        let reports = files
            .par_iter()
            .map(|path| match read_report(path) {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Skipping unreadable report file {}: {:#}", path.display(), e);
                    None
                }
            })
            .collect::<Vec<_>>();
        Ok(reports.into_iter().flatten().collect())
    }
}

fn read_report(path: &Path) -> Result<StoredReport> {
    let raw = fs::read_to_string(path)?;
    let report = serde_json::from_str(&raw)?;
    Ok(report)
}
