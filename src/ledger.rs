use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Done,
    Failed,
    FailedBlocked,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportStatus::Done => "done",
            ReportStatus::Failed => "failed",
            ReportStatus::FailedBlocked => "failed_blocked",
        })
    }
}

/// Durable report URL -> status map used to resume interrupted crawls.
///
/// The ledger is owned by the crawl's result loop, which is the only writer;
/// every `record` rewrites the whole file.
pub struct ProgressLedger {
    path: PathBuf,
    entries: BTreeMap<String, ReportStatus>,
}

impl ProgressLedger {
    /// Load from disk. A missing or corrupt file yields an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_entries(&path);
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self, url: &str) -> Option<ReportStatus> {
        self.entries.get(url).copied()
    }

    pub fn is_done(&self, url: &str) -> bool {
        self.status(url) == Some(ReportStatus::Done)
    }

    pub fn record(&mut self, url: &str, status: ReportStatus) -> Result<()> {
        self.entries.insert(url.to_string(), status);
        write_json_atomic(&self.path, &self.entries)
    }

    /// Count entries per status: (done, failed, failed_blocked).
    pub fn counts(&self) -> (usize, usize, usize) {
        self.entries
            .values()
            .fold((0, 0, 0), |(d, f, b), status| match status {
                ReportStatus::Done => (d + 1, f, b),
                ReportStatus::Failed => (d, f + 1, b),
                ReportStatus::FailedBlocked => (d, f, b + 1),
            })
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, ReportStatus> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Progress file {} is corrupt, starting empty: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ProgressLedger::load(dir.path().join("progress.json"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, "{\"a\": \"done\",").unwrap();
        assert!(ProgressLedger::load(&path).is_empty());

        fs::write(&path, r#"{"a": "maybe"}"#).unwrap();
        assert!(ProgressLedger::load(&path).is_empty());
    }

    #[test]
    fn record_persists_whole_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let mut ledger = ProgressLedger::load(&path);
        ledger.record("u1", ReportStatus::Failed).unwrap();
        ledger.record("u2", ReportStatus::FailedBlocked).unwrap();
        ledger.record("u1", ReportStatus::Done).unwrap();

        let reloaded = ProgressLedger::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.is_done("u1"));
        assert_eq!(reloaded.status("u2"), Some(ReportStatus::FailedBlocked));
        assert_eq!(reloaded.counts(), (1, 0, 1));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["u2"], "failed_blocked");
    }
}
