use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

const ENV_PREFIX: &str = "DOSES";

/// Which link-map entries a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawSubstanceLimit")]
pub enum SubstanceLimit {
    All,
    First(usize),
    Named(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSubstanceLimit {
    Count(usize),
    Names(Vec<String>),
    Keyword(String),
}

impl From<RawSubstanceLimit> for SubstanceLimit {
    fn from(raw: RawSubstanceLimit) -> Self {
        match raw {
            RawSubstanceLimit::Count(n) => SubstanceLimit::First(n),
            RawSubstanceLimit::Names(names) => SubstanceLimit::Named(names),
            // Environment values always arrive as strings.
            RawSubstanceLimit::Keyword(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("all") {
                    SubstanceLimit::All
                } else if let Ok(n) = s.parse() {
                    SubstanceLimit::First(n)
                } else {
                    SubstanceLimit::Named(vec![s.to_string()])
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// Random delay within the range (inclusive).
    pub fn sample(&self) -> Duration {
        use rand::Rng;
        let (lo, hi) = if self.min_ms <= self.max_ms {
            (self.min_ms, self.max_ms)
        } else {
            (self.max_ms, self.min_ms)
        };
        if lo == hi {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_substances: SubstanceLimit,
    pub workers: usize,
    pub max_reports_per_category: usize,
    pub link_map_path: PathBuf,
    pub canonical_path: PathBuf,
    pub progress_path: PathBuf,
    pub store_dir: PathBuf,
    pub output_dir: PathBuf,
    pub site_root: String,
    pub report_base: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub category_delay: DelayRange,
    pub report_delay: DelayRange,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_substances: SubstanceLimit::All,
            workers: 4,
            max_reports_per_category: 500,
            link_map_path: PathBuf::from("data/substances_erowid_links.json"),
            canonical_path: PathBuf::from("drugs.json"),
            progress_path: PathBuf::from("data/progress.json"),
            store_dir: PathBuf::from("data/temp_doses"),
            output_dir: PathBuf::from("data"),
            site_root: "https://www.erowid.org".to_string(),
            report_base: "https://www.erowid.org/experiences/".to_string(),
            user_agent: concat!(
                "dose_harvester/",
                env!("CARGO_PKG_VERSION"),
                " (experience report dose survey)"
            )
            .to_string(),
            request_timeout_secs: 20,
            category_delay: DelayRange::new(1000, 3000),
            report_delay: DelayRange::new(1000, 2000),
        }
    }
}

impl Settings {
    /// Defaults, then the optional YAML file, then `DOSES_*` environment
    /// variables such as `DOSES_WORKERS=2` (`__` separates nested keys).
    pub fn load(path: &Path) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;
        let mut settings: Settings = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.workers = settings.workers.clamp(1, 16);
        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Settings::load reads the process environment; tests touching it run one at a time.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn load_yaml(body: &str) -> Settings {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, body).unwrap();
        Settings::load(&path).unwrap()
    }

    #[test]
    fn missing_file_uses_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(s.max_substances, SubstanceLimit::All);
        assert_eq!(s.workers, 4);
        assert_eq!(s.max_reports_per_category, 500);
    }

    #[test]
    fn limit_variants() {
        assert_eq!(load_yaml("max_substances: ALL\n").max_substances, SubstanceLimit::All);
        assert_eq!(load_yaml("max_substances: 3\n").max_substances, SubstanceLimit::First(3));
        assert_eq!(
            load_yaml("max_substances:\n  - lsd\n  - 2c-b\n").max_substances,
            SubstanceLimit::Named(vec!["lsd".into(), "2c-b".into()])
        );
    }

    #[test]
    fn file_overrides_and_clamps() {
        let s = load_yaml("workers: 64\nreport_delay:\n  min_ms: 0\n  max_ms: 0\n");
        assert_eq!(s.workers, 16);
        assert_eq!(s.report_delay, DelayRange::new(0, 0));
        assert_eq!(s.category_delay, DelayRange::new(1000, 3000));
    }

    #[test]
    fn environment_overrides_file() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "workers: 8\nmax_reports_per_category: 100\n").unwrap();

        std::env::set_var("DOSES_WORKERS", "2");
        std::env::set_var("DOSES_MAX_REPORTS_PER_CATEGORY", "7");
        let loaded = Settings::load(&path);
        std::env::remove_var("DOSES_WORKERS");
        std::env::remove_var("DOSES_MAX_REPORTS_PER_CATEGORY");

        let s = loaded.unwrap();
        assert_eq!(s.workers, 2);
        assert_eq!(s.max_reports_per_category, 7);
    }

    #[test]
    fn keyword_strings_convert() {
        let from = |s: &str| SubstanceLimit::from(RawSubstanceLimit::Keyword(s.into()));
        assert_eq!(from("all"), SubstanceLimit::All);
        assert_eq!(from("12"), SubstanceLimit::First(12));
        assert_eq!(from("mdma"), SubstanceLimit::Named(vec!["mdma".into()]));
    }

    #[test]
    fn delay_sample_stays_in_range() {
        let range = DelayRange::new(5, 10);
        for _ in 0..50 {
            let d = range.sample().as_millis();
            assert!((5..=10).contains(&d));
        }
        assert_eq!(DelayRange::new(0, 0).sample(), Duration::ZERO);
    }
}
