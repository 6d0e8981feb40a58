use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::ser::{Serialize, Serializer};

use crate::store::StoredReport;

static DOSE_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*([a-zµ]+)").unwrap());

/// Samples below this size only get a min-max Common band.
const PERCENTILE_MIN_SAMPLES: usize = 5;

/// Dose range bands for one (substance, route) group.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DoseBand {
    #[serde(rename = "Threshold")]
    pub threshold: String,
    #[serde(rename = "Light")]
    pub light: String,
    #[serde(rename = "Common")]
    pub common: String,
    #[serde(rename = "Strong")]
    pub strong: String,
    #[serde(rename = "Heavy")]
    pub heavy: String,
    #[serde(rename = "Dangerous")]
    pub dangerous: String,
    /// Lethal doses are never inferred from reports.
    #[serde(rename = "Fatal")]
    pub fatal: String,
    #[serde(rename = "_stats")]
    pub stats: DoseStats,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DoseStats {
    pub total_reports: usize,
    pub distribution: Distribution,
}

/// `"<value> <unit>" -> frequency`, ascending by value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Distribution(pub Vec<(String, usize)>);

impl Serialize for Distribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

/// Per-route bands for one substance, in route encounter order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteBands(pub Vec<(String, DoseBand)>);

impl Serialize for RouteBands {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SubstanceBands {
    pub formatted_dose: RouteBands,
}

/// Dose strings grouped by raw substance label, then route. Both levels keep
/// first-encounter order so a rebuild over the same files is reproducible.
#[derive(Debug, Default)]
pub struct DoseCorpus {
    substances: Vec<(String, Vec<(String, Vec<String>)>)>,
    index: HashMap<String, usize>,
}

impl DoseCorpus {
    pub fn add(&mut self, substance: &str, method: &str, dose: &str) {
        let idx = match self.index.get(substance) {
            Some(&i) => i,
            None => {
                self.substances.push((substance.to_string(), Vec::new()));
                self.index.insert(substance.to_string(), self.substances.len() - 1);
                self.substances.len() - 1
            }
        };
        let methods = &mut self.substances[idx].1;
        match methods.iter_mut().find(|(m, _)| m == method) {
            Some((_, doses)) => doses.push(dose.to_string()),
            None => methods.push((method.to_string(), vec![dose.to_string()])),
        }
    }

    pub fn substance_count(&self) -> usize {
        self.substances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.substances.is_empty()
    }
}

/// Replay every stored report into a fresh corpus.
pub fn build_corpus(reports: &[StoredReport]) -> DoseCorpus {
    let mut corpus = DoseCorpus::default();
    for report in reports {
        for dose in &report.doses {
            corpus.add(&dose.substance, &dose.method, &dose.dose);
        }
    }
    corpus
}

/// Compute bands for every group. Substances where no route produced a band
/// are left out entirely.
pub fn summarize(corpus: &DoseCorpus) -> Vec<(String, SubstanceBands)> {
    corpus
        .substances
        .iter()
        .filter_map(|(substance, methods)| {
            let bands: Vec<(String, DoseBand)> = methods
                .iter()
                .filter_map(|(method, doses)| Some((method.clone(), analyze_doses(doses)?)))
                .collect();
            if bands.is_empty() {
                return None;
            }
            Some((
                substance.clone(),
                SubstanceBands {
                    formatted_dose: RouteBands(bands),
                },
            ))
        })
        .collect()
}

/// Parse `"120 mg"` style strings into (value, unit).
pub fn parse_dose(dose: &str) -> Option<(f64, String)> {
    let normalized = dose.trim().to_lowercase().replace(',', "");
    let caps = DOSE_VALUE_RE.captures(&normalized)?;
    let value: f64 = caps[1].parse().ok()?;
    Some((value, caps[2].to_string()))
}

/// Most frequent unit; equal counts go to the lexicographically smallest unit.
fn dominant_unit(parsed: &[(f64, String)]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, unit) in parsed {
        *counts.entry(unit.as_str()).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (unit, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((unit, count));
        }
    }
    best.map(|(unit, _)| unit.to_string())
}

/// Quantile bucketing over one group's dose strings. Only samples in the
/// dominant unit are used; units are never converted.
pub fn analyze_doses(doses: &[String]) -> Option<DoseBand> {
    let parsed: Vec<(f64, String)> = doses.iter().filter_map(|d| parse_dose(d)).collect();
    let unit = dominant_unit(&parsed)?;

    let mut values: Vec<f64> = parsed
        .iter()
        .filter(|(_, u)| *u == unit)
        .map(|(v, _)| *v)
        .collect();
    values.sort_by(|a, b| a.total_cmp(b));

    let count = values.len();
    if count == 0 {
        return None;
    }

    let mut band = DoseBand {
        threshold: String::new(),
        light: String::new(),
        common: String::new(),
        strong: String::new(),
        heavy: String::new(),
        dangerous: String::new(),
        fatal: "Unknown".to_string(),
        stats: DoseStats {
            total_reports: count,
            distribution: distribution(&values, &unit),
        },
    };

    let min = values[0];
    let max = values[count - 1];

    if count == 1 {
        band.common = format!("{} {}", min, unit);
        return Some(band);
    }
    if count < PERCENTILE_MIN_SAMPLES {
        band.common = format_range(min, max, &unit);
        return Some(band);
    }

    let percentile = |pct: f64| values[((count as f64 * pct) as usize).min(count - 1)];
    let p10 = percentile(0.10);
    let p30 = percentile(0.30);
    let p70 = percentile(0.70);
    let p90 = percentile(0.90);

    if min <= p10 {
        band.threshold = format_range(min, p10, &unit);
    }
    if p30 > p10 {
        band.light = format_range(p10, p30, &unit);
    }
    if p70 >= p30 {
        band.common = format_range(p30, p70, &unit);
    }
    if p90 > p70 {
        band.strong = format_range(p70, p90, &unit);
    }
    band.heavy = format!("{}+ {}", p90, unit);

    Some(band)
}

fn format_range(start: f64, end: f64, unit: &str) -> String {
    if start == end {
        format!("{} {}", start, unit)
    } else {
        format!("{}-{} {}", start, end, unit)
    }
}

fn distribution(sorted: &[f64], unit: &str) -> Distribution {
    let mut buckets: Vec<(f64, usize)> = Vec::new();
    for &v in sorted {
        match buckets.last_mut() {
            Some((last, n)) if *last == v => *n += 1,
            _ => buckets.push((v, 1)),
        }
    }
    Distribution(
        buckets
            .into_iter()
            .map(|(v, n)| (format!("{} {}", v, unit), n))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::DoseRecord;

    fn doses(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn six_sample_scenario() {
        let band = analyze_doses(&doses(&[
            "80 mg", "100 mg", "120 mg", "150 mg", "200 mg", "300 mg",
        ]))
        .unwrap();
        assert_eq!(band.threshold, "80 mg");
        assert_eq!(band.light, "80-100 mg");
        assert_eq!(band.common, "100-200 mg");
        assert_eq!(band.strong, "200-300 mg");
        assert_eq!(band.heavy, "300+ mg");
        assert_eq!(band.dangerous, "");
        assert_eq!(band.fatal, "Unknown");
        assert_eq!(band.stats.total_reports, 6);
    }

    #[test]
    fn single_sample_is_common() {
        let band = analyze_doses(&doses(&["1.5 g"])).unwrap();
        assert_eq!(band.common, "1.5 g");
        assert_eq!(band.threshold, "");
        assert_eq!(band.heavy, "");
    }

    #[test]
    fn small_samples_use_min_max() {
        let band = analyze_doses(&doses(&["30 mg", "10 mg", "20 mg"])).unwrap();
        assert_eq!(band.common, "10-30 mg");
        for other in [&band.threshold, &band.light, &band.strong, &band.heavy] {
            assert!(other.is_empty());
        }

        let same = analyze_doses(&doses(&["25 mg", "25 mg", "25 mg", "25 mg"])).unwrap();
        assert_eq!(same.common, "25 mg");
    }

    #[test]
    fn nothing_parsable_gives_no_band() {
        assert!(analyze_doses(&[]).is_none());
        assert!(analyze_doses(&doses(&["a lot", "mg"])).is_none());
    }

    #[test]
    fn minority_unit_is_excluded() {
        let band = analyze_doses(&doses(&[
            "100 mg", "1 g", "120 mg", "2 g", "140 mg", "160 mg",
        ]))
        .unwrap();
        assert_eq!(band.stats.total_reports, 4);
        assert_eq!(band.common, "100-160 mg");
        assert!(band.stats.distribution.0.iter().all(|(k, _)| k.ends_with(" mg")));
    }

    #[test]
    fn unit_tie_prefers_lexicographic_order() {
        let band = analyze_doses(&doses(&["5 ml", "1 g", "6 ml", "2 g"])).unwrap();
        assert_eq!(band.common, "1-2 g");
    }

    #[test]
    fn dose_strings_are_normalized_before_parsing() {
        assert_eq!(parse_dose(" 1,000 MG "), Some((1000.0, "mg".to_string())));
        assert_eq!(parse_dose("250µg"), Some((250.0, "µg".to_string())));
        assert_eq!(parse_dose("drops"), None);
    }

    #[test]
    fn percentile_boundaries_are_monotonic() {
        let mut seed: u64 = 7;
        for count in 5..60 {
            let samples: Vec<String> = (0..count)
                .map(|_| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    format!("{} mg", (seed >> 33) % 400 + 1)
                })
                .collect();
            let mut values: Vec<f64> = samples.iter().filter_map(|d| parse_dose(d)).map(|(v, _)| v).collect();
            values.sort_by(|a, b| a.total_cmp(b));
            let pick = |pct: f64| values[((count as f64 * pct) as usize).min(count - 1)];
            let (p10, p30, p70, p90) = (pick(0.1), pick(0.3), pick(0.7), pick(0.9));
            assert!(values[0] <= p10 && p10 <= p30 && p30 <= p70 && p70 <= p90);
            assert!(p90 <= values[count - 1]);

            let band = analyze_doses(&samples).unwrap();
            assert_eq!(band.heavy, format!("{}+ mg", p90));
            assert!(!band.threshold.is_empty());
            assert!(!band.common.is_empty());
        }
    }

    #[test]
    fn distribution_counts_repeated_values() {
        let band = analyze_doses(&doses(&[
            "10 mg", "20 mg", "10 mg", "30 mg", "20 mg", "10 mg",
        ]))
        .unwrap();
        assert_eq!(
            band.stats.distribution.0,
            vec![
                ("10 mg".to_string(), 3),
                ("20 mg".to_string(), 2),
                ("30 mg".to_string(), 1)
            ]
        );
    }

    #[test]
    fn corpus_groups_by_substance_then_route() {
        let reports = vec![
            StoredReport {
                url: "u1".into(),
                doses: vec![
                    DoseRecord { substance: "LSD".into(), dose: "100 ug".into(), method: "oral".into() },
                    DoseRecord { substance: "Cannabis".into(), dose: "1 g".into(), method: "smoked".into() },
                ],
                timestamp: String::new(),
            },
            StoredReport {
                url: "u2".into(),
                doses: vec![
                    DoseRecord { substance: "LSD".into(), dose: "150 ug".into(), method: "sublingual".into() },
                    DoseRecord { substance: "LSD".into(), dose: "200 ug".into(), method: "oral".into() },
                ],
                timestamp: String::new(),
            },
        ];
        let corpus = build_corpus(&reports);
        assert_eq!(corpus.substance_count(), 2);

        let summary = summarize(&corpus);
        let names: Vec<&str> = summary.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["LSD", "Cannabis"]);

        let lsd = &summary[0].1.formatted_dose.0;
        assert_eq!(lsd[0].0, "oral");
        assert_eq!(lsd[0].1.common, "100-200 ug");
        assert_eq!(lsd[1].0, "sublingual");
        assert_eq!(lsd[1].1.common, "150 ug");
    }

    #[test]
    fn band_serializes_with_display_keys() {
        let band = analyze_doses(&doses(&["5 mg", "10 mg"])).unwrap();
        let json = serde_json::to_value(&band).unwrap();
        assert_eq!(json["Common"], "5-10 mg");
        assert_eq!(json["Fatal"], "Unknown");
        assert_eq!(json["_stats"]["total_reports"], 2);
        assert_eq!(json["_stats"]["distribution"]["5 mg"], 1);
    }
}
