use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// `<amount> <unit> <route> <substance>` up to the next "(" or end of text.
static DOSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([0-9]+(?:\.[0-9]+)?)\s*(mg|g|ug|µg|ml|drops?|capsules?)\s*(oral|IM|IV|SC|intranasal|smoked|insufflated|rectal|subcutaneous|intravenous|buccal|sublingual|intramuscular)\s*([A-Za-z0-9,\-\s]+?)(?:\s*\(|$)",
    )
    .unwrap()
});
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DISALLOWED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s,-]").unwrap());

/// One dose line pulled out of a report body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseRecord {
    pub substance: String,
    pub dose: String,
    pub method: String,
}

/// Scan report text for dose lines. Every non-overlapping match is kept,
/// including substances that are only mentioned in passing.
pub fn extract_doses(text: &str) -> Vec<DoseRecord> {
    DOSE_RE
        .captures_iter(text)
        .map(|caps| DoseRecord {
            substance: clean_substance(&caps[4]),
            dose: format!("{} {}", &caps[1], &caps[2]),
            method: caps[3].to_lowercase(),
        })
        .collect()
}

fn clean_substance(raw: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(raw.trim(), " ");
    DISALLOWED_RE.replace_all(&collapsed, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_dose_at_end_of_text() {
        let doses = extract_doses("DOSE: 120 mg oral MDMA");
        assert_eq!(
            doses,
            vec![DoseRecord {
                substance: "MDMA".into(),
                dose: "120 mg".into(),
                method: "oral".into(),
            }]
        );
    }

    #[test]
    fn stops_at_parenthesis() {
        let doses = extract_doses("T+ 0:00 100 ug sublingual LSD (blotter)");
        assert_eq!(doses.len(), 1);
        assert_eq!(doses[0].substance, "LSD");
        assert_eq!(doses[0].dose, "100 ug");
        assert_eq!(doses[0].method, "sublingual");
    }

    #[test]
    fn multiple_substances_in_one_report() {
        let text = "3.5 g oral Mushrooms - P cubensis (dried)\n\
                    T+ 1:30 20 mg insufflated Ketamine (powder)";
        let doses = extract_doses(text);
        assert_eq!(doses.len(), 2);
        assert_eq!(doses[0].dose, "3.5 g");
        assert_eq!(doses[0].substance, "Mushrooms - P cubensis");
        assert_eq!(doses[1].substance, "Ketamine");
        assert_eq!(doses[1].method, "insufflated");
    }

    #[test]
    fn route_is_lowercased_and_unit_kept_verbatim() {
        let doses = extract_doses("2 capsules ORAL Kratom");
        assert_eq!(doses[0].method, "oral");
        assert_eq!(doses[0].dose, "2 capsules");
    }

    #[test]
    fn whitespace_runs_collapse() {
        let doses = extract_doses("50 mg oral 2C-B,   \t  Cannabis (smoked)");
        assert_eq!(doses[0].substance, "2C-B, Cannabis");
    }

    #[test]
    fn text_without_doses_yields_nothing() {
        assert!(extract_doses("I took a walk and felt fine.").is_empty());
        assert!(extract_doses("").is_empty());
    }

    #[test]
    fn missing_route_is_not_a_dose() {
        assert!(extract_doses("I had 200 mg of caffeine (coffee)").is_empty());
    }
}
