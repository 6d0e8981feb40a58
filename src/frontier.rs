use std::collections::{BTreeSet, HashSet};

use crate::inputs::LinkMap;
use crate::ledger::ProgressLedger;
use crate::settings::SubstanceLimit;

/// Report categories worth crawling; anything else in the link map is ignored.
pub const REPORT_CATEGORIES: &[&str] = &[
    "General",
    "First Times",
    "Combinations",
    "Retrospective / Summary",
    "Preparation / Recipes",
    "Difficult Experiences",
    "Bad Trips",
    "Health Problems",
    "Train Wrecks & Trip Disasters",
    "Addiction & Habituation",
    "Glowing Experiences",
    "Mystical Experiences",
    "Health Benefits",
    "Families",
    "What Was in That?",
];

/// Apply the `max_substances` setting to the link map.
pub fn select_substances(map: LinkMap, limit: &SubstanceLimit) -> LinkMap {
    let entries = match limit {
        SubstanceLimit::All => map.entries,
        SubstanceLimit::First(n) => map.entries.into_iter().take(*n).collect(),
        SubstanceLimit::Named(names) => map
            .entries
            .into_iter()
            .filter(|e| {
                let substance = e.substance.to_lowercase();
                names.iter().any(|n| n.to_lowercase() == substance)
            })
            .collect(),
    };
    LinkMap { entries }
}

/// Flatten the link map into the set of allowed category URLs.
pub fn category_urls(map: &LinkMap) -> BTreeSet<String> {
    map.entries
        .iter()
        .flat_map(|e| e.categories.iter())
        .filter(|(name, _)| REPORT_CATEGORIES.contains(&name.as_str()))
        .map(|(_, url)| url.clone())
        .collect()
}

/// Distinct report URLs discovered from category pages, first-seen order.
#[derive(Debug, Default)]
pub struct ReportFrontier {
    urls: Vec<String>,
    seen: HashSet<String>,
}

impl ReportFrontier {
    /// Merge one category's URLs, keeping at most `cap` of them.
    pub fn merge(&mut self, urls: Vec<String>, cap: usize) {
        for url in urls.into_iter().take(cap) {
            if self.seen.insert(url.clone()) {
                self.urls.push(url);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// URLs not yet marked done in the ledger, plus how many were skipped.
    pub fn pending(self, ledger: &ProgressLedger) -> (Vec<String>, usize) {
        let total = self.urls.len();
        let pending: Vec<String> = self.urls.into_iter().filter(|u| !ledger.is_done(u)).collect();
        let skipped = total - pending.len();
        (pending, skipped)
    }
}
