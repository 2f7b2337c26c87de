//! Domain matcher
//!
//! Decides which policy set, if any, claims an extracted SNI host.
//! Sets are tried in configured order and the first *enabled* match
//! wins, so the result is deterministic under any permutation of
//! non-matching sets. Matching is case-insensitive and never touches
//! DNS.

use crate::config::SetConfig;
use std::collections::{HashMap, HashSet};

/// A set predicate compiled for fast lookups
struct CompiledSet {
    /// Index into the configuration's set array
    index: usize,
    /// Exact hostnames
    exact: HashSet<String>,
    /// Suffix entries without the leading `*.`; match the base domain
    /// and any subdomain
    suffixes: Vec<String>,
}

impl CompiledSet {
    fn matches(&self, host: &str) -> bool {
        if self.exact.contains(host) {
            return true;
        }
        self.suffixes.iter().any(|suffix| {
            host == suffix
                || host
                    .strip_suffix(suffix)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// Ordered matcher over the enabled sets of a configuration
pub struct TargetMatcher {
    sets: Vec<CompiledSet>,
}

impl TargetMatcher {
    /// Compile the enabled sets. `geosite` carries the pre-resolved
    /// `category -> domains` lists from the external geosite reader;
    /// category entries match the domain and its subdomains.
    pub fn compile(sets: &[SetConfig], geosite: &HashMap<String, Vec<String>>) -> Self {
        let compiled = sets
            .iter()
            .enumerate()
            .filter(|(_, set)| set.enabled)
            .map(|(index, set)| {
                let mut exact = HashSet::new();
                let mut suffixes = Vec::new();

                for entry in &set.targets.sni_domains {
                    let entry = entry.trim().to_ascii_lowercase();
                    if entry.is_empty() {
                        continue;
                    }
                    match entry.strip_prefix("*.") {
                        Some(suffix) => suffixes.push(suffix.to_string()),
                        None => {
                            exact.insert(entry);
                        }
                    }
                }

                for category in &set.targets.geosite_categories {
                    for domain in geosite.get(category).into_iter().flatten() {
                        suffixes.push(domain.trim().to_ascii_lowercase());
                    }
                }

                CompiledSet {
                    index,
                    exact,
                    suffixes,
                }
            })
            .collect();

        Self { sets: compiled }
    }

    /// Index of the first enabled set whose predicate matches `host`
    pub fn match_host(&self, host: &str) -> Option<usize> {
        let host = host.to_ascii_lowercase();
        self.sets
            .iter()
            .find(|set| set.matches(&host))
            .map(|set| set.index)
    }

    /// Number of compiled (enabled) sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether no enabled set exists
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
