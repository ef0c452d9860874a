//! Blocklist for ad/tracking domains.
//!
//! Holds the set of blocked domains behind a reader-optimized lock and
//! provides suffix lookup in O(labels) hash probes.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use super::{fold_query_name, normalize_domain, parse_line};
use crate::error::BlocklistError;

/// A set of blocked domains for efficient lookup.
///
/// Each entry blocks itself and every subdomain. Reads take a shared lock
/// and never allocate for already-lowercase names; writes happen only on
/// load/add/remove.
pub struct Blocklist {
    domains: RwLock<FxHashSet<Box<str>>>,
}

impl Blocklist {
    /// Create an empty blocklist.
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(FxHashSet::default()),
        }
    }

    /// Load domains from raw blocklist lines.
    ///
    /// Returns the number of *new* distinct domains added. Blank and comment
    /// lines are skipped; lines that do not name a valid domain are counted
    /// and reported in the log.
    pub fn load<I, S>(&self, lines: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        let mut rejected = 0usize;

        for line in lines {
            for candidate in parse_line(line.as_ref()) {
                match normalize_domain(candidate) {
                    Some(domain) => parsed.push(domain.into_boxed_str()),
                    None => {
                        rejected += 1;
                        debug!(entry = candidate, "Skipping invalid blocklist entry");
                    }
                }
            }
        }

        if rejected > 0 {
            warn!(rejected, "Blocklist contained invalid entries");
        }

        let mut domains = self.domains.write();
        let mut added = 0;
        for domain in parsed {
            if domains.insert(domain) {
                added += 1;
            }
        }
        added
    }

    /// Load domains from a file, merging with the current entries.
    ///
    /// If reading fails partway, everything read before the failure is still
    /// committed and the error carries that count.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<usize, BlocklistError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| BlocklistError::Read {
            path: path.to_path_buf(),
            added: 0,
            source,
        })?;

        let mut lines = Vec::new();
        let mut failure = None;
        for line in BufReader::new(file).lines() {
            match line {
                Ok(line) => lines.push(line),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let added = self.load(&lines);
        match failure {
            Some(source) => Err(BlocklistError::Read {
                path: path.to_path_buf(),
                added,
                source,
            }),
            None => Ok(added),
        }
    }

    /// Add a single domain. Returns `Ok(true)` if it was not already present.
    pub fn add(&self, domain: &str) -> Result<bool, BlocklistError> {
        let normalized = normalize_domain(domain)
            .ok_or_else(|| BlocklistError::InvalidDomain(domain.to_string()))?;
        Ok(self.domains.write().insert(normalized.into_boxed_str()))
    }

    /// Remove a single entry. Subdomain entries listed separately stay.
    pub fn remove(&self, domain: &str) -> bool {
        let domain = fold_query_name(domain.trim());
        self.domains.write().remove(&*domain)
    }

    /// Check if a domain should be blocked.
    ///
    /// Performs exact match and subdomain matching (e.g., blocks
    /// "ads.example.com" if "example.com" is in the blocklist).
    pub fn contains(&self, domain: &str) -> bool {
        let domain = fold_query_name(domain);
        let mut current = &*domain;
        if current.is_empty() {
            return false;
        }

        let domains = self.domains.read();
        loop {
            if domains.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }

    /// Returns the number of domains in the blocklist.
    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }

    /// Sorted snapshot of all entries.
    pub fn domains(&self) -> Vec<String> {
        let mut all: Vec<String> = self.domains.read().iter().map(|d| d.to_string()).collect();
        all.sort_unstable();
        all
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Blocklist {
        let blocklist = Blocklist::new();
        blocklist.load(["doubleclick.com", "ads.example.com", "tracker.net"]);
        blocklist
    }

    #[test]
    fn load_counts_distinct_domains() {
        let blocklist = Blocklist::new();

        let added = blocklist.load(["ads.example.com", "tracker.net", "ads.example.com"]);

        assert_eq!(added, 2);
        assert_eq!(blocklist.len(), 2);
    }

    #[test]
    fn load_ignores_blank_lines_and_case_duplicates() {
        let blocklist = Blocklist::new();

        let added = blocklist.load(["", "  ", "# header", "A.com", "a.com.", "b.com", ""]);

        assert_eq!(added, 2);
    }

    #[test]
    fn load_reports_only_new_domains_on_merge() {
        let blocklist = sample();

        let added = blocklist.load(["tracker.net", "new.org"]);

        assert_eq!(added, 1);
        assert_eq!(blocklist.len(), 4);
    }

    #[test]
    fn load_accepts_hosts_file_lines() {
        let blocklist = Blocklist::new();

        let added = blocklist.load(["0.0.0.0 ads.example.com", "127.0.0.1 localhost"]);

        assert_eq!(added, 1);
        assert!(blocklist.contains("ads.example.com"));
        assert!(!blocklist.contains("localhost"));
    }

    #[test]
    fn contains_exact_match() {
        let blocklist = sample();

        assert!(blocklist.contains("doubleclick.com"));
    }

    #[test]
    fn contains_subdomain_match() {
        let blocklist = sample();

        assert!(blocklist.contains("sub.ads.example.com"));
        assert!(blocklist.contains("tracker.ads.doubleclick.com"));
    }

    #[test]
    fn contains_does_not_match_parent() {
        let blocklist = sample();

        assert!(!blocklist.contains("example.com"));
        assert!(!blocklist.contains("com"));
    }

    #[test]
    fn contains_requires_label_boundary() {
        let blocklist = sample();

        assert!(!blocklist.contains("notdoubleclick.com"));
        assert!(!blocklist.contains("xtracker.net"));
    }

    #[test]
    fn contains_case_and_root_dot_insensitive() {
        let blocklist = sample();

        assert!(blocklist.contains("DOUBLECLICK.COM"));
        assert!(blocklist.contains("ADS.doubleclick.com."));
    }

    #[test]
    fn contains_returns_false_for_safe_domains() {
        let blocklist = sample();

        assert!(!blocklist.contains("google.com"));
        assert!(!blocklist.contains("github.com"));
        assert!(!blocklist.contains(""));
    }

    #[test]
    fn add_is_idempotent() {
        let blocklist = Blocklist::new();

        assert!(blocklist.add("Ads.Example.com").unwrap());
        assert!(!blocklist.add("ads.example.com").unwrap());
        assert_eq!(blocklist.len(), 1);
    }

    #[test]
    fn add_rejects_invalid_domain() {
        let blocklist = Blocklist::new();

        assert!(matches!(
            blocklist.add("not a domain"),
            Err(BlocklistError::InvalidDomain(_))
        ));
        assert!(blocklist.is_empty());
    }

    #[test]
    fn remove_only_drops_exact_entry() {
        let blocklist = Blocklist::new();
        blocklist.load(["example.com", "ads.example.com"]);

        assert!(blocklist.remove("EXAMPLE.com"));
        assert!(!blocklist.remove("example.com"));
        assert!(!blocklist.contains("www.example.com"));
        assert!(blocklist.contains("x.ads.example.com"));
    }

    #[test]
    fn domains_are_sorted() {
        let blocklist = sample();

        assert_eq!(
            blocklist.domains(),
            vec!["ads.example.com", "doubleclick.com", "tracker.net"]
        );
    }

    #[test]
    fn load_file_reads_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# ads").unwrap();
        writeln!(file, "ads.example.com").unwrap();
        writeln!(file, "tracker.net").unwrap();
        writeln!(file, "ads.example.com").unwrap();

        let blocklist = Blocklist::new();
        let added = blocklist.load_file(file.path()).unwrap();

        assert_eq!(added, 2);
        assert_eq!(blocklist.len(), 2);
    }

    #[test]
    fn load_file_missing_path_is_an_error() {
        let blocklist = Blocklist::new();

        let err = blocklist.load_file("/nonexistent/blocklist.txt").unwrap_err();

        assert!(matches!(err, BlocklistError::Read { added: 0, .. }));
    }

    #[test]
    fn load_file_commits_lines_before_invalid_utf8() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"first.com\nsecond.com\n\xff\xfe\nthird.com\n")
            .unwrap();

        let blocklist = Blocklist::new();
        let err = blocklist.load_file(file.path()).unwrap_err();

        assert_eq!(err.added(), 2);
        assert!(blocklist.contains("first.com"));
        assert!(blocklist.contains("second.com"));
        assert!(!blocklist.contains("third.com"));
    }
}
