//! URL admission patterns
//!
//! A scraper carries a list of [`UrlPattern`]s; extracted URLs must match at
//! least one of them to be queued. An empty list matches everything.

use std::fmt;

use regex::Regex;

use crate::config::{PatternEntry, PatternKind};
use crate::error::{CrawlkitError, Result};

/// A compiled URL pattern rule
#[derive(Debug, Clone)]
pub struct UrlPattern {
    kind: PatternKind,
    pattern: String,
    // Compiled at construction; matching never compiles.
    regex: Option<Regex>,
}

impl UrlPattern {
    /// Compile a pattern rule. Regexp patterns fail here, not at match time.
    pub fn new(kind: PatternKind, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let regex = match kind {
            PatternKind::Regexp => {
                Some(
                    Regex::new(&pattern).map_err(|source| CrawlkitError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })?,
                )
            }
            PatternKind::Contains => None,
        };

        Ok(Self {
            kind,
            pattern,
            regex,
        })
    }

    /// Build a pattern from its config representation
    pub fn from_entry(entry: &PatternEntry) -> Result<Self> {
        Self::new(entry.kind, entry.pattern.clone())
    }

    /// Test a URL against this rule. `contains` is a case-sensitive substring
    /// test; `regexp` matches anywhere in the URL with no implicit anchoring.
    pub fn matches(&self, url: &str) -> bool {
        match self.kind {
            PatternKind::Contains => url.contains(&self.pattern),
            PatternKind::Regexp => self
                .regex
                .as_ref()
                .map(|re| re.is_match(url))
                .unwrap_or(false),
        }
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PatternKind::Contains => "contains",
            PatternKind::Regexp => "regexp",
        };
        write!(f, "URL pattern [{}]: {}", kind, self.pattern)
    }
}

/// True when `url` passes `patterns`; an empty list accepts every URL
pub fn check_url_patterns(patterns: &[UrlPattern], url: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.matches(url))
}
