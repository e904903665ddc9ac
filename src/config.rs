//! Configuration management for crawlkit
//!
//! A [`ScraperConfig`] is a plain struct populated from a YAML or JSON file,
//! detected by suffix. Unknown fields are ignored; missing required fields
//! fail the load.

use std::path::Path;

use serde::Deserialize;

use crate::error::{CrawlkitError, Result};

/// Top-level configuration for an engine run
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperConfig {
    /// Project name, surfaced in logs and the TCP banner
    pub project: String,
    /// Address for the HTTP control endpoints, e.g. "127.0.0.1:8080"
    #[serde(default)]
    pub http_address: Option<String>,
    /// Address for the TCP command server, e.g. "127.0.0.1:7654"
    #[serde(default)]
    pub tcp_address: Option<String>,
    /// Redis address for the item DAO, e.g. "127.0.0.1:6379"
    #[serde(default)]
    pub redis_address: Option<String>,
    /// Output file for the CSV sink; must end in ".csv"
    #[serde(default)]
    pub out_file_name: Option<String>,
    /// One entry per scraper
    #[serde(default)]
    pub scrapers: Vec<ScraperEntry>,
}

/// Configuration for a single scraper
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperEntry {
    /// Unique scraper name
    pub name: String,
    /// Seed URL; also fixes the scraper's domain
    pub url: String,
    /// Milliseconds between requests; 0 falls back to the 1 ms default tick
    pub request_limit: u64,
    /// Extractor selector; "link" (and anything unknown) maps to the link extractor
    #[serde(default)]
    pub extractor: Option<String>,
    /// URL admission patterns; empty means match-any
    #[serde(default)]
    pub patterns: Vec<PatternEntry>,
}

/// A single URL pattern rule as it appears in config files
#[derive(Debug, Clone, Deserialize)]
pub struct PatternEntry {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub pattern: String,
}

/// Supported pattern rule types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Contains,
    Regexp,
}

impl ScraperConfig {
    /// Load a configuration from a YAML (`.yaml`/`.yml`) or JSON (`.json`) file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;

        let name = path.to_string_lossy();
        let config: ScraperConfig = if name.ends_with(".yaml") || name.ends_with(".yml") {
            serde_yaml::from_str(&data)?
        } else if name.ends_with(".json") {
            serde_json::from_str(&data)?
        } else {
            return Err(CrawlkitError::ConfigError(format!(
                "Unsupported config file suffix: {}",
                name
            )));
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(CrawlkitError::ConfigError(
                "Project name cannot be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.scrapers {
            if entry.name.is_empty() {
                return Err(CrawlkitError::ConfigError(
                    "Scraper name cannot be empty".to_string(),
                ));
            }
            if entry.url.is_empty() {
                return Err(CrawlkitError::ConfigError(format!(
                    "Scraper '{}' has no seed URL",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(CrawlkitError::ConfigError(format!(
                    "Duplicate scraper name '{}'",
                    entry.name
                )));
            }
        }

        Ok(())
    }
}
