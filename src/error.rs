//! Error types for crawlkit

use thiserror::Error;

/// Main error type for crawlkit operations
#[derive(Error, Debug)]
pub enum CrawlkitError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("{0} is not a valid status code")]
    InvalidStatus(u16),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid URL pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("No scraper named '{0}' is registered")]
    UnknownScraper(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CrawlkitError>;

impl CrawlkitError {
    /// Check whether this error came from the transport layer
    pub fn is_transport(&self) -> bool {
        matches!(self, CrawlkitError::HttpError(_))
    }

    /// Get a human-readable error category
    pub fn category(&self) -> &'static str {
        match self {
            CrawlkitError::HttpError(_) => "HTTP",
            CrawlkitError::InvalidStatus(_) => "Status",
            CrawlkitError::InvalidUrl(_) => "URL",
            CrawlkitError::ConfigError(_) => "Configuration",
            CrawlkitError::InvalidPattern { .. } => "Pattern",
            CrawlkitError::IoError(_) => "IO",
            CrawlkitError::JsonError(_) => "JSON",
            CrawlkitError::YamlError(_) => "YAML",
            CrawlkitError::CsvError(_) => "CSV",
            CrawlkitError::RedisError(_) => "Redis",
            CrawlkitError::UnknownScraper(_) => "Scraper",
            CrawlkitError::ChannelClosed => "Channel",
        }
    }
}
