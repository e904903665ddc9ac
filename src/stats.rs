//! Crawl statistics registry
//!
//! One mutex guards every counter: the per-scraper tallies plus the
//! engine-wide totals. Critical sections are short and never perform I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters for a single scraper
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScraperStats {
    /// Fetches attempted
    pub crawled: u64,
    /// Fetches that returned a 200 with a readable body
    pub successful: u64,
    /// Everything else
    pub failed: u64,
    /// Handler-produced items observed on the items channel
    pub scraped: u64,
    /// Items persisted after validation
    pub saved: u64,
}

/// Summary of the last outbound request
#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
}

/// Summary of the last response received
#[derive(Debug, Clone, Serialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub url: String,
}

/// Engine-wide snapshot, cloned out of the registry for the control plane
#[derive(Debug, Clone, Serialize)]
pub struct EngineTotals {
    pub requests_total: u64,
    pub started: DateTime<Utc>,
    pub last_request: Option<RequestInfo>,
    pub last_response: Option<ResponseInfo>,
}

#[derive(Debug)]
struct StatsInner {
    scrapers: HashMap<String, ScraperStats>,
    requests_total: u64,
    started: DateTime<Utc>,
    last_request: Option<RequestInfo>,
    last_response: Option<ResponseInfo>,
}

/// Mutex-protected registry of per-scraper counters and engine totals
#[derive(Debug)]
pub struct StatsRegistry {
    inner: Mutex<StatsInner>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                scrapers: HashMap::new(),
                requests_total: 0,
                started: Utc::now(),
                last_request: None,
                last_response: None,
            }),
        }
    }

    /// Add a scraper to the registry. Idempotent.
    pub fn register(&self, name: &str) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.scrapers.entry(name.to_string()).or_default();
    }

    /// Record one finished fetch: bumps crawled, successful/failed and the
    /// engine totals, and remembers the request/response pair.
    pub fn update_request(
        &self,
        name: &str,
        success: bool,
        request: RequestInfo,
        response: Option<ResponseInfo>,
    ) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.requests_total += 1;
        inner.last_request = Some(request);
        inner.last_response = response;

        let stats = inner.scrapers.entry(name.to_string()).or_default();
        stats.crawled += 1;
        if success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
    }

    /// Count one handler-produced item observed for `name`
    pub fn incr_scraped(&self, name: &str) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.scrapers.entry(name.to_string()).or_default().scraped += 1;
    }

    /// Count one validated item handed to a sink for `name`
    pub fn incr_saved(&self, name: &str) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.scrapers.entry(name.to_string()).or_default().saved += 1;
    }

    /// Snapshot a single scraper's counters
    pub fn get(&self, name: &str) -> ScraperStats {
        let inner = self.inner.lock().expect("stats mutex poisoned");
        inner.scrapers.get(name).cloned().unwrap_or_default()
    }

    /// Snapshot every scraper's counters
    pub fn all(&self) -> HashMap<String, ScraperStats> {
        let inner = self.inner.lock().expect("stats mutex poisoned");
        inner.scrapers.clone()
    }

    /// Snapshot the engine totals
    pub fn totals(&self) -> EngineTotals {
        let inner = self.inner.lock().expect("stats mutex poisoned");
        EngineTotals {
            requests_total: inner.requests_total,
            started: inner.started,
            last_request: inner.last_request.clone(),
            last_response: inner.last_response.clone(),
        }
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
