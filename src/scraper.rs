//! Per-site crawl unit
//!
//! A [`Scraper`] owns one seed URL and stays inside that URL's domain. Its
//! fetch loop pulls candidate URLs from a bounded intake channel, waits for
//! its own token bucket, and launches each fetch as a concurrent task. Newly
//! extracted links feed back into the same intake.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::EngineCore;
use crate::error::{CrawlkitError, Result};
use crate::extract::{extractor_for, Extractable};
use crate::extensions::{notify_extensions, ExtensionEvent};
use crate::item::{ScrapedItem, ScrapingHandler};
use crate::middleware::prepare_request;
use crate::patterns::{check_url_patterns, UrlPattern};
use crate::stats::{RequestInfo, ResponseInfo, ScraperStats};

pub(crate) const TIMEOUT_REQUEST: Duration = Duration::from_secs(30);
pub(crate) const TIMEOUT_CONNECT: Duration = Duration::from_secs(30);
pub(crate) const INTAKE_CAPACITY: usize = 5;
/// How long the fetch loop waits on an empty intake before concluding the
/// crawl is exhausted (given no fetches are in flight).
pub(crate) const INTAKE_IDLE_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_REQUEST_TICK: Duration = Duration::from_millis(1);

/// Lifecycle of a scraper task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScraperState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

#[derive(Debug, Default)]
struct FetchState {
    fetched_urls: HashSet<String>,
    current_url: String,
}

/// A long-lived crawl unit bound to one domain
pub struct Scraper {
    name: String,
    scheme: String,
    domain: String,
    base_url: String,
    request_limit: Duration,
    extractor: Arc<dyn Extractable>,
    patterns: Vec<UrlPattern>,
    handler: Option<ScrapingHandler>,

    engine: OnceLock<Weak<EngineCore>>,
    weak_self: OnceLock<Weak<Scraper>>,
    state: AtomicU8,
    stop_flag: AtomicBool,
    done: Notify,
    pending_fetches: AtomicUsize,
    fetch_state: Mutex<FetchState>,
    tx_intake: mpsc::Sender<String>,
    rx_intake: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Scraper {
    /// Build a scraper anchored at `url`. Fails when the seed URL does not
    /// parse or carries no host.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        request_limit_ms: u64,
        extractor: Option<Arc<dyn Extractable>>,
    ) -> Result<Self> {
        let base_url = url.into();
        let parsed = url::Url::parse(&base_url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| CrawlkitError::ConfigError(format!("URL has no host: {}", base_url)))?;
        // The domain keeps any explicit port so root-relative rewrites land
        // on the same authority the seed named.
        let domain = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let extractor = extractor.unwrap_or_else(|| extractor_for(None));
        let (tx_intake, rx_intake) = mpsc::channel(INTAKE_CAPACITY);

        Ok(Self {
            name: name.into(),
            scheme: parsed.scheme().to_string(),
            domain,
            base_url,
            request_limit: Duration::from_millis(request_limit_ms),
            extractor,
            patterns: Vec::new(),
            handler: None,
            engine: OnceLock::new(),
            weak_self: OnceLock::new(),
            state: AtomicU8::new(ScraperState::Created as u8),
            stop_flag: AtomicBool::new(false),
            done: Notify::new(),
            pending_fetches: AtomicUsize::new(0),
            fetch_state: Mutex::new(FetchState::default()),
            tx_intake,
            rx_intake: Mutex::new(Some(rx_intake)),
        })
    }

    /// Register URL admission patterns. Call before the scraper starts.
    pub fn add_patterns(&mut self, patterns: impl IntoIterator<Item = UrlPattern>) -> &mut Self {
        self.patterns.extend(patterns);
        self
    }

    /// Attach a scraper-local handler. Call before the scraper starts.
    pub fn set_handler(&mut self, handler: ScrapingHandler) -> &mut Self {
        self.handler = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }

    /// The URL most recently dispatched for fetching
    pub fn current_url(&self) -> String {
        self.fetch_state
            .lock()
            .expect("fetch mutex poisoned")
            .current_url
            .clone()
    }

    pub fn state(&self) -> ScraperState {
        match self.state.load(Ordering::SeqCst) {
            0 => ScraperState::Created,
            1 => ScraperState::Running,
            2 => ScraperState::Stopping,
            _ => ScraperState::Stopped,
        }
    }

    pub(crate) fn handler(&self) -> Option<ScrapingHandler> {
        self.handler.clone()
    }

    pub(crate) fn bind(this: &Arc<Self>, core: &Arc<EngineCore>) {
        let _ = this.engine.set(Arc::downgrade(core));
        let _ = this.weak_self.set(Arc::downgrade(this));
    }

    fn core(&self) -> Option<Arc<EngineCore>> {
        self.engine.get().and_then(Weak::upgrade)
    }

    fn set_state(&self, state: ScraperState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// The token-bucket interval: `max(request_limit, 1) ms`
    pub(crate) fn tick_period(&self) -> Duration {
        if self.request_limit.is_zero() {
            DEFAULT_REQUEST_TICK
        } else {
            self.request_limit
        }
    }

    /// Apply the admission rules to an extracted URL: same-domain absolute
    /// URLs pass unchanged, root-relative paths are rewritten onto the
    /// scraper's scheme and domain, everything else is rejected.
    pub fn check_url(&self, source: &str) -> Option<String> {
        if source.contains(&self.domain) && source.starts_with("http") {
            Some(source.to_string())
        } else if source.starts_with('/') {
            Some(format!("{}://{}{}", self.scheme, self.domain, source))
        } else {
            None
        }
    }

    /// True when `url` passes this scraper's pattern list
    pub fn check_url_patterns(&self, url: &str) -> bool {
        check_url_patterns(&self.patterns, url)
    }

    /// Record `url` as fetched and make it current. Returns false when the
    /// URL was already fetched at some point in this scraper's lifetime.
    fn check_and_mark_fetched(&self, url: &str) -> bool {
        let mut state = self.fetch_state.lock().expect("fetch mutex poisoned");
        if state.fetched_urls.contains(url) {
            return false;
        }
        state.fetched_urls.insert(url.to_string());
        state.current_url = url.to_string();
        true
    }

    /// Number of URLs ever submitted for fetch
    pub fn fetched_count(&self) -> usize {
        self.fetch_state
            .lock()
            .expect("fetch mutex poisoned")
            .fetched_urls
            .len()
    }

    /// One-line summary for the control plane
    pub fn summary(&self, stats: &ScraperStats) -> String {
        format!(
            "<Scraper: {}>. Crawled: {}, successful: {}, failed: {}. Items scraped: {}, saved: {}",
            self.domain, stats.crawled, stats.successful, stats.failed, stats.scraped, stats.saved
        )
    }

    /// Request a graceful stop. Idempotent; the engine and the scraper's own
    /// predicates may both call this.
    pub fn stop(&self) {
        if self.stop_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ScraperState::Stopping);
        warn!("Stopping {}", self);

        if let (Some(core), Some(me)) = (
            self.core(),
            self.weak_self.get().and_then(Weak::upgrade),
        ) {
            notify_extensions(&core.extensions, ExtensionEvent::ScraperStopped(me));
        }
        self.done.notify_one();
    }

    /// The fetch loop. Runs as one task per scraper for the engine's
    /// lifetime; returning is what decrements the engine's wait counter.
    pub(crate) async fn run(self: Arc<Self>) {
        let Some(core) = self.core() else {
            return;
        };

        self.set_state(ScraperState::Running);
        info!("Starting: {}", self);
        notify_extensions(
            &core.extensions,
            ExtensionEvent::ScraperStarted(Arc::clone(&self)),
        );

        if self.tx_intake.send(self.base_url.clone()).await.is_err() {
            return;
        }

        let mut rx_intake = match self.rx_intake.lock().expect("intake mutex poisoned").take() {
            Some(rx) => rx,
            None => return,
        };

        let mut limiter = tokio::time::interval(self.tick_period());
        limiter.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.done.notified() => {
                    warn!("Stopped {}", self);
                    self.set_state(ScraperState::Stopped);
                    core.finished.fetch_add(1, Ordering::SeqCst);
                    let _ = core.tx_done.send(self.name.clone()).await;
                    return;
                }
                received = tokio::time::timeout(INTAKE_IDLE_TIMEOUT, rx_intake.recv()) => {
                    match received {
                        Ok(Some(url)) => {
                            // Only accepted URLs wait for the bucket; the done
                            // signal is never rate-limited.
                            limiter.tick().await;
                            let scraper = Arc::clone(&self);
                            self.pending_fetches.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                scraper.fetch(url).await;
                                scraper.pending_fetches.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Ok(None) => return,
                        Err(_) => {
                            let idle = self.pending_fetches.load(Ordering::SeqCst) == 0;
                            if idle && core.stats.get(&self.name).crawled > 0 {
                                info!("Intake drained for {}, stopping", self.name);
                                self.stop();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fetch one URL: dedup, middleware, execute, classify, publish, extract.
    /// May be launched as a fire-and-forget task.
    pub async fn fetch(&self, url: String) {
        if !self.check_and_mark_fetched(&url) {
            return;
        }
        let Some(core) = self.core() else {
            return;
        };

        info!("Fetching: {}", url);
        let started = Instant::now();
        let request_info = RequestInfo {
            method: "GET".to_string(),
            url: url.clone(),
        };

        match self.execute(&core, &url).await {
            Ok((final_url, body)) => {
                debug!("[200] Request to {} took: {:?}", url, started.elapsed());
                core.stats.update_request(
                    &self.name,
                    true,
                    request_info,
                    Some(ResponseInfo {
                        status: 200,
                        url: final_url.clone(),
                    }),
                );

                let item = ScrapedItem::new(url.clone(), final_url, self.name.clone(), body);
                let body = Arc::clone(&item.body);
                let _ = core.tx_scraped.send(item).await;
                self.run_extractor(&body).await;
            }
            Err(err) => {
                let response_info = match &err {
                    CrawlkitError::InvalidStatus(code) => Some(ResponseInfo {
                        status: *code,
                        url: url.clone(),
                    }),
                    _ => None,
                };
                core.stats
                    .update_request(&self.name, false, request_info, response_info);
                warn!("Failed to crawl {}", url);
                debug!("{}", err);
            }
        }

        if self.check_if_should_stop(&core) {
            self.stop();
        }
    }

    /// Build the request, run it through the middleware chain, execute it
    /// and buffer the body. Success means a 200 with a readable body.
    async fn execute(&self, core: &EngineCore, url: &str) -> Result<(String, Vec<u8>)> {
        let request = core.http.get(url).build()?;
        let request = prepare_request(&core.middleware, request);

        let response = core.http.execute(request).await?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(CrawlkitError::InvalidStatus(status.as_u16()));
        }

        let final_url = response.url().to_string();
        let body = response.bytes().await?;
        Ok((final_url, body.to_vec()))
    }

    /// Run the extractor over a fetched body and feed accepted URLs back
    /// into the intake. Extraction itself is synchronous; the sends happen
    /// afterwards so the callback never blocks.
    async fn run_extractor(&self, body: &[u8]) {
        let mut candidates = Vec::new();
        self.extractor.extract(body, &mut |href| {
            if let Some(resolved) = self.check_url(href) {
                if self.check_url_patterns(&resolved) {
                    candidates.push(resolved);
                }
            }
        });

        for url in candidates {
            if self.tx_intake.send(url).await.is_err() {
                break;
            }
        }
    }

    /// Stop predicates, evaluated after every fetch
    pub(crate) fn check_if_should_stop(&self, core: &EngineCore) -> bool {
        let stats = core.stats.get(&self.name);
        if stats.crawled == core.limit_crawl {
            warn!("Crawl limit exceeded: {}", self);
            true
        } else if stats.failed == core.limit_fail {
            warn!("Fail limit exceeded: {}", self);
            true
        } else if stats.failed == 1 && stats.crawled == 1 {
            warn!("Base URL is corrupted: {}", self);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, url: &str) -> Self {
        Self::new(name, url, 0, None).expect("test scraper")
    }
}

impl fmt::Display for Scraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Scraper: {} @ {}>", self.name, self.domain)
    }
}

impl fmt::Debug for Scraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scraper")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("base_url", &self.base_url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// The HTTP client every fetch goes through
pub(crate) fn new_http_client() -> Result<Client> {
    Ok(Client::builder()
        .timeout(TIMEOUT_REQUEST)
        .connect_timeout(TIMEOUT_CONNECT)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternKind;

    fn scraper() -> Scraper {
        Scraper::for_tests("news", "https://news.example.com/start")
    }

    #[test]
    fn test_rejects_unparseable_seed() {
        assert!(Scraper::new("bad", "::definitely not a url::", 0, None).is_err());
        assert!(Scraper::new("no-host", "mailto:user@example.com", 0, None).is_err());
    }

    #[test]
    fn test_check_url_accepts_same_domain_absolute() {
        let s = scraper();
        let url = "https://news.example.com/story/1";
        assert_eq!(s.check_url(url).as_deref(), Some(url));
    }

    #[test]
    fn test_check_url_accepts_seed_unchanged() {
        let s = scraper();
        assert_eq!(s.check_url(s.base_url()).as_deref(), Some(s.base_url()));
    }

    #[test]
    fn test_check_url_rewrites_root_relative() {
        let s = scraper();
        assert_eq!(
            s.check_url("/story/2").as_deref(),
            Some("https://news.example.com/story/2")
        );
    }

    #[test]
    fn test_domain_keeps_explicit_port() {
        let s = Scraper::for_tests("local", "http://127.0.0.1:8080/start");
        assert_eq!(s.domain(), "127.0.0.1:8080");
        assert_eq!(
            s.check_url("/a").as_deref(),
            Some("http://127.0.0.1:8080/a")
        );
        assert_eq!(
            s.check_url("http://127.0.0.1:8080/b").as_deref(),
            Some("http://127.0.0.1:8080/b")
        );
    }

    #[test]
    fn test_check_url_rejects_foreign_and_relative() {
        let s = scraper();
        assert!(s.check_url("https://other.example.org/").is_none());
        assert!(s.check_url("story/3").is_none());
        assert!(s.check_url("javascript:void(0)").is_none());
    }

    #[test]
    fn test_dedup_is_total() {
        let s = scraper();
        assert!(s.check_and_mark_fetched("https://news.example.com/a"));
        assert!(!s.check_and_mark_fetched("https://news.example.com/a"));
        assert_eq!(s.fetched_count(), 1);
        assert_eq!(s.current_url(), "https://news.example.com/a");
    }

    #[test]
    fn test_current_url_tracks_latest() {
        let s = scraper();
        s.check_and_mark_fetched("https://news.example.com/a");
        s.check_and_mark_fetched("https://news.example.com/b");
        assert_eq!(s.current_url(), "https://news.example.com/b");
        assert_eq!(s.fetched_count(), 2);
    }

    #[test]
    fn test_zero_request_limit_uses_default_tick() {
        let s = Scraper::new("fast", "https://a.example/", 0, None).unwrap();
        assert_eq!(s.tick_period(), DEFAULT_REQUEST_TICK);

        let s = Scraper::new("slow", "https://a.example/", 250, None).unwrap();
        assert_eq!(s.tick_period(), Duration::from_millis(250));
    }

    #[test]
    fn test_empty_patterns_accept_everything() {
        let s = scraper();
        assert!(s.check_url_patterns("https://news.example.com/anything"));
    }

    #[test]
    fn test_patterns_filter_extracted_urls() {
        let mut s = scraper();
        s.add_patterns([UrlPattern::new(PatternKind::Contains, "/story/").unwrap()]);
        assert!(s.check_url_patterns("https://news.example.com/story/9"));
        assert!(!s.check_url_patterns("https://news.example.com/about"));
    }

    #[test]
    fn test_initial_state_is_created() {
        let s = scraper();
        assert_eq!(s.state(), ScraperState::Created);
        assert_eq!(s.current_url(), "");
    }

    #[test]
    fn test_summary_format() {
        let s = scraper();
        let stats = ScraperStats {
            crawled: 3,
            successful: 2,
            failed: 1,
            scraped: 5,
            saved: 4,
        };
        assert_eq!(
            s.summary(&stats),
            "<Scraper: news.example.com>. Crawled: 3, successful: 2, failed: 1. Items scraped: 5, saved: 4"
        );
    }
}
