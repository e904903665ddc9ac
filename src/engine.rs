//! The crawl engine
//!
//! The engine owns the scrapers, the scrape loop that fans pages into
//! handlers and items into sinks, the control-plane servers and the graceful
//! shutdown path. Configuration happens while the engine is INITIAL; the
//! scraper, middleware and extension lists freeze when `start` runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::ScraperConfig;
use crate::dao::RedisDao;
use crate::error::Result;
use crate::extensions::{notify_extensions, Extension, ExtensionEvent, SaveToRedis};
use crate::extract::extractor_for;
use crate::item::{Item, ItemSender, ScrapedItem, ScrapingHandler};
use crate::middleware::Middleware;
use crate::patterns::UrlPattern;
use crate::scraper::{new_http_client, Scraper};
use crate::sink::{save_item, CsvSink, RecordWriter};
use crate::stats::StatsRegistry;
use crate::{apiserver, server};

pub(crate) const LIMIT_CRAWL: u64 = 10_000;
pub(crate) const LIMIT_FAIL: u64 = 500;
pub(crate) const SCRAPED_CAPACITY: usize = 100;
pub(crate) const ITEMS_CAPACITY: usize = 250;

/// Engine lifecycle; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Initial = 0,
    Running = 1,
    Stopping = 2,
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(EngineState::Initial as u8))
    }

    pub(crate) fn get(&self) -> EngineState {
        match self.0.load(Ordering::SeqCst) {
            0 => EngineState::Initial,
            1 => EngineState::Running,
            _ => EngineState::Stopping,
        }
    }

    /// Advance to `state`; moving backwards is ignored
    pub(crate) fn advance(&self, state: EngineState) {
        self.0.fetch_max(state as u8, Ordering::SeqCst);
    }
}

/// Shared engine internals handed to scrapers (weakly) and to the control
/// plane (strongly) for the duration of a run.
pub(crate) struct EngineCore {
    pub(crate) config: ScraperConfig,
    pub(crate) limit_crawl: u64,
    pub(crate) limit_fail: u64,
    pub(crate) scrapers: Vec<Arc<Scraper>>,
    pub(crate) extensions: Arc<Vec<Arc<dyn Extension>>>,
    pub(crate) middleware: Vec<Middleware>,
    pub(crate) global_handler: Option<ScrapingHandler>,
    pub(crate) stats: Arc<StatsRegistry>,
    pub(crate) http: Client,
    pub(crate) dao: Option<RedisDao>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) tx_scraped: mpsc::Sender<ScrapedItem>,
    pub(crate) tx_items: mpsc::Sender<Item>,
    pub(crate) tx_done: mpsc::Sender<String>,
    pub(crate) finished: AtomicUsize,
    pub(crate) stop_requested: Notify,
}

impl EngineCore {
    pub(crate) fn get_scraper(&self, name: &str) -> Option<Arc<Scraper>> {
        self.scrapers
            .iter()
            .find(|scraper| scraper.name() == name)
            .cloned()
    }

    pub(crate) fn has_scraper(&self, name: &str) -> bool {
        self.get_scraper(name).is_some()
    }

    /// Ask the engine to stop. Safe to call from any task, any number of
    /// times; the first call wins.
    pub(crate) fn request_stop(&self) {
        self.state.advance(EngineState::Stopping);
        self.stop_requested.notify_one();
    }

    /// A core with dummy channels, enough to exercise read-only consumers
    /// like the control plane.
    #[cfg(test)]
    pub(crate) fn for_tests(
        config: ScraperConfig,
        scrapers: Vec<Arc<Scraper>>,
        extensions: Vec<Arc<dyn Extension>>,
        middleware: Vec<Middleware>,
    ) -> Arc<EngineCore> {
        let (tx_scraped, _) = mpsc::channel(SCRAPED_CAPACITY);
        let (tx_items, _) = mpsc::channel(ITEMS_CAPACITY);
        let (tx_done, _) = mpsc::channel(1);

        let stats = Arc::new(StatsRegistry::new());
        for scraper in &scrapers {
            stats.register(scraper.name());
        }

        Arc::new(EngineCore {
            config,
            limit_crawl: LIMIT_CRAWL,
            limit_fail: LIMIT_FAIL,
            scrapers,
            extensions: Arc::new(extensions),
            middleware,
            global_handler: None,
            stats,
            http: new_http_client().expect("test client"),
            dao: None,
            state: Arc::new(StateCell::new()),
            tx_scraped,
            tx_items,
            tx_done,
            finished: AtomicUsize::new(0),
            stop_requested: Notify::new(),
        })
    }
}

/// The process-wide crawl orchestrator
pub struct Engine {
    config: ScraperConfig,
    limit_crawl: u64,
    limit_fail: u64,
    scrapers: Vec<Arc<Scraper>>,
    extensions: Vec<Arc<dyn Extension>>,
    middleware: Vec<Middleware>,
    global_handler: Option<ScrapingHandler>,
    stats: Arc<StatsRegistry>,
    state: Arc<StateCell>,
    core: Option<Arc<EngineCore>>,
}

impl Engine {
    /// A fresh engine in INITIAL state with default limits
    pub fn new() -> Self {
        Self {
            config: ScraperConfig::default(),
            limit_crawl: LIMIT_CRAWL,
            limit_fail: LIMIT_FAIL,
            scrapers: Vec::new(),
            extensions: Vec::new(),
            middleware: Vec::new(),
            global_handler: None,
            stats: Arc::new(StatsRegistry::new()),
            state: Arc::new(StateCell::new()),
            core: None,
        }
    }

    /// Build an engine from a parsed configuration: scrapers (unparseable
    /// seed URLs are logged and skipped), their patterns, control addresses
    /// and sinks. A configured Redis address auto-registers the SaveToRedis
    /// extension.
    pub fn from_config(config: ScraperConfig) -> Self {
        let mut engine = Engine::new();

        for entry in &config.scrapers {
            let extractor = extractor_for(entry.extractor.as_deref());
            let mut scraper =
                match Scraper::new(&entry.name, &entry.url, entry.request_limit, Some(extractor)) {
                    Ok(scraper) => scraper,
                    Err(err) => {
                        warn!("Skipping scraper '{}': {}", entry.name, err);
                        continue;
                    }
                };

            let mut patterns = Vec::new();
            for pattern_entry in &entry.patterns {
                match UrlPattern::from_entry(pattern_entry) {
                    Ok(pattern) => patterns.push(pattern),
                    Err(err) => warn!("Skipping pattern for '{}': {}", entry.name, err),
                }
            }
            scraper.add_patterns(patterns);
            debug!(
                "Defined the following URL patterns for '{}': {:?}",
                entry.name,
                scraper
                    .patterns()
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
            );

            engine.add_scrapers([scraper]);
        }

        if let Some(address) = &config.redis_address {
            match RedisDao::new(address) {
                Ok(dao) => {
                    let stats = Arc::clone(&engine.stats);
                    engine.use_extension(SaveToRedis::new(dao, stats));
                }
                Err(err) => warn!("Redis sink unavailable: {}", err),
            }
        }

        engine.config = config;
        engine
    }

    /// Attach scrapers. Each one gets a stats slot and, once the engine
    /// starts, a weak back-reference to the engine core.
    pub fn add_scrapers(&mut self, scrapers: impl IntoIterator<Item = Scraper>) -> &mut Self {
        for scraper in scrapers {
            self.stats.register(scraper.name());
            debug!("Attached new scraper {}", scraper);
            self.scrapers.push(Arc::new(scraper));
        }
        self
    }

    /// Append request middleware, applied in registration order
    pub fn use_middleware(&mut self, middleware: Middleware) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Append an extension
    pub fn use_extension(&mut self, extension: impl Extension + 'static) -> &mut Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Set the global handler, invoked for every scraped page before the
    /// scraper-local handler
    pub fn set_handler(&mut self, handler: ScrapingHandler) -> &mut Self {
        self.global_handler = Some(handler);
        self
    }

    pub fn get_scraper(&self, name: &str) -> Option<Arc<Scraper>> {
        self.scrapers
            .iter()
            .find(|scraper| scraper.name() == name)
            .cloned()
    }

    pub fn has_scraper(&self, name: &str) -> bool {
        self.get_scraper(name).is_some()
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Handle to the stats registry; stays valid across `start`
    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    /// Initiate graceful shutdown. A no-op before `start`.
    pub fn stop(&self) {
        if let Some(core) = &self.core {
            core.request_stop();
        }
    }

    /// Run the engine: spawn every scraper, the scrape loop and the control
    /// plane, then block until all scrapers are finished or a termination
    /// signal arrives.
    pub async fn start(&mut self) -> Result<()> {
        if self.scrapers.is_empty() {
            warn!("No scrapers have been registered. Exiting...");
            return Ok(());
        }

        info!("Starting engine");
        self.state.advance(EngineState::Running);

        let total = self.scrapers.len();
        let (tx_scraped, rx_scraped) = mpsc::channel(SCRAPED_CAPACITY);
        let (tx_items, rx_items) = mpsc::channel(ITEMS_CAPACITY);
        let (tx_done, mut rx_done) = mpsc::channel(total);

        let dao = match &self.config.redis_address {
            Some(address) => match RedisDao::new(address) {
                Ok(dao) => Some(dao),
                Err(err) => {
                    warn!("Redis DAO unavailable: {}", err);
                    None
                }
            },
            None => None,
        };

        let core = Arc::new(EngineCore {
            config: self.config.clone(),
            limit_crawl: self.limit_crawl,
            limit_fail: self.limit_fail,
            scrapers: self.scrapers.clone(),
            extensions: Arc::new(self.extensions.clone()),
            middleware: self.middleware.clone(),
            global_handler: self.global_handler.clone(),
            stats: Arc::clone(&self.stats),
            http: new_http_client()?,
            dao,
            state: Arc::clone(&self.state),
            tx_scraped,
            tx_items,
            tx_done,
            finished: AtomicUsize::new(0),
            stop_requested: Notify::new(),
        });
        self.core = Some(Arc::clone(&core));

        for scraper in &self.scrapers {
            Scraper::bind(scraper, &core);
        }

        let mut scraper_handles = Vec::with_capacity(total);
        for scraper in &self.scrapers {
            scraper_handles.push(tokio::spawn(Arc::clone(scraper).run()));
        }

        let mut control_handles = Vec::new();
        if let Some(address) = core.config.tcp_address.clone() {
            control_handles.push(tokio::spawn(server::serve(address, Arc::clone(&core))));
        }
        if let Some(address) = core.config.http_address.clone() {
            control_handles.push(tokio::spawn(apiserver::serve(address, Arc::clone(&core))));
        }

        // The CSV sink opens (and truncates) at engine start.
        let writer: Option<Box<dyn RecordWriter>> = match &core.config.out_file_name {
            Some(name) => match CsvSink::open(name) {
                Ok(Some(sink)) => Some(Box::new(sink)),
                Ok(None) => None,
                Err(err) => {
                    warn!("Cannot open output file {}: {}", name, err);
                    None
                }
            },
            None => None,
        };

        let loop_shutdown = Arc::new(Notify::new());
        let loop_handle = tokio::spawn(scrape_loop(
            Arc::clone(&core),
            rx_scraped,
            rx_items,
            writer,
            Arc::clone(&loop_shutdown),
        ));

        let mut signal = std::pin::pin!(shutdown_signal());
        let mut stopping = false;

        while core.finished.load(Ordering::SeqCst) < total {
            tokio::select! {
                received = rx_done.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
                _ = &mut signal, if !stopping => {
                    warn!("Got termination signal. Gracefully stopping...");
                    stopping = true;
                    self.stop_scrapers(&core);
                }
                _ = core.stop_requested.notified(), if !stopping => {
                    stopping = true;
                    self.stop_scrapers(&core);
                }
            }
        }

        // Wait counter: every scraper task must have returned.
        for handle in scraper_handles {
            let _ = handle.await;
        }

        // Drain the scrape loop, flush the sink, then tear down the control plane.
        loop_shutdown.notify_one();
        let _ = loop_handle.await;
        for handle in control_handles {
            handle.abort();
        }

        warn!("All scrapers have stopped. Exiting...");
        Ok(())
    }

    fn stop_scrapers(&self, core: &Arc<EngineCore>) {
        core.state.advance(EngineState::Stopping);
        info!("Stopping engine");
        for scraper in &core.scrapers {
            scraper.stop();
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when the process receives an interrupt or terminate signal
async fn shutdown_signal() {
    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

/// The engine's single consumer of scraped pages and produced items
async fn scrape_loop(
    core: Arc<EngineCore>,
    mut rx_scraped: mpsc::Receiver<ScrapedItem>,
    mut rx_items: mpsc::Receiver<Item>,
    mut writer: Option<Box<dyn RecordWriter>>,
    shutdown: Arc<Notify>,
) {
    info!("Starting scrape loop");
    let item_sender = ItemSender::new(core.tx_items.clone());

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            received = rx_scraped.recv() => match received {
                Some(page) => handle_scraped(&core, &item_sender, &page),
                None => break,
            },
            received = rx_items.recv() => match received {
                Some(item) => match &mut writer {
                    Some(w) => process_item(&core, item, Some(w.as_mut())),
                    None => process_item(&core, item, None),
                },
                None => break,
            },
        }
    }

    // Shutdown drain: whatever the scrapers managed to publish still gets
    // handled before the sink closes.
    while let Ok(page) = rx_scraped.try_recv() {
        handle_scraped(&core, &item_sender, &page);
    }
    while let Ok(item) = rx_items.try_recv() {
        match &mut writer {
            Some(w) => process_item(&core, item, Some(w.as_mut())),
            None => process_item(&core, item, None),
        }
    }

    if let Some(writer) = writer.as_mut() {
        let _ = writer.flush();
    }
    info!("Scrape loop finished");
}

/// Dispatch one scraped page: global handler first, then the scraper's own
fn handle_scraped(core: &EngineCore, sender: &ItemSender, page: &ScrapedItem) {
    if let Some(handler) = &core.global_handler {
        invoke_handler(handler, page, sender);
    }
    if let Some(handler) = core
        .get_scraper(&page.scraper_name)
        .and_then(|scraper| scraper.handler())
    {
        invoke_handler(&handler, page, sender);
    }
}

/// Handlers are user code; a panic is confined here and the loop moves on
fn invoke_handler(handler: &ScrapingHandler, page: &ScrapedItem, sender: &ItemSender) {
    if catch_unwind(AssertUnwindSafe(|| handler(page, sender))).is_err() {
        warn!("Recovered HANDLER");
    }
}

/// Account for one handler-produced item, notify extensions off the loop,
/// then validate and persist it
fn process_item(core: &EngineCore, item: Item, writer: Option<&mut dyn RecordWriter>) {
    core.stats.incr_scraped(item.scraper_name());

    if let Some(scraper) = core.get_scraper(item.scraper_name()) {
        notify_extensions(
            &core.extensions,
            ExtensionEvent::ItemScraped(scraper, Arc::clone(&item)),
        );
    }

    save_item(item.as_ref(), writer, &core.stats);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scraper(name: &str) -> Scraper {
        Scraper::new(name, format!("https://{}.example.com/", name), 0, None).unwrap()
    }

    #[test]
    fn test_new_engine_defaults() {
        let engine = Engine::new();
        assert_eq!(engine.state(), EngineState::Initial);
        assert_eq!(engine.limit_crawl, LIMIT_CRAWL);
        assert_eq!(engine.limit_fail, LIMIT_FAIL);
        assert!(engine.scrapers.is_empty());
    }

    #[test]
    fn test_get_and_has_scraper() {
        let mut engine = Engine::new();
        engine.add_scrapers([scraper("a"), scraper("b")]);

        assert!(engine.has_scraper("a"));
        assert!(engine.has_scraper("b"));
        assert!(!engine.has_scraper("c"));
        assert_eq!(engine.get_scraper("a").unwrap().name(), "a");
        assert!(engine.get_scraper("c").is_none());
    }

    #[test]
    fn test_from_config_skips_bad_seed() {
        let config: ScraperConfig = serde_yaml::from_str(
            r#"
project: p
scrapers:
  - { name: good, url: "https://good.example/", requestLimit: 1 }
  - { name: bad, url: "not a url at all", requestLimit: 1 }
"#,
        )
        .unwrap();

        let engine = Engine::from_config(config);
        assert!(engine.has_scraper("good"));
        assert!(!engine.has_scraper("bad"));
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let cell = StateCell::new();
        cell.advance(EngineState::Running);
        assert_eq!(cell.get(), EngineState::Running);
        cell.advance(EngineState::Stopping);
        assert_eq!(cell.get(), EngineState::Stopping);
        // Backwards transitions are ignored.
        cell.advance(EngineState::Running);
        assert_eq!(cell.get(), EngineState::Stopping);
    }

    #[tokio::test]
    async fn test_start_with_no_scrapers_returns_immediately() {
        let mut engine = Engine::new();
        tokio::time::timeout(std::time::Duration::from_secs(1), engine.start())
            .await
            .expect("start should return at once")
            .unwrap();
        assert_eq!(engine.state(), EngineState::Initial);
    }

    #[test]
    fn test_registration_lists_grow_in_order() {
        let mut engine = Engine::new();
        engine
            .use_middleware(crate::middleware::strip_accept_encoding())
            .use_middleware(crate::middleware::random_user_agent());
        engine.use_extension(crate::extensions::Display);

        assert_eq!(engine.middleware.len(), 2);
        assert_eq!(engine.middleware[0].name(), "strip_accept_encoding");
        assert_eq!(engine.middleware[1].name(), "random_user_agent");
        assert_eq!(engine.extensions.len(), 1);
    }
}
