//! crawlkit - a concurrent multi-site web-crawling engine
//!
//! crawlkit drives a set of named scrapers, each anchored at a seed URL and
//! restricted to its own domain. Every fetched page is handed to
//! user-supplied handlers which extract items; validated items are persisted
//! through a CSV or Redis sink. While a crawl runs, a TCP command server and
//! HTTP JSON endpoints expose live stats and a stop switch.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crawlkit::{Engine, ItemSender, ScrapedItem, ScraperConfig};
//!
//! #[tokio::main]
//! async fn main() -> crawlkit::Result<()> {
//!     let config = ScraperConfig::from_file("config.yaml")?;
//!     let mut engine = Engine::from_config(config);
//!     engine.set_handler(Arc::new(|page: &ScrapedItem, _items: &ItemSender| {
//!         println!("scraped {}", page.url);
//!     }));
//!     engine.start().await
//! }
//! ```

pub mod apiserver;
pub mod config;
pub mod dao;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod extract;
pub mod item;
pub mod middleware;
pub mod patterns;
pub mod scraper;
pub mod server;
pub mod sink;
pub mod stats;

pub use config::{PatternKind, ScraperConfig, ScraperEntry};
pub use dao::RedisDao;
pub use engine::{Engine, EngineState};
pub use error::{CrawlkitError, Result};
pub use extensions::{Display, Extension, SaveToRedis};
pub use extract::{extractor_for, Extractable, LinkExtractor};
pub use item::{ItemSender, SaveableItem, ScrapedItem, ScrapingHandler};
pub use middleware::{random_user_agent, strip_accept_encoding, Middleware};
pub use patterns::UrlPattern;
pub use scraper::{Scraper, ScraperState};
pub use sink::{CsvSink, RecordWriter};
pub use stats::{ScraperStats, StatsRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a process-wide tracing subscriber honoring `RUST_LOG`.
/// Call once at startup; tests may install their own subscriber instead.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
