//! Engine event extensions
//!
//! Extensions observe scraper lifecycle and item events. Every event is
//! dispatched on a detached task so a slow observer never stalls the engine;
//! within that task extensions run sequentially in registration order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::dao::RedisDao;
use crate::item::Item;
use crate::scraper::Scraper;
use crate::stats::StatsRegistry;

/// Observer for engine events
#[async_trait]
pub trait Extension: Send + Sync {
    /// Name reported by the control plane's EXTENSIONS command
    fn name(&self) -> &'static str;

    async fn scraper_started(&self, _scraper: &Scraper) {}

    async fn scraper_stopped(&self, _scraper: &Scraper) {}

    async fn item_scraped(&self, _scraper: &Scraper, _item: &Item) {}
}

/// An event carried onto the detached dispatch task
pub(crate) enum ExtensionEvent {
    ScraperStarted(Arc<Scraper>),
    ScraperStopped(Arc<Scraper>),
    ItemScraped(Arc<Scraper>, Item),
}

/// Fan an event out to all extensions off the engine's critical path
pub(crate) fn notify_extensions(
    extensions: &Arc<Vec<Arc<dyn Extension>>>,
    event: ExtensionEvent,
) {
    if extensions.is_empty() {
        return;
    }

    let extensions = Arc::clone(extensions);
    tokio::spawn(async move {
        for extension in extensions.iter() {
            match &event {
                ExtensionEvent::ScraperStarted(scraper) => {
                    extension.scraper_started(scraper).await;
                }
                ExtensionEvent::ScraperStopped(scraper) => {
                    extension.scraper_stopped(scraper).await;
                }
                ExtensionEvent::ItemScraped(scraper, item) => {
                    extension.item_scraped(scraper, item).await;
                }
            }
        }
    });
}

/// Persists every validated item to Redis through the DAO and counts it as
/// saved. The scrape loop only counts items it writes through its own record
/// writer, so each persistence path tallies its own attempts.
pub struct SaveToRedis {
    dao: RedisDao,
    stats: Arc<StatsRegistry>,
}

impl SaveToRedis {
    pub fn new(dao: RedisDao, stats: Arc<StatsRegistry>) -> Self {
        Self { dao, stats }
    }
}

#[async_trait]
impl Extension for SaveToRedis {
    fn name(&self) -> &'static str {
        "SaveToRedis"
    }

    async fn item_scraped(&self, scraper: &Scraper, item: &Item) {
        if !item.validate() {
            return;
        }

        // Counts persistence attempts after validation; a write failure is
        // logged, not retried.
        self.stats.incr_saved(scraper.name());

        match item.record_bytes() {
            Ok(bytes) => {
                if let Err(err) = self.dao.write(scraper.name(), bytes).await {
                    warn!("Failed to persist item to Redis: {}", err);
                }
            }
            Err(err) => warn!("Failed to serialize item record: {}", err),
        }
    }
}

/// Logs every item's record in string form
pub struct Display;

#[async_trait]
impl Extension for Display {
    fn name(&self) -> &'static str {
        "Display"
    }

    async fn item_scraped(&self, scraper: &Scraper, item: &Item) {
        info!(
            "Item from {}: {}",
            scraper.name(),
            item.record_fields().join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::item::SaveableItem;

    struct Counting {
        started: AtomicUsize,
        stopped: AtomicUsize,
        items: AtomicUsize,
    }

    #[async_trait]
    impl Extension for Counting {
        fn name(&self) -> &'static str {
            "Counting"
        }

        async fn scraper_started(&self, _scraper: &Scraper) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn scraper_stopped(&self, _scraper: &Scraper) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        async fn item_scraped(&self, _scraper: &Scraper, _item: &Item) {
            self.items.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestItem;

    impl SaveableItem for TestItem {
        fn scraper_name(&self) -> &str {
            "s"
        }

        fn validate(&self) -> bool {
            true
        }

        fn record_fields(&self) -> Vec<String> {
            vec!["f".to_string()]
        }
    }

    struct InvalidItem;

    impl SaveableItem for InvalidItem {
        fn scraper_name(&self) -> &str {
            "s"
        }

        fn validate(&self) -> bool {
            false
        }

        fn record_fields(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_events_reach_every_hook() {
        let counting = Arc::new(Counting {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            items: AtomicUsize::new(0),
        });
        let extensions: Arc<Vec<Arc<dyn Extension>>> = Arc::new(vec![counting.clone()]);
        let scraper = Arc::new(Scraper::for_tests("s", "http://s.example/"));

        notify_extensions(&extensions, ExtensionEvent::ScraperStarted(scraper.clone()));
        notify_extensions(&extensions, ExtensionEvent::ScraperStopped(scraper.clone()));
        notify_extensions(
            &extensions,
            ExtensionEvent::ItemScraped(scraper, Arc::new(TestItem)),
        );

        // Dispatch is detached; give the spawned tasks a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counting.started.load(Ordering::SeqCst), 1);
        assert_eq!(counting.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(counting.items.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_save_to_redis_counts_validated_items() {
        // Nothing listens on this address; the write fails but the attempt
        // still counts.
        let dao = RedisDao::new("127.0.0.1:1").unwrap();
        let stats = Arc::new(StatsRegistry::new());
        let extension = SaveToRedis::new(dao, Arc::clone(&stats));
        let scraper = Arc::new(Scraper::for_tests("s", "http://s.example/"));

        let item: Item = Arc::new(TestItem);
        extension.item_scraped(&scraper, &item).await;
        assert_eq!(stats.get("s").saved, 1);

        let invalid: Item = Arc::new(InvalidItem);
        extension.item_scraped(&scraper, &invalid).await;
        assert_eq!(stats.get("s").saved, 1);
    }
}
