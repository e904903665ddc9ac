//! Scraped pages and user-defined saveable items

use std::fmt;
use std::sync::Arc;

use scraper::Html;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;

/// One successfully fetched page, handed to handlers by the engine
#[derive(Debug, Clone)]
pub struct ScrapedItem {
    /// The URL as it was dispatched
    pub url: String,
    /// The URL after redirects; equals `url` when none occurred
    pub final_url: String,
    /// Name of the scraper that fetched the page
    pub scraper_name: String,
    /// Buffered body bytes, re-readable by every handler
    pub body: Arc<Vec<u8>>,
}

impl ScrapedItem {
    pub fn new(
        url: impl Into<String>,
        final_url: impl Into<String>,
        scraper_name: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            url: url.into(),
            final_url: final_url.into(),
            scraper_name: scraper_name.into(),
            body: Arc::new(body),
        }
    }

    /// True when the fetch was redirected away from the original URL
    pub fn redirected(&self) -> bool {
        self.url != self.final_url
    }

    /// The body decoded as text, lossily
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the buffered body as an HTML document
    pub fn document(&self) -> Html {
        Html::parse_document(&self.text())
    }
}

impl fmt::Display for ScrapedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Result of scraping: {}", self.url)
    }
}

/// A handler-produced record destined for the sink.
///
/// Implementors hold whatever page data they extracted plus the name of the
/// scraper the page came from (usually copied from the [`ScrapedItem`]).
pub trait SaveableItem: Send + Sync {
    /// Name of the scraper this item belongs to
    fn scraper_name(&self) -> &str;

    /// Whether the item should be persisted at all
    fn validate(&self) -> bool;

    /// The item as a row of fields, for record writers like the CSV sink
    fn record_fields(&self) -> Vec<String>;

    /// The item as opaque bytes, for the Redis DAO. The default serializes
    /// the field row as JSON; implementors that want the control plane to
    /// decode their items should override this with a JSON object.
    fn record_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.record_fields())?)
    }
}

/// Shared handle to a saveable item as it travels the items channel
pub type Item = Arc<dyn SaveableItem>;

/// Send-only handle handed to handlers for emitting items
#[derive(Clone)]
pub struct ItemSender {
    tx: mpsc::Sender<Item>,
}

impl ItemSender {
    pub(crate) fn new(tx: mpsc::Sender<Item>) -> Self {
        Self { tx }
    }

    /// Queue an item for validation and persistence. Handlers run on the
    /// scrape loop, so this never blocks; if the items channel is full the
    /// item is dropped with a warning.
    pub fn send(&self, item: impl SaveableItem + 'static) {
        if let Err(err) = self.tx.try_send(Arc::new(item)) {
            warn!("Dropping item, channel unavailable: {}", err);
        }
    }
}

/// A callback invoked for every scraped page; emits items via the sender
pub type ScrapingHandler = Arc<dyn Fn(&ScrapedItem, &ItemSender) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    struct TestItem {
        scraper: String,
        fields: Vec<String>,
        valid: bool,
    }

    impl SaveableItem for TestItem {
        fn scraper_name(&self) -> &str {
            &self.scraper
        }

        fn validate(&self) -> bool {
            self.valid
        }

        fn record_fields(&self) -> Vec<String> {
            self.fields.clone()
        }
    }

    #[test]
    fn test_redirect_detection() {
        let direct = ScrapedItem::new("http://a/", "http://a/", "s", Vec::new());
        assert!(!direct.redirected());

        let moved = ScrapedItem::new("http://a/", "http://a/landing", "s", Vec::new());
        assert!(moved.redirected());
    }

    #[test]
    fn test_document_parses_buffered_body() {
        let item = ScrapedItem::new(
            "http://a/",
            "http://a/",
            "s",
            b"<html><title>hi</title></html>".to_vec(),
        );
        let document = item.document();
        let selector = scraper::Selector::parse("title").unwrap();
        let title: String = document.select(&selector).next().unwrap().text().collect();
        assert_eq!(title, "hi");
    }

    #[test]
    fn test_default_record_bytes_is_json() {
        let item = TestItem {
            scraper: "s".into(),
            fields: vec!["a".into(), "b".into()],
            valid: true,
        };
        let bytes = item.record_bytes().unwrap();
        let decoded: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_item_sender_delivers() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = ItemSender::new(tx);
        sender.send(TestItem {
            scraper: "s".into(),
            fields: vec!["x".into()],
            valid: true,
        });

        let item = rx.recv().await.unwrap();
        assert_eq!(item.scraper_name(), "s");
        assert_eq!(item.record_fields(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_item_sender_drops_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = ItemSender::new(tx);
        for _ in 0..3 {
            sender.send(TestItem {
                scraper: "s".into(),
                fields: Vec::new(),
                valid: true,
            });
        }
        // No panic, no deadlock; overflow is dropped.
    }
}
