//! Minimal embedder: load a config file, wire a handler and crawl.
//!
//! ```sh
//! cargo run --example run
//! ```

use std::sync::Arc;

use crawlkit::{
    random_user_agent, strip_accept_encoding, Engine, ItemSender, SaveableItem, ScrapedItem,
    ScraperConfig,
};

/// One page title per crawled page
struct PageTitle {
    scraper: String,
    url: String,
    title: String,
}

impl SaveableItem for PageTitle {
    fn scraper_name(&self) -> &str {
        &self.scraper
    }

    fn validate(&self) -> bool {
        !self.title.is_empty()
    }

    fn record_fields(&self) -> Vec<String> {
        vec![self.url.clone(), self.title.clone()]
    }

    fn record_bytes(&self) -> crawlkit::Result<Vec<u8>> {
        let value = serde_json::json!({ "url": self.url, "title": self.title });
        Ok(serde_json::to_vec(&value)?)
    }
}

fn handle_page(page: &ScrapedItem, items: &ItemSender) {
    let document = page.document();
    let selector = scraper::Selector::parse("title").expect("static selector");

    let title = document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    println!("{} --> {}", page.url, title);
    items.send(PageTitle {
        scraper: page.scraper_name.clone(),
        url: page.url.clone(),
        title,
    });
}

#[tokio::main]
async fn main() -> crawlkit::Result<()> {
    crawlkit::init_logging();

    let config = ScraperConfig::from_file("demos/config.yaml")?;
    let mut engine = Engine::from_config(config);
    engine
        .use_middleware(strip_accept_encoding())
        .use_middleware(random_user_agent())
        .set_handler(Arc::new(handle_page));

    engine.start().await
}
