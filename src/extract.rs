//! Link extraction from fetched page bodies
//!
//! An [`Extractable`] consumes a buffered response body and emits candidate
//! URLs through a callback. Resolving relative URLs against the scraper's
//! domain is not done here; the scraper owns that decision.

use std::sync::Arc;

use scraper::{Html, Selector};
use tracing::warn;

/// Capability for turning a page body into candidate URLs
pub trait Extractable: Send + Sync {
    /// Invoke `emit` once per candidate href found in `body`. Parse errors
    /// end extraction silently; whatever was emitted so far stands.
    fn extract(&self, body: &[u8], emit: &mut dyn FnMut(&str));
}

/// Extracts the `href` of every anchor tag, with `#fragment` suffixes trimmed
#[derive(Debug, Clone)]
pub struct LinkExtractor {
    anchors: Selector,
}

impl LinkExtractor {
    pub fn new() -> Self {
        let anchors = Selector::parse("a[href]").expect("static selector");
        Self { anchors }
    }
}

impl Default for LinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractable for LinkExtractor {
    fn extract(&self, body: &[u8], emit: &mut dyn FnMut(&str)) {
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);

        for element in document.select(&self.anchors) {
            if let Some(href) = element.value().attr("href") {
                let href = href.split('#').next().unwrap_or("");
                if !href.is_empty() {
                    emit(href);
                }
            }
        }
    }
}

/// Resolve an extractor by its config name. "link" is the canonical name;
/// unknown names fall back to the link extractor with a warning.
pub fn extractor_for(name: Option<&str>) -> Arc<dyn Extractable> {
    match name {
        Some("link") | None => Arc::new(LinkExtractor::new()),
        Some(other) => {
            warn!("Unknown extractor '{}', switching to default", other);
            Arc::new(LinkExtractor::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_all(body: &str) -> Vec<String> {
        let extractor = LinkExtractor::new();
        let mut found = Vec::new();
        extractor.extract(body.as_bytes(), &mut |href| found.push(href.to_string()));
        found
    }

    #[test]
    fn test_extracts_anchor_hrefs() {
        let links = extract_all(
            r#"<html><body>
                <a href="/a">first</a>
                <a href="https://example.com/b">second</a>
                <img src="/logo.png">
            </body></html>"#,
        );
        assert_eq!(links, vec!["/a", "https://example.com/b"]);
    }

    #[test]
    fn test_trims_fragment() {
        let links = extract_all(r#"<a href="/page#section-2">x</a>"#);
        assert_eq!(links, vec!["/page"]);
    }

    #[test]
    fn test_fragment_only_href_is_dropped() {
        let links = extract_all(r##"<a href="#top">x</a>"##);
        assert!(links.is_empty());
    }

    #[test]
    fn test_anchor_without_href_is_skipped() {
        let links = extract_all(r#"<a name="anchor">x</a><a href="/y">y</a>"#);
        assert_eq!(links, vec!["/y"]);
    }

    #[test]
    fn test_malformed_html_keeps_partial_results() {
        // The parser is lossy; truncated markup still yields what it saw.
        let links = extract_all(r#"<a href="/kept">x</a><div><a href="/also"#);
        assert!(links.contains(&"/kept".to_string()));
    }

    #[test]
    fn test_registry_falls_back_to_link() {
        let extractor = extractor_for(Some("no-such-extractor"));
        let mut found = Vec::new();
        extractor.extract(br#"<a href="/z">z</a>"#, &mut |href| {
            found.push(href.to_string())
        });
        assert_eq!(found, vec!["/z"]);
    }
}
