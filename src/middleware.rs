//! Outbound request middleware
//!
//! A middleware is a named, pure transformation applied to every request
//! before it leaves the engine, in registration order.

use std::sync::Arc;

use rand::seq::SliceRandom;
use reqwest::header::{HeaderValue, ACCEPT_ENCODING, USER_AGENT};
use reqwest::Request;

/// A named request transformer
#[derive(Clone)]
pub struct Middleware {
    name: String,
    apply: Arc<dyn Fn(Request) -> Request + Send + Sync>,
}

impl Middleware {
    pub fn new(
        name: impl Into<String>,
        apply: impl Fn(Request) -> Request + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, request: Request) -> Request {
        (self.apply)(request)
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware").field("name", &self.name).finish()
    }
}

/// Run `request` through `chain` in registration order
pub fn prepare_request(chain: &[Middleware], mut request: Request) -> Request {
    for middleware in chain {
        request = middleware.apply(request);
    }
    request
}

/// Strips the Accept-Encoding header from every request
pub fn strip_accept_encoding() -> Middleware {
    Middleware::new("strip_accept_encoding", |mut request| {
        request.headers_mut().remove(ACCEPT_ENCODING);
        request
    })
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Sets a User-Agent picked at random per request
pub fn random_user_agent() -> Middleware {
    Middleware::new("random_user_agent", |mut request| {
        let agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        if let Ok(value) = HeaderValue::from_str(agent) {
            request.headers_mut().insert(USER_AGENT, value);
        }
        request
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    fn get(url: &str) -> Request {
        Request::new(Method::GET, url.parse().unwrap())
    }

    #[test]
    fn test_strip_accept_encoding() {
        let mut request = get("https://example.com/");
        request
            .headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        let request = strip_accept_encoding().apply(request);
        assert!(request.headers().get(ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn test_random_user_agent_sets_header() {
        let request = random_user_agent().apply(get("https://example.com/"));
        let agent = request.headers().get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(USER_AGENTS.contains(&agent));
    }

    #[test]
    fn test_chain_applies_in_order() {
        let first = Middleware::new("first", |mut request| {
            request
                .headers_mut()
                .insert("x-probe", HeaderValue::from_static("first"));
            request
        });
        let second = Middleware::new("second", |mut request| {
            request
                .headers_mut()
                .insert("x-probe", HeaderValue::from_static("second"));
            request
        });

        let request = prepare_request(&[first, second], get("https://example.com/"));
        assert_eq!(request.headers().get("x-probe").unwrap(), "second");
    }

    #[test]
    fn test_names() {
        assert_eq!(strip_accept_encoding().name(), "strip_accept_encoding");
        assert_eq!(random_user_agent().name(), "random_user_agent");
    }
}
