//! HTTP control endpoints
//!
//! Read-only JSON surface over the running engine: a health check, per-
//! scraper stats and the items stored by the Redis DAO.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::engine::EngineCore;

pub(crate) async fn serve(address: String, core: Arc<EngineCore>) {
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Cannot start HTTP server at: {}: {}", address, err);
            return;
        }
    };
    info!("Started HTTP server at: {}", address);

    if let Err(err) = axum::serve(listener, router(core)).await {
        error!("HTTP server failed: {}", err);
    }
}

pub(crate) fn router(core: Arc<EngineCore>) -> Router {
    Router::new()
        .route("/api/healthcheck", get(healthcheck))
        .route("/api/stats", get(stats))
        .route("/api/items", get(items))
        .with_state(core)
}

async fn healthcheck() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

async fn stats(State(core): State<Arc<EngineCore>>) -> Json<Value> {
    let mut result = serde_json::Map::new();
    for scraper in &core.scrapers {
        let stats = core.stats.get(scraper.name());
        result.insert(
            scraper.name().to_string(),
            json!({
                "currentUrl": scraper.current_url(),
                "domain": scraper.domain(),
                "crawled": stats.crawled,
                "successful": stats.successful,
                "scraped": stats.scraped,
                "saved": stats.saved,
            }),
        );
    }
    Json(Value::Object(result))
}

#[derive(Debug, Deserialize)]
struct ItemsQuery {
    #[serde(default)]
    scraper: Option<String>,
}

async fn items(
    State(core): State<Arc<EngineCore>>,
    Query(query): Query<ItemsQuery>,
) -> Response {
    let scraper_error = (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Scraper is not defined." })),
    );

    let name = match query.scraper {
        Some(name) if core.has_scraper(&name) => name,
        _ => return scraper_error.into_response(),
    };

    let Some(dao) = &core.dao else {
        return scraper_error.into_response();
    };

    let items = match dao.get_items(&name).await {
        Ok(items) => items,
        Err(err) => {
            error!("Failed to read items for '{}': {}", name, err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Storage backend unavailable." })),
            )
                .into_response();
        }
    };
    let count = match dao.count_items(&name).await {
        Ok(count) => count,
        Err(err) => {
            error!("Failed to count items for '{}': {}", name, err);
            items.len() as u64
        }
    };

    Json(json!({ "items": items, "count": count })).into_response()
}
