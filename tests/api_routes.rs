//! HTTP boundary over the in-memory store

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use factfeed::api::{router, AppState};
use factfeed::config::Config;
use factfeed::store::MemoryStore;
use factfeed::DataAccess;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    let config = Config::default();
    let access = DataAccess::new(Arc::new(MemoryStore::new()), config.retry.clone());
    let state = Arc::new(AppState::new(access, &config, None));
    router(state, &config.api)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn seed(app: &Router) {
    let facts: Vec<Value> = (0..3)
        .map(|i| {
            json!({
                "id": format!("f{}", i),
                "title": format!("Fact {}", i),
                "content": "c",
                "category": "science",
                "difficulty": "intermediate",
                "readingTime": 2,
                "createdAt": format!("2024-01-0{}T00:00:00Z", i + 1),
            })
        })
        .collect();
    let (status, _) = call(app, Method::POST, "/api/v1/facts", Some(json!(facts))).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn health_reports_memory_store() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "memory");
}

#[tokio::test]
async fn feed_pages_with_opaque_tokens() {
    let app = app();
    seed(&app).await;

    let (status, first) = call(&app, Method::GET, "/api/v1/facts?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["items"].as_array().unwrap().len(), 2);
    assert_eq!(first["items"][0]["id"], "f2");
    assert_eq!(first["pagination"]["hasMore"], true);

    let token = first["pagination"]["nextToken"].as_str().unwrap();
    let (_, second) = call(
        &app,
        Method::GET,
        &format!("/api/v1/facts?limit=2&nextToken={}", token),
        None,
    )
    .await;
    assert_eq!(second["items"][0]["id"], "f0");
    assert_eq!(second["pagination"]["hasMore"], false);

    let (status, body) = call(&app, Method::GET, "/api/v1/facts?nextToken=garbage!", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["code"].is_string());
}

#[tokio::test]
async fn interactions_update_stats_and_invalidate_cache() {
    let app = app();
    seed(&app).await;

    let (_, before) = call(&app, Method::GET, "/api/v1/facts/f1/stats", None).await;
    assert_eq!(before["total"], 0);

    let (status, entry) = call(
        &app,
        Method::POST,
        "/api/v1/interactions",
        Some(json!({"userId": "u1", "itemId": "f1", "type": "share"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(entry["factId"], "f1");
    assert_eq!(entry["type"], "share");

    let (_, after) = call(&app, Method::GET, "/api/v1/facts/f1/stats", None).await;
    assert_eq!(after["share"], 1);
    assert_eq!(after["total"], 1);
    assert_eq!(after["engagementScore"], 5.0);

    let (status, _) = call(
        &app,
        Method::DELETE,
        "/api/v1/interactions",
        Some(json!({"userId": "u1", "factId": "f1", "type": "like"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn recommendations_carry_algorithm_tag() {
    let app = app();
    seed(&app).await;

    let (status, body) = call(&app, Method::GET, "/api/v1/recommendations/u9?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["algorithm"], "personalized");
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn preferences_are_validated() {
    let app = app();
    let (status, user) = call(
        &app,
        Method::PUT,
        "/api/v1/users/u1/preferences",
        Some(json!({"categories": ["science"], "difficulty": "advanced", "readingTime": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["preferences"]["difficulty"], "advanced");

    let (status, _) = call(
        &app,
        Method::PUT,
        "/api/v1/users/u1/preferences",
        Some(json!({"categories": [], "readingTime": 99})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
