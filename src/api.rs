//! HTTP API Server
//!
//! Thin REST boundary over the feed, ranking and ledger components. Handlers
//! parse request shapes, consult the response cache and map errors through
//! [`Error`]'s `IntoResponse`.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::access::DataAccess;
use crate::cache::{Namespace, ResponseCache};
use crate::config::{ApiConfig, Config};
use crate::database::Database;
use crate::engagement::MetricsUpdater;
use crate::error::{Error, Result};
use crate::facts::{FactRepository, FactUpdate, NewFact};
use crate::feed::{FeedCoordinator, FeedPage, FeedRequest, SortMode};
use crate::ledger::{EngagementStats, InteractionLedger, InteractionPatterns, TimeWindow};
use crate::models::{Difficulty, Fact, Interaction, InteractionType, Preferences, User};
use crate::recommendation::{RankingEngine, RankingLimits, Recommendations, UserProfiles};

/// Shared application state
pub struct AppState {
    pub facts: FactRepository,
    pub profiles: UserProfiles,
    pub ledger: InteractionLedger,
    pub ranking: RankingEngine,
    pub feed: FeedCoordinator,
    pub cache: ResponseCache,
    pub db: Option<Database>,
    max_limit: usize,
    max_query_results: usize,
}

impl AppState {
    /// Wire every component over one store access layer
    pub fn new(access: DataAccess, config: &Config, db: Option<Database>) -> Self {
        let page_size = config.store.page_size;
        let max_results = config.feed.max_query_results;

        let metrics = MetricsUpdater::new(access.clone(), &config.engagement);
        let ledger = InteractionLedger::new(access.clone(), metrics, page_size, max_results);
        let profiles = UserProfiles::new(access.clone());
        let ranking = RankingEngine::new(
            access.clone(),
            ledger.clone(),
            profiles.clone(),
            RankingLimits {
                page_size,
                history_size: config.feed.history_size,
                max_results,
            },
        );
        let feed = FeedCoordinator::new(
            access.clone(),
            profiles.clone(),
            ranking.clone(),
            config.feed.clone(),
            page_size,
        );

        Self {
            facts: FactRepository::new(access),
            profiles,
            ledger,
            ranking,
            feed,
            cache: ResponseCache::new(&config.cache),
            db,
            max_limit: config.feed.max_limit,
            max_query_results: max_results,
        }
    }

    fn clamp_limit(&self, requested: Option<usize>, default: usize) -> usize {
        requested.unwrap_or(default).clamp(1, self.max_limit)
    }

    /// Drop cached responses a user's write may have changed
    fn invalidate_user(&self, user_id: &str, fact_id: Option<&str>) {
        self.cache
            .invalidate_prefix(Namespace::Recommendations, &format!("{}|", user_id));
        self.cache
            .invalidate_prefix(Namespace::Feed, &format!("user={}|", user_id));
        if let Some(fact_id) = fact_id {
            self.cache.invalidate(Namespace::Stats, fact_id);
        }
    }

    /// Catalog writes can change any feed page or recommendation list
    fn invalidate_catalog(&self, fact_id: Option<&str>) {
        self.cache.invalidate_prefix(Namespace::Feed, "");
        self.cache.invalidate_prefix(Namespace::Recommendations, "");
        if let Some(fact_id) = fact_id {
            self.cache.invalidate(Namespace::Stats, fact_id);
        }
    }
}

// ============================================================================
// Request / response shapes
// ============================================================================

/// Query params for the fact feed
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedQuery {
    pub category: Option<String>,
    pub difficulty: Option<String>,
    pub user_id: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<usize>,
    pub next_token: Option<String>,
}

impl FeedQuery {
    fn cache_key(&self) -> String {
        format!(
            "user={}|category={}|difficulty={}|sort={}|limit={}|token={}",
            self.user_id.as_deref().unwrap_or(""),
            self.category.as_deref().unwrap_or(""),
            self.difficulty.as_deref().unwrap_or(""),
            self.sort.as_deref().unwrap_or(""),
            self.limit.map(|l| l.to_string()).unwrap_or_default(),
            self.next_token.as_deref().unwrap_or(""),
        )
    }

    fn into_request(self) -> Result<FeedRequest> {
        Ok(FeedRequest {
            category: self.category,
            difficulty: self
                .difficulty
                .filter(|d| !d.is_empty())
                .map(|d| d.parse::<Difficulty>())
                .transpose()?,
            user_id: self.user_id,
            sort: self
                .sort
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<SortMode>())
                .transpose()?
                .unwrap_or_default(),
            limit: self.limit,
            next_token: self.next_token.filter(|t| !t.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Query params for ledger listings
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub kind: Option<InteractionType>,
}

impl HistoryQuery {
    fn window(&self) -> TimeWindow {
        TimeWindow {
            from: self.from,
            to: self.to,
        }
    }
}

/// Request body for recording an interaction
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRequest {
    pub user_id: String,
    #[serde(alias = "itemId")]
    pub fact_id: String,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Request body for retracting an interaction
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveInteractionRequest {
    pub user_id: String,
    #[serde(alias = "itemId")]
    pub fact_id: String,
    #[serde(rename = "type")]
    pub kind: InteractionType,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

// ============================================================================
// Server
// ============================================================================

pub fn router(state: Arc<AppState>, config: &ApiConfig) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Facts and feed
        .route("/api/v1/facts", get(get_feed).post(import_facts))
        .route(
            "/api/v1/facts/:id",
            get(get_fact).patch(update_fact).delete(delete_fact),
        )
        .route("/api/v1/facts/:id/similar", get(get_similar))
        .route("/api/v1/facts/:id/stats", get(get_fact_stats))
        .route("/api/v1/facts/:id/interactions", get(get_fact_interactions))
        // Ranking
        .route("/api/v1/recommendations/:user_id", get(get_recommendations))
        // Interaction ledger
        .route(
            "/api/v1/interactions",
            post(record_interaction).delete(remove_interaction),
        )
        // Users
        .route("/api/v1/users/:id", get(get_user))
        .route(
            "/api/v1/users/:id/preferences",
            put(update_preferences),
        )
        .route("/api/v1/users/:id/interactions", get(get_user_interactions))
        .route("/api/v1/users/:id/patterns", get(get_user_patterns))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Serve until `shutdown` resolves
pub async fn start_server(
    state: Arc<AppState>,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state, config);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting fact feed API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::internal_with_source(format!("failed to bind {}", addr), e))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::internal_with_source("API server failed", e))?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let (status, store) = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => (StatusCode::OK, "postgres"),
            Err(e) => {
                error!("Database health check failed: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "postgres")
            }
        },
        None => (StatusCode::OK, "memory"),
    };
    let label = if status == StatusCode::OK {
        "healthy"
    } else {
        "degraded"
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store,
        }),
    )
}

/// Paginated fact feed
async fn get_feed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedPage>> {
    let key = query.cache_key();
    if let Some(cached) = state.cache.get::<FeedPage>(Namespace::Feed, &key) {
        return Ok(Json(cached));
    }
    let page = state.feed.page(query.into_request()?).await?;
    state.cache.insert(Namespace::Feed, key, &page);
    Ok(Json(page))
}

async fn get_fact(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Fact>> {
    Ok(Json(state.facts.get(&id).await?))
}

/// Facts similar to one fact
async fn get_similar(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ListResponse<Fact>>> {
    let limit = state.clamp_limit(query.limit, 5);
    let items = state.ranking.similar(&id, limit).await?;
    Ok(Json(ListResponse { items }))
}

/// Engagement statistics for a fact
async fn get_fact_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<EngagementStats>> {
    if let Some(cached) = state.cache.get::<EngagementStats>(Namespace::Stats, &id) {
        return Ok(Json(cached));
    }
    state.facts.get(&id).await?;
    let stats = state.ledger.stats(&id).await?;
    state.cache.insert(Namespace::Stats, id, &stats);
    Ok(Json(stats))
}

async fn get_fact_interactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ListResponse<Interaction>>> {
    let limit = query.limit.unwrap_or(state.max_query_results);
    let mut items = state.ledger.by_fact(&id, query.window(), limit).await?;
    if let Some(kind) = query.kind {
        items.retain(|i| i.kind == kind);
    }
    Ok(Json(ListResponse { items }))
}

/// Personalized recommendations for a user
async fn get_recommendations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Recommendations>> {
    let limit = state.clamp_limit(query.limit, 10);
    let key = format!("{}|{}", user_id, limit);
    if let Some(cached) = state.cache.get::<Recommendations>(Namespace::Recommendations, &key) {
        return Ok(Json(cached));
    }
    let recommendations = state.ranking.recommend(&user_id, limit).await;
    state
        .cache
        .insert(Namespace::Recommendations, key, &recommendations);
    Ok(Json(recommendations))
}

/// Record a user interaction
async fn record_interaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InteractionRequest>,
) -> Result<(StatusCode, Json<Interaction>)> {
    let outcome = state
        .ledger
        .record(&req.user_id, &req.fact_id, req.kind, req.timestamp)
        .await
        .map_err(|e| {
            if e.is_error_level() {
                error!("Failed to record interaction: {}", e);
            }
            e
        })?;
    state.invalidate_user(&req.user_id, Some(&req.fact_id));
    Ok((StatusCode::CREATED, Json(outcome.interaction)))
}

/// Retract the most recent matching interaction
async fn remove_interaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemoveInteractionRequest>,
) -> Result<Json<Interaction>> {
    let outcome = state
        .ledger
        .remove(&req.user_id, &req.fact_id, req.kind)
        .await
        .map_err(|e| {
            if e.is_error_level() {
                error!("Failed to remove interaction: {}", e);
            }
            e
        })?;
    state.invalidate_user(&req.user_id, Some(&req.fact_id));
    Ok(Json(outcome.interaction))
}

async fn get_user(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<User>> {
    Ok(Json(state.profiles.get_or_create(&id).await?))
}

async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(preferences): Json<Preferences>,
) -> Result<Json<User>> {
    let user = state.profiles.update_preferences(&id, preferences).await?;
    state.invalidate_user(&id, None);
    Ok(Json(user))
}

async fn get_user_interactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ListResponse<Interaction>>> {
    let limit = query.limit.unwrap_or(state.max_query_results);
    let mut items = state.ledger.by_user(&id, query.window(), limit).await?;
    if let Some(kind) = query.kind {
        items.retain(|i| i.kind == kind);
    }
    Ok(Json(ListResponse { items }))
}

async fn get_user_patterns(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<InteractionPatterns> {
    Json(state.ledger.patterns(&id).await)
}

// ============================================================================
// Fact administration
// ============================================================================

async fn import_facts(
    State(state): State<Arc<AppState>>,
    Json(facts): Json<Vec<NewFact>>,
) -> Result<(StatusCode, Json<ListResponse<Fact>>)> {
    let items = state.facts.import(facts).await?;
    state.invalidate_catalog(None);
    Ok((StatusCode::CREATED, Json(ListResponse { items })))
}

async fn update_fact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<FactUpdate>,
) -> Result<Json<Fact>> {
    let fact = state.facts.update(&id, update).await?;
    state.invalidate_catalog(Some(&id));
    Ok(Json(fact))
}

async fn delete_fact(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode> {
    state.facts.delete(&id).await?;
    state.invalidate_catalog(Some(&id));
    Ok(StatusCode::NO_CONTENT)
}
