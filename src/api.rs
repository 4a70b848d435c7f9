//! HTTP read API over precomputed recommendations.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::Config;
use crate::data::{AlgorithmType, BatchLog, ItemType, Recommendation};
use crate::errors::{AppError, RecError};
use crate::model::{ModelInfo, ModelRegistry};
use crate::popularity::PopularityIndex;
use crate::scorer::{ScoreRequest, Scorer, UserContext};
use crate::store::RecommendationStore;

const RECENT_BATCH_LOGS: usize = 10;

#[derive(Clone)]
struct CachedIndex {
    index: Arc<PopularityIndex>,
    built_at: Instant,
}

/// Per-region popularity indexes for the serving fallback, rebuilt after `ttl`.
#[derive(Clone)]
pub struct FallbackCache {
    cache: Arc<DashMap<String, CachedIndex>>,
    ttl: Duration,
}

impl FallbackCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, region: &str) -> Option<Arc<PopularityIndex>> {
        self.cache
            .get(region)
            .filter(|entry| entry.built_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.index))
    }

    pub fn insert(&self, region: &str, index: PopularityIndex) -> Arc<PopularityIndex> {
        let index = Arc::new(index);
        self.cache.insert(
            region.to_string(),
            CachedIndex {
                index: Arc::clone(&index),
                built_at: Instant::now(),
            },
        );
        index
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecommendationStore>,
    pub models: Arc<ModelRegistry>,
    pub config: Arc<Config>,
    pub fallback: FallbackCache,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        models: Arc<ModelRegistry>,
        config: Arc<Config>,
    ) -> Self {
        let fallback = FallbackCache::new(config.cache_ttl);
        Self {
            store,
            models,
            config,
            fallback,
            started_at: Instant::now(),
        }
    }

    async fn popularity(&self, region: &str) -> Result<Arc<PopularityIndex>, RecError> {
        if let Some(index) = self.fallback.get(region) {
            return Ok(index);
        }
        let since = Utc::now() - ChronoDuration::days(self.config.training.lookback_days);
        let items = self.store.items(region).await?;
        let events = self.store.interactions(region, since).await?;
        debug!(region, items = items.len(), "Rebuilding fallback popularity");
        Ok(self
            .fallback
            .insert(region, PopularityIndex::build(region, &items, &events)))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/recommendations", get(recommendations_handler))
        .route("/health", get(health_handler))
        .route("/batch/status", get(batch_status_handler))
        .route("/model/info", get(model_info_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    user_id: i64,
    #[serde(rename = "type")]
    item_type: String,
    limit: Option<usize>,
    /// Comma separated item ids to leave out.
    exclude: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Batch,
    Fallback,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub user_id: i64,
    pub item_type: ItemType,
    pub source: Source,
    pub recommendations: Vec<RecommendedItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecommendedItem {
    pub item_id: i64,
    pub score: f32,
    pub rank_position: u32,
    pub algorithm_type: AlgorithmType,
}

impl From<&Recommendation> for RecommendedItem {
    fn from(rec: &Recommendation) -> Self {
        Self {
            item_id: rec.item_id,
            score: rec.score,
            rank_position: rec.rank_position,
            algorithm_type: rec.algorithm_type,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct BatchStatusResponse {
    latest: Option<BatchLog>,
    recent: Vec<BatchLog>,
}

#[derive(Serialize)]
struct ModelInfoResponse {
    regions: Vec<ModelInfo>,
}

fn parse_exclude(raw: Option<&str>) -> Result<Vec<i64>, AppError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| AppError::BadRequest(format!("Invalid item id in exclude: {}", s)))
        })
        .collect()
}

async fn recommendations_handler(
    State(state): State<AppState>,
    query: Result<Query<RecommendationQuery>, QueryRejection>,
) -> Result<Json<RecommendationResponse>, AppError> {
    let Query(query) = query.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let item_type: ItemType = query.item_type.parse()?;
    let scoring = &state.config.scoring;
    let limit = query.limit.unwrap_or(scoring.default_limit);
    if limit == 0 || limit > scoring.max_recommendations {
        return Err(RecError::InvalidLimit {
            limit,
            max: scoring.max_recommendations,
        }
        .into());
    }
    let exclude = parse_exclude(query.exclude.as_deref())?;

    let stored = state
        .store
        .recommendations(query.user_id, item_type, limit + exclude.len())
        .await?;
    let stored: Vec<&Recommendation> = stored
        .iter()
        .filter(|rec| !exclude.contains(&rec.item_id))
        .take(limit)
        .collect();

    if !stored.is_empty() {
        return Ok(Json(RecommendationResponse {
            user_id: query.user_id,
            item_type,
            source: Source::Batch,
            recommendations: stored.into_iter().map(RecommendedItem::from).collect(),
        }));
    }

    // unknown users are served from the first configured region
    let region = match state.store.user(query.user_id).await? {
        Some(user) if state.config.has_region(&user.region) => user.region,
        _ => state
            .config
            .regions
            .first()
            .cloned()
            .ok_or_else(|| AppError::InternalError("No region configured".to_string()))?,
    };
    let popularity = state.popularity(&region).await?;
    let since = Utc::now() - ChronoDuration::days(state.config.training.lookback_days);
    let history = state
        .store
        .user_interactions(query.user_id, &region, since)
        .await?;

    let mut request = ScoreRequest::new(query.user_id, item_type, limit);
    request.exclude = exclude;
    let rows = Scorer::new(scoring, &popularity, None).recommend(
        &request,
        &UserContext::from_events(query.user_id, &history),
        Utc::now(),
    )?;

    info!(
        user_id = query.user_id,
        item_type = %item_type,
        region = %region,
        count = rows.len(),
        "Served popularity fallback"
    );

    Ok(Json(RecommendationResponse {
        user_id: query.user_id,
        item_type,
        source: Source::Fallback,
        recommendations: rows.iter().map(RecommendedItem::from).collect(),
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn batch_status_handler(
    State(state): State<AppState>,
) -> Result<Json<BatchStatusResponse>, AppError> {
    let recent = state.store.recent_batch_logs(RECENT_BATCH_LOGS).await?;
    Ok(Json(BatchStatusResponse {
        latest: recent.first().cloned(),
        recent,
    }))
}

async fn model_info_handler(State(state): State<AppState>) -> Json<ModelInfoResponse> {
    let mut regions = Vec::with_capacity(state.config.regions.len());
    for region in &state.config.regions {
        regions.push(state.models.current_info(region).await);
    }
    Json(ModelInfoResponse { regions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::data::{ActionType, BatchStatus, BatchType, InteractionEvent, Item, ItemKey};
    use crate::matrix::InteractionMatrix;
    use crate::model::LatentFactorModel;
    use crate::store::{SqliteStore, UserRecommendations};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn state(dir: &TempDir) -> (AppState, Arc<SqliteStore>) {
        let mut config = Config::from_lookup(|key| match key {
            "REC_REGIONS" => Some("seoul,busan".to_string()),
            _ => None,
        })
        .unwrap();
        config.model_dir = dir.path().to_path_buf();

        let sqlite = Arc::new(SqliteStore::in_memory().await.unwrap());
        sqlite.insert_user(1, "seoul").await.unwrap();
        let now = Utc::now();
        for id in 1..=3 {
            sqlite
                .insert_item(&Item {
                    item_id: id,
                    item_type: ItemType::Log,
                    region: "seoul".to_string(),
                    author_id: None,
                    created_at: now - ChronoDuration::hours(id),
                })
                .await
                .unwrap();
        }
        sqlite
            .insert_action(2, ItemKey::new(ItemType::Log, 3), ActionType::Like, now)
            .await
            .unwrap();

        let store: Arc<dyn RecommendationStore> = sqlite.clone();
        let models = Arc::new(ModelRegistry::new(dir.path()));
        (AppState::new(store, models, Arc::new(config)), sqlite)
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (state, _) = state(&dir).await;
        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "recommendation-service");
    }

    #[tokio::test]
    async fn test_falls_back_to_popularity_without_rows() {
        let dir = TempDir::new().unwrap();
        let (state, _) = state(&dir).await;
        let (status, body) = get(state.clone(), "/recommendations?user_id=1&type=log").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "fallback");
        let recs = body["recommendations"].as_array().unwrap();
        assert_eq!(recs.len(), 3);
        // log 3 has the only like
        assert_eq!(recs[0]["item_id"], 3);
        assert_eq!(recs[0]["rank_position"], 1);
        assert!(recs.iter().all(|r| r["algorithm_type"] == "popularity"));
        assert_eq!(state.fallback.len(), 1);

        let (_, body) = get(state, "/recommendations?user_id=1&type=log&exclude=3,1").await;
        let ids: Vec<i64> = body["recommendations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["item_id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_serves_batch_rows_when_present() {
        let dir = TempDir::new().unwrap();
        let (state, store) = state(&dir).await;
        let rows = (1..=3)
            .map(|rank| Recommendation {
                user_id: 1,
                item_id: 10 + rank as i64,
                item_type: ItemType::Place,
                score: 1.0 - rank as f32 * 0.1,
                rank_position: rank,
                algorithm_type: AlgorithmType::Hybrid,
                created_at: Utc::now(),
            })
            .collect();
        store
            .replace_recommendations(&[UserRecommendations {
                user_id: 1,
                item_type: ItemType::Place,
                rows,
            }])
            .await
            .unwrap();

        let (status, body) = get(state, "/recommendations?user_id=1&type=place&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "batch");
        let recs = body["recommendations"].as_array().unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0]["item_id"], 11);
        assert_eq!(recs[1]["algorithm_type"], "hybrid");
    }

    #[tokio::test]
    async fn test_rejects_bad_type_and_limit() {
        let dir = TempDir::new().unwrap();
        let (state, _) = state(&dir).await;

        let (status, body) = get(state.clone(), "/recommendations?user_id=1&type=record").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);

        let (status, body) = get(state.clone(), "/recommendations?user_id=1&type=log&limit=200").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("200"));

        let (status, _) = get(state, "/recommendations?user_id=1&type=log&exclude=x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_query_params_get_json_error() {
        let dir = TempDir::new().unwrap();
        let (state, _) = state(&dir).await;

        for uri in [
            "/recommendations?type=log",
            "/recommendations?user_id=1",
            "/recommendations?user_id=abc&type=log",
        ] {
            let (status, body) = get(state.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["status"], 400, "{}", uri);
            assert!(body["error"].is_string(), "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_batch_status_lists_recent_logs() {
        let dir = TempDir::new().unwrap();
        let (state, store) = state(&dir).await;
        let (_, empty) = get(state.clone(), "/batch/status").await;
        assert!(empty["latest"].is_null());

        let log = store
            .create_batch_log(BatchType::Full, &state.config.regions, 1, Utc::now())
            .await
            .unwrap();
        store
            .finish_batch_log(log.batch_id, BatchStatus::Completed, 1, 3, None, Utc::now())
            .await
            .unwrap();
        store
            .create_batch_log(BatchType::Incremental, &state.config.regions, 0, Utc::now())
            .await
            .unwrap();

        let (status, body) = get(state, "/batch/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["latest"]["status"], "running");
        assert!(body["latest"]["end_time"].is_null());
        assert_eq!(body["recent"].as_array().unwrap().len(), 2);
        assert_eq!(body["recent"][1]["total_recommendations"], 3);
    }

    #[tokio::test]
    async fn test_model_info_reports_each_region() {
        let dir = TempDir::new().unwrap();
        let (state, _) = state(&dir).await;
        let (status, body) = get(state, "/model/info").await;
        assert_eq!(status, StatusCode::OK);
        let regions = body["regions"].as_array().unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0]["region"], "seoul");
        assert_eq!(regions[0]["loaded"], false);
    }

    #[tokio::test]
    async fn test_model_info_follows_models_published_elsewhere() {
        let dir = TempDir::new().unwrap();
        let (state, _) = state(&dir).await;
        let (_, before) = get(state.clone(), "/model/info").await;
        assert_eq!(before["regions"][0]["loaded"], false);

        // a batch process publishing through its own registry
        let now = Utc::now();
        let events: Vec<InteractionEvent> = (1..=3)
            .flat_map(|user| {
                (1..=3).map(move |item| {
                    InteractionEvent::new(user, ItemKey::new(ItemType::Log, item), ActionType::Like, now)
                })
            })
            .collect();
        let matrix = InteractionMatrix::build("seoul", &events, 1).unwrap();
        let training = TrainingConfig {
            factors: 4,
            iterations: 5,
            ..TrainingConfig::default()
        };
        let published = ModelRegistry::new(dir.path())
            .publish(LatentFactorModel::train(&matrix, &training).unwrap())
            .unwrap();

        let (_, after) = get(state, "/model/info").await;
        assert_eq!(after["regions"][0]["loaded"], true);
        assert_eq!(after["regions"][0]["version"], published.version());
    }

    #[test]
    fn test_fallback_cache_expires() {
        let cache = FallbackCache::new(Duration::from_secs(0));
        cache.insert("seoul", PopularityIndex::default());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("seoul").is_none());

        let cache = FallbackCache::new(Duration::from_secs(60));
        cache.insert("seoul", PopularityIndex::default());
        assert!(cache.get("seoul").is_some());
        cache.clear();
        assert!(cache.is_empty());
    }
}
