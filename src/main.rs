//! Timeline service binary
//!
//! Wires the timeline core together and exposes it over HTTP. Note and
//! follow-graph backends are in-memory here; production deployments swap
//! them for real service clients behind the same traits.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use timeline_service::assembler::SlateAssembler;
use timeline_service::cache::{MemoryKvStore, TimelineCache};
use timeline_service::clock::ServiceClock;
use timeline_service::config::{fanout as fanout_tuning, network, rate};
use timeline_service::fanout::{FanoutQueue, FanoutWorker};
use timeline_service::filter::{ContentFilter, GlobalPolicy};
use timeline_service::live_hub::LiveUpdateHub;
use timeline_service::models::{Note, Pagination, TimelinePage};
use timeline_service::observability::ObservabilityManager;
use timeline_service::ranking::RankingEngine;
use timeline_service::rate_limiter::RateLimiter;
use timeline_service::resolver::{RequestMetadata, TimelineAlgorithm, TimelinePreferences};
use timeline_service::service::{
    GetTimelineRequest, GetUserTimelineRequest, RecordEngagementRequest, RefreshTimelineRequest,
    TimelineError, TimelineService,
};
use timeline_service::sources::{
    FollowGraph, FollowingAdapter, ListsAdapter, NoteService, RecommendedAdapter, SourceAdapter,
    SourceError, TrendingAdapter,
};
use timeline_service::storage::{MemoryPreferencesStore, PostgresPreferencesStore, PreferencesStore};

/// In-memory note and follow-graph backend for single-node runs
struct DemoBackend {
    notes: RwLock<HashMap<String, Note>>,
    /// viewer_id -> authors the viewer follows
    follows: RwLock<HashMap<String, HashSet<String>>>,
    /// viewer_id -> members of the viewer's curated lists
    lists: RwLock<HashMap<String, Vec<String>>>,
}

impl DemoBackend {
    fn new() -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
            follows: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
        }
    }

    async fn insert_note(&self, note: Note) {
        self.notes.write().await.insert(note.id.clone(), note);
    }

    async fn remove_note(&self, note_id: &str) -> Option<Note> {
        self.notes.write().await.remove(note_id)
    }

    async fn set_follow(&self, follower: &str, following: &str, is_follow: bool) {
        let mut follows = self.follows.write().await;
        let set = follows.entry(follower.to_string()).or_default();
        if is_follow {
            set.insert(following.to_string());
        } else {
            set.remove(following);
        }
    }
}

#[async_trait::async_trait]
impl NoteService for DemoBackend {
    async fn get_recent_by_authors(
        &self,
        author_ids: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError> {
        let authors: HashSet<&String> = author_ids.iter().collect();
        let notes = self.notes.read().await;
        let mut result: Vec<Note> = notes
            .values()
            .filter(|note| authors.contains(&note.author_id) && note.created_at >= since)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn get_recent_by_interests(
        &self,
        hashtags: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError> {
        let wanted: HashSet<&String> = hashtags.iter().collect();
        let notes = self.notes.read().await;
        let mut result: Vec<Note> = notes
            .values()
            .filter(|note| {
                note.created_at >= since && note.hashtags.iter().any(|tag| wanted.contains(tag))
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn get_trending(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Note>, SourceError> {
        let notes = self.notes.read().await;
        let mut result: Vec<Note> = notes
            .values()
            .filter(|note| note.created_at >= since)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.metrics
                .total_engagements()
                .cmp(&a.metrics.total_engagements())
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn get_note(&self, note_id: &str) -> Result<Option<Note>, SourceError> {
        Ok(self.notes.read().await.get(note_id).cloned())
    }
}

#[async_trait::async_trait]
impl FollowGraph for DemoBackend {
    async fn get_following(&self, viewer_id: &str) -> Result<Vec<String>, SourceError> {
        Ok(self
            .follows
            .read()
            .await
            .get(viewer_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_followers(&self, author_id: &str) -> Result<Vec<String>, SourceError> {
        let follows = self.follows.read().await;
        Ok(follows
            .iter()
            .filter(|(_, following)| following.contains(author_id))
            .map(|(follower, _)| follower.clone())
            .collect())
    }

    async fn get_list_members(&self, viewer_id: &str) -> Result<Vec<String>, SourceError> {
        Ok(self.lists.read().await.get(viewer_id).cloned().unwrap_or_default())
    }
}

struct AppState {
    service: Arc<TimelineService>,
    backend: Arc<DemoBackend>,
}

/// Error wrapper mapping façade errors onto HTTP statuses
struct ApiError(TimelineError);

impl From<TimelineError> for ApiError {
    fn from(err: TimelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            TimelineError::Unauthorized => StatusCode::UNAUTHORIZED,
            TimelineError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            TimelineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            TimelineError::Internal(_) | TimelineError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.0.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    offset: Option<usize>,
    limit: Option<usize>,
    algorithm: Option<String>,
    include_signals: Option<bool>,
    requester: Option<String>,
    include_replies: Option<bool>,
    include_reposts: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FollowChangeBody {
    follower_id: String,
    following_id: String,
    is_follow: bool,
}

#[derive(Debug, Deserialize)]
struct EngagementBody {
    note_id: String,
    action: String,
    #[serde(default)]
    duration_seconds: f64,
}

#[derive(Debug, Deserialize)]
struct MarkReadBody {
    read_until: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RefreshBody {
    since: Option<DateTime<Utc>>,
    max_items: Option<usize>,
}

/// Metadata names accepted from `x-…` request headers
const METADATA_KEYS: [&str; 14] = [
    "caller_id",
    "admin",
    "auth_token",
    "rate_rpm",
    "ab_following_weight",
    "ab_recommended_weight",
    "ab_trending_weight",
    "ab_lists_weight",
    "cap_following",
    "cap_recommended",
    "cap_trending",
    "cap_lists",
    "discovery_share",
    "use_overdrive",
];

fn metadata_from_headers(headers: &HeaderMap) -> RequestMetadata {
    let mut metadata = RequestMetadata::new();
    for key in METADATA_KEYS {
        let header = format!("x-{}", key.replace('_', "-"));
        if let Some(value) = headers.get(header.as_str()).and_then(|v| v.to_str().ok()) {
            metadata.set(key, value);
        }
    }
    metadata
}

fn pagination_from(query: &TimelineQuery) -> Pagination {
    let default = Pagination::default();
    Pagination {
        offset: query.offset.unwrap_or(default.offset),
        limit: query.limit.unwrap_or(default.limit),
    }
}

async fn timeline_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    Query(query): Query<TimelineQuery>,
    headers: HeaderMap,
) -> Result<Json<TimelinePage>, ApiError> {
    let req = GetTimelineRequest {
        viewer_id,
        algorithm: query.algorithm.as_deref().and_then(TimelineAlgorithm::parse),
        pagination: pagination_from(&query),
        include_signals: query.include_signals.unwrap_or(false),
        metadata: metadata_from_headers(&headers),
    };
    Ok(Json(state.service.get_timeline(req).await?))
}

async fn for_you_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    Query(query): Query<TimelineQuery>,
    headers: HeaderMap,
) -> Result<Json<TimelinePage>, ApiError> {
    let req = GetTimelineRequest {
        viewer_id,
        algorithm: None,
        pagination: pagination_from(&query),
        include_signals: query.include_signals.unwrap_or(false),
        metadata: metadata_from_headers(&headers),
    };
    Ok(Json(state.service.get_for_you_timeline(req).await?))
}

async fn following_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    Query(query): Query<TimelineQuery>,
    headers: HeaderMap,
) -> Result<Json<TimelinePage>, ApiError> {
    let req = GetTimelineRequest {
        viewer_id,
        algorithm: None,
        pagination: pagination_from(&query),
        include_signals: query.include_signals.unwrap_or(false),
        metadata: metadata_from_headers(&headers),
    };
    Ok(Json(state.service.get_following_timeline(req).await?))
}

async fn user_timeline_handler(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<String>,
    Query(query): Query<TimelineQuery>,
    headers: HeaderMap,
) -> Result<Json<TimelinePage>, ApiError> {
    let requester_id = query.requester.clone().unwrap_or_default();
    let req = GetUserTimelineRequest {
        target_id,
        requester_id,
        pagination: pagination_from(&query),
        include_replies: query.include_replies.unwrap_or(false),
        include_reposts: query.include_reposts.unwrap_or(true),
        metadata: metadata_from_headers(&headers),
    };
    Ok(Json(state.service.get_user_timeline(req).await?))
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RefreshBody>,
) -> Result<Json<TimelinePage>, ApiError> {
    let req = RefreshTimelineRequest {
        viewer_id,
        since: body.since,
        max_items: body.max_items,
        metadata: metadata_from_headers(&headers),
    };
    Ok(Json(state.service.refresh_timeline(req).await?))
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MarkReadBody>,
) -> Result<StatusCode, ApiError> {
    let metadata = metadata_from_headers(&headers);
    state
        .service
        .mark_timeline_read(&viewer_id, body.read_until, &metadata)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_preferences_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TimelinePreferences>, ApiError> {
    let metadata = metadata_from_headers(&headers);
    let prefs = state
        .service
        .get_preferences(&viewer_id, &metadata)
        .await?
        .unwrap_or_default();
    Ok(Json(prefs))
}

async fn put_preferences_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    headers: HeaderMap,
    Json(prefs): Json<TimelinePreferences>,
) -> Result<StatusCode, ApiError> {
    let metadata = metadata_from_headers(&headers);
    state.service.update_preferences(&viewer_id, prefs, &metadata).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn engagement_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EngagementBody>,
) -> Result<StatusCode, ApiError> {
    let req = RecordEngagementRequest {
        viewer_id,
        note_id: body.note_id,
        action: body.action,
        duration_seconds: body.duration_seconds,
        metadata: metadata_from_headers(&headers),
    };
    state.service.record_engagement(req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn updates_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let metadata = metadata_from_headers(&headers);
    let session = state.service.subscribe_timeline_updates(&viewer_id, &metadata)?;

    let stream = futures::stream::unfold(session, |session| async move {
        match session.next_message().await {
            Some(update) => {
                let event = Event::default()
                    .json_data(&update)
                    .unwrap_or_else(|_| Event::default().data("{}"));
                Some((Ok::<_, std::convert::Infallible>(event), session))
            }
            None => None,
        }
    });
    Ok(Sse::new(stream))
}

async fn ingest_note_handler(
    State(state): State<Arc<AppState>>,
    Json(note): Json<Note>,
) -> StatusCode {
    state.backend.insert_note(note.clone()).await;
    state.service.on_note_created(note);
    StatusCode::ACCEPTED
}

async fn update_note_handler(
    State(state): State<Arc<AppState>>,
    Json(note): Json<Note>,
) -> StatusCode {
    state.backend.insert_note(note.clone()).await;
    state.service.on_note_updated(note);
    StatusCode::ACCEPTED
}

async fn delete_note_handler(
    State(state): State<Arc<AppState>>,
    Path(note_id): Path<String>,
) -> StatusCode {
    match state.backend.remove_note(&note_id).await {
        Some(note) => {
            state.service.on_note_deleted(&note.id, &note.author_id);
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn follow_change_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FollowChangeBody>,
) -> StatusCode {
    state
        .backend
        .set_follow(&body.follower_id, &body.following_id, body.is_follow)
        .await;
    state
        .service
        .on_follow_changed(&body.follower_id, &body.following_id, body.is_follow);
    StatusCode::ACCEPTED
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.health_check())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.stats())
}

/// Seed a small demo scenario so a fresh server has content to rank
async fn seed_demo_data(backend: &DemoBackend) {
    let now = Utc::now();
    let authors = ["alice_dev", "bob_designer", "charlie_pm"];
    for (i, author) in authors.iter().enumerate() {
        for j in 0..3 {
            let note = Note {
                id: format!("seed_{}_{}", author, j),
                author_id: author.to_string(),
                created_at: now - ChronoDuration::minutes((i as i64 + 1) * (j as i64 + 1) * 10),
                visibility: timeline_service::models::NoteVisibility::Public,
                content: format!("demo note {} from {} with enough text to rank normally", j, author),
                metrics: timeline_service::models::NoteMetrics {
                    views: 100 * (j as u64 + 1),
                    likes: 10 * (j as u64 + 1),
                    reposts: j as u64,
                    replies: 2,
                    quotes: 0,
                },
                media: vec![],
                hashtags: vec!["demo".to_string()],
                is_reply: false,
                is_repost: false,
            };
            backend.insert_note(note).await;
        }
    }
    backend.set_follow("demo_viewer", "alice_dev", true).await;
    backend.set_follow("demo_viewer", "bob_designer", true).await;
}

#[tokio::main]
async fn main() {
    let mut listen_addr = network::DEFAULT_LISTEN_ADDR.to_string();
    let mut postgres_url: Option<String> = None;
    let mut service_token: Option<String> = None;
    let mut seed_demo = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--address" if i + 1 < args.len() => {
                listen_addr = args[i + 1].clone();
                i += 1;
            }
            "--postgres" if i + 1 < args.len() => {
                postgres_url = Some(args[i + 1].clone());
                i += 1;
            }
            "--service-token" if i + 1 < args.len() => {
                service_token = Some(args[i + 1].clone());
                i += 1;
            }
            "--seed-demo" => seed_demo = true,
            "--help" => {
                println!("Usage: timeline_service [options]");
                println!("Options:");
                println!("  --address HOST:PORT    HTTP listen address (default: {})", network::DEFAULT_LISTEN_ADDR);
                println!("  --postgres URL         Postgres connection string for preferences");
                println!("  --service-token TOKEN  Require this shared secret on every request");
                println!("  --seed-demo            Seed in-memory demo content on startup");
                return;
            }
            other => {
                eprintln!("unknown argument: {}", other);
                return;
            }
        }
        i += 1;
    }

    println!("Starting timeline service");
    println!("  Listen address: {}", listen_addr);
    println!("  Preferences store: {}", if postgres_url.is_some() { "postgres" } else { "memory" });

    let backend = Arc::new(DemoBackend::new());
    if seed_demo {
        seed_demo_data(&backend).await;
        println!("  Demo data seeded");
    }

    let notes: Arc<dyn NoteService> = backend.clone();
    let follows: Arc<dyn FollowGraph> = backend.clone();

    let prefs: Arc<dyn PreferencesStore> = match &postgres_url {
        Some(url) => match PostgresPreferencesStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                eprintln!("postgres unavailable ({}), falling back to memory store", err);
                Arc::new(MemoryPreferencesStore::new())
            }
        },
        None => Arc::new(MemoryPreferencesStore::new()),
    };

    let observability = Arc::new(ObservabilityManager::default());
    let cache = Arc::new(TimelineCache::new(Some(Arc::new(MemoryKvStore::new()))));
    let ranking = Arc::new(RankingEngine::new());
    let hub = Arc::new(LiveUpdateHub::default());
    let fanout_queue = Arc::new(FanoutQueue::new(fanout_tuning::QUEUE_CAPACITY));

    let following_adapter = Arc::new(FollowingAdapter::new(notes.clone(), follows.clone()));
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        following_adapter.clone(),
        Arc::new(RecommendedAdapter::new(notes.clone())),
        Arc::new(TrendingAdapter::new(notes.clone())),
        Arc::new(ListsAdapter::new(notes.clone(), follows.clone())),
    ];
    let assembler = Arc::new(SlateAssembler::new(
        adapters,
        ContentFilter::new(GlobalPolicy::default()),
        ranking.clone(),
    ));

    let worker = Arc::new(FanoutWorker::new(
        fanout_queue.clone(),
        follows.clone(),
        following_adapter.clone(),
        cache.clone(),
        hub.clone(),
        observability.clone(),
    ));
    let worker_handle = tokio::spawn(worker.clone().run());

    // close sessions that went quiet without disconnecting
    let eviction_hub = hub.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            eviction_hub.evict_idle(Utc::now());
        }
    });

    let service = Arc::new(TimelineService::new(
        ServiceClock::new(),
        cache,
        assembler,
        ranking,
        RateLimiter::new(rate::DEFAULT_RPM),
        hub.clone(),
        fanout_queue,
        prefs,
        notes,
        following_adapter,
        None,
        observability,
        service_token,
    ));

    let state = Arc::new(AppState { service, backend });
    let app = Router::new()
        .route("/v1/timeline/:viewer_id", get(timeline_handler))
        .route("/v1/timeline/:viewer_id/foryou", get(for_you_handler))
        .route("/v1/timeline/:viewer_id/following", get(following_handler))
        .route("/v1/timeline/:viewer_id/refresh", post(refresh_handler))
        .route("/v1/timeline/:viewer_id/read", post(mark_read_handler))
        .route(
            "/v1/timeline/:viewer_id/preferences",
            get(get_preferences_handler).put(put_preferences_handler),
        )
        .route("/v1/timeline/:viewer_id/engagement", post(engagement_handler))
        .route("/v1/timeline/:viewer_id/updates", get(updates_handler))
        .route("/v1/users/:target_id/timeline", get(user_timeline_handler))
        .route("/v1/notes", post(ingest_note_handler).put(update_note_handler))
        .route("/v1/notes/:note_id", delete(delete_note_handler))
        .route("/v1/follows", post(follow_change_handler))
        .route("/healthz", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {}: {}", listen_addr, err);
            return;
        }
    };
    println!("Timeline service listening on {}", listen_addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down gracefully...");
        })
        .await;
    if let Err(err) = serve_result {
        eprintln!("server error: {}", err);
    }

    worker.request_shutdown();
    hub.shutdown();
    let _ = worker_handle.await;
    println!("Timeline service stopped.");
}
