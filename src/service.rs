//! Timeline service façade
//!
//! The entry point the transport layer talks to. Authorizes callers from
//! request metadata, resolves the effective config, admits through the rate
//! limiter, then serves from cache or assembles a fresh slate. Write events
//! from upstream services enter the fan-out queue here.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::assembler::SlateAssembler;
use crate::cache::TimelineCache;
use crate::clock::{new_correlation_id, ServiceClock};
use crate::config::{cache as cache_tuning, engagement, upstream};
use crate::fanout::FanoutQueue;
use crate::filter::DropReason;
use crate::live_hub::{LiveUpdateHub, StreamSession};
use crate::models::{
    ContentSource, EngagementAction, EngagementProfile, FanoutEvent, Note, PageInfo, Pagination,
    RankingSignals, ResponseMetadata, Slate, SlateItem, TimelinePage, TimelineUpdate,
    TimelineUpdateKind,
};
use crate::observability::ObservabilityManager;
use crate::ranking::{sort_by_score, OverdriveRanker, RankingEngine};
use crate::rate_limiter::RateLimiter;
use crate::resolver::{ConfigResolver, RequestMetadata, TimelineAlgorithm, TimelinePreferences, ViewerConfig};
use crate::sources::{FollowingAdapter, NoteService};
use crate::storage::{PreferencesStore, StorageError};

/// Errors returned by the façade. Degraded builds are not errors; they
/// surface through response metadata instead.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Timeline read request
#[derive(Debug, Clone, Default)]
pub struct GetTimelineRequest {
    pub viewer_id: String,
    pub algorithm: Option<TimelineAlgorithm>,
    pub pagination: Pagination,
    pub include_signals: bool,
    pub metadata: RequestMetadata,
}

/// Author-page timeline request
#[derive(Debug, Clone)]
pub struct GetUserTimelineRequest {
    pub target_id: String,
    pub requester_id: String,
    pub pagination: Pagination,
    pub include_replies: bool,
    pub include_reposts: bool,
    pub metadata: RequestMetadata,
}

/// Forced refresh request
#[derive(Debug, Clone)]
pub struct RefreshTimelineRequest {
    pub viewer_id: String,
    pub since: Option<DateTime<Utc>>,
    pub max_items: Option<usize>,
    pub metadata: RequestMetadata,
}

/// Engagement report from the client
#[derive(Debug, Clone)]
pub struct RecordEngagementRequest {
    pub viewer_id: String,
    pub note_id: String,
    pub action: String,
    pub duration_seconds: f64,
    pub metadata: RequestMetadata,
}

/// Component status returned by the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub fanout_queue_depth: usize,
    pub open_stream_sessions: usize,
    pub tracked_rate_keys: usize,
}

/// The assembled timeline service
pub struct TimelineService {
    clock: ServiceClock,
    cache: Arc<TimelineCache>,
    assembler: Arc<SlateAssembler>,
    ranking: Arc<RankingEngine>,
    limiter: RateLimiter,
    hub: Arc<LiveUpdateHub>,
    fanout_queue: Arc<FanoutQueue>,
    prefs: Arc<dyn PreferencesStore>,
    notes: Arc<dyn NoteService>,
    following_adapter: Arc<FollowingAdapter>,
    overdrive: Option<Arc<dyn OverdriveRanker>>,
    observability: Arc<ObservabilityManager>,
    /// Optional shared-secret gate; when set, every request must carry it
    service_token: Option<String>,
    /// Per-viewer write locks for engagement profile read-modify-write
    profile_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TimelineService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: ServiceClock,
        cache: Arc<TimelineCache>,
        assembler: Arc<SlateAssembler>,
        ranking: Arc<RankingEngine>,
        limiter: RateLimiter,
        hub: Arc<LiveUpdateHub>,
        fanout_queue: Arc<FanoutQueue>,
        prefs: Arc<dyn PreferencesStore>,
        notes: Arc<dyn NoteService>,
        following_adapter: Arc<FollowingAdapter>,
        overdrive: Option<Arc<dyn OverdriveRanker>>,
        observability: Arc<ObservabilityManager>,
        service_token: Option<String>,
    ) -> Self {
        Self {
            clock,
            cache,
            assembler,
            ranking,
            limiter,
            hub,
            fanout_queue,
            prefs,
            notes,
            following_adapter,
            overdrive,
            observability,
            service_token,
            profile_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    // ---- timeline reads -------------------------------------------------

    /// Personalized home timeline
    pub async fn get_timeline(&self, req: GetTimelineRequest) -> Result<TimelinePage, TimelineError> {
        self.validate_viewer(&req.viewer_id, &req.pagination)?;
        self.authorize(&req.metadata, &req.viewer_id)?;
        self.admit("timeline", &req.viewer_id, &req.metadata)?;

        let prefs = self.load_preferences(&req.viewer_id).await;
        let config = ConfigResolver::resolve(prefs.as_ref(), &req.metadata, req.algorithm);
        self.serve(&req.viewer_id, config, &req.metadata, req.pagination, req.include_signals, true)
            .await
    }

    /// For You: all sources mixed, discovery share override honored
    pub async fn get_for_you_timeline(
        &self,
        req: GetTimelineRequest,
    ) -> Result<TimelinePage, TimelineError> {
        self.validate_viewer(&req.viewer_id, &req.pagination)?;
        self.authorize(&req.metadata, &req.viewer_id)?;
        self.admit("timeline", &req.viewer_id, &req.metadata)?;

        let prefs = self.load_preferences(&req.viewer_id).await;
        let config = ConfigResolver::resolve_for_you(prefs.as_ref(), &req.metadata);
        self.serve(&req.viewer_id, config, &req.metadata, req.pagination, req.include_signals, true)
            .await
    }

    /// Following: chronological, followed authors only. Never cached, the
    /// build touches a single source.
    pub async fn get_following_timeline(
        &self,
        req: GetTimelineRequest,
    ) -> Result<TimelinePage, TimelineError> {
        self.validate_viewer(&req.viewer_id, &req.pagination)?;
        self.authorize(&req.metadata, &req.viewer_id)?;
        self.admit("timeline", &req.viewer_id, &req.metadata)?;

        let prefs = self.load_preferences(&req.viewer_id).await;
        let config = ConfigResolver::resolve_following(prefs.as_ref(), &req.metadata);
        self.serve(&req.viewer_id, config, &req.metadata, req.pagination, req.include_signals, false)
            .await
    }

    /// Ranked notes authored by one target, visibility-filtered for the
    /// requester.
    pub async fn get_user_timeline(
        &self,
        req: GetUserTimelineRequest,
    ) -> Result<TimelinePage, TimelineError> {
        if req.target_id.is_empty() {
            return Err(TimelineError::InvalidArgument("missing target_id".to_string()));
        }
        self.validate_viewer(&req.requester_id, &req.pagination)?;
        self.authorize(&req.metadata, &req.requester_id)?;
        self.admit("user_timeline", &req.requester_id, &req.metadata)?;

        let now = self.clock.now();
        let correlation_id = new_correlation_id();
        let since = now - chrono::Duration::hours(upstream::USER_TIMELINE_LOOKBACK_HOURS);

        let authors = vec![req.target_id.clone()];
        let notes = match self
            .notes
            .get_recent_by_authors(&authors, since, crate::config::defaults::MAX_ITEMS)
            .await
        {
            Ok(notes) => notes,
            Err(err) => {
                self.observability.warn(
                    "service",
                    &format!("user timeline source failed: {}", err),
                );
                Vec::new()
            }
        };

        let followed = self.follow_set_or_empty(&req.requester_id).await;
        let visible: Vec<Note> = notes
            .into_iter()
            .filter(|note| {
                visible_to_requester(note, &req.requester_id, &req.target_id, &followed)
            })
            .filter(|note| req.include_replies || !note.is_reply)
            .filter(|note| req.include_reposts || !note.is_repost)
            .collect();

        let profile = self.get_or_create_profile(&req.requester_id).await;
        let config = ViewerConfig::default();
        let candidates = visible.into_iter().map(|n| (n, ContentSource::Following)).collect();
        let mut items = self
            .ranking
            .score_notes(candidates, &profile, &followed, &config, now);
        sort_by_score(&mut items);

        let slate = Slate { items, generated_at: now };
        self.check_order_invariant(&slate, &req.requester_id, &correlation_id)?;

        let metadata = ResponseMetadata {
            generated_at: now,
            algorithm: config.algorithm.as_str().to_string(),
            degraded_sources: Vec::new(),
            from_cache: false,
            unread_count: 0,
            correlation_id,
        };
        Ok(paginate(&slate, req.pagination, config.max_items, true, metadata))
    }

    /// Invalidate and rebuild, restricted to items newer than `since`, then
    /// tell live subscribers about the fresh items.
    pub async fn refresh_timeline(
        &self,
        req: RefreshTimelineRequest,
    ) -> Result<TimelinePage, TimelineError> {
        self.validate_viewer(&req.viewer_id, &Pagination::default())?;
        self.authorize(&req.metadata, &req.viewer_id)?;
        self.admit("refresh", &req.viewer_id, &req.metadata)?;

        let now = self.clock.now();
        let correlation_id = new_correlation_id();
        self.cache.invalidate_slate(&req.viewer_id).await;

        let prefs = self.load_preferences(&req.viewer_id).await;
        let mut config = ConfigResolver::resolve(prefs.as_ref(), &req.metadata, None);
        if let Some(max_items) = req.max_items {
            if max_items > 0 {
                config.max_items = max_items.min(config.max_items);
            }
        }

        let profile = self.get_or_create_profile(&req.viewer_id).await;
        let followed = self.follow_set_or_empty(&req.viewer_id).await;
        let outcome = self
            .assembler
            .build(&req.viewer_id, &profile, &followed, &config, req.since, now)
            .await;
        self.record_build_metrics(&outcome.filtered, &outcome.degraded_sources);

        let mut slate = outcome.slate;
        if req.metadata.use_overdrive() {
            self.apply_overdrive(&req.viewer_id, &mut slate).await;
        }
        self.check_order_invariant(&slate, &req.viewer_id, &correlation_id)?;
        self.cache
            .set_slate(&req.viewer_id, &slate, Duration::from_secs(cache_tuning::SLATE_TTL_SECS))
            .await;

        // delta push so connected clients converge without a refetch
        for item in &slate.items {
            let update = TimelineUpdate {
                kind: TimelineUpdateKind::Refreshed,
                note_id: Some(item.note.id.clone()),
                author_id: Some(item.note.author_id.clone()),
                timestamp: now,
            };
            self.hub.publish(&req.viewer_id, &update);
        }

        let unread_count = self.unread_count(&req.viewer_id, &slate).await;
        let metadata = ResponseMetadata {
            generated_at: now,
            algorithm: config.algorithm.as_str().to_string(),
            degraded_sources: outcome.degraded_sources,
            from_cache: false,
            unread_count,
            correlation_id,
        };
        Ok(paginate(&slate, Pagination::default(), config.max_items, false, metadata))
    }

    // ---- reads and writes around the timeline ---------------------------

    pub async fn mark_timeline_read(
        &self,
        viewer_id: &str,
        read_until: DateTime<Utc>,
        metadata: &RequestMetadata,
    ) -> Result<(), TimelineError> {
        if viewer_id.is_empty() {
            return Err(TimelineError::InvalidArgument("missing viewer_id".to_string()));
        }
        self.authorize(metadata, viewer_id)?;
        self.cache.set_last_read(viewer_id, read_until).await;
        Ok(())
    }

    pub async fn get_last_read(&self, viewer_id: &str) -> Option<DateTime<Utc>> {
        self.cache.get_last_read(viewer_id).await
    }

    pub async fn update_preferences(
        &self,
        viewer_id: &str,
        prefs: TimelinePreferences,
        metadata: &RequestMetadata,
    ) -> Result<(), TimelineError> {
        if viewer_id.is_empty() {
            return Err(TimelineError::InvalidArgument("missing viewer_id".to_string()));
        }
        self.authorize(metadata, viewer_id)?;
        self.prefs.save(viewer_id, &prefs).await?;
        // the viewer's effective config changed; cached slates are stale
        self.cache.invalidate_slate(viewer_id).await;
        Ok(())
    }

    pub async fn get_preferences(
        &self,
        viewer_id: &str,
        metadata: &RequestMetadata,
    ) -> Result<Option<TimelinePreferences>, TimelineError> {
        if viewer_id.is_empty() {
            return Err(TimelineError::InvalidArgument("missing viewer_id".to_string()));
        }
        self.authorize(metadata, viewer_id)?;
        Ok(self.prefs.fetch(viewer_id).await?)
    }

    /// Fold one engagement action into the viewer's profile and the global
    /// author reputation. Affinity learning saturates at 1.
    pub async fn record_engagement(
        &self,
        req: RecordEngagementRequest,
    ) -> Result<(), TimelineError> {
        if req.viewer_id.is_empty() {
            return Err(TimelineError::InvalidArgument("missing viewer_id".to_string()));
        }
        let action = EngagementAction::parse(&req.action).ok_or_else(|| {
            TimelineError::InvalidArgument(format!("unknown action: {}", req.action))
        })?;
        self.authorize(&req.metadata, &req.viewer_id)?;

        let note = match self.notes.get_note(&req.note_id).await {
            Ok(Some(note)) => note,
            Ok(None) => {
                // the note may have raced a delete; nothing to learn from
                self.observability.increment("engagement_unknown_note");
                return Ok(());
            }
            Err(err) => {
                self.observability
                    .warn("service", &format!("note lookup failed: {}", err));
                return Ok(());
            }
        };

        let lock = self.profile_lock(&req.viewer_id);
        let _guard = lock.lock().await;

        let mut profile = self.get_or_create_profile(&req.viewer_id).await;
        apply_engagement(&mut profile, &note, action, req.duration_seconds, self.clock.now());
        self.cache.set_profile(&profile).await;

        if matches!(
            action,
            EngagementAction::Like
                | EngagementAction::Repost
                | EngagementAction::Reply
                | EngagementAction::Follow
        ) {
            self.ranking
                .record_author_reputation(&note.author_id, engagement::GLOBAL_REPUTATION_DELTA);
        }
        self.observability.increment("engagement_events");
        Ok(())
    }

    /// Open a live update stream for the viewer
    pub fn subscribe_timeline_updates(
        &self,
        viewer_id: &str,
        metadata: &RequestMetadata,
    ) -> Result<Arc<StreamSession>, TimelineError> {
        if viewer_id.is_empty() {
            return Err(TimelineError::InvalidArgument("missing viewer_id".to_string()));
        }
        self.authorize(metadata, viewer_id)?;
        self.admit("subscribe", viewer_id, metadata)?;
        self.observability.increment("stream_subscriptions");
        Ok(self.hub.subscribe(viewer_id))
    }

    // ---- write event ingestion ------------------------------------------

    pub fn on_note_created(&self, note: Note) {
        self.enqueue_event(FanoutEvent::NoteCreated { note });
    }

    pub fn on_note_updated(&self, note: Note) {
        self.enqueue_event(FanoutEvent::NoteUpdated { note });
    }

    pub fn on_note_deleted(&self, note_id: &str, author_id: &str) {
        self.enqueue_event(FanoutEvent::NoteDeleted {
            note_id: note_id.to_string(),
            author_id: author_id.to_string(),
        });
    }

    pub fn on_follow_changed(&self, follower_id: &str, following_id: &str, is_follow: bool) {
        self.enqueue_event(FanoutEvent::FollowChanged {
            follower_id: follower_id.to_string(),
            following_id: following_id.to_string(),
            is_follow,
        });
    }

    fn enqueue_event(&self, event: FanoutEvent) {
        let dropped = self.fanout_queue.enqueue(event);
        if dropped > 0 {
            self.observability.increment_by("fanout_queue_overflow", dropped as u64);
        }
        self.observability.increment("fanout_events_received");
    }

    // ---- introspection ---------------------------------------------------

    pub fn health_check(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            uptime_secs: self.clock.uptime_secs(),
            fanout_queue_depth: self.fanout_queue.len(),
            open_stream_sessions: self.hub.open_sessions(),
            tracked_rate_keys: self.limiter.tracked_keys(),
        }
    }

    pub fn stats(&self) -> crate::observability::MetricsSnapshot {
        self.observability.snapshot()
    }

    // ---- internals -------------------------------------------------------

    /// Shared read path: cache lookup, assembly on miss, pagination
    async fn serve(
        &self,
        viewer_id: &str,
        config: ViewerConfig,
        metadata: &RequestMetadata,
        pagination: Pagination,
        include_signals: bool,
        use_cache: bool,
    ) -> Result<TimelinePage, TimelineError> {
        let now = self.clock.now();
        let correlation_id = new_correlation_id();
        self.observability.increment("timeline_requests");

        if use_cache {
            if let Some(slate) = self.cache.get_slate(viewer_id).await {
                self.observability.increment("cache_hits");
                let unread_count = self.unread_count(viewer_id, &slate).await;
                let response_metadata = ResponseMetadata {
                    generated_at: slate.generated_at,
                    algorithm: config.algorithm.as_str().to_string(),
                    degraded_sources: Vec::new(),
                    from_cache: true,
                    unread_count,
                    correlation_id,
                };
                return Ok(paginate(&slate, pagination, config.max_items, include_signals, response_metadata));
            }
            self.observability.increment("cache_misses");
        }

        let profile = self.get_or_create_profile(viewer_id).await;
        let followed = self.follow_set_or_empty(viewer_id).await;
        let outcome = self
            .assembler
            .build(viewer_id, &profile, &followed, &config, None, now)
            .await;
        self.record_build_metrics(&outcome.filtered, &outcome.degraded_sources);

        let mut slate = outcome.slate;
        if metadata.use_overdrive() {
            self.apply_overdrive(viewer_id, &mut slate).await;
        }
        self.check_order_invariant(&slate, viewer_id, &correlation_id)?;

        if use_cache {
            self.cache
                .set_slate(viewer_id, &slate, Duration::from_secs(cache_tuning::SLATE_TTL_SECS))
                .await;
        }

        let unread_count = self.unread_count(viewer_id, &slate).await;
        let response_metadata = ResponseMetadata {
            generated_at: now,
            algorithm: config.algorithm.as_str().to_string(),
            degraded_sources: outcome.degraded_sources,
            from_cache: false,
            unread_count,
            correlation_id,
        };
        Ok(paginate(&slate, pagination, config.max_items, include_signals, response_metadata))
    }

    fn validate_viewer(&self, viewer_id: &str, _pagination: &Pagination) -> Result<(), TimelineError> {
        if viewer_id.is_empty() {
            return Err(TimelineError::InvalidArgument("missing viewer_id".to_string()));
        }
        Ok(())
    }

    /// The authorization rule: an optional service token gate, then the
    /// caller-matches-viewer check with an admin bypass.
    fn authorize(&self, metadata: &RequestMetadata, viewer_id: &str) -> Result<(), TimelineError> {
        if let Some(expected) = &self.service_token {
            if metadata.auth_token() != Some(expected.as_str()) {
                self.observability.increment("auth_failures");
                return Err(TimelineError::Unauthorized);
            }
        }
        if let Some(caller) = metadata.caller_id() {
            if caller != viewer_id && !metadata.is_admin() {
                self.observability.increment("auth_failures");
                return Err(TimelineError::Unauthorized);
            }
        }
        Ok(())
    }

    fn admit(
        &self,
        endpoint: &str,
        viewer_id: &str,
        metadata: &RequestMetadata,
    ) -> Result<(), TimelineError> {
        let key = format!("{}:{}", endpoint, viewer_id);
        if self.limiter.allow(&key, metadata.rate_rpm()) {
            Ok(())
        } else {
            self.observability.increment("rate_limited");
            Err(TimelineError::RateLimited)
        }
    }

    async fn load_preferences(&self, viewer_id: &str) -> Option<TimelinePreferences> {
        match self.prefs.fetch(viewer_id).await {
            Ok(prefs) => prefs,
            Err(err) => {
                self.observability
                    .warn("service", &format!("preference fetch failed: {}", err));
                None
            }
        }
    }

    async fn get_or_create_profile(&self, viewer_id: &str) -> EngagementProfile {
        match self.cache.get_profile(viewer_id).await {
            Some(profile) => profile,
            None => {
                let profile = EngagementProfile::new(viewer_id, self.clock.now());
                self.cache.set_profile(&profile).await;
                profile
            }
        }
    }

    async fn follow_set_or_empty(&self, viewer_id: &str) -> HashSet<String> {
        match self.following_adapter.follow_set(viewer_id).await {
            Ok(set) => set.into_iter().collect(),
            Err(_) => HashSet::new(),
        }
    }

    async fn unread_count(&self, viewer_id: &str, slate: &Slate) -> usize {
        match self.cache.get_last_read(viewer_id).await {
            Some(last_read) => slate
                .items
                .iter()
                .filter(|item| item.note.created_at > last_read)
                .count(),
            None => slate.len(),
        }
    }

    /// Replace local scores with the external ranker's and re-stabilize
    async fn apply_overdrive(&self, viewer_id: &str, slate: &mut Slate) {
        let Some(ranker) = &self.overdrive else {
            return;
        };
        let ids: Vec<String> = slate.items.iter().map(|item| item.note.id.clone()).collect();
        if ids.is_empty() {
            return;
        }
        match ranker.rank_for_you(viewer_id, &ids, ids.len()).await {
            Ok(ranked) => {
                let scores: HashMap<String, f64> =
                    ranked.into_iter().map(|r| (r.note_id, r.score)).collect();
                for item in &mut slate.items {
                    if let Some(score) = scores.get(&item.note.id) {
                        item.final_score = *score;
                        item.injection_reason = "overdrive".to_string();
                    }
                }
                sort_by_score(&mut slate.items);
                self.observability.increment("overdrive_rankings");
            }
            Err(err) => {
                self.observability
                    .warn("service", &format!("overdrive ranker failed: {}", err));
                self.observability.increment("overdrive_failures");
            }
        }
    }

    /// Invariant: non-increasing scores, none negative. A violation is an
    /// internal error, logged with the viewer and correlation id.
    fn check_order_invariant(
        &self,
        slate: &Slate,
        viewer_id: &str,
        correlation_id: &str,
    ) -> Result<(), TimelineError> {
        let ordered = slate
            .items
            .windows(2)
            .all(|pair| pair[0].final_score >= pair[1].final_score);
        let non_negative = slate.items.iter().all(|item| item.final_score >= 0.0);
        if ordered && non_negative {
            return Ok(());
        }
        self.observability.error(
            "service",
            "slate ordering invariant violated",
            Some(viewer_id),
            Some(correlation_id),
        );
        Err(TimelineError::Internal("slate ordering invariant violated".to_string()))
    }

    fn record_build_metrics(&self, filtered: &[DropReason], degraded: &[ContentSource]) {
        self.observability.increment("slates_built");
        for reason in filtered {
            self.observability
                .increment(&format!("filtered_{}", reason.as_str()));
        }
        for source in degraded {
            self.observability
                .increment(&format!("degraded_{}", source.as_str()));
        }
    }

    fn profile_lock(&self, viewer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.profile_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(viewer_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Visibility rule for author-page timelines: public always passes,
/// followers-only requires the requester to follow the author, private is
/// author-only.
fn visible_to_requester(
    note: &Note,
    requester_id: &str,
    target_id: &str,
    requester_follows: &HashSet<String>,
) -> bool {
    use crate::models::NoteVisibility;
    match note.visibility {
        NoteVisibility::Public => true,
        NoteVisibility::FollowersOnly => {
            requester_id == target_id || requester_follows.contains(&note.author_id)
        }
        NoteVisibility::Private => requester_id == target_id,
    }
}

/// Apply one engagement action to a profile
fn apply_engagement(
    profile: &mut EngagementProfile,
    note: &Note,
    action: EngagementAction,
    duration_seconds: f64,
    now: DateTime<Utc>,
) {
    let affinity_delta = match action {
        EngagementAction::Like => engagement::LIKE_AFFINITY_DELTA,
        EngagementAction::Repost => engagement::REPOST_AFFINITY_DELTA,
        EngagementAction::Reply => engagement::REPLY_AFFINITY_DELTA,
        EngagementAction::Follow => engagement::FOLLOW_AFFINITY_DELTA,
        EngagementAction::Skip => -0.02,
        EngagementAction::Hide => -0.10,
        EngagementAction::View => 0.0,
    };
    if affinity_delta != 0.0 {
        let entry = profile
            .author_affinity
            .entry(note.author_id.clone())
            .or_insert(0.0);
        *entry = (*entry + affinity_delta).clamp(0.0, 1.0);
    }

    if matches!(
        action,
        EngagementAction::Like | EngagementAction::Repost | EngagementAction::Reply
    ) {
        for tag in &note.hashtags {
            let entry = profile.hashtag_interests.entry(tag.clone()).or_insert(0.0);
            *entry = (*entry + engagement::HASHTAG_INTEREST_DELTA).clamp(0.0, 1.0);
        }
    }

    if action == EngagementAction::View && duration_seconds > 0.0 {
        // crude rolling blend keeps the average stable without history
        let minutes = duration_seconds / 60.0;
        profile.avg_session_length_minutes =
            profile.avg_session_length_minutes * 0.9 + minutes * 0.1;
    }

    profile.interactions_per_day = profile.interactions_per_day.saturating_add(1);
    profile.last_updated = now;
}

/// Clamp the window into the slate and emit a page. `has_next` is false
/// whenever the page itself is empty.
fn paginate(
    slate: &Slate,
    pagination: Pagination,
    max_items: usize,
    include_signals: bool,
    metadata: ResponseMetadata,
) -> TimelinePage {
    let total = slate.len();
    let offset = pagination.offset.min(total);
    let limit = pagination.limit.min(max_items);
    let end = offset.saturating_add(limit).min(total);

    let mut items: Vec<SlateItem> = slate.items[offset..end].to_vec();
    if !include_signals {
        for item in &mut items {
            item.signals = RankingSignals::default();
        }
    }

    let has_next = !items.is_empty() && offset + limit < total;
    TimelinePage {
        items,
        pagination: PageInfo { offset, limit, total, has_next },
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NoteMetrics, NoteVisibility};

    fn sample_note(id: &str, author: &str) -> Note {
        Note {
            id: id.to_string(),
            author_id: author.to_string(),
            created_at: Utc::now(),
            visibility: NoteVisibility::Public,
            content: "note".to_string(),
            metrics: NoteMetrics::default(),
            media: vec![],
            hashtags: vec!["rust".to_string()],
            is_reply: false,
            is_repost: false,
        }
    }

    fn slate_of(n: usize) -> Slate {
        let items = (0..n)
            .map(|i| SlateItem {
                note: sample_note(&format!("n{}", i), "a"),
                source: ContentSource::Following,
                signals: RankingSignals { recency: 0.5, ..Default::default() },
                final_score: 1.0 - i as f64 * 0.01,
                injected_at: Utc::now(),
                injection_reason: "ranked".to_string(),
            })
            .collect();
        Slate { items, generated_at: Utc::now() }
    }

    fn metadata() -> ResponseMetadata {
        ResponseMetadata {
            generated_at: Utc::now(),
            algorithm: "hybrid".to_string(),
            degraded_sources: vec![],
            from_cache: false,
            unread_count: 0,
            correlation_id: "corr_test".to_string(),
        }
    }

    #[test]
    fn test_paginate_window_and_has_next() {
        let slate = slate_of(30);
        let page = paginate(&slate, Pagination { offset: 0, limit: 20 }, 50, true, metadata());
        assert_eq!(page.items.len(), 20);
        assert!(page.pagination.has_next);

        let page = paginate(&slate, Pagination { offset: 20, limit: 20 }, 50, true, metadata());
        assert_eq!(page.items.len(), 10);
        assert!(!page.pagination.has_next);
    }

    #[test]
    fn test_paginate_zero_limit_is_empty_without_next() {
        let slate = slate_of(5);
        let page = paginate(&slate, Pagination { offset: 0, limit: 0 }, 50, true, metadata());
        assert!(page.items.is_empty());
        assert!(!page.pagination.has_next);
    }

    #[test]
    fn test_paginate_offset_past_end() {
        let slate = slate_of(5);
        let page = paginate(&slate, Pagination { offset: 99, limit: 20 }, 50, true, metadata());
        assert!(page.items.is_empty());
        assert!(!page.pagination.has_next);
        assert_eq!(page.pagination.offset, 5);
    }

    #[test]
    fn test_paginate_limit_bounded_by_max_items() {
        let slate = slate_of(40);
        let page = paginate(&slate, Pagination { offset: 0, limit: 500 }, 25, true, metadata());
        assert_eq!(page.items.len(), 25);
    }

    #[test]
    fn test_paginate_strips_signals_when_not_requested() {
        let slate = slate_of(3);
        let page = paginate(&slate, Pagination::default(), 50, false, metadata());
        assert!(page.items.iter().all(|item| item.signals.recency == 0.0));
    }

    #[test]
    fn test_visibility_rule() {
        let mut note = sample_note("n1", "target");
        let mut follows = HashSet::new();

        note.visibility = NoteVisibility::Public;
        assert!(visible_to_requester(&note, "someone", "target", &follows));

        note.visibility = NoteVisibility::FollowersOnly;
        assert!(!visible_to_requester(&note, "someone", "target", &follows));
        follows.insert("target".to_string());
        assert!(visible_to_requester(&note, "someone", "target", &follows));
        assert!(visible_to_requester(&note, "target", "target", &HashSet::new()));

        note.visibility = NoteVisibility::Private;
        assert!(!visible_to_requester(&note, "someone", "target", &follows));
        assert!(visible_to_requester(&note, "target", "target", &follows));
    }

    #[test]
    fn test_apply_engagement_saturates_affinity() {
        let mut profile = EngagementProfile::new("v1", Utc::now());
        let note = sample_note("n1", "author");
        for _ in 0..30 {
            apply_engagement(&mut profile, &note, EngagementAction::Like, 0.0, Utc::now());
        }
        assert!((profile.author_affinity["author"] - 1.0).abs() < 1e-9);
        // hashtag interest learned alongside
        assert!(profile.hashtag_interests["rust"] > 0.0);
    }

    #[test]
    fn test_apply_engagement_hide_decreases_affinity() {
        let mut profile = EngagementProfile::new("v1", Utc::now());
        let note = sample_note("n1", "author");
        apply_engagement(&mut profile, &note, EngagementAction::Follow, 0.0, Utc::now());
        let before = profile.author_affinity["author"];
        apply_engagement(&mut profile, &note, EngagementAction::Hide, 0.0, Utc::now());
        assert!(profile.author_affinity["author"] < before);
        // never below zero
        for _ in 0..10 {
            apply_engagement(&mut profile, &note, EngagementAction::Hide, 0.0, Utc::now());
        }
        assert!(profile.author_affinity["author"] >= 0.0);
    }
}
