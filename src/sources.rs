//! Content source adapters
//!
//! One adapter per content source. Adapters talk to the external note
//! service and follow graph through narrow async traits so tests can mock
//! them. A failing adapter contributes zero notes; the assembler records it
//! as degraded instead of aborting the build.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::{cache, upstream};
use crate::models::{ContentSource, EngagementProfile, Note};

/// Failure surfaced by an external call
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("upstream timeout")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Narrow view of the external note service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NoteService: Send + Sync {
    /// Recent notes by any of the given authors, newest first
    async fn get_recent_by_authors(
        &self,
        author_ids: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError>;

    /// Recent notes correlated with the given hashtags, newest first
    async fn get_recent_by_interests(
        &self,
        hashtags: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError>;

    /// Notes in the top engagement-velocity band since the given time
    async fn get_trending(&self, since: DateTime<Utc>, limit: usize)
        -> Result<Vec<Note>, SourceError>;

    /// Single note lookup, used when recording engagement
    async fn get_note(&self, note_id: &str) -> Result<Option<Note>, SourceError>;
}

/// Narrow view of the external follow graph
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FollowGraph: Send + Sync {
    async fn get_following(&self, viewer_id: &str) -> Result<Vec<String>, SourceError>;

    async fn get_followers(&self, author_id: &str) -> Result<Vec<String>, SourceError>;

    /// Members of the viewer's curated lists
    async fn get_list_members(&self, viewer_id: &str) -> Result<Vec<String>, SourceError>;
}

/// One content source feeding the slate assembler
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> ContentSource;

    async fn get_content(
        &self,
        viewer_id: &str,
        profile: &EngagementProfile,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError>;
}

/// Followed-author content, the chronological backbone of the timeline
pub struct FollowingAdapter {
    notes: Arc<dyn NoteService>,
    follows: Arc<dyn FollowGraph>,
    /// viewer_id -> (fetched_at, follow set); short TTL micro cache
    follow_cache: RwLock<HashMap<String, (Instant, Vec<String>)>>,
}

impl FollowingAdapter {
    pub fn new(notes: Arc<dyn NoteService>, follows: Arc<dyn FollowGraph>) -> Self {
        Self {
            notes,
            follows,
            follow_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Follow set with a short-TTL cache in front of the follow graph
    pub async fn follow_set(&self, viewer_id: &str) -> Result<Vec<String>, SourceError> {
        {
            let cached = self.follow_cache.read().await;
            if let Some((fetched_at, set)) = cached.get(viewer_id) {
                if fetched_at.elapsed().as_secs() < cache::FOLLOW_SET_TTL_SECS {
                    return Ok(set.clone());
                }
            }
        }

        let set = self.follows.get_following(viewer_id).await?;
        let mut cached = self.follow_cache.write().await;
        cached.insert(viewer_id.to_string(), (Instant::now(), set.clone()));
        Ok(set)
    }

    /// Drop the cached follow set after a follow-graph change
    pub async fn invalidate_follow_set(&self, viewer_id: &str) {
        self.follow_cache.write().await.remove(viewer_id);
    }
}

#[async_trait]
impl SourceAdapter for FollowingAdapter {
    fn source(&self) -> ContentSource {
        ContentSource::Following
    }

    async fn get_content(
        &self,
        viewer_id: &str,
        _profile: &EngagementProfile,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError> {
        let authors = self.follow_set(viewer_id).await?;
        if authors.is_empty() {
            return Ok(Vec::new());
        }
        let mut notes = self.notes.get_recent_by_authors(&authors, since, limit).await?;
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notes.truncate(limit);
        Ok(notes)
    }
}

/// Algorithmic recommendations driven by the engagement profile
pub struct RecommendedAdapter {
    notes: Arc<dyn NoteService>,
}

impl RecommendedAdapter {
    pub fn new(notes: Arc<dyn NoteService>) -> Self {
        Self { notes }
    }
}

#[async_trait]
impl SourceAdapter for RecommendedAdapter {
    fn source(&self) -> ContentSource {
        ContentSource::Recommended
    }

    async fn get_content(
        &self,
        _viewer_id: &str,
        profile: &EngagementProfile,
        _since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError> {
        // Recommendation lookback is wider than the request window; the
        // assembler re-applies the age window when it walks candidates.
        let lookback = Utc::now() - Duration::hours(upstream::RECOMMENDED_LOOKBACK_HOURS);

        let interests = profile.top_hashtags(10);
        let affinity_authors = profile.top_authors(0.3, 10);

        let mut notes = Vec::new();
        if !interests.is_empty() {
            notes.extend(
                self.notes
                    .get_recent_by_interests(&interests, lookback, limit)
                    .await?,
            );
        }
        if !affinity_authors.is_empty() && notes.len() < limit {
            let remaining = limit - notes.len();
            notes.extend(
                self.notes
                    .get_recent_by_authors(&affinity_authors, lookback, remaining)
                    .await?,
            );
        }
        notes.truncate(limit);
        Ok(notes)
    }
}

/// Globally trending content over the last few hours
pub struct TrendingAdapter {
    notes: Arc<dyn NoteService>,
}

impl TrendingAdapter {
    pub fn new(notes: Arc<dyn NoteService>) -> Self {
        Self { notes }
    }
}

#[async_trait]
impl SourceAdapter for TrendingAdapter {
    fn source(&self) -> ContentSource {
        ContentSource::Trending
    }

    async fn get_content(
        &self,
        _viewer_id: &str,
        _profile: &EngagementProfile,
        _since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError> {
        let since = Utc::now() - Duration::hours(upstream::TRENDING_LOOKBACK_HOURS);
        self.notes.get_trending(since, limit).await
    }
}

/// Notes authored by members of the viewer's curated lists
pub struct ListsAdapter {
    notes: Arc<dyn NoteService>,
    follows: Arc<dyn FollowGraph>,
}

impl ListsAdapter {
    pub fn new(notes: Arc<dyn NoteService>, follows: Arc<dyn FollowGraph>) -> Self {
        Self { notes, follows }
    }
}

#[async_trait]
impl SourceAdapter for ListsAdapter {
    fn source(&self) -> ContentSource {
        ContentSource::Lists
    }

    async fn get_content(
        &self,
        viewer_id: &str,
        _profile: &EngagementProfile,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, SourceError> {
        let members = self.follows.get_list_members(viewer_id).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }
        self.notes.get_recent_by_authors(&members, since, limit).await
    }
}
