//! Core data model for the timeline service
//!
//! Notes are borrowed from the external note service and never mutated here;
//! everything else in this module is owned by the timeline core.

use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Utc};

/// Engagement counters attached to a note by the note service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteMetrics {
    pub views: u64,
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub quotes: u64,
}

impl NoteMetrics {
    /// Sum of all active engagement counters (views excluded)
    pub fn total_engagements(&self) -> u64 {
        self.likes + self.reposts + self.replies + self.quotes
    }

    /// Engagements per view, with views floored at 1
    pub fn engagement_rate(&self) -> f64 {
        self.total_engagements() as f64 / (self.views.max(1)) as f64
    }
}

/// Note visibility as asserted by the note service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteVisibility {
    Public,
    FollowersOnly,
    Private,
}

/// A post as delivered by the note service. Immutable during a slate build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub visibility: NoteVisibility,
    pub content: String,
    pub metrics: NoteMetrics,
    pub media: Vec<String>,
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub is_repost: bool,
}

impl Note {
    /// Age of the note in fractional hours, floored at zero
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.created_at).num_seconds();
        (secs.max(0) as f64) / 3600.0
    }
}

/// Provenance of a slate candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentSource {
    Following,
    Recommended,
    Trending,
    Lists,
}

impl ContentSource {
    /// Fixed merge order: Following first so dedup tie-breaks are stable
    pub const ALL: [ContentSource; 4] = [
        ContentSource::Following,
        ContentSource::Recommended,
        ContentSource::Trending,
        ContentSource::Lists,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentSource::Following => "following",
            ContentSource::Recommended => "recommended",
            ContentSource::Trending => "trending",
            ContentSource::Lists => "lists",
        }
    }
}

/// Per-candidate ranking signals, each normalized to [0, 1]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RankingSignals {
    pub author_affinity: f64,
    pub content_quality: f64,
    pub engagement_velocity: f64,
    pub recency: f64,
    pub personalization: f64,
}

/// One ranked entry of a slate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlateItem {
    pub note: Note,
    pub source: ContentSource,
    pub signals: RankingSignals,
    pub final_score: f64,
    pub injected_at: DateTime<Utc>,
    pub injection_reason: String,
}

/// The ordered, bounded list of items returned for one viewer at one moment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Slate {
    pub items: Vec<SlateItem>,
    pub generated_at: DateTime<Utc>,
}

impl Slate {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True if any item was authored by the given author
    pub fn contains_author(&self, author_id: &str) -> bool {
        self.items.iter().any(|item| item.note.author_id == author_id)
    }
}

/// Per-viewer learned state used to personalize ranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementProfile {
    pub viewer_id: String,
    /// author_id -> affinity score in [0, 1]
    pub author_affinity: HashMap<String, f64>,
    /// hashtag -> interest score in [0, 1]
    pub hashtag_interests: HashMap<String, f64>,
    /// topic -> interest score in [0, 1]
    pub topic_interests: HashMap<String, f64>,
    pub muted_authors: HashSet<String>,
    pub muted_keywords: HashSet<String>,
    pub last_updated: DateTime<Utc>,
    pub avg_session_length_minutes: f64,
    pub daily_engagement_score: f64,
    pub posts_per_day: u32,
    pub interactions_per_day: u32,
}

impl EngagementProfile {
    /// Fresh profile for a viewer seen for the first time
    pub fn new(viewer_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            viewer_id: viewer_id.to_string(),
            author_affinity: HashMap::new(),
            hashtag_interests: HashMap::new(),
            topic_interests: HashMap::new(),
            muted_authors: HashSet::new(),
            muted_keywords: HashSet::new(),
            last_updated: now,
            avg_session_length_minutes: 0.0,
            daily_engagement_score: 0.0,
            posts_per_day: 0,
            interactions_per_day: 0,
        }
    }

    /// Hashtags with the strongest learned interest, strongest first
    pub fn top_hashtags(&self, limit: usize) -> Vec<String> {
        let mut tags: Vec<(&String, &f64)> = self.hashtag_interests.iter().collect();
        tags.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        tags.into_iter().take(limit).map(|(tag, _)| tag.clone()).collect()
    }

    /// Authors with affinity at or above the threshold, strongest first
    pub fn top_authors(&self, threshold: f64, limit: usize) -> Vec<String> {
        let mut authors: Vec<(&String, &f64)> = self
            .author_affinity
            .iter()
            .filter(|(_, score)| **score >= threshold)
            .collect();
        authors.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        authors.into_iter().take(limit).map(|(author, _)| author.clone()).collect()
    }
}

/// Engagement action reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngagementAction {
    View,
    Like,
    Repost,
    Reply,
    Follow,
    Skip,
    Hide,
}

impl EngagementAction {
    /// Parses the action names accepted on the wire
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "view" => Some(EngagementAction::View),
            "like" => Some(EngagementAction::Like),
            "repost" => Some(EngagementAction::Repost),
            "reply" => Some(EngagementAction::Reply),
            "follow" => Some(EngagementAction::Follow),
            "skip" => Some(EngagementAction::Skip),
            "hide" => Some(EngagementAction::Hide),
            _ => None,
        }
    }
}

/// Write event consumed by the fan-out worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FanoutEvent {
    NoteCreated { note: Note },
    NoteUpdated { note: Note },
    NoteDeleted { note_id: String, author_id: String },
    FollowChanged { follower_id: String, following_id: String, is_follow: bool },
}

impl FanoutEvent {
    /// Author whose followers are affected by this event
    pub fn author_id(&self) -> &str {
        match self {
            FanoutEvent::NoteCreated { note } | FanoutEvent::NoteUpdated { note } => &note.author_id,
            FanoutEvent::NoteDeleted { author_id, .. } => author_id,
            FanoutEvent::FollowChanged { following_id, .. } => following_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FanoutEvent::NoteCreated { .. } => "note_created",
            FanoutEvent::NoteUpdated { .. } => "note_updated",
            FanoutEvent::NoteDeleted { .. } => "note_deleted",
            FanoutEvent::FollowChanged { .. } => "follow_changed",
        }
    }
}

/// Kind of message delivered over a live subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineUpdateKind {
    NoteCreated,
    NoteUpdated,
    NoteDeleted,
    Refreshed,
    Heartbeat,
}

/// One message delivered to a subscribed stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineUpdate {
    pub kind: TimelineUpdateKind,
    pub note_id: Option<String>,
    pub author_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TimelineUpdate {
    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            kind: TimelineUpdateKind::Heartbeat,
            note_id: None,
            author_id: None,
            timestamp: now,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == TimelineUpdateKind::Heartbeat
    }
}

/// Request pagination window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { offset: 0, limit: 20 }
    }
}

/// Pagination state echoed back with a page
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageInfo {
    pub offset: usize,
    pub limit: usize,
    pub total: usize,
    pub has_next: bool,
}

/// Build metadata attached to a returned timeline page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub generated_at: DateTime<Utc>,
    pub algorithm: String,
    /// Sources that failed or timed out during this build; empty when healthy
    pub degraded_sources: Vec<ContentSource>,
    pub from_cache: bool,
    pub unread_count: usize,
    pub correlation_id: String,
}

/// A page of a slate plus its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePage {
    pub items: Vec<SlateItem>,
    pub pagination: PageInfo,
    pub metadata: ResponseMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_note(id: &str, author: &str) -> Note {
        Note {
            id: id.to_string(),
            author_id: author.to_string(),
            created_at: Utc::now(),
            visibility: NoteVisibility::Public,
            content: "hello timeline".to_string(),
            metrics: NoteMetrics { views: 100, likes: 10, reposts: 2, replies: 3, quotes: 1 },
            media: vec![],
            hashtags: vec!["rust".to_string()],
            is_reply: false,
            is_repost: false,
        }
    }

    #[test]
    fn test_engagement_rate() {
        let note = sample_note("n1", "a1");
        assert_eq!(note.metrics.total_engagements(), 16);
        assert!((note.metrics.engagement_rate() - 0.16).abs() < 1e-9);

        let empty = NoteMetrics::default();
        assert_eq!(empty.engagement_rate(), 0.0);
    }

    #[test]
    fn test_age_hours_never_negative() {
        let mut note = sample_note("n1", "a1");
        note.created_at = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(note.age_hours(Utc::now()), 0.0);
    }

    #[test]
    fn test_profile_top_hashtags_sorted() {
        let mut profile = EngagementProfile::new("v1", Utc::now());
        profile.hashtag_interests.insert("rust".to_string(), 0.9);
        profile.hashtag_interests.insert("go".to_string(), 0.2);
        profile.hashtag_interests.insert("zig".to_string(), 0.5);

        let top = profile.top_hashtags(2);
        assert_eq!(top, vec!["rust".to_string(), "zig".to_string()]);
    }

    #[test]
    fn test_fanout_event_author() {
        let event = FanoutEvent::NoteDeleted {
            note_id: "n1".to_string(),
            author_id: "a9".to_string(),
        };
        assert_eq!(event.author_id(), "a9");
        assert_eq!(event.kind(), "note_deleted");
    }

    #[test]
    fn test_engagement_action_parse() {
        assert_eq!(EngagementAction::parse("like"), Some(EngagementAction::Like));
        assert_eq!(EngagementAction::parse("boost"), None);
    }

    #[test]
    fn test_slate_item_serialization_roundtrip() {
        let item = SlateItem {
            note: sample_note("n1", "a1"),
            source: ContentSource::Trending,
            signals: RankingSignals { recency: 0.5, ..Default::default() },
            final_score: 0.42,
            injected_at: Utc::now(),
            injection_reason: "ranked".to_string(),
        };
        let json = serde_json::to_string(&item).unwrap();
        let back: SlateItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.note.id, "n1");
        assert_eq!(back.source, ContentSource::Trending);
        assert!((back.final_score - 0.42).abs() < 1e-12);
    }
}
