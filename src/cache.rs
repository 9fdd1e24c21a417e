//! Timeline cache
//!
//! Two tiers: a remote string-keyed KV store is the primary, and a bounded
//! in-process map takes over when the remote store is unavailable. Both
//! tiers observe the same TTL semantics. The fan-out worker is the
//! authoritative invalidator; `invalidate_author_slates` is a secondary
//! defense that can only walk the local tier on a plain KV remote.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::cache as tuning;
use crate::models::{EngagementProfile, Slate};

/// Failure surfaced by the remote store
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// String-keyed, string-valued store with optional TTL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process KvStore used for single-node deployments and tests
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => Ok(None),
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Bounded local fallback map with insertion-order eviction
struct LocalStore {
    entries: HashMap<String, (String, Option<Instant>)>,
    order: VecDeque<String>,
    max_entries: usize,
}

impl LocalStore {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                self.entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        if !self.entries.contains_key(key) {
            self.order.push_back(key.to_string());
        }
        self.entries.insert(key.to_string(), (value.to_string(), expires));

        while self.entries.len() > self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn del(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Per-viewer cache for slates, engagement profiles and last-read marks
pub struct TimelineCache {
    remote: Option<std::sync::Arc<dyn KvStore>>,
    local: Mutex<LocalStore>,
}

fn slate_key(viewer_id: &str) -> String {
    format!("slate:{}", viewer_id)
}

fn profile_key(viewer_id: &str) -> String {
    format!("profile:{}", viewer_id)
}

fn lastread_key(viewer_id: &str) -> String {
    format!("lastread:{}", viewer_id)
}

impl TimelineCache {
    pub fn new(remote: Option<std::sync::Arc<dyn KvStore>>) -> Self {
        Self {
            remote,
            local: Mutex::new(LocalStore::new(tuning::LOCAL_MAX_ENTRIES)),
        }
    }

    pub async fn get_slate(&self, viewer_id: &str) -> Option<Slate> {
        let raw = self.read_key(&slate_key(viewer_id)).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn set_slate(&self, viewer_id: &str, slate: &Slate, ttl: Duration) {
        if let Ok(raw) = serde_json::to_string(slate) {
            self.write_key(&slate_key(viewer_id), &raw, Some(ttl)).await;
        }
    }

    pub async fn invalidate_slate(&self, viewer_id: &str) {
        self.delete_key(&slate_key(viewer_id)).await;
    }

    /// Best-effort: drops local slates containing the author. A plain KV
    /// remote has no reverse index, so remote entries are left to the
    /// fan-out worker, which invalidates per affected viewer.
    pub async fn invalidate_author_slates(&self, author_id: &str) -> usize {
        let candidates: Vec<(String, Option<Slate>)> = {
            let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            local
                .keys_with_prefix("slate:")
                .into_iter()
                .map(|key| {
                    let parsed = local.get(&key).and_then(|raw| serde_json::from_str(&raw).ok());
                    (key, parsed)
                })
                .collect()
        };

        let mut dropped = 0;
        for (key, slate) in candidates {
            if let Some(slate) = slate {
                if slate.contains_author(author_id) {
                    self.delete_key(&key).await;
                    dropped += 1;
                }
            }
        }
        dropped
    }

    pub async fn get_profile(&self, viewer_id: &str) -> Option<EngagementProfile> {
        let raw = self.read_key(&profile_key(viewer_id)).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn set_profile(&self, profile: &EngagementProfile) {
        if let Ok(raw) = serde_json::to_string(profile) {
            self.write_key(
                &profile_key(&profile.viewer_id),
                &raw,
                Some(Duration::from_secs(tuning::PROFILE_TTL_SECS)),
            )
            .await;
        }
    }

    pub async fn get_last_read(&self, viewer_id: &str) -> Option<DateTime<Utc>> {
        let raw = self.read_key(&lastread_key(viewer_id)).await?;
        serde_json::from_str(&raw).ok()
    }

    /// Monotonic: an earlier mark never overwrites a later one
    pub async fn set_last_read(&self, viewer_id: &str, read_until: DateTime<Utc>) {
        let effective = match self.get_last_read(viewer_id).await {
            Some(existing) if existing > read_until => existing,
            _ => read_until,
        };
        if let Ok(raw) = serde_json::to_string(&effective) {
            self.write_key(&lastread_key(viewer_id), &raw, None).await;
        }
    }

    async fn read_key(&self, key: &str) -> Option<String> {
        if let Some(remote) = &self.remote {
            match remote.get(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(_) => {
                    // remote down, fall through to the local tier
                }
            }
        }
        self.local.lock().unwrap_or_else(|e| e.into_inner()).get(key)
    }

    async fn write_key(&self, key: &str, value: &str, ttl: Option<Duration>) {
        if let Some(remote) = &self.remote {
            if remote.set(key, value, ttl).await.is_ok() {
                return;
            }
        }
        self.local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set(key, value, ttl);
    }

    async fn delete_key(&self, key: &str) {
        if let Some(remote) = &self.remote {
            let _ = remote.del(key).await;
        }
        self.local.lock().unwrap_or_else(|e| e.into_inner()).del(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentSource, Note, NoteMetrics, NoteVisibility, RankingSignals, SlateItem};

    fn slate_with_author(author: &str) -> Slate {
        let note = Note {
            id: "n1".to_string(),
            author_id: author.to_string(),
            created_at: Utc::now(),
            visibility: NoteVisibility::Public,
            content: "cached".to_string(),
            metrics: NoteMetrics::default(),
            media: vec![],
            hashtags: vec![],
            is_reply: false,
            is_repost: false,
        };
        Slate {
            items: vec![SlateItem {
                note,
                source: ContentSource::Following,
                signals: RankingSignals::default(),
                final_score: 0.5,
                injected_at: Utc::now(),
                injection_reason: "ranked".to_string(),
            }],
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_slate_roundtrip_through_remote() {
        let cache = TimelineCache::new(Some(std::sync::Arc::new(MemoryKvStore::new())));
        let slate = slate_with_author("a1");

        cache.set_slate("v1", &slate, Duration::from_secs(60)).await;
        let loaded = cache.get_slate("v1").await.unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].note.author_id, "a1");
    }

    #[tokio::test]
    async fn test_invalidate_slate_removes_entry() {
        let cache = TimelineCache::new(Some(std::sync::Arc::new(MemoryKvStore::new())));
        cache.set_slate("v1", &slate_with_author("a1"), Duration::from_secs(60)).await;
        cache.invalidate_slate("v1").await;
        assert!(cache.get_slate("v1").await.is_none());
    }

    #[tokio::test]
    async fn test_local_fallback_when_no_remote() {
        let cache = TimelineCache::new(None);
        cache.set_slate("v1", &slate_with_author("a1"), Duration::from_secs(60)).await;
        assert!(cache.get_slate("v1").await.is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_in_local_tier() {
        let cache = TimelineCache::new(None);
        cache.set_slate("v1", &slate_with_author("a1"), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get_slate("v1").await.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_ttl_expiry() {
        let store = MemoryKvStore::new();
        store.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_author_invalidation_walks_local_tier() {
        let cache = TimelineCache::new(None);
        cache.set_slate("v1", &slate_with_author("target"), Duration::from_secs(60)).await;
        cache.set_slate("v2", &slate_with_author("someone_else"), Duration::from_secs(60)).await;

        let dropped = cache.invalidate_author_slates("target").await;
        assert_eq!(dropped, 1);
        assert!(cache.get_slate("v1").await.is_none());
        assert!(cache.get_slate("v2").await.is_some());
    }

    #[tokio::test]
    async fn test_last_read_is_monotonic() {
        let cache = TimelineCache::new(None);
        let later = Utc::now();
        let earlier = later - chrono::Duration::hours(1);

        cache.set_last_read("v1", later).await;
        cache.set_last_read("v1", earlier).await;
        assert_eq!(cache.get_last_read("v1").await, Some(later));
    }

    #[tokio::test]
    async fn test_profile_roundtrip() {
        let cache = TimelineCache::new(None);
        let mut profile = EngagementProfile::new("v1", Utc::now());
        profile.author_affinity.insert("a1".to_string(), 0.4);
        profile.muted_keywords.insert("noise".to_string());

        cache.set_profile(&profile).await;
        let loaded = cache.get_profile("v1").await.unwrap();
        assert_eq!(loaded.author_affinity.get("a1"), Some(&0.4));
        assert!(loaded.muted_keywords.contains("noise"));
    }

    #[tokio::test]
    async fn test_local_store_bounded_eviction() {
        let mut store = LocalStore::new(3);
        for i in 0..5 {
            store.set(&format!("k{}", i), "v", None);
        }
        assert!(store.entries.len() <= 3);
        // the oldest keys were evicted first
        assert!(store.get("k0").is_none());
        assert!(store.get("k4").is_some());
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_local() {
        let mut remote = MockKvStore::new();
        remote
            .expect_set()
            .returning(|_, _, _| Err(CacheError::Unavailable("down".to_string())));
        remote
            .expect_get()
            .returning(|_| Err(CacheError::Unavailable("down".to_string())));
        remote.expect_del().returning(|_| Err(CacheError::Unavailable("down".to_string())));

        let cache = TimelineCache::new(Some(std::sync::Arc::new(remote)));
        cache.set_slate("v1", &slate_with_author("a1"), Duration::from_secs(60)).await;
        assert!(cache.get_slate("v1").await.is_some());
    }
}
