//! Fan-out worker
//!
//! A single background loop drains a bounded event queue. For each write
//! event it resolves the affected viewers through the follow graph, drops
//! their cached slates and pushes a live update to their stream sessions.
//! Delivery is at-least-once: an event may be replayed after a restart, and
//! every downstream effect is idempotent. Failed events retry with capped
//! exponential backoff and jitter before being dropped and counted.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::cache::TimelineCache;
use crate::clock;
use crate::config::fanout as tuning;
use crate::live_hub::LiveUpdateHub;
use crate::models::{FanoutEvent, TimelineUpdate, TimelineUpdateKind};
use crate::observability::ObservabilityManager;
use crate::sources::{FollowGraph, FollowingAdapter, SourceError};

/// Bounded queue feeding the worker. Producers never block: on overflow the
/// oldest event is dropped and counted.
pub struct FanoutQueue {
    events: Mutex<VecDeque<FanoutEvent>>,
    notify: Notify,
    capacity: usize,
}

impl FanoutQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Returns the number of events dropped to make room (0 or 1)
    pub fn enqueue(&self, event: FanoutEvent) -> usize {
        let mut dropped = 0;
        {
            let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
            events.push_back(event);
            while events.len() > self.capacity {
                events.pop_front();
                dropped += 1;
            }
        }
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<FanoutEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn wait_for_event(&self, window: Duration) {
        let _ = tokio::time::timeout(window, self.notify.notified()).await;
    }
}

impl Default for FanoutQueue {
    fn default() -> Self {
        Self::new(tuning::QUEUE_CAPACITY)
    }
}

/// Background worker propagating write events to caches and live streams
pub struct FanoutWorker {
    queue: Arc<FanoutQueue>,
    follows: Arc<dyn FollowGraph>,
    following_adapter: Arc<FollowingAdapter>,
    cache: Arc<TimelineCache>,
    hub: Arc<LiveUpdateHub>,
    observability: Arc<ObservabilityManager>,
    shutdown: AtomicBool,
}

impl FanoutWorker {
    pub fn new(
        queue: Arc<FanoutQueue>,
        follows: Arc<dyn FollowGraph>,
        following_adapter: Arc<FollowingAdapter>,
        cache: Arc<TimelineCache>,
        hub: Arc<LiveUpdateHub>,
        observability: Arc<ObservabilityManager>,
    ) -> Self {
        Self {
            queue,
            follows,
            following_adapter,
            cache,
            hub,
            observability,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Flag the loop to exit after the current event
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drain loop. Spawn with `tokio::spawn(worker.clone().run())`.
    pub async fn run(self: Arc<Self>) {
        self.observability.info("fanout", "worker started");
        loop {
            if self.is_shutting_down() {
                break;
            }
            match self.queue.pop() {
                Some(event) => {
                    self.handle_with_retry(event).await;
                    self.observability
                        .set_gauge("fanout_queue_depth", self.queue.len() as f64);
                }
                None => {
                    self.queue.wait_for_event(Duration::from_millis(200)).await;
                }
            }
        }
        self.observability.info("fanout", "worker stopped");
    }

    /// Process one event now, without the background loop. Used by tests
    /// and by synchronous drains on shutdown.
    pub async fn process_one(&self) -> bool {
        match self.queue.pop() {
            Some(event) => {
                self.handle_with_retry(event).await;
                true
            }
            None => false,
        }
    }

    async fn handle_with_retry(&self, event: FanoutEvent) {
        // replays of the same logical event share this id, so downstream
        // logs can be correlated across restarts
        let event_id = clock::event_id(event.kind(), event_subject(&event), event.author_id());
        let mut attempt = 0;
        loop {
            match self.process_event(&event).await {
                Ok(()) => {
                    self.observability.increment("fanout_events_processed");
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= tuning::MAX_ATTEMPTS {
                        self.observability.increment("fanout_events_failed");
                        self.observability.error(
                            "fanout",
                            &format!(
                                "dropping {} event after {} attempts: {}",
                                event.kind(),
                                attempt,
                                err
                            ),
                            None,
                            Some(&event_id),
                        );
                        return;
                    }
                    self.observability.increment("fanout_retries");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    async fn process_event(&self, event: &FanoutEvent) -> Result<(), SourceError> {
        match event {
            FanoutEvent::NoteCreated { note } => {
                self.fan_out_to_followers(
                    &note.author_id,
                    TimelineUpdateKind::NoteCreated,
                    Some(note.id.clone()),
                )
                .await
            }
            FanoutEvent::NoteUpdated { note } => {
                self.fan_out_to_followers(
                    &note.author_id,
                    TimelineUpdateKind::NoteUpdated,
                    Some(note.id.clone()),
                )
                .await
            }
            FanoutEvent::NoteDeleted { note_id, author_id } => {
                // delete marker lets clients purge local state
                self.fan_out_to_followers(
                    author_id,
                    TimelineUpdateKind::NoteDeleted,
                    Some(note_id.clone()),
                )
                .await
            }
            FanoutEvent::FollowChanged { follower_id, .. } => {
                // only the follower's candidate pool changed
                self.cache.invalidate_slate(follower_id).await;
                self.following_adapter.invalidate_follow_set(follower_id).await;
                Ok(())
            }
        }
    }

    async fn fan_out_to_followers(
        &self,
        author_id: &str,
        kind: TimelineUpdateKind,
        note_id: Option<String>,
    ) -> Result<(), SourceError> {
        let followers = self.follows.get_followers(author_id).await?;
        let update = TimelineUpdate {
            kind,
            note_id,
            author_id: Some(author_id.to_string()),
            timestamp: Utc::now(),
        };

        let mut pushed = 0u64;
        for follower in &followers {
            self.cache.invalidate_slate(follower).await;
            let (reached, overflowed) = self.hub.publish(follower, &update);
            pushed += reached as u64;
            if overflowed > 0 {
                self.observability.increment_by("stream_overflow_drops", overflowed as u64);
            }
        }
        self.observability.increment_by("fanout_updates_pushed", pushed);
        Ok(())
    }
}

/// The entity an event is about, for the deterministic event id
fn event_subject(event: &FanoutEvent) -> &str {
    match event {
        FanoutEvent::NoteCreated { note } | FanoutEvent::NoteUpdated { note } => &note.id,
        FanoutEvent::NoteDeleted { note_id, .. } => note_id,
        FanoutEvent::FollowChanged { follower_id, .. } => follower_id,
    }
}

/// Exponential backoff with jitter, capped
fn backoff_delay(attempt: u32) -> Duration {
    let exp = tuning::BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(tuning::BACKOFF_CAP_MS);
    let jitter = fastrand::u64(0..=capped / 4 + 1);
    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKvStore;
    use crate::models::{Note, NoteMetrics, NoteVisibility, Slate};
    use crate::sources::{MockFollowGraph, MockNoteService};

    fn note(id: &str, author: &str) -> Note {
        Note {
            id: id.to_string(),
            author_id: author.to_string(),
            created_at: Utc::now(),
            visibility: NoteVisibility::Public,
            content: "fresh".to_string(),
            metrics: NoteMetrics::default(),
            media: vec![],
            hashtags: vec![],
            is_reply: false,
            is_repost: false,
        }
    }

    fn worker_with_followers(followers: Vec<String>) -> (Arc<FanoutWorker>, Arc<TimelineCache>, Arc<LiveUpdateHub>) {
        let mut follows = MockFollowGraph::new();
        follows
            .expect_get_followers()
            .returning(move |_| Ok(followers.clone()));
        follows.expect_get_following().returning(|_| Ok(vec![]));
        let follows: Arc<dyn FollowGraph> = Arc::new(follows);

        let following_adapter = Arc::new(FollowingAdapter::new(
            Arc::new(MockNoteService::new()),
            follows.clone(),
        ));
        let cache = Arc::new(TimelineCache::new(Some(Arc::new(MemoryKvStore::new()))));
        let hub = Arc::new(LiveUpdateHub::new(100));
        let worker = Arc::new(FanoutWorker::new(
            Arc::new(FanoutQueue::default()),
            follows,
            following_adapter,
            cache.clone(),
            hub.clone(),
            Arc::new(ObservabilityManager::default()),
        ));
        (worker, cache, hub)
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_on_overflow() {
        let queue = FanoutQueue::new(2);
        assert_eq!(queue.enqueue(FanoutEvent::NoteCreated { note: note("n1", "a") }), 0);
        assert_eq!(queue.enqueue(FanoutEvent::NoteCreated { note: note("n2", "a") }), 0);
        assert_eq!(queue.enqueue(FanoutEvent::NoteCreated { note: note("n3", "a") }), 1);

        match queue.pop().unwrap() {
            FanoutEvent::NoteCreated { note } => assert_eq!(note.id, "n2"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_note_created_invalidates_and_notifies_followers() {
        let (worker, cache, hub) = worker_with_followers(vec!["v1".to_string()]);

        // seed a cached slate and a live session for the follower
        cache
            .set_slate("v1", &Slate::default(), Duration::from_secs(60))
            .await;
        let session = hub.subscribe("v1");

        worker
            .queue
            .enqueue(FanoutEvent::NoteCreated { note: note("n_new", "author_a") });
        assert!(worker.process_one().await);

        assert!(cache.get_slate("v1").await.is_none());
        let message = session.next_message().await.unwrap();
        assert_eq!(message.kind, TimelineUpdateKind::NoteCreated);
        assert_eq!(message.note_id.as_deref(), Some("n_new"));
    }

    #[tokio::test]
    async fn test_note_deleted_carries_delete_marker() {
        let (worker, _cache, hub) = worker_with_followers(vec!["v1".to_string()]);
        let session = hub.subscribe("v1");

        worker.queue.enqueue(FanoutEvent::NoteDeleted {
            note_id: "n_gone".to_string(),
            author_id: "author_a".to_string(),
        });
        worker.process_one().await;

        let message = session.next_message().await.unwrap();
        assert_eq!(message.kind, TimelineUpdateKind::NoteDeleted);
        assert_eq!(message.note_id.as_deref(), Some("n_gone"));
    }

    #[tokio::test]
    async fn test_follow_change_invalidates_follower_only() {
        let (worker, cache, hub) = worker_with_followers(vec![]);
        cache.set_slate("follower", &Slate::default(), Duration::from_secs(60)).await;
        cache.set_slate("followed", &Slate::default(), Duration::from_secs(60)).await;
        let followed_session = hub.subscribe("followed");

        worker.queue.enqueue(FanoutEvent::FollowChanged {
            follower_id: "follower".to_string(),
            following_id: "followed".to_string(),
            is_follow: true,
        });
        worker.process_one().await;

        assert!(cache.get_slate("follower").await.is_none());
        assert!(cache.get_slate("followed").await.is_some());
        assert_eq!(followed_session.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_event_retries_then_drops() {
        let mut follows = MockFollowGraph::new();
        follows
            .expect_get_followers()
            .times(tuning::MAX_ATTEMPTS as usize)
            .returning(|_| Err(SourceError::Unavailable("graph down".to_string())));
        let follows: Arc<dyn FollowGraph> = Arc::new(follows);

        let following_adapter = Arc::new(FollowingAdapter::new(
            Arc::new(MockNoteService::new()),
            follows.clone(),
        ));
        let observability = Arc::new(ObservabilityManager::default());
        let worker = FanoutWorker::new(
            Arc::new(FanoutQueue::default()),
            follows,
            following_adapter,
            Arc::new(TimelineCache::new(None)),
            Arc::new(LiveUpdateHub::new(100)),
            observability.clone(),
        );

        worker
            .queue
            .enqueue(FanoutEvent::NoteCreated { note: note("n1", "a") });
        worker.process_one().await;

        assert_eq!(observability.counter("fanout_events_failed"), 1);
        assert_eq!(
            observability.counter("fanout_retries"),
            (tuning::MAX_ATTEMPTS - 1) as u64
        );
    }

    #[tokio::test]
    async fn test_run_loop_exits_on_shutdown() {
        let (worker, _cache, _hub) = worker_with_followers(vec![]);
        let handle = tokio::spawn(worker.clone().run());
        worker.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
