//! Live-update hub
//!
//! Holds weak handles to per-viewer stream sessions. Each session owns its
//! bounded pending queue; the publisher walks the weak list, appending to
//! live sessions and evicting dead ones, so the hub and its sessions never
//! form a reference cycle. Sessions deliver FIFO, throttled by a per-session
//! token bucket; heartbeats are exempt and keep quiet streams alive.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use crate::clock::new_session_id;
use crate::config::{hub as tuning, rate};
use crate::models::TimelineUpdate;
use crate::rate_limiter::TokenBucket;

/// One live subscription for one viewer
pub struct StreamSession {
    session_id: String,
    viewer_id: String,
    pending: Mutex<VecDeque<TimelineUpdate>>,
    notify: Notify,
    open: AtomicBool,
    last_activity: Mutex<DateTime<Utc>>,
    limiter: Mutex<TokenBucket>,
}

impl StreamSession {
    fn new(viewer_id: &str, max_msgs_per_sec: u32) -> Self {
        let per_sec = max_msgs_per_sec.max(1) as f64;
        Self {
            session_id: new_session_id(),
            viewer_id: viewer_id.to_string(),
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            open: AtomicBool::new(true),
            last_activity: Mutex::new(Utc::now()),
            limiter: Mutex::new(TokenBucket::new(per_sec, per_sec)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Flag the session closed and wake its delivery loop
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Append an update, dropping the oldest entry on overflow.
    /// Returns false when the oldest entry had to be dropped.
    fn enqueue(&self, update: TimelineUpdate) -> bool {
        let mut kept_all = true;
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.push_back(update);
            while pending.len() > tuning::PENDING_QUEUE_CAPACITY {
                pending.pop_front();
                kept_all = false;
            }
        }
        self.notify.notify_one();
        kept_all
    }

    /// Cooperative delivery loop step: the next message to write to the
    /// client, or None once the session is closed. Quiet periods produce
    /// heartbeats; pending updates are throttled by the session bucket.
    pub async fn next_message(&self) -> Option<TimelineUpdate> {
        loop {
            if !self.is_open() {
                return None;
            }

            let queued = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.pop_front()
            };

            match queued {
                Some(update) => {
                    let admitted = self
                        .limiter
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .try_acquire();
                    if admitted {
                        self.touch();
                        return Some(update);
                    }
                    // out of tokens: put it back and retry shortly
                    {
                        let mut pending =
                            self.pending.lock().unwrap_or_else(|e| e.into_inner());
                        pending.push_front(update);
                    }
                    tokio::time::sleep(Duration::from_millis(tuning::THROTTLE_SLEEP_MS)).await;
                }
                None => {
                    let wait = Duration::from_millis(tuning::HEARTBEAT_WAIT_MS);
                    if tokio::time::timeout(wait, self.notify.notified()).await.is_err() {
                        self.touch();
                        return Some(TimelineUpdate::heartbeat(Utc::now()));
                    }
                }
            }
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }
}

/// Registry of live sessions keyed by viewer
pub struct LiveUpdateHub {
    sessions: Mutex<HashMap<String, Vec<Weak<StreamSession>>>>,
    max_msgs_per_sec: u32,
}

impl LiveUpdateHub {
    pub fn new(max_msgs_per_sec: u32) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_msgs_per_sec,
        }
    }

    /// Open a new session for the viewer. The caller owns the Arc; the hub
    /// keeps only a weak handle and forgets the session once it drops.
    pub fn subscribe(&self, viewer_id: &str) -> Arc<StreamSession> {
        let session = Arc::new(StreamSession::new(viewer_id, self.max_msgs_per_sec));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(viewer_id.to_string())
            .or_default()
            .push(Arc::downgrade(&session));
        session
    }

    /// Deliver an update to every live session of the viewer.
    /// Returns (sessions reached, overflow drops).
    pub fn publish(&self, viewer_id: &str, update: &TimelineUpdate) -> (usize, usize) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = sessions.get_mut(viewer_id) else {
            return (0, 0);
        };

        let mut reached = 0;
        let mut overflowed = 0;
        list.retain(|weak| match weak.upgrade() {
            Some(session) if session.is_open() => {
                if !session.enqueue(update.clone()) {
                    overflowed += 1;
                }
                reached += 1;
                true
            }
            _ => false,
        });
        if list.is_empty() {
            sessions.remove(viewer_id);
        }
        (reached, overflowed)
    }

    /// Close sessions idle longer than the configured timeout.
    /// Returns how many were closed.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut closed = 0;
        for list in sessions.values() {
            for weak in list {
                if let Some(session) = weak.upgrade() {
                    let idle = (now - session.last_activity()).num_seconds();
                    if session.is_open() && idle > tuning::SESSION_IDLE_TIMEOUT_SECS as i64 {
                        session.close();
                        closed += 1;
                    }
                }
            }
        }
        closed
    }

    /// Close every session, used on server shutdown
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for list in sessions.values() {
            for weak in list {
                if let Some(session) = weak.upgrade() {
                    session.close();
                }
            }
        }
        sessions.clear();
    }

    /// Live session count across all viewers
    pub fn open_sessions(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .flat_map(|list| list.iter())
            .filter(|weak| weak.upgrade().map(|s| s.is_open()).unwrap_or(false))
            .count()
    }
}

impl Default for LiveUpdateHub {
    fn default() -> Self {
        Self::new(rate::STREAM_MAX_MSGS_PER_SEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimelineUpdateKind;

    fn update(note_id: &str) -> TimelineUpdate {
        TimelineUpdate {
            kind: TimelineUpdateKind::NoteCreated,
            note_id: Some(note_id.to_string()),
            author_id: Some("a1".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_fifo() {
        let hub = LiveUpdateHub::new(100);
        let session = hub.subscribe("v1");

        hub.publish("v1", &update("n1"));
        hub.publish("v1", &update("n2"));

        let first = session.next_message().await.unwrap();
        let second = session.next_message().await.unwrap();
        assert_eq!(first.note_id.as_deref(), Some("n1"));
        assert_eq!(second.note_id.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn test_quiet_session_emits_heartbeat() {
        let hub = LiveUpdateHub::new(100);
        let session = hub.subscribe("v1");

        let message = session.next_message().await.unwrap();
        assert!(message.is_heartbeat());
    }

    #[tokio::test]
    async fn test_closed_session_yields_none() {
        let hub = LiveUpdateHub::new(100);
        let session = hub.subscribe("v1");
        session.close();
        assert!(session.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_sessions_are_evicted_on_publish() {
        let hub = LiveUpdateHub::new(100);
        let session = hub.subscribe("v1");
        drop(session);

        let (reached, _) = hub.publish("v1", &update("n1"));
        assert_eq!(reached, 0);
        assert_eq!(hub.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_pending_queue_drops_oldest_on_overflow() {
        let hub = LiveUpdateHub::new(100);
        let session = hub.subscribe("v1");

        let mut overflow_total = 0;
        for i in 0..(tuning::PENDING_QUEUE_CAPACITY + 5) {
            let (_, overflowed) = hub.publish("v1", &update(&format!("n{}", i)));
            overflow_total += overflowed;
        }
        assert_eq!(overflow_total, 5);
        assert_eq!(session.pending_len(), tuning::PENDING_QUEUE_CAPACITY);

        // oldest entries were dropped, delivery starts at n5
        let first = session.next_message().await.unwrap();
        assert_eq!(first.note_id.as_deref(), Some("n5"));
    }

    #[tokio::test]
    async fn test_per_session_rate_limit_throttles_updates() {
        let hub = LiveUpdateHub::new(2);
        let session = hub.subscribe("v1");
        for i in 0..3 {
            hub.publish("v1", &update(&format!("n{}", i)));
        }

        let started = std::time::Instant::now();
        for _ in 0..3 {
            let message = session.next_message().await.unwrap();
            assert!(!message.is_heartbeat());
        }
        // the third delivery had to wait for a token at 2 msg/sec
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_sessions_are_independent_per_viewer() {
        let hub = LiveUpdateHub::new(100);
        let _v1 = hub.subscribe("v1");
        let v2 = hub.subscribe("v2");

        hub.publish("v1", &update("n1"));
        assert_eq!(v2.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = LiveUpdateHub::new(100);
        let s1 = hub.subscribe("v1");
        let s2 = hub.subscribe("v2");

        hub.shutdown();
        assert!(!s1.is_open());
        assert!(!s2.is_open());
        assert_eq!(hub.open_sessions(), 0);
    }
}
