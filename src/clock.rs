//! Time sources and opaque ID generation
//!
//! Wall-clock time comes from chrono, monotonic time from std Instant.
//! IDs are opaque strings: random uuids for sessions and slate builds,
//! deterministic digests for fan-out events so replays share an id.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Instant;
use uuid::Uuid;

/// Shared clock handed to components that need both time domains
#[derive(Debug, Clone)]
pub struct ServiceClock {
    started: Instant,
}

impl ServiceClock {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }

    /// Current wall-clock time
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Current monotonic instant, safe for elapsed-time arithmetic
    pub fn monotonic(&self) -> Instant {
        Instant::now()
    }

    /// Seconds since the service started
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Default for ServiceClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque unique id for a stream session
pub fn new_session_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}

/// Correlation id attached to a request for log stitching
pub fn new_correlation_id() -> String {
    format!("corr_{}", Uuid::new_v4().simple())
}

/// Deterministic id for a fan-out event. The same logical event hashes to
/// the same id across replays, which keeps downstream effects idempotent.
pub fn event_id(kind: &str, subject: &str, author_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(subject.as_bytes());
    hasher.update(b"|");
    hasher.update(author_id.as_bytes());
    let digest = hasher.finalize();
    format!("evt_{}", hex::encode(&digest[..8]))
}
