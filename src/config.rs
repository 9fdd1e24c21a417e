//! Service constants for the timeline core
//!
//! Central place for defaults, limits and tuning knobs used across modules.

/// Default timeline generation parameters
pub mod defaults {
    /// Maximum items held in one slate
    pub const MAX_ITEMS: usize = 50;

    /// Candidate age window in hours
    pub const MAX_AGE_HOURS: i64 = 24;

    /// Items scoring below this never enter a slate
    pub const MIN_SCORE_THRESHOLD: f64 = 0.1;

    /// Signal weights (sum with the personalization share below)
    pub const RECENCY_WEIGHT: f64 = 0.3;
    pub const ENGAGEMENT_WEIGHT: f64 = 0.25;
    pub const AUTHOR_AFFINITY_WEIGHT: f64 = 0.2;
    pub const CONTENT_QUALITY_WEIGHT: f64 = 0.15;
    pub const DIVERSITY_WEIGHT: f64 = 0.1;

    /// Fixed share of the personalization signal in the final score
    pub const PERSONALIZATION_SHARE: f64 = 0.1;

    /// Content mix ratios
    pub const FOLLOWING_RATIO: f64 = 0.7;
    pub const RECOMMENDED_RATIO: f64 = 0.2;
    pub const TRENDING_RATIO: f64 = 0.1;
    pub const LISTS_RATIO: f64 = 0.0;
}

/// Ranking engine tuning
pub mod ranking {
    /// Recency decay half life in hours
    pub const RECENCY_HALF_LIFE_HOURS: f64 = 6.0;

    /// Engagement velocity normalizer (engagements per hour mapped to 1.0)
    pub const VELOCITY_NORMALIZER: f64 = 10.0;

    /// Diversity pass: soft cap of notes per author and penalty step beyond it
    pub const DIVERSITY_AUTHOR_SOFT_CAP: usize = 3;
    pub const DIVERSITY_AUTHOR_PENALTY: f64 = 0.05;
    pub const DIVERSITY_UNIQUE_HASHTAG_BOOST: f64 = 0.02;

    /// Repetition pass: soft cap, escalating step, adjacency and novelty terms
    pub const REPETITION_AUTHOR_SOFT_CAP: usize = 2;
    pub const REPETITION_PENALTY_STEP: f64 = 0.06;
    pub const BACK_TO_BACK_PENALTY: f64 = 0.05;
    pub const NOVELTY_BOOST: f64 = 0.04;
    pub const HASHTAG_UNIQUE_BOOST: f64 = 0.02;
    pub const HASHTAG_OVERUSE_PENALTY: f64 = 0.01;
    pub const HASHTAG_OVERUSE_THRESHOLD: usize = 4;

    /// Hybrid mode micro boosts
    pub const HYBRID_FRESH_AGE_MINUTES: i64 = 30;
    pub const HYBRID_FRESH_BOOST: f64 = 0.02;
    pub const HYBRID_DISCOVERY_BOOST: f64 = 0.01;

    /// Share of the global author reputation folded into author affinity
    pub const GLOBAL_REPUTATION_SHARE: f64 = 0.2;
}

/// Per-viewer request rate limiting
pub mod rate {
    /// Requests per minute admitted per viewer per endpoint class
    pub const DEFAULT_RPM: u32 = 60;

    /// Update messages emitted per second per stream session, heartbeats exempt
    pub const STREAM_MAX_MSGS_PER_SEC: u32 = 5;
}

/// Cache layer tuning
pub mod cache {
    /// Slate entry TTL in seconds
    pub const SLATE_TTL_SECS: u64 = 300;

    /// Engagement profile TTL in seconds
    pub const PROFILE_TTL_SECS: u64 = 86_400;

    /// Follow-set micro cache TTL in seconds
    pub const FOLLOW_SET_TTL_SECS: u64 = 60;

    /// Upper bound on entries held by the local fallback map
    pub const LOCAL_MAX_ENTRIES: usize = 10_000;
}

/// Fan-out worker tuning
pub mod fanout {
    /// Bounded event queue capacity; producers drop the oldest on overflow
    pub const QUEUE_CAPACITY: usize = 10_000;

    /// Retry policy for events whose downstream effects failed
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BACKOFF_BASE_MS: u64 = 50;
    pub const BACKOFF_CAP_MS: u64 = 2_000;
}

/// Live-update hub tuning
pub mod hub {
    /// Pending updates held per session; oldest dropped on overflow
    pub const PENDING_QUEUE_CAPACITY: usize = 256;

    /// Wait window before a quiet session emits a heartbeat
    pub const HEARTBEAT_WAIT_MS: u64 = 500;

    /// Sleep between rate-limited delivery attempts
    pub const THROTTLE_SLEEP_MS: u64 = 50;

    /// Sessions idle longer than this are considered dead
    pub const SESSION_IDLE_TIMEOUT_SECS: u64 = 300;
}

/// External call handling
pub mod upstream {
    /// Deadline applied to each source adapter call
    pub const SOURCE_TIMEOUT_MS: u64 = 2_000;

    /// Lookback for recommended candidates in hours
    pub const RECOMMENDED_LOOKBACK_HOURS: i64 = 24;

    /// Lookback for trending candidates in hours
    pub const TRENDING_LOOKBACK_HOURS: i64 = 6;

    /// Lookback for author-page timelines in hours
    pub const USER_TIMELINE_LOOKBACK_HOURS: i64 = 168;
}

/// Engagement profile learning deltas, all saturating at 1.0
pub mod engagement {
    pub const LIKE_AFFINITY_DELTA: f64 = 0.05;
    pub const REPOST_AFFINITY_DELTA: f64 = 0.10;
    pub const REPLY_AFFINITY_DELTA: f64 = 0.15;
    pub const FOLLOW_AFFINITY_DELTA: f64 = 0.30;
    pub const GLOBAL_REPUTATION_DELTA: f64 = 0.01;
    pub const HASHTAG_INTEREST_DELTA: f64 = 0.02;
}

/// Network defaults for the serving binary
pub mod network {
    pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
}
