//! Ranking engine
//!
//! Produces five normalized signals per candidate, combines them with the
//! effective weights, then reshapes the ordered list with three passes:
//! author diversity, repetition control, and the hybrid-mode freshness
//! tweak. Scores never go negative; the returned order is non-increasing.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::config::{defaults, ranking as tuning};
use crate::models::{ContentSource, EngagementProfile, Note, RankingSignals, SlateItem};
use crate::resolver::{TimelineAlgorithm, ViewerConfig};
use crate::sources::SourceError;

/// Score assigned to one note by the external ranker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedNoteId {
    pub note_id: String,
    pub score: f64,
}

/// Optional external ranker, consulted only when a request opts in
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OverdriveRanker: Send + Sync {
    async fn rank_for_you(
        &self,
        viewer_id: &str,
        candidate_ids: &[String],
        k: usize,
    ) -> Result<Vec<RankedNoteId>, SourceError>;
}

/// Local ranking engine with a small global author reputation table
pub struct RankingEngine {
    /// author_id -> reputation in [0, 1], learned from engagement events
    author_reputation: RwLock<HashMap<String, f64>>,
}

impl RankingEngine {
    pub fn new() -> Self {
        Self {
            author_reputation: RwLock::new(HashMap::new()),
        }
    }

    /// Bump an author's global reputation, saturating at 1
    pub fn record_author_reputation(&self, author_id: &str, delta: f64) {
        let mut reputation = self.author_reputation.write().unwrap_or_else(|e| e.into_inner());
        let entry = reputation.entry(author_id.to_string()).or_insert(0.0);
        *entry = (*entry + delta).clamp(0.0, 1.0);
    }

    pub fn author_reputation(&self, author_id: &str) -> f64 {
        self.author_reputation
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(author_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Score candidates and apply the ordering passes
    pub fn score_notes(
        &self,
        candidates: Vec<(Note, ContentSource)>,
        profile: &EngagementProfile,
        followed: &HashSet<String>,
        config: &ViewerConfig,
        now: DateTime<Utc>,
    ) -> Vec<SlateItem> {
        let mut items: Vec<SlateItem> = candidates
            .into_iter()
            .map(|(note, source)| {
                let signals = self.compute_signals(&note, profile, followed, now);
                let final_score = combine_signals(&signals, config);
                SlateItem {
                    note,
                    source,
                    signals,
                    final_score,
                    injected_at: now,
                    injection_reason: "ranked".to_string(),
                }
            })
            .collect();

        apply_diversity_pass(&mut items, config.weights.diversity);
        apply_repetition_control(&mut items);
        if config.algorithm == TimelineAlgorithm::Hybrid {
            apply_hybrid_boost(&mut items, now);
        }

        for item in &mut items {
            item.final_score = item.final_score.max(0.0);
        }
        sort_by_score(&mut items);
        items
    }

    /// All five signals for one note
    pub fn compute_signals(
        &self,
        note: &Note,
        profile: &EngagementProfile,
        followed: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> RankingSignals {
        RankingSignals {
            author_affinity: self.author_affinity_signal(note, profile, followed),
            content_quality: content_quality_signal(note, profile),
            engagement_velocity: engagement_velocity_signal(note, now),
            recency: recency_signal(note, now),
            personalization: personalization_signal(note, profile),
        }
    }

    fn author_affinity_signal(
        &self,
        note: &Note,
        profile: &EngagementProfile,
        followed: &HashSet<String>,
    ) -> f64 {
        let base = if followed.contains(&note.author_id) { 0.8 } else { 0.1 };
        let learned = profile.author_affinity.get(&note.author_id).copied().unwrap_or(0.0);
        let reputation = self.author_reputation(&note.author_id);
        (base + learned + reputation * tuning::GLOBAL_REPUTATION_SHARE).min(1.0)
    }
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Weighted sum of signals plus the fixed personalization share
pub fn combine_signals(signals: &RankingSignals, config: &ViewerConfig) -> f64 {
    config.weights.recency * signals.recency
        + config.weights.engagement * signals.engagement_velocity
        + config.weights.author_affinity * signals.author_affinity
        + config.weights.content_quality * signals.content_quality
        + defaults::PERSONALIZATION_SHARE * signals.personalization
}

fn content_quality_signal(note: &Note, profile: &EngagementProfile) -> f64 {
    let mut score: f64 = 0.5;

    let length = note.content.chars().count();
    if (50..=280).contains(&length) {
        score += 0.10;
    }
    if length < 10 {
        score -= 0.20;
    }

    if !note.media.is_empty() {
        score += 0.15;
    }
    if contains_url(&note.content) {
        score -= 0.05;
    }

    let hashtag_count = note.hashtags.len();
    if (1..=5).contains(&hashtag_count) {
        score += 0.08;
    }
    if hashtag_count > 10 {
        score -= 0.10;
    }
    for tag in &note.hashtags {
        if profile.hashtag_interests.get(tag).copied().unwrap_or(0.0) > 0.0 {
            score += 0.05;
        }
    }

    let mention_count = count_mentions(&note.content);
    if (1..=3).contains(&mention_count) {
        score += 0.12;
    }

    score += 0.30 * note.metrics.engagement_rate().min(1.0);

    score.clamp(0.0, 1.0)
}

fn engagement_velocity_signal(note: &Note, now: DateTime<Utc>) -> f64 {
    let age_hours = note.age_hours(now).max(1.0);
    let velocity = note.metrics.total_engagements() as f64 / age_hours;
    (velocity / tuning::VELOCITY_NORMALIZER).min(1.0)
}

fn recency_signal(note: &Note, now: DateTime<Utc>) -> f64 {
    let age_hours = note.age_hours(now);
    (-age_hours * std::f64::consts::LN_2 / tuning::RECENCY_HALF_LIFE_HOURS).exp()
}

fn personalization_signal(note: &Note, profile: &EngagementProfile) -> f64 {
    let mut score: f64 = 0.0;

    // Day-window approximation: viewer-local hours are approximated by UTC.
    let hour = note.created_at.hour();
    if (9..23).contains(&hour) {
        score += 0.1;
    }
    for tag in &note.hashtags {
        if profile.hashtag_interests.get(tag).copied().unwrap_or(0.0) > 0.0 {
            score += 0.05;
        }
    }
    score.min(1.0)
}

/// Penalize over-represented authors, reward one-off hashtags. The whole
/// adjustment is scaled by the configured diversity weight.
fn apply_diversity_pass(items: &mut [SlateItem], diversity_weight: f64) {
    let mut hashtag_totals: HashMap<String, usize> = HashMap::new();
    for item in items.iter() {
        for tag in &item.note.hashtags {
            *hashtag_totals.entry(tag.clone()).or_insert(0) += 1;
        }
    }

    let mut seen_per_author: HashMap<String, usize> = HashMap::new();
    for item in items.iter_mut() {
        let mut adjustment = 0.0;

        let seen = seen_per_author.entry(item.note.author_id.clone()).or_insert(0);
        *seen += 1;
        if *seen > tuning::DIVERSITY_AUTHOR_SOFT_CAP {
            adjustment -=
                tuning::DIVERSITY_AUTHOR_PENALTY * (*seen - tuning::DIVERSITY_AUTHOR_SOFT_CAP) as f64;
        }

        for tag in &item.note.hashtags {
            if hashtag_totals.get(tag).copied().unwrap_or(0) == 1 {
                adjustment += tuning::DIVERSITY_UNIQUE_HASHTAG_BOOST;
            }
        }

        item.final_score += adjustment * diversity_weight;
    }
}

/// Walk the score-ordered list applying escalating author penalties,
/// back-to-back separation, novelty boosts and hashtag frequency nudges.
fn apply_repetition_control(items: &mut Vec<SlateItem>) {
    sort_by_score(items);

    let mut hashtag_totals: HashMap<String, usize> = HashMap::new();
    for item in items.iter() {
        for tag in &item.note.hashtags {
            *hashtag_totals.entry(tag.clone()).or_insert(0) += 1;
        }
    }

    let mut author_counts: HashMap<String, usize> = HashMap::new();
    let mut previous_author: Option<String> = None;

    for item in items.iter_mut() {
        let author = item.note.author_id.clone();
        let count = author_counts.entry(author.clone()).or_insert(0);
        *count += 1;

        let mut adjustment = 0.0;
        if *count == 1 {
            adjustment += tuning::NOVELTY_BOOST;
        }
        if *count > tuning::REPETITION_AUTHOR_SOFT_CAP {
            adjustment -=
                tuning::REPETITION_PENALTY_STEP * (*count - tuning::REPETITION_AUTHOR_SOFT_CAP) as f64;
        }
        if previous_author.as_deref() == Some(author.as_str()) {
            adjustment -= tuning::BACK_TO_BACK_PENALTY;
        }

        for tag in &item.note.hashtags {
            match hashtag_totals.get(tag).copied().unwrap_or(0) {
                1 => adjustment += tuning::HASHTAG_UNIQUE_BOOST,
                freq if freq > tuning::HASHTAG_OVERUSE_THRESHOLD => {
                    adjustment -= tuning::HASHTAG_OVERUSE_PENALTY
                }
                _ => {}
            }
        }

        item.final_score += adjustment;
        previous_author = Some(author);
    }
}

/// Hybrid mode: nudge very fresh notes and discovery sources upward
fn apply_hybrid_boost(items: &mut [SlateItem], now: DateTime<Utc>) {
    for item in items.iter_mut() {
        let age_minutes = (now - item.note.created_at).num_minutes();
        if (0..=tuning::HYBRID_FRESH_AGE_MINUTES).contains(&age_minutes) {
            item.final_score += tuning::HYBRID_FRESH_BOOST;
        }
        if item.source != ContentSource::Following {
            item.final_score += tuning::HYBRID_DISCOVERY_BOOST;
        }
    }
}

/// Non-increasing final_score order; equal scores keep their relative order
pub fn sort_by_score(items: &mut [SlateItem]) {
    items.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn contains_url(content: &str) -> bool {
    content.contains("http://") || content.contains("https://")
}

fn count_mentions(content: &str) -> usize {
    content
        .split_whitespace()
        .filter(|token| token.len() > 1 && token.starts_with('@'))
        .count()
}
