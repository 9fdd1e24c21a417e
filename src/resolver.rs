//! Effective viewer configuration
//!
//! Every request computes a fresh `ViewerConfig` by a three-way merge:
//! hard-coded service defaults, the viewer's stored preferences, then
//! per-request experiment overrides from request metadata. Nothing here is
//! persisted; the merged config lives for one request.

use serde::{Serialize, Deserialize};
use std::collections::HashMap;

use crate::config::defaults;
use crate::models::ContentSource;

/// Timeline generation algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineAlgorithm {
    Hybrid,
    Chronological,
    Engagement,
}

impl TimelineAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineAlgorithm::Hybrid => "hybrid",
            TimelineAlgorithm::Chronological => "chronological",
            TimelineAlgorithm::Engagement => "engagement",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hybrid" => Some(TimelineAlgorithm::Hybrid),
            "chronological" => Some(TimelineAlgorithm::Chronological),
            "engagement" => Some(TimelineAlgorithm::Engagement),
            _ => None,
        }
    }
}

/// Signal weights used by the ranking engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RankingWeights {
    pub recency: f64,
    pub engagement: f64,
    pub author_affinity: f64,
    pub content_quality: f64,
    pub diversity: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            recency: defaults::RECENCY_WEIGHT,
            engagement: defaults::ENGAGEMENT_WEIGHT,
            author_affinity: defaults::AUTHOR_AFFINITY_WEIGHT,
            content_quality: defaults::CONTENT_QUALITY_WEIGHT,
            diversity: defaults::DIVERSITY_WEIGHT,
        }
    }
}

/// Per-source value holder used for mix ratios, ab weights and caps
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerSource<T> {
    pub following: T,
    pub recommended: T,
    pub trending: T,
    pub lists: T,
}

impl<T: Copy> PerSource<T> {
    pub fn get(&self, source: ContentSource) -> T {
        match source {
            ContentSource::Following => self.following,
            ContentSource::Recommended => self.recommended,
            ContentSource::Trending => self.trending,
            ContentSource::Lists => self.lists,
        }
    }

    pub fn set(&mut self, source: ContentSource, value: T) {
        match source {
            ContentSource::Following => self.following = value,
            ContentSource::Recommended => self.recommended = value,
            ContentSource::Trending => self.trending = value,
            ContentSource::Lists => self.lists = value,
        }
    }
}

/// Effective per-request configuration. Derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    pub algorithm: TimelineAlgorithm,
    pub max_items: usize,
    pub max_age_hours: i64,
    pub min_score_threshold: f64,
    pub weights: RankingWeights,
    pub mix: PerSource<f64>,
    pub caps_per_source: PerSource<usize>,
    pub ab_weights: PerSource<f64>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            algorithm: TimelineAlgorithm::Hybrid,
            max_items: defaults::MAX_ITEMS,
            max_age_hours: defaults::MAX_AGE_HOURS,
            min_score_threshold: defaults::MIN_SCORE_THRESHOLD,
            weights: RankingWeights::default(),
            mix: PerSource {
                following: defaults::FOLLOWING_RATIO,
                recommended: defaults::RECOMMENDED_RATIO,
                trending: defaults::TRENDING_RATIO,
                lists: defaults::LISTS_RATIO,
            },
            caps_per_source: PerSource {
                following: defaults::MAX_ITEMS,
                recommended: defaults::MAX_ITEMS,
                trending: defaults::MAX_ITEMS,
                lists: defaults::MAX_ITEMS,
            },
            ab_weights: PerSource { following: 1.0, recommended: 1.0, trending: 1.0, lists: 1.0 },
        }
    }
}

/// Stored viewer preferences. Zero or negative numeric values mean
/// "use the service default" when merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelinePreferences {
    pub algorithm: Option<TimelineAlgorithm>,
    pub max_items: i64,
    pub max_age_hours: i64,
    pub min_score_threshold: f64,
    pub recency_weight: f64,
    pub engagement_weight: f64,
    pub author_affinity_weight: f64,
    pub content_quality_weight: f64,
    pub diversity_weight: f64,
    pub following_ratio: f64,
    pub recommended_ratio: f64,
    pub trending_ratio: f64,
    pub lists_ratio: f64,
}

/// Request metadata asserted by the caller. The trust boundary of the
/// service: authorization, rate overrides and experiment knobs all read
/// from here.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    values: HashMap<String, String>,
}

impl RequestMetadata {
    pub fn new() -> Self {
        Self { values: HashMap::new() }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn caller_id(&self) -> Option<&str> {
        self.get("caller_id")
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.get("admin"), Some("true") | Some("1"))
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.get("auth_token")
    }

    pub fn rate_rpm(&self) -> Option<u32> {
        self.get("rate_rpm").and_then(|v| v.parse().ok()).filter(|rpm| *rpm > 0)
    }

    pub fn use_overdrive(&self) -> bool {
        matches!(self.get("use_overdrive"), Some("true") | Some("1"))
    }

    pub fn ab_weight(&self, source: ContentSource) -> Option<f64> {
        let key = format!("ab_{}_weight", source.as_str());
        self.get(&key).and_then(|v| v.parse().ok()).filter(|w: &f64| *w >= 0.0)
    }

    pub fn source_cap(&self, source: ContentSource) -> Option<usize> {
        let key = format!("cap_{}", source.as_str());
        self.get(&key).and_then(|v| v.parse().ok())
    }

    pub fn discovery_share(&self) -> Option<f64> {
        self.get("discovery_share")
            .and_then(|v| v.parse::<f64>().ok())
            .map(|share| share.clamp(0.0, 1.0))
    }
}

/// Merges defaults, stored preferences and request overrides
pub struct ConfigResolver;

impl ConfigResolver {
    /// Effective config for a standard timeline request
    pub fn resolve(
        prefs: Option<&TimelinePreferences>,
        metadata: &RequestMetadata,
        requested_algorithm: Option<TimelineAlgorithm>,
    ) -> ViewerConfig {
        let mut config = ViewerConfig::default();

        if let Some(prefs) = prefs {
            Self::apply_preferences(&mut config, prefs);
        }
        if let Some(algorithm) = requested_algorithm {
            config.algorithm = algorithm;
        }
        Self::apply_metadata(&mut config, metadata);
        config
    }

    /// For You: personalized mix, discovery share override honored
    pub fn resolve_for_you(
        prefs: Option<&TimelinePreferences>,
        metadata: &RequestMetadata,
    ) -> ViewerConfig {
        let mut config = Self::resolve(prefs, metadata, Some(TimelineAlgorithm::Hybrid));
        if let Some(share) = metadata.discovery_share() {
            Self::apply_discovery_share(&mut config, share);
        }
        config
    }

    /// Following: strictly chronological, followed authors only
    pub fn resolve_following(
        prefs: Option<&TimelinePreferences>,
        metadata: &RequestMetadata,
    ) -> ViewerConfig {
        let mut config = Self::resolve(prefs, metadata, Some(TimelineAlgorithm::Chronological));
        config.mix = PerSource { following: 1.0, recommended: 0.0, trending: 0.0, lists: 0.0 };
        config
    }

    fn apply_preferences(config: &mut ViewerConfig, prefs: &TimelinePreferences) {
        if let Some(algorithm) = prefs.algorithm {
            config.algorithm = algorithm;
        }
        if prefs.max_items > 0 {
            config.max_items = prefs.max_items as usize;
        }
        if prefs.max_age_hours > 0 {
            config.max_age_hours = prefs.max_age_hours;
        }
        if prefs.min_score_threshold > 0.0 {
            config.min_score_threshold = prefs.min_score_threshold;
        }
        if prefs.recency_weight > 0.0 {
            config.weights.recency = prefs.recency_weight;
        }
        if prefs.engagement_weight > 0.0 {
            config.weights.engagement = prefs.engagement_weight;
        }
        if prefs.author_affinity_weight > 0.0 {
            config.weights.author_affinity = prefs.author_affinity_weight;
        }
        if prefs.content_quality_weight > 0.0 {
            config.weights.content_quality = prefs.content_quality_weight;
        }
        if prefs.diversity_weight > 0.0 {
            config.weights.diversity = prefs.diversity_weight;
        }
        if prefs.following_ratio > 0.0 {
            config.mix.following = prefs.following_ratio;
        }
        if prefs.recommended_ratio > 0.0 {
            config.mix.recommended = prefs.recommended_ratio;
        }
        if prefs.trending_ratio > 0.0 {
            config.mix.trending = prefs.trending_ratio;
        }
        if prefs.lists_ratio > 0.0 {
            config.mix.lists = prefs.lists_ratio;
        }
    }

    fn apply_metadata(config: &mut ViewerConfig, metadata: &RequestMetadata) {
        for source in ContentSource::ALL {
            if let Some(weight) = metadata.ab_weight(source) {
                config.ab_weights.set(source, weight);
            }
            if let Some(cap) = metadata.source_cap(source) {
                config.caps_per_source.set(source, cap.min(config.max_items));
            }
        }
    }

    /// Rescale recommended + trending + lists to sum to `share` and give
    /// the remainder to following.
    fn apply_discovery_share(config: &mut ViewerConfig, share: f64) {
        let discovery_sum = config.mix.recommended + config.mix.trending + config.mix.lists;
        if discovery_sum > 0.0 {
            let scale = share / discovery_sum;
            config.mix.recommended *= scale;
            config.mix.trending *= scale;
            config.mix.lists *= scale;
        } else if share > 0.0 {
            // nothing to rescale, split the share evenly across discovery sources
            let each = share / 3.0;
            config.mix.recommended = each;
            config.mix.trending = each;
            config.mix.lists = each;
        }
        config.mix.following = 1.0 - share;
    }
}
