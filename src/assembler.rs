//! Slate assembly
//!
//! Orchestrates one timeline build: budgeted candidate collection from every
//! source, first-seen dedup, content filtering, scoring, then a final walk
//! that enforces the score threshold and per-source caps. Sources run in
//! parallel under a deadline; a failed source degrades the build instead of
//! failing it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::upstream;
use crate::filter::{ContentFilter, DropReason};
use crate::models::{ContentSource, EngagementProfile, Note, RankingSignals, Slate, SlateItem};
use crate::ranking::{sort_by_score, RankingEngine};
use crate::resolver::{TimelineAlgorithm, ViewerConfig};
use crate::sources::{SourceAdapter, SourceError};

/// Result of one slate build
#[derive(Debug)]
pub struct AssemblyOutcome {
    pub slate: Slate,
    /// Sources that failed or timed out; empty when all responded
    pub degraded_sources: Vec<ContentSource>,
    /// Drop reasons recorded by the content filter
    pub filtered: Vec<DropReason>,
}

impl AssemblyOutcome {
    /// True when every configured source failed
    pub fn fully_degraded(&self, attempted: usize) -> bool {
        attempted > 0 && self.degraded_sources.len() == attempted
    }
}

/// Builds slates from the configured sources
pub struct SlateAssembler {
    /// Fixed order: Following, Recommended, Trending, Lists. Merge order
    /// decides dedup tie-breaks, so this must stay stable.
    adapters: Vec<Arc<dyn SourceAdapter>>,
    filter: ContentFilter,
    ranking: Arc<RankingEngine>,
}

impl SlateAssembler {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        filter: ContentFilter,
        ranking: Arc<RankingEngine>,
    ) -> Self {
        Self { adapters, filter, ranking }
    }

    /// Build one slate. `since_floor` further restricts the age window,
    /// used by refresh to return only items newer than the client's state.
    pub async fn build(
        &self,
        viewer_id: &str,
        profile: &EngagementProfile,
        followed: &HashSet<String>,
        config: &ViewerConfig,
        since_floor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AssemblyOutcome {
        let mut since = now - ChronoDuration::hours(config.max_age_hours);
        if let Some(floor) = since_floor {
            since = since.max(floor);
        }

        // Budgeted, parallel collection under a per-source deadline.
        let calls = self.adapters.iter().map(|adapter| {
            let source = adapter.source();
            let budget = source_budget(config, source);
            async move {
                if budget == 0 {
                    return (source, false, Ok(Vec::new()));
                }
                let deadline = Duration::from_millis(upstream::SOURCE_TIMEOUT_MS);
                let result = tokio::time::timeout(
                    deadline,
                    adapter.get_content(viewer_id, profile, since, budget),
                )
                .await
                .unwrap_or(Err(SourceError::Timeout));
                (source, true, result)
            }
        });
        let results = join_all(calls).await;

        let mut degraded_sources = Vec::new();
        let mut candidates: Vec<(Note, ContentSource)> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();

        for (source, attempted, result) in results {
            match result {
                Ok(notes) => {
                    for note in notes {
                        if seen_ids.insert(note.id.clone()) {
                            candidates.push((note, source));
                        }
                    }
                }
                Err(_) if attempted => degraded_sources.push(source),
                Err(_) => {}
            }
        }

        // Filter before scoring; short-circuit order lives in the filter.
        let mut filtered = Vec::new();
        let mut surviving: Vec<(Note, ContentSource)> = Vec::new();
        for (note, source) in candidates {
            match self.filter.evaluate(&note, profile) {
                None => surviving.push((note, source)),
                Some(reason) => filtered.push(reason),
            }
        }

        let mut items = if config.algorithm == TimelineAlgorithm::Chronological {
            chronological_items(surviving, now)
        } else {
            self.ranking.score_notes(surviving, profile, followed, config, now)
        };
        sort_by_score(&mut items);

        // Final walk: age window, score threshold, per-source caps, bound.
        let mut per_source: HashMap<ContentSource, usize> = HashMap::new();
        let mut selected = Vec::with_capacity(config.max_items);
        for item in items {
            if selected.len() >= config.max_items {
                break;
            }
            if item.note.created_at < since {
                continue;
            }
            if item.final_score < config.min_score_threshold {
                continue;
            }
            let used = per_source.entry(item.source).or_insert(0);
            if *used >= config.caps_per_source.get(item.source) {
                continue;
            }
            *used += 1;
            selected.push(item);
        }

        AssemblyOutcome {
            slate: Slate { items: selected, generated_at: now },
            degraded_sources,
            filtered,
        }
    }

    /// Number of sources this build would actually query
    pub fn attempted_sources(&self, config: &ViewerConfig) -> usize {
        self.adapters
            .iter()
            .filter(|adapter| source_budget(config, adapter.source()) > 0)
            .count()
    }
}

/// Budget for one source: floor(max_items x ratio x ab_weight), capped
fn source_budget(config: &ViewerConfig, source: ContentSource) -> usize {
    let ratio = config.mix.get(source);
    let ab_weight = config.ab_weights.get(source);
    if ratio <= 0.0 || ab_weight <= 0.0 {
        return 0;
    }
    let budget = (config.max_items as f64 * ratio * ab_weight).floor() as usize;
    budget.min(config.caps_per_source.get(source))
}

/// Chronological fallback: newest first, score synthesized from the
/// creation time so the shared ordering invariant still holds.
fn chronological_items(candidates: Vec<(Note, ContentSource)>, now: DateTime<Utc>) -> Vec<SlateItem> {
    candidates
        .into_iter()
        .map(|(note, source)| {
            let final_score = note.created_at.timestamp() as f64;
            SlateItem {
                note,
                source,
                signals: RankingSignals::default(),
                final_score,
                injected_at: now,
                injection_reason: "chronological".to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NoteMetrics, NoteVisibility};
    use async_trait::async_trait;

    /// Canned adapter for assembler tests
    struct StubAdapter {
        source: ContentSource,
        result: Result<Vec<Note>, SourceError>,
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn source(&self) -> ContentSource {
            self.source
        }

        async fn get_content(
            &self,
            _viewer_id: &str,
            _profile: &EngagementProfile,
            _since: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<Note>, SourceError> {
            self.result.clone()
        }
    }

    fn note(id: &str, author: &str, minutes_ago: i64) -> Note {
        Note {
            id: id.to_string(),
            author_id: author.to_string(),
            created_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
            visibility: NoteVisibility::Public,
            content: "a candidate note long enough to avoid the short penalty".to_string(),
            metrics: NoteMetrics { views: 100, likes: 20, reposts: 5, replies: 5, quotes: 0 },
            media: vec![],
            hashtags: vec![],
            is_reply: false,
            is_repost: false,
        }
    }

    fn assembler_with(adapters: Vec<Arc<dyn SourceAdapter>>) -> SlateAssembler {
        SlateAssembler::new(adapters, ContentFilter::default(), Arc::new(RankingEngine::new()))
    }

    fn balanced_config() -> ViewerConfig {
        let mut config = ViewerConfig::default();
        config.max_items = 4;
        config.mix.following = 0.25;
        config.mix.recommended = 0.25;
        config.mix.trending = 0.25;
        config.mix.lists = 0.25;
        config.min_score_threshold = 0.0;
        config
    }

    #[tokio::test]
    async fn test_four_source_build_orders_by_score() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StubAdapter {
                source: ContentSource::Following,
                result: Ok(vec![note("a1", "A", 5), note("a2", "B", 30)]),
            }),
            Arc::new(StubAdapter {
                source: ContentSource::Recommended,
                result: Ok(vec![note("r1", "C", 180)]),
            }),
            Arc::new(StubAdapter {
                source: ContentSource::Trending,
                result: Ok(vec![note("t1", "D", 600)]),
            }),
            Arc::new(StubAdapter { source: ContentSource::Lists, result: Ok(vec![]) }),
        ];
        let assembler = assembler_with(adapters);
        let mut followed = HashSet::new();
        followed.insert("A".to_string());
        followed.insert("B".to_string());

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &followed,
                &balanced_config(),
                None,
                Utc::now(),
            )
            .await;

        assert!(outcome.degraded_sources.is_empty());
        assert_eq!(outcome.slate.len(), 4);
        for pair in outcome.slate.items.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
        let ids: HashSet<&str> =
            outcome.slate.items.iter().map(|item| item.note.id.as_str()).collect();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn test_dedup_first_seen_wins() {
        let shared = note("x", "A", 10);
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StubAdapter {
                source: ContentSource::Following,
                result: Ok(vec![shared.clone()]),
            }),
            Arc::new(StubAdapter {
                source: ContentSource::Recommended,
                result: Ok(vec![shared.clone(), note("r2", "C", 20)]),
            }),
        ];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.mix.following = 0.5;
        config.mix.recommended = 0.5;

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                None,
                Utc::now(),
            )
            .await;

        let x_items: Vec<&SlateItem> =
            outcome.slate.items.iter().filter(|item| item.note.id == "x").collect();
        assert_eq!(x_items.len(), 1);
        assert_eq!(x_items[0].source, ContentSource::Following);
    }

    #[tokio::test]
    async fn test_per_source_cap_enforced() {
        let trending: Vec<Note> = (0..10).map(|i| note(&format!("t{}", i), &format!("auth{}", i), 10)).collect();
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StubAdapter {
            source: ContentSource::Trending,
            result: Ok(trending),
        })];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.max_items = 10;
        config.mix.trending = 1.0;
        config.caps_per_source.trending = 2;

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                None,
                Utc::now(),
            )
            .await;

        let trending_count = outcome
            .slate
            .items
            .iter()
            .filter(|item| item.source == ContentSource::Trending)
            .count();
        assert!(trending_count <= 2);
    }

    #[tokio::test]
    async fn test_degraded_source_still_builds() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StubAdapter {
                source: ContentSource::Following,
                result: Ok(vec![note("a1", "A", 5)]),
            }),
            Arc::new(StubAdapter {
                source: ContentSource::Recommended,
                result: Err(SourceError::Timeout),
            }),
        ];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.mix.following = 0.5;
        config.mix.recommended = 0.5;

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                None,
                Utc::now(),
            )
            .await;

        assert_eq!(outcome.degraded_sources, vec![ContentSource::Recommended]);
        assert_eq!(outcome.slate.len(), 1);
        assert!(!outcome.fully_degraded(2));
    }

    #[tokio::test]
    async fn test_all_sources_failed_returns_empty_slate() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StubAdapter {
                source: ContentSource::Following,
                result: Err(SourceError::Unavailable("down".to_string())),
            }),
            Arc::new(StubAdapter {
                source: ContentSource::Trending,
                result: Err(SourceError::Timeout),
            }),
        ];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.mix.following = 0.5;
        config.mix.trending = 0.5;

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                None,
                Utc::now(),
            )
            .await;

        assert!(outcome.slate.is_empty());
        assert_eq!(outcome.degraded_sources.len(), 2);
        assert!(outcome.fully_degraded(2));
    }

    #[tokio::test]
    async fn test_zero_ab_weight_removes_source() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StubAdapter {
            source: ContentSource::Trending,
            result: Ok(vec![note("t1", "D", 5)]),
        })];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.mix.trending = 1.0;
        config.ab_weights.trending = 0.0;

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                None,
                Utc::now(),
            )
            .await;

        assert!(outcome.slate.is_empty());
        // a zero-budget source is skipped, not degraded
        assert!(outcome.degraded_sources.is_empty());
        assert_eq!(assembler.attempted_sources(&config), 0);
    }

    #[tokio::test]
    async fn test_chronological_skips_ranking() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StubAdapter {
            source: ContentSource::Following,
            result: Ok(vec![note("old", "A", 300), note("new", "A", 1)]),
        })];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.algorithm = TimelineAlgorithm::Chronological;
        config.mix.following = 1.0;

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                None,
                Utc::now(),
            )
            .await;

        assert_eq!(outcome.slate.items[0].note.id, "new");
        assert_eq!(outcome.slate.items[0].injection_reason, "chronological");
    }

    #[tokio::test]
    async fn test_since_floor_excludes_older_notes() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StubAdapter {
            source: ContentSource::Following,
            result: Ok(vec![note("old", "A", 120), note("new", "A", 5)]),
        })];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.mix.following = 1.0;

        let floor = Utc::now() - ChronoDuration::minutes(30);
        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                Some(floor),
                Utc::now(),
            )
            .await;

        assert_eq!(outcome.slate.len(), 1);
        assert_eq!(outcome.slate.items[0].note.id, "new");
    }

    #[tokio::test]
    async fn test_score_threshold_filters_items() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StubAdapter {
            source: ContentSource::Following,
            result: Ok(vec![note("n1", "A", 5)]),
        })];
        let assembler = assembler_with(adapters);
        let mut config = balanced_config();
        config.mix.following = 1.0;
        config.min_score_threshold = 100.0; // impossible bar

        let outcome = assembler
            .build(
                "v1",
                &EngagementProfile::new("v1", Utc::now()),
                &HashSet::new(),
                &config,
                None,
                Utc::now(),
            )
            .await;

        assert!(outcome.slate.is_empty());
    }
}
