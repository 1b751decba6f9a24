//! Scoring formulas
//!
//! Deterministic weighted heuristics; no I/O. Three scores:
//! - personalized: popularity, category affinity, difficulty/reading-time fit, recency
//! - similarity between two facts
//! - trending: engagement with exponential age decay

use crate::models::{Fact, Interaction, Preferences};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Ranking weights
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub popularity: f64,
    pub category_affinity: f64,
    pub difficulty_match: f64,
    pub reading_time_fit: f64,
    pub recency_bonus: f64,
    pub recency_window: Duration,

    pub similar_category: f64,
    pub similar_tag: f64,
    pub similar_reading_time: f64,
    pub similar_popularity: f64,

    pub trending_popularity: f64,
    pub trending_likes: f64,
    pub trending_shares: f64,
    pub trending_views: f64,
    /// Hours for the trending score to decay by a factor of e
    pub trending_decay_hours: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            popularity: 0.3,
            category_affinity: 0.4,
            difficulty_match: 20.0,
            reading_time_fit: 10.0,
            recency_bonus: 5.0,
            recency_window: Duration::days(7),

            similar_category: 50.0,
            similar_tag: 10.0,
            similar_reading_time: 10.0,
            similar_popularity: 5.0,

            trending_popularity: 0.4,
            trending_likes: 0.3,
            trending_shares: 0.2,
            trending_views: 0.1,
            trending_decay_hours: 24.0,
        }
    }
}

/// Everything the personalized score needs besides the fact itself
pub struct ScoringContext<'a> {
    pub prefs: &'a Preferences,
    pub affinity: &'a HashMap<String, f64>,
    pub now: DateTime<Utc>,
}

fn flag(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

/// Per-category sum of interaction weights over a user's history.
/// Interactions whose fact category is unknown are skipped.
pub fn category_affinity(
    history: &[Interaction],
    categories: &HashMap<String, String>,
) -> HashMap<String, f64> {
    let mut affinity = HashMap::new();
    for interaction in history {
        if let Some(category) = categories.get(&interaction.fact_id) {
            *affinity.entry(category.clone()).or_insert(0.0) += interaction.kind.weight();
        }
    }
    affinity
}

pub fn personalized_score(fact: &Fact, ctx: &ScoringContext<'_>, w: &ScoringWeights) -> f64 {
    let affinity = ctx.affinity.get(&fact.category).copied().unwrap_or(0.0);
    let recent = ctx.now.signed_duration_since(fact.created_at) <= w.recency_window;

    let score = w.popularity * fact.popularity
        + w.category_affinity * affinity
        + w.difficulty_match * flag(fact.difficulty == ctx.prefs.difficulty)
        + w.reading_time_fit * flag(fact.reading_time <= ctx.prefs.reading_time)
        + w.recency_bonus * flag(recent);
    score.max(0.0)
}

pub fn similarity_score(source: &Fact, candidate: &Fact, w: &ScoringWeights) -> f64 {
    let common_tags = candidate
        .tags
        .iter()
        .filter(|tag| source.tags.contains(tag))
        .count();
    let reading_gap = (source.reading_time as i64 - candidate.reading_time as i64).abs();
    let popularity_gap = (source.popularity - candidate.popularity).abs();

    w.similar_category * flag(source.category == candidate.category)
        + w.similar_tag * common_tags as f64
        + w.similar_reading_time * flag(reading_gap <= 1)
        + w.similar_popularity * flag(popularity_gap <= 10.0)
}

pub fn trending_score(fact: &Fact, now: DateTime<Utc>, w: &ScoringWeights) -> f64 {
    let engagement = w.trending_popularity * fact.popularity
        + w.trending_likes * fact.counters.likes as f64
        + w.trending_shares * fact.counters.shares as f64
        + w.trending_views * fact.counters.views as f64;
    let age_hours = (now.signed_duration_since(fact.created_at).num_milliseconds() as f64
        / 3_600_000.0)
        .max(0.0);
    engagement * (-age_hours / w.trending_decay_hours).exp()
}

/// Stable descending sort by score; ties keep input order
pub fn rank_by<T>(items: Vec<T>, score: impl Fn(&T) -> f64) -> Vec<T> {
    let mut scored: Vec<(f64, T)> = items.into_iter().map(|item| (score(&item), item)).collect();
    sort_scored(&mut scored);
    scored.into_iter().map(|(_, item)| item).collect()
}

pub fn sort_scored<T>(scored: &mut [(f64, T)]) {
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Counters, Difficulty, InteractionType};
    use proptest::prelude::*;

    fn fact(id: &str, category: &str, popularity: f64) -> Fact {
        let created = Utc::now() - Duration::days(30);
        Fact {
            id: id.into(),
            title: id.into(),
            content: String::new(),
            category: category.into(),
            tags: vec!["a".into(), "b".into(), "c".into()],
            difficulty: Difficulty::Intermediate,
            reading_time: 5,
            source: String::new(),
            source_url: None,
            created_at: created,
            updated_at: created,
            counters: Counters::default(),
            popularity,
        }
    }

    #[test]
    fn test_affinity_weights() {
        let history = vec![
            Interaction::new("u", "f1", InteractionType::Like, Utc::now()),
            Interaction::new("u", "f1", InteractionType::View, Utc::now()),
            Interaction::new("u", "f2", InteractionType::Dislike, Utc::now()),
            Interaction::new("u", "gone", InteractionType::Share, Utc::now()),
        ];
        let categories = HashMap::from([
            ("f1".to_string(), "science".to_string()),
            ("f2".to_string(), "art".to_string()),
        ]);
        let affinity = category_affinity(&history, &categories);
        assert_eq!(affinity["science"], 3.5);
        assert_eq!(affinity["art"], -2.0);
        assert_eq!(affinity.len(), 2);
    }

    #[test]
    fn test_personalized_components() {
        let prefs = Preferences::default();
        let affinity = HashMap::from([("science".to_string(), 10.0)]);
        let ctx = ScoringContext {
            prefs: &prefs,
            affinity: &affinity,
            now: Utc::now(),
        };
        let w = ScoringWeights::default();
        // 0.3*50 + 0.4*10 + 20 + 10
        assert!((personalized_score(&fact("f", "science", 50.0), &ctx, &w) - 49.0).abs() < 1e-9);

        let mut fresh = fact("g", "history", 0.0);
        fresh.created_at = Utc::now() - Duration::days(1);
        fresh.difficulty = Difficulty::Advanced;
        fresh.reading_time = 20;
        assert!((personalized_score(&fresh, &ctx, &w) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_clamped_at_zero() {
        let prefs = Preferences::default();
        let affinity = HashMap::from([("art".to_string(), -500.0)]);
        let ctx = ScoringContext {
            prefs: &prefs,
            affinity: &affinity,
            now: Utc::now(),
        };
        assert_eq!(
            personalized_score(&fact("f", "art", 0.0), &ctx, &ScoringWeights::default()),
            0.0
        );
    }

    #[test]
    fn test_rank_by_is_stable() {
        let ranked = rank_by(vec![("a", 1.0), ("b", 2.0), ("c", 1.0)], |x| x.1);
        let ids: Vec<_> = ranked.iter().map(|x| x.0).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    proptest! {
        #[test]
        fn prop_trending_decays_with_age(popularity in 0.1f64..100.0, likes in 0u64..1000) {
            let w = ScoringWeights::default();
            let now = Utc::now();
            let mut young = fact("y", "science", popularity);
            young.counters.likes = likes;
            young.created_at = now - Duration::hours(1);
            let mut old = young.clone();
            old.created_at = now - Duration::hours(48);
            prop_assert!(trending_score(&young, now, &w) > trending_score(&old, now, &w));
        }

        #[test]
        fn prop_tag_overlap_is_monotonic(drop in 0usize..3) {
            let w = ScoringWeights::default();
            let source = fact("s", "science", 40.0);
            let twin = source.clone();
            let mut fewer = source.clone();
            fewer.tags.remove(drop);
            prop_assert!(similarity_score(&source, &fewer, &w) < similarity_score(&source, &twin, &w));
        }

        #[test]
        fn prop_popularity_orders_otherwise_identical_facts(a in 0.0f64..100.0, b in 0.0f64..100.0) {
            prop_assume!(a > b);
            let prefs = Preferences::default();
            let affinity = HashMap::new();
            let ctx = ScoringContext { prefs: &prefs, affinity: &affinity, now: Utc::now() };
            let w = ScoringWeights::default();
            let ranked = rank_by(vec![fact("low", "x", b), fact("high", "x", a)], |f| personalized_score(f, &ctx, &w));
            prop_assert_eq!(&ranked[0].id, "high");
        }

        #[test]
        fn prop_popularity_matches_counter_formula(
            likes in 0u64..50, dislikes in 0u64..50, shares in 0u64..50, reads in 0u64..50, views in 0u64..50,
        ) {
            let counters = Counters { views, likes, dislikes, shares, reads };
            let raw = 3.0 * likes as f64 + 5.0 * shares as f64 + reads as f64 + 0.5 * views as f64 - 2.0 * dislikes as f64;
            prop_assert_eq!(counters.popularity(), raw.clamp(0.0, 100.0));
        }
    }
}
