//! Ranking Engine
//!
//! Produces an ordered, deduplicated top-K list of facts for a user:
//!
//! 1. category affinity from the user's recent interactions
//! 2. candidates from one category×difficulty query per preferred category (fan-out),
//!    or one popularity-ordered query filtered by difficulty and reading time
//! 3. drop facts the user has already read
//! 4. weighted scoring (rayon, off the async runtime)
//! 5. stable sort, top K, scores stripped
//!
//! Any failure in the pipeline falls back to popularity order. Ranking never raises.

use super::metrics::{PerformanceTimer, RankingMetrics};
use super::preferences::UserProfiles;
use super::scoring::{
    category_affinity, personalized_score, rank_by, similarity_score, sort_scored,
    trending_score, ScoringContext, ScoringWeights,
};
use crate::access::DataAccess;
use crate::error::{Error, Result};
use crate::ledger::{InteractionLedger, TimeWindow};
use crate::models::{Fact, Interaction, InteractionType, Preferences};
use crate::store::schema::{
    FACTS, FACTS_BY_CATEGORY_DIFFICULTY, FACTS_BY_POPULARITY, FACT_PARTITION,
};
use crate::store::{Condition, Item, Key, KeyCondition, QueryRequest, SortCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Which path produced a recommendation list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Personalized,
    PopularityFallback,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Personalized => "personalized",
            Algorithm::PopularityFallback => "popularity_fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendations {
    pub items: Vec<Fact>,
    pub algorithm: Algorithm,
}

/// Tunables the engine reads from configuration
#[derive(Debug, Clone, Copy)]
pub struct RankingLimits {
    pub page_size: usize,
    pub history_size: usize,
    pub max_results: usize,
}

#[derive(Clone)]
pub struct RankingEngine {
    access: DataAccess,
    ledger: InteractionLedger,
    profiles: UserProfiles,
    weights: ScoringWeights,
    limits: RankingLimits,
}

impl RankingEngine {
    pub fn new(
        access: DataAccess,
        ledger: InteractionLedger,
        profiles: UserProfiles,
        limits: RankingLimits,
    ) -> Self {
        Self::with_weights(access, ledger, profiles, limits, ScoringWeights::default())
    }

    pub fn with_weights(
        access: DataAccess,
        ledger: InteractionLedger,
        profiles: UserProfiles,
        limits: RankingLimits,
        weights: ScoringWeights,
    ) -> Self {
        Self {
            access,
            ledger,
            profiles,
            weights,
            limits,
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Top `limit` facts for a user. Never fails: degraded requests come back in
    /// popularity order tagged [`Algorithm::PopularityFallback`].
    pub async fn recommend(&self, user_id: &str, limit: usize) -> Recommendations {
        let _timer = PerformanceTimer::recorded("recommend", "ranking_duration_ms");

        let (prefs, mut read) = match self.profiles.preferences_or_default(user_id).await {
            Ok((prefs, read)) => (prefs, read.into_iter().collect::<HashSet<_>>()),
            Err(e) => {
                warn!(user_id, error = %e, "Could not load user, ranking by popularity");
                return self.fallback(limit, &HashSet::new()).await;
            }
        };

        let history = match self
            .ledger
            .by_user(user_id, TimeWindow::default(), self.limits.history_size)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(user_id, error = %e, "Interaction history unavailable, ranking without it");
                Vec::new()
            }
        };
        read.extend(
            history
                .iter()
                .filter(|i| i.kind == InteractionType::Read)
                .map(|i| i.fact_id.clone()),
        );

        match self.personalized(user_id, &prefs, &history, &read, limit).await {
            Ok(items) if !items.is_empty() => Recommendations {
                items,
                algorithm: Algorithm::Personalized,
            },
            Ok(_) => {
                debug!(user_id, "No personalized candidates, ranking by popularity");
                self.fallback(limit, &read).await
            }
            Err(e) => {
                warn!(user_id, error = %e, "Personalized ranking failed, ranking by popularity");
                self.fallback(limit, &read).await
            }
        }
    }

    async fn personalized(
        &self,
        user_id: &str,
        prefs: &Preferences,
        history: &[Interaction],
        read: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        let timer = PerformanceTimer::new("personalized_ranking");
        let mut summary = RankingMetrics {
            user_id: user_id.to_string(),
            history_size: history.len(),
            ..Default::default()
        };

        let affinity = self.affinity(history).await;
        summary.affinity_categories = affinity.len();

        let (candidates, failed) = self.candidates(prefs, limit).await?;
        summary.failed_branches = failed;
        let before = candidates.len();
        let candidates: Vec<Fact> = candidates
            .into_iter()
            .filter(|fact| !read.contains(&fact.id))
            .collect();
        summary.excluded_read = before - candidates.len();
        summary.candidates_considered = candidates.len();

        let prefs = prefs.clone();
        let weights = self.weights.clone();
        let now = Utc::now();
        let mut ranked = tokio::task::spawn_blocking(move || {
            use rayon::prelude::*;
            let _scoring_timer = PerformanceTimer::new("parallel_scoring");
            let ctx = ScoringContext {
                prefs: &prefs,
                affinity: &affinity,
                now,
            };

            // indexed collect keeps retrieval order for the stable sort
            let mut scored: Vec<(f64, Fact)> = candidates
                .into_par_iter()
                .map(|fact| (personalized_score(&fact, &ctx, &weights), fact))
                .collect();
            sort_scored(&mut scored);
            scored
        })
        .await?;

        ranked.truncate(limit);
        summary.returned = ranked.len();
        summary.duration_ms = timer.elapsed_ms();
        debug!(?summary, "Personalized ranking complete");

        Ok(ranked.into_iter().map(|(_, fact)| fact).collect())
    }

    /// Best-effort: lookup failures yield an empty map
    async fn affinity(&self, history: &[Interaction]) -> HashMap<String, f64> {
        if history.is_empty() {
            return HashMap::new();
        }
        let mut seen = HashSet::new();
        let keys: Vec<Key> = history
            .iter()
            .filter(|i| seen.insert(i.fact_id.as_str()))
            .map(|i| Key::new(i.fact_id.clone()))
            .collect();

        match self.access.batch_get(&FACTS, keys).await {
            Ok(items) => {
                let categories = items
                    .iter()
                    .filter_map(|item| {
                        let id = item.get("id")?.as_str()?;
                        let category = item.get("category")?.as_str()?;
                        Some((id.to_string(), category.to_string()))
                    })
                    .collect();
                category_affinity(history, &categories)
            }
            Err(e) => {
                warn!(error = %e, "Category affinity lookup failed, using empty affinity");
                HashMap::new()
            }
        }
    }

    /// Candidate pool of roughly `2 * limit` facts, and the number of failed branches
    async fn candidates(&self, prefs: &Preferences, limit: usize) -> Result<(Vec<Fact>, usize)> {
        let pool_size = (2 * limit).max(1);

        let (items, failed) = if prefs.categories.is_empty() {
            let request = QueryRequest::new(
                Some(FACTS_BY_POPULARITY),
                KeyCondition::partition(FACT_PARTITION),
            )
            .descending()
            .filter(Condition::equals("difficulty", prefs.difficulty.as_str()))
            .filter(Condition::LessOrEqual(
                "readingTime".into(),
                json!(prefs.reading_time),
            ));
            let output = self
                .access
                .query_paginated(&FACTS, &request, self.limits.page_size, pool_size)
                .await?;
            (output.items, 0)
        } else {
            let per_category = pool_size.div_ceil(prefs.categories.len());
            let requests = prefs
                .categories
                .iter()
                .map(|category| {
                    QueryRequest::new(
                        Some(FACTS_BY_CATEGORY_DIFFICULTY),
                        KeyCondition::partition(category.as_str())
                            .with_sort(SortCondition::Eq(json!(prefs.difficulty.as_str()))),
                    )
                })
                .collect();
            let fan_out = self
                .access
                .parallel_query(&FACTS, requests, self.limits.page_size, per_category)
                .await;
            if fan_out.failed == prefs.categories.len() {
                return Err(Error::unavailable(
                    "candidate_query",
                    "every category branch failed",
                ));
            }
            let failed = fan_out.failed;
            (fan_out.into_items(), failed)
        };

        Ok((facts_from_items(items), failed))
    }

    /// Most popular facts, skipping `exclude`. Best-effort: failures yield an empty list.
    pub async fn fallback(&self, limit: usize, exclude: &HashSet<String>) -> Recommendations {
        metrics::counter!("ranking_fallback_total").increment(1);
        let request = QueryRequest::new(
            Some(FACTS_BY_POPULARITY),
            KeyCondition::partition(FACT_PARTITION),
        )
        .descending();
        let wanted = (limit + exclude.len()).min(self.limits.max_results.max(limit));

        let items = match self
            .access
            .query_paginated(&FACTS, &request, self.limits.page_size, wanted)
            .await
        {
            Ok(output) => facts_from_items(output.items)
                .into_iter()
                .filter(|fact| !exclude.contains(&fact.id))
                .take(limit)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Popularity fallback failed, returning nothing");
                Vec::new()
            }
        };

        Recommendations {
            items,
            algorithm: Algorithm::PopularityFallback,
        }
    }

    /// Facts in the same category and difficulty as `fact_id`, most similar first
    pub async fn similar(&self, fact_id: &str, limit: usize) -> Result<Vec<Fact>> {
        let source = self
            .access
            .get(&FACTS, &Key::new(fact_id))
            .await?
            .map(Fact::from_item)
            .transpose()?
            .ok_or_else(|| Error::not_found("fact", fact_id))?;

        let request = QueryRequest::new(
            Some(FACTS_BY_CATEGORY_DIFFICULTY),
            KeyCondition::partition(source.category.as_str())
                .with_sort(SortCondition::Eq(json!(source.difficulty.as_str()))),
        );
        let output = self
            .access
            .query_paginated(
                &FACTS,
                &request,
                self.limits.page_size,
                self.limits.max_results,
            )
            .await?;

        let candidates: Vec<Fact> = facts_from_items(output.items)
            .into_iter()
            .filter(|fact| fact.id != source.id)
            .collect();
        let mut ranked = rank_by(candidates, |fact| {
            similarity_score(&source, fact, &self.weights)
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Order a bounded candidate set by trending score
    pub fn rank_trending(&self, facts: Vec<Fact>, now: DateTime<Utc>) -> Vec<Fact> {
        rank_by(facts, |fact| trending_score(fact, now, &self.weights))
    }
}

/// Decode fact items, dropping duplicates and records that do not parse
pub fn facts_from_items(items: Vec<Item>) -> Vec<Fact> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter_map(|item| match Fact::from_item(item) {
            Ok(fact) => Some(fact),
            Err(e) => {
                warn!(error = %e, "Skipping malformed fact record");
                None
            }
        })
        .filter(|fact| seen.insert(fact.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngagementConfig, RetryConfig};
    use crate::engagement::MetricsUpdater;
    use crate::models::{Counters, Difficulty};
    use crate::store::{Fault, MemoryStore, StoreOp, WriteOperation};
    use chrono::Duration;
    use std::sync::Arc;

    fn fact(id: &str, category: &str, difficulty: Difficulty, popularity: f64) -> Fact {
        let created = Utc::now() - Duration::days(30);
        Fact {
            id: id.into(),
            title: id.into(),
            content: String::new(),
            category: category.into(),
            tags: vec![],
            difficulty,
            reading_time: 3,
            source: String::new(),
            source_url: None,
            created_at: created,
            updated_at: created,
            counters: Counters::default(),
            popularity,
        }
    }

    async fn engine(facts: Vec<Fact>) -> (Arc<MemoryStore>, RankingEngine, InteractionLedger) {
        let store = Arc::new(MemoryStore::new());
        let access = DataAccess::new(
            store.clone(),
            RetryConfig {
                max_retries: 1,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(1),
            },
        );
        let items = facts.iter().map(|f| f.to_item().unwrap()).collect();
        access
            .batch_write(&FACTS, WriteOperation::Put, items)
            .await
            .unwrap();
        let metrics = MetricsUpdater::new(access.clone(), &EngagementConfig::default());
        let ledger = InteractionLedger::new(access.clone(), metrics, 50, 500);
        let profiles = UserProfiles::new(access.clone());
        let limits = RankingLimits {
            page_size: 50,
            history_size: 100,
            max_results: 500,
        };
        (
            store,
            RankingEngine::new(access, ledger.clone(), profiles, limits),
            ledger,
        )
    }

    #[tokio::test]
    async fn test_new_user_is_ranked_by_popularity() {
        let (_store, engine, _) = engine(vec![
            fact("low", "art", Difficulty::Intermediate, 10.0),
            fact("high", "art", Difficulty::Intermediate, 60.0),
        ])
        .await;
        let recs = engine.recommend("nobody", 2).await;
        assert_eq!(recs.algorithm, Algorithm::Personalized);
        let ids: Vec<_> = recs.items.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_read_facts_are_excluded() {
        let (_store, engine, ledger) = engine(vec![
            fact("a", "art", Difficulty::Intermediate, 10.0),
            fact("b", "art", Difficulty::Intermediate, 60.0),
        ])
        .await;
        ledger
            .record("u1", "b", InteractionType::Read, None)
            .await
            .unwrap();
        let recs = engine.recommend("u1", 5).await;
        assert!(recs.items.iter().all(|f| f.id != "b"));
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_without_raising() {
        let (store, engine, _) = engine(vec![fact("a", "art", Difficulty::Advanced, 1.0)]).await;
        // history and candidate queries each spend both attempts; the fallback query succeeds
        store.inject(StoreOp::Query, Fault::Unavailable, 4);
        let recs = engine.recommend("u1", 3).await;
        assert_eq!(recs.algorithm, Algorithm::PopularityFallback);
        let ids: Vec<_> = recs.items.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_similar_excludes_source_and_prefers_tag_overlap() {
        let mut source = fact("s", "science", Difficulty::Beginner, 20.0);
        source.tags = vec!["space".into(), "stars".into()];
        let mut close = fact("close", "science", Difficulty::Beginner, 80.0);
        close.tags = vec!["space".into(), "stars".into()];
        let far = fact("far", "science", Difficulty::Beginner, 20.0);
        let other = fact("other", "art", Difficulty::Beginner, 20.0);

        let (_store, engine, _) = engine(vec![source, close, far, other]).await;
        let similar = engine.similar("s", 5).await.unwrap();
        let ids: Vec<_> = similar.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["close", "far"]);

        assert!(matches!(
            engine.similar("missing", 5).await,
            Err(Error::NotFound { .. })
        ));
    }
}
