//! Interaction Ledger
//!
//! Append-only per-user log of engagement events, keyed by `(userId, timestamp)` and
//! indexed by fact and by type. Entries are never updated: a retraction deletes the
//! entry, a correction is a delete plus an insert.
//!
//! Like and dislike are mutually exclusive per (user, fact): recording one removes
//! any existing entries of the other and takes their counts off the fact.

pub mod analysis;

use crate::access::DataAccess;
use crate::engagement::{MetricsUpdate, MetricsUpdater};
use crate::error::{Error, Result};
use crate::models::{timestamp, Counters, Interaction, InteractionType};
use crate::store::schema::{FACTS, INTERACTIONS, INTERACTIONS_BY_FACT, INTERACTIONS_BY_TYPE, USERS};
use crate::store::{Condition, Key, KeyCondition, QueryRequest, SortCondition, Update, UpdateAction};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

pub use analysis::{analyze_patterns, engagement_stats, EngagementStats, InteractionPatterns};

/// Attempts at finding a free millisecond when two entries of a user collide
const TIMESTAMP_SLOTS: u32 = 5;

/// Inclusive `[from, to]` bound on interaction timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(Error::invalid_input("time window starts after it ends"));
            }
        }
        Ok(())
    }

    fn sort_condition(&self) -> Option<SortCondition> {
        let bound = |at: DateTime<Utc>| json!(timestamp::format(&at));
        match (self.from, self.to) {
            (Some(from), Some(to)) => Some(SortCondition::Between(bound(from), bound(to))),
            (Some(from), None) => Some(SortCondition::Ge(bound(from))),
            (None, Some(to)) => Some(SortCondition::Le(bound(to))),
            (None, None) => None,
        }
    }

    fn apply(&self, condition: KeyCondition) -> KeyCondition {
        match self.sort_condition() {
            Some(sort) => condition.with_sort(sort),
            None => condition,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub interaction: Interaction,
    /// Opposite-type entries removed for the same (user, fact)
    pub removed_opposite: usize,
    pub metrics: MetricsUpdate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOutcome {
    pub interaction: Interaction,
    pub metrics: MetricsUpdate,
}

#[derive(Debug, Clone)]
pub struct InteractionLedger {
    access: DataAccess,
    metrics: MetricsUpdater,
    page_size: usize,
    max_results: usize,
}

impl InteractionLedger {
    pub fn new(
        access: DataAccess,
        metrics: MetricsUpdater,
        page_size: usize,
        max_results: usize,
    ) -> Self {
        Self {
            access,
            metrics,
            page_size,
            max_results,
        }
    }

    /// Record an interaction. The fact must exist.
    #[instrument(skip(self))]
    pub async fn record(
        &self,
        user_id: &str,
        fact_id: &str,
        kind: InteractionType,
        at: Option<DateTime<Utc>>,
    ) -> Result<RecordOutcome> {
        if user_id.trim().is_empty() {
            return Err(Error::invalid_input("userId must not be empty"));
        }
        if self.access.get(&FACTS, &Key::new(fact_id)).await?.is_none() {
            return Err(Error::not_found("fact", fact_id));
        }

        let mut removed_opposite = 0;
        if let Some(opposite) = kind.opposite() {
            let stale = self.find_pair(user_id, fact_id, opposite, None).await?;
            if !stale.is_empty() {
                let keys: Vec<Key> = stale.iter().map(Interaction::key).collect();
                self.metrics.retract(fact_id, opposite, &keys).await?;
                removed_opposite = stale.len();
                debug!(user_id, fact_id, removed = removed_opposite, "Removed opposite entries");
            }
        }

        let entry = Interaction::new(user_id, fact_id, kind, at.unwrap_or_else(Utc::now));
        let interaction = match self.insert(entry).await {
            Ok(interaction) => interaction,
            Err(e) => {
                if let Some(opposite) = kind.opposite().filter(|_| removed_opposite > 0) {
                    // opposite entries are already gone
                    if let Err(refresh) = self.metrics.refresh(fact_id).await {
                        warn!(fact_id, error = %refresh, "Popularity refresh after failed insert failed");
                    }
                    self.project_user(user_id, fact_id, opposite, false).await;
                }
                return Err(e);
            }
        };
        let metrics = self.metrics.increment(fact_id, kind).await?;
        self.project_user(user_id, fact_id, kind, true).await;

        info!(user_id, fact_id, kind = %kind, "Interaction recorded");
        Ok(RecordOutcome {
            interaction,
            removed_opposite,
            metrics,
        })
    }

    /// Delete the most recent (user, fact, type) entry. `NotFound` when there is none.
    #[instrument(skip(self))]
    pub async fn remove(
        &self,
        user_id: &str,
        fact_id: &str,
        kind: InteractionType,
    ) -> Result<RemoveOutcome> {
        let latest = self
            .find_pair(user_id, fact_id, kind, Some(1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::not_found("interaction", format!("{}/{}/{}", user_id, fact_id, kind))
            })?;

        self.metrics
            .retract(fact_id, kind, &[latest.key()])
            .await?;
        let metrics = self.metrics.refresh(fact_id).await?;

        if self.find_pair(user_id, fact_id, kind, Some(1)).await?.is_empty() {
            self.project_user(user_id, fact_id, kind, false).await;
        }

        info!(user_id, fact_id, kind = %kind, "Interaction removed");
        Ok(RemoveOutcome {
            interaction: latest,
            metrics,
        })
    }

    /// A user's interactions, most recent first
    pub async fn by_user(
        &self,
        user_id: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<Interaction>> {
        window.validate()?;
        let request = QueryRequest::new(None, window.apply(KeyCondition::partition(user_id)))
            .descending();
        self.collect(&request, limit).await
    }

    /// A fact's interactions, most recent first
    pub async fn by_fact(
        &self,
        fact_id: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<Interaction>> {
        window.validate()?;
        let request = QueryRequest::new(
            Some(INTERACTIONS_BY_FACT),
            window.apply(KeyCondition::partition(fact_id)),
        )
        .descending();
        self.collect(&request, limit).await
    }

    /// Interactions of one type across all users, most recent first
    pub async fn by_type(
        &self,
        kind: InteractionType,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<Interaction>> {
        window.validate()?;
        let request = QueryRequest::new(
            Some(INTERACTIONS_BY_TYPE),
            window.apply(KeyCondition::partition(kind.as_str())),
        )
        .descending();
        self.collect(&request, limit).await
    }

    /// Engagement stats of a fact, read off its counters. `NotFound` if the fact is gone.
    pub async fn stats(&self, fact_id: &str) -> Result<EngagementStats> {
        let item = self
            .access
            .get(&FACTS, &Key::new(fact_id))
            .await?
            .ok_or_else(|| Error::not_found("fact", fact_id))?;
        Ok(EngagementStats::from_counters(&Counters::from_item(&item)))
    }

    /// Best-effort: a failed history read yields empty patterns
    pub async fn patterns(&self, user_id: &str) -> InteractionPatterns {
        match self
            .by_user(user_id, TimeWindow::default(), self.max_results)
            .await
        {
            Ok(history) => analyze_patterns(&history),
            Err(e) => {
                warn!(user_id, error = %e, "Pattern analysis degraded to empty result");
                InteractionPatterns {
                    by_hour: vec![0; 24],
                    ..Default::default()
                }
            }
        }
    }

    async fn collect(&self, request: &QueryRequest, limit: usize) -> Result<Vec<Interaction>> {
        let limit = limit.min(self.max_results);
        let output = self
            .access
            .query_paginated(&INTERACTIONS, request, self.page_size, limit)
            .await?;
        output.items.into_iter().map(Interaction::from_item).collect()
    }

    /// Entries of `kind` for (user, fact), most recent first
    async fn find_pair(
        &self,
        user_id: &str,
        fact_id: &str,
        kind: InteractionType,
        limit: Option<usize>,
    ) -> Result<Vec<Interaction>> {
        let request = QueryRequest::new(None, KeyCondition::partition(user_id))
            .descending()
            .filter(Condition::equals("factId", fact_id))
            .filter(Condition::equals("type", kind.as_str()));
        self.collect(&request, limit.unwrap_or(self.max_results))
            .await
    }

    /// Conditional insert; a taken (user, timestamp) slot moves the entry forward 1ms
    async fn insert(&self, mut interaction: Interaction) -> Result<Interaction> {
        for _ in 0..TIMESTAMP_SLOTS {
            match self
                .access
                .put_if_absent(&INTERACTIONS, interaction.to_item()?)
                .await
            {
                Ok(()) => return Ok(interaction),
                Err(e) if e.is_conflict() => {
                    interaction.timestamp += Duration::milliseconds(1);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "no free timestamp slot for user {}",
            interaction.user_id
        )))
    }

    /// Best-effort update of the user's cached summary lists
    async fn project_user(&self, user_id: &str, fact_id: &str, kind: InteractionType, added: bool) {
        let mut actions = Vec::new();
        if let Some(list) = kind.user_list_attr() {
            if added {
                actions.push(UpdateAction::AddToSet(list.into(), fact_id.into()));
            } else {
                actions.push(UpdateAction::RemoveFromSet(list.into(), fact_id.into()));
            }
        }
        if added {
            if let Some(list) = kind.opposite().and_then(InteractionType::user_list_attr) {
                actions.push(UpdateAction::RemoveFromSet(list.into(), fact_id.into()));
            }
        }
        if actions.is_empty() {
            return;
        }
        actions.push(UpdateAction::Set(
            "updatedAt".into(),
            json!(timestamp::format(&Utc::now())),
        ));

        let update = Update::new(actions).when(Condition::AttributeExists("id".into()));
        if let Err(e) = self
            .access
            .update(&USERS, &Key::new(user_id), &update)
            .await
        {
            if e.is_conflict() {
                debug!(user_id, "No user record to project interaction onto");
            } else {
                warn!(user_id, error = %e, "User summary projection failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngagementConfig, RetryConfig};
    use crate::models::{Counters, Fact, User};
    use crate::store::{Fault, MemoryStore, PartitionedStore, StoreOp, WriteOperation};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn fact(id: &str) -> Fact {
        let now = Utc::now();
        Fact {
            id: id.into(),
            title: "t".into(),
            content: "c".into(),
            category: "science".into(),
            tags: vec![],
            difficulty: crate::models::Difficulty::Beginner,
            reading_time: 2,
            source: "Wikipedia".into(),
            source_url: None,
            created_at: now,
            updated_at: now,
            counters: Counters::default(),
            popularity: 0.0,
        }
    }

    async fn setup() -> (Arc<MemoryStore>, InteractionLedger) {
        setup_capped(500).await
    }

    async fn setup_capped(max_results: usize) -> (Arc<MemoryStore>, InteractionLedger) {
        let store = Arc::new(MemoryStore::new());
        let access = DataAccess::new(
            store.clone(),
            RetryConfig {
                max_retries: 2,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
        );
        access
            .batch_write(
                &FACTS,
                WriteOperation::Put,
                vec![fact("f1").to_item().unwrap(), fact("f2").to_item().unwrap()],
            )
            .await
            .unwrap();
        access
            .put_if_absent(&USERS, User::new("u1", Utc::now()).to_item().unwrap())
            .await
            .unwrap();
        let metrics = MetricsUpdater::new(access.clone(), &EngagementConfig::default());
        (store, InteractionLedger::new(access, metrics, 10, max_results))
    }

    async fn counters(store: &MemoryStore, id: &str) -> Counters {
        Counters::from_item(&store.get_item(&FACTS, &Key::new(id)).await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn test_like_replaces_dislike() {
        let (store, ledger) = setup().await;
        ledger.record("u1", "f1", InteractionType::Dislike, None).await.unwrap();
        let outcome = ledger.record("u1", "f1", InteractionType::Like, None).await.unwrap();
        assert_eq!(outcome.removed_opposite, 1);

        let c = counters(&store, "f1").await;
        assert_eq!((c.likes, c.dislikes), (1, 0));

        let entries = ledger.by_user("u1", TimeWindow::default(), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, InteractionType::Like);

        let user = User::from_item(store.get_item(&USERS, &Key::new("u1")).await.unwrap().unwrap())
            .unwrap();
        assert_eq!(user.liked_facts, vec!["f1".to_string()]);
        assert!(user.disliked_facts.is_empty());
    }

    #[tokio::test]
    async fn test_record_requires_existing_fact() {
        let (store, ledger) = setup().await;
        let result = ledger.record("u1", "missing", InteractionType::Like, None).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(store.item_count(&INTERACTIONS).await, 0);
    }

    #[tokio::test]
    async fn test_same_millisecond_entries_do_not_overwrite() {
        let (_store, ledger) = setup().await;
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        ledger.record("u1", "f1", InteractionType::View, Some(at)).await.unwrap();
        let second = ledger.record("u1", "f2", InteractionType::View, Some(at)).await.unwrap();
        assert_eq!(second.interaction.timestamp, at + Duration::milliseconds(1));
        assert_eq!(ledger.by_user("u1", TimeWindow::default(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_most_recent_and_missing() {
        let (store, ledger) = setup().await;
        let early = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap();
        ledger.record("u1", "f1", InteractionType::Share, Some(early)).await.unwrap();
        ledger.record("u1", "f1", InteractionType::Share, Some(late)).await.unwrap();

        let removed = ledger.remove("u1", "f1", InteractionType::Share).await.unwrap();
        assert_eq!(removed.interaction.timestamp, late);
        assert_eq!(counters(&store, "f1").await.shares, 1);

        let before = counters(&store, "f2").await;
        let missing = ledger.remove("u1", "f2", InteractionType::Like).await;
        assert!(matches!(missing, Err(Error::NotFound { .. })));
        assert_eq!(counters(&store, "f2").await, before);
    }

    #[tokio::test]
    async fn test_window_queries() {
        let (_store, ledger) = setup().await;
        for day in 1..=5 {
            let at = Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap();
            ledger.record("u1", "f1", InteractionType::Read, Some(at)).await.unwrap();
        }
        let window = TimeWindow {
            from: Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()),
            to: Some(Utc.with_ymd_and_hms(2024, 5, 4, 23, 59, 59).unwrap()),
        };
        assert_eq!(ledger.by_fact("f1", window, 50).await.unwrap().len(), 3);
        assert_eq!(ledger.by_type(InteractionType::Read, window, 2).await.unwrap().len(), 2);

        let inverted = TimeWindow {
            from: window.to,
            to: window.from,
        };
        assert!(ledger.by_user("u1", inverted, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_share_stats_end_to_end() {
        let (_store, ledger) = setup().await;
        ledger.record("u2", "f2", InteractionType::Share, None).await.unwrap();
        let stats = ledger.stats("f2").await.unwrap();
        assert_eq!(stats.share, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.engagement_score, 5.0);
    }

    #[tokio::test]
    async fn test_failed_insert_after_swap_leaves_counters_matching_entries() {
        let (store, ledger) = setup().await;
        ledger.record("u1", "f1", InteractionType::Dislike, None).await.unwrap();

        // the swap transaction commits, every insert attempt after it fails
        store.inject_after(StoreOp::TransactWrite, 1, Fault::Unavailable, 10);
        let result = ledger.record("u1", "f1", InteractionType::Like, None).await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));

        let entries = ledger.by_fact("f1", TimeWindow::default(), 50).await.unwrap();
        let count = |kind| entries.iter().filter(|i| i.kind == kind).count() as u64;
        let c = counters(&store, "f1").await;
        assert_eq!(c.dislikes, count(InteractionType::Dislike));
        assert_eq!(c.likes, count(InteractionType::Like));
        assert_eq!((c.likes, c.dislikes), (0, 0));

        let user = User::from_item(store.get_item(&USERS, &Key::new("u1")).await.unwrap().unwrap())
            .unwrap();
        assert!(user.disliked_facts.is_empty());
    }

    #[tokio::test]
    async fn test_recorded_entry_equals_its_stored_form() {
        let (_store, ledger) = setup().await;
        let outcome = ledger.record("u1", "f1", InteractionType::View, None).await.unwrap();
        let stored = ledger.by_user("u1", TimeWindow::default(), 10).await.unwrap();
        assert_eq!(stored, vec![outcome.interaction]);
    }

    #[tokio::test]
    async fn test_stats_cover_more_entries_than_a_query_returns() {
        let (_store, ledger) = setup_capped(5).await;
        for user in 0..7 {
            ledger
                .record(&format!("u{}", user), "f2", InteractionType::Read, None)
                .await
                .unwrap();
        }
        assert_eq!(ledger.by_fact("f2", TimeWindow::default(), 50).await.unwrap().len(), 5);

        let stats = ledger.stats("f2").await.unwrap();
        assert_eq!(stats.read, 7);
        assert_eq!(stats.total, 7);
        assert!(matches!(ledger.stats("missing").await, Err(Error::NotFound { .. })));
    }
}
