//! Metrics Updater
//!
//! Applies engagement counter deltas to a fact and recomputes its popularity from the
//! counters. Two modes:
//!
//! - **eventual** (default): an atomic counter add, then a separate popularity write
//!   computed from the counters that add returned. Interleaved writers may leave a
//!   stale popularity until the next update on the same fact. A failed popularity
//!   write is reported as [`PopularityRefresh::Deferred`], not as an error.
//! - **strict**: read the counters, then write new counters and popularity in one
//!   transaction conditioned on the values read; lost races are retried.
//!
//! In both modes a counter never goes below zero. Decrements are conditioned on the
//! stored value covering them and are clamped to it when it does not.
//! [`MetricsUpdater::retract`] deletes ledger entries and takes them off the counter
//! in the same transaction.

use crate::access::{retry_when, DataAccess};
use crate::config::EngagementConfig;
use crate::error::{Error, Result};
use crate::models::{Counters, InteractionType};
use crate::store::schema::{FACTS, INTERACTIONS};
use crate::store::{Condition, Item, Key, TransactItem, Update, UpdateAction, MAX_TRANSACT_ITEMS};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// What happened to the popularity score after a counter update
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum PopularityRefresh {
    Recomputed { score: f64 },
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub fact_id: String,
    pub counters: Counters,
    pub popularity: PopularityRefresh,
}

impl MetricsUpdate {
    pub fn is_complete(&self) -> bool {
        matches!(self.popularity, PopularityRefresh::Recomputed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct MetricsUpdater {
    access: DataAccess,
    strict: bool,
}

impl MetricsUpdater {
    pub fn new(access: DataAccess, config: &EngagementConfig) -> Self {
        Self {
            access,
            strict: config.strict_popularity,
        }
    }

    pub async fn increment(&self, fact_id: &str, kind: InteractionType) -> Result<MetricsUpdate> {
        self.apply(fact_id, &[(kind, 1)]).await
    }

    pub async fn decrement(&self, fact_id: &str, kind: InteractionType) -> Result<MetricsUpdate> {
        self.apply(fact_id, &[(kind, -1)]).await
    }

    /// Recompute popularity from the stored counters
    pub async fn refresh(&self, fact_id: &str) -> Result<MetricsUpdate> {
        self.apply(fact_id, &[]).await
    }

    /// Delete the ledger entries at `entries` and take them off the fact's `kind`
    /// counter, one transaction per chunk. Popularity is left to the next
    /// [`apply`](Self::apply) or [`refresh`](Self::refresh).
    ///
    /// `NotFound` if the fact does not exist; `Conflict` if an entry was already gone.
    pub async fn retract(&self, fact_id: &str, kind: InteractionType, entries: &[Key]) -> Result<()> {
        let fact_key = Key::new(fact_id);
        let attempts = self.access.retry_policy().max_retries;

        for chunk in entries.chunks(MAX_TRANSACT_ITEMS - 1) {
            let mut take = chunk.len() as i64;
            let mut conflicts = 0;
            loop {
                let mut items: Vec<TransactItem> = chunk
                    .iter()
                    .map(|key| TransactItem::Delete {
                        table: &INTERACTIONS,
                        key: key.clone(),
                        conditions: vec![Condition::AttributeExists(
                            INTERACTIONS.partition_key.to_string(),
                        )],
                    })
                    .collect();
                items.push(TransactItem::Update {
                    table: &FACTS,
                    key: fact_key.clone(),
                    update: counter_update(&[(kind, -take)]),
                });

                match self.access.transact_write(items).await {
                    Ok(()) => break,
                    Err(e) if e.is_conflict() && conflicts < attempts => {
                        conflicts += 1;
                        let stored = stored_counter(&self.fetch(fact_id).await?, kind);
                        if stored >= take {
                            return Err(e);
                        }
                        debug!(fact_id, kind = %kind, stored, take, "Clamping retraction to stored counter");
                        take = stored;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Apply signed counter deltas to a fact. `NotFound` if the fact does not exist.
    pub async fn apply(
        &self,
        fact_id: &str,
        deltas: &[(InteractionType, i64)],
    ) -> Result<MetricsUpdate> {
        if self.strict {
            let this = self;
            retry_when(
                self.access.retry_policy(),
                "strict_metrics_update",
                |e| e.is_conflict() || e.is_retryable(),
                move || this.apply_strict(fact_id, deltas),
            )
            .await
        } else {
            self.apply_eventual(fact_id, deltas).await
        }
    }

    async fn fetch(&self, fact_id: &str) -> Result<Item> {
        self.access
            .get(&FACTS, &Key::new(fact_id))
            .await?
            .ok_or_else(|| Error::not_found("fact", fact_id))
    }

    async fn apply_eventual(
        &self,
        fact_id: &str,
        deltas: &[(InteractionType, i64)],
    ) -> Result<MetricsUpdate> {
        let key = Key::new(fact_id);
        let mut deltas = deltas.to_vec();
        let mut conflicts = 0;

        let item = loop {
            match self.access.update(&FACTS, &key, &counter_update(&deltas)).await {
                Ok(item) => break item,
                Err(e) if e.is_conflict() && conflicts < self.access.retry_policy().max_retries => {
                    // Either the fact is gone or a decrement outran its counter
                    conflicts += 1;
                    let current = self.fetch(fact_id).await?;
                    deltas = clamp_decrements(&deltas, &current);
                }
                Err(e) => return Err(e),
            }
        };
        let counters = Counters::from_item(&item);
        let score = counters.popularity();

        let refresh = Update::new(vec![UpdateAction::Set("popularity".into(), json!(score))])
            .when(Condition::AttributeExists("id".into()));
        let popularity = match self.access.update(&FACTS, &key, &refresh).await {
            Ok(_) => PopularityRefresh::Recomputed { score },
            Err(e) => {
                warn!(fact_id, error = %e, "Popularity refresh failed, counters updated");
                metrics::counter!("popularity_refresh_failed_total").increment(1);
                PopularityRefresh::Deferred {
                    reason: e.to_string(),
                }
            }
        };

        debug!(fact_id, ?counters, "Engagement counters updated");
        Ok(MetricsUpdate {
            fact_id: fact_id.to_string(),
            counters,
            popularity,
        })
    }

    async fn apply_strict(
        &self,
        fact_id: &str,
        deltas: &[(InteractionType, i64)],
    ) -> Result<MetricsUpdate> {
        let key = Key::new(fact_id);
        let current = self.fetch(fact_id).await?;

        let mut conditions = vec![Condition::AttributeExists("id".into())];
        let mut next = current.clone();
        for kind in InteractionType::ALL {
            let attr = kind.counter_attr();
            match current.get(attr) {
                Some(value) => conditions.push(Condition::Equals(attr.to_string(), value.clone())),
                None => conditions.push(Condition::AttributeNotExists(attr.to_string())),
            }
        }

        let mut actions = Vec::new();
        for (kind, delta) in deltas.iter().filter(|(_, d)| *d != 0) {
            let attr = kind.counter_attr();
            let raw = (next.get(attr).and_then(Value::as_i64).unwrap_or(0) + delta).max(0);
            next.insert(attr.to_string(), json!(raw));
            actions.push(UpdateAction::Set(attr.to_string(), json!(raw)));
        }
        let counters = Counters::from_item(&next);
        let score = counters.popularity();
        actions.push(UpdateAction::Set("popularity".into(), json!(score)));

        self.access
            .transact_write(vec![TransactItem::Update {
                table: &FACTS,
                key,
                update: Update {
                    actions,
                    conditions,
                },
            }])
            .await?;

        Ok(MetricsUpdate {
            fact_id: fact_id.to_string(),
            counters,
            popularity: PopularityRefresh::Recomputed { score },
        })
    }
}

/// Counter adds on an existing fact; each decrement requires the stored counter to cover it
fn counter_update(deltas: &[(InteractionType, i64)]) -> Update {
    let mut update = Update::new(Vec::new()).when(Condition::AttributeExists("id".into()));
    for &(kind, delta) in deltas.iter().filter(|(_, d)| *d != 0) {
        let attr = kind.counter_attr().to_string();
        if delta < 0 {
            update = update.when(Condition::GreaterOrEqual(attr.clone(), json!(delta.abs())));
        }
        update.actions.push(UpdateAction::Add(attr, delta));
    }
    update
}

fn stored_counter(item: &Item, kind: InteractionType) -> i64 {
    Counters::from_item(item).get(kind) as i64
}

/// Shrink decrements to what the stored counters can absorb
fn clamp_decrements(deltas: &[(InteractionType, i64)], current: &Item) -> Vec<(InteractionType, i64)> {
    deltas
        .iter()
        .map(|&(kind, delta)| (kind, delta.max(-stored_counter(current, kind))))
        .filter(|(_, delta)| *delta != 0)
        .collect()
}
