//! Feed Pagination Coordinator
//!
//! Resolves a feed request into a query plan, resumes from the client's
//! continuation token, drops facts the user has already read and hands back the
//! next token. Trending feeds are a single ranked page.

pub mod strategy;
pub mod token;

use crate::access::DataAccess;
use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::models::{validate_category, Difficulty, Fact};
use crate::recommendation::engine::facts_from_items;
use crate::recommendation::{RankingEngine, UserProfiles};
use crate::store::schema::FACTS;
use crate::store::Item;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

pub use strategy::{plan, FeedFilter, PageOrder, QueryPlan, SortMode};
pub use token::{decode_token, encode_token};

#[derive(Debug, Clone, Default)]
pub struct FeedRequest {
    pub category: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub user_id: Option<String>,
    pub sort: SortMode,
    pub limit: Option<usize>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPage {
    pub items: Vec<Fact>,
    pub pagination: Pagination,
}

#[derive(Clone)]
pub struct FeedCoordinator {
    access: DataAccess,
    profiles: UserProfiles,
    ranking: RankingEngine,
    config: FeedConfig,
    page_size: usize,
}

impl FeedCoordinator {
    pub fn new(
        access: DataAccess,
        profiles: UserProfiles,
        ranking: RankingEngine,
        config: FeedConfig,
        page_size: usize,
    ) -> Self {
        Self {
            access,
            profiles,
            ranking,
            config,
            page_size,
        }
    }

    /// Requested limit, defaulted and clamped to `1..=max_limit`
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit)
    }

    #[instrument(skip(self, request), fields(sort = %request.sort, category = ?request.category))]
    pub async fn page(&self, request: FeedRequest) -> Result<FeedPage> {
        let category = match request.category {
            Some(c) if !c.trim().is_empty() => {
                let c = c.trim().to_string();
                validate_category(&c)?;
                Some(c)
            }
            _ => None,
        };
        let limit = self.effective_limit(request.limit);
        let filter = FeedFilter {
            category,
            difficulty: request.difficulty,
            sort: request.sort,
        };
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.trending_window)
            .map_err(|e| Error::internal(format!("trending window out of range: {}", e)))?;
        let plan = plan(&filter, now, window);

        let start = match (&request.next_token, plan.order) {
            (Some(token), PageOrder::Index | PageOrder::PopularityWithinPage) => {
                Some(decode_token(token, &FACTS, Some(plan.index))?)
            }
            (Some(_), PageOrder::Trending) => {
                debug!("Ignoring continuation token on a trending feed");
                None
            }
            (None, _) => None,
        };
        let read = self.read_facts(request.user_id.as_deref()).await;

        if plan.order == PageOrder::Trending {
            let output = self
                .access
                .query_paginated(
                    &FACTS,
                    &plan.request(),
                    self.page_size,
                    self.config.trending_candidates,
                )
                .await?;
            let candidates = facts_from_items(output.items)
                .into_iter()
                .filter(|fact| !read.contains(&fact.id))
                .collect();
            let mut items = self.ranking.rank_trending(candidates, now);
            items.truncate(limit);
            return Ok(FeedPage {
                items,
                pagination: Pagination::default(),
            });
        }

        let (mut items, cursor) = self.collect_unread(&plan, start, limit, &read).await?;
        if plan.order == PageOrder::PopularityWithinPage {
            items.sort_by(|a, b| {
                b.popularity
                    .partial_cmp(&a.popularity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let next_token = cursor.as_ref().map(encode_token).transpose()?;
        Ok(FeedPage {
            items,
            pagination: Pagination {
                has_more: next_token.is_some(),
                next_token,
            },
        })
    }

    /// Read pages until `limit` unread facts are collected, the index is exhausted,
    /// or `max_query_results` facts have been examined. The returned cursor resumes
    /// right after the last examined fact.
    async fn collect_unread(
        &self,
        plan: &QueryPlan,
        start: Option<Item>,
        limit: usize,
        read: &HashSet<String>,
    ) -> Result<(Vec<Fact>, Option<Item>)> {
        let mut request = plan.request();
        request.exclusive_start = start;
        let mut items = Vec::with_capacity(limit);
        let mut examined = 0;

        loop {
            let wanted = limit - items.len();
            let output = self
                .access
                .query_paginated(&FACTS, &request, self.page_size, wanted)
                .await?;
            examined += output.items.len();
            items.extend(
                facts_from_items(output.items)
                    .into_iter()
                    .filter(|fact| !read.contains(&fact.id)),
            );

            match output.last_key {
                Some(cursor)
                    if items.len() < limit && examined < self.config.max_query_results =>
                {
                    request.exclusive_start = Some(cursor);
                }
                cursor => return Ok((items, cursor)),
            }
        }
    }

    /// Best-effort: a user lookup failure disables read exclusion
    async fn read_facts(&self, user_id: Option<&str>) -> HashSet<String> {
        let Some(user_id) = user_id.filter(|id| !id.trim().is_empty()) else {
            return HashSet::new();
        };
        match self.profiles.preferences_or_default(user_id).await {
            Ok((_, read)) => read.into_iter().collect(),
            Err(e) => {
                warn!(user_id, error = %e, "Read list unavailable, not excluding read facts");
                HashSet::new()
            }
        }
    }
}
