//! Query strategy table
//!
//! Maps `(has category, has difficulty, sort mode)` to the index to query, its key
//! condition, residual filters and how the page is ordered. Pure: no I/O.
//!
//! | category | difficulty | sort     | index                 | key condition                | ordering              |
//! |----------|------------|----------|-----------------------|------------------------------|-----------------------|
//! | yes      | any        | recent   | `category-createdAt`  | category                     | index, newest first   |
//! | no       | any        | recent   | `createdAt-index`     | FACT                         | index, newest first   |
//! | yes      | yes        | popular  | `category-difficulty` | category, difficulty = d     | popularity, per page  |
//! | yes      | no         | popular  | `category-createdAt`  | category                     | popularity, per page  |
//! | no       | any        | popular  | `popularity-index`    | FACT                         | index, most popular   |
//! | any      | any        | trending | `createdAt-index`     | FACT, createdAt >= now - win | trending score        |
//!
//! Any difficulty not expressed in the key condition becomes a filter, as does the
//! category on the trending path.

use crate::error::Result;
use crate::models::{timestamp, Difficulty};
use crate::store::schema::{
    FACTS_BY_CATEGORY_CREATED, FACTS_BY_CATEGORY_DIFFICULTY, FACTS_BY_CREATED,
    FACTS_BY_POPULARITY, FACT_PARTITION,
};
use crate::store::{Condition, KeyCondition, QueryRequest, SortCondition};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Recent,
    Popular,
    Trending,
}

impl SortMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SortMode::Recent => "recent",
            SortMode::Popular => "popular",
            SortMode::Trending => "trending",
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recent" => Ok(SortMode::Recent),
            "popular" => Ok(SortMode::Popular),
            "trending" => Ok(SortMode::Trending),
            other => Err(crate::error::Error::invalid_input(format!(
                "unknown sort mode: {}",
                other
            ))),
        }
    }
}

/// How the items of one page end up ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrder {
    /// The index order is the feed order; pages chain through continuation tokens
    Index,
    /// Index order pages, each re-sorted by popularity
    PopularityWithinPage,
    /// A bounded candidate set ranked by trending score; one page only
    Trending,
}

/// Which filters a feed request carries
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedFilter {
    pub category: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub sort: SortMode,
}

/// The chosen query for a feed request
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub index: &'static str,
    pub key_condition: KeyCondition,
    pub filters: Vec<Condition>,
    pub order: PageOrder,
}

impl QueryPlan {
    /// Newest or most popular first: every feed query scans its index backwards
    pub fn request(&self) -> QueryRequest {
        let mut request =
            QueryRequest::new(Some(self.index), self.key_condition.clone()).descending();
        request.filters = self.filters.clone();
        request
    }
}

fn difficulty_filter(difficulty: Option<Difficulty>) -> Option<Condition> {
    difficulty.map(|d| Condition::equals("difficulty", d.as_str()))
}

pub fn plan(filter: &FeedFilter, now: DateTime<Utc>, trending_window: Duration) -> QueryPlan {
    let category = filter.category.as_deref();
    match (category, filter.difficulty, filter.sort) {
        (_, difficulty, SortMode::Trending) => {
            let since = json!(timestamp::format(&(now - trending_window)));
            QueryPlan {
                index: FACTS_BY_CREATED,
                key_condition: KeyCondition::partition(FACT_PARTITION)
                    .with_sort(SortCondition::Ge(since)),
                filters: category
                    .map(|c| Condition::equals("category", c))
                    .into_iter()
                    .chain(difficulty_filter(difficulty))
                    .collect(),
                order: PageOrder::Trending,
            }
        }
        (Some(category), difficulty, SortMode::Recent) => QueryPlan {
            index: FACTS_BY_CATEGORY_CREATED,
            key_condition: KeyCondition::partition(category),
            filters: difficulty_filter(difficulty).into_iter().collect(),
            order: PageOrder::Index,
        },
        (None, difficulty, SortMode::Recent) => QueryPlan {
            index: FACTS_BY_CREATED,
            key_condition: KeyCondition::partition(FACT_PARTITION),
            filters: difficulty_filter(difficulty).into_iter().collect(),
            order: PageOrder::Index,
        },
        (Some(category), Some(difficulty), SortMode::Popular) => QueryPlan {
            index: FACTS_BY_CATEGORY_DIFFICULTY,
            key_condition: KeyCondition::partition(category)
                .with_sort(SortCondition::Eq(json!(difficulty.as_str()))),
            filters: Vec::new(),
            order: PageOrder::PopularityWithinPage,
        },
        (Some(category), None, SortMode::Popular) => QueryPlan {
            index: FACTS_BY_CATEGORY_CREATED,
            key_condition: KeyCondition::partition(category),
            filters: Vec::new(),
            order: PageOrder::PopularityWithinPage,
        },
        (None, difficulty, SortMode::Popular) => QueryPlan {
            index: FACTS_BY_POPULARITY,
            key_condition: KeyCondition::partition(FACT_PARTITION),
            filters: difficulty_filter(difficulty).into_iter().collect(),
            order: PageOrder::Index,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(category: Option<&str>, difficulty: Option<Difficulty>, sort: SortMode) -> FeedFilter {
        FeedFilter {
            category: category.map(str::to_string),
            difficulty,
            sort,
        }
    }

    #[test]
    fn test_strategy_table() {
        let now = Utc::now();
        let window = Duration::days(7);
        let cases = [
            (filter(None, None, SortMode::Recent), FACTS_BY_CREATED, PageOrder::Index, 0),
            (filter(None, Some(Difficulty::Beginner), SortMode::Recent), FACTS_BY_CREATED, PageOrder::Index, 1),
            (filter(Some("art"), None, SortMode::Recent), FACTS_BY_CATEGORY_CREATED, PageOrder::Index, 0),
            (filter(Some("art"), Some(Difficulty::Advanced), SortMode::Recent), FACTS_BY_CATEGORY_CREATED, PageOrder::Index, 1),
            (filter(None, None, SortMode::Popular), FACTS_BY_POPULARITY, PageOrder::Index, 0),
            (filter(None, Some(Difficulty::Beginner), SortMode::Popular), FACTS_BY_POPULARITY, PageOrder::Index, 1),
            (filter(Some("art"), None, SortMode::Popular), FACTS_BY_CATEGORY_CREATED, PageOrder::PopularityWithinPage, 0),
            (filter(Some("art"), Some(Difficulty::Advanced), SortMode::Popular), FACTS_BY_CATEGORY_DIFFICULTY, PageOrder::PopularityWithinPage, 0),
            (filter(Some("art"), Some(Difficulty::Advanced), SortMode::Trending), FACTS_BY_CREATED, PageOrder::Trending, 2),
        ];

        for (filter, index, order, filters) in cases {
            let plan = plan(&filter, now, window);
            assert_eq!(plan.index, index, "{:?}", filter);
            assert_eq!(plan.order, order, "{:?}", filter);
            assert_eq!(plan.filters.len(), filters, "{:?}", filter);
            assert!(!plan.request().scan_forward);
        }
    }

    #[test]
    fn test_trending_is_bounded_by_window() {
        let now = Utc::now();
        let plan = plan(&filter(None, None, SortMode::Trending), now, Duration::hours(24));
        let expected = json!(timestamp::format(&(now - Duration::hours(24))));
        assert_eq!(plan.key_condition.sort, Some(SortCondition::Ge(expected)));
    }

    #[test]
    fn test_sort_mode_parsing() {
        assert_eq!("popular".parse::<SortMode>().unwrap(), SortMode::Popular);
        assert!("hot".parse::<SortMode>().is_err());
    }
}
