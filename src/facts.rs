//! Fact repository
//!
//! Facts arrive through bulk import, change content through the administrative
//! update path, and change counters only through the [`MetricsUpdater`].
//!
//! [`MetricsUpdater`]: crate::engagement::MetricsUpdater

use crate::access::DataAccess;
use crate::error::{Error, Result};
use crate::models::{
    dedupe, timestamp, validate_category, validate_reading_time, Counters, Difficulty, Fact,
};
use crate::store::schema::FACTS;
use crate::store::{Condition, Key, Update, UpdateAction, WriteOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};
use uuid::Uuid;

/// A fact as produced by the ingestion process. Any popularity it carries is
/// ignored; popularity is derived from the counters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFact {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub content: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub reading_time: u32,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: Counters,
}

impl NewFact {
    fn into_fact(self, now: DateTime<Utc>) -> Result<Fact> {
        let created_at = timestamp::truncate(self.created_at.unwrap_or(now));
        let mut fact = Fact {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: self.title.trim().to_string(),
            content: self.content,
            category: self.category,
            tags: self.tags,
            difficulty: self.difficulty,
            reading_time: self.reading_time,
            source: self.source,
            source_url: self.source_url,
            created_at,
            updated_at: created_at,
            counters: self.counters,
            popularity: 0.0,
        };
        fact.normalize();
        fact.validate()?;
        Ok(fact)
    }
}

/// Content fields an administrator may change. Counters and popularity are not here.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FactUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub difficulty: Option<Difficulty>,
    pub reading_time: Option<u32>,
    pub source: Option<String>,
    pub source_url: Option<String>,
}

impl FactUpdate {
    fn actions(self, now: DateTime<Utc>) -> Result<Vec<UpdateAction>> {
        let mut actions = Vec::new();
        let mut set = |attr: &str, value: Value| actions.push(UpdateAction::Set(attr.into(), value));

        if let Some(title) = self.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(Error::invalid_input("fact title must not be empty"));
            }
            set("title", json!(title));
        }
        if let Some(content) = self.content {
            set("content", json!(content));
        }
        if let Some(category) = self.category {
            let category = category.trim().to_string();
            validate_category(&category)?;
            set("category", json!(category));
        }
        if let Some(tags) = self.tags {
            set("tags", json!(dedupe(tags)));
        }
        if let Some(difficulty) = self.difficulty {
            set("difficulty", json!(difficulty.as_str()));
        }
        if let Some(minutes) = self.reading_time {
            validate_reading_time(minutes)?;
            set("readingTime", json!(minutes));
        }
        if let Some(source) = self.source {
            set("source", json!(source));
        }
        if let Some(url) = self.source_url {
            set("sourceUrl", json!(url));
        }
        if actions.is_empty() {
            return Err(Error::invalid_input("update names no fields"));
        }
        actions.push(UpdateAction::Set(
            "updatedAt".into(),
            json!(timestamp::format(&now)),
        ));
        Ok(actions)
    }
}

#[derive(Debug, Clone)]
pub struct FactRepository {
    access: DataAccess,
}

impl FactRepository {
    pub fn new(access: DataAccess) -> Self {
        Self { access }
    }

    pub async fn get(&self, fact_id: &str) -> Result<Fact> {
        self.access
            .get(&FACTS, &Key::new(fact_id))
            .await?
            .map(Fact::from_item)
            .transpose()?
            .ok_or_else(|| Error::not_found("fact", fact_id))
    }

    /// Facts for the given ids that exist, in no particular order
    pub async fn batch_get(&self, ids: &[String]) -> Result<Vec<Fact>> {
        let keys = dedupe(ids.to_vec()).into_iter().map(Key::new).collect();
        self.access
            .batch_get(&FACTS, keys)
            .await?
            .into_iter()
            .map(Fact::from_item)
            .collect()
    }

    /// Validate and store a batch of facts. Nothing is written if any record is invalid.
    #[instrument(skip(self, facts), fields(count = facts.len()))]
    pub async fn import(&self, facts: Vec<NewFact>) -> Result<Vec<Fact>> {
        let now = Utc::now();
        let facts = facts
            .into_iter()
            .enumerate()
            .map(|(position, new)| {
                new.into_fact(now).map_err(|e| match e {
                    Error::InvalidInput { message } => {
                        Error::invalid_input(format!("fact #{}: {}", position, message))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let items = facts.iter().map(Fact::to_item).collect::<Result<Vec<_>>>()?;
        self.access
            .batch_write(&FACTS, WriteOperation::Put, items)
            .await?;
        info!(count = facts.len(), "Imported facts");
        Ok(facts)
    }

    /// Administrative content update; bumps `updatedAt`
    #[instrument(skip(self, update))]
    pub async fn update(&self, fact_id: &str, update: FactUpdate) -> Result<Fact> {
        let update = Update::new(update.actions(Utc::now())?)
            .when(Condition::AttributeExists("id".into()));
        let item = self
            .access
            .update(&FACTS, &Key::new(fact_id), &update)
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    Error::not_found("fact", fact_id)
                } else {
                    e
                }
            })?;
        info!(fact_id, "Fact content updated");
        Fact::from_item(item)
    }

    /// Administrative hard delete. Ledger entries referring to the fact are kept.
    #[instrument(skip(self))]
    pub async fn delete(&self, fact_id: &str) -> Result<()> {
        self.get(fact_id).await?;
        self.access.delete(&FACTS, Key::new(fact_id)).await?;
        info!(fact_id, "Fact deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn repo() -> FactRepository {
        FactRepository::new(DataAccess::new(
            Arc::new(MemoryStore::new()),
            RetryConfig::default(),
        ))
    }

    fn new_fact(raw: Value) -> NewFact {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_import_derives_popularity_and_dedupes_tags() {
        let repo = repo();
        let imported = repo
            .import(vec![new_fact(json!({
                "id": "f1",
                "title": "Octopus hearts",
                "content": "An octopus has three hearts.",
                "category": "nature",
                "tags": ["animals", "unique", "animals"],
                "difficulty": "beginner",
                "readingTime": 1,
                "popularity": 87,
                "likes": 4,
                "views": 2
            }))])
            .await
            .unwrap();
        assert_eq!(imported[0].popularity, 13.0);

        let stored = repo.get("f1").await.unwrap();
        assert_eq!(stored.tags, vec!["animals", "unique"]);
        assert_eq!(stored.counters.likes, 4);
        assert_eq!(stored.popularity, 13.0);
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_batch_atomically() {
        let repo = repo();
        let result = repo
            .import(vec![
                new_fact(json!({"id": "ok", "title": "t", "content": "c", "category": "art", "readingTime": 2})),
                new_fact(json!({"id": "bad", "title": "t", "content": "c", "category": "Art", "readingTime": 2})),
            ])
            .await;
        assert!(matches!(result, Err(Error::InvalidInput { .. })));
        assert!(matches!(repo.get("ok").await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_changes_content_but_not_counters() {
        let repo = repo();
        repo.import(vec![new_fact(json!({
            "id": "f1", "title": "old", "content": "c", "category": "art",
            "readingTime": 2, "shares": 3
        }))])
        .await
        .unwrap();

        let updated = repo
            .update(
                "f1",
                FactUpdate {
                    title: Some("new".into()),
                    reading_time: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "new");
        assert_eq!(updated.reading_time, 4);
        assert_eq!(updated.counters.shares, 3);
        assert_eq!(updated.popularity, 15.0);
        assert!(updated.updated_at >= updated.created_at);

        let empty = repo.update("f1", FactUpdate::default()).await;
        assert!(matches!(empty, Err(Error::InvalidInput { .. })));
        let missing = repo
            .update("nope", FactUpdate { content: Some("x".into()), ..Default::default() })
            .await;
        assert!(matches!(missing, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_requires_existing_fact() {
        let repo = repo();
        repo.import(vec![new_fact(json!({
            "id": "f1", "title": "t", "content": "c", "category": "art", "readingTime": 2
        }))])
        .await
        .unwrap();
        repo.delete("f1").await.unwrap();
        assert!(matches!(repo.delete("f1").await, Err(Error::NotFound { .. })));
    }
}
