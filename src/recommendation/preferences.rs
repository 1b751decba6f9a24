//! User records and preference profiles
//!
//! Users are created lazily with default preferences the first time they are asked
//! for. The summary lists on the record are a projection maintained by the ledger.

use crate::access::DataAccess;
use crate::error::{Error, Result};
use crate::models::{dedupe, timestamp, Preferences, User};
use crate::store::schema::USERS;
use crate::store::{to_item, Condition, Key, Update, UpdateAction};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct UserProfiles {
    access: DataAccess,
}

impl UserProfiles {
    pub fn new(access: DataAccess) -> Self {
        Self { access }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<User>> {
        self.access
            .get(&USERS, &Key::new(user_id))
            .await?
            .map(User::from_item)
            .transpose()
    }

    /// Fetch a user, creating it with default preferences if absent
    #[instrument(skip(self))]
    pub async fn get_or_create(&self, user_id: &str) -> Result<User> {
        if user_id.trim().is_empty() {
            return Err(Error::invalid_input("user id must not be empty"));
        }
        if let Some(user) = self.get(user_id).await? {
            return Ok(user);
        }

        let user = User::new(user_id, Utc::now());
        match self.access.put_if_absent(&USERS, user.to_item()?).await {
            Ok(()) => {
                info!(user_id, "Created user with default preferences");
                Ok(user)
            }
            // Lost a creation race; the winner's record is authoritative
            Err(e) if e.is_conflict() => self
                .get(user_id)
                .await?
                .ok_or_else(|| Error::not_found("user", user_id)),
            Err(e) => Err(e),
        }
    }

    /// Preferences of a user, defaults when the user has never been seen.
    /// Does not create the user.
    pub async fn preferences_or_default(&self, user_id: &str) -> Result<(Preferences, Vec<String>)> {
        Ok(match self.get(user_id).await? {
            Some(user) => (user.preferences, user.read_facts),
            None => (Preferences::default(), Vec::new()),
        })
    }

    #[instrument(skip(self, preferences))]
    pub async fn update_preferences(
        &self,
        user_id: &str,
        mut preferences: Preferences,
    ) -> Result<User> {
        preferences.categories = dedupe(
            preferences
                .categories
                .into_iter()
                .map(|c| c.trim().to_string())
                .collect(),
        );
        preferences.validate()?;
        self.get_or_create(user_id).await?;

        let prefs: Value = Value::Object(to_item(&preferences)?);
        let update = Update::new(vec![
            UpdateAction::Set("preferences".into(), prefs),
            UpdateAction::Set("updatedAt".into(), Value::String(timestamp::format(&Utc::now()))),
        ])
        .when(Condition::AttributeExists("id".into()));

        let item = self.access.update(&USERS, &Key::new(user_id), &update).await?;
        info!(user_id, "Preferences updated");
        User::from_item(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::Difficulty;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn profiles() -> UserProfiles {
        UserProfiles::new(DataAccess::new(Arc::new(MemoryStore::new()), RetryConfig::default()))
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let profiles = profiles();
        let first = profiles.get_or_create("u1").await.unwrap();
        let second = profiles.get_or_create("u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.preferences, Preferences::default());
    }

    #[tokio::test]
    async fn test_update_preferences_validates_and_dedupes() {
        let profiles = profiles();
        let user = profiles
            .update_preferences(
                "u1",
                Preferences {
                    categories: vec!["science".into(), "science".into(), "art".into()],
                    difficulty: Difficulty::Advanced,
                    reading_time: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(user.preferences.categories, vec!["science", "art"]);
        assert_eq!(user.preferences.difficulty, Difficulty::Advanced);

        let bad = profiles
            .update_preferences(
                "u1",
                Preferences {
                    reading_time: 90,
                    ..Preferences::default()
                },
            )
            .await;
        assert!(matches!(bad, Err(Error::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_unknown_user_gets_default_preferences_without_creation() {
        let profiles = profiles();
        let (prefs, read) = profiles.preferences_or_default("ghost").await.unwrap();
        assert_eq!(prefs, Preferences::default());
        assert!(read.is_empty());
        assert!(profiles.get("ghost").await.unwrap().is_none());
    }
}
