//! Fact, User and Interaction records
//!
//! Records are stored as camelCase JSON documents. Timestamps are written as
//! fixed-width RFC 3339 UTC strings with millisecond precision so that string order
//! in the store's sort keys equals chronological order.

use crate::error::{Error, Result};
use crate::store::schema::{FACT_PARTITION, GSI_PARTITION_ATTR};
use crate::store::{from_item, to_item, Item, Key};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Serde helpers for stored timestamps
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Drop precision the stored form cannot carry, so a record equals its reload
    pub fn truncate(at: DateTime<Utc>) -> DateTime<Utc> {
        at.trunc_subsecs(3)
    }

    pub fn format(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {}", raw)))
    }
}

/// Counters may have been driven below zero by interleaved writers; read them as >= 0
fn lenient_counter<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|v| v.max(0) as u64)
            .or_else(|| n.as_f64().map(|f| f.max(0.0).round() as u64))
            .unwrap_or(0),
        _ => 0,
    })
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "beginner" => Ok(Difficulty::Beginner),
            "intermediate" => Ok(Difficulty::Intermediate),
            "advanced" => Ok(Difficulty::Advanced),
            other => Err(Error::invalid_input(format!("unknown difficulty: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionType {
    Like,
    Dislike,
    Share,
    Read,
    View,
}

impl InteractionType {
    pub const ALL: [InteractionType; 5] = [
        InteractionType::Like,
        InteractionType::Dislike,
        InteractionType::Share,
        InteractionType::Read,
        InteractionType::View,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InteractionType::Like => "like",
            InteractionType::Dislike => "dislike",
            InteractionType::Share => "share",
            InteractionType::Read => "read",
            InteractionType::View => "view",
        }
    }

    /// Engagement weight, shared by popularity, affinity and engagement scores
    pub fn weight(self) -> f64 {
        match self {
            InteractionType::Like => 3.0,
            InteractionType::Dislike => -2.0,
            InteractionType::Share => 5.0,
            InteractionType::Read => 1.0,
            InteractionType::View => 0.5,
        }
    }

    /// Fact attribute counting interactions of this type
    pub fn counter_attr(self) -> &'static str {
        match self {
            InteractionType::Like => "likes",
            InteractionType::Dislike => "dislikes",
            InteractionType::Share => "shares",
            InteractionType::Read => "reads",
            InteractionType::View => "views",
        }
    }

    /// The type that cannot coexist with this one for the same (user, fact)
    pub fn opposite(self) -> Option<InteractionType> {
        match self {
            InteractionType::Like => Some(InteractionType::Dislike),
            InteractionType::Dislike => Some(InteractionType::Like),
            _ => None,
        }
    }

    /// User summary list this type is projected into
    pub fn user_list_attr(self) -> Option<&'static str> {
        match self {
            InteractionType::Like => Some("likedFacts"),
            InteractionType::Dislike => Some("dislikedFacts"),
            InteractionType::Share => Some("sharedFacts"),
            InteractionType::Read => Some("readFacts"),
            InteractionType::View => None,
        }
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        InteractionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::invalid_input(format!("unknown interaction type: {}", s)))
    }
}

// ============================================================================
// Fact
// ============================================================================

/// Engagement counters of a fact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default, deserialize_with = "lenient_counter")]
    pub views: u64,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub likes: u64,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub dislikes: u64,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub shares: u64,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub reads: u64,
}

impl Counters {
    pub fn get(&self, kind: InteractionType) -> u64 {
        match kind {
            InteractionType::Like => self.likes,
            InteractionType::Dislike => self.dislikes,
            InteractionType::Share => self.shares,
            InteractionType::Read => self.reads,
            InteractionType::View => self.views,
        }
    }

    /// Read counters off a stored fact item
    pub fn from_item(item: &Item) -> Self {
        let read = |kind: InteractionType| {
            item.get(kind.counter_attr())
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64)))
                .unwrap_or(0)
                .max(0) as u64
        };
        Self {
            views: read(InteractionType::View),
            likes: read(InteractionType::Like),
            dislikes: read(InteractionType::Dislike),
            shares: read(InteractionType::Share),
            reads: read(InteractionType::Read),
        }
    }

    /// `clamp(0, 100, 3·likes + 5·shares + reads + 0.5·views - 2·dislikes)`
    pub fn popularity(&self) -> f64 {
        let raw: f64 = InteractionType::ALL
            .into_iter()
            .map(|kind| kind.weight() * self.get(kind) as f64)
            .sum();
        raw.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub difficulty: Difficulty,
    pub reading_time: u32,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: Counters,
    #[serde(default)]
    pub popularity: f64,
}

impl Fact {
    pub fn from_item(item: Item) -> Result<Self> {
        from_item(item)
    }

    /// Stored form, placed in the global popularity/creation indexes
    pub fn to_item(&self) -> Result<Item> {
        let mut item = to_item(self)?;
        item.insert(
            GSI_PARTITION_ATTR.to_string(),
            Value::String(FACT_PARTITION.to_string()),
        );
        Ok(item)
    }

    /// Dedupe tags (first occurrence wins) and derive popularity from the counters
    pub fn normalize(&mut self) {
        self.category = self.category.trim().to_string();
        self.tags = dedupe(std::mem::take(&mut self.tags));
        self.popularity = self.counters.popularity();
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_input("fact id must not be empty"));
        }
        if self.title.trim().is_empty() {
            return Err(Error::invalid_input("fact title must not be empty"));
        }
        validate_category(&self.category)?;
        validate_reading_time(self.reading_time)
    }
}

pub fn validate_category(category: &str) -> Result<()> {
    if category.is_empty() || category.chars().any(|c| c.is_uppercase()) {
        return Err(Error::invalid_input(format!(
            "category must be a non-empty lowercase string, got {:?}",
            category
        )));
    }
    Ok(())
}

pub fn validate_reading_time(minutes: u32) -> Result<()> {
    if !(1..=30).contains(&minutes) {
        return Err(Error::invalid_input(format!(
            "reading time must be between 1 and 30 minutes, got {}",
            minutes
        )));
    }
    Ok(())
}

pub fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Maximum reading time in minutes
    #[serde(default = "default_reading_time")]
    pub reading_time: u32,
}

fn default_reading_time() -> u32 {
    5
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            difficulty: Difficulty::Intermediate,
            reading_time: default_reading_time(),
        }
    }
}

impl Preferences {
    pub fn validate(&self) -> Result<()> {
        for category in &self.categories {
            validate_category(category)?;
        }
        validate_reading_time(self.reading_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub liked_facts: Vec<String>,
    #[serde(default)]
    pub disliked_facts: Vec<String>,
    #[serde(default)]
    pub shared_facts: Vec<String>,
    #[serde(default)]
    pub read_facts: Vec<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let now = timestamp::truncate(now);
        Self {
            id: id.into(),
            preferences: Preferences::default(),
            liked_facts: Vec::new(),
            disliked_facts: Vec::new(),
            shared_facts: Vec::new(),
            read_facts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_item(item: Item) -> Result<Self> {
        from_item(item)
    }

    pub fn to_item(&self) -> Result<Item> {
        to_item(self)
    }
}

// ============================================================================
// Interaction
// ============================================================================

/// One ledger entry, keyed by `(userId, timestamp)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub user_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub fact_id: String,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub interaction_id: String,
}

impl Interaction {
    pub fn new(
        user_id: impl Into<String>,
        fact_id: impl Into<String>,
        kind: InteractionType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp: timestamp::truncate(timestamp),
            fact_id: fact_id.into(),
            kind,
            interaction_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn from_item(item: Item) -> Result<Self> {
        from_item(item)
    }

    pub fn to_item(&self) -> Result<Item> {
        to_item(self)
    }

    pub fn sort_key(&self) -> String {
        timestamp::format(&self.timestamp)
    }

    /// Primary key in the ledger table
    pub fn key(&self) -> Key {
        Key::with_sort(self.user_id.clone(), self.sort_key())
    }
}
