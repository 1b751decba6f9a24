//! Namespaced response cache
//!
//! Owned by whoever serves responses (the HTTP state), never a process global.
//! Each namespace has its own TTL and entry bound. Writers invalidate explicitly
//! after the mutations that affect a namespace.

use crate::config::{CacheConfig, NamespaceConfig};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Feed,
    Recommendations,
    Stats,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Feed => "feed",
            Namespace::Recommendations => "recommendations",
            Namespace::Stats => "stats",
        }
    }
}

struct Entry {
    value: Value,
    inserted: Instant,
}

struct Shelf {
    config: NamespaceConfig,
    entries: DashMap<String, Entry>,
}

impl Shelf {
    fn new(config: NamespaceConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    fn is_fresh(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.inserted) < self.config.ttl
    }

    /// Drop expired entries, then the oldest ones, until one more fits
    fn make_room(&self, now: Instant) {
        if self.entries.len() < self.config.max_entries {
            return;
        }
        self.entries.retain(|_, entry| self.is_fresh(entry, now));
        while self.entries.len() >= self.config.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.inserted)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

pub struct ResponseCache {
    feed: Shelf,
    recommendations: Shelf,
    stats: Shelf,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            feed: Shelf::new(config.feed),
            recommendations: Shelf::new(config.recommendations),
            stats: Shelf::new(config.stats),
        }
    }

    fn shelf(&self, namespace: Namespace) -> &Shelf {
        match namespace {
            Namespace::Feed => &self.feed,
            Namespace::Recommendations => &self.recommendations,
            Namespace::Stats => &self.stats,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let shelf = self.shelf(namespace);
        let now = Instant::now();
        let value = {
            let entry = shelf.entries.get(key)?;
            if shelf.is_fresh(&entry, now) {
                Some(entry.value.clone())
            } else {
                None
            }
        };
        match value {
            Some(value) => serde_json::from_value(value).ok(),
            None => {
                shelf.entries.remove(key);
                None
            }
        }
    }

    /// Store a response. Values that fail to serialize are not cached.
    pub fn insert<T: Serialize>(&self, namespace: Namespace, key: impl Into<String>, value: &T) {
        let shelf = self.shelf(namespace);
        if shelf.config.max_entries == 0 || shelf.config.ttl.is_zero() {
            return;
        }
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let now = Instant::now();
        shelf.make_room(now);
        shelf.entries.insert(
            key.into(),
            Entry {
                value,
                inserted: now,
            },
        );
    }

    pub fn invalidate(&self, namespace: Namespace, key: &str) {
        if self.shelf(namespace).entries.remove(key).is_some() {
            debug!(namespace = namespace.as_str(), key, "Cache entry invalidated");
        }
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, namespace: Namespace, prefix: &str) {
        let entries = &self.shelf(namespace).entries;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(entries.len());
        if removed > 0 {
            debug!(namespace = namespace.as_str(), prefix, removed, "Cache entries invalidated");
        }
    }

    pub fn len(&self, namespace: Namespace) -> usize {
        self.shelf(namespace).entries.len()
    }

    pub fn is_empty(&self, namespace: Namespace) -> bool {
        self.len(namespace) == 0
    }
}
