//! Table and secondary-index layout
//!
//! Each table has a string partition key and an optional string sort key. Secondary
//! indexes are sparse: an item only appears in an index when it carries the index's
//! partition attribute (and sort attribute, if the index has one).

use super::{Item, Key};
use crate::error::{Error, Result};
use serde_json::Value;

/// How a sort attribute is ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKind {
    String,
    Number,
}

/// A secondary index: `equals` on the partition attribute, range on the sort attribute
#[derive(Debug)]
pub struct IndexSchema {
    pub name: &'static str,
    pub partition_key: &'static str,
    pub sort_key: Option<(&'static str, SortKind)>,
}

#[derive(Debug)]
pub struct TableSchema {
    pub name: &'static str,
    pub partition_key: &'static str,
    pub sort_key: Option<&'static str>,
    pub indexes: &'static [IndexSchema],
}

/// Attribute layout a query runs against: the table itself or one of its indexes
#[derive(Debug, Clone, Copy)]
pub struct QueryKeys {
    pub partition_key: &'static str,
    pub sort_key: Option<(&'static str, SortKind)>,
}

impl TableSchema {
    pub fn index(&self, name: &str) -> Result<&'static IndexSchema> {
        // `indexes` is 'static, so the reference outlives `self`
        let indexes: &'static [IndexSchema] = self.indexes;
        indexes
            .iter()
            .find(|idx| idx.name == name)
            .ok_or_else(|| Error::internal(format!("table {} has no index {}", self.name, name)))
    }

    pub fn query_keys(&self, index: Option<&str>) -> Result<QueryKeys> {
        match index {
            None => Ok(QueryKeys {
                partition_key: self.partition_key,
                sort_key: self.sort_key.map(|sk| (sk, SortKind::String)),
            }),
            Some(name) => {
                let idx = self.index(name)?;
                Ok(QueryKeys {
                    partition_key: idx.partition_key,
                    sort_key: idx.sort_key,
                })
            }
        }
    }

    /// Extract the primary key of a stored item
    pub fn key_of(&self, item: &Item) -> Result<Key> {
        let partition = string_attr(item, self.partition_key).ok_or_else(|| {
            Error::invalid_input(format!(
                "{} item is missing key attribute {}",
                self.name, self.partition_key
            ))
        })?;
        let sort = match self.sort_key {
            Some(sk) => Some(string_attr(item, sk).ok_or_else(|| {
                Error::invalid_input(format!("{} item is missing key attribute {}", self.name, sk))
            })?),
            None => None,
        };
        Ok(Key { partition, sort })
    }

    /// Primary key rendered as item attributes
    pub fn key_item(&self, key: &Key) -> Item {
        let mut item = Item::new();
        item.insert(
            self.partition_key.to_string(),
            Value::String(key.partition.clone()),
        );
        if let (Some(sk), Some(sort)) = (self.sort_key, key.sort.as_ref()) {
            item.insert(sk.to_string(), Value::String(sort.clone()));
        }
        item
    }

    /// Cursor identifying `item`'s position in a query over `index`
    pub fn cursor_for(&self, index: Option<&str>, item: &Item) -> Result<Item> {
        let key = self.key_of(item)?;
        let mut cursor = self.key_item(&key);
        let keys = self.query_keys(index)?;
        for attr in std::iter::once(keys.partition_key).chain(keys.sort_key.map(|(a, _)| a)) {
            if let Some(value) = item.get(attr) {
                cursor.insert(attr.to_string(), value.clone());
            }
        }
        Ok(cursor)
    }

    /// A cursor is valid for a query when it names every key attribute the query orders by
    pub fn validate_cursor(&self, index: Option<&str>, cursor: &Item) -> Result<()> {
        let keys = self.query_keys(index)?;
        let required = std::iter::once(self.partition_key)
            .chain(self.sort_key)
            .chain(std::iter::once(keys.partition_key))
            .chain(keys.sort_key.map(|(a, _)| a));
        for attr in required {
            if !cursor.contains_key(attr) {
                return Err(Error::invalid_input(format!(
                    "continuation cursor is missing {}",
                    attr
                )));
            }
        }
        Ok(())
    }
}

fn string_attr(item: &Item, attr: &str) -> Option<String> {
    item.get(attr).and_then(Value::as_str).map(str::to_string)
}

// ============================================================================
// Tables
// ============================================================================

/// Constant partition value that places every fact in the global indexes
pub const FACT_PARTITION: &str = "FACT";
pub const GSI_PARTITION_ATTR: &str = "gsiPartition";

pub const FACTS_BY_CATEGORY_CREATED: &str = "category-createdAt";
pub const FACTS_BY_CATEGORY_DIFFICULTY: &str = "category-difficulty";
pub const FACTS_BY_POPULARITY: &str = "popularity-index";
pub const FACTS_BY_CREATED: &str = "createdAt-index";

pub static FACTS: TableSchema = TableSchema {
    name: "facts",
    partition_key: "id",
    sort_key: None,
    indexes: &[
        IndexSchema {
            name: FACTS_BY_CATEGORY_CREATED,
            partition_key: "category",
            sort_key: Some(("createdAt", SortKind::String)),
        },
        IndexSchema {
            name: FACTS_BY_CATEGORY_DIFFICULTY,
            partition_key: "category",
            sort_key: Some(("difficulty", SortKind::String)),
        },
        IndexSchema {
            name: FACTS_BY_POPULARITY,
            partition_key: GSI_PARTITION_ATTR,
            sort_key: Some(("popularity", SortKind::Number)),
        },
        IndexSchema {
            name: FACTS_BY_CREATED,
            partition_key: GSI_PARTITION_ATTR,
            sort_key: Some(("createdAt", SortKind::String)),
        },
    ],
};

pub static USERS: TableSchema = TableSchema {
    name: "users",
    partition_key: "id",
    sort_key: None,
    indexes: &[],
};

pub const INTERACTIONS_BY_FACT: &str = "factId-timestamp";
pub const INTERACTIONS_BY_TYPE: &str = "type-timestamp";

pub static INTERACTIONS: TableSchema = TableSchema {
    name: "interactions",
    partition_key: "userId",
    sort_key: Some("timestamp"),
    indexes: &[
        IndexSchema {
            name: INTERACTIONS_BY_FACT,
            partition_key: "factId",
            sort_key: Some(("timestamp", SortKind::String)),
        },
        IndexSchema {
            name: INTERACTIONS_BY_TYPE,
            partition_key: "type",
            sort_key: Some(("timestamp", SortKind::String)),
        },
    ],
};

pub static ALL_TABLES: [&TableSchema; 3] = [&FACTS, &USERS, &INTERACTIONS];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interaction() -> Item {
        json!({
            "userId": "u1",
            "timestamp": "2024-05-01T10:00:00.000Z",
            "factId": "f1",
            "type": "like",
        })
        .as_object()
        .cloned()
        .unwrap_or_default()
    }

    #[test]
    fn test_key_of_composite_table() {
        let key = INTERACTIONS.key_of(&interaction()).unwrap();
        assert_eq!(key.partition, "u1");
        assert_eq!(key.sort.as_deref(), Some("2024-05-01T10:00:00.000Z"));
    }

    #[test]
    fn test_cursor_for_index_includes_index_and_table_keys() {
        let cursor = INTERACTIONS
            .cursor_for(Some(INTERACTIONS_BY_FACT), &interaction())
            .unwrap();
        assert_eq!(cursor.len(), 3);
        assert!(cursor.contains_key("factId"));
        assert!(!cursor.contains_key("type"));
        INTERACTIONS
            .validate_cursor(Some(INTERACTIONS_BY_FACT), &cursor)
            .unwrap();
        assert!(INTERACTIONS
            .validate_cursor(Some(INTERACTIONS_BY_TYPE), &cursor)
            .is_err());
    }

    #[test]
    fn test_unknown_index_is_rejected() {
        assert!(FACTS.query_keys(Some("nope")).is_err());
    }
}
