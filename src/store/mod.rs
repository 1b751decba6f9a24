//! Store Access Primitives
//!
//! Typed single-request operations against a partitioned key-value store with
//! secondary indexes. Nothing in this module retries: partial progress is reported
//! back to the caller (`unprocessed` keys/requests, `last_evaluated_key` cursors) and
//! the resilience wrapper in [`crate::access`] decides what to do with it.
//!
//! Provider limits: at most [`MAX_BATCH_GET`] keys per batch-get, and
//! [`MAX_BATCH_WRITE`] / [`MAX_TRANSACT_ITEMS`] items per batch-write or transaction.

pub mod apply;
pub mod expr;
pub mod memory;
pub mod postgres;
pub mod schema;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use expr::{Condition, KeyCondition, SortCondition, UpdateAction};
pub use memory::{Fault, MemoryStore, StoreOp};
pub use postgres::PgStore;
pub use schema::{IndexSchema, SortKind, TableSchema};

pub const MAX_BATCH_GET: usize = 100;
pub const MAX_BATCH_WRITE: usize = 25;
pub const MAX_TRANSACT_ITEMS: usize = 25;

/// A stored document
pub type Item = serde_json::Map<String, Value>;

/// Primary key of an item: partition value plus optional sort value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub partition: String,
    pub sort: Option<String>,
}

impl Key {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: None,
        }
    }

    pub fn with_sort(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sort {
            Some(sort) => write!(f, "{}/{}", self.partition, sort),
            None => write!(f, "{}", self.partition),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Item),
    Delete(Key),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Put,
    Delete,
}

#[derive(Debug, Default)]
pub struct BatchGetOutput {
    pub items: Vec<Item>,
    /// Keys the store did not get to; resubmit them
    pub unprocessed: Vec<Key>,
}

#[derive(Debug, Default)]
pub struct BatchWriteOutput {
    /// Requests the store did not apply; resubmit them
    pub unprocessed: Vec<WriteRequest>,
}

/// One query request against a table or one of its indexes
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// `None` queries the base table
    pub index: Option<&'static str>,
    pub key_condition: KeyCondition,
    pub filters: Vec<Condition>,
    pub scan_forward: bool,
    /// Items evaluated (before filters) by this request
    pub limit: Option<usize>,
    pub exclusive_start: Option<Item>,
}

impl QueryRequest {
    pub fn new(index: Option<&'static str>, key_condition: KeyCondition) -> Self {
        Self {
            index,
            key_condition,
            filters: Vec::new(),
            scan_forward: true,
            limit: None,
            exclusive_start: None,
        }
    }

    pub fn descending(mut self) -> Self {
        self.scan_forward = false;
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub filters: Vec<Condition>,
    pub limit: Option<usize>,
    pub exclusive_start: Option<Item>,
}

/// One page of query/scan results
#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<Item>,
    /// Present when more items may follow; pass back as `exclusive_start`
    pub last_evaluated_key: Option<Item>,
}

/// Update expression with an optional guard
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub actions: Vec<UpdateAction>,
    pub conditions: Vec<Condition>,
}

impl Update {
    pub fn new(actions: Vec<UpdateAction>) -> Self {
        Self {
            actions,
            conditions: Vec::new(),
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// One member of an all-or-nothing transactional write
#[derive(Debug, Clone)]
pub enum TransactItem {
    Put {
        table: &'static TableSchema,
        item: Item,
        conditions: Vec<Condition>,
    },
    Update {
        table: &'static TableSchema,
        key: Key,
        update: Update,
    },
    Delete {
        table: &'static TableSchema,
        key: Key,
        conditions: Vec<Condition>,
    },
    ConditionCheck {
        table: &'static TableSchema,
        key: Key,
        conditions: Vec<Condition>,
    },
}

impl TransactItem {
    pub fn table(&self) -> &'static TableSchema {
        match self {
            TransactItem::Put { table, .. }
            | TransactItem::Update { table, .. }
            | TransactItem::Delete { table, .. }
            | TransactItem::ConditionCheck { table, .. } => table,
        }
    }
}

/// A partitioned key-value store with secondary indexes.
///
/// Every method issues exactly one request. Retryable failures surface as
/// `Error::Throttled` / `Error::Unavailable`, failed conditions as `Error::Conflict`.
#[async_trait]
pub trait PartitionedStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get_item(&self, table: &'static TableSchema, key: &Key) -> Result<Option<Item>>;

    /// At most [`MAX_BATCH_GET`] keys
    async fn batch_get(&self, table: &'static TableSchema, keys: Vec<Key>)
        -> Result<BatchGetOutput>;

    /// At most [`MAX_BATCH_WRITE`] requests
    async fn batch_write(
        &self,
        table: &'static TableSchema,
        requests: Vec<WriteRequest>,
    ) -> Result<BatchWriteOutput>;

    async fn query(&self, table: &'static TableSchema, request: &QueryRequest) -> Result<Page>;

    async fn scan(&self, table: &'static TableSchema, request: &ScanRequest) -> Result<Page>;

    /// Applies `update` atomically and returns the item as it is afterwards.
    /// Creates the item from `key` when absent, unless a condition forbids it.
    async fn update_item(
        &self,
        table: &'static TableSchema,
        key: &Key,
        update: &Update,
    ) -> Result<Item>;

    /// At most [`MAX_TRANSACT_ITEMS`] items, applied all-or-nothing
    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<()>;
}

/// Deserialize a stored item into a domain type
pub fn from_item<T: serde::de::DeserializeOwned>(item: Item) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

/// Serialize a domain type into a stored item
pub fn to_item<T: Serialize>(value: &T) -> Result<Item> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(crate::error::Error::internal(format!(
            "expected an object, serialized {}",
            other
        ))),
    }
}
