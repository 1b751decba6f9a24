//! In-process store backend
//!
//! Implements the full primitive contract (sparse secondary indexes, evaluated-item
//! limits, cursors, conditional updates, all-or-nothing transactions) over ordered
//! maps behind one lock. Faults can be injected per operation to exercise the
//! resilience wrapper: throttling, transient unavailability, conflicts, partial batch
//! progress and small page sizes.

use super::apply::{apply_update, stage_transaction, transaction_keys};
use super::expr::{all_match, compare_values};
use super::{
    BatchGetOutput, BatchWriteOutput, Item, Key, Page, PartitionedStore, QueryRequest,
    ScanRequest, TableSchema, TransactItem, Update, WriteRequest, MAX_BATCH_GET,
    MAX_BATCH_WRITE,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::RwLock;
use tracing::debug;

/// Primitive operations, as counted and faulted by [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetItem,
    BatchGet,
    BatchWrite,
    Query,
    Scan,
    UpdateItem,
    TransactWrite,
}

impl StoreOp {
    fn name(self) -> &'static str {
        match self {
            StoreOp::GetItem => "get_item",
            StoreOp::BatchGet => "batch_get",
            StoreOp::BatchWrite => "batch_write",
            StoreOp::Query => "query",
            StoreOp::Scan => "scan",
            StoreOp::UpdateItem => "update_item",
            StoreOp::TransactWrite => "transact_write",
        }
    }
}

/// A failure the next call of an operation will report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Throttle,
    Unavailable,
    Conflict,
}

impl Fault {
    fn into_error(self, op: StoreOp) -> Error {
        match self {
            Fault::Throttle => Error::throttled(op.name(), "provisioned throughput exceeded"),
            Fault::Unavailable => Error::unavailable(op.name(), "injected transient fault"),
            Fault::Conflict => Error::conflict(format!("injected conflict on {}", op.name())),
        }
    }
}

#[derive(Default)]
struct FaultPlan {
    /// `None` entries let a call through
    pending: DashMap<StoreOp, VecDeque<Option<Fault>>>,
    calls: DashMap<StoreOp, u32>,
    /// Max items a batch call processes; 0 = unlimited
    batch_progress: AtomicUsize,
    /// Max items a query/scan page evaluates; 0 = unlimited
    page_cap: AtomicUsize,
}

impl FaultPlan {
    fn check(&self, op: StoreOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(mut queue) = self.pending.get_mut(&op) {
            if let Some(Some(fault)) = queue.pop_front() {
                debug!(operation = op.name(), ?fault, "injecting store fault");
                return Err(fault.into_error(op));
            }
        }
        Ok(())
    }

    fn limit(cell: &AtomicUsize, requested: usize) -> usize {
        match cell.load(AtomicOrdering::Relaxed) {
            0 => requested,
            cap => requested.min(cap),
        }
    }
}

type Rows = BTreeMap<Key, Item>;

/// In-memory [`PartitionedStore`]
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<&'static str, Rows>>,
    faults: FaultPlan,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with `fault`
    pub fn inject(&self, op: StoreOp, fault: Fault, times: u32) {
        self.inject_after(op, 0, fault, times);
    }

    /// Let `successes` calls of `op` through, then fail the following `times` with `fault`
    pub fn inject_after(&self, op: StoreOp, successes: u32, fault: Fault, times: u32) {
        let mut queue = self.faults.pending.entry(op).or_default();
        queue.extend(std::iter::repeat(None).take(successes as usize));
        queue.extend(std::iter::repeat(Some(fault)).take(times as usize));
    }

    /// Process at most `n` keys/requests per batch call, reporting the rest as unprocessed
    pub fn limit_batch_progress(&self, n: usize) {
        self.faults.batch_progress.store(n, AtomicOrdering::Relaxed);
    }

    /// Evaluate at most `n` items per query/scan page
    pub fn cap_page_size(&self, n: usize) {
        self.faults.page_cap.store(n, AtomicOrdering::Relaxed);
    }

    /// Number of requests issued for `op` so far, including faulted ones
    pub fn call_count(&self, op: StoreOp) -> u32 {
        self.faults.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    pub async fn item_count(&self, table: &TableSchema) -> usize {
        self.tables
            .read()
            .await
            .get(table.name)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn page_limit(&self, requested: Option<usize>) -> usize {
        FaultPlan::limit(&self.faults.page_cap, requested.unwrap_or(usize::MAX)).max(1)
    }

    /// Walk `candidates` in order, evaluating at most `limit` items and filtering them
    fn evaluate_page<'a>(
        table: &TableSchema,
        index: Option<&str>,
        candidates: impl Iterator<Item = &'a Item>,
        limit: usize,
        filters: &[super::Condition],
    ) -> Result<Page> {
        let mut page = Page::default();
        let mut evaluated = 0usize;
        let mut candidates = candidates.peekable();
        while let Some(item) = candidates.next() {
            evaluated += 1;
            if all_match(filters, Some(item)) {
                page.items.push(item.clone());
            }
            if evaluated == limit {
                if candidates.peek().is_some() {
                    page.last_evaluated_key = Some(table.cursor_for(index, item)?);
                }
                break;
            }
        }
        Ok(page)
    }
}

/// Position of an item in index order: sort attribute, then primary key
type Position = (Option<Value>, Key);

fn position(table: &TableSchema, sort_attr: Option<&str>, item: &Item) -> Result<Position> {
    let sort = sort_attr.and_then(|attr| item.get(attr).cloned());
    Ok((sort, table.key_of(item)?))
}

fn cmp_position(a: &Position, b: &Position) -> Ordering {
    let by_sort = match (&a.0, &b.0) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    };
    by_sort.then_with(|| a.1.cmp(&b.1))
}

#[async_trait]
impl PartitionedStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get_item(&self, table: &'static TableSchema, key: &Key) -> Result<Option<Item>> {
        self.faults.check(StoreOp::GetItem)?;
        let tables = self.tables.read().await;
        Ok(tables.get(table.name).and_then(|rows| rows.get(key)).cloned())
    }

    async fn batch_get(
        &self,
        table: &'static TableSchema,
        keys: Vec<Key>,
    ) -> Result<BatchGetOutput> {
        if keys.len() > MAX_BATCH_GET {
            return Err(Error::invalid_input(format!(
                "batch get accepts at most {} keys, got {}",
                MAX_BATCH_GET,
                keys.len()
            )));
        }
        self.faults.check(StoreOp::BatchGet)?;

        let progress = FaultPlan::limit(&self.faults.batch_progress, keys.len());
        let mut keys = keys;
        let unprocessed = keys.split_off(progress);

        let tables = self.tables.read().await;
        let rows = tables.get(table.name);
        let items = keys
            .iter()
            .filter_map(|key| rows.and_then(|r| r.get(key)).cloned())
            .collect();

        Ok(BatchGetOutput { items, unprocessed })
    }

    async fn batch_write(
        &self,
        table: &'static TableSchema,
        requests: Vec<WriteRequest>,
    ) -> Result<BatchWriteOutput> {
        if requests.len() > MAX_BATCH_WRITE {
            return Err(Error::invalid_input(format!(
                "batch write accepts at most {} requests, got {}",
                MAX_BATCH_WRITE,
                requests.len()
            )));
        }
        self.faults.check(StoreOp::BatchWrite)?;

        let progress = FaultPlan::limit(&self.faults.batch_progress, requests.len());
        let mut requests = requests;
        let unprocessed = requests.split_off(progress);

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.name).or_default();
        for request in requests {
            match request {
                WriteRequest::Put(item) => {
                    let key = table.key_of(&item)?;
                    rows.insert(key, item);
                }
                WriteRequest::Delete(key) => {
                    rows.remove(&key);
                }
            }
        }

        Ok(BatchWriteOutput { unprocessed })
    }

    async fn query(&self, table: &'static TableSchema, request: &QueryRequest) -> Result<Page> {
        self.faults.check(StoreOp::Query)?;
        let keys = table.query_keys(request.index)?;
        let sort_attr = keys.sort_key.map(|(attr, _)| attr);

        let tables = self.tables.read().await;
        let mut candidates = Vec::new();
        for item in tables.get(table.name).into_iter().flat_map(|rows| rows.values()) {
            let in_partition = item
                .get(keys.partition_key)
                .and_then(|v| compare_values(v, &request.key_condition.partition))
                == Some(Ordering::Equal);
            if !in_partition {
                continue;
            }
            let in_range = match (sort_attr, &request.key_condition.sort) {
                (Some(attr), cond) => match item.get(attr) {
                    Some(v) => cond.as_ref().map(|c| c.matches(v)).unwrap_or(true),
                    // sparse index: items without the sort attribute are not projected
                    None => false,
                },
                (None, cond) => cond.is_none(),
            };
            if in_range {
                candidates.push((position(table, sort_attr, item)?, item));
            }
        }

        candidates.sort_by(|a, b| cmp_position(&a.0, &b.0));
        if !request.scan_forward {
            candidates.reverse();
        }

        if let Some(start) = &request.exclusive_start {
            table.validate_cursor(request.index, start)?;
            let start = position(table, sort_attr, start)?;
            candidates.retain(|(pos, _)| {
                let ord = cmp_position(pos, &start);
                if request.scan_forward {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                }
            });
        }

        Self::evaluate_page(
            table,
            request.index,
            candidates.into_iter().map(|(_, item)| item),
            self.page_limit(request.limit),
            &request.filters,
        )
    }

    async fn scan(&self, table: &'static TableSchema, request: &ScanRequest) -> Result<Page> {
        self.faults.check(StoreOp::Scan)?;
        let start = match &request.exclusive_start {
            Some(cursor) => Some(table.key_of(cursor)?),
            None => None,
        };

        let tables = self.tables.read().await;
        let rows = tables
            .get(table.name)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter(|(key, _)| start.as_ref().map(|s| *key > s).unwrap_or(true))
            .map(|(_, item)| item);

        Self::evaluate_page(
            table,
            None,
            rows,
            self.page_limit(request.limit),
            &request.filters,
        )
    }

    async fn update_item(
        &self,
        table: &'static TableSchema,
        key: &Key,
        update: &Update,
    ) -> Result<Item> {
        self.faults.check(StoreOp::UpdateItem)?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.name).or_default();
        let item = apply_update(table, key, rows.get(key), update)?;
        rows.insert(key.clone(), item.clone());
        Ok(item)
    }

    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<()> {
        transaction_keys(&items)?;
        self.faults.check(StoreOp::TransactWrite)?;

        let mut tables = self.tables.write().await;
        let staged = stage_transaction(&items, |table, key| {
            tables.get(table.name).and_then(|rows| rows.get(key))
        })?;

        for write in staged {
            let rows = tables.entry(write.table.name).or_default();
            match write.item {
                Some(item) => {
                    rows.insert(write.key, item);
                }
                None => {
                    rows.remove(&write.key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{FACTS, FACTS_BY_POPULARITY, INTERACTIONS};
    use crate::store::{Condition, KeyCondition, SortCondition, UpdateAction};
    use serde_json::json;

    fn item(v: Value) -> Item {
        v.as_object().cloned().unwrap_or_default()
    }

    async fn seed_facts(store: &MemoryStore, n: usize) {
        let requests: Vec<_> = (0..n)
            .map(|i| {
                WriteRequest::Put(item(json!({
                    "id": format!("f{:02}", i),
                    "gsiPartition": "FACT",
                    "popularity": i as f64,
                    "difficulty": if i % 2 == 0 { "beginner" } else { "advanced" },
                })))
            })
            .collect();
        for chunk in requests.chunks(MAX_BATCH_WRITE) {
            store.batch_write(&FACTS, chunk.to_vec()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_query_orders_by_sort_key_and_pages() {
        let store = MemoryStore::new();
        seed_facts(&store, 10).await;

        let request = QueryRequest::new(Some(FACTS_BY_POPULARITY), KeyCondition::partition("FACT"))
            .descending()
            .limit(4);
        let page = store.query(&FACTS, &request).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i["id"].clone()).collect();
        assert_eq!(ids, vec![json!("f09"), json!("f08"), json!("f07"), json!("f06")]);

        let mut next = request.clone();
        next.exclusive_start = page.last_evaluated_key;
        let page = store.query(&FACTS, &next).await.unwrap();
        assert_eq!(page.items[0]["id"], json!("f05"));
    }

    #[tokio::test]
    async fn test_limit_counts_items_before_filtering() {
        let store = MemoryStore::new();
        seed_facts(&store, 10).await;

        let request = QueryRequest::new(Some(FACTS_BY_POPULARITY), KeyCondition::partition("FACT"))
            .filter(Condition::equals("difficulty", "beginner"))
            .limit(4);
        let page = store.query(&FACTS, &request).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.last_evaluated_key.is_some());
    }

    #[tokio::test]
    async fn test_sort_condition_on_base_table() {
        let store = MemoryStore::new();
        for ts in ["2024-01-01", "2024-02-01", "2024-03-01"] {
            store
                .batch_write(
                    &INTERACTIONS,
                    vec![WriteRequest::Put(item(json!({"userId": "u1", "timestamp": ts})))],
                )
                .await
                .unwrap();
        }
        let request = QueryRequest::new(
            None,
            KeyCondition::partition("u1").with_sort(SortCondition::Ge(json!("2024-02-01"))),
        );
        let page = store.query(&INTERACTIONS, &request).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_batch_progress_reports_unprocessed() {
        let store = MemoryStore::new();
        seed_facts(&store, 10).await;
        store.limit_batch_progress(3);

        let keys: Vec<_> = (0..10).map(|i| Key::new(format!("f{:02}", i))).collect();
        let out = store.batch_get(&FACTS, keys).await.unwrap();
        assert_eq!(out.items.len(), 3);
        assert_eq!(out.unprocessed.len(), 7);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.inject(StoreOp::GetItem, Fault::Throttle, 1);
        store.inject(StoreOp::GetItem, Fault::Unavailable, 1);

        let key = Key::new("missing");
        assert!(matches!(
            store.get_item(&FACTS, &key).await,
            Err(Error::Throttled { .. })
        ));
        assert!(matches!(
            store.get_item(&FACTS, &key).await,
            Err(Error::Unavailable { .. })
        ));
        assert!(store.get_item(&FACTS, &key).await.unwrap().is_none());
        assert_eq!(store.call_count(StoreOp::GetItem), 3);
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let store = MemoryStore::new();
        seed_facts(&store, 1).await;

        let result = store
            .transact_write(vec![
                TransactItem::Update {
                    table: &FACTS,
                    key: Key::new("f00"),
                    update: Update::new(vec![UpdateAction::Add("likes".into(), 1)]),
                },
                TransactItem::Put {
                    table: &FACTS,
                    item: item(json!({"id": "f00-dup"})),
                    conditions: vec![Condition::AttributeExists("id".into())],
                },
            ])
            .await;
        assert!(matches!(result, Err(Error::Conflict { .. })));

        let fact = store.get_item(&FACTS, &Key::new("f00")).await.unwrap().unwrap();
        assert!(fact.get("likes").is_none());
        assert_eq!(store.item_count(&FACTS).await, 1);
    }

    #[tokio::test]
    async fn test_update_item_guards_key_attributes() {
        let store = MemoryStore::new();
        let result = store
            .update_item(
                &FACTS,
                &Key::new("f1"),
                &Update::new(vec![UpdateAction::Set("id".into(), json!("f2"))]),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidInput { .. })));
    }
}
