//! Resilience Wrapper
//!
//! [`DataAccess`] wraps a [`PartitionedStore`] with:
//! - chunking of batch operations to the provider limits
//! - resubmission of unprocessed keys/requests with capped exponential backoff
//! - retry of throttling and transient faults (never of conditional-check failures)
//! - cursor-following pagination bounded by `max_results`
//! - concurrent fan-out of independent queries

pub mod retry;

use crate::config::RetryConfig;
use crate::error::Result;
use crate::store::{
    Condition, Item, Key, PartitionedStore, QueryRequest, TableSchema, TransactItem, Update,
    WriteOperation, WriteRequest, MAX_BATCH_GET, MAX_BATCH_WRITE,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

pub use retry::{backoff_delay, retry_when, retry_with_backoff, Backoff};

/// Upper bound on requests one paginated query may issue
pub const MAX_PAGE_REQUESTS: usize = 1_000;

/// Items accumulated by a paginated query
#[derive(Debug, Default)]
pub struct QueryOutput {
    pub items: Vec<Item>,
    /// Resume point after the last returned item, when more may follow
    pub last_key: Option<Item>,
}

/// Per-branch results of a fan-out query, in request order
#[derive(Debug, Default)]
pub struct FanOut {
    pub branches: Vec<Vec<Item>>,
    pub failed: usize,
}

impl FanOut {
    pub fn into_items(self) -> Vec<Item> {
        self.branches.into_iter().flatten().collect()
    }
}

/// Store access with retries, chunking and pagination
#[derive(Clone)]
pub struct DataAccess {
    store: Arc<dyn PartitionedStore>,
    retry: RetryConfig,
}

impl DataAccess {
    pub fn new(store: Arc<dyn PartitionedStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn PartitionedStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryConfig {
        &self.retry
    }

    pub async fn get(&self, table: &'static TableSchema, key: &Key) -> Result<Option<Item>> {
        let store = &self.store;
        retry_with_backoff(&self.retry, "get_item", move || store.get_item(table, key)).await
    }

    /// Fetch every key, in chunks of [`MAX_BATCH_GET`].
    ///
    /// Unprocessed keys are resubmitted; if some remain when the retry budget is spent
    /// the items fetched so far are returned. The same holds when a chunk keeps
    /// failing with transient faults, unless nothing was fetched at all, which
    /// surfaces `Unavailable`. Missing items are simply absent.
    #[instrument(skip(self, table, keys), fields(table = table.name, count = keys.len()))]
    pub async fn batch_get(&self, table: &'static TableSchema, keys: Vec<Key>) -> Result<Vec<Item>> {
        let mut found = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(MAX_BATCH_GET) {
            let mut backoff = Backoff::new(&self.retry, "batch_get");
            let mut pending = chunk.to_vec();

            while !pending.is_empty() {
                match self.store.batch_get(table, pending.clone()).await {
                    Ok(out) => {
                        found.extend(out.items);
                        if out.unprocessed.is_empty() {
                            break;
                        }
                        let reason = format!("{} keys unprocessed", out.unprocessed.len());
                        pending = out.unprocessed;
                        if !backoff.wait(&reason).await {
                            warn!(
                                table = table.name,
                                missing = pending.len(),
                                "Batch get gave up on unprocessed keys, returning partial result"
                            );
                            break;
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        if backoff.wait(&e).await {
                            continue;
                        }
                        if found.is_empty() {
                            return Err(backoff.exhausted(&e));
                        }
                        warn!(
                            table = table.name,
                            fetched = found.len(),
                            error = %e,
                            "Batch get gave up after repeated faults, returning partial result"
                        );
                        return Ok(found);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(table = table.name, found = found.len(), "Batch get complete");
        Ok(found)
    }

    /// Apply `operation` to every item, in chunks of [`MAX_BATCH_WRITE`].
    ///
    /// Fails with `Unavailable` if requests are still unprocessed when the retry budget
    /// is spent.
    #[instrument(skip(self, table, items), fields(table = table.name, count = items.len()))]
    pub async fn batch_write(
        &self,
        table: &'static TableSchema,
        operation: WriteOperation,
        items: Vec<Item>,
    ) -> Result<()> {
        let requests = items
            .into_iter()
            .map(|item| match operation {
                WriteOperation::Put => Ok(WriteRequest::Put(item)),
                WriteOperation::Delete => table.key_of(&item).map(WriteRequest::Delete),
            })
            .collect::<Result<Vec<_>>>()?;
        self.write_requests(table, requests).await
    }

    pub async fn write_requests(
        &self,
        table: &'static TableSchema,
        requests: Vec<WriteRequest>,
    ) -> Result<()> {
        for chunk in requests.chunks(MAX_BATCH_WRITE) {
            let mut backoff = Backoff::new(&self.retry, "batch_write");
            let mut pending = chunk.to_vec();

            while !pending.is_empty() {
                match self.store.batch_write(table, pending.clone()).await {
                    Ok(out) => {
                        if out.unprocessed.is_empty() {
                            break;
                        }
                        let reason = format!("{} requests unprocessed", out.unprocessed.len());
                        pending = out.unprocessed;
                        if !backoff.wait(&reason).await {
                            return Err(backoff.exhausted(&reason));
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        if !backoff.wait(&e).await {
                            return Err(backoff.exhausted(&e));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Follow continuation cursors until `max_results` items are collected or the
    /// store reports no more. Each request evaluates at most `page_size` items.
    ///
    /// The returned `last_key` resumes right after the last returned item.
    #[instrument(skip(self, table, request), fields(table = table.name, index = ?request.index))]
    pub async fn query_paginated(
        &self,
        table: &'static TableSchema,
        request: &QueryRequest,
        page_size: usize,
        max_results: usize,
    ) -> Result<QueryOutput> {
        let mut output = QueryOutput::default();
        if max_results == 0 {
            return Ok(output);
        }

        let mut cursor = request.exclusive_start.clone();
        for _ in 0..MAX_PAGE_REQUESTS {
            let mut page_request = request.clone();
            page_request.limit = Some(page_size.max(1));
            page_request.exclusive_start = cursor.take();

            let store = &self.store;
            let page_request = &page_request;
            let page = retry_with_backoff(&self.retry, "query", move || {
                store.query(table, page_request)
            })
            .await?;

            let remaining = max_results - output.items.len();
            if page.items.len() >= remaining {
                let truncated =
                    page.items.len() > remaining || page.last_evaluated_key.is_some();
                output.items.extend(page.items.into_iter().take(remaining));
                if truncated {
                    if let Some(last) = output.items.last() {
                        output.last_key = Some(table.cursor_for(request.index, last)?);
                    }
                }
                return Ok(output);
            }

            output.items.extend(page.items);
            match page.last_evaluated_key {
                Some(next) => cursor = Some(next),
                None => return Ok(output),
            }
        }

        warn!(
            table = table.name,
            collected = output.items.len(),
            "Paginated query hit the page request ceiling"
        );
        output.last_key = cursor;
        Ok(output)
    }

    /// Run independent paginated queries concurrently. A failing branch is logged and
    /// counted; the others still contribute.
    pub async fn parallel_query(
        &self,
        table: &'static TableSchema,
        requests: Vec<QueryRequest>,
        page_size: usize,
        max_results_per_query: usize,
    ) -> FanOut {
        let mut set = JoinSet::new();
        let count = requests.len();
        for (position, request) in requests.into_iter().enumerate() {
            let access = self.clone();
            set.spawn(async move {
                let result = access
                    .query_paginated(table, &request, page_size, max_results_per_query)
                    .await;
                (position, result)
            });
        }

        let mut branches: Vec<Option<Vec<Item>>> = vec![None; count];
        let mut failed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, Ok(output))) => branches[position] = Some(output.items),
                Ok((position, Err(e))) => {
                    warn!(table = table.name, branch = position, error = %e, "Fan-out query branch failed");
                    failed += 1;
                }
                Err(e) => {
                    warn!(table = table.name, error = %e, "Fan-out query task panicked");
                    failed += 1;
                }
            }
        }

        FanOut {
            branches: branches.into_iter().map(Option::unwrap_or_default).collect(),
            failed,
        }
    }

    /// All-or-nothing write. `Conflict` is surfaced immediately.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn transact_write(&self, items: Vec<TransactItem>) -> Result<()> {
        let store = &self.store;
        let items = &items;
        retry_with_backoff(&self.retry, "transact_write", move || {
            store.transact_write(items.clone())
        })
        .await
    }

    pub async fn update(
        &self,
        table: &'static TableSchema,
        key: &Key,
        update: &Update,
    ) -> Result<Item> {
        let store = &self.store;
        retry_with_backoff(&self.retry, "update_item", move || {
            store.update_item(table, key, update)
        })
        .await
    }

    /// Insert `item` unless an item with the same primary key exists (`Conflict`)
    pub async fn put_if_absent(&self, table: &'static TableSchema, item: Item) -> Result<()> {
        self.transact_write(vec![TransactItem::Put {
            table,
            item,
            conditions: vec![Condition::AttributeNotExists(table.partition_key.to_string())],
        }])
        .await
    }

    pub async fn delete(&self, table: &'static TableSchema, key: Key) -> Result<()> {
        self.write_requests(table, vec![WriteRequest::Delete(key)]).await
    }
}

impl std::fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccess")
            .field("backend", &self.store.backend_name())
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::schema::{FACTS, FACTS_BY_POPULARITY};
    use crate::store::{Fault, KeyCondition, MemoryStore, StoreOp};
    use serde_json::json;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn fact(i: usize) -> Item {
        json!({"id": format!("f{:03}", i), "gsiPartition": "FACT", "popularity": i})
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    async fn setup(n: usize) -> (Arc<MemoryStore>, DataAccess) {
        let store = Arc::new(MemoryStore::new());
        let access = DataAccess::new(store.clone(), fast_retry());
        access
            .batch_write(&FACTS, WriteOperation::Put, (0..n).map(fact).collect())
            .await
            .unwrap();
        (store, access)
    }

    fn keys(n: usize) -> Vec<Key> {
        (0..n).map(|i| Key::new(format!("f{:03}", i))).collect()
    }

    #[tokio::test]
    async fn test_batch_get_is_complete_across_chunks_and_partial_progress() {
        let (store, access) = setup(250).await;
        store.limit_batch_progress(40);
        store.inject(StoreOp::BatchGet, Fault::Throttle, 1);

        let items = access.batch_get(&FACTS, keys(250)).await.unwrap();
        assert_eq!(items.len(), 250);
    }

    #[tokio::test]
    async fn test_batch_get_returns_partial_when_budget_spent() {
        let (store, access) = setup(10).await;
        store.limit_batch_progress(2);

        // 1 initial request + 3 retries, 2 keys each
        let items = access.batch_get(&FACTS, keys(10)).await.unwrap();
        assert_eq!(items.len(), 8);
    }

    #[tokio::test]
    async fn test_batch_get_keeps_fetched_chunks_when_later_chunk_keeps_failing() {
        let (store, access) = setup(150).await;
        store.inject_after(StoreOp::BatchGet, 1, Fault::Unavailable, 10);

        let items = access.batch_get(&FACTS, keys(150)).await.unwrap();
        assert_eq!(items.len(), MAX_BATCH_GET);
        // first chunk + 1 initial request and 3 retries for the second
        assert_eq!(store.call_count(StoreOp::BatchGet), 5);
    }

    #[tokio::test]
    async fn test_batch_get_fails_when_nothing_was_fetched() {
        let (store, access) = setup(10).await;
        store.inject(StoreOp::BatchGet, Fault::Throttle, 10);

        let result = access.batch_get(&FACTS, keys(10)).await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_batch_write_raises_when_items_remain() {
        let (store, access) = setup(0).await;
        store.limit_batch_progress(1);

        let result = access
            .batch_write(&FACTS, WriteOperation::Put, (0..10).map(fact).collect())
            .await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_batch_delete() {
        let (store, access) = setup(30).await;
        access
            .batch_write(&FACTS, WriteOperation::Delete, (0..30).map(fact).collect())
            .await
            .unwrap();
        assert_eq!(store.item_count(&FACTS).await, 0);
    }

    #[tokio::test]
    async fn test_query_paginated_respects_max_results() {
        let (store, access) = setup(50).await;
        store.inject(StoreOp::Query, Fault::Unavailable, 2);

        let request =
            QueryRequest::new(Some(FACTS_BY_POPULARITY), KeyCondition::partition("FACT")).descending();
        let out = access.query_paginated(&FACTS, &request, 7, 20).await.unwrap();
        assert_eq!(out.items.len(), 20);
        assert_eq!(out.items[0]["id"], json!("f049"));

        let mut resume = request.clone();
        resume.exclusive_start = out.last_key;
        let rest = access.query_paginated(&FACTS, &resume, 7, 100).await.unwrap();
        assert_eq!(rest.items.len(), 30);
        assert_eq!(rest.items[0]["id"], json!("f029"));
        assert!(rest.last_key.is_none());
    }

    #[tokio::test]
    async fn test_transact_write_conflict_is_not_retried() {
        let (store, access) = setup(1).await;
        let result = access.put_if_absent(&FACTS, fact(0)).await;
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(store.call_count(StoreOp::TransactWrite), 1);
    }

    #[tokio::test]
    async fn test_exhausted_throttling_surfaces_unavailable() {
        let (store, access) = setup(1).await;
        store.inject(StoreOp::GetItem, Fault::Throttle, 10);
        let result = access.get(&FACTS, &Key::new("f000")).await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));
        assert_eq!(store.call_count(StoreOp::GetItem), 4);
    }

    #[tokio::test]
    async fn test_parallel_query_survives_failed_branch() {
        let (store, access) = setup(5).await;
        // The first query request issued fails permanently for its branch
        store.inject(StoreOp::Query, Fault::Conflict, 1);

        let request = QueryRequest::new(Some(FACTS_BY_POPULARITY), KeyCondition::partition("FACT"));
        let fan_out = access
            .parallel_query(&FACTS, vec![request.clone(), request], 10, 10)
            .await;
        assert_eq!(fan_out.failed, 1);
        assert_eq!(fan_out.into_items().len(), 5);
    }
}
