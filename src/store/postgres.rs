//! PostgreSQL store backend
//!
//! Items live in a single `kv_items` table keyed by `(table_name, pk, sk)` with the
//! document in a `jsonb` column; secondary indexes are expression indexes (see
//! `migrations/`). Key conditions, ordering and cursors are pushed down to SQL;
//! filters are evaluated on the fetched page so that `limit` counts evaluated items.

use super::apply::{apply_update, stage_transaction, transaction_keys};
use super::expr::{all_match, SortCondition};
use super::schema::SortKind;
use super::{
    BatchGetOutput, BatchWriteOutput, Condition, Item, Key, Page, PartitionedStore, QueryRequest,
    ScanRequest, TableSchema, TransactItem, Update, WriteRequest, MAX_BATCH_GET, MAX_BATCH_WRITE,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// [`PartitionedStore`] over a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

type DocRow = (Json<Item>,);

fn sort_column(key: &Key) -> &str {
    key.sort.as_deref().unwrap_or("")
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SQL expression and ordering kind for one key attribute of a query
#[derive(Clone)]
struct SortExpr {
    sql: String,
    kind: SortKind,
}

impl SortExpr {
    fn for_query(table: &TableSchema, index: Option<&str>) -> Result<Option<(String, SortExpr)>> {
        let keys = table.query_keys(index)?;
        Ok(keys.sort_key.map(|(attr, kind)| {
            let sql = match (index, kind) {
                (None, _) => "sk".to_string(),
                (Some(_), SortKind::String) => format!("((doc->>'{}') COLLATE \"C\")", attr),
                (Some(_), SortKind::Number) => format!("((doc->>'{}')::double precision)", attr),
            };
            (attr.to_string(), SortExpr { sql, kind })
        }))
    }

    fn push_value(&self, sql: &mut QueryBuilder<'_, Postgres>, value: &Value) -> Result<()> {
        match self.kind {
            SortKind::Number => {
                let n = value.as_f64().ok_or_else(|| {
                    Error::invalid_input(format!("expected a number for sort key, got {}", value))
                })?;
                sql.push_bind(n);
            }
            SortKind::String => {
                sql.push_bind(value_text(value));
                sql.push(" COLLATE \"C\"");
            }
        }
        Ok(())
    }

    fn push_condition(
        &self,
        sql: &mut QueryBuilder<'_, Postgres>,
        condition: &SortCondition,
    ) -> Result<()> {
        let op = |sql: &mut QueryBuilder<'_, Postgres>, op: &str, v: &Value| -> Result<()> {
            sql.push(format!(" AND {} {} ", self.sql, op));
            self.push_value(sql, v)
        };
        match condition {
            SortCondition::Eq(v) => op(sql, "=", v)?,
            SortCondition::Lt(v) => op(sql, "<", v)?,
            SortCondition::Le(v) => op(sql, "<=", v)?,
            SortCondition::Gt(v) => op(sql, ">", v)?,
            SortCondition::Ge(v) => op(sql, ">=", v)?,
            SortCondition::Between(lo, hi) => {
                op(sql, ">=", lo)?;
                op(sql, "<=", hi)?;
            }
            SortCondition::BeginsWith(prefix) => {
                sql.push(format!(" AND starts_with({}, ", self.sql));
                sql.push_bind(prefix.clone());
                sql.push(")");
            }
        }
        Ok(())
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_item(
        tx: &mut Transaction<'_, Postgres>,
        table: &TableSchema,
        key: &Key,
    ) -> Result<Option<Item>> {
        let row: Option<DocRow> = sqlx::query_as(
            "SELECT doc FROM kv_items WHERE table_name = $1 AND pk = $2 AND sk = $3 FOR UPDATE",
        )
        .bind(table.name)
        .bind(&key.partition)
        .bind(sort_column(key))
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|(Json(item),)| item))
    }

    async fn upsert(
        tx: &mut Transaction<'_, Postgres>,
        table: &TableSchema,
        key: &Key,
        item: &Item,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_items (table_name, pk, sk, doc, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (table_name, pk, sk)
            DO UPDATE SET doc = EXCLUDED.doc, updated_at = now()
            "#,
        )
        .bind(table.name)
        .bind(&key.partition)
        .bind(sort_column(key))
        .bind(Json(item))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete(
        tx: &mut Transaction<'_, Postgres>,
        table: &TableSchema,
        key: &Key,
    ) -> Result<()> {
        sqlx::query("DELETE FROM kv_items WHERE table_name = $1 AND pk = $2 AND sk = $3")
            .bind(table.name)
            .bind(&key.partition)
            .bind(sort_column(key))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Split `limit + 1` fetched rows into a filtered page and its cursor
    fn finish_page(
        table: &TableSchema,
        index: Option<&str>,
        mut rows: Vec<Item>,
        limit: Option<usize>,
        filters: &[Condition],
    ) -> Result<Page> {
        let mut last_evaluated_key = None;
        if let Some(limit) = limit {
            if rows.len() > limit {
                rows.truncate(limit);
                if let Some(last) = rows.last() {
                    last_evaluated_key = Some(table.cursor_for(index, last)?);
                }
            }
        }
        let items = rows
            .into_iter()
            .filter(|item| all_match(filters, Some(item)))
            .collect();
        Ok(Page {
            items,
            last_evaluated_key,
        })
    }
}

#[async_trait]
impl PartitionedStore for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn get_item(&self, table: &'static TableSchema, key: &Key) -> Result<Option<Item>> {
        let row: Option<DocRow> =
            sqlx::query_as("SELECT doc FROM kv_items WHERE table_name = $1 AND pk = $2 AND sk = $3")
                .bind(table.name)
                .bind(&key.partition)
                .bind(sort_column(key))
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(Json(item),)| item))
    }

    #[instrument(skip(self, table, keys), fields(table = table.name, count = keys.len()))]
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
        let pks: Vec<String> = keys.iter().map(|k| k.partition.clone()).collect();
        let sks: Vec<String> = keys.iter().map(|k| sort_column(k).to_string()).collect();

        let rows: Vec<DocRow> = sqlx::query_as(
            r#"
            SELECT doc FROM kv_items
            WHERE table_name = $1
              AND (pk, sk) IN (SELECT * FROM UNNEST($2::text[], $3::text[]))
            "#,
        )
        .bind(table.name)
        .bind(&pks)
        .bind(&sks)
        .fetch_all(&self.pool)
        .await?;

        Ok(BatchGetOutput {
            items: rows.into_iter().map(|(Json(item),)| item).collect(),
            unprocessed: Vec::new(),
        })
    }

    #[instrument(skip(self, table, requests), fields(table = table.name, count = requests.len()))]
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
        let mut tx = self.pool.begin().await?;
        for request in &requests {
            match request {
                WriteRequest::Put(item) => {
                    let key = table.key_of(item)?;
                    Self::upsert(&mut tx, table, &key, item).await?;
                }
                WriteRequest::Delete(key) => Self::delete(&mut tx, table, key).await?,
            }
        }
        tx.commit().await?;
        Ok(BatchWriteOutput::default())
    }

    async fn query(&self, table: &'static TableSchema, request: &QueryRequest) -> Result<Page> {
        let keys = table.query_keys(request.index)?;
        let sort = SortExpr::for_query(table, request.index)?;

        let mut sql = QueryBuilder::<Postgres>::new("SELECT doc FROM kv_items WHERE table_name = ");
        sql.push_bind(table.name);

        let partition_expr = match request.index {
            None => "pk".to_string(),
            Some(_) => format!("(doc->>'{}')", keys.partition_key),
        };
        sql.push(format!(" AND {} = ", partition_expr));
        sql.push_bind(value_text(&request.key_condition.partition));

        if let Some((attr, expr)) = &sort {
            if request.index.is_some() {
                sql.push(format!(" AND doc ? '{}'", attr));
            }
            if let Some(condition) = &request.key_condition.sort {
                expr.push_condition(&mut sql, condition)?;
            }
        }

        let direction = if request.scan_forward { "ASC" } else { "DESC" };

        if let Some(start) = &request.exclusive_start {
            table.validate_cursor(request.index, start)?;
            let start_key = table.key_of(start)?;
            let cmp = if request.scan_forward { ">" } else { "<" };
            match &sort {
                Some((attr, expr)) => {
                    let value = start.get(attr).ok_or_else(|| {
                        Error::invalid_input(format!("continuation cursor is missing {}", attr))
                    })?;
                    sql.push(format!(" AND ({}, pk, sk) {} (", expr.sql, cmp));
                    expr.push_value(&mut sql, value)?;
                }
                None => {
                    sql.push(format!(" AND (pk, sk) {} (", cmp));
                }
            }
            sql.push_bind(start_key.partition.clone());
            sql.push(", ");
            sql.push_bind(sort_column(&start_key).to_string());
            sql.push(")");
        }

        match &sort {
            Some((_, expr)) => sql.push(format!(
                " ORDER BY {} {d}, pk {d}, sk {d}",
                expr.sql,
                d = direction
            )),
            None => sql.push(format!(" ORDER BY pk {d}, sk {d}", d = direction)),
        };

        if let Some(limit) = request.limit {
            sql.push(" LIMIT ");
            sql.push_bind(limit as i64 + 1);
        }

        debug!(table = table.name, index = ?request.index, "store query");
        let rows: Vec<DocRow> = sql.build_query_as().fetch_all(&self.pool).await?;
        Self::finish_page(
            table,
            request.index,
            rows.into_iter().map(|(Json(item),)| item).collect(),
            request.limit,
            &request.filters,
        )
    }

    async fn scan(&self, table: &'static TableSchema, request: &ScanRequest) -> Result<Page> {
        let mut sql = QueryBuilder::<Postgres>::new("SELECT doc FROM kv_items WHERE table_name = ");
        sql.push_bind(table.name);

        if let Some(start) = &request.exclusive_start {
            let key = table.key_of(start)?;
            sql.push(" AND (pk, sk) > (");
            sql.push_bind(key.partition.clone());
            sql.push(", ");
            sql.push_bind(sort_column(&key).to_string());
            sql.push(")");
        }
        sql.push(" ORDER BY pk, sk");
        if let Some(limit) = request.limit {
            sql.push(" LIMIT ");
            sql.push_bind(limit as i64 + 1);
        }

        let rows: Vec<DocRow> = sql.build_query_as().fetch_all(&self.pool).await?;
        Self::finish_page(
            table,
            None,
            rows.into_iter().map(|(Json(item),)| item).collect(),
            request.limit,
            &request.filters,
        )
    }

    async fn update_item(
        &self,
        table: &'static TableSchema,
        key: &Key,
        update: &Update,
    ) -> Result<Item> {
        let mut tx = self.pool.begin().await?;
        let existing = Self::lock_item(&mut tx, table, key).await?;
        let item = apply_update(table, key, existing.as_ref(), update)?;
        Self::upsert(&mut tx, table, key, &item).await?;
        tx.commit().await?;
        Ok(item)
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn transact_write(&self, items: Vec<TransactItem>) -> Result<()> {
        let mut keys = transaction_keys(&items)?;
        // Lock in a stable order so concurrent transactions cannot deadlock.
        keys.sort_by(|a, b| (a.0.name, &a.1).cmp(&(b.0.name, &b.1)));

        let mut tx = self.pool.begin().await?;
        let mut current: HashMap<(&'static str, Key), Item> = HashMap::new();
        for (table, key) in keys {
            if let Some(item) = Self::lock_item(&mut tx, table, &key).await? {
                current.insert((table.name, key), item);
            }
        }

        let staged = stage_transaction(&items, |table, key| {
            current.get(&(table.name, key.clone()))
        })?;

        for write in &staged {
            match &write.item {
                Some(item) => Self::upsert(&mut tx, write.table, &write.key, item).await?,
                None => Self::delete(&mut tx, write.table, &write.key).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
