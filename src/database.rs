//! PostgreSQL backing for the `postgres` store backend
//!
//! [`Database::connect`] opens the pool, verifies the server answers and applies the
//! embedded migrations that create the `kv_items` table every [`PgStore`] reads and
//! writes. The same handle backs `/health` by touching that table.

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::store::PgStore;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Table every store item lives in; see `migrations/0001_kv_items.sql`
pub const ITEMS_TABLE: &str = "kv_items";

/// Statements slower than this are logged at warn
const SLOW_STATEMENT: Duration = Duration::from_secs(1);

/// Connected, migrated PostgreSQL pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool and bring the `kv_items` schema up to date
    #[instrument(skip(config), fields(max = config.max_connections, min = config.min_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let db = Self {
            pool: open_pool(config).await?,
        };
        db.migrate().await?;
        let stats = db.stats();
        info!(size = stats.size, idle = stats.idle, "PostgreSQL store ready");
        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A store backend sharing this pool
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }

    /// Apply pending migrations. Safe to repeat.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;
        debug!(table = ITEMS_TABLE, "Migrations applied");
        Ok(())
    }

    /// The item table is reachable through the pool
    pub async fn health_check(&self) -> Result<()> {
        let sql = format!("SELECT 1 FROM {} LIMIT 1", ITEMS_TABLE);
        sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("{} unreachable: {}", ITEMS_TABLE, e).into(),
                source: Some(e),
            })?;
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

async fn open_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| Error::Config {
            message: format!("Invalid database URL: {}", e).into(),
            source: None,
        })?
        .statement_cache_capacity(config.statement_cache_size)
        .log_statements(log::LevelFilter::Debug)
        .log_slow_statements(log::LevelFilter::Warn, SLOW_STATEMENT);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .max_lifetime(Some(config.max_lifetime))
        .connect_with(options)
        .await
        .map_err(|e| Error::Database {
            message: format!("Failed to open PostgreSQL pool: {}", e).into(),
            source: Some(e),
        })?;

    sqlx::query("SELECT 1")
        .fetch_one(&pool)
        .await
        .map_err(|e| Error::Database {
            message: format!("PostgreSQL did not answer: {}", e).into(),
            source: Some(e),
        })?;
    Ok(pool)
}
