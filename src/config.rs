//! Configuration management for the FactFeed engine
//!
//! Provides strongly-typed configuration with validation, environment variable parsing,
//! and sensible defaults.
//!
//! # Example
//! ```no_run
//! use factfeed::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("Max retries: {}", config.retry.max_retries);
//! ```

use crate::error::{Error, Result};
use std::time::Duration;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Store backend selection and connection settings
    pub store: StoreConfig,
    /// Retry/backoff policy of the resilience wrapper
    pub retry: RetryConfig,
    /// Feed and ranking limits
    pub feed: FeedConfig,
    /// Metrics updater behavior
    pub engagement: EngagementConfig,
    /// Response cache namespaces
    pub cache: CacheConfig,
    /// API server configuration
    pub api: ApiConfig,
    /// Optional JSON file of facts imported on startup
    pub seed_facts_file: Option<String>,
}

/// Which store implementation backs the access layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database: DatabaseConfig,
    /// Items requested per page by paginated queries
    pub page_size: usize,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections to keep open
    pub min_connections: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Idle timeout for connections
    pub idle_timeout: Duration,
    /// Maximum lifetime for connections
    pub max_lifetime: Duration,
    /// Enable statement caching
    pub statement_cache_size: usize,
}

/// Bounded exponential backoff: `min(base * 2^attempt, cap)`
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first try
    pub max_retries: u32,
    /// Base delay
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

/// Feed, ranking and pagination limits
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Interactions considered when building category affinity
    pub history_size: usize,
    /// Age window of the trending candidate set
    pub trending_window: Duration,
    /// Upper bound of the trending candidate set
    pub trending_candidates: usize,
    /// Hard cap on items accumulated by a paginated query
    pub max_query_results: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 50,
            history_size: 100,
            trending_window: Duration::from_secs(7 * 24 * 3600),
            trending_candidates: 200,
            max_query_results: 500,
        }
    }
}

/// Metrics updater configuration
#[derive(Debug, Clone, Default)]
pub struct EngagementConfig {
    /// Fold counter increment and popularity into one transactional write
    pub strict_popularity: bool,
}

/// TTL and size bound of one cache namespace
#[derive(Debug, Clone, Copy)]
pub struct NamespaceConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

/// Response cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub feed: NamespaceConfig,
    pub recommendations: NamespaceConfig,
    pub stats: NamespaceConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            feed: NamespaceConfig {
                ttl: Duration::from_secs(60),
                max_entries: 1000,
            },
            recommendations: NamespaceConfig {
                ttl: Duration::from_secs(300),
                max_entries: 1000,
            },
            stats: NamespaceConfig {
                ttl: Duration::from_secs(60),
                max_entries: 1000,
            },
        }
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to listen on
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Request timeout
    pub request_timeout: Duration,
    /// Allowed origins for CORS
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            feed: FeedConfig::default(),
            engagement: EngagementConfig::default(),
            cache: CacheConfig::default(),
            api: ApiConfig::default(),
            seed_facts_file: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database: DatabaseConfig::default(),
            page_size: 100,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost/factfeed_dev".to_string(),
            max_connections: 20,
            min_connections: 2,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            statement_cache_size: 100,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            request_timeout: Duration::from_secs(30),
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Try to load .env file (ignore if not found)
        dotenvy::dotenv().ok();

        let config = Self {
            store: StoreConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            feed: FeedConfig::from_env()?,
            engagement: EngagementConfig {
                strict_popularity: get_env_or("ENGAGEMENT_STRICT_POPULARITY", "false")
                    .parse()
                    .unwrap_or(false),
            },
            cache: CacheConfig::from_env()?,
            api: ApiConfig::from_env()?,
            seed_facts_file: std::env::var("SEED_FACTS_FILE").ok(),
        };

        config.validate()?;
        config.log_summary();

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.store.database.max_connections < self.store.database.min_connections {
            return Err(Error::InvalidConfig {
                key: "DB_MAX_CONNECTIONS",
                message: "max_connections must be >= min_connections".into(),
            });
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::InvalidConfig {
                key: "STORE_BACKOFF_BASE_MS",
                message: "backoff base must not exceed the backoff cap".into(),
            });
        }

        if self.store.page_size == 0 {
            return Err(Error::InvalidConfig {
                key: "STORE_PAGE_SIZE",
                message: "page size must be positive".into(),
            });
        }

        if self.feed.default_limit == 0 || self.feed.default_limit > self.feed.max_limit {
            return Err(Error::InvalidConfig {
                key: "FEED_DEFAULT_LIMIT",
                message: format!(
                    "default limit must be in 1..={}",
                    self.feed.max_limit
                )
                .into(),
            });
        }

        if self.feed.max_query_results < self.feed.max_limit {
            return Err(Error::InvalidConfig {
                key: "FEED_MAX_QUERY_RESULTS",
                message: "max query results must cover at least one full page".into(),
            });
        }

        Ok(())
    }

    /// Log configuration summary (without sensitive data)
    fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Store:");
        info!("    Backend: {:?}", self.store.backend);
        if self.store.backend == StoreBackend::Postgres {
            info!("    URL: {}", mask_url(&self.store.database.url));
            info!(
                "    Pool Size: {}-{}",
                self.store.database.min_connections, self.store.database.max_connections
            );
        }
        info!(
            "    Retries: {} (backoff {:?}..{:?})",
            self.retry.max_retries, self.retry.base_delay, self.retry.max_delay
        );
        info!("  Feed:");
        info!(
            "    Limits: default {}, max {}",
            self.feed.default_limit, self.feed.max_limit
        );
        info!("    Strict popularity: {}", self.engagement.strict_popularity);
        info!("  API:");
        info!("    Listening on: {}:{}", self.api.host, self.api.port);
    }
}

impl StoreConfig {
    fn from_env() -> Result<Self> {
        let backend = get_env_or("STORE_BACKEND", "memory")
            .parse()
            .map_err(|e: String| Error::InvalidConfig {
                key: "STORE_BACKEND",
                message: e.into(),
            })?;

        Ok(Self {
            backend,
            database: DatabaseConfig::from_env()?,
            page_size: get_env_or("STORE_PAGE_SIZE", "100").parse().unwrap_or(100),
        })
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let url = get_env("DATABASE_URL").unwrap_or_else(|_| {
            let user = std::env::var("USER").unwrap_or_else(|_| "postgres".to_string());
            format!("postgres://{}@localhost/factfeed_dev", user)
        });

        Ok(Self {
            url,
            max_connections: get_env_or("DB_MAX_CONNECTIONS", "20").parse().unwrap_or(20),
            min_connections: get_env_or("DB_MIN_CONNECTIONS", "2").parse().unwrap_or(2),
            connect_timeout: Duration::from_secs(
                get_env_or("DB_CONNECT_TIMEOUT_SECS", "30")
                    .parse()
                    .unwrap_or(30),
            ),
            idle_timeout: Duration::from_secs(
                get_env_or("DB_IDLE_TIMEOUT_SECS", "600")
                    .parse()
                    .unwrap_or(600),
            ),
            max_lifetime: Duration::from_secs(
                get_env_or("DB_MAX_LIFETIME_SECS", "3600")
                    .parse()
                    .unwrap_or(3600),
            ),
            statement_cache_size: get_env_or("DB_STATEMENT_CACHE_SIZE", "100")
                .parse()
                .unwrap_or(100),
        })
    }
}

impl RetryConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            max_retries: get_env_parsed_or("STORE_MAX_RETRIES", 3)?,
            base_delay: Duration::from_millis(get_env_parsed_or("STORE_BACKOFF_BASE_MS", 1000)?),
            max_delay: Duration::from_millis(get_env_parsed_or("STORE_BACKOFF_CAP_MS", 5000)?),
        })
    }
}

impl FeedConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            default_limit: get_env_or("FEED_DEFAULT_LIMIT", "20").parse().unwrap_or(20),
            max_limit: get_env_or("FEED_MAX_LIMIT", "50").parse().unwrap_or(50),
            history_size: get_env_or("FEED_HISTORY_SIZE", "100").parse().unwrap_or(100),
            trending_window: Duration::from_secs(
                get_env_or("FEED_TRENDING_WINDOW_HOURS", "168")
                    .parse::<u64>()
                    .unwrap_or(168)
                    * 3600,
            ),
            trending_candidates: get_env_or("FEED_TRENDING_CANDIDATES", "200")
                .parse()
                .unwrap_or(200),
            max_query_results: get_env_or("FEED_MAX_QUERY_RESULTS", "500")
                .parse()
                .unwrap_or(500),
        })
    }
}

impl CacheConfig {
    fn from_env() -> Result<Self> {
        let max_entries = get_env_or("CACHE_MAX_ENTRIES", "1000")
            .parse()
            .unwrap_or(1000);
        let namespace = |key: &str, default_secs: u64| NamespaceConfig {
            ttl: Duration::from_secs(
                get_env_or(key, &default_secs.to_string())
                    .parse()
                    .unwrap_or(default_secs),
            ),
            max_entries,
        };

        Ok(Self {
            feed: namespace("CACHE_FEED_TTL_SECS", 60),
            recommendations: namespace("CACHE_RECOMMENDATIONS_TTL_SECS", 300),
            stats: namespace("CACHE_STATS_TTL_SECS", 60),
        })
    }
}

impl ApiConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            port: get_env_or("API_PORT", "8080").parse().unwrap_or(8080),
            host: get_env_or("API_HOST", "0.0.0.0"),
            request_timeout: Duration::from_secs(
                get_env_or("API_REQUEST_TIMEOUT_SECS", "30")
                    .parse()
                    .unwrap_or(30),
            ),
            cors_origins: get_env_or("API_CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        })
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Get required environment variable
fn get_env(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::MissingEnvVar { var: key })
}

/// Get environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an optional environment variable; a present but malformed value is an error
fn get_env_parsed_or<T>(key: &'static str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| Error::InvalidConfig {
            key,
            message: format!("Invalid value '{}': {}", value, e).into(),
        }),
        Err(_) => Ok(default),
    }
}

/// Mask sensitive parts of URL
fn mask_url(url: &str) -> String {
    // Mask password if present
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let (before, after) = url.split_at(colon_pos + 1);
            let (_, rest) = after.split_at(at_pos - colon_pos - 1);
            return format!("{}****{}", before, rest);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_url_hides_password() {
        assert_eq!(
            mask_url("postgres://feed:secret@db:5432/factfeed"),
            "postgres://feed:****@db:5432/factfeed"
        );
        assert_eq!(mask_url("postgres://localhost/x"), "postgres://localhost/x");
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert_eq!("Postgres".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert!("dynamo".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_defaults_are_consistent() {
        let retry = RetryConfig::default();
        assert!(retry.base_delay <= retry.max_delay);
        let feed = FeedConfig::default();
        assert!(feed.default_limit <= feed.max_limit);
        assert_eq!(feed.max_limit, 50);
        assert!(Config::default().validate().is_ok());
    }
}
