//! FactFeed library crate
//!
//! Personalized fact feed over a partitioned key-value store: resilient batch
//! access, interaction ledger, ranking engine and feed pagination. Re-exports core
//! modules for the service binary and integration tests.

pub mod access;
pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod engagement;
pub mod error;
pub mod facts;
pub mod feed;
pub mod ledger;
pub mod models;
pub mod recommendation;
pub mod store;

// Re-export commonly used types
pub use access::DataAccess;
pub use config::Config;
pub use database::Database;
pub use error::{Error, Result};
pub use feed::{FeedCoordinator, FeedRequest, SortMode};
pub use ledger::InteractionLedger;
pub use recommendation::{Algorithm, RankingEngine, Recommendations};
pub use store::{MemoryStore, PartitionedStore, PgStore};
