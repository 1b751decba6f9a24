//! Recommendation Module
//!
//! Personalized fact ranking for a user.
//!
//! ## Architecture
//!
//! 1. **Preferences** - User records, lazily created with default preferences
//! 2. **Scoring** - Pure weighted heuristics (personalized, similarity, trending)
//! 3. **Engine** - Candidate sourcing, read exclusion, scoring and top-K selection
//!
//! ## Algorithm Overview
//!
//! The personalized score combines:
//! - Popularity (0.3 × popularity)
//! - Category affinity from interaction history (0.4 × affinity)
//! - Difficulty match (+20)
//! - Reading time within the user's maximum (+10)
//! - Created within the last 7 days (+5)
//!
//! Any failure degrades to popularity order instead of an error.

pub mod engine;
pub mod metrics;
pub mod preferences;
pub mod scoring;

pub use engine::{Algorithm, RankingEngine, RankingLimits, Recommendations};
pub use preferences::UserProfiles;
pub use scoring::ScoringWeights;
