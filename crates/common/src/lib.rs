//! Worldthread Common Library
//!
//! Shared code for the Worldthread services including:
//! - Retrying HTTP fetcher for the paper search provider
//! - Affiliation geocoding with an owned, negative-caching memo
//! - Topic aggregation into geo-tagged visualization nodes
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod aggregator;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod geocode;
pub mod metrics;
pub mod models;
pub mod pacing;

// Re-export commonly used types
pub use aggregator::TopicAggregator;
pub use config::AppConfig;
pub use errors::{AppError, FetchError, Result};
pub use geocode::{AffiliationCache, AffiliationResolver};
pub use models::{Coordinates, VisualizationNode};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifying user agent sent to external providers
pub const DEFAULT_USER_AGENT: &str = "Worldthread/1.0";
