//! Configuration management for Worldthread services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Legacy variables `SEMANTIC_SCHOLAR_API_KEY` and `DEV_MODE`
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::TopicQuery;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Search provider (Semantic Scholar) configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Geocoding provider (Nominatim) configuration
    #[serde(default)]
    pub geocoding: GeocodingConfig,

    /// Topic table and pacing for aggregation passes
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Inbound rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Paper search endpoint
    #[serde(default = "default_search_url")]
    pub base_url: String,

    /// Optional provider credential
    pub api_key: Option<String>,

    /// Header carrying the credential
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Results requested per topic
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Comma-separated field list requested from the provider
    #[serde(default = "default_fields")]
    pub fields: String,

    /// Attempts per search call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-call timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeocodingConfig {
    /// Geocoding search endpoint
    #[serde(default = "default_geocoding_url")]
    pub base_url: String,

    /// Identifying user agent (required by the provider's usage policy)
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Fixed delay before every cache-miss lookup, in milliseconds
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    /// Per-call timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Which failures are remembered as unresolved
    #[serde(default)]
    pub negative_cache: NegativeCachePolicy,
}

/// Which geocoding failures are written to the cache as `Unresolved`
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NegativeCachePolicy {
    /// Every failure (empty result, network, status, parse) is cached
    #[default]
    AllFailures,
    /// Only a successful response without a usable result is cached
    ConfirmedEmptyOnly,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationConfig {
    /// Ordered topic table
    #[serde(default = "default_topics")]
    pub topics: Vec<TopicQuery>,

    /// Maximum nodes emitted per topic per pass
    #[serde(default = "default_per_topic_cap")]
    pub per_topic_cap: usize,

    /// Delay between consecutive topic searches, in milliseconds
    #[serde(default = "default_topic_interval")]
    pub topic_interval_ms: u64,

    /// Adds a fixed delay before every pass
    #[serde(default)]
    pub dev_mode: bool,

    /// Extra delay applied in dev mode, in milliseconds
    #[serde(default = "default_dev_mode_delay")]
    pub dev_mode_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second on the aggregation endpoint
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Opt-in; when on, requests over the limit get 429 instead of nodes
    #[serde(default)]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_search_url() -> String { "https://api.semanticscholar.org/graph/v1/paper/search".to_string() }
fn default_api_key_header() -> String { "x-api-key".to_string() }
fn default_page_size() -> u32 { 8 }
fn default_fields() -> String { "title,abstract,url,authors.name,authors.affiliations,year,publicationDate".to_string() }
fn default_max_attempts() -> u32 { 3 }
fn default_http_timeout() -> u64 { 10 }
fn default_geocoding_url() -> String { "https://nominatim.openstreetmap.org/search".to_string() }
fn default_user_agent() -> String { crate::DEFAULT_USER_AGENT.to_string() }
fn default_min_interval() -> u64 { 1100 }
fn default_per_topic_cap() -> usize { 5 }
fn default_topic_interval() -> u64 { 1500 }
fn default_dev_mode_delay() -> u64 { 2000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_rate_limit() -> u32 { 2 }
fn default_burst() -> u32 { 5 }

fn default_topics() -> Vec<TopicQuery> {
    [
        ("AI", "artificial intelligence"),
        ("Space", "space exploration OR astronomy OR astrophysics"),
        ("Environment", "climate change OR environmental science OR ecology"),
        ("Technology", "machine learning OR computer science"),
        ("Climate", "climate change OR global warming"),
        ("Medicine", "medical research OR healthcare"),
        ("Quantum", "quantum computing OR quantum physics"),
    ]
    .into_iter()
    .map(|(label, query)| TopicQuery::new(label, query))
    .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_search_url(),
            api_key: None,
            api_key_header: default_api_key_header(),
            page_size: default_page_size(),
            fields: default_fields(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoding_url(),
            user_agent: default_user_agent(),
            min_interval_ms: default_min_interval(),
            timeout_secs: default_http_timeout(),
            negative_cache: NegativeCachePolicy::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            topics: default_topics(),
            per_topic_cap: default_per_topic_cap(),
            topic_interval_ms: default_topic_interval(),
            dev_mode: false,
            dev_mode_delay_ms: default_dev_mode_delay(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: false,
        }
    }
}

impl SearchConfig {
    /// Configured credential; a blank value such as `APP__SEARCH__API_KEY=` counts as unset
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.trim().is_empty())
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> crate::errors::Result<Self> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__SEARCH__API_KEY=...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        let mut config: AppConfig = config.try_deserialize()?;
        config.apply_legacy_env(
            std::env::var("SEMANTIC_SCHOLAR_API_KEY").ok(),
            std::env::var("DEV_MODE").ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> crate::errors::Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Fold in the variables the service historically read directly.
    ///
    /// An explicitly configured key wins over `SEMANTIC_SCHOLAR_API_KEY`.
    pub fn apply_legacy_env(&mut self, api_key: Option<String>, dev_mode: Option<String>) {
        if self.search.api_key().is_none() {
            self.search.api_key = api_key.filter(|key| !key.trim().is_empty());
        }
        if dev_mode.as_deref() == Some("true") {
            self.aggregation.dev_mode = true;
        }
    }

    /// Reject configurations the aggregation pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation.topics.is_empty() {
            return Err(ConfigError::Message("aggregation.topics must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for topic in &self.aggregation.topics {
            if !seen.insert(topic.label.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate topic label '{}'",
                    topic.label
                )));
            }
        }

        if self.search.page_size == 0 {
            return Err(ConfigError::Message("search.page_size must be at least 1".into()));
        }
        if self.search.max_attempts == 0 {
            return Err(ConfigError::Message("search.max_attempts must be at least 1".into()));
        }
        if self.aggregation.per_topic_cap == 0 {
            return Err(ConfigError::Message("aggregation.per_topic_cap must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether a search-provider credential is configured
    pub fn api_key_configured(&self) -> bool {
        self.search.api_key().is_some()
    }
}
