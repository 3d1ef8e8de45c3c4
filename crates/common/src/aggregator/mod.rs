//! Topic aggregation
//!
//! Walks the configured topic table, searches each topic, picks one
//! affiliation per paper, geocodes it, and emits capped per-topic lists of
//! [`VisualizationNode`]s. Failures of a single topic never abort a pass.

use crate::config::{AggregationConfig, AppConfig, SearchConfig};
use crate::errors::{AppError, FetchError};
use crate::fetch::{HttpRequest, ReqwestTransport, RetryingFetcher};
use crate::geocode::{AffiliationCache, AffiliationResolver, GeocodingSettings};
use crate::metrics;
use crate::models::{Paper, SearchResponse, TopicQuery, VisualizationNode};
use crate::pacing::{ExponentialJitterBackoff, Sleeper, TokioSleeper};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// A candidate affiliation must be longer than this after trimming
pub const MIN_CANDIDATE_CHARS: usize = 3;

/// Settings for one aggregator instance
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub topics: Vec<TopicQuery>,
    pub search_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub page_size: u32,
    pub fields: String,
    pub max_attempts: u32,
    pub per_topic_cap: usize,
    pub topic_interval: Duration,
    /// Extra delay before every pass, when set
    pub pre_pass_delay: Option<Duration>,
}

impl AggregatorSettings {
    pub fn from_config(search: &SearchConfig, aggregation: &AggregationConfig) -> Self {
        Self {
            topics: aggregation.topics.clone(),
            search_url: search.base_url.clone(),
            api_key: search.api_key().map(str::to_string),
            api_key_header: search.api_key_header.clone(),
            page_size: search.page_size,
            fields: search.fields.clone(),
            max_attempts: search.max_attempts,
            per_topic_cap: aggregation.per_topic_cap,
            topic_interval: Duration::from_millis(aggregation.topic_interval_ms),
            pre_pass_delay: aggregation
                .dev_mode
                .then(|| Duration::from_millis(aggregation.dev_mode_delay_ms)),
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from_config(&SearchConfig::default(), &AggregationConfig::default())
    }
}

/// First author's first affiliation that is longer than three characters
/// after trimming, scanning authors in order.
pub fn select_affiliation(paper: &Paper) -> Option<&str> {
    paper
        .authors
        .iter()
        .flatten()
        .filter_map(|author| author.affiliations.as_ref()?.first())
        .map(|affiliation| affiliation.trim())
        .find(|affiliation| affiliation.chars().count() > MIN_CANDIDATE_CHARS)
}

/// Orchestrates search, affiliation selection, and geocoding per topic
pub struct TopicAggregator {
    fetcher: RetryingFetcher,
    resolver: Arc<AffiliationResolver>,
    sleeper: Arc<dyn Sleeper>,
    settings: AggregatorSettings,
}

impl TopicAggregator {
    pub fn new(
        fetcher: RetryingFetcher,
        resolver: Arc<AffiliationResolver>,
        sleeper: Arc<dyn Sleeper>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            sleeper,
            settings,
        }
    }

    /// Production wiring: reqwest transports, tokio timers, default backoff
    pub fn from_config(config: &AppConfig, cache: Arc<AffiliationCache>) -> Result<Self, AppError> {
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

        let search_transport = ReqwestTransport::new(
            Duration::from_secs(config.search.timeout_secs),
            Some(crate::DEFAULT_USER_AGENT),
        )?;
        let fetcher = RetryingFetcher::new(
            Arc::new(search_transport),
            Arc::new(ExponentialJitterBackoff::default()),
            sleeper.clone(),
        );

        let geocoding_transport = ReqwestTransport::new(
            Duration::from_secs(config.geocoding.timeout_secs),
            Some(config.geocoding.user_agent.as_str()),
        )?;
        let resolver = AffiliationResolver::new(
            Arc::new(geocoding_transport),
            sleeper.clone(),
            cache,
            GeocodingSettings::from(&config.geocoding),
        );

        Ok(Self::new(
            fetcher,
            Arc::new(resolver),
            sleeper,
            AggregatorSettings::from_config(&config.search, &config.aggregation),
        ))
    }

    /// Configured topics, in order
    pub fn topics(&self) -> &[TopicQuery] {
        &self.settings.topics
    }

    pub fn resolver(&self) -> &Arc<AffiliationResolver> {
        &self.resolver
    }

    /// Topics a pass will visit: the exact match for `filter`, otherwise all
    pub fn working_set(&self, filter: Option<&str>) -> Vec<&TopicQuery> {
        let matched = filter.and_then(|label| {
            self.settings
                .topics
                .iter()
                .find(|topic| topic.label == label)
        });

        match matched {
            Some(topic) => vec![topic],
            None => self.settings.topics.iter().collect(),
        }
    }

    /// Run one aggregation pass. Always returns, possibly with zero nodes.
    #[instrument(skip(self))]
    pub async fn aggregate_nodes(&self, topic_filter: Option<&str>) -> Vec<VisualizationNode> {
        let start = Instant::now();
        let topics = self.working_set(topic_filter);
        info!(topic_count = topics.len(), "Starting aggregation pass");

        if let Some(delay) = self.settings.pre_pass_delay {
            info!(delay_ms = delay.as_millis() as u64, "Dev mode: extra throttling");
            self.sleeper.sleep(delay).await;
        }

        let mut nodes = Vec::new();
        for (i, topic) in topics.iter().enumerate() {
            if i > 0 {
                self.sleeper.sleep(self.settings.topic_interval).await;
            }

            match self.collect_topic(topic).await {
                Ok(topic_nodes) => {
                    info!(topic = %topic.label, nodes = topic_nodes.len(), "Topic complete");
                    metrics::record_topic_nodes(&topic.label, topic_nodes.len());
                    nodes.extend(topic_nodes);
                }
                Err(e) => {
                    error!(topic = %topic.label, error = %e, "Topic failed, continuing with next topic");
                    metrics::record_topic_failure(&topic.label);
                }
            }
        }

        metrics::record_aggregation(start.elapsed().as_secs_f64(), nodes.len());
        info!(total_nodes = nodes.len(), "Aggregation pass complete");
        nodes
    }

    #[instrument(skip(self, topic), fields(topic = %topic.label))]
    async fn collect_topic(&self, topic: &TopicQuery) -> Result<Vec<VisualizationNode>, FetchError> {
        let request = self.search_request(&topic.query);
        let response: SearchResponse = self
            .fetcher
            .fetch_json(&request, self.settings.max_attempts)
            .await?;
        info!(papers = response.data.len(), "Search returned papers");

        let mut nodes = Vec::new();
        for paper in &response.data {
            if nodes.len() >= self.settings.per_topic_cap {
                break;
            }

            if paper.authors.as_ref().map_or(true, Vec::is_empty) {
                continue;
            }

            let Some(affiliation) = select_affiliation(paper) else {
                continue;
            };

            match self.resolver.resolve(affiliation).await {
                Some(coords) => {
                    nodes.push(VisualizationNode::from_paper(&topic.label, paper, coords));
                }
                None => {
                    warn!(affiliation = %affiliation, "Skipping paper with unresolved affiliation");
                }
            }
        }

        Ok(nodes)
    }

    fn search_request(&self, query: &str) -> HttpRequest {
        let mut request = HttpRequest::get(&self.settings.search_url)
            .query("query", query)
            .query("limit", self.settings.page_size)
            .query("fields", &self.settings.fields);

        if let Some(key) = &self.settings.api_key {
            request = request.header(&self.settings.api_key_header, key);
        }
        request
    }
}
