//! Affiliation geocoding
//!
//! Resolves free-text institutional affiliations to coordinates through a
//! strictly rate-limited geocoding provider. Results, including failures,
//! are memoized in an [`AffiliationCache`] owned by the service instance.

use crate::config::{GeocodingConfig, NegativeCachePolicy};
use crate::fetch::{HttpRequest, HttpTransport, TransportError};
use crate::metrics;
use crate::models::Coordinates;
use crate::pacing::Sleeper;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Inputs shorter than this (after trimming) are never looked up
pub const MIN_AFFILIATION_CHARS: usize = 3;

const CACHE_NAME: &str = "affiliation";

/// In-memory, non-evicting affiliation cache.
///
/// `None` values are cached negative results and are authoritative for the
/// lifetime of the cache.
#[derive(Debug, Default)]
pub struct AffiliationCache {
    entries: RwLock<HashMap<String, Option<Coordinates>>>,
}

impl AffiliationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if the key was never resolved, `Some(None)` if it is cached as unresolved
    pub async fn get(&self, key: &str) -> Option<Option<Coordinates>> {
        self.entries.read().await.get(key).copied()
    }

    pub async fn insert(&self, key: impl Into<String>, value: Option<Coordinates>) {
        let mut entries = self.entries.write().await;
        entries.insert(key.into(), value);
        metrics::set_cache_entries(entries.len());
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Geocoding provider settings
#[derive(Debug, Clone)]
pub struct GeocodingSettings {
    pub base_url: String,
    pub user_agent: String,
    pub min_interval: Duration,
    pub negative_cache: NegativeCachePolicy,
}

impl From<&GeocodingConfig> for GeocodingSettings {
    fn from(config: &GeocodingConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            user_agent: config.user_agent.clone(),
            min_interval: Duration::from_millis(config.min_interval_ms),
            negative_cache: config.negative_cache,
        }
    }
}

impl Default for GeocodingSettings {
    fn default() -> Self {
        Self::from(&GeocodingConfig::default())
    }
}

#[derive(Debug, Deserialize)]
struct Place {
    #[serde(default)]
    lat: Option<serde_json::Value>,
    #[serde(default)]
    lon: Option<serde_json::Value>,
}

impl Place {
    fn coordinates(&self) -> Option<Coordinates> {
        let lat = degrees_text(self.lat.as_ref()?)?;
        let lng = degrees_text(self.lon.as_ref()?)?;
        Coordinates::parse(&lat, &lng)
    }
}

/// Nominatim sends degrees as strings; plain numbers are accepted too
fn degrees_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Error, Debug)]
enum LookupError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("geocoder returned HTTP {0}")]
    Status(u16),

    #[error("invalid geocoder response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Maps affiliation text to coordinates with memoization and a fixed throttle
pub struct AffiliationResolver {
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    cache: Arc<AffiliationCache>,
    settings: GeocodingSettings,
    // Held across throttle + lookup: one in-flight lookup at a time
    gate: Mutex<()>,
}

impl AffiliationResolver {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        sleeper: Arc<dyn Sleeper>,
        cache: Arc<AffiliationCache>,
        settings: GeocodingSettings,
    ) -> Self {
        Self {
            transport,
            sleeper,
            cache,
            settings,
            gate: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<AffiliationCache> {
        &self.cache
    }

    /// Resolve `affiliation` to coordinates.
    ///
    /// Never fails: any provider problem yields `None`.
    pub async fn resolve(&self, affiliation: &str) -> Option<Coordinates> {
        let key = affiliation.trim();
        if key.chars().count() < MIN_AFFILIATION_CHARS {
            return None;
        }

        if let Some(cached) = self.cache.get(key).await {
            metrics::record_cache(true, CACHE_NAME);
            return cached;
        }

        let _guard = self.gate.lock().await;

        // Another caller may have resolved the key while we waited
        if let Some(cached) = self.cache.get(key).await {
            metrics::record_cache(true, CACHE_NAME);
            return cached;
        }
        metrics::record_cache(false, CACHE_NAME);

        self.sleeper.sleep(self.settings.min_interval).await;
        debug!(affiliation = %key, "Geocoding affiliation");

        match self.lookup(key).await {
            Ok(Some(coords)) => {
                info!(affiliation = %key, lat = coords.lat, lng = coords.lng, "Geocoded affiliation");
                metrics::record_geocode("resolved");
                self.cache.insert(key, Some(coords)).await;
                Some(coords)
            }
            Ok(None) => {
                info!(affiliation = %key, "No geocoding results");
                metrics::record_geocode("empty");
                self.cache.insert(key, None).await;
                None
            }
            Err(e) => {
                warn!(affiliation = %key, error = %e, "Geocoding failed");
                metrics::record_geocode("error");
                if self.settings.negative_cache == NegativeCachePolicy::AllFailures {
                    self.cache.insert(key, None).await;
                }
                None
            }
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<Coordinates>, LookupError> {
        let request = HttpRequest::get(&self.settings.base_url)
            .header("User-Agent", &self.settings.user_agent)
            .query("q", key)
            .query("format", "json")
            .query("limit", 1)
            .query("addressdetails", 1);

        let response = self.transport.get(&request).await?;
        if !response.is_success() {
            return Err(LookupError::Status(response.status));
        }

        let places: Vec<Place> = serde_json::from_str(&response.body)?;
        Ok(places.first().and_then(Place::coordinates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{MockTransport, TransportResponse};
    use crate::pacing::{RecordingSleeper, TokioSleeper};
    use serde_json::json;

    struct Harness {
        transport: Arc<MockTransport>,
        sleeper: Arc<RecordingSleeper>,
        resolver: AffiliationResolver,
    }

    fn harness_with(transport: MockTransport, policy: NegativeCachePolicy) -> Harness {
        let transport = Arc::new(transport);
        let sleeper = Arc::new(RecordingSleeper::new());
        let settings = GeocodingSettings {
            negative_cache: policy,
            ..GeocodingSettings::default()
        };
        let resolver = AffiliationResolver::new(
            transport.clone(),
            sleeper.clone(),
            Arc::new(AffiliationCache::new()),
            settings,
        );
        Harness {
            transport,
            sleeper,
            resolver,
        }
    }

    fn harness(transport: MockTransport) -> Harness {
        harness_with(transport, NegativeCachePolicy::AllFailures)
    }

    fn stanford() -> MockTransport {
        MockTransport::new(|request, _| match request.query_param("q") {
            Some("Stanford University") => Ok(TransportResponse::json(
                &json!([{"lat": "37.4275", "lon": "-122.1697", "display_name": "Stanford"}]),
            )),
            _ => Ok(TransportResponse::json(&json!([]))),
        })
    }

    #[tokio::test]
    async fn test_short_inputs_rejected_without_cache_write() {
        let h = harness(stanford());
        for input in ["", " ", "ab", "  xy  ", "\t\n"] {
            assert_eq!(h.resolver.resolve(input).await, None);
        }
        assert!(h.resolver.cache().is_empty().await);
        assert_eq!(h.transport.call_count(), 0);
        assert!(h.sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_resolves_and_sends_provider_parameters() {
        let h = harness(stanford());
        let coords = h.resolver.resolve("Stanford University").await.unwrap();
        assert_eq!(coords, Coordinates::new(37.4275, -122.1697).unwrap());

        let sent = h.transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://nominatim.openstreetmap.org/search");
        assert_eq!(sent[0].query_param("q"), Some("Stanford University"));
        assert_eq!(sent[0].query_param("format"), Some("json"));
        assert_eq!(sent[0].query_param("limit"), Some("1"));
        assert_eq!(sent[0].query_param("addressdetails"), Some("1"));
        assert_eq!(sent[0].header_value("user-agent"), Some(crate::DEFAULT_USER_AGENT));
        assert_eq!(h.sleeper.delays(), vec![Duration::from_millis(1100)]);
    }

    #[tokio::test]
    async fn test_trimmed_input_is_the_cache_key() {
        let h = harness(stanford());
        assert!(h.resolver.resolve("  Stanford University \n").await.is_some());
        assert!(h.resolver.resolve("Stanford University").await.is_some());

        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.transport.requests()[0].query_param("q"), Some("Stanford University"));
        assert!(h.resolver.cache().get("Stanford University").await.is_some());
    }

    #[tokio::test]
    async fn test_cache_is_case_sensitive() {
        let h = harness(stanford());
        assert!(h.resolver.resolve("Stanford University").await.is_some());
        assert!(h.resolver.resolve("STANFORD UNIVERSITY").await.is_none());
        assert_eq!(h.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_positive_and_negative_hits_skip_network_and_throttle() {
        let h = harness(stanford());
        assert!(h.resolver.resolve("Stanford University").await.is_some());
        assert!(h.resolver.resolve("Atlantis Institute").await.is_none());
        assert_eq!(h.transport.call_count(), 2);

        assert!(h.resolver.resolve("Stanford University").await.is_some());
        assert!(h.resolver.resolve("Atlantis Institute").await.is_none());
        assert_eq!(h.transport.call_count(), 2);
        assert_eq!(h.sleeper.delays().len(), 2);
        assert_eq!(h.resolver.cache().get("Atlantis Institute").await, Some(None));
        assert_eq!(h.resolver.cache().len().await, 2);
    }

    #[tokio::test]
    async fn test_transport_error_is_negative_cached_by_default() {
        let h = harness(MockTransport::sequence(vec![Err(TransportError::Timeout("10s".into()))]));
        assert!(h.resolver.resolve("University of Oxford").await.is_none());
        assert!(h.resolver.resolve("University of Oxford").await.is_none());
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.resolver.cache().get("University of Oxford").await, Some(None));
    }

    #[tokio::test]
    async fn test_confirmed_empty_only_retries_after_errors() {
        let h = harness_with(
            MockTransport::sequence(vec![
                Ok(TransportResponse::new(503, "busy")),
                Ok(TransportResponse::json(&json!([{"lat": "51.7548", "lon": "-1.2544"}]))),
            ]),
            NegativeCachePolicy::ConfirmedEmptyOnly,
        );
        assert!(h.resolver.resolve("University of Oxford").await.is_none());
        assert!(h.resolver.cache().is_empty().await);

        let coords = h.resolver.resolve("University of Oxford").await.unwrap();
        assert_eq!(coords.lat, 51.7548);
        assert_eq!(h.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_confirmed_empty_only_still_caches_empty_results() {
        let h = harness_with(
            MockTransport::sequence(vec![Ok(TransportResponse::json(&json!([])))]),
            NegativeCachePolicy::ConfirmedEmptyOnly,
        );
        assert!(h.resolver.resolve("Nowhere College").await.is_none());
        assert!(h.resolver.resolve("Nowhere College").await.is_none());
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_coordinates_count_as_no_result() {
        let h = harness(MockTransport::sequence(vec![Ok(TransportResponse::json(
            &json!([{"lat": "north", "lon": "-1.25"}]),
        ))]));
        assert!(h.resolver.resolve("University of Oxford").await.is_none());
        assert_eq!(h.resolver.cache().get("University of Oxford").await, Some(None));
    }

    #[tokio::test]
    async fn test_out_of_range_coordinates_rejected() {
        let h = harness(MockTransport::sequence(vec![Ok(TransportResponse::json(
            &json!([{"lat": "123.0", "lon": "10.0"}]),
        ))]));
        assert!(h.resolver.resolve("Somewhere Odd").await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_unresolved() {
        let h = harness(MockTransport::sequence(vec![Ok(TransportResponse::new(200, "{\"error\":1}"))]));
        assert!(h.resolver.resolve("Broken Response Lab").await.is_none());
        assert_eq!(h.resolver.cache().get("Broken Response Lab").await, Some(None));
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_share_one_lookup() {
        let h = harness(stanford());
        let (a, b, c) = tokio::join!(
            h.resolver.resolve("Stanford University"),
            h.resolver.resolve("Stanford University"),
            h.resolver.resolve(" Stanford University"),
        );
        assert!(a.is_some() && b.is_some() && c.is_some());
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_misses_are_throttled_across_callers() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = calls.clone();
        let transport = Arc::new(MockTransport::new(move |_, _| {
            seen.lock().unwrap().push(tokio::time::Instant::now());
            Ok(TransportResponse::json(&json!([{"lat": "47.3763", "lon": "8.5477"}])))
        }));
        let resolver = AffiliationResolver::new(
            transport.clone(),
            Arc::new(TokioSleeper),
            Arc::new(AffiliationCache::new()),
            GeocodingSettings::default(),
        );

        let (a, b) = tokio::join!(resolver.resolve("ETH Zurich"), resolver.resolve("EPFL Lausanne"));
        assert!(a.is_some() && b.is_some());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_numeric_coordinates_accepted() {
        let h = harness(MockTransport::sequence(vec![Ok(TransportResponse::json(
            &json!([{"lat": 35.7126, "lon": 139.762}]),
        ))]));
        let coords = h.resolver.resolve("University of Tokyo").await.unwrap();
        assert_eq!(coords, Coordinates::new(35.7126, 139.762).unwrap());
    }

    #[tokio::test]
    async fn test_prewarmed_cache_is_respected() {
        let h = harness(stanford());
        let coords = Coordinates::new(48.8566, 2.3522).unwrap();
        h.resolver.cache().insert("Sorbonne Université", Some(coords)).await;
        assert_eq!(h.resolver.resolve("Sorbonne Université").await, Some(coords));
        assert_eq!(h.transport.call_count(), 0);
    }
}
