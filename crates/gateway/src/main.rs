//! Worldthread API Gateway
//!
//! Serves geo-tagged paper nodes for the map client.
//! Handles:
//! - Topic aggregation requests
//! - Rate limiting
//! - Health and Prometheus metrics
//! - Observability (logging, metrics, tracing)

mod handlers;
mod middleware;

use axum::{middleware::from_fn, middleware::from_fn_with_state, routing::get, Router};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use worldthread_common::{
    config::{AppConfig, ObservabilityConfig},
    geocode::AffiliationCache,
    metrics::{self, AGGREGATION_BUCKETS, METRICS_PREFIX},
    TopicAggregator,
};

use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitState};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub aggregator: Arc<TopicAggregator>,
    pub metrics: Option<PrometheusHandle>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config.observability);

    info!("Starting Worldthread API Gateway v{}", worldthread_common::VERSION);
    if !config.api_key_configured() {
        tracing::warn!("No search API key configured, using the unauthenticated quota");
    }

    // Initialize metrics
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_aggregation_duration_seconds", METRICS_PREFIX)),
            AGGREGATION_BUCKETS,
        )?
        .install_recorder()?;
    let upkeep = handle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            upkeep.run_upkeep();
        }
    });
    metrics::register_metrics();

    let aggregator = TopicAggregator::from_config(&config, Arc::new(AffiliationCache::new()))?;
    info!(topics = aggregator.topics().len(), "Aggregator ready");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        config: Arc::new(config),
        aggregator: Arc::new(aggregator),
        metrics: Some(handle),
    };

    let app = create_router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let mut papers = Router::new().route("/papers", get(handlers::papers::get_papers));
    let limits = &state.config.rate_limit;
    if limits.enabled {
        let limiter = RateLimitState::new(limits.requests_per_second, limits.burst);
        papers = papers.route_layer(from_fn_with_state(limiter, rate_limit_middleware));
    }

    Router::new()
        .merge(papers)
        .route("/topics", get(handlers::papers::list_topics))
        .route("/health", get(handlers::health::health))
        .route("/metrics", get(handlers::health::metrics))
        .route_layer(from_fn(middleware::metrics::track_metrics))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
