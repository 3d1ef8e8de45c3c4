//! Paper node handlers

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use worldthread_common::models::{TopicQuery, VisualizationNode};

/// Query string for `GET /papers`
#[derive(Debug, Default, Deserialize, Validate)]
pub struct PapersQuery {
    /// Topic label; unknown labels mean every topic
    #[validate(length(max = 128))]
    pub topic: Option<String>,
}

impl PapersQuery {
    /// The filter to aggregate with. A value no configured label could
    /// match is dropped, which selects every topic.
    pub fn topic_filter(&self) -> Option<&str> {
        match self.validate() {
            Ok(()) => self.topic.as_deref(),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring topic filter");
                None
            }
        }
    }
}

/// Run an aggregation pass. Always 200, degraded passes included.
pub async fn get_papers(
    State(state): State<AppState>,
    Query(query): Query<PapersQuery>,
) -> Json<Vec<VisualizationNode>> {
    Json(state.aggregator.aggregate_nodes(query.topic_filter()).await)
}

/// Configured topic table, in processing order
pub async fn list_topics(State(state): State<AppState>) -> Json<Vec<TopicQuery>> {
    Json(state.aggregator.topics().to_vec())
}
