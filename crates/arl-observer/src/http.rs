use std::sync::Arc;

use arl_core::{ActivityQuery, TrackerStats};
use arl_tracker::ActivityTracker;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

pub fn router(tracker: Arc<ActivityTracker>) -> Router {
    Router::new()
        .route("/activity", get(list_activities))
        .route("/activity/digest", get(activity_digest))
        .route("/activity/:id", get(activity_by_id))
        .route("/stats", get(tracker_stats))
        .route("/health", get(|| async { "ok" }))
        .with_state(tracker)
}

#[derive(Debug, Deserialize)]
struct ListParams {
    agent: Option<String>,
    since: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<String>,
}

async fn list_activities(
    State(tracker): State<Arc<ActivityTracker>>,
    Query(params): Query<ListParams>,
) -> Json<serde_json::Value> {
    let query = ActivityQuery {
        agent: params.agent,
        since: params.since,
        kind: params.kind,
        // A limit that does not parse falls back to the default.
        limit: params.limit.and_then(|raw| raw.parse().ok()),
    };
    Json(json!({ "activities": tracker.query(&query) }))
}

async fn activity_by_id(
    State(tracker): State<Arc<ActivityTracker>>,
    Path(id): Path<String>,
) -> Response {
    match tracker.get(&id) {
        Some(activity) => Json(json!({ "activity": activity })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Activity not found." })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DigestParams {
    since: Option<String>,
}

async fn activity_digest(
    State(tracker): State<Arc<ActivityTracker>>,
    Query(params): Query<DigestParams>,
) -> Response {
    let since = params.since.unwrap_or_default();
    if since.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing required parameter: since" })),
        )
            .into_response();
    }
    Json(tracker.digest(&since, Utc::now())).into_response()
}

async fn tracker_stats(State(tracker): State<Arc<ActivityTracker>>) -> Json<TrackerStats> {
    Json(tracker.stats())
}
