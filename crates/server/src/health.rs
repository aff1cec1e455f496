//! Health endpoint reporting process liveness and the cluster snapshot.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use cluster::ClusterManager;
use serde_json::json;

pub(crate) fn router(path: &str, manager: Arc<ClusterManager>) -> Router {
    Router::new().route(path, get(health)).with_state(manager)
}

async fn health(State(manager): State<Arc<ClusterManager>>) -> impl IntoResponse {
    let report = manager.status();

    // The endpoint stays 200 as long as the process serves; degraded fleet
    // detail lives in the body for operators and orchestrators.
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "cluster": report,
        })),
    )
}
