use std::collections::HashMap;
use std::sync::Arc;

use shuttle_axum::axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::config::validate_sources;
use crate::history::{RunHistory, RunSummary};
use crate::model::SourceConfig;
use crate::pipeline::Pipeline;
use crate::pool::PoolStats;

pub const MAX_LOOKBACK_DAYS: u32 = 90;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub history: Arc<RunHistory>,
    /// Used when a run request carries no sources.
    pub default_sources: Arc<Vec<SourceConfig>>,
    pub default_lookback_days: u32,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/runs", post(start_run))
        .route("/runs/recent", get(recent_runs))
        .route("/debug/pool", get(debug_pool))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Default, serde::Deserialize)]
struct RunReq {
    #[serde(default)]
    sources: Option<Vec<SourceConfig>>,
    #[serde(default)]
    lookback_days: Option<u32>,
}

fn error_json(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": msg.into() }))).into_response()
}

async fn start_run(State(state): State<AppState>, Json(body): Json<RunReq>) -> Response {
    let lookback = body.lookback_days.unwrap_or(state.default_lookback_days);
    if lookback == 0 || lookback > MAX_LOOKBACK_DAYS {
        return error_json(
            StatusCode::BAD_REQUEST,
            format!("lookback_days must be between 1 and {MAX_LOOKBACK_DAYS}"),
        );
    }

    let sources: Vec<SourceConfig> = match body.sources {
        Some(s) => {
            if let Err(e) = validate_sources(&s) {
                return error_json(StatusCode::BAD_REQUEST, format!("{e:#}"));
            }
            s
        }
        None => state.default_sources.as_ref().clone(),
    };
    if sources.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "no sources given and none configured");
    }

    match state
        .pipeline
        .run_multi_source_analysis(&sources, lookback)
        .await
    {
        Ok(report) => {
            state.history.push(&report);
            Json(report).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            state.history.push_failure(sources.len(), lookback, &e.to_string());
            error_json(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn recent_runs(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<RunSummary>> {
    let n = q
        .get("n")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(20)
        .min(500);
    Json(state.history.snapshot_last_n(n))
}

async fn debug_pool(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.pipeline.pool().stats())
}
