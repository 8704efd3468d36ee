//! Axum HTTP surface for AI match rescoring.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ojt_core::ScoreRecord;
use ojt_rescore::{RescoreError, RescorePipeline, RescoreRequest};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "ojt-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RescorePipeline>,
}

impl AppState {
    pub fn new(pipeline: RescorePipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("OJT_WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("OJT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let host = if self.host.eq_ignore_ascii_case("localhost") {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        format!("{host}:{}", self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[derive(Debug, Serialize)]
struct RescoreResponse {
    ok: bool,
    results: Vec<ScoreRecord>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/ai-matches/rescore-job", post(rescore_job_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WebConfig, state: AppState) -> anyhow::Result<()> {
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn rescore_job_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RescoreRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.pipeline.handle(request).await {
        Ok(outcome) => Json(RescoreResponse {
            ok: true,
            results: outcome.results,
        })
        .into_response(),
        Err(err) => rescore_error(err),
    }
}

fn status_for(err: &RescoreError) -> StatusCode {
    match err {
        RescoreError::MissingJobId => StatusCode::BAD_REQUEST,
        RescoreError::JobNotFound(_) => StatusCode::NOT_FOUND,
        RescoreError::JobLookup(_)
        | RescoreError::CandidateResolution(_)
        | RescoreError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rescore_error(err: RescoreError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "rescore run failed");
    } else {
        warn!(error = %err, "rescore request rejected");
    }
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
