//! Inbound HTTP trigger for pull runs.

use std::sync::Arc;

use adpull_sync::{PullConfig, PullPipeline, PullSummary};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "adpull-web";

#[derive(Clone)]
pub struct AppState {
    pub config: PullConfig,
}

impl AppState {
    pub fn new(config: PullConfig) -> Self {
        Self { config }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", post(trigger_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ADPULL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = PullConfig::from_env()?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger server listening");
    axum::serve(listener, app(AppState::new(config))).await?;
    Ok(())
}

/// Trigger endpoint. A body carrying `accountId` runs the pipeline for that
/// one account and answers with the run summary. Every other body belongs to
/// the external event/task path and is acknowledged without pulling.
async fn trigger_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let parsed: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid JSON body: {err}") })),
                )
                    .into_response()
            }
        }
    };

    match account_id_from_body(&parsed) {
        Some(account_id) => {
            info!(account_id = %account_id, "pull triggered for one account");
            match pull_single_account(&state.config, &account_id).await {
                Ok(summary) => Json(summary).into_response(),
                Err(err) => server_error(err),
            }
        }
        None => {
            info!("trigger body carries no account id, acknowledging");
            (StatusCode::ACCEPTED, Json(json!({ "handled": false }))).into_response()
        }
    }
}

async fn healthz_handler() -> Response {
    (StatusCode::OK, "ok").into_response()
}

fn account_id_from_body(body: &Value) -> Option<String> {
    match body.get("accountId")? {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

async fn pull_single_account(config: &PullConfig, account_id: &str) -> anyhow::Result<PullSummary> {
    let mut config = config.clone();
    config.account_ids = vec![account_id.to_string()];
    let pipeline = PullPipeline::new(config)?;
    pipeline.run_once().await
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
