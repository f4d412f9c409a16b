//! Axum trigger endpoint for SBT.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use sbt_sync::{SyncPipeline, TrackerConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "sbt-web";

pub const TRIGGER_ACK: &str = "Updating data";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(trigger_handler))
        .route("/sync", get(sync_summary_handler))
        .with_state(Arc::new(state))
}

/// Bind the configured address and serve until the listener fails.
pub async fn serve(pipeline: Arc<SyncPipeline>) -> anyhow::Result<()> {
    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("starting scheduler: {e:?}"))?;
        info!("scheduled sync enabled");
    }

    let config = pipeline.config();
    let listener = TcpListener::bind((config.listen_addr.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(AppState::new(pipeline.clone()))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = SyncPipeline::from_config(TrackerConfig::from_env()).await?;
    serve(Arc::new(pipeline)).await
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => {
            if summary.failed > 0 {
                warn!(run_id = %summary.run_id, failed = summary.failed, "sync finished with failures");
            }
            (StatusCode::OK, TRIGGER_ACK).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn sync_summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "sync failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err:#}"),
    )
        .into_response()
}
