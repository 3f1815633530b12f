//! JSON trigger API for the tracker: start a run, read the persisted state.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobtrack_core::RunState;
use jobtrack_storage::{load_state, LockAttempt};
use jobtrack_sync::{acquire_run_lock, run_with_lock, TrackerConfig};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobtrack-web";

pub struct AppState {
    pub config: TrackerConfig,
    /// Serializes lock check-and-create between concurrent requests to this server.
    run_mutex: Mutex<()>,
}

impl AppState {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            run_mutex: Mutex::new(()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TriggerReply {
    Busy { ok: bool },
    Started { ok: bool, run_id: Uuid, pid: u32 },
    Error { ok: bool, error: String },
}

#[derive(Debug, Serialize)]
struct StateReply {
    #[serde(flatten)]
    state: RunState,
    running: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/run", get(run_usage_handler).post(run_trigger_handler))
        .route("/api/state", get(state_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("JOBTRACK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let bind = std::env::var("JOBTRACK_WEB_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
    let state = AppState::new(TrackerConfig::from_env());
    let listener = TcpListener::bind((bind.as_str(), port)).await?;
    info!(%bind, port, "trigger api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn run_usage_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": false, "error": "Use POST /api/run" }))
}

/// Checks the run lock and, when free, spawns the run without waiting for it.
async fn run_trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    let _serial = state.run_mutex.lock().await;
    let reply = match acquire_run_lock(state.config.data().run_lock()).await {
        Ok(LockAttempt::Busy(holder)) => {
            info!(holder = ?holder, "run request while busy");
            TriggerReply::Busy { ok: true }
        }
        Ok(LockAttempt::Acquired(guard)) => {
            let run_id = Uuid::new_v4();
            let pid = guard.record().pid;
            let config = state.config.clone();
            tokio::spawn(
                async move {
                    match run_with_lock(config, guard).await {
                        Ok(report) => info!(
                            jobs = report.jobs,
                            new = report.new_jobs,
                            "triggered run finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "triggered run failed"),
                    }
                }
                .instrument(info_span!("triggered_run", %run_id)),
            );
            TriggerReply::Started { ok: true, run_id, pid }
        }
        Err(err) => TriggerReply::Error {
            ok: false,
            error: format!("{err:#}"),
        },
    };
    let status = match reply {
        TriggerReply::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, Json(reply)).into_response()
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Response {
    let data = state.config.data();
    let lock = data.run_lock();
    let inspected = tokio::task::spawn_blocking(move || lock.inspect())
        .await
        .map_err(|err| err.to_string())
        .and_then(|status| status.map_err(|err| err.to_string()));
    let running = match inspected {
        Ok(status) => status.is_running(),
        Err(error) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "ok": false, "error": error })),
            )
                .into_response()
        }
    };
    let persisted = load_state(&data.state()).await;
    Json(StateReply {
        state: persisted,
        running,
    })
    .into_response()
}
