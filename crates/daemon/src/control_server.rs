//! Control HTTP server.
//!
//! Lets operators and the CLI list jobs, trigger a schedule reload, cancel
//! a job and inspect or reset channel history.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::history::HistoryRecord;
use crate::orchestrator::Orchestrator;
use crate::status::JobView;

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /api/jobs
async fn list_jobs(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Vec<JobView>> {
    Json(orchestrator.jobs().await)
}

/// Handler for POST /api/reload
async fn reload(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    orchestrator.trigger();
    (StatusCode::ACCEPTED, Json(json!({ "status": "reload requested" })))
}

/// Handler for POST /api/jobs/:id/cancel
async fn cancel_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> Response {
    if orchestrator.cancel(&id) {
        (StatusCode::OK, Json(json!({ "cancelled": id }))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "error": format!("No active job {}", id) }))).into_response()
    }
}

async fn get_history(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Vec<HistoryRecord>> {
    Json(orchestrator.history().snapshot())
}

#[derive(Debug, Default, Deserialize)]
struct ResetQuery {
    channel: Option<String>,
    server: Option<String>,
}

/// Handler for DELETE /api/history, optionally narrowed by `channel` and `server`
async fn reset_history(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<ResetQuery>,
) -> Response {
    let history = orchestrator.history();
    let removed = history.reset(query.channel.as_deref(), query.server.as_deref());
    info!(removed, channel = ?query.channel, server = ?query.server, "Channel history reset");
    match history.persist().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "removed": removed }))).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to save channel history");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Creates the axum Router for the control API
pub fn create_control_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/reload", post(reload))
        .route("/api/history", get(get_history).delete(reset_history))
        .with_state(orchestrator)
}

/// Serve the control API on `bind` until `shutdown` is cancelled.
pub async fn run_control_server(
    orchestrator: Arc<Orchestrator>,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_control_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Control server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HttpAuthProvider;
    use crate::capture::{LivenessSettings, TokioProcessRunner};
    use crate::history::{AttemptReport, HistoryStore};
    use crate::keywords::{KeywordRules, PreferenceRule};
    use crate::notify::LogNotifier;
    use crate::orchestrator::OrchestratorSettings;
    use crate::planner::{PlannerSettings, RecordingPlanner};
    use crate::postprocess::FfmpegPostProcessor;
    use crate::schedule::{FeedLocation, JsonFeedSource};
    use crate::status::new_shared_status;
    use crate::supervisor::{SupervisorContext, SupervisorSettings};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{Duration as ChronoDuration, Utc};
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use stream_capture_config::AuthConfig;
    use tower::ServiceExt;

    fn write_feed(dir: &std::path::Path) -> PathBuf {
        let fmt = "%Y-%m-%d %H:%M:%S";
        let start = Utc::now() + ChronoDuration::hours(10);
        let end = start + ChronoDuration::hours(2);
        let feed = json!({
            "101": { "items": [ {
                "name": "Cup Final", "channel": "5",
                "time": start.format(fmt).to_string(),
                "end_time": end.format(fmt).to_string()
            } ] }
        });
        let path = dir.join("feed.json");
        std::fs::write(&path, feed.to_string()).unwrap();
        path
    }

    fn create_test_orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        let client = reqwest::Client::new();
        let history = HistoryStore::in_memory();
        history.record_attempt(
            "05",
            "s1",
            AttemptReport {
                kbps: 800,
                failed: false,
                hours: 1.0,
                at: Utc::now(),
            },
        );
        let ctx = SupervisorContext {
            settings: Arc::new(SupervisorSettings {
                servers: vec!["s1".into()],
                capture_program: PathBuf::from("ffmpeg"),
                capture_args: Vec::new(),
                output_dir: dir.to_path_buf(),
                max_retries: 3,
                retry_window: Duration::from_secs(900),
                auth_validity: Duration::from_secs(3600),
            }),
            history: Arc::new(history),
            auth: Arc::new(HttpAuthProvider::new(client.clone(), &AuthConfig::default())),
            runner: Arc::new(TokioProcessRunner::new(LivenessSettings {
                interval: Duration::from_secs(10),
                acceptable_bytes: 1,
            })),
            post: Arc::new(FfmpegPostProcessor::new(PathBuf::from("ffmpeg"), Vec::new(), Vec::new(), None)),
            notifier: Arc::new(LogNotifier),
            status: new_shared_status(),
        };
        let source = JsonFeedSource::new(client, FeedLocation::File(write_feed(dir)));
        let rules = KeywordRules::new(vec![PreferenceRule {
            keywords: vec!["Final".into()],
            ..PreferenceRule::default()
        }]);
        Arc::new(Orchestrator::new(
            OrchestratorSettings {
                check_hours: vec![6],
                fetch_attempts: 1,
                fetch_retry_delay: Duration::from_millis(1),
                retention: None,
                retention_roots: Vec::new(),
            },
            RecordingPlanner::new(PlannerSettings {
                ceiling: 2,
                horizon: ChronoDuration::hours(6),
                time_offset: ChronoDuration::zero(),
            }),
            Arc::new(source),
            Arc::new(rules),
            ctx,
        ))
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_list_jobs_returns_json() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path());
        orchestrator.run_cycle(Utc::now()).await.unwrap();

        let (status, body) = send(create_control_router(orchestrator), "GET", "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        let jobs: Vec<JobView> = serde_json::from_value(body).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].description, "Cup Final");
        assert_eq!(jobs[0].channels[0].number, "05");
        assert!(!jobs[0].flags.dispatched);
        assert!(jobs[0].published.is_none());
    }

    #[tokio::test]
    async fn test_cancel_known_and_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path());
        orchestrator.run_cycle(Utc::now()).await.unwrap();
        let id = orchestrator.jobs().await[0].id.clone();
        let app = create_control_router(orchestrator.clone());

        let (status, body) = send(app.clone(), "POST", &format!("/api/jobs/{}/cancel", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], id.as_str());
        assert!(orchestrator.jobs().await[0].flags.cancelled);

        let (status, _) = send(app, "POST", "/api/jobs/nope/cancel").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reload_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path());
        let (status, body) = send(create_control_router(orchestrator), "POST", "/api/reload").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "reload requested");
    }

    #[tokio::test]
    async fn test_history_get_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path());
        let app = create_control_router(orchestrator.clone());

        let (status, body) = send(app.clone(), "GET", "/api/history").await;
        assert_eq!(status, StatusCode::OK);
        let records: Vec<HistoryRecord> = serde_json::from_value(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].avg_kbps, 400);

        let (status, body) = send(app.clone(), "DELETE", "/api/history?server=other").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 0);

        let (status, body) = send(app, "DELETE", "/api/history?channel=05").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);
        assert!(orchestrator.history().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path());
        let result = run_control_server(orchestrator, "not an address", CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }
}
