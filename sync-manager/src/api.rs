//! Admin HTTP API - control surface for configured sources.
//!
//! Exposes five routes:
//! - `GET /api/sources` - sources with their bookkeeping and loop status
//! - `POST /api/sources/:owner/:name/sync` - run one pass, return the report
//! - `POST /api/sources/:owner/:name/test` - check the provider connection
//! - `POST /api/sources/:owner/:name/start` - (re)start the auto-sync loop
//! - `POST /api/sources/:owner/:name/stop` - stop the auto-sync loop
//!
//! Source provisioning is not exposed here; sources are written to the
//! configuration store directly.

use crate::manager::{AutoSynchronizer, LoopSnapshot};
use crate::reconcile::SyncReport;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use dirsync::SyncError;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for the admin API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<AutoSynchronizer>,
}

/// A single entry in the `GET /api/sources` response. Secrets are never listed.
#[derive(Debug, Serialize)]
pub struct SourceSummary {
    pub id: String,
    pub organization: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub auto_sync: u64,
    pub is_enabled: bool,
    pub is_read_only: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub error_text: String,
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_status: Option<LoopSnapshot>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn list_sources(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<SourceSummary>>, AppError> {
    let sources = state.manager.service().sources().list_sources()?;
    let mut loops = state.manager.status().await;

    let summaries = sources
        .into_iter()
        .map(|s| {
            let id = s.id();
            SourceSummary {
                loop_status: loops.remove(&id),
                id,
                organization: s.organization,
                provider_type: s.provider_type,
                auto_sync: s.auto_sync,
                is_enabled: s.is_enabled,
                is_read_only: s.is_read_only,
                last_sync_time: s.last_sync_time,
                last_attempt_time: s.last_attempt_time,
                error_text: s.error_text,
            }
        })
        .collect();
    Ok(Json(summaries))
}

async fn sync_source(
    State(state): State<Arc<ApiState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<SyncReport>, AppError> {
    let id = existing_source(&state, &owner, &name)?;
    let report = state.manager.service().run_sync_once(&id).await?;
    Ok(Json(report))
}

async fn test_source(
    State(state): State<Arc<ApiState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let id = existing_source(&state, &owner, &name)?;
    state.manager.service().test_connection(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_source(
    State(state): State<Arc<ApiState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let id = existing_source(&state, &owner, &name)?;
    state.manager.start_auto_sync(&id).await?;
    info!(source_id = %id, "Auto-sync started via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_source(
    State(state): State<Arc<ApiState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<StopResponse>, AppError> {
    let id = existing_source(&state, &owner, &name)?;
    let stopped = state.manager.stop_auto_sync(&id).await;
    Ok(Json(StopResponse { stopped }))
}

fn existing_source(state: &ApiState, owner: &str, name: &str) -> Result<String, AppError> {
    let id = format!("{}/{}", owner, name);
    match state.manager.service().sources().get_source(&id)? {
        Some(_) => Ok(id),
        None => Err(AppError::NotFound(id)),
    }
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

enum AppError {
    NotFound(String),
    Sync(SyncError),
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        AppError::Sync(e)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Sync(SyncError::Store(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: format!("source '{}' not found", id),
                    kind: "not_found",
                },
            ),
            AppError::Sync(e) => {
                let status = match &e {
                    SyncError::Configuration(_) | SyncError::Unsupported { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    SyncError::TransientNetwork(_) | SyncError::SchemaMismatch(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    SyncError::PartialBatch { .. } | SyncError::Store(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (
                    status,
                    ErrorResponse {
                        error: e.to_string(),
                        kind: e.kind(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/sources", get(list_sources))
        .route("/api/sources/:owner/:name/sync", post(sync_source))
        .route("/api/sources/:owner/:name/test", post(test_source))
        .route("/api/sources/:owner/:name/start", post(start_source))
        .route("/api/sources/:owner/:name/stop", post(stop_source))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, source, Behavior, Fixture};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn build_app(behavior: Behavior) -> (Router, Arc<AutoSynchronizer>, Fixture) {
        let fx = fixture(&[source("scim", 5), source("manual", 0)], behavior, Duration::ZERO);
        let manager = Arc::new(AutoSynchronizer::new(Arc::clone(&fx.service)));
        let router = create_router(ApiState {
            manager: Arc::clone(&manager),
        });
        (router, manager, fx)
    }

    fn post_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_sync_returns_report() {
        let (app, _, _) = build_app(Behavior::Succeed);

        let response = app.oneshot(post_request("/api/sources/admin/scim/sync")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let report = json_body(response).await;
        assert_eq!(report["inserted"], 1);
        assert_eq!(report["updated"], 0);
    }

    #[tokio::test]
    async fn test_sync_failure_maps_status() {
        let (app, _, _) = build_app(Behavior::FailNetwork);
        let response =
            app.clone().oneshot(post_request("/api/sources/admin/scim/sync")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["kind"], "transient_network");

        let (app, _, _) = build_app(Behavior::FailConfiguration);
        let response = app.oneshot(post_request("/api/sources/admin/scim/test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_source_is_404() {
        let (app, _, _) = build_app(Behavior::Succeed);
        let response = app.oneshot(post_request("/api/sources/admin/nope/sync")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_list_stop() {
        let (app, manager, _) = build_app(Behavior::Succeed);

        let response =
            app.clone().oneshot(post_request("/api/sources/admin/scim/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(manager.is_running("admin/scim").await);

        // No interval configured
        let response =
            app.clone().oneshot(post_request("/api/sources/admin/manual/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder().uri("/api/sources").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = json_body(response).await;
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 2);
        let scim = listed.iter().find(|s| s["id"] == "admin/scim").unwrap();
        assert_eq!(scim["loop"]["running"], true);
        assert!(scim.get("password").is_none());
        let manual = listed.iter().find(|s| s["id"] == "admin/manual").unwrap();
        assert!(manual.get("loop").is_none());

        let response =
            app.clone().oneshot(post_request("/api/sources/admin/scim/stop")).await.unwrap();
        assert_eq!(json_body(response).await["stopped"], true);
        let response = app.oneshot(post_request("/api/sources/admin/scim/stop")).await.unwrap();
        assert_eq!(json_body(response).await["stopped"], false);
    }
}
