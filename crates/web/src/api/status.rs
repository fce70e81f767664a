//! Status, health check and group overview endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use labsync_core::engine::{CycleSummary, LAST_CYCLE_KEY};
use labsync_core::models::GroupStatusRow;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    course: String,
    state: String,
    last_poll_at: Option<String>,
    last_cycle: Option<CycleSummary>,
    labs: Vec<String>,
    total_audit_entries: i64,
    total_errors: i64,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct GroupsResponse {
    lab: String,
    groups: Vec<GroupStatusRow>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/status/health", get(health_check))
        .route("/api/groups/:lab", get(list_groups))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let db = &state.db;
    let last_cycle = db
        .get_state(LAST_CYCLE_KEY)
        .map_err(internal)?
        .and_then(|json| serde_json::from_str(&json).ok());

    Ok(Json(StatusResponse {
        course: state.config.daemon.course.clone(),
        state: db
            .get_state("poll_state")
            .map_err(internal)?
            .unwrap_or_else(|| "idle".into()),
        last_poll_at: db.get_state("last_poll_at").map_err(internal)?,
        last_cycle,
        labs: state
            .config
            .labs
            .iter()
            .filter(|l| l.enabled)
            .map(|l| l.id.clone())
            .collect(),
        total_audit_entries: db.count_audit_log().map_err(internal)?,
        total_errors: db.count_errors().map_err(internal)?,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    Path(lab): Path<String>,
) -> Result<Json<GroupsResponse>, AppError> {
    state
        .config
        .lab(&lab)
        .map_err(|_| AppError::NotFound(format!("unknown lab '{lab}'")))?;
    let groups = state.db.group_status_rows(&lab).map_err(internal)?;
    Ok(Json(GroupsResponse { lab, groups }))
}

fn internal(e: impl std::fmt::Display) -> AppError {
    AppError::Internal(format!("database error: {e}"))
}

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// Simple API error type that converts to an Axum response.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Internal(String),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (axum::http::StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (axum::http::StatusCode::NOT_FOUND, msg),
            AppError::Unauthorized(msg) => (axum::http::StatusCode::UNAUTHORIZED, msg),
            AppError::Internal(msg) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use labsync_core::models::{GradingStatus, Group};

    use crate::test_support::{body_json, server};

    use super::*;

    #[tokio::test]
    async fn test_health() {
        let (server, _db, _rx) = server(None);
        let response = server
            .router()
            .oneshot(Request::get("/api/status/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn test_status_reports_last_cycle() {
        let (server, db, _rx) = server(None);
        let summary = serde_json::json!({
            "started_at": "2026-10-01T10:00:00Z",
            "finished_at": "2026-10-01T10:00:05Z",
            "groups": 3,
            "new_submissions": 2,
            "registered": 2,
            "status_changes": 1,
            "held_back": 0,
            "failed_groups": 0,
            "interrupted": false
        });
        db.set_state(LAST_CYCLE_KEY, &summary.to_string()).unwrap();
        db.set_state("last_poll_at", "2026-10-01T10:00:05+00:00").unwrap();

        let response = server
            .router()
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["course"], "cs101");
        assert_eq!(body["state"], "idle");
        assert_eq!(body["last_cycle"]["new_submissions"], 2);
        assert_eq!(body["labs"], serde_json::json!(["lab1"]));
    }

    #[tokio::test]
    async fn test_groups_overview() {
        let (server, db, _rx) = server(None);
        db.upsert_group(&Group {
            lab_id: "lab1".into(),
            id: "g1".into(),
            members: vec!["alice".into()],
            project_path: "cs101/groups/g1/lab1".into(),
            active: true,
        })
        .unwrap();

        let response = server
            .router()
            .oneshot(Request::get("/api/groups/lab1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["groups"][0]["group_id"], "g1");
        assert_eq!(
            body["groups"][0]["status"],
            serde_json::to_value(GradingStatus::NoSubmission).unwrap()
        );
    }

    #[tokio::test]
    async fn test_groups_unknown_lab_is_404() {
        let (server, _db, _rx) = server(None);
        let response = server
            .router()
            .oneshot(Request::get("/api/groups/lab9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
