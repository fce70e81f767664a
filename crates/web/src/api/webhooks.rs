//! GitLab webhook receiver.
//!
//! Tag pushes and merge request, issue and note events on a group project
//! are turned into a [`PollTrigger`] for that group. Everything else is
//! acknowledged and ignored.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::api::status::AppError;
use crate::{AppState, PollTrigger};

const DELETED_REF: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Deserialize)]
struct GitLabPayload {
    object_kind: String,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    project: Option<GitLabProject>,
}

#[derive(Debug, Deserialize)]
struct GitLabProject {
    path_with_namespace: String,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    ok: bool,
    message: String,
}

impl WebhookResponse {
    fn ignored(message: String) -> Json<Self> {
        debug!(%message, "webhook ignored");
        Json(Self { ok: true, message })
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook/gitlab", post(gitlab_webhook))
}

async fn gitlab_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    if state.config.forge.webhook_secret_env.is_some() {
        let token = headers
            .get("x-gitlab-token")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing X-Gitlab-Token header".into()))?;
        verify_token(token, state.config.forge.webhook_secret.as_deref())
            .map_err(|e| AppError::Unauthorized(format!("webhook verification failed: {}", e)))?;
    }

    let payload: GitLabPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON payload: {}", e)))?;

    if !matches!(
        payload.object_kind.as_str(),
        "tag_push" | "merge_request" | "issue" | "note"
    ) {
        return Ok(WebhookResponse::ignored(format!(
            "event '{}' ignored",
            payload.object_kind
        )));
    }

    let Some(project) = payload.project.as_ref().map(|p| p.path_with_namespace.as_str()) else {
        return Err(AppError::BadRequest("payload has no project".into()));
    };
    let Some((lab, group)) = state.config.locate_project(project) else {
        return Ok(WebhookResponse::ignored(format!(
            "project '{project}' is not a group project"
        )));
    };

    if payload.object_kind == "tag_push" {
        if payload.after.as_deref() == Some(DELETED_REF) {
            return Ok(WebhookResponse::ignored("tag deletion ignored".into()));
        }
        let tag = payload
            .git_ref
            .as_deref()
            .and_then(|r| r.strip_prefix("refs/tags/"))
            .unwrap_or_default();
        if !tag.starts_with(&lab.submission_tag_prefix) {
            return Ok(WebhookResponse::ignored(format!("tag '{tag}' is not a submission tag")));
        }
    }

    let trigger = PollTrigger {
        lab: lab.id.clone(),
        group: Some(group),
    };
    info!(
        event = %payload.object_kind,
        lab = %trigger.lab,
        group = ?trigger.group,
        "webhook received, triggering poll"
    );

    if let Err(e) = state.poll_trigger.send(trigger).await {
        warn!("failed to trigger poll from webhook: {}", e);
        return Err(AppError::Internal("poll scheduler is not running".into()));
    }

    Ok(Json(WebhookResponse {
        ok: true,
        message: format!("{} event received, poll triggered", payload.object_kind),
    }))
}

fn verify_token(token: &str, secret: Option<&str>) -> Result<(), &'static str> {
    let secret = secret.ok_or("webhook secret not configured")?;
    if bool::from(token.as_bytes().ct_eq(secret.as_bytes())) {
        Ok(())
    } else {
        Err("token mismatch")
    }
}
