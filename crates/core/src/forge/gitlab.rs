//! GitLab v4 REST API client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{starts_with_ignore_case, Forge, ForgeTag, ForgeUser, NewHook, NewThread, ProjectHook};
use crate::config::AppConfig;
use crate::errors::ForgeError;
use crate::models::{LabelAction, LabelEvent, LabelObservation, ThreadKind, ThreadRef};
use crate::retry::{retry_async, RetryPolicy};

const PER_PAGE: &str = "100";

/// GitLab access level of developers; students push tags at this level.
const DEVELOPER_ACCESS: u32 = 30;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: u64,
    username: String,
}

#[derive(Debug, Deserialize)]
struct ApiTag {
    name: String,
    message: Option<String>,
    created_at: Option<DateTime<Utc>>,
    commit: ApiTagCommit,
}

#[derive(Debug, Deserialize)]
struct ApiTagCommit {
    id: String,
    committed_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiThread {
    iid: u64,
    title: String,
    web_url: String,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLabelEvent {
    id: i64,
    user: Option<ApiUser>,
    created_at: DateTime<Utc>,
    label: Option<ApiLabel>,
    action: String,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    username: String,
}

#[derive(Debug, Deserialize)]
struct ApiHook {
    id: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiProtectedTag {
    name: String,
}

impl From<ApiTag> for ForgeTag {
    fn from(tag: ApiTag) -> Self {
        ForgeTag {
            name: tag.name,
            commit: tag.commit.id,
            message: tag.message.filter(|m| !m.trim().is_empty()),
            created_at: tag.created_at.or(tag.commit.committed_date),
        }
    }
}

impl ApiLabelEvent {
    /// Events for labels that have since been deleted carry no label and
    /// are dropped.
    fn into_event(self) -> Option<LabelEvent> {
        let action = match self.action.as_str() {
            "add" => LabelAction::Add,
            "remove" => LabelAction::Remove,
            _ => return None,
        };
        Some(LabelEvent {
            id: self.id,
            actor: self.user.map(|u| u.username).unwrap_or_default(),
            label: self.label?.name,
            action,
            created_at: self.created_at,
        })
    }
}

/// The newest event on one of the `tracked` labels.
fn latest_tracked(events: Vec<ApiLabelEvent>, tracked: &[&str]) -> Option<LabelEvent> {
    events
        .into_iter()
        .filter_map(ApiLabelEvent::into_event)
        .filter(|e| tracked.contains(&e.label.as_str()))
        .max_by_key(|e| e.id)
}

fn thread_segment(kind: ThreadKind) -> &'static str {
    match kind {
        ThreadKind::MergeRequest => "merge_requests",
        ThreadKind::Issue => "issues",
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Asynchronous GitLab REST API client authenticated with a private token.
#[derive(Clone)]
pub struct GitLabForge {
    http: reqwest::Client,
    api_url: Url,
    token: String,
    retry: RetryPolicy,
}

impl GitLabForge {
    pub fn new(
        api_url: &str,
        token: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ForgeError> {
        let api_url = Url::parse(api_url.trim_end_matches('/'))
            .map_err(|e| ForgeError::ParseError(format!("invalid API URL '{api_url}': {e}")))?;
        if api_url.cannot_be_a_base() {
            return Err(ForgeError::ParseError(format!(
                "API URL '{api_url}' cannot be used as a base"
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("labsync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        info!(api_url = %api_url, "created GitLabForge");
        Ok(Self {
            http,
            api_url,
            token: token.into(),
            retry,
        })
    }

    /// Build a client from the resolved configuration. A missing token is
    /// an authentication failure.
    pub fn from_config(config: &AppConfig) -> Result<Self, ForgeError> {
        let token = config.forge.token.clone().ok_or_else(|| {
            ForgeError::AuthenticationFailed(format!(
                "no token in environment variable '{}'",
                config.forge.token_env
            ))
        })?;
        Self::new(
            &config.forge.api_url,
            token,
            config.forge.request_timeout(),
            config.retry.policy(),
        )
    }

    /// `{api_url}/{segments...}` with every segment percent-encoded, so a
    /// project path like `a/b/c` becomes the single segment `a%2Fb%2Fc`.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        url
    }

    fn thread_endpoint(&self, project: &str, thread: &ThreadRef, rest: &[&str]) -> Url {
        let iid = thread.iid.to_string();
        let mut segments = vec!["projects", project, thread_segment(thread.kind), iid.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    /// Send the request produced by `build`. Transient failures are retried
    /// for idempotent methods only; a POST is sent once.
    async fn execute(
        &self,
        what: &str,
        method: &Method,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, ForgeError> {
        let once = RetryPolicy::none();
        let policy = if method.is_idempotent() { &self.retry } else { &once };
        retry_async(policy, what, ForgeError::is_transient, || {
            let request = build().header("PRIVATE-TOKEN", self.token.as_str());
            async move {
                let resp = request.send().await?;
                check_response(resp).await
            }
        })
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        what: &str,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, ForgeError> {
        let resp = self
            .execute(what, &Method::GET, || self.http.get(url.clone()).query(query))
            .await?;
        parse_json(resp).await
    }

    /// Follow `x-next-page` until the last page.
    async fn get_all<T: DeserializeOwned>(
        &self,
        what: &str,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, ForgeError> {
        let mut items = Vec::new();
        let mut page = String::from("1");
        loop {
            let resp = self
                .execute(what, &Method::GET, || {
                    self.http
                        .get(url.clone())
                        .query(query)
                        .query(&[("per_page", PER_PAGE), ("page", page.as_str())])
                })
                .await?;
            let next = next_page(&resp);
            let mut batch: Vec<T> = parse_json(resp).await?;
            items.append(&mut batch);
            match next {
                Some(n) => page = n,
                None => break,
            }
        }
        debug!(operation = what, count = items.len(), "fetched all pages");
        Ok(items)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        what: &str,
        method: Method,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<T, ForgeError> {
        let resp = self
            .execute(what, &method, || {
                self.http.request(method.clone(), url.clone()).json(body)
            })
            .await?;
        parse_json(resp).await
    }
}

async fn check_response(resp: Response) -> Result<Response, ForgeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(ForgeError::AuthenticationFailed(format!(
            "HTTP {status} from {}",
            resp.url().path()
        ))),
        StatusCode::NOT_FOUND => Err(ForgeError::NotFound(resp.url().path().to_string())),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            Err(ForgeError::RateLimited { retry_after })
        }
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(ForgeError::ApiError {
                status: status.as_u16(),
                body: error_message(&body),
            })
        }
    }
}

/// GitLab reports errors as `{"message": ...}` or `{"error": ...}`.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .map(|m| match m.as_str() {
                    Some(s) => s.to_string(),
                    None => m.to_string(),
                })
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn next_page(resp: &Response) -> Option<String> {
    resp.headers()
        .get("x-next-page")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

async fn parse_json<T: DeserializeOwned>(resp: Response) -> Result<T, ForgeError> {
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| ForgeError::ParseError(e.to_string()))
}

fn thread_ref(kind: ThreadKind, thread: &ApiThread) -> ThreadRef {
    ThreadRef {
        kind,
        iid: thread.iid,
        web_url: thread.web_url.clone(),
    }
}

#[async_trait]
impl Forge for GitLabForge {
    #[instrument(skip(self))]
    async fn current_user(&self) -> Result<ForgeUser, ForgeError> {
        let user: ApiUser = self
            .get_json("current_user", self.endpoint(&["user"]), &[])
            .await?;
        debug!(username = %user.username, "fetched authenticated user");
        Ok(ForgeUser {
            id: user.id,
            username: user.username,
        })
    }

    #[instrument(skip(self))]
    async fn list_tags(&self, project: &str, prefix: &str) -> Result<Vec<ForgeTag>, ForgeError> {
        let search = format!("^{prefix}");
        let tags: Vec<ApiTag> = self
            .get_all(
                "list_tags",
                self.endpoint(&["projects", project, "repository", "tags"]),
                &[("search", search.as_str())],
            )
            .await?;
        Ok(tags
            .into_iter()
            .filter(|t| starts_with_ignore_case(&t.name, prefix))
            .map(ForgeTag::from)
            .collect())
    }

    #[instrument(skip(self))]
    async fn find_thread(
        &self,
        project: &str,
        kind: ThreadKind,
        title: &str,
    ) -> Result<Option<ThreadRef>, ForgeError> {
        let threads: Vec<ApiThread> = self
            .get_all(
                "find_thread",
                self.endpoint(&["projects", project, thread_segment(kind)]),
                &[("state", "opened"), ("search", title), ("in", "title")],
            )
            .await?;
        Ok(threads
            .iter()
            .filter(|t| t.title == title)
            .min_by_key(|t| t.iid)
            .map(|t| thread_ref(kind, t)))
    }

    #[instrument(skip(self, thread), fields(title = %thread.title))]
    async fn create_thread(
        &self,
        project: &str,
        thread: &NewThread,
    ) -> Result<ThreadRef, ForgeError> {
        let mut body = serde_json::json!({
            "title": thread.title,
            "description": thread.description,
            "labels": thread.labels.join(","),
        });
        if thread.kind == ThreadKind::MergeRequest {
            body["source_branch"] = thread.source_branch.clone().into();
            body["target_branch"] = thread.target_branch.clone().into();
        }
        let created: ApiThread = self
            .send_json(
                "create_thread",
                Method::POST,
                self.endpoint(&["projects", project, thread_segment(thread.kind)]),
                &body,
            )
            .await?;
        info!(iid = created.iid, kind = %thread.kind, "created grading thread");
        Ok(thread_ref(thread.kind, &created))
    }

    #[instrument(skip(self, description))]
    async fn update_description(
        &self,
        project: &str,
        thread: &ThreadRef,
        description: &str,
    ) -> Result<(), ForgeError> {
        let _: ApiThread = self
            .send_json(
                "update_description",
                Method::PUT,
                self.thread_endpoint(project, thread, &[]),
                &serde_json::json!({ "description": description }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, body))]
    async fn post_note(
        &self,
        project: &str,
        thread: &ThreadRef,
        body: &str,
    ) -> Result<(), ForgeError> {
        let _: serde_json::Value = self
            .send_json(
                "post_note",
                Method::POST,
                self.thread_endpoint(project, thread, &["notes"]),
                &serde_json::json!({ "body": body }),
            )
            .await?;
        debug!(iid = thread.iid, "posted note");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn edit_labels(
        &self,
        project: &str,
        thread: &ThreadRef,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ForgeError> {
        let _: ApiThread = self
            .send_json(
                "edit_labels",
                Method::PUT,
                self.thread_endpoint(project, thread, &[]),
                &serde_json::json!({
                    "add_labels": add.join(","),
                    "remove_labels": remove.join(","),
                }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn label_state(
        &self,
        project: &str,
        thread: &ThreadRef,
        tracked: &[&str],
    ) -> Result<LabelObservation, ForgeError> {
        let current: ApiThread = self
            .get_json("label_state", self.thread_endpoint(project, thread, &[]), &[])
            .await?;
        let events: Vec<ApiLabelEvent> = self
            .get_all(
                "label_events",
                self.thread_endpoint(project, thread, &["resource_label_events"]),
                &[],
            )
            .await?;
        Ok(LabelObservation {
            labels: current.labels,
            last_event: latest_tracked(events, tracked),
        })
    }

    #[instrument(skip(self))]
    async fn group_members(&self, group: &str) -> Result<Vec<String>, ForgeError> {
        let members: Vec<ApiMember> = self
            .get_all(
                "group_members",
                self.endpoint(&["groups", group, "members", "all"]),
                &[],
            )
            .await?;
        Ok(members.into_iter().map(|m| m.username).collect())
    }

    #[instrument(skip(self))]
    async fn list_hooks(&self, project: &str) -> Result<Vec<ProjectHook>, ForgeError> {
        let hooks: Vec<ApiHook> = self
            .get_all("list_hooks", self.endpoint(&["projects", project, "hooks"]), &[])
            .await?;
        Ok(hooks
            .into_iter()
            .map(|h| ProjectHook { id: h.id, url: h.url })
            .collect())
    }

    #[instrument(skip(self, hook), fields(url = %hook.url))]
    async fn create_hook(&self, project: &str, hook: &NewHook) -> Result<ProjectHook, ForgeError> {
        let created: ApiHook = self
            .send_json(
                "create_hook",
                Method::POST,
                self.endpoint(&["projects", project, "hooks"]),
                &hook_body(hook),
            )
            .await?;
        info!(hook_id = created.id, "registered project webhook");
        Ok(ProjectHook {
            id: created.id,
            url: created.url,
        })
    }

    #[instrument(skip(self))]
    async fn protected_tags(&self, project: &str) -> Result<Vec<String>, ForgeError> {
        let tags: Vec<ApiProtectedTag> = self
            .get_all(
                "protected_tags",
                self.endpoint(&["projects", project, "protected_tags"]),
                &[],
            )
            .await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    #[instrument(skip(self))]
    async fn protect_tags(&self, project: &str, pattern: &str) -> Result<(), ForgeError> {
        let _: serde_json::Value = self
            .send_json(
                "protect_tags",
                Method::POST,
                self.endpoint(&["projects", project, "protected_tags"]),
                &serde_json::json!({
                    "name": pattern,
                    "create_access_level": DEVELOPER_ACCESS,
                }),
            )
            .await?;
        info!(pattern, "protected tags");
        Ok(())
    }
}

fn hook_body(hook: &NewHook) -> serde_json::Value {
    let mut body = serde_json::json!({
        "url": hook.url,
        "push_events": false,
        "tag_push_events": true,
        "issues_events": true,
        "merge_requests_events": true,
        "enable_ssl_verification": true,
    });
    if let Some(ref secret) = hook.secret {
        body["token"] = secret.clone().into();
    }
    body
}
