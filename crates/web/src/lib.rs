//! labsync web server.
//!
//! Provides an Axum-based HTTP server with:
//! - Status and health endpoints
//! - Per-lab group status overview
//! - Audit log API
//! - GitLab webhook receiver that triggers targeted poll cycles

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use labsync_core::config::AppConfig;
use labsync_core::db::Database;
use labsync_core::CycleFilter;

/// Request for an immediate poll cycle, sent from the webhook receiver to
/// the daemon scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTrigger {
    pub lab: String,
    /// `None` polls every group of the lab.
    pub group: Option<String>,
}

impl PollTrigger {
    pub fn filter(&self) -> CycleFilter {
        match &self.group {
            Some(group) => CycleFilter::group(&self.lab, group),
            None => CycleFilter::labs(vec![self.lab.clone()]),
        }
    }
}

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: Arc<Database>,
    pub config: AppConfig,
    /// Channel for triggering targeted poll cycles.
    pub poll_trigger: mpsc::Sender<PollTrigger>,
    pub started_at: Instant,
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        poll_trigger: mpsc::Sender<PollTrigger>,
    ) -> Self {
        let state = Arc::new(AppState {
            db,
            config,
            poll_trigger,
            started_at: Instant::now(),
        });
        Self { state }
    }

    /// Build the router with all API routes and middleware.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]);

        Router::new()
            .merge(api::status::routes())
            .merge(api::audit::routes())
            .merge(api::webhooks::routes())
            .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Start the web server, listening on the given address.
    pub async fn start(self, listen_addr: &str) -> anyhow::Result<()> {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A config with one lab under `cs101/groups`, optionally with a
    /// webhook secret.
    pub fn config(secret: Option<&str>) -> AppConfig {
        let mut config: AppConfig = serde_json::from_value(serde_json::json!({
            "daemon": { "course": "cs101", "data_dir": "/tmp/labsync-web-test" },
            "labs": [{
                "id": "lab1",
                "primary_project": "cs101/lab1",
                "group_namespace": "cs101/groups",
                "problem_branches": ["problem"]
            }]
        }))
        .unwrap();
        if let Some(secret) = secret {
            config.forge.webhook_secret_env = Some("LABSYNC_WEBHOOK_SECRET".into());
            config.forge.webhook_secret = Some(secret.into());
        }
        config
    }

    pub fn server(secret: Option<&str>) -> (WebServer, Arc<Database>, mpsc::Receiver<PollTrigger>) {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let (tx, rx) = mpsc::channel(8);
        (WebServer::new(config(secret), Arc::clone(&db), tx), db, rx)
    }

    pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
