//! Webhook ingestion server (§4.E, §6) — `POST <prefix>/{github,linear,
//! generic}` plus `GET /health`, bound via `tokio::net::TcpListener` the
//! way the teacher's `at-bridge` router was constructed, generalizing its
//! `auth.rs` constant-time-comparison idiom from API-key equality to
//! HMAC-SHA256 signature verification (`fab_core::crypto`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use fab_core::crypto::verify_hmac_sha256_signature;
use fab_core::dedup_store::DedupStore;
use fab_core::types::IssueEvent;
use tokio::net::TcpListener;

/// Body read limit (§4.E, §6).
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub bind_addr: SocketAddr,
    /// Defaults to `/webhooks` (§6).
    pub prefix: String,
    pub github_secret: Option<String>,
    pub linear_secret: Option<String>,
    pub generic_secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8077".parse().unwrap(),
            prefix: "/webhooks".into(),
            github_secret: None,
            linear_secret: None,
            generic_secret: None,
        }
    }
}

struct AppState {
    config: WebhookConfig,
    dedup: Arc<DedupStore>,
    events: flume::Sender<IssueEvent>,
}

/// Owns the bound listener and serve task; `stop` shuts down within 5 s.
pub struct WebhookServer {
    handle: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    local_addr: SocketAddr,
}

impl WebhookServer {
    pub async fn start(
        config: WebhookConfig,
        dedup: Arc<DedupStore>,
        events: flume::Sender<IssueEvent>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let prefix = config.prefix.trim_end_matches('/').to_string();
        let state = Arc::new(AppState {
            config,
            dedup,
            events,
        });

        let app = Router::new()
            .route(&format!("{prefix}/github"), post(handle_github))
            .route(&format!("{prefix}/linear"), post(handle_linear))
            .route(&format!("{prefix}/generic"), post(handle_generic))
            .route("/health", get(health))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(
                async {
                    let _ = shutdown_rx.await;
                },
            );
            if let Err(err) = serve.await {
                tracing::error!(%err, "webhook server exited with an error");
            }
        });

        Ok(Self {
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("webhook server did not shut down within 5s");
            }
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(serde::Deserialize)]
struct ProjectQuery {
    project: Option<String>,
}

fn resolve_project(headers: &HeaderMap, query: &ProjectQuery) -> Option<String> {
    query.project.clone().or_else(|| {
        headers
            .get("x-fab-project")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    })
}

async fn process_event(state: &AppState, event: IssueEvent) {
    let dedup_id = event.dedup_id();
    match state.dedup.mark(&dedup_id, &event.project) {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => tracing::warn!(%err, "dedup store mark failed, delivering anyway"),
    }
    // Non-blocking send; availability over ordering — we lose events rather
    // than block ingress (§4.E, §9).
    if state.events.try_send(event).is_err() {
        tracing::warn!("webhook events channel full, dropping event");
    }
}

async fn handle_github(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if body.len() > MAX_BODY_BYTES {
        return (StatusCode::PAYLOAD_TOO_LARGE, "body too large").into_response();
    }
    let Some(project) = resolve_project(&headers, &query) else {
        return (StatusCode::BAD_REQUEST, "missing project").into_response();
    };
    if let Some(secret) = &state.config.github_secret {
        let Some(sig) = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
        else {
            return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
        };
        if !verify_hmac_sha256_signature(secret.as_bytes(), &body, sig) {
            return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
        }
    }
    let Some(event_header) = headers.get("x-github-event").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing X-GitHub-Event").into_response();
    };
    match fab_integrations::parsers::parse_github_payload(&project, event_header, &body) {
        Ok(Some(event)) => {
            process_event(&state, event).await;
            StatusCode::OK.into_response()
        }
        Ok(None) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!(%err, "failed to parse github webhook payload");
            (StatusCode::BAD_REQUEST, "bad payload").into_response()
        }
    }
}

async fn handle_linear(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if body.len() > MAX_BODY_BYTES {
        return (StatusCode::PAYLOAD_TOO_LARGE, "body too large").into_response();
    }
    let Some(project) = resolve_project(&headers, &query) else {
        return (StatusCode::BAD_REQUEST, "missing project").into_response();
    };
    if let Some(secret) = &state.config.linear_secret {
        let Some(sig) = headers.get("linear-signature").and_then(|v| v.to_str().ok()) else {
            return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
        };
        if !verify_hmac_sha256_signature(secret.as_bytes(), &body, sig) {
            return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
        }
    }
    match fab_integrations::parsers::parse_linear_payload(&project, &body) {
        Ok(Some(event)) => {
            process_event(&state, event).await;
            StatusCode::OK.into_response()
        }
        Ok(None) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!(%err, "failed to parse linear webhook payload");
            (StatusCode::BAD_REQUEST, "bad payload").into_response()
        }
    }
}

async fn handle_generic(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if body.len() > MAX_BODY_BYTES {
        return (StatusCode::PAYLOAD_TOO_LARGE, "body too large").into_response();
    }
    if resolve_project(&headers, &query).is_none() {
        return (StatusCode::BAD_REQUEST, "missing project").into_response();
    }
    if let Some(secret) = &state.config.generic_secret {
        let Some(sig) = headers
            .get("x-webhook-signature")
            .and_then(|v| v.to_str().ok())
        else {
            return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
        };
        if !verify_hmac_sha256_signature(secret.as_bytes(), &body, sig) {
            return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
        }
    }
    match fab_integrations::parsers::parse_generic_payload(&body) {
        Ok(event) => {
            process_event(&state, event).await;
            StatusCode::OK.into_response()
        }
        Err(err) => {
            tracing::warn!(%err, "failed to parse generic webhook payload");
            (StatusCode::BAD_REQUEST, "bad payload").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_core::types::{IssueEventType};

    fn event(id: &str) -> IssueEvent {
        IssueEvent {
            event_type: IssueEventType::Comment,
            source: "github".into(),
            project: "p".into(),
            issue_id: id.into(),
            comment_id: Some("c1".into()),
            author: "alice".into(),
            body: "hi".into(),
            title: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_event_is_dropped_by_dedup() {
        let dedup = Arc::new(DedupStore::new(None).unwrap());
        let (tx, rx) = flume::bounded(10);
        let state = AppState {
            config: WebhookConfig::default(),
            dedup,
            events: tx,
        };
        process_event(&state, event("1")).await;
        process_event(&state, event("1")).await;
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test]
    async fn full_channel_drops_event_without_panicking() {
        let dedup = Arc::new(DedupStore::new(None).unwrap());
        let (tx, _rx) = flume::bounded(1);
        tx.try_send(event("x")).unwrap();
        let state = AppState {
            config: WebhookConfig::default(),
            dedup,
            events: tx,
        };
        process_event(&state, event("1")).await;
    }

    #[test]
    fn resolve_project_prefers_query_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-fab-project", "header-proj".parse().unwrap());
        let query = ProjectQuery {
            project: Some("query-proj".into()),
        };
        assert_eq!(resolve_project(&headers, &query).as_deref(), Some("query-proj"));
    }
}
