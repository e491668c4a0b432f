//! Inbound webhook endpoint.
//!
//! Each request is decoded and checked against the dedup gate inline. An
//! admitted update is routed and its handler spawned on its own task, so the
//! platform gets its acknowledgement without waiting on business logic.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use tracing::{debug, warn};

use crate::dedup::DedupStore;
use crate::delivery::DeliveryQueue;
use crate::executor;
use crate::responder::Responder;
use crate::router::CommandRouter;
use crate::update::{self, DecodeError, Update};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Shared state for the webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    pub dedup: Arc<dyn DedupStore>,
    pub router: Arc<CommandRouter>,
    pub queue: DeliveryQueue,
    pub handler_deadline: Duration,
    pub secret_token: Option<String>,
}

pub fn app(state: WebhookState, path: &str) -> Router {
    Router::new()
        .route(path, post(receive_update))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn receive_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(expected) = state.secret_token.as_deref() {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            warn!("Rejected webhook call with a missing or wrong secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let update = match update::decode(&body) {
        Ok(update) => update,
        Err(DecodeError::MalformedPayload(reason)) => {
            warn!("Malformed update: {}", reason);
            return StatusCode::BAD_REQUEST;
        }
        Err(DecodeError::UnsupportedKind(kind)) => {
            debug!(kind = %kind, "Ignoring unsupported update");
            return StatusCode::OK;
        }
    };

    let admitted = match state.dedup.admit(update.update_id).await {
        Ok(admitted) => admitted,
        Err(e) => {
            // a lost record risks a duplicate reply, dropping risks a lost update
            warn!(update_id = update.update_id, "Dedup store failed, admitting: {:#}", e);
            true
        }
    };

    if !admitted {
        debug!(update_id = update.update_id, "Duplicate update suppressed");
        return StatusCode::OK;
    }

    dispatch(&state, update);
    StatusCode::OK
}

fn dispatch(state: &WebhookState, update: Update) {
    let handler = state.router.route(&update);
    let responder = Responder::new(update.chat_id, state.queue.clone());
    let deadline = state.handler_deadline;

    debug!(
        update_id = update.update_id,
        chat_id = update.chat_id,
        sender_id = ?update.sender_id,
        sent_at = %update.timestamp,
        kind = ?update.kind(),
        handler = handler.name(),
        "Dispatching update"
    );

    tokio::spawn(async move {
        // failures are logged by the executor
        let _ = executor::execute(handler.as_ref(), &update, &responder, deadline).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::default_router;
    use crate::config::HandlersConfig;
    use crate::dedup::MemoryDedupStore;
    use crate::delivery::retry::RetryPolicy;
    use crate::delivery::DeliverySettings;
    use crate::platform::mock::{CallKind, ScriptedApi};
    use crate::upload::UploadPipeline;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    struct Harness {
        api: Arc<ScriptedApi>,
        app: Router,
        _docs: tempfile::TempDir,
    }

    fn harness(secret_token: Option<&str>) -> Harness {
        harness_with_store(
            secret_token,
            Arc::new(MemoryDedupStore::new(Duration::from_secs(3600), 1000)),
        )
    }

    fn harness_with_store(secret_token: Option<&str>, dedup: Arc<dyn DedupStore>) -> Harness {
        let docs = tempfile::tempdir().unwrap();
        std::fs::write(docs.path().join("report.pdf"), b"%PDF-1.4").unwrap();

        let api = Arc::new(ScriptedApi::new());
        let settings = DeliverySettings {
            retry: RetryPolicy::default(),
            min_send_interval: Duration::ZERO,
            worker_idle: Duration::from_secs(60),
        };
        let queue = DeliveryQueue::new(
            api.clone(),
            UploadPipeline::new(api.clone(), 1024 * 1024),
            settings,
        );
        let router = default_router(&HandlersConfig {
            deadline_secs: 5,
            documents_dir: docs.path().to_path_buf(),
        });

        let state = WebhookState {
            dedup,
            router: Arc::new(router),
            queue,
            handler_deadline: Duration::from_secs(5),
            secret_token: secret_token.map(str::to_string),
        };

        Harness {
            api,
            app: app(state, "/webhook"),
            _docs: docs,
        }
    }

    fn send_update(update_id: i64, text: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "update_id": update_id,
            "message": {
                "message_id": 1,
                "date": 1_700_000_000,
                "chat": { "id": 100, "type": "private" },
                "from": { "id": 5, "is_bot": false, "first_name": "Grace" },
                "text": text
            }
        }))
        .unwrap()
    }

    async fn post(app: &Router, body: Vec<u8>, secret: Option<&str>) -> StatusCode {
        let mut request = Request::post("/webhook").header("content-type", "application/json");
        if let Some(secret) = secret {
            request = request.header(SECRET_HEADER, secret);
        }
        app.clone()
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap()
            .status()
    }

    async fn settle(api: &ScriptedApi, expected_calls: usize) {
        for _ in 0..100 {
            if api.call_count() >= expected_calls {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // leave room for anything that should not happen
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_redelivered_send_produces_one_document() {
        let h = harness(None);

        let first = post(&h.app, send_update(42, "/send report.pdf"), None).await;
        let second = post(&h.app, send_update(42, "/send report.pdf"), None).await;
        assert!(first.is_success());
        assert!(second.is_success());

        settle(&h.api, 1).await;
        let calls = h.api.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].chat_id, 100);
        assert_eq!(calls[0].kind, CallKind::Document("report.pdf".into()));
    }

    #[tokio::test]
    async fn test_distinct_updates_are_both_handled() {
        let h = harness(None);

        assert_eq!(post(&h.app, send_update(1, "/help"), None).await, StatusCode::OK);
        assert_eq!(post(&h.app, send_update(2, "/help"), None).await, StatusCode::OK);

        settle(&h.api, 2).await;
        assert_eq!(h.api.call_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let h = harness(None);
        let status = post(&h.app, b"{not json".to_vec(), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_acknowledged() {
        let h = harness(None);
        let body = serde_json::to_vec(&json!({
            "update_id": 9,
            "poll": { "id": "p1" }
        }))
        .unwrap();

        assert_eq!(post(&h.app, body, None).await, StatusCode::OK);
        settle(&h.api, 0).await;
        assert_eq!(h.api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_secret_token_is_enforced() {
        let h = harness(Some("s3cret"));

        assert_eq!(
            post(&h.app, send_update(1, "/help"), None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            post(&h.app, send_update(1, "/help"), Some("wrong")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            post(&h.app, send_update(1, "/help"), Some("s3cret")).await,
            StatusCode::OK
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl DedupStore for BrokenStore {
        async fn admit(&self, _update_id: i64) -> Result<bool> {
            anyhow::bail!("disk I/O error")
        }

        async fn prune(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_dedup_failure_admits_update() {
        let h = harness_with_store(None, Arc::new(BrokenStore));

        assert_eq!(post(&h.app, send_update(3, "/help"), None).await, StatusCode::OK);
        settle(&h.api, 1).await;
        assert_eq!(h.api.call_count(), 1);
    }

    #[tokio::test]
    async fn test_healthz() {
        let h = harness(None);
        let response = h
            .app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
