use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use concierge_agent::{TurnError, TurnOutcome, TurnRuntime};
use concierge_channel::{
    parse_webhook, ChatHistory, HistoryEntry, IngressEvent, ReplySink, MAX_HISTORY,
};
use concierge_core::domain::message::{EgressReply, SessionId};
use concierge_core::errors::{ApplicationError, InterfaceError, HOLD_REPLY};
use concierge_core::scheduler::ContinuationFire;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<TurnRuntime>,
    replies: Arc<dyn ReplySink>,
    history: Option<Arc<dyn ChatHistory>>,
}

impl AppState {
    pub fn new(runtime: Arc<TurnRuntime>, replies: Arc<dyn ReplySink>) -> Self {
        Self { runtime, replies, history: None }
    }

    pub fn with_history(mut self, history: Arc<dyn ChatHistory>) -> Self {
        self.history = Some(history);
        self
    }
}

/// Body of every webhook answer. The message is always the hold reply; the real answer goes out
/// through the channel API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: &'static str,
}

impl WebhookResponse {
    fn ok() -> Self {
        Self { status: "OK", message: HOLD_REPLY }
    }

    fn error() -> Self {
        Self { status: "ERROR", message: HOLD_REPLY }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReleaseResponse {
    pub status: &'static str,
    pub session_id: String,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryResponse {
    pub status: &'static str,
    pub session_id: String,
    pub messages: Vec<HistoryEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: &'static str,
    pub correlation_id: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/continuations", post(continuation))
        .route("/sessions/{id}/handoff/release", post(release_handoff))
        .route("/sessions/{id}/history", get(history))
        .with_state(state)
}

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let correlation_id = correlation_id(&headers);
    let event = match parse_webhook(&body) {
        Ok(event) => event,
        Err(error) => {
            warn!(
                event_name = "ingress.rejected",
                correlation_id = %correlation_id,
                session_id = "unknown",
                error = %error,
                "webhook payload rejected"
            );
            return (StatusCode::BAD_REQUEST, Json(WebhookResponse::error()));
        }
    };

    info!(
        event_name = "ingress.received",
        correlation_id = %correlation_id,
        session_id = event.session_id().map(SessionId::as_str).unwrap_or("unknown"),
        event_type = event.event_type().as_str(),
        "webhook event received"
    );

    match event {
        IngressEvent::Message(message) => {
            let session_id = message.session_id.clone();
            let outcome = state.runtime.handle_message(message, &correlation_id).await;
            respond(&state, &session_id, outcome, &correlation_id).await
        }
        IngressEvent::Continuation(fire) => {
            let session_id = fire.session_id.clone();
            let outcome = state.runtime.handle_continuation(fire, &correlation_id).await;
            respond(&state, &session_id, outcome, &correlation_id).await
        }
        IngressEvent::Ignored { reason } => {
            info!(
                event_name = "ingress.ignored",
                correlation_id = %correlation_id,
                reason = reason.label(),
                "webhook event ignored"
            );
            (StatusCode::OK, Json(WebhookResponse::ok()))
        }
    }
}

/// Direct callback for schedulers that post the fire body instead of a webhook event.
pub async fn continuation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(fire): Json<ContinuationFire>,
) -> (StatusCode, Json<WebhookResponse>) {
    let correlation_id = correlation_id(&headers);
    let session_id = fire.session_id.clone();
    let outcome = state.runtime.handle_continuation(fire, &correlation_id).await;
    respond(&state, &session_id, outcome, &correlation_id).await
}

pub async fn release_handoff(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ReleaseResponse>, (StatusCode, Json<ErrorResponse>)> {
    let correlation_id = correlation_id(&headers);
    let session_id = SessionId::new(id);

    match state.runtime.release_handoff(&session_id, &correlation_id).await {
        Ok(version) => Ok(Json(ReleaseResponse {
            status: "OK",
            session_id: session_id.0,
            version: version.as_raw(),
        })),
        Err(failure) => {
            warn!(
                event_name = "handoff.release_failed",
                correlation_id = %correlation_id,
                session_id = %session_id,
                error = %failure,
                "handoff release refused"
            );
            let status = match &failure {
                TurnError::Transition(_) => StatusCode::CONFLICT,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            let error = ApplicationError::from(failure).into_interface(correlation_id.clone());
            Err((status, Json(ErrorResponse { status: "ERROR", error: error.kind(), correlation_id })))
        }
    }
}

/// Earlier messages of the chat, read from the channel API for whoever picks up a handoff.
pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let correlation_id = correlation_id(&headers);
    let session_id = SessionId::new(id);
    let Some(reader) = &state.history else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { status: "ERROR", error: "history_unavailable", correlation_id }),
        ));
    };

    match reader.recent(&session_id, query.limit.unwrap_or(MAX_HISTORY)).await {
        Ok(messages) => {
            Ok(Json(HistoryResponse { status: "OK", session_id: session_id.0, messages }))
        }
        Err(failure) => {
            warn!(
                event_name = "history.failed",
                correlation_id = %correlation_id,
                session_id = %session_id,
                error = %failure,
                "chat history unavailable"
            );
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse { status: "ERROR", error: "integration", correlation_id }),
            ))
        }
    }
}

/// Drains in-process continuation fires into the runtime and pushes the replies out.
pub fn spawn_fire_loop(
    state: AppState,
    mut fires: mpsc::Receiver<ContinuationFire>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fire) = fires.recv().await {
            let correlation_id = new_correlation_id();
            let session_id = fire.session_id.clone();
            let outcome = state.runtime.handle_continuation(fire, &correlation_id).await;
            respond(&state, &session_id, outcome, &correlation_id).await;
        }
        info!(event_name = "scheduler.local.drained", "continuation channel closed");
    })
}

async fn respond(
    state: &AppState,
    session_id: &SessionId,
    outcome: TurnOutcome,
    correlation_id: &str,
) -> (StatusCode, Json<WebhookResponse>) {
    let failure = match &outcome {
        TurnOutcome::Failed { error } => Some(status_for(error)),
        _ => None,
    };
    let Some(reply_text) = outcome.reply() else {
        return (StatusCode::OK, Json(WebhookResponse::ok()));
    };

    let reply = EgressReply { session_id: session_id.clone(), reply_text: reply_text.to_owned() };
    let delivered = match state.replies.send(&reply).await {
        Ok(()) => true,
        Err(error) => {
            error!(
                event_name = "egress.failed",
                correlation_id = %correlation_id,
                session_id = %session_id,
                error = %error,
                "reply could not be delivered"
            );
            false
        }
    };

    match failure {
        Some(status) => (status, Json(WebhookResponse::error())),
        None if delivered => (StatusCode::OK, Json(WebhookResponse::ok())),
        None => (StatusCode::OK, Json(WebhookResponse::error())),
    }
}

fn status_for(error: &InterfaceError) -> StatusCode {
    match error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(new_correlation_id)
}

fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(16).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body, Bytes},
        extract::{Path, Query, State},
        http::{HeaderMap, Request, StatusCode},
        Json,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use concierge_agent::{RuntimeSettings, TurnRuntime};
    use async_trait::async_trait;
    use concierge_channel::{
        ChatHistory, EgressError, HistoryEntry, InMemoryReplySink, LocalWorkflowScheduler,
    };
    use concierge_core::audit::InMemoryAuditSink;
    use concierge_core::domain::message::SessionId;
    use concierge_core::errors::HOLD_REPLY;
    use concierge_core::ontology::OntologyIndex;
    use concierge_core::scheduler::{NoopWorkflowScheduler, WorkflowScheduler};
    use concierge_db::{InMemorySessionStore, SessionStore};

    use super::{
        history, release_handoff, router, spawn_fire_loop, webhook, AppState, HistoryQuery,
    };

    const ONTOLOGY: &str = include_str!("../../../data/concierge-ontology/ontology.json");

    /// Serves a fixed transcript, trimmed to the requested limit.
    struct FixedHistory(Vec<HistoryEntry>);

    #[async_trait]
    impl ChatHistory for FixedHistory {
        async fn recent(
            &self,
            _session_id: &SessionId,
            limit: usize,
        ) -> Result<Vec<HistoryEntry>, EgressError> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    struct Fixture {
        state: AppState,
        replies: Arc<InMemoryReplySink>,
        store: Arc<InMemorySessionStore>,
    }

    fn fixture_with(scheduler: Arc<dyn WorkflowScheduler>) -> Fixture {
        fixture_with_settings(scheduler, RuntimeSettings::default())
    }

    fn fixture_with_settings(
        scheduler: Arc<dyn WorkflowScheduler>,
        settings: RuntimeSettings,
    ) -> Fixture {
        let ontology = OntologyIndex::load(ONTOLOGY.as_bytes(), 1 << 20).expect("ontology");
        let store = Arc::new(InMemorySessionStore::default());
        let replies = Arc::new(InMemoryReplySink::default());
        let runtime = TurnRuntime::new(
            store.clone(),
            Arc::new(ontology),
            scheduler,
            Arc::new(InMemoryAuditSink::default()),
            settings,
        );
        Fixture { state: AppState::new(Arc::new(runtime), replies.clone()), replies, store }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoopWorkflowScheduler))
    }

    fn message_event(chat_id: &str, text: &str) -> Bytes {
        Bytes::from(
            json!({
                "type": "message",
                "entity": {"chatId": chat_id, "plainText": text, "personType": "user"}
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn webhook_message_runs_turn_and_sends_reply() {
        let fixture = fixture();

        let (status, Json(body)) = webhook(
            State(fixture.state.clone()),
            HeaderMap::new(),
            message_event("chat-1", "환불 규정 알려주세요"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "OK");
        assert_eq!(body.message, HOLD_REPLY);

        let replies = fixture.replies.replies().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].session_id, SessionId::new("chat-1"));
        assert!(replies[0].reply_text.starts_with("상품 수령 후 7일 이내 반품 신청 시 환불 가능합니다."));
    }

    #[tokio::test]
    async fn manager_messages_are_acknowledged_without_reply() {
        let fixture = fixture();
        let body = Bytes::from(
            json!({
                "type": "message",
                "entity": {"chatId": "chat-1", "plainText": "확인했습니다", "personType": "manager"}
            })
            .to_string(),
        );

        let (status, Json(response)) = webhook(State(fixture.state.clone()), HeaderMap::new(), body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.status, "OK");
        assert!(fixture.replies.replies().await.is_empty());
        assert!(fixture.store.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_bad_request() {
        let fixture = fixture();
        let (status, Json(body)) =
            webhook(State(fixture.state), HeaderMap::new(), Bytes::from_static(b"{not json")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.status, "ERROR");
        assert_eq!(body.message, HOLD_REPLY);
    }

    #[tokio::test]
    async fn handoff_release_endpoint_reports_version_and_conflicts() {
        let fixture = fixture();
        webhook(
            State(fixture.state.clone()),
            HeaderMap::new(),
            message_event("chat-7", "상담원 연결해주세요"),
        )
        .await;

        let released = release_handoff(
            State(fixture.state.clone()),
            Path("chat-7".to_owned()),
            HeaderMap::new(),
        )
        .await
        .expect("released");
        assert_eq!(released.0.status, "OK");
        assert_eq!(released.0.version, 2);

        let (status, Json(body)) =
            release_handoff(State(fixture.state.clone()), Path("chat-7".to_owned()), HeaderMap::new())
                .await
                .expect_err("nothing to release");
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "bad_request");

        let stored = fixture.store.get(&SessionId::new("chat-7")).await.expect("read").expect("stored");
        assert_eq!(stored.state.pending_action, None);
    }

    #[tokio::test]
    async fn router_serves_webhook_and_continuation_routes() {
        let fixture = fixture();
        let app = router(fixture.state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header("content-type", "application/json")
                    .header("x-request-id", "req-oneshot")
                    .body(Body::from(message_event("chat-2", "안녕하세요")))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.expect("body");
        let body: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body, json!({"status": "OK", "message": HOLD_REPLY}));

        let stale = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/continuations")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "chat_id": "chat-2",
                            "payload": {"kind": "delivery_status", "continuation_id": "c-unknown"}
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(stale.status(), StatusCode::OK);
        assert_eq!(fixture.replies.replies().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_fires_are_processed_and_replied() {
        let (scheduler, fires) = LocalWorkflowScheduler::new("local", 4);
        let fixture = fixture_with(Arc::new(scheduler));
        let worker = spawn_fire_loop(fixture.state.clone(), fires);

        webhook(
            State(fixture.state.clone()),
            HeaderMap::new(),
            message_event("chat-3", "주문번호 123456789 배송조회"),
        )
        .await;
        assert_eq!(fixture.replies.replies().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let replies = fixture.replies.replies().await;
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[1].reply_text,
            "주문번호 123456789 상품은 현재 배송 중이며, 출고 후 1~3일 이내 도착 예정입니다."
        );

        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn batched_messages_get_a_single_reply_after_the_window() {
        let (scheduler, fires) = LocalWorkflowScheduler::new("local", 4);
        let settings =
            RuntimeSettings { batch_window: Some(Duration::from_secs(3)), ..RuntimeSettings::default() };
        let fixture = fixture_with_settings(Arc::new(scheduler), settings);
        let worker = spawn_fire_loop(fixture.state.clone(), fires);

        for text in ["티셔츠", "가격 얼마예요?"] {
            let (status, Json(body)) =
                webhook(State(fixture.state.clone()), HeaderMap::new(), message_event("chat-5", text))
                    .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body.status, "OK");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(fixture.replies.replies().await.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let replies = fixture.replies.replies().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].reply_text,
            "'티셔츠' 상품의 가격은 25,000원입니다. (옵션별 가격: 화이트 / L 26,000원)"
        );

        let stored = fixture.store.get(&SessionId::new("chat-5")).await.expect("read").expect("stored");
        assert_eq!(stored.state.turn_count, 1);
        assert!(stored.state.batch.is_none());

        worker.abort();
    }

    #[tokio::test]
    async fn history_route_reads_the_channel_transcript() {
        let fixture = fixture();
        let unavailable = history(
            State(fixture.state.clone()),
            Path("chat-1".to_owned()),
            Query(HistoryQuery::default()),
            HeaderMap::new(),
        )
        .await
        .expect_err("no channel api");
        assert_eq!(unavailable.0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unavailable.1.error, "history_unavailable");

        let entry = |person: &str, text: &str| HistoryEntry {
            person_type: Some(person.to_owned()),
            plain_text: text.to_owned(),
        };
        let state = fixture.state.clone().with_history(Arc::new(FixedHistory(vec![
            entry("user", "티셔츠 가격 얼마예요?"),
            entry("bot", "'티셔츠' 상품의 가격은 25,000원입니다."),
        ])));
        let Json(body) = history(
            State(state),
            Path("chat-1".to_owned()),
            Query(HistoryQuery { limit: Some(1) }),
            HeaderMap::new(),
        )
        .await
        .expect("history");

        assert_eq!(body.status, "OK");
        assert_eq!(body.session_id, "chat-1");
        assert_eq!(body.messages, vec![entry("user", "티셔츠 가격 얼마예요?")]);
    }
}
