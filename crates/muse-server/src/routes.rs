//! HTTP routes: the chat event stream, quota status and health.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use muse_agent::{ChatRequest, ProgressStreamer, QuotaGate, StreamEvent};

/// Detail returned when the daily quota is spent
pub const QUOTA_EXHAUSTED: &str = "daily limit reached";

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub streamer: ProgressStreamer,
    pub quota: Arc<QuotaGate>,
    /// Provider name reported by the health check
    pub provider: String,
    pub padding_bytes: usize,
}

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);
    let cors = if cors_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        cors.allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/status", get(status))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

fn to_sse(event: StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.payload().to_string())
}

/// POST /api/chat - run one turn, streamed as server-sent events.
pub async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    if request.message.trim().is_empty() {
        return detail(StatusCode::BAD_REQUEST, "message must not be empty");
    }
    if !state.quota.check_and_consume() {
        return detail(StatusCode::TOO_MANY_REQUESTS, QUOTA_EXHAUSTED);
    }

    tracing::info!(
        history = request.history.len(),
        language = request.language_hint.as_deref().unwrap_or("-"),
        "chat request"
    );
    let (_handle, events) = state.streamer.stream(request.into_state());

    // Defeats proxy buffering before the first real event
    let padding = Event::default().comment(" ".repeat(state.padding_bytes));
    let stream = futures::stream::once(async move { padding })
        .chain(events.map(to_sse))
        .map(Ok::<_, Infallible>);

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
        .into_response()
}

/// GET /api/chat/status - today's usage, without consuming quota.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.quota.status())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "provider": state.provider }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::NaiveDate;
    use muse_agent::{
        CorpusRetriever, Engine, EngineConfig, JudgmentClient, JudgmentRequest, ManualClock,
        QuotaStatus, corpus::ChunkConfig,
    };
    use tower::ServiceExt;

    /// Replies with the same text to every call
    struct FixedJudgment(&'static str);

    #[async_trait]
    impl JudgmentClient for FixedJudgment {
        async fn complete(&self, _request: JudgmentRequest) -> muse_agent::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn make_state(limit: u32) -> AppState {
        let engine = Engine::new(
            Arc::new(FixedJudgment("Opa! Tudo certo?")),
            Arc::new(CorpusRetriever::from_documents(Vec::new(), &ChunkConfig::default())),
            EngineConfig::default(),
        );
        let clock = ManualClock::new(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        let quota = Arc::new(QuotaGate::new(limit, Arc::new(clock)));
        AppState {
            streamer: ProgressStreamer::new(Arc::new(engine), quota.clone()),
            quota,
            provider: "OpenAI".into(),
            padding_bytes: 4096,
        }
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(make_state(3), &[]);
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body, json!({"status": "ok", "provider": "OpenAI"}));
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        let app = create_router(make_state(3), &[]);
        let resp = app
            .oneshot(Request::get("/api/chat/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status: QuotaStatus = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(
            status,
            QuotaStatus {
                current: 0,
                limit: 3,
                remaining: 3
            }
        );
    }

    #[tokio::test]
    async fn test_chat_streams_status_then_result() {
        let state = make_state(3);
        let quota = state.quota.clone();
        let app = create_router(state, &[]);

        let resp = app.oneshot(chat_request(r#"{"message": "Oi"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-accel-buffering"], "no");
        assert_eq!(resp.headers()["cache-control"], "no-cache");
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let body = body_text(resp).await;
        assert!(body.starts_with(':'));
        assert!(body.contains(&" ".repeat(4096)));

        let first_status = body.find("event: status").unwrap();
        let result = body.find("event: result").unwrap();
        assert!(first_status < result);
        assert!(body.contains(r#"data: {"message":"Iniciando..."}"#));
        assert!(body.contains("Opa! Tudo certo?"));
        assert!(!body.contains("event: error"));
        assert_eq!(quota.status().current, 1);
    }

    #[tokio::test]
    async fn test_exhausted_quota_rejects_before_pipeline() {
        let state = make_state(1);
        assert!(state.quota.check_and_consume());
        let app = create_router(state, &[]);

        let resp = app.oneshot(chat_request(r#"{"message": "Oi"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body, json!({"detail": QUOTA_EXHAUSTED}));
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected_without_quota() {
        let state = make_state(3);
        let quota = state.quota.clone();
        let app = create_router(state, &[]);

        let resp = app.oneshot(chat_request(r#"{"message": "   "}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(quota.status().current, 0);
    }

    #[tokio::test]
    async fn test_unknown_history_roles_are_tolerated() {
        let app = create_router(make_state(3), &[]);
        let body = r#"{
            "message": "Oi",
            "history": [{"role": "tool", "content": "x"}, {"role": "user", "content": "hey"}],
            "language": "pt-br"
        }"#;
        let resp = app.oneshot(chat_request(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("event: result"));
    }
}
