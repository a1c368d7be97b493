use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    response::{Html, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::bridge::ChatService;
use crate::config::AppConfig;
use crate::conversation::{ConversationStore, MemoryStore, Message};
use crate::error::ApiError;
use crate::llm::{GeminiDriver, LlmDriver, LlmSettings};

/// How often the idle-conversation sweeper runs when a timeout is set.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build the application router over shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/chat", post(api_chat))
        .route(
            "/api/conversations/{conversation_id}",
            get(api_get_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/clear",
            post(api_clear_conversation),
        )
        .route("/api/health", get(api_health))
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let policy = config.conversation.retention_policy();
    let store = Arc::new(MemoryStore::new(policy));

    // The sweeper only exists when an idle timeout is configured; the
    // default store keeps conversations until the process exits.
    if policy.idle_timeout.is_some() {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = store.sweep_idle();
                if removed > 0 {
                    info!(
                        name: "conversation.sweep",
                        removed = removed,
                        "Idle conversations removed"
                    );
                }
            }
        });
    }

    let store: Arc<dyn ConversationStore> = store;
    let driver: Arc<dyn LlmDriver> = Arc::new(GeminiDriver::new(settings.clone()));
    let chat = Arc::new(ChatService::new(driver, Arc::clone(&store)));

    let state = AppState {
        chat,
        store,
        settings,
    };

    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for chat API.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// User message content.
    content: String,
    /// Conversation the message belongs to.
    conversation_id: String,
}

/// Response for conversation history API.
#[derive(Debug, Serialize)]
struct ConversationResponse {
    conversation_id: String,
    messages: Vec<Message>,
}

/// Response for conversation clear API.
#[derive(Debug, Serialize)]
struct ClearResponse {
    status: &'static str,
    conversation_id: String,
}

/// Response for health API.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    model: String,
}

/// POST /api/chat - Run one exchange, streaming the reply as plain text.
async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let stream = state
        .chat
        .send_message(&req.conversation_id, &req.content)
        .await?;

    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    Ok(text_stream_response(body))
}

/// Incremental `text/plain` response with proxy buffering disabled.
fn text_stream_response(body: Body) -> Response {
    let mut resp = Response::new(body);
    let h = resp.headers_mut();
    h.insert("Content-Type", "text/plain; charset=utf-8".parse().unwrap());
    h.insert("Cache-Control", "no-cache".parse().unwrap());
    h.insert("X-Accel-Buffering", "no".parse().unwrap());
    resp
}

/// GET /api/conversations/{conversation_id} - Get conversation history.
///
/// Unknown conversations return an empty message list rather than 404, so
/// clients can poll an id before its first exchange. A read issued while an
/// exchange is streaming sees the history as of the last commit.
async fn api_get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<ConversationResponse> {
    let messages = state.store.get(&conversation_id);
    Json(ConversationResponse {
        conversation_id,
        messages,
    })
}

/// POST /api/conversations/{conversation_id}/clear - Drop a conversation.
///
/// Clearing an unknown conversation succeeds; the operation is idempotent.
async fn api_clear_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<ClearResponse> {
    state.store.clear(&conversation_id);
    info!(
        name: "conversation.cleared",
        conversation_id = %conversation_id,
        "Conversation cleared"
    );
    Json(ClearResponse {
        status: "cleared",
        conversation_id,
    })
}

/// GET /api/health - Service health and active model.
async fn api_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
        model: state.settings.model.clone(),
    })
}

/// Page served when `static/index.html` has not been deployed.
const FALLBACK_INDEX: &str =
    "<h1>Wayfinder</h1><p>Static files not found. Check your setup.</p>";

/// GET / - Serve the main page.
async fn index() -> Html<String> {
    match tokio::fs::read_to_string("static/index.html").await {
        Ok(page) => Html(page),
        Err(_) => Html(FALLBACK_INDEX.to_string()),
    }
}
