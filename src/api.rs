//! REST API Server for the financial assistant
//!
//! Exposes one orchestrator per chat over HTTP. Each chat is an independent
//! session; the model gateway, tools and archive are shared.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::agent::Orchestrator;
use crate::audit::SessionArchive;
use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::execution::ToolExecutor;
use crate::gateway::ModelGateway;
use crate::models::SessionStatus;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub chat_id: Option<String>,
    pub message: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiReply = (StatusCode, Json<ApiResponse>);

fn error_reply(err: &OrchestrationError) -> ApiReply {
    let status = match err {
        OrchestrationError::SessionBusy(_)
        | OrchestrationError::Cancelled
        | OrchestrationError::ConversationCorrupted(_) => StatusCode::CONFLICT,
        OrchestrationError::InvalidRequest(_) | OrchestrationError::SchemaViolation(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestrationError::LoopBudgetExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestrationError::NetworkFailure(_)
        | OrchestrationError::RateLimited { .. }
        | OrchestrationError::HttpError(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(err.to_string())))
}

/// =============================
/// Session Hub
/// =============================

/// Orchestrators keyed by chat id, created on first message. Once
/// `max_chats` is reached the oldest idle chats are archived and dropped.
pub struct SessionHub {
    gateway: Arc<dyn ModelGateway>,
    executor: ToolExecutor,
    archive: Arc<SessionArchive>,
    config: OrchestratorConfig,
    sessions: RwLock<ChatTable>,
}

#[derive(Default)]
struct ChatTable {
    chats: HashMap<String, Arc<Orchestrator>>,
    /// Chat ids, oldest first
    order: VecDeque<String>,
}

impl ChatTable {
    /// Remove the oldest chats not mid-run until at most `keep` remain
    fn evict_idle(&mut self, keep: usize) -> Vec<(String, Arc<Orchestrator>)> {
        let mut evicted = Vec::new();
        let mut index = 0;

        while self.chats.len() > keep && index < self.order.len() {
            let idle = self
                .chats
                .get(&self.order[index])
                .map_or(true, |chat| {
                    matches!(chat.status(), SessionStatus::Idle | SessionStatus::Error)
                });
            if !idle {
                index += 1;
                continue;
            }
            if let Some(id) = self.order.remove(index) {
                if let Some(chat) = self.chats.remove(&id) {
                    evicted.push((id, chat));
                }
            }
        }

        evicted
    }
}

impl SessionHub {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        executor: ToolExecutor,
        archive: Arc<SessionArchive>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            gateway,
            executor,
            archive,
            config,
            sessions: RwLock::new(ChatTable::default()),
        }
    }

    pub async fn get(&self, chat_id: &str) -> Option<Arc<Orchestrator>> {
        self.sessions.read().await.chats.get(chat_id).cloned()
    }

    pub async fn chat_count(&self) -> usize {
        self.sessions.read().await.chats.len()
    }

    pub async fn get_or_create(&self, chat_id: &str) -> Arc<Orchestrator> {
        if let Some(existing) = self.get(chat_id).await {
            return existing;
        }

        let (orchestrator, evicted) = {
            let mut table = self.sessions.write().await;
            if let Some(existing) = table.chats.get(chat_id) {
                return existing.clone();
            }

            let evicted = table.evict_idle(self.config.max_chats.saturating_sub(1));
            if table.chats.len() >= self.config.max_chats {
                warn!(chats = table.chats.len(), "Chat limit reached with every chat busy");
            }

            let orchestrator = Arc::new(Orchestrator::new(
                self.gateway.clone(),
                self.executor.clone(),
                self.archive.clone(),
                &self.config,
            ));
            table.chats.insert(chat_id.to_string(), orchestrator.clone());
            table.order.push_back(chat_id.to_string());
            info!(chat_id, chats = table.chats.len(), "Creating chat session");

            (orchestrator, evicted)
        };

        for (id, chat) in evicted {
            if chat.transcript().is_empty() {
                continue;
            }
            match chat.reset().await {
                Ok(_) => info!(chat_id = %id, "Evicted idle chat to archive"),
                Err(e) => warn!(chat_id = %id, error = %e, "Failed to archive evicted chat"),
            }
        }

        orchestrator
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn archive(&self) -> &SessionArchive {
        &self.archive
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<SessionHub>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoints
/// =============================

async fn chat_handler(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> ApiReply {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Message must not be empty".into())),
        );
    }

    let chat_id = match req.chat_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => uuid::Uuid::new_v4().to_string(),
    };
    info!(chat_id = %chat_id, "Received chat message");

    let orchestrator = state.hub.get_or_create(&chat_id).await;

    match orchestrator.send_user_message(req.message).await {
        Ok(output) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "chat_id": chat_id,
                "session_id": output.session_id,
                "answer": output.answer,
                "tool_rounds": output.tool_rounds,
                "turns": orchestrator.transcript(),
            }))),
        ),
        Err(e) => {
            warn!(chat_id = %chat_id, error = %e, "Chat run failed");
            error_reply(&e)
        }
    }
}

async fn chat_state(State(state): State<ApiState>, Path(chat_id): Path<String>) -> ApiReply {
    match state.hub.get(&chat_id).await {
        Some(orchestrator) => (StatusCode::OK, Json(ApiResponse::success(orchestrator.view()))),
        None => not_found(&chat_id),
    }
}

async fn cancel_chat(State(state): State<ApiState>, Path(chat_id): Path<String>) -> ApiReply {
    match state.hub.get(&chat_id).await {
        Some(orchestrator) => {
            let cancelled = orchestrator.cancel().await;
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({ "cancelled": cancelled }))),
            )
        }
        None => not_found(&chat_id),
    }
}

async fn reset_chat(State(state): State<ApiState>, Path(chat_id): Path<String>) -> ApiReply {
    let Some(orchestrator) = state.hub.get(&chat_id).await else {
        return not_found(&chat_id);
    };

    match orchestrator.reset().await {
        Ok(session_id) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({ "session_id": session_id }))),
        ),
        Err(e) => error_reply(&e),
    }
}

fn not_found(chat_id: &str) -> ApiReply {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(format!("Chat {} not found", chat_id))),
    )
}

/// =============================
/// Tools & Archive
/// =============================

async fn list_tools(State(state): State<ApiState>) -> ApiReply {
    let tools = state.hub.executor().registry().describe_all();
    (StatusCode::OK, Json(ApiResponse::success(tools)))
}

async fn list_archive(State(state): State<ApiState>) -> ApiReply {
    match state.hub.archive().list().await {
        Ok(ids) => (StatusCode::OK, Json(ApiResponse::success(ids))),
        Err(e) => error_reply(&e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(hub: Arc<SessionHub>) -> Router {
    let state = ApiState { hub };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/:chat_id", get(chat_state))
        .route("/api/chat/:chat_id/cancel", post(cancel_chat))
        .route("/api/chat/:chat_id/reset", post(reset_chat))
        .route("/api/tools", get(list_tools))
        .route("/api/archive", get(list_archive))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    hub: Arc<SessionHub>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(hub);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Scripted, ScriptedGateway};
    use crate::models::{ModelResponse, RequestedCall};
    use crate::tools::create_default_registry;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn hub_with(gateway: ScriptedGateway, config: OrchestratorConfig) -> Arc<SessionHub> {
        let executor = ToolExecutor::new(
            Arc::new(create_default_registry().unwrap()),
            config.tool_timeout,
        );
        Arc::new(SessionHub::new(
            Arc::new(gateway),
            executor,
            Arc::new(SessionArchive::with_capacity(config.archive_capacity)),
            config,
        ))
    }

    fn hub(script: Vec<Scripted>) -> Arc<SessionHub> {
        hub_with(ScriptedGateway::new(script), OrchestratorConfig::default())
    }

    async fn call(router: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_router(hub(vec![]));
        let (status, body) = call(router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_chat_runs_tool_loop() {
        let hub = hub(vec![
            Scripted::Respond(ModelResponse::ToolCallsRequested {
                calls: vec![RequestedCall::new("getFinancialSummary", json!({}))],
            }),
            Scripted::Respond(ModelResponse::FinalAnswer {
                text: "Your net worth is $50,000.00".into(),
            }),
        ]);

        let (status, body) = call(
            create_router(hub.clone()),
            "POST",
            "/api/chat",
            Some(json!({ "chat_id": "household", "message": "Summarize my finances" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["answer"], "Your net worth is $50,000.00");
        assert_eq!(body["data"]["turns"].as_array().unwrap().len(), 4);

        let (status, body) = call(create_router(hub), "GET", "/api/chat/household", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "idle");
    }

    #[tokio::test]
    async fn test_gateway_errors_map_to_status() {
        let hub = hub(vec![Scripted::Fail(OrchestrationError::InvalidRequest(
            "unsupported field".into(),
        ))]);

        let (status, body) = call(
            create_router(hub),
            "POST",
            "/api/chat",
            Some(json!({ "message": "hi" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_unknown_chat_is_404() {
        let router = create_router(hub(vec![]));
        let (status, _) = call(router, "POST", "/api/chat/nope/reset", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_archives_chat() {
        let hub = hub(vec![Scripted::Respond(ModelResponse::FinalAnswer {
            text: "hello".into(),
        })]);

        call(
            create_router(hub.clone()),
            "POST",
            "/api/chat",
            Some(json!({ "chat_id": "c1", "message": "hi" })),
        )
        .await;
        let (status, _) = call(create_router(hub.clone()), "POST", "/api/chat/c1/reset", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(create_router(hub), "GET", "/api/archive", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oldest_idle_chat_evicted_at_limit() {
        let config = OrchestratorConfig {
            max_chats: 2,
            ..OrchestratorConfig::default()
        };
        let hub = hub_with(
            ScriptedGateway::repeating(ModelResponse::FinalAnswer { text: "ok".into() }),
            config,
        );

        for chat_id in ["c1", "c2", "c3"] {
            let (status, _) = call(
                create_router(hub.clone()),
                "POST",
                "/api/chat",
                Some(json!({ "chat_id": chat_id, "message": "hi" })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        assert_eq!(hub.chat_count().await, 2);
        assert!(hub.get("c1").await.is_none());
        assert!(hub.get("c3").await.is_some());
        assert_eq!(hub.archive().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_tools() {
        let router = create_router(hub(vec![]));
        let (status, body) = call(router, "GET", "/api/tools", None).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"getFinancialSummary"));
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, _) = error_reply(&OrchestrationError::SessionBusy(uuid::Uuid::new_v4()));
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = error_reply(&OrchestrationError::LoopBudgetExceeded { max_rounds: 8 });
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
