//! HTTP adapter.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/chat/completions` | One chat turn against an agent |
//! | `POST` | `/v1/knowledge` | Create a knowledge space and ingest its URLs |
//! | `GET`  | `/v1/knowledge` | List the tenant's knowledge spaces |
//! | `POST` | `/v1/knowledge/{id}/resume` | Re-ingest sources that are not complete |
//! | `GET`  | `/v1/knowledge/{id}/chunks` | Chunks stored for a knowledge space |
//! | `POST` | `/v1/agents` | Create an agent |
//! | `GET`  | `/health` | Version and circuit-breaker states |
//!
//! The tenant comes from the `x-tenant-id` header and the user from
//! `x-user-id`. Neither is authenticated here; tenant ids must be letters,
//! digits, `_` or `-`. An optional `x-request-id` is propagated into logs
//! and echoed on the response; one is generated when absent.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "no user message in request" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `upstream_error` (502), `circuit_open` (503), `internal` (500).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Extension, Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use rag_chat_core::error::RagError;
use rag_chat_core::ids::validate_segment;
use rag_chat_core::models::{Agent, ChatMessage, KnowledgeSpace};

use crate::chat::{ChatCompletion, ChatRequest, CreateAgentRequest};
use crate::config::Config;
use crate::ingest::{CreateKnowledgeSpaceRequest, IngestionReport, KnowledgeChunks};
use crate::logging::RequestEvent;
use crate::resilience::BreakerState;
use crate::services::AppServices;

const TENANT_HEADER: &str = "x-tenant-id";
const USER_HEADER: &str = "x-user-id";
const REQUEST_ID_HEADER: &str = "x-request-id";
const ANONYMOUS_USER: &str = "anonymous";

#[derive(Clone)]
struct AppState {
    services: AppServices,
    turn_timeout: Duration,
}

/// Build the services from `config` and serve until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = AppServices::from_config(config).await?;
    let app = router(
        services,
        Duration::from_secs(config.server.turn_timeout_secs),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "ragchat server listening");
    println!("ragchat server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table over `services`.
pub fn router(services: AppServices, turn_timeout: Duration) -> Router {
    let state = AppState {
        services,
        turn_timeout,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat))
        .route(
            "/v1/knowledge",
            post(handle_create_knowledge).get(handle_list_knowledge),
        )
        .route("/v1/knowledge/{id}/resume", post(handle_resume_knowledge))
        .route("/v1/knowledge/{id}/chunks", get(handle_knowledge_chunks))
        .route("/v1/agents", post(handle_create_agent))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn_with_state(state.clone(), log_request))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::REQUEST_TIMEOUT, "timeout", message)
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let message = err.to_string();
        match err {
            RagError::Validation(_) | RagError::NoUserMessage => bad_request(message),
            RagError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, "not_found", message),
            RagError::Timeout(_) => timeout_error(message),
            RagError::CircuitOpen { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "circuit_open", message)
            }
            RagError::ExternalService { .. }
            | RagError::RetriesExhausted { .. }
            | RagError::EmbeddingFailed(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
            }
            RagError::Persistence(_) => {
                error!(error = %message, "persistence failure");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

// ============ Request context ============

#[derive(Debug)]
struct RequestContext {
    tenant_id: String,
    user_id: String,
    request_id: String,
}

/// Request id assigned by [`log_request`], shared with the handlers
/// through request extensions.
#[derive(Debug, Clone)]
struct RequestId(String);

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn request_context(headers: &HeaderMap, request_id: RequestId) -> Result<RequestContext, AppError> {
    let tenant_id = header_value(headers, TENANT_HEADER)
        .ok_or_else(|| bad_request(format!("missing {} header", TENANT_HEADER)))?;
    validate_segment("tenant id", &tenant_id)?;
    Ok(RequestContext {
        tenant_id,
        user_id: header_value(headers, USER_HEADER).unwrap_or_else(|| ANONYMOUS_USER.to_string()),
        request_id: request_id.0,
    })
}

async fn log_request(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let tenant_id = header_value(request.headers(), TENANT_HEADER).unwrap_or_default();
    let request_id = header_value(request.headers(), REQUEST_ID_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    state.services.logger.request_completed(&RequestEvent {
        request_id: &request_id,
        tenant_id: &tenant_id,
        method: &method,
        path: &path,
        status_code: response.status().as_u16(),
        duration_ms: started.elapsed().as_millis() as u64,
    });
    response
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    breakers: BTreeMap<String, BreakerState>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let breakers = state
        .services
        .breakers
        .states()
        .into_iter()
        .map(|(dependency, s)| (dependency.to_string(), s))
        .collect();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        breakers,
    })
}

// ============ POST /v1/chat/completions ============

#[derive(Deserialize)]
struct ChatCompletionBody {
    /// Agent id.
    model: String,
    messages: Vec<ChatMessage>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Json<ChatCompletion>, AppError> {
    let ctx = request_context(&headers, request_id)?;
    if body.model.trim().is_empty() {
        return Err(bad_request("model (agent id) must not be empty"));
    }

    let request = ChatRequest {
        tenant_id: ctx.tenant_id,
        user_id: ctx.user_id,
        agent_id: body.model,
        messages: body.messages,
        request_id: ctx.request_id,
    };
    // Dropping the turn on timeout cancels in-flight searches; nothing is
    // recorded for an aborted turn.
    match tokio::time::timeout(state.turn_timeout, state.services.chat.chat(request)).await {
        Ok(result) => Ok(Json(result?)),
        Err(_) => Err(timeout_error(format!(
            "chat turn exceeded {}s",
            state.turn_timeout.as_secs()
        ))),
    }
}

// ============ Knowledge spaces ============

#[derive(Deserialize)]
struct CreateKnowledgeBody {
    name: String,
    #[serde(alias = "sourceUrls", alias = "urls")]
    source_urls: Vec<String>,
}

async fn handle_create_knowledge(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<CreateKnowledgeBody>,
) -> Result<(StatusCode, Json<IngestionReport>), AppError> {
    let ctx = request_context(&headers, request_id)?;
    let report = state
        .services
        .ingestion
        .create_knowledge_space(CreateKnowledgeSpaceRequest {
            tenant_id: ctx.tenant_id,
            name: body.name,
            source_urls: body.source_urls,
            request_id: ctx.request_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

#[derive(Serialize)]
struct KnowledgeListResponse {
    knowledge_spaces: Vec<KnowledgeSpaceView>,
}

#[derive(Serialize)]
struct KnowledgeSpaceView {
    #[serde(flatten)]
    space: KnowledgeSpace,
    namespace: String,
}

async fn handle_list_knowledge(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<Json<KnowledgeListResponse>, AppError> {
    let ctx = request_context(&headers, request_id)?;
    let spaces = state.services.ingestion.list(&ctx.tenant_id).await?;
    Ok(Json(KnowledgeListResponse {
        knowledge_spaces: spaces
            .into_iter()
            .map(|space| KnowledgeSpaceView {
                namespace: space.namespace(),
                space,
            })
            .collect(),
    }))
}

async fn handle_resume_knowledge(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<IngestionReport>, AppError> {
    let ctx = request_context(&headers, request_id)?;
    let report = state
        .services
        .ingestion
        .resume(&ctx.tenant_id, &id, &ctx.request_id)
        .await?;
    Ok(Json(report))
}

async fn handle_knowledge_chunks(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeChunks>, AppError> {
    let ctx = request_context(&headers, request_id)?;
    let chunks = state.services.ingestion.chunks(&ctx.tenant_id, &id).await?;
    Ok(Json(chunks))
}

// ============ POST /v1/agents ============

#[derive(Deserialize)]
struct CreateAgentBody {
    name: String,
    #[serde(alias = "knowledgeSpaceIds")]
    knowledge_space_ids: Vec<String>,
    #[serde(default = "default_strict", alias = "strictRAG")]
    strict_grounding: bool,
}

fn default_strict() -> bool {
    true
}

async fn handle_create_agent(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<Agent>), AppError> {
    let ctx = request_context(&headers, request_id)?;
    let agent = state
        .services
        .agents
        .create_agent(CreateAgentRequest {
            tenant_id: ctx.tenant_id,
            name: body.name,
            knowledge_space_ids: body.knowledge_space_ids,
            strict_grounding: body.strict_grounding,
            request_id: ctx.request_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}
