//! Relay module.
//!
//! Endpoint handlers for both request dialects plus the subsystems they
//! orchestrate.
//!
//! ## Endpoints
//!
//! ### Native dialect
//! - `POST /v1beta/models/{model}:generateContent`
//! - `POST /v1beta/models/{model}:streamGenerateContent`
//! - `POST /v1beta/models/{model}:countTokens`
//! - `POST /v1beta/models/{model}:embedContent`
//! - `POST /v1beta/models/{model}:batchEmbedContents`
//! - `GET  /v1beta/models`
//!
//! ### OpenAI-compatible dialect
//! - `POST /v1/chat/completions` (unary and `stream: true`)
//! - `POST /v1/embeddings`
//! - `POST /v1/images/generations`
//! - `GET  /v1/models`

pub mod chat;
pub mod client;
pub mod context;
pub mod convert;
pub mod embedding;
pub mod error;
pub mod estimator;
pub mod keypool;
pub mod limits;
pub mod openai;
pub mod payload;
pub mod response;
pub mod retry;
pub mod sink;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use context::AppContext;
use error::RelayError;

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract the client token: `Authorization: Bearer`, then `x-goog-api-key`,
/// then `x-api-key`.
fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
    {
        return Some(token);
    }
    header_value(headers, "x-goog-api-key").or_else(|| header_value(headers, "x-api-key"))
}

fn verify_auth(headers: &HeaderMap, ctx: &AppContext) -> Result<(), RelayError> {
    if ctx.settings.auth_tokens.is_empty() {
        return Ok(());
    }
    match extract_request_token(headers) {
        Some(token) if ctx.settings.auth_tokens.iter().any(|t| t == &token) => Ok(()),
        Some(_) => Err(RelayError::Unauthorized(
            "Invalid authentication token".to_string(),
        )),
        None => Err(RelayError::Unauthorized(
            "Missing authentication token".to_string(),
        )),
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ============================================================================
// Native dialect
// ============================================================================

/// Dispatch `{model}:{action}` paths to the matching orchestrator.
pub async fn native_model_action(
    State(ctx): State<Arc<AppContext>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(err) = verify_auth(&headers, &ctx) {
        return err.into_response();
    }
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return RelayError::InvalidRequest(
            "Expected a path of the form {model}:{action}".to_string(),
        )
        .into_response();
    };
    if model.is_empty() {
        return RelayError::InvalidRequest("Missing model name".to_string()).into_response();
    }

    match action {
        "generateContent" => match chat::generate_content(&ctx, model, &body).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => err.into_response(),
        },
        "streamGenerateContent" => match chat::stream_generate_content(&ctx, model, &body).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        },
        "countTokens" => match chat::count_tokens(&ctx, model, &body).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => err.into_response(),
        },
        "embedContent" => match embedding::embed_content(&ctx, model, &body).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => err.into_response(),
        },
        "batchEmbedContents" => match embedding::batch_embed_contents(&ctx, model, &body).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => err.into_response(),
        },
        other => RelayError::InvalidRequest(format!("Unsupported action '{}'", other))
            .into_response(),
    }
}

pub async fn native_list_models(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = verify_auth(&headers, &ctx) {
        return err.into_response();
    }
    match chat::list_models(&ctx).await {
        Ok(models) => Json(models).into_response(),
        Err(err) => err.into_response(),
    }
}

// ============================================================================
// OpenAI-compatible dialect
// ============================================================================

pub async fn openai_chat_completions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(err) = verify_auth(&headers, &ctx) {
        return err.into_response();
    }
    match openai::create_chat_completion(&ctx, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn openai_embeddings(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(err) = verify_auth(&headers, &ctx) {
        return err.into_response();
    }
    match openai::create_embeddings(&ctx, &body).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn openai_images(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(err) = verify_auth(&headers, &ctx) {
        return err.into_response();
    }
    match openai::generate_images(&ctx, &body).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn openai_models(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> Response {
    if let Err(err) = verify_auth(&headers, &ctx) {
        return err.into_response();
    }
    match openai::list_models(&ctx).await {
        Ok(models) => Json(models).into_response(),
        Err(err) => err.into_response(),
    }
}

// ============================================================================
// Ops surface
// ============================================================================

pub async fn keys_status(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let keys = ctx.key_pool.snapshot().await;
    Json(json!({"keys": keys}))
}

#[derive(Deserialize)]
pub struct ResetKeyRequest {
    key: String,
}

/// Re-validate a credential: clears its failure count and returns it to
/// rotation.
pub async fn reset_key(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ResetKeyRequest>,
) -> Response {
    if ctx.key_pool.revalidate(&request.key).await {
        Json(json!({"reset": true})).into_response()
    } else {
        RelayError::InvalidRequest("Unknown API key".to_string()).into_response()
    }
}

#[derive(Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

pub async fn recent_request_logs(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50);
    Json(json!({"logs": ctx.memory_sink.recent_requests(limit)}))
}

pub async fn recent_error_logs(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50);
    Json(json!({"logs": ctx.memory_sink.recent_errors(limit)}))
}

pub async fn recent_system_logs(Query(query): Query<LogsQuery>) -> Json<Value> {
    let limit = query.limit.unwrap_or(100);
    Json(json!({"logs": crate::logger::recent(limit)}))
}
