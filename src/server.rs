//! HTTP server wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::relay::{self, context::AppContext};

pub fn app(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        .route("/health", get(relay::health))
        // ============================================
        // Native dialect
        // ============================================
        .route("/v1beta/models", get(relay::native_list_models))
        .route(
            "/v1beta/models/:model_action",
            post(relay::native_model_action),
        )
        // ============================================
        // OpenAI-compatible dialect
        // ============================================
        .route("/v1/chat/completions", post(relay::openai_chat_completions))
        .route("/v1/embeddings", post(relay::openai_embeddings))
        .route("/v1/images/generations", post(relay::openai_images))
        .route("/v1/models", get(relay::openai_models))
        // ============================================
        // Ops surface
        // ============================================
        .route("/api/keys", get(relay::keys_status))
        .route("/api/keys/reset", post(relay::reset_key))
        .route("/api/logs/requests", get(relay::recent_request_logs))
        .route("/api/logs/errors", get(relay::recent_error_logs))
        .route("/api/logs/system", get(relay::recent_system_logs))
        .layer(cors)
        .with_state(ctx)
}

pub async fn serve(ctx: Arc<AppContext>) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.settings.host, ctx.settings.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    crate::logger::info("server", &format!("Listening on {}", addr));
    axum::serve(listener, app(ctx)).await
}
