//! Embedding orchestration.
//!
//! Single and batch embeddings reserve against the global model budget only;
//! the per-key limiter is not consulted on this path.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};

use crate::logger;

use super::chat::SettlementGuard;
use super::context::AppContext;
use super::error::{RelayError, RelayResult};
use super::estimator::{actual_tokens_from_response, estimate_payload_tokens};
use super::{payload, retry};

fn require_field(request: &Value, field: &str) -> RelayResult<()> {
    if request.get(field).map(|v| !v.is_null()).unwrap_or(false) {
        return Ok(());
    }
    Err(RelayError::Validation {
        message: "Request validation failed".to_string(),
        details: vec![json!({
            "loc": ["body", field],
            "msg": "Field required",
            "type": "missing"
        })],
    })
}

fn build_embed_payload(request: &Value) -> Value {
    let mut shaped = Map::new();
    if let Some(content) = request.get("content") {
        shaped.insert("content".to_string(), content.clone());
    }
    for field in ["taskType", "title", "outputDimensionality"] {
        if let Some(value) = request.get(field) {
            if !value.is_null() {
                shaped.insert(field.to_string(), value.clone());
            }
        }
    }
    Value::Object(shaped)
}

fn build_batch_embed_payload(request: &Value, upstream_model: &str) -> Value {
    let entries = request
        .get("requests")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();
    let requests: Vec<Value> = entries
        .iter()
        .map(|entry| {
            let mut shaped = build_embed_payload(entry);
            if let Some(obj) = shaped.as_object_mut() {
                obj.insert(
                    "model".to_string(),
                    json!(format!("models/{}", upstream_model)),
                );
            }
            shaped
        })
        .collect();
    json!({"requests": requests})
}

#[derive(Clone, Copy)]
enum EmbedKind {
    Single,
    Batch,
}

/// One embedding attempt: reserve the global budget, call upstream, settle.
/// The guard keeps settlement running even if the request future is dropped
/// while the upstream call is in flight.
async fn embed_attempt(
    ctx: &Arc<AppContext>,
    model: &str,
    shaped: &Value,
    estimated: u64,
    error_type: &'static str,
    kind: EmbedKind,
    api_key: String,
) -> RelayResult<Value> {
    ctx.rate_limiter.reserve(model, estimated).await?;

    let upstream_model = payload::real_model(model);
    let started = Instant::now();
    // No per-key reservation on the embedding path.
    let guard = SettlementGuard::new(
        Arc::clone(ctx),
        model.to_string(),
        api_key.clone(),
        estimated,
        started,
        false,
    );
    let tally = guard.tally();

    let result = match kind {
        EmbedKind::Single => {
            ctx.client
                .embed_content(shaped, &upstream_model, &api_key)
                .await
        }
        EmbedKind::Batch => {
            ctx.client
                .batch_embed_contents(shaped, &upstream_model, &api_key)
                .await
        }
    };

    match &result {
        Ok(body) => {
            if let Ok(mut tally) = tally.lock() {
                tally.actual_tokens = actual_tokens_from_response(body);
                tally.success = true;
                tally.status_code = 200;
            }
        }
        Err(err) => {
            if let Ok(mut tally) = tally.lock() {
                tally.failed = true;
                tally.status_code = err.status();
            }
            logger::error(
                "embedding",
                &format!("Embedding call failed for model {}: {}", model, err),
            );
            ctx.emit_error_log(model, &api_key, error_type, err, shaped);
        }
    }

    guard.settle().await;
    result
}

/// Native `embedContent`.
pub async fn embed_content(
    ctx: &Arc<AppContext>,
    model: &str,
    request: &Value,
) -> RelayResult<Value> {
    require_field(request, "content")?;
    let shaped = build_embed_payload(request);
    let estimated = estimate_payload_tokens(&json!({"requests": [{"content": request.get("content")}]}));

    retry::with_retry(ctx, true, |api_key| {
        embed_attempt(
            ctx,
            model,
            &shaped,
            estimated,
            "gemini-embed-single",
            EmbedKind::Single,
            api_key,
        )
    })
    .await
}

/// Native `batchEmbedContents`.
pub async fn batch_embed_contents(
    ctx: &Arc<AppContext>,
    model: &str,
    request: &Value,
) -> RelayResult<Value> {
    require_field(request, "requests")?;
    let shaped = build_batch_embed_payload(request, &payload::real_model(model));
    let estimated = estimate_payload_tokens(&shaped);

    retry::with_retry(ctx, true, |api_key| {
        embed_attempt(
            ctx,
            model,
            &shaped,
            estimated,
            "gemini-embed-batch",
            EmbedKind::Batch,
            api_key,
        )
    })
    .await
}

/// Shared attempt for the OpenAI embeddings surface (already shaped as a
/// batch payload).
pub(crate) async fn openai_batch_attempt(
    ctx: &Arc<AppContext>,
    model: &str,
    shaped: &Value,
    estimated: u64,
    api_key: String,
) -> RelayResult<Value> {
    embed_attempt(
        ctx,
        model,
        shaped,
        estimated,
        "openai-embeddings",
        EmbedKind::Batch,
        api_key,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_embed_payload_keeps_optional_fields() {
        let request = json!({
            "content": {"parts": [{"text": "hello"}]},
            "taskType": "RETRIEVAL_QUERY",
            "title": null,
            "outputDimensionality": 256
        });
        let shaped = build_embed_payload(&request);
        assert_eq!(shaped["taskType"], "RETRIEVAL_QUERY");
        assert_eq!(shaped["outputDimensionality"], 256);
        assert!(shaped.get("title").is_none());
    }

    #[test]
    fn test_build_batch_embed_payload_injects_model() {
        let request = json!({"requests": [
            {"content": {"parts": [{"text": "a"}]}},
            {"content": {"parts": [{"text": "b"}]}, "taskType": "CLUSTERING"}
        ]});
        let shaped = build_batch_embed_payload(&request, "text-embedding-004");
        let requests = shaped["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["model"], "models/text-embedding-004");
        assert_eq!(requests[1]["taskType"], "CLUSTERING");
    }

    #[test]
    fn test_require_field() {
        assert!(require_field(&json!({"content": {}}), "content").is_ok());
        let err = require_field(&json!({}), "content").unwrap_err();
        assert_eq!(err.status(), 422);
    }
}
