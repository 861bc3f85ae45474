//! OpenAI-dialect orchestration.
//!
//! Chat completions (unary, streaming and fake-stream), embeddings, image
//! generation and model listing over the same pipeline as the native
//! dialect, with responses rebuilt in the OpenAI shape.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::logger;

use super::chat::{self, SettlementGuard};
use super::client::{is_sse_done, parse_sse_data};
use super::context::AppContext;
use super::error::{RelayError, RelayResult};
use super::estimator::{actual_tokens_from_response, estimate_payload_tokens};
use super::response::StreamMeta;
use super::{convert, embedding, payload, response, retry};

/// Normalize the `stream` flag; clients send booleans, numbers and strings.
pub fn is_streaming_request(payload: &Value) -> bool {
    match payload.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    }
}

fn missing_field(field: &str) -> RelayError {
    RelayError::Validation {
        message: "Request validation failed".to_string(),
        details: vec![json!({
            "loc": ["body", field],
            "msg": "Field required",
            "type": "missing"
        })],
    }
}

fn request_model(request: &Value) -> RelayResult<&str> {
    request
        .get("model")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| RelayError::InvalidRequest("Missing or empty 'model' field".to_string()))
}

/// `/v1/chat/completions` entry point for both the unary and stream variants.
pub async fn create_chat_completion(
    ctx: &Arc<AppContext>,
    request: &Value,
) -> RelayResult<Response> {
    let model = request_model(request)?.to_string();
    let has_messages = matches!(request.get("messages"), Some(Value::Array(m)) if !m.is_empty());
    if !has_messages {
        return Err(missing_field("messages"));
    }

    let shaped = convert::build_chat_payload(request, &ctx.settings);
    let estimated = estimate_payload_tokens(&shaped);

    if is_streaming_request(request) {
        handle_stream_completion(ctx, &model, shaped, estimated).await
    } else {
        let body = retry::with_retry(ctx, false, |api_key| {
            chat::unary_attempt(
                ctx,
                &model,
                &shaped,
                estimated,
                "openai-chat-non-stream",
                api_key,
            )
        })
        .await?;
        Ok(Json(response::openai_completion(&body, &model, "stop", &ctx.settings)).into_response())
    }
}

/// Streaming chat completion with the orchestrator-level retry loop: rotation
/// applies while the upstream stream is being established; once bytes flow a
/// failure surfaces without retry.
async fn handle_stream_completion(
    ctx: &Arc<AppContext>,
    model: &str,
    shaped: Value,
    estimated: u64,
) -> RelayResult<Response> {
    let max_retries = ctx.settings.max_retries.max(1);
    let mut api_key = ctx
        .key_pool
        .get_next_working_key()
        .await
        .ok_or_else(|| RelayError::Internal("No API keys configured".to_string()))?;

    let mut last_err: Option<RelayError> = None;
    for attempt in 1..=max_retries {
        let selected = ctx.select_key_from(model, estimated, api_key.clone()).await?;
        if let Err(err) = ctx.rate_limiter.reserve(model, estimated).await {
            ctx.key_rate_limiter.release(model, &selected, estimated).await;
            return Err(err);
        }
        let started = Instant::now();
        let guard = SettlementGuard::new(
            Arc::clone(ctx),
            model.to_string(),
            selected.clone(),
            estimated,
            started,
            true,
        );

        if ctx.settings.fake_stream_enabled {
            logger::info(
                "openai",
                &format!(
                    "Fake stream enabled for model {}; calling the unary endpoint (attempt {})",
                    model, attempt
                ),
            );
            return Ok(chat::sse_response(fake_stream(
                Arc::clone(ctx),
                model.to_string(),
                selected,
                shaped,
                estimated,
                guard,
            )));
        }

        match ctx
            .client
            .stream_generate_content(&shaped, &payload::real_model(model), &selected)
            .await
        {
            Ok(lines) => {
                return Ok(chat::sse_response(forward_openai_stream(
                    Arc::clone(ctx),
                    model.to_string(),
                    selected,
                    shaped,
                    estimated,
                    guard,
                    lines,
                )));
            }
            Err(err) => {
                if let Ok(mut tally) = guard.tally().lock() {
                    tally.failed = true;
                    tally.status_code = err.status();
                }
                if !err.keeps_reservation() {
                    ctx.key_rate_limiter.release(model, &selected, estimated).await;
                }
                ctx.emit_error_log(model, &selected, "openai-chat-stream", &err, &shaped);
                guard.settle().await;

                if !err.is_retryable(&ctx.settings.retryable_status_codes, false) {
                    return Err(err);
                }
                logger::warn(
                    "openai",
                    &format!(
                        "Streaming connect failed: {}; attempt {} of {}",
                        err, attempt, max_retries
                    ),
                );
                last_err = Some(err);
                match ctx.key_pool.handle_api_failure(&selected, attempt).await {
                    Some(next) => api_key = next,
                    None => break,
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| RelayError::Internal("Retry attempts exhausted".to_string())))
}

fn optimizer_pieces(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Copy of a chunk with its text delta replaced.
fn chunk_with_text(original: &Value, text: &str) -> Value {
    let mut copy = original.clone();
    if let Some(delta) = copy
        .get_mut("choices")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("delta"))
        .and_then(|d| d.as_object_mut())
    {
        delta.insert("content".to_string(), json!(text));
    }
    copy
}

fn forward_openai_stream<S>(
    ctx: Arc<AppContext>,
    model: String,
    api_key: String,
    shaped: Value,
    estimated: u64,
    guard: SettlementGuard,
    lines: S,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = RelayResult<String>> + Send + 'static,
{
    let tally = guard.tally();
    let meta = StreamMeta::new();

    let map_tally = Arc::clone(&tally);
    let map_ctx = Arc::clone(&ctx);
    let map_model = model.clone();
    let map_meta = meta.clone();
    let data = lines
        .map(move |item| -> Option<Result<Bytes, std::io::Error>> {
            let _keepalive = &guard;
            match item {
                Ok(line) => {
                    let data = parse_sse_data(&line)?;
                    if data.trim().is_empty() || is_sse_done(data) {
                        return None;
                    }
                    let chunk: Value = match serde_json::from_str(data) {
                        Ok(value) => value,
                        Err(e) => {
                            logger::error(
                                "openai",
                                &format!(
                                    "Failed to decode stream chunk for model {}: {}",
                                    map_model, e
                                ),
                            );
                            return None;
                        }
                    };
                    if let Some(usage) = chunk.get("usageMetadata") {
                        if let Ok(mut tally) = map_tally.lock() {
                            tally.actual_tokens = actual_tokens_from_response(&chunk);
                            tally.last_usage = Some(usage.clone());
                        }
                    }

                    let out_chunk = response::openai_stream_chunk(
                        &chunk,
                        &map_model,
                        None,
                        &map_ctx.settings,
                        &map_meta,
                    );
                    let delta = &out_chunk["choices"][0]["delta"];
                    if delta.get("tool_calls").is_some() {
                        if let Ok(mut tally) = map_tally.lock() {
                            tally.saw_tool_calls = true;
                        }
                    }

                    let text = delta.get("content").and_then(|c| c.as_str());
                    let limit = map_ctx.settings.stream_optimizer_chunk_chars;
                    let mut frames = String::new();
                    match text {
                        Some(text)
                            if map_ctx.settings.stream_optimizer_enabled
                                && text.chars().count() > limit =>
                        {
                            for piece in optimizer_pieces(text, limit) {
                                frames.push_str(&format!(
                                    "data: {}\n\n",
                                    chunk_with_text(&out_chunk, &piece)
                                ));
                            }
                        }
                        _ => frames.push_str(&format!("data: {}\n\n", out_chunk)),
                    }
                    Some(Ok(Bytes::from(frames)))
                }
                Err(err) => {
                    if let Ok(mut tally) = map_tally.lock() {
                        tally.failed = true;
                        tally.status_code = err.status();
                    }
                    let ctx = Arc::clone(&map_ctx);
                    let model = map_model.clone();
                    let api_key = api_key.clone();
                    let shaped = shaped.clone();
                    let keep = err.keeps_reservation();
                    let err_for_log = err.clone();
                    tokio::spawn(async move {
                        if !keep {
                            ctx.key_rate_limiter.release(&model, &api_key, estimated).await;
                        }
                        ctx.emit_error_log(
                            &model,
                            &api_key,
                            "openai-chat-stream",
                            &err_for_log,
                            &shaped,
                        );
                    });
                    Some(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err.to_string(),
                    )))
                }
            }
        })
        .filter_map(std::future::ready);

    let done_tally = Arc::clone(&tally);
    data.chain(stream::once(async move {
        let (completed, finish, usage) = match done_tally.lock() {
            Ok(mut tally) => {
                if tally.failed {
                    (false, "stop", None)
                } else {
                    tally.success = true;
                    tally.status_code = 200;
                    let finish = if tally.saw_tool_calls {
                        "tool_calls"
                    } else {
                        "stop"
                    };
                    (true, finish, tally.last_usage.clone())
                }
            }
            Err(_) => (false, "stop", None),
        };
        if completed {
            let terminal_source = match usage {
                Some(usage) => json!({"usageMetadata": usage}),
                None => Value::Null,
            };
            let final_chunk = response::openai_stream_chunk(
                &terminal_source,
                &model,
                Some(finish),
                &ctx.settings,
                &meta,
            );
            Ok::<Bytes, std::io::Error>(Bytes::from(format!(
                "data: {}\n\ndata: [DONE]\n\n",
                final_chunk
            )))
        } else {
            Ok::<Bytes, std::io::Error>(Bytes::new())
        }
    }))
}

// ============================================================================
// Fake stream
// ============================================================================

/// Aborts the producer when the consumer goes away.
struct AbortOnDrop(JoinHandle<RelayResult<Value>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum FakePhase {
    Waiting(AbortOnDrop),
    Terminal,
    Finished,
}

/// Serve a unary call as a single-chunk stream, heart-beating while the call
/// is in flight. The producer task is aborted if the client disconnects.
fn fake_stream(
    ctx: Arc<AppContext>,
    model: String,
    api_key: String,
    shaped: Value,
    estimated: u64,
    guard: SettlementGuard,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    let tally = guard.tally();
    let meta = StreamMeta::new();
    let interval =
        Duration::from_secs(ctx.settings.fake_stream_empty_data_interval_seconds.max(1));

    let task = {
        let ctx = Arc::clone(&ctx);
        let shaped = shaped.clone();
        let upstream_model = payload::real_model(&model);
        let api_key = api_key.clone();
        tokio::spawn(async move {
            ctx.client
                .generate_content(&shaped, &upstream_model, &api_key)
                .await
        })
    };

    stream::unfold(FakePhase::Waiting(AbortOnDrop(task)), move |phase| {
        let _keepalive = &guard;
        let ctx = Arc::clone(&ctx);
        let model = model.clone();
        let api_key = api_key.clone();
        let shaped = shaped.clone();
        let meta = meta.clone();
        let tally = Arc::clone(&tally);
        async move {
            match phase {
                FakePhase::Waiting(mut task) => {
                    match tokio::time::timeout(interval, &mut task.0).await {
                        Err(_) => {
                            logger::debug("openai", "Sent heartbeat chunk for fake stream");
                            let heartbeat = response::openai_stream_chunk(
                                &Value::Null,
                                &model,
                                None,
                                &ctx.settings,
                                &meta,
                            );
                            Some((
                                Ok::<Bytes, std::io::Error>(Bytes::from(format!(
                                    "data: {}\n\n",
                                    heartbeat
                                ))),
                                FakePhase::Waiting(task),
                            ))
                        }
                        Ok(joined) => {
                            let result: RelayResult<Value> = match joined {
                                Ok(inner) => inner,
                                Err(e) => Err(RelayError::Internal(format!(
                                    "Upstream task failed: {}",
                                    e
                                ))),
                            };
                            match result {
                                Ok(body) => {
                                    if let Ok(mut tally) = tally.lock() {
                                        tally.actual_tokens = actual_tokens_from_response(&body);
                                    }
                                    let chunk = response::openai_stream_chunk(
                                        &body,
                                        &model,
                                        Some("stop"),
                                        &ctx.settings,
                                        &meta,
                                    );
                                    Some((
                                        Ok(Bytes::from(format!("data: {}\n\n", chunk))),
                                        FakePhase::Terminal,
                                    ))
                                }
                                Err(err) => {
                                    if let Ok(mut tally) = tally.lock() {
                                        tally.failed = true;
                                        tally.status_code = err.status();
                                    }
                                    let keep = err.keeps_reservation();
                                    logger::error(
                                        "openai",
                                        &format!("Fake stream upstream call failed: {}", err),
                                    );
                                    if !keep {
                                        ctx.key_rate_limiter
                                            .release(&model, &api_key, estimated)
                                            .await;
                                    }
                                    ctx.emit_error_log(
                                        &model,
                                        &api_key,
                                        "openai-chat-stream",
                                        &err,
                                        &shaped,
                                    );
                                    None
                                }
                            }
                        }
                    }
                }
                FakePhase::Terminal => {
                    if let Ok(mut tally) = tally.lock() {
                        tally.success = true;
                        tally.status_code = 200;
                    }
                    Some((
                        Ok(Bytes::from("data: [DONE]\n\n")),
                        FakePhase::Finished,
                    ))
                }
                FakePhase::Finished => None,
            }
        }
    })
}

// ============================================================================
// Embeddings, images, models
// ============================================================================

/// `/v1/embeddings`: shaped as a native batch-embed call.
pub async fn create_embeddings(ctx: &Arc<AppContext>, request: &Value) -> RelayResult<Value> {
    let model = request_model(request)?.to_string();
    let inputs: Vec<String> = match request.get("input") {
        Some(Value::String(text)) => vec![text.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    };
    if inputs.is_empty() {
        return Err(missing_field("input"));
    }

    let upstream_model = payload::real_model(&model);
    let requests: Vec<Value> = inputs
        .iter()
        .map(|text| {
            json!({
                "model": format!("models/{}", upstream_model),
                "content": {"parts": [{"text": text}]}
            })
        })
        .collect();
    let shaped = json!({"requests": requests});
    let estimated = estimate_payload_tokens(&shaped);

    let native = retry::with_retry(ctx, true, |api_key| {
        embedding::openai_batch_attempt(ctx, &model, &shaped, estimated, api_key)
    })
    .await?;

    Ok(response::openai_embeddings_response(&native, &model, estimated))
}

/// `/v1/images/generations`: shaped as a `generateContent` call against the
/// configured image-generation model.
pub async fn generate_images(ctx: &Arc<AppContext>, request: &Value) -> RelayResult<Value> {
    let prompt = request
        .get("prompt")
        .and_then(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| missing_field("prompt"))?;
    let n = request
        .get("n")
        .and_then(|n| n.as_u64())
        .unwrap_or(1)
        .clamp(1, 4);

    let model = ctx.settings.image_generation_model.clone();
    let shaped = json!({
        "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        "generationConfig": {
            "responseModalities": ["Text", "Image"],
            "candidateCount": n
        }
    });
    let estimated = estimate_payload_tokens(&shaped);

    let body = retry::with_retry(ctx, false, |api_key| {
        chat::unary_attempt(ctx, &model, &shaped, estimated, "openai-image", api_key)
    })
    .await?;

    Ok(response::openai_images_response(
        &body,
        request.get("response_format").and_then(|f| f.as_str()),
    ))
}

/// `/v1/models` in the OpenAI list shape.
pub async fn list_models(ctx: &Arc<AppContext>) -> RelayResult<Value> {
    let native = chat::list_models(ctx).await?;
    let data: Vec<Value> = native
        .get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|model| {
                    let name = model.get("name")?.as_str()?;
                    let id = name.rsplit('/').next().unwrap_or(name);
                    Some(json!({
                        "id": id,
                        "object": "model",
                        "created": 1700000000,
                        "owned_by": "google"
                    }))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(json!({"object": "list", "data": data}))
}
