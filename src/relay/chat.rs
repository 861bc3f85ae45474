//! Native-dialect chat orchestration.
//!
//! The unary path runs selection -> global reserve -> upstream call ->
//! settlement under the retry policy. The streaming path forwards upstream
//! SSE chunks after transformation. On both paths settlement is carried by a
//! drop guard, so it also runs when the request future is dropped mid-call
//! (client disconnect).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};

use crate::logger;

use super::client::{is_sse_done, parse_sse_data};
use super::context::AppContext;
use super::error::{RelayError, RelayResult};
use super::estimator::{actual_tokens_from_response, estimate_payload_tokens};
use super::{payload, response, retry};

/// Shared accounting for one in-flight request.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamTally {
    pub actual_tokens: u64,
    pub success: bool,
    pub failed: bool,
    pub status_code: u16,
    pub saw_tool_calls: bool,
    pub last_usage: Option<Value>,
}

/// Settlement for one request: true up the global window, correct or return
/// the per-key reservation, emit the request log.
///
/// `settle()` runs it inline on normal completion paths. Dropping the guard
/// while still armed (a request future cancelled at a suspension point, or a
/// streamed body dropped by the client) runs the same settlement from `Drop`.
/// A cancellation recorded neither success nor failure, so the per-key
/// reservation is released there; an observed upstream failure has already
/// released it inline, or deliberately kept it.
pub(crate) struct SettlementGuard {
    ctx: Arc<AppContext>,
    model: String,
    api_key: String,
    estimated: u64,
    started: Instant,
    per_key_reserved: bool,
    disarmed: bool,
    tally: Arc<StdMutex<StreamTally>>,
}

impl SettlementGuard {
    pub fn new(
        ctx: Arc<AppContext>,
        model: String,
        api_key: String,
        estimated: u64,
        started: Instant,
        per_key_reserved: bool,
    ) -> Self {
        Self {
            ctx,
            model,
            api_key,
            estimated,
            started,
            per_key_reserved,
            disarmed: false,
            tally: Arc::new(StdMutex::new(StreamTally::default())),
        }
    }

    pub fn tally(&self) -> Arc<StdMutex<StreamTally>> {
        Arc::clone(&self.tally)
    }

    /// Run settlement inline and disarm the drop hook.
    pub async fn settle(mut self) {
        self.disarmed = true;
        let tally = self.tally.lock().map(|t| t.clone()).unwrap_or_default();
        Self::run(
            Arc::clone(&self.ctx),
            self.model.clone(),
            self.api_key.clone(),
            self.estimated,
            self.started,
            self.per_key_reserved,
            tally,
        )
        .await;
    }

    async fn run(
        ctx: Arc<AppContext>,
        model: String,
        api_key: String,
        estimated: u64,
        started: Instant,
        per_key_reserved: bool,
        tally: StreamTally,
    ) {
        ctx.rate_limiter
            .adjust(&model, estimated, tally.actual_tokens)
            .await;
        if tally.success {
            if per_key_reserved {
                ctx.key_rate_limiter
                    .update_token_usage(&model, &api_key, estimated, tally.actual_tokens)
                    .await;
            }
            ctx.key_pool.mark_success(&api_key).await;
        } else if per_key_reserved && !tally.failed {
            // Cancelled before an outcome was recorded: the reservation goes
            // back to budget. Failure paths handle their own release so that
            // upstream quota exhaustion can keep it.
            ctx.key_rate_limiter
                .release(&model, &api_key, estimated)
                .await;
        }
        let status = if tally.status_code == 0 {
            None
        } else {
            Some(tally.status_code)
        };
        ctx.emit_request_log(&model, &api_key, tally.success, status, started);
    }
}

impl Drop for SettlementGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        let tally = self.tally.lock().map(|t| t.clone()).unwrap_or_default();
        tokio::spawn(Self::run(
            Arc::clone(&self.ctx),
            self.model.clone(),
            self.api_key.clone(),
            self.estimated,
            self.started,
            self.per_key_reserved,
            tally,
        ));
    }
}

pub(crate) fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn require_contents(request: &Value) -> RelayResult<()> {
    match request.get("contents") {
        Some(Value::Array(contents)) if !contents.is_empty() => Ok(()),
        _ => Err(RelayError::Validation {
            message: "Request validation failed".to_string(),
            details: vec![json!({
                "loc": ["body", "contents"],
                "msg": "Field required",
                "type": "missing"
            })],
        }),
    }
}

/// One unary attempt: select a credential, reserve the global budget, call
/// upstream and settle every counter on the way out. Used by both dialects.
pub(crate) async fn unary_attempt(
    ctx: &Arc<AppContext>,
    model: &str,
    shaped: &Value,
    estimated: u64,
    error_type: &'static str,
    initial_key: String,
) -> RelayResult<Value> {
    let api_key = ctx.select_key_from(model, estimated, initial_key).await?;

    // Per-key reservation strictly precedes the global one, so the global
    // budget is never committed for a credential that was rejected locally.
    if let Err(err) = ctx.rate_limiter.reserve(model, estimated).await {
        ctx.key_rate_limiter.release(model, &api_key, estimated).await;
        return Err(err);
    }

    let upstream_model = payload::real_model(model);
    let started = Instant::now();
    let guard = SettlementGuard::new(
        Arc::clone(ctx),
        model.to_string(),
        api_key.clone(),
        estimated,
        started,
        true,
    );
    let tally = guard.tally();

    let result = ctx
        .client
        .generate_content(shaped, &upstream_model, &api_key)
        .await;

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
            if !err.keeps_reservation() {
                ctx.key_rate_limiter.release(model, &api_key, estimated).await;
            }
            logger::error(
                "chat",
                &format!(
                    "Upstream call failed for model {}: {} - {}",
                    model,
                    err.status(),
                    err
                ),
            );
            ctx.emit_error_log(model, &api_key, error_type, err, shaped);
        }
    }

    guard.settle().await;
    result
}

/// Unary `generateContent` in the native dialect.
pub async fn generate_content(
    ctx: &Arc<AppContext>,
    model: &str,
    request: &Value,
) -> RelayResult<Value> {
    require_contents(request)?;
    let shaped = payload::build_payload(model, request, &ctx.settings);
    let estimated = estimate_payload_tokens(&shaped);

    let body = retry::with_retry(ctx, false, |api_key| {
        unary_attempt(
            ctx,
            model,
            &shaped,
            estimated,
            "gemini-chat-non-stream",
            api_key,
        )
    })
    .await?;

    Ok(response::handle_native_response(
        body,
        model,
        false,
        &ctx.settings,
    ))
}

/// `countTokens` needs only the contents; no budget interplay.
pub async fn count_tokens(
    ctx: &Arc<AppContext>,
    model: &str,
    request: &Value,
) -> RelayResult<Value> {
    require_contents(request)?;
    let shaped = json!({"contents": payload::filter_empty_parts(request.get("contents"))});

    retry::with_retry(ctx, true, |api_key| {
        count_tokens_attempt(ctx, model, &shaped, api_key)
    })
    .await
}

async fn count_tokens_attempt(
    ctx: &Arc<AppContext>,
    model: &str,
    shaped: &Value,
    api_key: String,
) -> RelayResult<Value> {
    let upstream_model = payload::real_model(model);
    let started = Instant::now();
    // No reservation was taken; the guard only covers the request log.
    let guard = SettlementGuard::new(
        Arc::clone(ctx),
        model.to_string(),
        api_key.clone(),
        0,
        started,
        false,
    );
    let tally = guard.tally();

    let result = ctx
        .client
        .count_tokens(shaped, &upstream_model, &api_key)
        .await;

    match &result {
        Ok(_) => {
            if let Ok(mut tally) = tally.lock() {
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
                "chat",
                &format!("countTokens failed for model {}: {}", model, err),
            );
            ctx.emit_error_log(model, &api_key, "gemini-count-tokens", err, shaped);
        }
    }

    guard.settle().await;
    result
}

/// Upstream model listing, minus the configured filter list.
pub async fn list_models(ctx: &Arc<AppContext>) -> RelayResult<Value> {
    let mut models = retry::with_retry(ctx, true, |api_key| async move {
        ctx.client.get_models(&api_key).await
    })
    .await?;

    if let Some(list) = models.get_mut("models").and_then(|m| m.as_array_mut()) {
        let filtered = &ctx.settings.filtered_models;
        list.retain(|model| {
            model
                .get("name")
                .and_then(|n| n.as_str())
                .map(|name| {
                    let id = name.rsplit('/').next().unwrap_or(name);
                    !filtered.iter().any(|f| f == id)
                })
                .unwrap_or(true)
        });
    }
    Ok(models)
}

/// Streaming `generateContent` in the native dialect. Chunks are transformed
/// one by one and re-emitted as SSE; `[DONE]` closes successful streams only.
pub async fn stream_generate_content(
    ctx: &Arc<AppContext>,
    model: &str,
    request: &Value,
) -> RelayResult<Response> {
    require_contents(request)?;
    let shaped = payload::build_payload(model, request, &ctx.settings);
    let estimated = estimate_payload_tokens(&shaped);

    let initial = ctx
        .key_pool
        .get_next_working_key()
        .await
        .ok_or_else(|| RelayError::Internal("No API keys configured".to_string()))?;
    let api_key = ctx.select_key_from(model, estimated, initial).await?;

    if let Err(err) = ctx.rate_limiter.reserve(model, estimated).await {
        ctx.key_rate_limiter.release(model, &api_key, estimated).await;
        return Err(err);
    }

    let upstream_model = payload::real_model(model);
    let started = Instant::now();
    let guard = SettlementGuard::new(
        Arc::clone(ctx),
        model.to_string(),
        api_key.clone(),
        estimated,
        started,
        true,
    );

    match ctx
        .client
        .stream_generate_content(&shaped, &upstream_model, &api_key)
        .await
    {
        Ok(lines) => Ok(sse_response(forward_native_stream(
            Arc::clone(ctx),
            model.to_string(),
            api_key,
            shaped,
            estimated,
            guard,
            lines,
        ))),
        Err(err) => {
            // The stream never opened: roll everything back here.
            if let Ok(mut tally) = guard.tally().lock() {
                tally.failed = true;
                tally.status_code = err.status();
            }
            if !err.keeps_reservation() {
                ctx.key_rate_limiter.release(model, &api_key, estimated).await;
            }
            ctx.emit_error_log(model, &api_key, "gemini-chat-stream", &err, &shaped);
            guard.settle().await;
            Err(err)
        }
    }
}

fn forward_native_stream<S>(
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

    let map_tally = Arc::clone(&tally);
    let data = lines
        .map(move |item| -> Option<Result<Bytes, std::io::Error>> {
            // The guard lives inside this closure; dropping the stream runs
            // settlement.
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
                                "chat",
                                &format!(
                                    "Failed to decode stream chunk for model {}: {}",
                                    model, e
                                ),
                            );
                            return None;
                        }
                    };
                    if chunk.get("usageMetadata").is_some() {
                        if let Ok(mut tally) = map_tally.lock() {
                            tally.actual_tokens = actual_tokens_from_response(&chunk);
                        }
                    }
                    let transformed =
                        response::handle_native_response(chunk, &model, true, &ctx.settings);
                    Some(Ok(Bytes::from(format!("data: {}\n\n", transformed))))
                }
                Err(err) => {
                    if let Ok(mut tally) = map_tally.lock() {
                        tally.failed = true;
                        tally.status_code = err.status();
                    }
                    let ctx = Arc::clone(&ctx);
                    let model = model.clone();
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
                            "gemini-chat-stream",
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
        let completed = match done_tally.lock() {
            Ok(mut tally) => {
                if tally.failed {
                    false
                } else {
                    tally.success = true;
                    tally.status_code = 200;
                    true
                }
            }
            Err(_) => false,
        };
        if completed {
            Ok::<Bytes, std::io::Error>(Bytes::from("data: [DONE]\n\n"))
        } else {
            Ok::<Bytes, std::io::Error>(Bytes::new())
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeyLimits, Settings, TpmLimit};
    use std::time::Duration;

    fn test_guard(ctx: &Arc<AppContext>, model: &str, key: &str, estimated: u64) -> SettlementGuard {
        SettlementGuard::new(
            Arc::clone(ctx),
            model.to_string(),
            key.to_string(),
            estimated,
            Instant::now(),
            true,
        )
    }

    #[tokio::test]
    async fn test_require_contents() {
        assert!(require_contents(&json!({"contents": [{"parts": [{"text": "hi"}]}]})).is_ok());
        let err = require_contents(&json!({})).unwrap_err();
        assert_eq!(err.status(), 422);
        let err = require_contents(&json!({"contents": []})).unwrap_err();
        assert_eq!(err.status(), 422);
    }

    #[tokio::test]
    async fn test_forward_stream_emits_done_on_success() {
        let mut settings = Settings::default();
        settings.api_keys = vec!["key-a-000001".to_string()];
        settings.model_tpm_limits.insert(
            "gemini-2.5-flash".to_string(),
            TpmLimit::Legacy(100_000),
        );
        let ctx = AppContext::new(settings).unwrap();
        // Mirror the reservation the orchestrator makes before streaming.
        ctx.rate_limiter.reserve("gemini-2.5-flash", 10).await.unwrap();

        let lines = stream::iter(vec![
            Ok("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}],\"role\":\"model\"}}]}".to_string()),
            Ok(String::new()),
            Ok("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"b\"}],\"role\":\"model\"}}],\"usageMetadata\":{\"totalTokenCount\":1234}}".to_string()),
        ]);
        let guard = test_guard(&ctx, "gemini-2.5-flash", "key-a-000001", 10);
        let out: Vec<_> = forward_native_stream(
            Arc::clone(&ctx),
            "gemini-2.5-flash".to_string(),
            "key-a-000001".to_string(),
            json!({}),
            10,
            guard,
            lines,
        )
        .collect()
        .await;

        let frames: Vec<String> = out
            .into_iter()
            .map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("data: "));
        assert_eq!(frames[2], "data: [DONE]\n\n");
        // Give the drop-guard settlement task a tick to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let logs = ctx.memory_sink.recent_requests(5);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        // The estimate was trued up against the final usage chunk.
        assert_eq!(
            ctx.rate_limiter.current_count("gemini-2.5-flash").await,
            Some(1234)
        );
    }

    #[tokio::test]
    async fn test_forward_stream_failure_suppresses_done() {
        let mut settings = Settings::default();
        settings.api_keys = vec!["key-a-000001".to_string()];
        let ctx = AppContext::new(settings).unwrap();

        let lines = stream::iter(vec![
            Ok("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}],\"role\":\"model\"}}]}".to_string()),
            Err(RelayError::Upstream {
                status: 500,
                message: "mid-stream failure".to_string(),
            }),
        ]);
        let guard = test_guard(&ctx, "gemini-2.5-flash", "key-a-000001", 10);
        let out: Vec<_> = forward_native_stream(
            Arc::clone(&ctx),
            "gemini-2.5-flash".to_string(),
            "key-a-000001".to_string(),
            json!({}),
            10,
            guard,
            lines,
        )
        .collect()
        .await;

        assert!(out[0].is_ok());
        assert!(out[1].is_err());
        let tail: Vec<String> = out
            .into_iter()
            .filter_map(|r| r.ok())
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert!(!tail.iter().any(|s| s.contains("[DONE]")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let requests = ctx.memory_sink.recent_requests(5);
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].success);
        assert_eq!(requests[0].status_code, Some(500));
        let errors = ctx.memory_sink.recent_errors(5);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "gemini-chat-stream");
    }

    #[tokio::test]
    async fn test_forward_stream_settles_on_client_disconnect() {
        let mut settings = Settings::default();
        settings.api_keys = vec!["key-a-000001".to_string()];
        settings
            .model_tpm_limits
            .insert("m".to_string(), TpmLimit::Legacy(1000));
        settings.model_key_limits.insert(
            "m".to_string(),
            KeyLimits {
                rpm: Some(1),
                tpm: Some(1000),
                rpd: None,
            },
        );
        let ctx = AppContext::new(settings).unwrap();
        let key = "key-a-000001";

        // The reservations the orchestrator takes before the stream opens.
        ctx.key_rate_limiter.check_and_reserve("m", key, 10).await.unwrap();
        ctx.rate_limiter.reserve("m", 10).await.unwrap();

        // A stream that produces one chunk and then hangs, like an upstream
        // that went quiet while the client walks away.
        let lines = stream::iter(vec![Ok(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}],\"role\":\"model\"}}]}"
                .to_string(),
        )])
        .chain(stream::pending::<RelayResult<String>>());

        let guard = test_guard(&ctx, "m", key, 10);
        let mut body = Box::pin(forward_native_stream(
            Arc::clone(&ctx),
            "m".to_string(),
            key.to_string(),
            json!({}),
            10,
            guard,
            lines,
        ));
        assert!(body.next().await.is_some());
        drop(body);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Global reservation rolled back.
        assert_eq!(ctx.rate_limiter.current_count("m").await, Some(0));
        // Per-key RPM slot and TPM tokens returned: with rpm=1 this only
        // succeeds if the disconnect released the earlier reservation.
        ctx.key_rate_limiter.check_and_reserve("m", key, 10).await.unwrap();
        let logs = ctx.memory_sink.recent_requests(5);
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert_eq!(logs[0].status_code, None);
    }

    #[tokio::test]
    async fn test_unary_attempt_settles_on_cancellation() {
        // An upstream that accepts connections but never answers, so the
        // attempt parks at the HTTP await until the request future is
        // dropped.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let mut settings = Settings::default();
        settings.api_keys = vec!["key-a-000001".to_string()];
        settings.base_url = format!("http://{}", addr);
        settings
            .model_tpm_limits
            .insert("m".to_string(), TpmLimit::Legacy(1000));
        settings.model_key_limits.insert(
            "m".to_string(),
            KeyLimits {
                rpm: Some(1),
                tpm: Some(1000),
                rpd: None,
            },
        );
        let ctx = AppContext::new(settings).unwrap();
        let key = "key-a-000001";

        let handle = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move {
                let shaped = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
                unary_attempt(
                    &ctx,
                    "m",
                    &shaped,
                    10,
                    "gemini-chat-non-stream",
                    "key-a-000001".to_string(),
                )
                .await
            }
        });

        // Let the attempt reserve both budgets and park on the upstream call,
        // then drop it the way a disconnecting client would.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Global reservation rolled back.
        assert_eq!(ctx.rate_limiter.current_count("m").await, Some(0));
        // Per-key reservation returned (rpm=1 would reject otherwise).
        ctx.key_rate_limiter.check_and_reserve("m", key, 10).await.unwrap();
        let logs = ctx.memory_sink.recent_requests(5);
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
    }

    #[tokio::test]
    async fn test_settle_disarms_drop_hook() {
        let mut settings = Settings::default();
        settings.api_keys = vec!["key-a-000001".to_string()];
        let ctx = AppContext::new(settings).unwrap();

        let guard = test_guard(&ctx, "m", "key-a-000001", 10);
        if let Ok(mut tally) = guard.tally().lock() {
            tally.success = true;
            tally.status_code = 200;
        }
        guard.settle().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Exactly one request log: Drop did not settle a second time.
        assert_eq!(ctx.memory_sink.recent_requests(10).len(), 1);
    }
}
