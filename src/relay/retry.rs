//! Retry policy for unary upstream calls.
//!
//! Errors outside the configured retryable-status set surface immediately.
//! A retryable failure records the credential's failure and rotates to the
//! next working one, up to `MAX_RETRIES` attempts; when no credential is
//! left the last error surfaces.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::logger;

use super::context::AppContext;
use super::error::{RelayError, RelayResult};
use super::keypool::redact_key;

const INITIAL_DELAY_MS: u64 = 300;
const MAX_DELAY_MS: u64 = 3000;

/// Exponential backoff with jitter.
fn retry_delay(attempt: u32) -> Duration {
    let exp = (1u64 << attempt.min(10)) * INITIAL_DELAY_MS;
    let delay = exp.min(MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=delay / 4);
    Duration::from_millis(delay + jitter)
}

/// Run `call` under the retry policy. Each attempt receives the credential it
/// should start from; the attempt owns its own reservation and settlement.
/// `retry_timeouts` is set for idempotent operations (count-tokens,
/// model-list, embeddings).
pub async fn with_retry<F, Fut>(
    ctx: &AppContext,
    retry_timeouts: bool,
    call: F,
) -> RelayResult<Value>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = RelayResult<Value>>,
{
    let max_retries = ctx.settings.max_retries.max(1);
    let mut api_key = ctx
        .key_pool
        .get_next_working_key()
        .await
        .ok_or_else(|| RelayError::Internal("No API keys configured".to_string()))?;

    let mut last_err: Option<RelayError> = None;
    for attempt in 1..=max_retries {
        match call(api_key.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable(&ctx.settings.retryable_status_codes, retry_timeouts) {
                    return Err(err);
                }
                logger::warn(
                    "retry",
                    &format!(
                        "Upstream call failed with retryable status {}; attempt {} of {}",
                        err.status(),
                        attempt,
                        max_retries
                    ),
                );
                last_err = Some(err);
                match ctx.key_pool.handle_api_failure(&api_key, attempt).await {
                    Some(next) => {
                        if next != api_key {
                            logger::info(
                                "retry",
                                &format!("Switched to key {}", redact_key(&next)),
                            );
                        }
                        api_key = next;
                    }
                    None => {
                        logger::error(
                            "retry",
                            &format!("No valid API key available after {} attempts", attempt),
                        );
                        break;
                    }
                }
                if attempt < max_retries {
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| RelayError::Internal("Retry attempts exhausted".to_string())))
}
