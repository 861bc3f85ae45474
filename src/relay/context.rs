//! Shared application context.
//!
//! Owns every process-wide subsystem (key pool, both limiters, upstream
//! client, record sink) and is handed to the orchestrators instead of living
//! in module globals.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use crate::config::Settings;
use crate::logger;

use super::client::GeminiApiClient;
use super::error::{RelayError, RelayResult};
use super::keypool::{redact_key, KeyPool};
use super::limits::{KeyRateLimiter, ModelRateLimiter};
use super::sink::{ErrorLogRecord, LogSink, MemoryLogSink, RequestLogRecord};

pub struct AppContext {
    pub settings: Settings,
    pub key_pool: KeyPool,
    pub rate_limiter: ModelRateLimiter,
    pub key_rate_limiter: KeyRateLimiter,
    pub client: GeminiApiClient,
    pub sink: Arc<dyn LogSink>,
    pub memory_sink: Arc<MemoryLogSink>,
}

impl AppContext {
    pub fn new(settings: Settings) -> RelayResult<Arc<Self>> {
        let client = GeminiApiClient::new(&settings.base_url, settings.time_out)?;
        let memory_sink = Arc::new(MemoryLogSink::new(1024));
        Ok(Arc::new(Self {
            key_pool: KeyPool::new(settings.api_keys.clone(), settings.max_failures),
            rate_limiter: ModelRateLimiter::from_settings(&settings),
            key_rate_limiter: KeyRateLimiter::from_settings(&settings),
            client,
            sink: memory_sink.clone(),
            memory_sink,
            settings,
        }))
    }

    /// Key-selection loop, bounded by pool size with each credential tried at
    /// most once. A per-key rejection rotates to the next credential; an
    /// oversized request fails fast because rotation cannot help it.
    pub async fn select_key_from(
        &self,
        model: &str,
        estimated_tokens: u64,
        initial_key: String,
    ) -> RelayResult<String> {
        if self.key_pool.is_empty() {
            return Err(RelayError::Internal("No API keys configured".to_string()));
        }

        let mut api_key = initial_key;
        let mut tried: HashSet<String> = HashSet::new();
        while tried.len() < self.key_pool.len() {
            // Land on an untried credential, skipping ones already rejected.
            if tried.contains(&api_key) {
                let mut rotated = None;
                for _ in 0..self.key_pool.len() {
                    match self.key_pool.get_next_working_key().await {
                        Some(next) if !tried.contains(&next) => {
                            rotated = Some(next);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                match rotated {
                    Some(next) => api_key = next,
                    None => break,
                }
            }
            tried.insert(api_key.clone());

            match self
                .key_rate_limiter
                .check_and_reserve(model, &api_key, estimated_tokens)
                .await
            {
                Ok(()) => {
                    logger::debug(
                        "relay",
                        &format!(
                            "Key {} passed per-key limits for model {}",
                            redact_key(&api_key),
                            model
                        ),
                    );
                    return Ok(api_key);
                }
                Err(err @ RelayError::RequestTooLarge(_)) => {
                    logger::error(
                        "relay",
                        &format!(
                            "Request rejected for excessive tokens ({}); not trying other keys",
                            estimated_tokens
                        ),
                    );
                    return Err(err);
                }
                Err(RelayError::RateLimited { message, .. }) => {
                    logger::warn(
                        "relay",
                        &format!(
                            "Key {} is rate-limited for model {}: {}; trying next key",
                            redact_key(&api_key),
                            model,
                            message
                        ),
                    );
                    match self.key_pool.get_next_working_key().await {
                        Some(next) => api_key = next,
                        None => break,
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(RelayError::RateLimited {
            message: "All available API keys are currently rate-limited for this model"
                .to_string(),
            retry_after: None,
        })
    }

    pub fn emit_request_log(
        &self,
        model: &str,
        api_key: &str,
        success: bool,
        status_code: Option<u16>,
        started: Instant,
    ) {
        self.sink.add_request_log(RequestLogRecord {
            model: model.to_string(),
            key: redact_key(api_key),
            success,
            status_code,
            latency_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }

    pub fn emit_error_log(
        &self,
        model: &str,
        api_key: &str,
        error_type: &str,
        err: &RelayError,
        payload: &Value,
    ) {
        let request_body = if self.settings.error_log_record_request_body {
            Some(payload.clone())
        } else {
            None
        };
        self.sink.add_error_log(ErrorLogRecord {
            model: model.to_string(),
            key: redact_key(api_key),
            error_type: error_type.to_string(),
            message: err.to_string(),
            status_code: err.status(),
            request_body,
            timestamp: Utc::now(),
        });
    }
}
