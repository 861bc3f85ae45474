//! Rate limiting: per-model global token windows and per-key RPM/TPM/RPD
//! budgets, both speaking the reserve -> execute -> settle protocol.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::config::{KeyLimits, Settings};
use crate::logger;

use super::error::{RelayError, RelayResult};
use super::keypool::redact_key;

// ============================================================================
// Global per-model limiter
// ============================================================================

struct WindowState {
    window_start: Instant,
    token_count: u64,
}

struct ModelWindow {
    limit: u64,
    window: Duration,
    state: Mutex<WindowState>,
}

/// Fixed-window token budget per model with post-hoc correction: `reserve`
/// debits an estimate before the upstream call, `adjust` trues the counter up
/// once real usage is known (or rolls the reservation back with `actual = 0`).
pub struct ModelRateLimiter {
    limiters: HashMap<String, ModelWindow>,
}

impl ModelRateLimiter {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut limiters = HashMap::new();
        for (model, cfg) in &settings.model_tpm_limits {
            let limit = cfg.limit();
            if limit == 0 {
                logger::warn(
                    "limits",
                    &format!("Ignoring zero token budget for model '{}'", model),
                );
                continue;
            }
            let window_seconds = cfg.window_seconds().max(1);
            limiters.insert(
                model.clone(),
                ModelWindow {
                    limit,
                    window: Duration::from_secs(window_seconds),
                    state: Mutex::new(WindowState {
                        window_start: Instant::now(),
                        token_count: 0,
                    }),
                },
            );
            logger::info(
                "limits",
                &format!(
                    "Token budget for model '{}': {} tokens / {}s",
                    model, limit, window_seconds
                ),
            );
        }
        Self { limiters }
    }

    /// Reserve `estimated_tokens` against the model's current window.
    pub async fn reserve(&self, model: &str, estimated_tokens: u64) -> RelayResult<()> {
        let Some(limiter) = self.limiters.get(model) else {
            return Ok(());
        };

        if estimated_tokens > limiter.limit {
            return Err(RelayError::RequestTooLarge(format!(
                "Estimated tokens ({}) exceed the total token budget for model '{}' ({})",
                estimated_tokens, model, limiter.limit
            )));
        }

        let mut state = limiter.state.lock().await;
        let now = Instant::now();
        if now.duration_since(state.window_start) >= limiter.window {
            state.window_start = now;
            state.token_count = 0;
        }

        if state.token_count + estimated_tokens > limiter.limit {
            let elapsed = now.duration_since(state.window_start);
            let retry_after = limiter.window.saturating_sub(elapsed).as_secs().max(1);
            return Err(RelayError::RateLimited {
                message: format!(
                    "Token budget exceeded for model '{}': {}/{} in the current window",
                    model, state.token_count, limiter.limit
                ),
                retry_after: Some(retry_after),
            });
        }

        state.token_count += estimated_tokens;
        Ok(())
    }

    /// True up a reservation: apply `actual_tokens - estimated_tokens` to the
    /// counter, clamped at zero. `actual_tokens = 0` fully rolls it back.
    pub async fn adjust(&self, model: &str, estimated_tokens: u64, actual_tokens: u64) {
        let Some(limiter) = self.limiters.get(model) else {
            return;
        };
        let mut state = limiter.state.lock().await;
        state.token_count = state
            .token_count
            .saturating_add(actual_tokens)
            .saturating_sub(estimated_tokens);
        logger::debug(
            "limits",
            &format!(
                "Adjusted token count for model '{}': estimated={}, actual={}, now={}",
                model, estimated_tokens, actual_tokens, state.token_count
            ),
        );
    }

    #[cfg(test)]
    pub async fn current_count(&self, model: &str) -> Option<u64> {
        match self.limiters.get(model) {
            Some(limiter) => Some(limiter.state.lock().await.token_count),
            None => None,
        }
    }
}

// ============================================================================
// Per-key limiter
// ============================================================================

struct KeyUsage {
    rpm_count: u32,
    rpm_window_start: Instant,
    tpm_count: u64,
    rpd_count: u32,
    rpd_day: NaiveDate,
}

impl KeyUsage {
    fn new() -> Self {
        Self {
            rpm_count: 0,
            rpm_window_start: Instant::now(),
            tpm_count: 0,
            rpd_count: 0,
            rpd_day: today(),
        }
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Windows advance lazily on access: the minute window resets the RPM and TPM
/// counters, a date change resets the RPD counter.
fn refresh_windows(usage: &mut KeyUsage) {
    let now = Instant::now();
    if now.duration_since(usage.rpm_window_start) >= Duration::from_secs(60) {
        usage.rpm_window_start = now;
        usage.rpm_count = 0;
        usage.tpm_count = 0;
    }
    let day = today();
    if usage.rpd_day != day {
        usage.rpd_day = day;
        usage.rpd_count = 0;
    }
}

/// Per-(model, credential) RPM/TPM/RPD budgets. Only models present in
/// `MODEL_KEY_LIMITS` are limited; credentials are indexed on first use.
pub struct KeyRateLimiter {
    limits: HashMap<String, KeyLimits>,
    state: Mutex<HashMap<(String, String), KeyUsage>>,
}

impl KeyRateLimiter {
    pub fn from_settings(settings: &Settings) -> Self {
        for (model, limits) in &settings.model_key_limits {
            logger::info(
                "limits",
                &format!(
                    "Per-key limits for model '{}': rpm={:?}, tpm={:?}, rpd={:?}",
                    model, limits.rpm, limits.tpm, limits.rpd
                ),
            );
        }
        Self {
            limits: settings.model_key_limits.clone(),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Check every configured cap and, if all pass, debit the counters:
    /// one request, `tokens` tokens, one daily request.
    pub async fn check_and_reserve(&self, model: &str, key: &str, tokens: u64) -> RelayResult<()> {
        let Some(limits) = self.limits.get(model).copied() else {
            return Ok(());
        };

        if let Some(tpm) = limits.tpm {
            if tokens > tpm {
                return Err(RelayError::RequestTooLarge(format!(
                    "Estimated tokens ({}) exceed the per-key TPM cap for model '{}' ({})",
                    tokens, model, tpm
                )));
            }
        }

        let mut state = self.state.lock().await;
        let usage = state
            .entry((model.to_string(), key.to_string()))
            .or_insert_with(KeyUsage::new);
        refresh_windows(usage);

        if let Some(rpm) = limits.rpm {
            if usage.rpm_count + 1 > rpm {
                return Err(RelayError::RateLimited {
                    message: format!(
                        "RPM cap reached for key {} on model '{}': {}/{}",
                        redact_key(key),
                        model,
                        usage.rpm_count,
                        rpm
                    ),
                    retry_after: Some(remaining_minute(usage)),
                });
            }
        }
        if let Some(tpm) = limits.tpm {
            if usage.tpm_count + tokens > tpm {
                return Err(RelayError::RateLimited {
                    message: format!(
                        "TPM cap reached for key {} on model '{}': {}/{}",
                        redact_key(key),
                        model,
                        usage.tpm_count,
                        tpm
                    ),
                    retry_after: Some(remaining_minute(usage)),
                });
            }
        }
        if let Some(rpd) = limits.rpd {
            if usage.rpd_count + 1 > rpd {
                return Err(RelayError::RateLimited {
                    message: format!(
                        "RPD cap reached for key {} on model '{}': {}/{}",
                        redact_key(key),
                        model,
                        usage.rpd_count,
                        rpd
                    ),
                    retry_after: None,
                });
            }
        }

        usage.rpm_count += 1;
        usage.tpm_count += tokens;
        usage.rpd_count += 1;
        Ok(())
    }

    /// Return a reservation to budget after a failed upstream call.
    pub async fn release(&self, model: &str, key: &str, tokens: u64) {
        if !self.limits.contains_key(model) {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(usage) = state.get_mut(&(model.to_string(), key.to_string())) {
            usage.rpm_count = usage.rpm_count.saturating_sub(1);
            usage.tpm_count = usage.tpm_count.saturating_sub(tokens);
            usage.rpd_count = usage.rpd_count.saturating_sub(1);
        }
    }

    /// Correct the token counter once the upstream reports real usage.
    pub async fn update_token_usage(&self, model: &str, key: &str, reserved: u64, actual: u64) {
        if !self.limits.contains_key(model) {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(usage) = state.get_mut(&(model.to_string(), key.to_string())) {
            usage.tpm_count = usage
                .tpm_count
                .saturating_add(actual)
                .saturating_sub(reserved);
        }
    }
}

fn remaining_minute(usage: &KeyUsage) -> u64 {
    Duration::from_secs(60)
        .saturating_sub(usage.rpm_window_start.elapsed())
        .as_secs()
        .max(1)
}
