//! Rotating credential pool.
//!
//! Credentials are loaded at startup and handed out round-robin. Consecutive
//! upstream failures above the configured threshold flag a credential invalid
//! and skip it during rotation; explicit re-validation brings it back.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::logger;

/// Redact a credential for logging: first six and last six characters.
pub fn redact_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = key.chars().collect();
    let (head, tail) = if chars.len() <= 12 { (3, 3) } else { (6, 6) };
    let prefix: String = chars.iter().take(head).collect();
    let suffix: String = chars[chars.len().saturating_sub(tail)..].iter().collect();
    format!("{}...{}", prefix, suffix)
}

struct PoolState {
    cursor: usize,
    failure_counts: HashMap<String, u32>,
    valid: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub failure_count: u32,
    pub valid: bool,
}

pub struct KeyPool {
    api_keys: Vec<String>,
    max_failures: u32,
    state: Mutex<PoolState>,
}

impl KeyPool {
    pub fn new(api_keys: Vec<String>, max_failures: u32) -> Self {
        Self {
            api_keys,
            max_failures,
            state: Mutex::new(PoolState {
                cursor: 0,
                failure_counts: HashMap::new(),
                valid: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.api_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.api_keys.is_empty()
    }

    fn is_working(state: &PoolState, key: &str, max_failures: u32) -> bool {
        state.valid.get(key).copied().unwrap_or(true)
            && state.failure_counts.get(key).copied().unwrap_or(0) <= max_failures
    }

    /// Advance the cursor round-robin until a working credential is found.
    /// When every credential is flagged invalid the first configured key is
    /// returned anyway so the caller can surface the upstream's own error.
    pub async fn get_next_working_key(&self) -> Option<String> {
        if self.api_keys.is_empty() {
            return None;
        }
        let mut state = self.state.lock().await;
        for _ in 0..self.api_keys.len() {
            let key = self.api_keys[state.cursor].clone();
            state.cursor = (state.cursor + 1) % self.api_keys.len();
            if Self::is_working(&state, &key, self.max_failures) {
                return Some(key);
            }
        }
        logger::warn(
            "keypool",
            "All credentials are flagged invalid; falling back to the first configured key",
        );
        Some(self.api_keys[0].clone())
    }

    /// Record an upstream failure for `key` and hand back the next working
    /// credential, or `None` when nothing is left to rotate to.
    pub async fn handle_api_failure(&self, key: &str, attempt: u32) -> Option<String> {
        {
            let mut state = self.state.lock().await;
            let count = state.failure_counts.entry(key.to_string()).or_insert(0);
            *count += 1;
            let count = *count;
            logger::warn(
                "keypool",
                &format!(
                    "Key {} failed (attempt {}), consecutive failures: {}",
                    redact_key(key),
                    attempt,
                    count
                ),
            );
            if count > self.max_failures {
                state.valid.insert(key.to_string(), false);
                logger::warn(
                    "keypool",
                    &format!(
                        "Key {} disabled after {} consecutive failures",
                        redact_key(key),
                        count
                    ),
                );
            }
        }

        let any_working = {
            let state = self.state.lock().await;
            self.api_keys
                .iter()
                .any(|k| Self::is_working(&state, k, self.max_failures))
        };
        if !any_working {
            return None;
        }
        self.get_next_working_key().await
    }

    /// Reset the consecutive-failure count after a successful call.
    pub async fn mark_success(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.failure_counts.insert(key.to_string(), 0);
    }

    /// Explicit re-validation: clear the failure count and return the
    /// credential to rotation. Returns false for unknown keys.
    pub async fn revalidate(&self, key: &str) -> bool {
        if !self.api_keys.iter().any(|k| k == key) {
            return false;
        }
        let mut state = self.state.lock().await;
        state.failure_counts.insert(key.to_string(), 0);
        state.valid.insert(key.to_string(), true);
        logger::info("keypool", &format!("Key {} re-validated", redact_key(key)));
        true
    }

    /// Redacted view of the pool for the ops surface.
    pub async fn snapshot(&self) -> Vec<KeyStatus> {
        let state = self.state.lock().await;
        self.api_keys
            .iter()
            .map(|key| KeyStatus {
                key: redact_key(key),
                failure_count: state.failure_counts.get(key).copied().unwrap_or(0),
                valid: Self::is_working(&state, key, self.max_failures),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn pool(keys: &[&str], max_failures: u32) -> KeyPool {
        KeyPool::new(keys.iter().map(|k| k.to_string()).collect(), max_failures)
    }

    #[test]
    fn test_redact_key() {
        assert_eq!(redact_key("AIzaSyExampleExampleExample"), "AIzaSy...xample");
        assert_eq!(redact_key("shortkey"), "sho...key");
        assert_eq!(redact_key(""), "");
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let pool = pool(&["k1", "k2", "k3"], 3);
        let mut counts: StdHashMap<String, usize> = StdHashMap::new();
        for _ in 0..10 {
            let key = pool.get_next_working_key().await.unwrap();
            *counts.entry(key).or_insert(0) += 1;
        }
        // 10 draws over 3 keys: each key handed out 3 or 4 times.
        for key in ["k1", "k2", "k3"] {
            let n = counts.get(key).copied().unwrap_or(0);
            assert!(n == 3 || n == 4, "key {} drawn {} times", key, n);
        }
    }

    #[tokio::test]
    async fn test_failure_threshold_invalidates() {
        let pool = pool(&["k1", "k2"], 1);
        pool.handle_api_failure("k1", 1).await;
        pool.handle_api_failure("k1", 2).await;
        // k1 is now past the threshold and skipped during rotation.
        for _ in 0..4 {
            assert_eq!(pool.get_next_working_key().await.unwrap(), "k2");
        }
        assert!(pool.revalidate("k1").await);
        let snapshot = pool.snapshot().await;
        assert!(snapshot.iter().all(|s| s.valid));
    }

    #[tokio::test]
    async fn test_rotation_exhaustion_returns_none() {
        let pool = pool(&["k1"], 0);
        assert_eq!(pool.handle_api_failure("k1", 1).await, None);
    }

    #[tokio::test]
    async fn test_mark_success_resets_consecutive_failures() {
        let pool = pool(&["k1", "k2"], 1);
        pool.handle_api_failure("k1", 1).await;
        pool.mark_success("k1").await;
        pool.handle_api_failure("k1", 1).await;
        // Two failures were recorded but never consecutively past the
        // threshold, so k1 stays in rotation.
        let snapshot = pool.snapshot().await;
        let k1 = snapshot.iter().find(|s| s.key == redact_key("k1")).unwrap();
        assert!(k1.valid);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let pool = pool(&[], 3);
        assert!(pool.is_empty());
        assert_eq!(pool.get_next_working_key().await, None);
    }
}
