//! Runtime configuration.
//!
//! Settings are read once at startup from a TOML file (`GEMINI_RELAY_CONFIG`
//! overrides the default location) and owned by the application context for
//! the lifetime of the process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::{env, fs};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Global token budget for a model: a bare integer keeps the legacy meaning
/// (tokens per minute), the table form carries an explicit window.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum TpmLimit {
    Legacy(u64),
    Windowed { limit: u64, window_seconds: u64 },
}

impl TpmLimit {
    pub fn limit(&self) -> u64 {
        match self {
            TpmLimit::Legacy(limit) => *limit,
            TpmLimit::Windowed { limit, .. } => *limit,
        }
    }

    pub fn window_seconds(&self) -> u64 {
        match self {
            TpmLimit::Legacy(_) => 60,
            TpmLimit::Windowed { window_seconds, .. } => *window_seconds,
        }
    }
}

/// Per-credential caps for one model. Absent caps are unlimited.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
#[serde(default)]
pub struct KeyLimits {
    pub rpm: Option<u32>,
    pub tpm: Option<u64>,
    pub rpd: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Upstream credentials, in rotation order.
    pub api_keys: Vec<String>,
    /// Tokens accepted from clients. Empty list disables the auth gate.
    pub auth_tokens: Vec<String>,
    pub base_url: String,
    /// Upstream per-request timeout in seconds.
    pub time_out: u64,
    pub max_retries: u32,
    /// Consecutive failures before a credential is flagged invalid.
    pub max_failures: u32,
    pub retryable_status_codes: Vec<u16>,
    pub model_tpm_limits: HashMap<String, TpmLimit>,
    pub model_key_limits: HashMap<String, KeyLimits>,
    pub safety_settings: Vec<SafetySetting>,
    /// Real model name -> default thinking budget.
    pub thinking_budget_map: HashMap<String, i64>,
    pub url_context_models: Vec<String>,
    pub url_context_enabled: bool,
    pub tools_code_execution_enabled: bool,
    pub show_search_link: bool,
    pub show_thinking_process: bool,
    pub stream_optimizer_enabled: bool,
    /// Maximum characters per re-chunked text delta when the optimizer is on.
    pub stream_optimizer_chunk_chars: usize,
    pub fake_stream_enabled: bool,
    pub fake_stream_empty_data_interval_seconds: u64,
    pub error_log_record_request_body: bool,
    /// Models removed from `/models` listings.
    pub filtered_models: Vec<String>,
    pub image_generation_model: String,
    pub upload_provider: Option<String>,
    pub smms_secret_token: Option<String>,
    pub picgo_api_key: Option<String>,
    pub picgo_api_url: Option<String>,
    pub cloudflare_imgbed_url: Option<String>,
    pub cloudflare_imgbed_auth_code: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            api_keys: Vec::new(),
            auth_tokens: Vec::new(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            time_out: 300,
            max_retries: 3,
            max_failures: 3,
            retryable_status_codes: vec![503],
            model_tpm_limits: HashMap::new(),
            model_key_limits: HashMap::new(),
            safety_settings: default_safety_settings(),
            thinking_budget_map: HashMap::new(),
            url_context_models: Vec::new(),
            url_context_enabled: false,
            tools_code_execution_enabled: false,
            show_search_link: true,
            show_thinking_process: true,
            stream_optimizer_enabled: false,
            stream_optimizer_chunk_chars: 24,
            fake_stream_enabled: false,
            fake_stream_empty_data_interval_seconds: 5,
            error_log_record_request_body: false,
            filtered_models: Vec::new(),
            image_generation_model: "gemini-2.0-flash-exp-image-generation".to_string(),
            upload_provider: None,
            smms_secret_token: None,
            picgo_api_key: None,
            picgo_api_url: None,
            cloudflare_imgbed_url: None,
            cloudflare_imgbed_auth_code: None,
            log_level: "info".to_string(),
        }
    }
}

pub fn default_safety_settings() -> Vec<SafetySetting> {
    let pairs = [
        ("HARM_CATEGORY_HARASSMENT", "OFF"),
        ("HARM_CATEGORY_HATE_SPEECH", "OFF"),
        ("HARM_CATEGORY_SEXUALLY_EXPLICIT", "OFF"),
        ("HARM_CATEGORY_DANGEROUS_CONTENT", "OFF"),
        ("HARM_CATEGORY_CIVIC_INTEGRITY", "BLOCK_NONE"),
    ];
    pairs
        .iter()
        .map(|(category, threshold)| SafetySetting {
            category: category.to_string(),
            threshold: threshold.to_string(),
        })
        .collect()
}

fn settings_path() -> PathBuf {
    if let Ok(path) = env::var("GEMINI_RELAY_CONFIG") {
        return PathBuf::from(path);
    }
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("gemini-relay");
    p.push("settings.toml");
    p
}

impl Settings {
    /// True when an external image uploader has enough configuration to run.
    pub fn is_image_upload_configured(&self) -> bool {
        match self.upload_provider.as_deref() {
            Some("smms") => self.smms_secret_token.is_some(),
            Some("picgo") => self.picgo_api_key.is_some(),
            Some("cloudflare_imgbed") => self.cloudflare_imgbed_url.is_some(),
            _ => false,
        }
    }

    /// Load settings from the default location; a missing file yields the
    /// defaults. `GEMINI_RELAY_API_KEYS` (comma-separated) can supply keys
    /// when the file carries none.
    pub fn load() -> Result<Self, ConfigError> {
        let path = settings_path();
        let mut settings = if path.exists() {
            Self::from_path(&path)?
        } else {
            Settings::default()
        };

        if settings.api_keys.is_empty() {
            if let Ok(raw) = env::var("GEMINI_RELAY_API_KEYS") {
                settings.api_keys = raw
                    .split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
            }
        }

        Ok(settings)
    }

    pub fn from_path(path: &PathBuf) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpm_limit_forms() {
        let legacy: TpmLimit = serde_json::from_value(serde_json::json!(120000)).unwrap();
        assert_eq!(legacy.limit(), 120000);
        assert_eq!(legacy.window_seconds(), 60);

        let windowed: TpmLimit =
            serde_json::from_value(serde_json::json!({"limit": 50000, "window_seconds": 30}))
                .unwrap();
        assert_eq!(windowed.limit(), 50000);
        assert_eq!(windowed.window_seconds(), 30);
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            api_keys = ["k1", "k2"]
            tools_code_execution_enabled = true

            [model_tpm_limits]
            "gemini-2.5-flash" = 100000
            "gemini-2.5-pro" = { limit = 50000, window_seconds = 120 }

            [model_key_limits."gemini-2.5-flash"]
            rpm = 10
            tpm = 25000
            rpd = 500
        "#;
        let settings: Settings = toml::from_str(raw).unwrap();
        assert_eq!(settings.api_keys.len(), 2);
        assert!(settings.tools_code_execution_enabled);
        assert_eq!(settings.model_tpm_limits["gemini-2.5-flash"].limit(), 100000);
        assert_eq!(
            settings.model_tpm_limits["gemini-2.5-pro"].window_seconds(),
            120
        );
        let limits = settings.model_key_limits["gemini-2.5-flash"];
        assert_eq!(limits.rpm, Some(10));
        assert_eq!(limits.tpm, Some(25000));
        assert_eq!(limits.rpd, Some(500));
    }

    #[test]
    fn test_image_upload_configured() {
        let mut settings = Settings::default();
        assert!(!settings.is_image_upload_configured());
        settings.upload_provider = Some("smms".to_string());
        assert!(!settings.is_image_upload_configured());
        settings.smms_secret_token = Some("token".to_string());
        assert!(settings.is_image_upload_configured());
    }

    #[test]
    fn test_default_safety_settings() {
        let defaults = default_safety_settings();
        assert_eq!(defaults.len(), 5);
        assert!(defaults
            .iter()
            .any(|s| s.category == "HARM_CATEGORY_CIVIC_INTEGRITY" && s.threshold == "BLOCK_NONE"));
    }
}
