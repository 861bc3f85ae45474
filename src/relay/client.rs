//! Upstream API client.
//!
//! Unary and streaming calls against the configured base URL. The credential
//! travels as a query parameter per the upstream auth convention; streaming
//! uses `?alt=sse` and yields complete SSE lines.

use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;

use crate::logger;

use super::error::{RelayError, RelayResult};

pub struct GeminiApiClient {
    client: Client,
    base_url: String,
}

impl GeminiApiClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn model_url(&self, model: &str, action: &str, api_key: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.base_url, model, action, api_key
        )
    }

    async fn post_json(&self, url: &str, payload: &Value) -> RelayResult<Value> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(|e| RelayError::Upstream {
            status: status.as_u16(),
            message: format!("Failed to read upstream response: {}", e),
        })?;

        if !status.is_success() {
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                message: upstream_error_message(&body),
            });
        }

        serde_json::from_str(&body).map_err(|e| RelayError::Upstream {
            status: status.as_u16(),
            message: format!("Failed to parse upstream response: {}", e),
        })
    }

    pub async fn generate_content(
        &self,
        payload: &Value,
        model: &str,
        api_key: &str,
    ) -> RelayResult<Value> {
        logger::debug("client", &format!("POST :generateContent model={}", model));
        self.post_json(&self.model_url(model, "generateContent", api_key), payload)
            .await
    }

    pub async fn count_tokens(
        &self,
        payload: &Value,
        model: &str,
        api_key: &str,
    ) -> RelayResult<Value> {
        logger::debug("client", &format!("POST :countTokens model={}", model));
        self.post_json(&self.model_url(model, "countTokens", api_key), payload)
            .await
    }

    pub async fn embed_content(
        &self,
        payload: &Value,
        model: &str,
        api_key: &str,
    ) -> RelayResult<Value> {
        logger::debug("client", &format!("POST :embedContent model={}", model));
        self.post_json(&self.model_url(model, "embedContent", api_key), payload)
            .await
    }

    pub async fn batch_embed_contents(
        &self,
        payload: &Value,
        model: &str,
        api_key: &str,
    ) -> RelayResult<Value> {
        logger::debug(
            "client",
            &format!("POST :batchEmbedContents model={}", model),
        );
        self.post_json(
            &self.model_url(model, "batchEmbedContents", api_key),
            payload,
        )
        .await
    }

    pub async fn get_models(&self, api_key: &str) -> RelayResult<Value> {
        let url = format!("{}/models?pageSize=1000&key={}", self.base_url, api_key);
        let response = self.client.get(&url).send().await.map_err(map_send_error)?;
        let status = response.status();
        let body = response.text().await.map_err(|e| RelayError::Upstream {
            status: status.as_u16(),
            message: format!("Failed to read upstream response: {}", e),
        })?;
        if !status.is_success() {
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                message: upstream_error_message(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| RelayError::Upstream {
            status: status.as_u16(),
            message: format!("Failed to parse upstream response: {}", e),
        })
    }

    /// Open a streaming `generateContent` call and return the SSE line stream.
    /// A non-success status fails before any line is yielded; read errors
    /// surface mid-stream as items.
    pub async fn stream_generate_content(
        &self,
        payload: &Value,
        model: &str,
        api_key: &str,
    ) -> RelayResult<impl Stream<Item = RelayResult<String>> + Send> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, api_key
        );
        logger::debug(
            "client",
            &format!("POST :streamGenerateContent model={}", model),
        );

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                message: upstream_error_message(&body),
            });
        }

        let mut buffer: Vec<u8> = Vec::new();
        let lines = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => Ok(drain_sse_lines(&mut buffer, &bytes)),
                Err(e) => {
                    if e.is_timeout() {
                        Err(RelayError::Timeout("Upstream stream timed out".to_string()))
                    } else {
                        Err(RelayError::Upstream {
                            status: 502,
                            message: format!("Stream read failed: {}", e),
                        })
                    }
                }
            })
            .flat_map(|result| match result {
                Ok(lines) => stream::iter(
                    lines
                        .into_iter()
                        .map(Ok)
                        .collect::<Vec<RelayResult<String>>>(),
                ),
                Err(e) => stream::iter(vec![Err(e)]),
            });

        Ok(lines)
    }
}

fn map_send_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout("Upstream request timed out".to_string())
    } else if e.is_connect() {
        RelayError::Upstream {
            status: 502,
            message: format!("Connection failed: {}", e),
        }
    } else {
        RelayError::Upstream {
            status: 502,
            message: format!("Request error: {}", e),
        }
    }
}

/// Pull a readable message out of an upstream error body, preserving the
/// provider's wording (quota handling matches on it).
pub fn upstream_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Upstream returned an empty error body".to_string()
    } else {
        trimmed.chars().take(500).collect()
    }
}

/// Strip the `data:` prefix from an SSE line.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Terminal sentinel check.
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drain complete lines from a byte buffer; line breaks may split across
/// reads on a chunked response.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_data() {
        assert_eq!(parse_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("event: ping"), None);
        assert_eq!(parse_sse_data("plain"), None);
    }

    #[test]
    fn test_is_sse_done() {
        assert!(is_sse_done("[DONE]"));
        assert!(is_sse_done("  [DONE]  "));
        assert!(!is_sse_done("{}"));
    }

    #[test]
    fn test_drain_sse_lines_split_across_reads() {
        let mut buffer = Vec::new();
        assert!(drain_sse_lines(&mut buffer, b"data: {\"id\":").is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\ndata: partial");
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
        let lines = drain_sse_lines(&mut buffer, b"\r\n");
        assert_eq!(lines, vec!["data: partial"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_upstream_error_message_prefers_json() {
        let body = r#"{"error": {"code": 429, "message": "Resource has been exhausted (e.g. check quota)."}}"#;
        assert_eq!(
            upstream_error_message(body),
            "Resource has been exhausted (e.g. check quota)."
        );
        assert_eq!(upstream_error_message("plain failure"), "plain failure");
        assert_eq!(
            upstream_error_message(""),
            "Upstream returned an empty error body"
        );
    }
}
