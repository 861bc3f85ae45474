//! Response transformation into the client-chosen dialect.
//!
//! Normalizes the first candidate's parts (text, executable code, execution
//! results, inline images, function calls), appends grounding citations for
//! search variants, and builds OpenAI-shaped completions and stream chunks.

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::Settings;
use crate::logger;

use super::payload;

/// One extracted candidate: visible text, raw tool-call parts, thought flag.
pub struct ExtractedResult {
    pub text: String,
    pub tool_calls: Vec<Value>,
    pub thought: Option<bool>,
}

fn format_code_block(code: &Value) -> String {
    let language = code
        .get("language")
        .and_then(|l| l.as_str())
        .unwrap_or("")
        .to_lowercase();
    let body = code.get("code").and_then(|c| c.as_str()).unwrap_or("").trim();
    format!(
        "\n\n---\n\n**Code execution**\n```{}\n{}\n```\n",
        language, body
    )
}

fn format_execution_result(result: &Value) -> String {
    let outcome = result.get("outcome").and_then(|o| o.as_str()).unwrap_or("");
    let output = result
        .get("output")
        .and_then(|o| o.as_str())
        .unwrap_or("")
        .trim();
    format!(
        "\n**Execution result**\n> outcome: {}\n\n```plaintext\n{}\n```\n\n---\n\n",
        outcome, output
    )
}

fn extract_image_data(part: &Value) -> String {
    let inline = part.get("inlineData");
    let mime = inline
        .and_then(|d| d.get("mimeType").or_else(|| d.get("mime_type")))
        .and_then(|m| m.as_str())
        .unwrap_or("image/png");
    let data = inline
        .and_then(|d| d.get("data"))
        .and_then(|d| d.as_str())
        .unwrap_or("");
    format!("\n\n![image](data:{};base64,{})\n\n", mime, data)
}

fn part_text(part: &Value) -> Option<String> {
    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    if let Some(code) = part
        .get("executableCode")
        .or_else(|| part.get("codeExecution"))
    {
        return Some(format_code_block(code));
    }
    if let Some(result) = part
        .get("executableCodeResult")
        .or_else(|| part.get("codeExecutionResult"))
    {
        return Some(format_execution_result(result));
    }
    if part.get("inlineData").is_some() {
        return Some(extract_image_data(part));
    }
    None
}

fn extract_tool_calls(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .filter(|part| {
            part.get("functionCall")
                .map(|c| c.is_object())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

fn search_citations(model: &str, candidate: &Value, settings: &Settings) -> Option<String> {
    if !settings.show_search_link || !payload::decode_model(model).search {
        return None;
    }
    let chunks = candidate
        .get("groundingMetadata")?
        .get("groundingChunks")?
        .as_array()?;

    let mut footer = String::from("\n\n---\n\n**Sources**\n");
    let mut any = false;
    for chunk in chunks {
        if let Some(web) = chunk.get("web") {
            let title = web.get("title").and_then(|t| t.as_str()).unwrap_or("source");
            let uri = web.get("uri").and_then(|u| u.as_str()).unwrap_or("");
            footer.push_str(&format!("\n- [{}]({})", title, uri));
            any = true;
        }
    }
    any.then_some(footer)
}

/// Pull the first candidate apart into `(text, tool_calls, thought)`.
pub fn extract_result(
    response: &Value,
    model: &str,
    stream: bool,
    settings: &Settings,
) -> ExtractedResult {
    let mut text = String::new();
    let mut thought = None;
    let mut tool_calls = Vec::new();

    let candidate = response
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    if let Some(candidate) = candidate {
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default();

        if stream {
            // Stream chunks carry at most one meaningful part.
            if let Some(first) = parts.first() {
                if let Some(t) = part_text(first) {
                    text = t;
                }
                if first.get("text").is_some() {
                    thought = first.get("thought").and_then(|v| v.as_bool());
                }
            }
        } else {
            for part in &parts {
                if let Some(t) = part_text(part) {
                    text.push_str(&t);
                    if thought.is_none() && part.get("text").is_some() {
                        thought = part.get("thought").and_then(|v| v.as_bool());
                    }
                }
            }
        }

        if let Some(citations) = search_citations(model, candidate, settings) {
            text.push_str(&citations);
        }
        tool_calls = extract_tool_calls(&parts);
    } else if !stream {
        logger::warn(
            "response",
            &format!("No candidates found in response for model {}", model),
        );
    }

    ExtractedResult {
        text,
        tool_calls,
        thought,
    }
}

pub fn has_inline_image(response: &Value) -> bool {
    let Some(candidates) = response.get("candidates").and_then(|c| c.as_array()) else {
        return false;
    };
    candidates.iter().any(|candidate| {
        candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| parts.iter().any(|p| p.get("inlineData").is_some()))
            .unwrap_or(false)
    })
}

/// Normalize a native response (or stream chunk) into the native output
/// shape. Inline images pass through untouched when no uploader is
/// configured.
pub fn handle_native_response(
    mut response: Value,
    model: &str,
    stream: bool,
    settings: &Settings,
) -> Value {
    if !settings.is_image_upload_configured() && has_inline_image(&response) {
        return response;
    }
    let has_candidates = response
        .get("candidates")
        .and_then(|c| c.as_array())
        .map(|c| !c.is_empty())
        .unwrap_or(false);
    if !has_candidates {
        return response;
    }

    let extracted = extract_result(&response, model, stream, settings);
    let content = if !extracted.tool_calls.is_empty() {
        json!({"parts": extracted.tool_calls, "role": "model"})
    } else {
        let mut part = Map::new();
        part.insert("text".to_string(), json!(extracted.text));
        if let Some(thought) = extracted.thought {
            part.insert("thought".to_string(), json!(thought));
        }
        json!({"parts": [Value::Object(part)], "role": "model"})
    };

    if let Some(candidate) = response
        .get_mut("candidates")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.as_object_mut())
    {
        candidate.insert("content".to_string(), content);
    }
    response
}

// ============================================================================
// OpenAI output shapes
// ============================================================================

/// Identity of one streamed completion, stable across its chunks.
#[derive(Clone)]
pub struct StreamMeta {
    pub id: String,
    pub created: i64,
}

impl StreamMeta {
    pub fn new() -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
        }
    }
}

impl Default for StreamMeta {
    fn default() -> Self {
        Self::new()
    }
}

fn usage_from_metadata(metadata: Option<&Value>) -> Value {
    let prompt = metadata
        .and_then(|m| m.get("promptTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let cached = metadata
        .and_then(|m| m.get("cachedContentTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = metadata
        .and_then(|m| m.get("candidatesTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    json!({
        "prompt_tokens": prompt + cached,
        "completion_tokens": completion,
        "total_tokens": prompt + cached + completion
    })
}

fn openai_tool_calls(parts: &[Value], with_index: bool) -> Vec<Value> {
    parts
        .iter()
        .enumerate()
        .filter_map(|(idx, part)| {
            let call = part.get("functionCall")?;
            let name = call.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
            let args = call.get("args").cloned().unwrap_or(Value::Null);
            let arguments =
                serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
            let mut entry = Map::new();
            if with_index {
                entry.insert("index".to_string(), json!(idx));
            }
            entry.insert(
                "id".to_string(),
                json!(format!("call_{}", Uuid::new_v4().simple())),
            );
            entry.insert("type".to_string(), json!("function"));
            entry.insert(
                "function".to_string(),
                json!({"name": name, "arguments": arguments}),
            );
            Some(Value::Object(entry))
        })
        .collect()
}

/// Build an OpenAI chat completion from a native response. Tool calls replace
/// the text content; otherwise the text (with citations already folded in) is
/// the content.
pub fn openai_completion(
    response: &Value,
    model: &str,
    finish_reason: &str,
    settings: &Settings,
) -> Value {
    let extracted = extract_result(response, model, false, settings);

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    let finish = if extracted.tool_calls.is_empty() {
        message.insert("content".to_string(), json!(extracted.text));
        finish_reason.to_string()
    } else {
        message.insert("content".to_string(), Value::Null);
        message.insert(
            "tool_calls".to_string(),
            Value::Array(openai_tool_calls(&extracted.tool_calls, false)),
        );
        "tool_calls".to_string()
    };

    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish
        }],
        "usage": usage_from_metadata(response.get("usageMetadata"))
    })
}

/// Assemble one `chat.completion.chunk`.
pub fn stream_chunk(
    meta: &StreamMeta,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Value>,
) -> Value {
    let mut chunk = json!({
        "id": meta.id,
        "object": "chat.completion.chunk",
        "created": meta.created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason
        }]
    });
    if let Some(usage) = usage {
        chunk["usage"] = usage;
    }
    chunk
}

/// Build an OpenAI stream chunk from a native stream chunk. An empty or null
/// `response` yields a bare heartbeat delta.
pub fn openai_stream_chunk(
    response: &Value,
    model: &str,
    finish_reason: Option<&str>,
    settings: &Settings,
    meta: &StreamMeta,
) -> Value {
    let extracted = extract_result(response, model, true, settings);

    let mut delta = Map::new();
    delta.insert("role".to_string(), json!("assistant"));
    if !extracted.tool_calls.is_empty() {
        delta.insert(
            "tool_calls".to_string(),
            Value::Array(openai_tool_calls(&extracted.tool_calls, true)),
        );
    } else if !extracted.text.is_empty() {
        if extracted.thought == Some(true) {
            delta.insert("reasoning_content".to_string(), json!(extracted.text));
        } else {
            delta.insert("content".to_string(), json!(extracted.text));
        }
    }

    let usage = response
        .get("usageMetadata")
        .map(|m| usage_from_metadata(Some(m)));
    stream_chunk(meta, model, Value::Object(delta), finish_reason, usage)
}

/// Build the OpenAI images response from a native image-generation response.
pub fn openai_images_response(response: &Value, response_format: Option<&str>) -> Value {
    let mut data = Vec::new();
    if let Some(candidates) = response.get("candidates").and_then(|c| c.as_array()) {
        for candidate in candidates {
            let Some(parts) = candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
            else {
                continue;
            };
            for part in parts {
                let Some(inline) = part.get("inlineData") else {
                    continue;
                };
                let b64 = inline.get("data").and_then(|d| d.as_str()).unwrap_or("");
                if b64.is_empty() {
                    continue;
                }
                if response_format == Some("url") {
                    let mime = inline
                        .get("mimeType")
                        .and_then(|m| m.as_str())
                        .unwrap_or("image/png");
                    data.push(json!({"url": format!("data:{};base64,{}", mime, b64)}));
                } else {
                    data.push(json!({"b64_json": b64}));
                }
            }
        }
    }
    json!({"created": Utc::now().timestamp(), "data": data})
}

/// Build the OpenAI embeddings response from a native batch-embed response.
pub fn openai_embeddings_response(native: &Value, model: &str, estimated_tokens: u64) -> Value {
    let mut data = Vec::new();
    if let Some(embeddings) = native.get("embeddings").and_then(|e| e.as_array()) {
        for (index, embedding) in embeddings.iter().enumerate() {
            let values = embedding.get("values").cloned().unwrap_or(json!([]));
            data.push(json!({
                "object": "embedding",
                "embedding": values,
                "index": index
            }));
        }
    }
    json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": {
            "prompt_tokens": estimated_tokens,
            "total_tokens": estimated_tokens
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk_with_text(text: &str) -> Value {
        json!({"candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}]})
    }

    #[test]
    fn test_extract_text_and_code() {
        let settings = Settings::default();
        let response = json!({"candidates": [{"content": {"parts": [
            {"text": "before "},
            {"executableCode": {"language": "PYTHON", "code": "print(1)\n"}},
            {"codeExecutionResult": {"outcome": "OUTCOME_OK", "output": "1\n"}}
        ], "role": "model"}}]});
        let extracted = extract_result(&response, "gemini-2.5-flash", false, &settings);
        assert!(extracted.text.starts_with("before "));
        assert!(extracted.text.contains("```python\nprint(1)\n```"));
        assert!(extracted.text.contains("outcome: OUTCOME_OK"));
        assert!(extracted.tool_calls.is_empty());
    }

    #[test]
    fn test_tool_calls_replace_text() {
        let settings = Settings::default();
        let response = json!({"candidates": [{"content": {"parts": [
            {"functionCall": {"name": "lookup", "args": {"q": "rust"}}}
        ], "role": "model"}}]});
        let normalized =
            handle_native_response(response, "gemini-2.5-flash", false, &settings);
        let parts = normalized["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["functionCall"]["name"], "lookup");
    }

    #[test]
    fn test_search_citations_appended() {
        let mut settings = Settings::default();
        settings.show_search_link = true;
        let response = json!({"candidates": [{
            "content": {"parts": [{"text": "answer"}], "role": "model"},
            "groundingMetadata": {"groundingChunks": [
                {"web": {"title": "Example", "uri": "https://example.com"}}
            ]}
        }]});
        let extracted = extract_result(&response, "gemini-2.5-flash-search", false, &settings);
        assert!(extracted.text.contains("**Sources**"));
        assert!(extracted.text.contains("[Example](https://example.com)"));

        // No citations without the -search suffix.
        let plain = extract_result(&response, "gemini-2.5-flash", false, &settings);
        assert!(!plain.text.contains("**Sources**"));
    }

    #[test]
    fn test_inline_image_passthrough() {
        let settings = Settings::default();
        let response = json!({"candidates": [{"content": {"parts": [
            {"inlineData": {"mimeType": "image/png", "data": "Zm9v"}}
        ], "role": "model"}}]});
        let untouched =
            handle_native_response(response.clone(), "gemini-2.5-flash", true, &settings);
        assert_eq!(untouched, response);
    }

    #[test]
    fn test_thought_flag_carried() {
        let settings = Settings::default();
        let response = json!({"candidates": [{"content": {"parts": [
            {"text": "thinking...", "thought": true}
        ], "role": "model"}}]});
        let normalized =
            handle_native_response(response, "gemini-2.5-flash", true, &settings);
        assert_eq!(
            normalized["candidates"][0]["content"]["parts"][0]["thought"],
            true
        );
    }

    #[test]
    fn test_openai_completion_shape() {
        let settings = Settings::default();
        let response = json!({
            "candidates": [{"content": {"parts": [{"text": "hello"}], "role": "model"}}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5,
                              "totalTokenCount": 15}
        });
        let completion = openai_completion(&response, "gemini-2.5-flash", "stop", &settings);
        assert_eq!(completion["object"], "chat.completion");
        assert_eq!(completion["choices"][0]["message"]["content"], "hello");
        assert_eq!(completion["choices"][0]["finish_reason"], "stop");
        assert_eq!(completion["usage"]["total_tokens"], 15);
    }

    #[test]
    fn test_openai_completion_tool_calls() {
        let settings = Settings::default();
        let response = json!({"candidates": [{"content": {"parts": [
            {"functionCall": {"name": "lookup", "args": {"q": "rust"}}}
        ], "role": "model"}}]});
        let completion = openai_completion(&response, "gemini-2.5-flash", "stop", &settings);
        let message = &completion["choices"][0]["message"];
        assert!(message["content"].is_null());
        assert_eq!(message["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(completion["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn test_stream_chunk_shapes() {
        let settings = Settings::default();
        let meta = StreamMeta::new();

        let text_chunk = openai_stream_chunk(
            &chunk_with_text("hi"),
            "gemini-2.5-flash",
            None,
            &settings,
            &meta,
        );
        assert_eq!(text_chunk["object"], "chat.completion.chunk");
        assert_eq!(text_chunk["choices"][0]["delta"]["content"], "hi");
        assert!(text_chunk["choices"][0]["finish_reason"].is_null());
        assert!(text_chunk.get("usage").is_none());

        let heartbeat =
            openai_stream_chunk(&Value::Null, "gemini-2.5-flash", None, &settings, &meta);
        assert!(heartbeat["choices"][0]["delta"].get("content").is_none());

        let terminal = openai_stream_chunk(
            &json!({"usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3}}),
            "gemini-2.5-flash",
            Some("stop"),
            &settings,
            &meta,
        );
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
        assert_eq!(terminal["usage"]["total_tokens"], 10);
        assert_eq!(terminal["id"], text_chunk["id"]);
    }

    #[test]
    fn test_reasoning_delta_for_thought_chunk() {
        let settings = Settings::default();
        let meta = StreamMeta::new();
        let chunk = json!({"candidates": [{"content": {"parts": [
            {"text": "pondering", "thought": true}
        ], "role": "model"}}]});
        let out = openai_stream_chunk(&chunk, "gemini-2.5-flash", None, &settings, &meta);
        assert_eq!(out["choices"][0]["delta"]["reasoning_content"], "pondering");
        assert!(out["choices"][0]["delta"].get("content").is_none());
    }

    #[test]
    fn test_images_response() {
        let response = json!({"candidates": [{"content": {"parts": [
            {"inlineData": {"mimeType": "image/png", "data": "Zm9v"}}
        ], "role": "model"}}]});
        let b64 = openai_images_response(&response, None);
        assert_eq!(b64["data"][0]["b64_json"], "Zm9v");
        let url = openai_images_response(&response, Some("url"));
        assert_eq!(url["data"][0]["url"], "data:image/png;base64,Zm9v");
    }

    #[test]
    fn test_embeddings_response() {
        let native = json!({"embeddings": [
            {"values": [0.1, 0.2]},
            {"values": [0.3, 0.4]}
        ]});
        let out = openai_embeddings_response(&native, "text-embedding-004", 8);
        assert_eq!(out["data"].as_array().unwrap().len(), 2);
        assert_eq!(out["data"][1]["index"], 1);
        assert_eq!(out["usage"]["prompt_tokens"], 8);
    }
}
