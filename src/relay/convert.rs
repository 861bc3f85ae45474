//! OpenAI-dialect request conversion.
//!
//! Turns OpenAI chat requests into the native upstream shape: messages become
//! `contents`, system messages fold into `systemInstruction`, data-URL images
//! become inline data, and tool definitions become function declarations.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::config::Settings;

use super::payload;

static DATA_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:([^;]+);base64,(.+)$").expect("data URL pattern"));

pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let caps = DATA_URL_RE.captures(url.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

fn content_to_parts(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::String(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"text": text})]
            }
        }
        Some(Value::Array(items)) => {
            let mut parts = Vec::new();
            for item in items {
                match item.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            parts.push(json!({"text": text}));
                        }
                    }
                    "image_url" => {
                        let url = item
                            .get("image_url")
                            .and_then(|u| u.get("url"))
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some((mime, data)) = parse_data_url(url) {
                            parts.push(json!({
                                "inlineData": {"mimeType": mime, "data": data}
                            }));
                        } else if !url.is_empty() {
                            parts.push(json!({"text": format!("[Image] {}", url)}));
                        }
                    }
                    _ => {}
                }
            }
            parts
        }
        Some(Value::Object(obj)) => obj
            .get("text")
            .and_then(|t| t.as_str())
            .map(|text| vec![json!({"text": text})])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn text_of(content: Option<&Value>) -> String {
    content_to_parts(content)
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tool_calls_to_parts(calls: &Value) -> Vec<Value> {
    let Some(calls) = calls.as_array() else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|call| {
            let function = call.get("function")?;
            let name = function.get("name").and_then(|n| n.as_str())?;
            let raw_args = function
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("");
            let args = serde_json::from_str::<Value>(raw_args)
                .unwrap_or_else(|_| Value::String(raw_args.to_string()));
            Some(json!({"functionCall": {"name": name, "args": args}}))
        })
        .collect()
}

/// Convert OpenAI chat messages into native `contents` plus an optional
/// `systemInstruction`.
pub fn convert_messages(messages: &[Value]) -> (Vec<Value>, Option<Value>) {
    let mut contents = Vec::new();
    let mut system_parts: Vec<String> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");

        if role.eq_ignore_ascii_case("system") {
            let text = text_of(message.get("content"));
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }

        if role.eq_ignore_ascii_case("tool") || role.eq_ignore_ascii_case("function") {
            let name = message
                .get("name")
                .or_else(|| message.get("tool_call_id"))
                .and_then(|n| n.as_str())
                .unwrap_or("tool");
            let raw = text_of(message.get("content"));
            let response = serde_json::from_str::<Value>(&raw)
                .unwrap_or_else(|_| json!({"result": raw}));
            contents.push(json!({
                "role": "user",
                "parts": [{"functionResponse": {"name": name, "response": response}}]
            }));
            continue;
        }

        let gem_role = if role.eq_ignore_ascii_case("assistant") {
            "model"
        } else {
            "user"
        };
        let mut parts = content_to_parts(message.get("content"));
        if let Some(calls) = message.get("tool_calls") {
            parts.extend(tool_calls_to_parts(calls));
        }
        if parts.is_empty() {
            parts.push(json!({"text": ""}));
        }
        contents.push(json!({"role": gem_role, "parts": parts}));
    }

    let instruction = if system_parts.is_empty() {
        None
    } else {
        Some(json!({
            "role": "system",
            "parts": [{"text": system_parts.join("\n\n")}]
        }))
    };
    (contents, instruction)
}

/// Map OpenAI tool definitions into native supplied-tool objects. A function
/// named `googleSearch` is a client convention for enabling the built-in
/// search tool rather than a real declaration.
fn openai_tools_to_native(tools: &Value) -> Vec<Value> {
    let Some(tools) = tools.as_array() else {
        return Vec::new();
    };

    let mut declarations: Vec<Value> = Vec::new();
    let mut wants_search = false;
    let mut seen: Vec<String> = Vec::new();

    for tool in tools {
        if tool.get("type").and_then(|t| t.as_str()) != Some("function") {
            continue;
        }
        let Some(function) = tool.get("function") else {
            continue;
        };
        let Some(name) = function.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        if name == "googleSearch" {
            wants_search = true;
            continue;
        }
        if seen.iter().any(|s| s == name) {
            continue;
        }
        seen.push(name.to_string());

        let mut declaration = function.clone();
        // An object schema without properties is rejected upstream.
        let empty_object_params = declaration
            .get("parameters")
            .map(|p| {
                p.get("type").and_then(|t| t.as_str()) == Some("object")
                    && p.get("properties")
                        .and_then(|props| props.as_object())
                        .map(|props| props.is_empty())
                        .unwrap_or(true)
            })
            .unwrap_or(false);
        if empty_object_params {
            if let Some(obj) = declaration.as_object_mut() {
                obj.remove("parameters");
            }
        }
        declarations.push(payload::clean_json_schema(&declaration));
    }

    let mut supplied = Vec::new();
    if !declarations.is_empty() {
        supplied.push(json!({"functionDeclarations": declarations}));
    }
    if wants_search {
        supplied.push(json!({"googleSearch": {}}));
    }
    supplied
}

/// Build the native upstream payload from an OpenAI-compatible chat request.
pub fn build_chat_payload(request: &Value, settings: &Settings) -> Value {
    let model = request.get("model").and_then(|m| m.as_str()).unwrap_or("");
    let messages = request
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();
    let (contents, instruction) = convert_messages(&messages);

    let mut intermediate = Map::new();
    intermediate.insert("contents".to_string(), Value::Array(contents));

    if let Some(tools) = request.get("tools") {
        let supplied = openai_tools_to_native(tools);
        if !supplied.is_empty() {
            intermediate.insert("tools".to_string(), Value::Array(supplied));
        }
    }

    let mut config = Map::new();
    if let Some(temperature) = request.get("temperature") {
        if !temperature.is_null() {
            config.insert("temperature".to_string(), temperature.clone());
        }
    }
    if let Some(top_p) = request.get("top_p") {
        if !top_p.is_null() {
            config.insert("topP".to_string(), top_p.clone());
        }
    }
    if let Some(top_k) = request.get("top_k") {
        if !top_k.is_null() {
            config.insert("topK".to_string(), top_k.clone());
        }
    }
    if let Some(seed) = request.get("seed") {
        if !seed.is_null() {
            config.insert("seed".to_string(), seed.clone());
        }
    }
    if let Some(stop) = request.get("stop") {
        match stop {
            Value::String(text) => {
                config.insert("stopSequences".to_string(), json!([text]));
            }
            Value::Array(_) => {
                config.insert("stopSequences".to_string(), stop.clone());
            }
            _ => {}
        }
    }
    if let Some(max_tokens) = request
        .get("max_tokens")
        .or_else(|| request.get("max_completion_tokens"))
    {
        if !max_tokens.is_null() {
            config.insert("maxOutputTokens".to_string(), max_tokens.clone());
        }
    }
    if let Some(n) = request.get("n").and_then(|n| n.as_i64()) {
        if n > 0 {
            config.insert("candidateCount".to_string(), json!(n));
        }
    }
    if request
        .get("response_format")
        .and_then(|f| f.get("type"))
        .and_then(|t| t.as_str())
        == Some("json_object")
    {
        config.insert(
            "responseMimeType".to_string(),
            json!("application/json"),
        );
    }
    intermediate.insert("generationConfig".to_string(), Value::Object(config));

    if let Some(instruction) = instruction {
        intermediate.insert("systemInstruction".to_string(), instruction);
    }

    payload::build_payload(model, &Value::Object(intermediate), settings)
}
