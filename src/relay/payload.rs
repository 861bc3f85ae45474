//! Native-dialect payload shaping.
//!
//! Decodes the model-name suffix grammar, assembles the tool object, applies
//! safety settings and the thinking-budget rules, and filters malformed
//! content entries before the payload goes upstream.

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

use crate::config::Settings;
use crate::logger;

/// JSON Schema keywords the upstream rejects inside function declarations.
const UNSUPPORTED_SCHEMA_FIELDS: &[&str] = &[
    "exclusiveMaximum",
    "exclusiveMinimum",
    "const",
    "examples",
    "contentEncoding",
    "contentMediaType",
    "if",
    "then",
    "else",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
    "definitions",
    "$schema",
    "$id",
    "$ref",
    "$comment",
    "readOnly",
    "writeOnly",
];

pub const LEGACY_EXPERIMENTAL_MODEL: &str = "gemini-2.0-flash-exp";

/// Relaxed safety list for the legacy experimental model.
static LEGACY_EXPERIMENTAL_SAFETY_SETTINGS: Lazy<Value> = Lazy::new(|| {
    json!([
        {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "OFF"}
    ])
});

/// Features toggled by the model-name suffix grammar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelFeatures {
    pub real: String,
    pub search: bool,
    pub image: bool,
    pub non_thinking: bool,
}

/// Strip `-search`, `-image`/`-image-generation` and `-non-thinking` in any
/// combination, recording which features they toggle.
pub fn decode_model(model: &str) -> ModelFeatures {
    let mut rest = model;
    let mut features = ModelFeatures::default();
    loop {
        if let Some(stripped) = rest.strip_suffix("-search") {
            features.search = true;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_suffix("-image-generation") {
            features.image = true;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_suffix("-image") {
            features.image = true;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_suffix("-non-thinking") {
            features.non_thinking = true;
            rest = stripped;
        } else {
            break;
        }
    }
    features.real = rest.to_string();
    features
}

/// The model name with the suffix grammar stripped.
pub fn real_model(model: &str) -> String {
    decode_model(model).real
}

/// Remove schema keywords the upstream rejects, recursively.
pub fn clean_json_schema(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let cleaned: Map<String, Value> = obj
                .iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), clean_json_schema(value)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_json_schema).collect()),
        other => other.clone(),
    }
}

fn part_has_media(part: &Value) -> bool {
    part.get("image_url").is_some()
        || part.get("inline_data").is_some()
        || part.get("inlineData").is_some()
}

pub fn has_image_parts(contents: Option<&Value>) -> bool {
    let Some(contents) = contents.and_then(|c| c.as_array()) else {
        return false;
    };
    contents.iter().any(|content| {
        content
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|parts| parts.iter().any(part_has_media))
            .unwrap_or(false)
    })
}

pub fn has_function_call(contents: Option<&Value>) -> bool {
    let Some(contents) = contents.and_then(|c| c.as_array()) else {
        return false;
    };
    contents.iter().any(|content| {
        content
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|parts| parts.iter().any(|part| part.get("functionCall").is_some()))
            .unwrap_or(false)
    })
}

/// Structured JSON output and tools are mutually exclusive upstream.
pub fn is_structured_output(payload: &Value) -> bool {
    payload
        .get("generationConfig")
        .and_then(|c| c.get("responseMimeType"))
        .and_then(|m| m.as_str())
        == Some("application/json")
}

/// Assemble at most one tool object from the caller's tools and the
/// configured built-ins. Built-ins are suppressed alongside function
/// declarations and for structured-output requests.
pub fn build_tools(model: &str, payload: &Value, settings: &Settings) -> Vec<Value> {
    let mut tool = Map::new();

    let supplied = match payload.get("tools") {
        Some(Value::Object(obj)) => vec![Value::Object(obj.clone())],
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let mut declarations: Vec<Value> = Vec::new();
    for item in &supplied {
        let Some(obj) = item.as_object() else {
            continue;
        };
        for (key, value) in obj {
            if key == "functionDeclarations" {
                if let Some(list) = value.as_array() {
                    declarations.extend(list.iter().map(clean_json_schema));
                }
            } else {
                tool.insert(key.clone(), value.clone());
            }
        }
    }
    if !declarations.is_empty() {
        tool.insert(
            "functionDeclarations".to_string(),
            Value::Array(declarations),
        );
    }

    let features = decode_model(model);
    if !is_structured_output(payload) {
        if settings.tools_code_execution_enabled
            && !(features.search || model.contains("-thinking") || features.image)
            && !has_image_parts(payload.get("contents"))
        {
            tool.insert("codeExecution".to_string(), json!({}));
        }
        if features.search {
            tool.insert("googleSearch".to_string(), json!({}));
        }
        if settings.url_context_enabled
            && settings.url_context_models.iter().any(|m| m == &features.real)
        {
            tool.insert("urlContext".to_string(), json!({}));
        }
    }

    // The upstream rejects built-in tools combined with function calling.
    let has_declarations = tool
        .get("functionDeclarations")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    if has_declarations || has_function_call(payload.get("contents")) {
        tool.remove("googleSearch");
        tool.remove("codeExecution");
        tool.remove("urlContext");
    }

    if tool.is_empty() {
        Vec::new()
    } else {
        vec![Value::Object(tool)]
    }
}

/// Drop content entries whose parts list is empty after removing falsy
/// entries; the upstream rejects such messages.
pub fn filter_empty_parts(contents: Option<&Value>) -> Value {
    let Some(contents) = contents.and_then(|c| c.as_array()) else {
        return Value::Array(Vec::new());
    };

    let filtered: Vec<Value> = contents
        .iter()
        .filter_map(|content| {
            let obj = content.as_object()?;
            let parts = obj.get("parts")?.as_array()?;
            let valid: Vec<Value> = parts
                .iter()
                .filter(|part| part.as_object().map(|o| !o.is_empty()).unwrap_or(false))
                .cloned()
                .collect();
            if valid.is_empty() {
                return None;
            }
            let mut kept = obj.clone();
            kept.insert("parts".to_string(), Value::Array(valid));
            Some(Value::Object(kept))
        })
        .collect();

    Value::Array(filtered)
}

pub fn safety_settings_for(model: &str, settings: &Settings) -> Value {
    if real_model(model) == LEGACY_EXPERIMENTAL_MODEL {
        return LEGACY_EXPERIMENTAL_SAFETY_SETTINGS.clone();
    }
    serde_json::to_value(&settings.safety_settings).unwrap_or_else(|_| json!([]))
}

fn apply_thinking_config(
    model: &str,
    features: &ModelFeatures,
    config: &mut Map<String, Value>,
    settings: &Settings,
) {
    // A client-provided thinking config always wins.
    if config
        .get("thinkingConfig")
        .map(|v| !v.is_null())
        .unwrap_or(false)
    {
        return;
    }
    config.remove("thinkingConfig");

    if features.non_thinking {
        let budget = if model.contains("gemini-2.5-pro") { 128 } else { 0 };
        config.insert("thinkingConfig".to_string(), json!({"thinkingBudget": budget}));
    } else if let Some(budget) = settings.thinking_budget_map.get(&features.real) {
        let thinking = if settings.show_thinking_process {
            json!({"thinkingBudget": budget, "includeThoughts": true})
        } else {
            json!({"thinkingBudget": budget})
        };
        config.insert("thinkingConfig".to_string(), thinking);
    }
}

/// Build the upstream payload for a native-dialect request.
pub fn build_payload(model: &str, request: &Value, settings: &Settings) -> Value {
    let features = decode_model(model);
    let mut payload = Map::new();

    payload.insert(
        "contents".to_string(),
        filter_empty_parts(request.get("contents")),
    );

    let tools = build_tools(model, request, settings);
    if !tools.is_empty() {
        payload.insert("tools".to_string(), Value::Array(tools));
    }

    payload.insert(
        "safetySettings".to_string(),
        safety_settings_for(model, settings),
    );

    let mut generation_config = request
        .get("generationConfig")
        .and_then(|c| c.as_object())
        .cloned()
        .unwrap_or_default();

    // Leave the output cap to the upstream default unless the caller set a
    // positive value.
    match generation_config.get("maxOutputTokens") {
        None => {}
        Some(value) => match value.as_i64() {
            Some(v) if v > 0 => {}
            Some(v) => {
                logger::warn(
                    "payload",
                    &format!("Invalid maxOutputTokens value {}, dropping it", v),
                );
                generation_config.remove("maxOutputTokens");
            }
            None => {
                generation_config.remove("maxOutputTokens");
            }
        },
    }

    if let Some(instruction) = request.get("systemInstruction") {
        if !instruction.is_null() && !features.image {
            payload.insert("systemInstruction".to_string(), instruction.clone());
        }
    }

    if features.image {
        generation_config.insert("responseModalities".to_string(), json!(["Text", "Image"]));
    }

    apply_thinking_config(model, &features, &mut generation_config, settings);
    payload.insert("generationConfig".to_string(), Value::Object(generation_config));

    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_model_suffixes() {
        let plain = decode_model("gemini-2.5-flash");
        assert_eq!(plain.real, "gemini-2.5-flash");
        assert!(!plain.search && !plain.image && !plain.non_thinking);

        let search = decode_model("gemini-2.5-flash-search");
        assert!(search.search);
        assert_eq!(search.real, "gemini-2.5-flash");

        let combined = decode_model("gemini-2.5-flash-search-non-thinking");
        assert!(combined.search && combined.non_thinking);
        assert_eq!(combined.real, "gemini-2.5-flash");

        let image = decode_model("gemini-2.0-flash-exp-image-generation");
        assert!(image.image);
        assert_eq!(image.real, "gemini-2.0-flash-exp");
    }

    #[test]
    fn test_clean_json_schema() {
        let schema = json!({
            "type": "object",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "properties": {
                "count": {"type": "integer", "exclusiveMinimum": 0},
                "choice": {"oneOf": [{"type": "string"}, {"type": "number"}]}
            },
            "allOf": [{"required": ["count"]}]
        });
        let cleaned = clean_json_schema(&schema);
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("allOf").is_none());
        assert!(cleaned["properties"]["count"].get("exclusiveMinimum").is_none());
        assert!(cleaned["properties"]["choice"].get("oneOf").is_none());
        assert_eq!(cleaned["type"], "object");
    }

    #[test]
    fn test_function_declarations_suppress_builtins() {
        let mut settings = Settings::default();
        settings.tools_code_execution_enabled = true;
        settings.url_context_enabled = true;
        settings.url_context_models = vec!["gemini-2.5-flash".to_string()];

        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "tools": [{"functionDeclarations": [{"name": "lookup", "parameters": {"$ref": "#/x"}}]}]
        });
        let tools = build_tools("gemini-2.5-flash-search", &payload, &settings);
        assert_eq!(tools.len(), 1);
        let tool = tools[0].as_object().unwrap();
        assert!(tool.get("googleSearch").is_none());
        assert!(tool.get("codeExecution").is_none());
        assert!(tool.get("urlContext").is_none());
        let declarations = tool["functionDeclarations"].as_array().unwrap();
        assert_eq!(declarations[0]["name"], "lookup");
        assert!(declarations[0]["parameters"].get("$ref").is_none());
    }

    #[test]
    fn test_history_function_call_suppresses_builtins() {
        let settings = Settings::default();
        let payload = json!({
            "contents": [
                {"role": "model", "parts": [{"functionCall": {"name": "lookup", "args": {}}}]},
                {"role": "user", "parts": [{"text": "and then?"}]}
            ]
        });
        let tools = build_tools("gemini-2.5-flash-search", &payload, &settings);
        assert!(tools.is_empty());
    }

    #[test]
    fn test_structured_output_suppresses_builtins() {
        let mut settings = Settings::default();
        settings.tools_code_execution_enabled = true;
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"responseMimeType": "application/json"}
        });
        let tools = build_tools("gemini-2.5-flash-search", &payload, &settings);
        assert!(tools.is_empty());
    }

    #[test]
    fn test_code_execution_gates() {
        let mut settings = Settings::default();
        settings.tools_code_execution_enabled = true;

        let plain = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        let tools = build_tools("gemini-2.5-flash", &plain, &settings);
        assert!(tools[0].get("codeExecution").is_some());

        // Media parts disable code execution.
        let with_image = json!({"contents": [{"role": "user", "parts": [
            {"text": "hi"},
            {"inlineData": {"mimeType": "image/png", "data": "xxxx"}}
        ]}]});
        assert!(build_tools("gemini-2.5-flash", &with_image, &settings).is_empty());

        // So do search and image variants.
        let search_tools = build_tools("gemini-2.5-flash-search", &plain, &settings);
        assert!(search_tools[0].get("codeExecution").is_none());
        assert!(search_tools[0].get("googleSearch").is_some());
    }

    #[test]
    fn test_filter_empty_parts() {
        let contents = json!([
            {"role": "user", "parts": [{"text": "keep"}, {}]},
            {"role": "model", "parts": []},
            {"role": "user"},
            {"role": "user", "parts": [{}]}
        ]);
        let filtered = filter_empty_parts(Some(&contents));
        let kept = filtered.as_array().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["parts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_build_payload_max_output_tokens() {
        let settings = Settings::default();
        let without = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        let payload = build_payload("gemini-2.5-flash", &without, &settings);
        assert!(payload["generationConfig"].get("maxOutputTokens").is_none());

        let negative = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": -5}
        });
        let payload = build_payload("gemini-2.5-flash", &negative, &settings);
        assert!(payload["generationConfig"].get("maxOutputTokens").is_none());

        let positive = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": 2048}
        });
        let payload = build_payload("gemini-2.5-flash", &positive, &settings);
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_thinking_budget_rules() {
        let mut settings = Settings::default();
        settings
            .thinking_budget_map
            .insert("gemini-2.5-flash".to_string(), 4096);
        settings.show_thinking_process = true;

        let request = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});

        let budgeted = build_payload("gemini-2.5-flash", &request, &settings);
        assert_eq!(
            budgeted["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            4096
        );
        assert_eq!(
            budgeted["generationConfig"]["thinkingConfig"]["includeThoughts"],
            true
        );

        let non_thinking = build_payload("gemini-2.5-flash-non-thinking", &request, &settings);
        assert_eq!(
            non_thinking["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            0
        );

        let pro = build_payload("gemini-2.5-pro-non-thinking", &request, &settings);
        assert_eq!(
            pro["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            128
        );

        // Client-provided config passes through untouched.
        let explicit = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 1}}
        });
        let payload = build_payload("gemini-2.5-flash", &explicit, &settings);
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            1
        );
    }

    #[test]
    fn test_image_model_payload() {
        let settings = Settings::default();
        let request = json!({
            "contents": [{"role": "user", "parts": [{"text": "draw a cat"}]}],
            "systemInstruction": {"parts": [{"text": "be brief"}]}
        });
        let payload = build_payload("gemini-2.0-flash-exp-image", &request, &settings);
        assert!(payload.get("systemInstruction").is_none());
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["Text", "Image"])
        );
    }

    #[test]
    fn test_legacy_model_safety_settings() {
        let settings = Settings::default();
        let legacy = safety_settings_for("gemini-2.0-flash-exp", &settings);
        assert!(legacy
            .as_array()
            .unwrap()
            .iter()
            .all(|s| s["threshold"] == "OFF"));
        let default = safety_settings_for("gemini-2.5-flash", &settings);
        assert!(default
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["threshold"] == "BLOCK_NONE"));
    }
}
