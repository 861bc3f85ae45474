//! Token estimation for incoming payloads.

use serde_json::Value;

/// Estimate the token cost of a request payload.
///
/// Mixed-script heuristic: CJK characters (U+4E00..U+9FFF) count one token
/// each, everything else a quarter token. The sum is floored and clamped to a
/// minimum of 1. Walks every text-bearing field of both dialect shapes:
/// `contents[*].parts[*].text` and `requests[*].content.parts[*].text`
/// (native), `messages[*].content` as a string or text-part list
/// (OpenAI-compatible).
pub fn estimate_payload_tokens(payload: &Value) -> u64 {
    let mut total = 0.0f64;

    if let Some(contents) = payload.get("contents").and_then(|c| c.as_array()) {
        for content in contents {
            count_parts(&mut total, content.get("parts"));
        }
    }

    if let Some(requests) = payload.get("requests").and_then(|r| r.as_array()) {
        for request in requests {
            count_parts(&mut total, request.get("content").and_then(|c| c.get("parts")));
        }
    }

    if let Some(messages) = payload.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            match message.get("content") {
                Some(Value::String(text)) => count_text(&mut total, text),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                count_text(&mut total, text);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    (total as u64).max(1)
}

fn count_parts(total: &mut f64, parts: Option<&Value>) {
    let Some(parts) = parts.and_then(|p| p.as_array()) else {
        return;
    };
    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            count_text(total, text);
        }
    }
}

fn count_text(total: &mut f64, text: &str) {
    for ch in text.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&ch) {
            *total += 1.0;
        } else {
            *total += 0.25;
        }
    }
}

/// Extract the real total token count from an upstream response body.
/// Returns 0 when neither dialect's usage block is present.
pub fn actual_tokens_from_response(response: &Value) -> u64 {
    if let Some(total) = response
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|v| v.as_u64())
    {
        return total;
    }
    response
        .get("usageMetadata")
        .and_then(|u| u.get("totalTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}
