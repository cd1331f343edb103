use crate::error::{AppError, AppResult};
use crate::tokens::Usage;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Validates the inbound body by hand so malformed requests get OpenAI-shaped
/// 400s instead of serde's deserialization messages. Unknown fields are
/// ignored.
pub fn parse_chat_request(body: &Value) -> AppResult<ChatRequest> {
    let obj = body.as_object().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "body must be object",
        )
    })?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AppError::new(StatusCode::BAD_REQUEST, "invalid_request", "missing model")
                .with_param("model")
        })?
        .to_string();

    let raw_messages = obj
        .get("messages")
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "messages must be a non-empty array",
            )
            .with_param("messages")
        })?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    for (index, raw) in raw_messages.iter().enumerate() {
        let role = raw
            .get("role")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty());
        let content = raw
            .get("content")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty());
        match (role, content) {
            (Some(role), Some(content)) => messages.push(ChatMessage {
                role: role.to_string(),
                content: content.to_string(),
            }),
            _ => {
                return Err(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    format!("messages[{index}] must have non-empty role and content"),
                )
                .with_param("messages"));
            }
        }
    }

    let stream = obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    Ok(ChatRequest {
        model,
        messages,
        stream,
    })
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn build_completion(
    id: &str,
    created: i64,
    model: &str,
    content: &str,
    reasoning: &str,
    finish_reason: &str,
    usage: &Usage,
) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": content,
    });
    if !reasoning.is_empty() {
        message["reasoning_content"] = Value::String(reasoning.to_string());
    }
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": usage,
    })
}

pub fn build_chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
    usage: &Usage,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
        "usage": usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_minimal_request_and_ignores_unknown_fields() {
        let req = parse_chat_request(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.7,
            "unknown_knob": true,
        }))
        .expect("parse");
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.messages.len(), 1);
        assert!(!req.stream);
    }

    #[test]
    fn parse_rejects_empty_content() {
        let err = parse_chat_request(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": ""}],
        }))
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.param.as_deref(), Some("messages"));
    }

    #[test]
    fn parse_rejects_missing_model_and_empty_messages() {
        assert!(parse_chat_request(&json!({"messages": [{"role":"u","content":"c"}]})).is_err());
        assert!(parse_chat_request(&json!({"model": "m", "messages": []})).is_err());
    }

    #[test]
    fn completion_omits_reasoning_when_empty() {
        let usage = Usage::new(1, 2);
        let value = build_completion("id", 1, "m", "hello", "", "stop", &usage);
        assert!(value["choices"][0]["message"].get("reasoning_content").is_none());
        let value = build_completion("id", 1, "m", "hello", "thought", "stop", &usage);
        assert_eq!(
            value["choices"][0]["message"]["reasoning_content"],
            json!("thought")
        );
    }
}
