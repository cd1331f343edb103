use crate::tokens::{CompletionTokensDetails, PromptTokensDetails, ServerUsage};
use serde_json::Value;

/// One semantic unit parsed from a single line of the backend's tagged-line
/// stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Content(String),
    Reasoning(String),
    Finish(Option<String>),
    Usage(ServerUsage),
    Ignored,
}

/// Lines are keyed on a two-byte tag prefix. Blank lines and unknown tags
/// are skipped; malformed `e:`/`d:` payloads are logged and skipped so a
/// single bad line never aborts a response.
pub fn translate_line(line: &str) -> ParsedLine {
    if let Some(payload) = line.strip_prefix("0:") {
        return ParsedLine::Content(decode_text_payload(payload));
    }
    if let Some(payload) = line.strip_prefix("g:") {
        return ParsedLine::Reasoning(decode_text_payload(payload));
    }
    if let Some(payload) = line.strip_prefix("e:") {
        return match parse_finish_payload(payload) {
            Some(finish) => ParsedLine::Finish(finish),
            None => {
                tracing::warn!(payload, "skipping malformed finish event");
                ParsedLine::Ignored
            }
        };
    }
    if let Some(payload) = line.strip_prefix("d:") {
        return match parse_usage_payload(payload) {
            Some(usage) => ParsedLine::Usage(usage),
            None => {
                tracing::warn!(payload, "skipping malformed usage event");
                ParsedLine::Ignored
            }
        };
    }
    ParsedLine::Ignored
}

/// Content payloads are JSON string literals, but the backend is not always
/// careful about quoting. Try a strict unescape first (adding surrounding
/// quotes if missing), then fall back to a manual trim-and-replace.
fn decode_text_payload(payload: &str) -> String {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let quoted = if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed.to_string()
    } else {
        format!("\"{trimmed}\"")
    };
    if let Ok(decoded) = serde_json::from_str::<String>(&quoted) {
        return decoded;
    }
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    inner
        .replace("\\\"", "\"")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\r", "\r")
        .replace("\\\\", "\\")
}

fn parse_finish_payload(payload: &str) -> Option<Option<String>> {
    let value: Value = serde_json::from_str(payload.trim()).ok()?;
    let obj = value.as_object()?;
    Some(
        obj.get("finishReason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    )
}

/// The `d:` payload nests a `usage` object using either the current
/// `prompt_tokens`/`completion_tokens` names or the legacy
/// `input_tokens`/`output_tokens` ones, with optional per-category detail
/// objects under either scheme.
fn parse_usage_payload(payload: &str) -> Option<ServerUsage> {
    let value: Value = serde_json::from_str(payload.trim()).ok()?;
    let usage = value.get("usage")?.as_object()?;

    let prompt_tokens = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64());

    let prompt_details = usage
        .get("prompt_tokens_details")
        .or_else(|| usage.get("input_tokens_details"))
        .and_then(|v| v.as_object())
        .map(|details| PromptTokensDetails {
            cached_tokens: details.get("cached_tokens").and_then(|v| v.as_u64()),
            audio_tokens: details.get("audio_tokens").and_then(|v| v.as_u64()),
        });
    let completion_details = usage
        .get("completion_tokens_details")
        .or_else(|| usage.get("output_tokens_details"))
        .and_then(|v| v.as_object())
        .map(|details| CompletionTokensDetails {
            reasoning_tokens: details.get("reasoning_tokens").and_then(|v| v.as_u64()),
            audio_tokens: details.get("audio_tokens").and_then(|v| v.as_u64()),
            accepted_prediction_tokens: details
                .get("accepted_prediction_tokens")
                .and_then(|v| v.as_u64()),
            rejected_prediction_tokens: details
                .get("rejected_prediction_tokens")
                .and_then(|v| v.as_u64()),
        });

    Some(ServerUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        prompt_details,
        completion_details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_and_reasoning_lines_decode_quoted_payloads() {
        assert_eq!(
            translate_line("0:\"Hello\""),
            ParsedLine::Content("Hello".to_string())
        );
        assert_eq!(
            translate_line("g:\"thinking\\nhard\""),
            ParsedLine::Reasoning("thinking\nhard".to_string())
        );
    }

    #[test]
    fn unquoted_payloads_get_wrapped_before_decoding() {
        assert_eq!(
            translate_line("0:plain text"),
            ParsedLine::Content("plain text".to_string())
        );
    }

    #[test]
    fn malformed_quoting_falls_back_to_manual_unescape() {
        // Interior unescaped quote makes the strict path fail.
        assert_eq!(
            translate_line(r#"0:"say "hi"\nnow""#),
            ParsedLine::Content("say \"hi\"\nnow".to_string())
        );
    }

    #[test]
    fn finish_line_extracts_reason() {
        assert_eq!(
            translate_line(r#"e:{"finishReason":"stop"}"#),
            ParsedLine::Finish(Some("stop".to_string()))
        );
        assert_eq!(translate_line("e:{}"), ParsedLine::Finish(None));
    }

    #[test]
    fn usage_line_accepts_both_field_name_schemes() {
        let modern = translate_line(r#"d:{"usage":{"prompt_tokens":5,"completion_tokens":2}}"#);
        let ParsedLine::Usage(usage) = modern else {
            panic!("expected usage line");
        };
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total(), 7);

        let legacy = translate_line(r#"d:{"usage":{"input_tokens":8,"output_tokens":3}}"#);
        let ParsedLine::Usage(usage) = legacy else {
            panic!("expected usage line");
        };
        assert_eq!(usage.prompt_tokens, 8);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn usage_line_keeps_verbatim_total_and_detail_counts() {
        let line = r#"d:{"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":100,"completion_tokens_details":{"reasoning_tokens":4}}}"#;
        let ParsedLine::Usage(usage) = translate_line(line) else {
            panic!("expected usage line");
        };
        assert_eq!(usage.total(), 100);
        assert_eq!(
            usage.completion_details.as_ref().unwrap().reasoning_tokens,
            Some(4)
        );
    }

    #[test]
    fn malformed_event_payloads_are_ignored() {
        assert_eq!(translate_line("e:{not json"), ParsedLine::Ignored);
        assert_eq!(translate_line("d:{\"usage\":[]}"), ParsedLine::Ignored);
        assert_eq!(translate_line("d:{\"nope\":true}"), ParsedLine::Ignored);
    }

    #[test]
    fn unknown_tags_and_blank_lines_are_ignored() {
        assert_eq!(translate_line(""), ParsedLine::Ignored);
        assert_eq!(translate_line("x:whatever"), ParsedLine::Ignored);
        assert_eq!(translate_line("99:data"), ParsedLine::Ignored);
    }
}
