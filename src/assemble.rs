use crate::cache::ResponseCache;
use crate::error::{AppError, AppResult};
use crate::openai::{build_completion, completion_id, now_ts};
use crate::protocol::{ParsedLine, translate_line};
use crate::tokens::TokenCounter;
use axum::http::StatusCode;
use serde_json::Value;

/// Buffers the full upstream body, folds every tagged line into one
/// `chat.completion` object, and stores it in the cache before returning.
pub async fn assemble_response(
    upstream: reqwest::Response,
    mut counter: TokenCounter,
    model: &str,
    cache: &dyn ResponseCache,
    fingerprint: &str,
) -> AppResult<Value> {
    let body = upstream.text().await.map_err(|err| {
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            format!("failed to read backend body: {err}"),
        )
    })?;

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason: Option<String> = None;
    for line in body.lines() {
        match translate_line(line) {
            ParsedLine::Content(text) => {
                counter.record_output(&text);
                content.push_str(&text);
            }
            ParsedLine::Reasoning(text) => {
                counter.record_output(&text);
                reasoning.push_str(&text);
            }
            ParsedLine::Finish(reason) => {
                if let Some(reason) = reason {
                    finish_reason = Some(reason);
                }
            }
            ParsedLine::Usage(usage) => counter.record_server_usage(usage),
            ParsedLine::Ignored => {}
        }
    }

    let usage = counter.finalize();
    let response = build_completion(
        &completion_id(),
        now_ts(),
        model,
        &content,
        &reasoning,
        finish_reason.as_deref().unwrap_or("stop"),
        &usage,
    );
    cache.insert(fingerprint, response.clone());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, NoopCache};
    use crate::config::EstimatorTuning;
    use crate::openai::ChatMessage;
    use std::time::Duration;

    fn counter_for(content: &str) -> TokenCounter {
        let mut counter = TokenCounter::new(EstimatorTuning::default());
        counter.record_prompt(&[ChatMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }]);
        counter
    }

    fn upstream(body: &str) -> reqwest::Response {
        reqwest::Response::from(axum::http::Response::new(body.to_string()))
    }

    #[tokio::test]
    async fn assembles_content_finish_and_usage() {
        let body = concat!(
            "0:\"Hello\"\n",
            "0:\" world\"\n",
            "e:{\"finishReason\":\"stop\"}\n",
            "d:{\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n",
        );
        // Local estimates land within tolerance of the server report, so
        // the server figures stand.
        let mut counter = TokenCounter::new(EstimatorTuning::default());
        counter.record_prompt(&[ChatMessage {
            role: "u".to_string(),
            content: "a".to_string(),
        }]);
        let value = assemble_response(upstream(body), counter, "gpt-4o", &NoopCache, "fp")
            .await
            .expect("assemble");
        assert_eq!(value["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"]["prompt_tokens"], 9);
        assert_eq!(value["usage"]["completion_tokens"], 2);
        assert_eq!(value["usage"]["total_tokens"], 11);
    }

    #[tokio::test]
    async fn reasoning_lines_populate_reasoning_content() {
        let body = "g:\"step one\"\n0:\"answer\"\n";
        let value = assemble_response(upstream(body), counter_for("hi"), "m", &NoopCache, "fp")
            .await
            .expect("assemble");
        assert_eq!(
            value["choices"][0]["message"]["reasoning_content"],
            "step one"
        );
        assert_eq!(value["choices"][0]["message"]["content"], "answer");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn stores_the_response_under_the_fingerprint() {
        let cache = MemoryCache::new(Duration::from_secs(60), 8);
        let body = "0:\"cached\"\n";
        let value = assemble_response(upstream(body), counter_for("hi"), "m", &cache, "fp-1")
            .await
            .expect("assemble");
        assert_eq!(cache.get("fp-1"), Some(value));
    }

    #[tokio::test]
    async fn usage_total_matches_field_sum_without_server_report() {
        let body = "0:\"one two three\"\n";
        let value = assemble_response(upstream(body), counter_for("hi"), "m", &NoopCache, "fp")
            .await
            .expect("assemble");
        let usage = &value["usage"];
        assert_eq!(
            usage["total_tokens"].as_u64().unwrap(),
            usage["prompt_tokens"].as_u64().unwrap() + usage["completion_tokens"].as_u64().unwrap()
        );
    }
}
