use crate::config::EstimatorTuning;
use crate::openai::ChatMessage;
use serde::{Deserialize, Serialize};

/// OpenAI-shaped usage block. `total_tokens` is never written directly:
/// every constructor and mutation recomputes it as the field sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_prediction_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_prediction_tokens: Option<u64>,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: None,
            completion_tokens_details: None,
        }
    }

    pub fn with_details(
        mut self,
        prompt_details: Option<PromptTokensDetails>,
        completion_details: Option<CompletionTokensDetails>,
    ) -> Self {
        self.prompt_tokens_details = prompt_details;
        self.completion_tokens_details = completion_details;
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
        self
    }
}

/// Usage as reported by the backend's `d:` event. `total_tokens` is kept
/// verbatim when present; reconciliation recomputes the final total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: Option<u64>,
    pub prompt_details: Option<PromptTokensDetails>,
    pub completion_details: Option<CompletionTokensDetails>,
}

impl ServerUsage {
    pub fn total(&self) -> u64 {
        self.total_tokens
            .unwrap_or(self.prompt_tokens + self.completion_tokens)
    }
}

/// Per-request token accumulator. One instance per request, owned by the
/// request's task; never stored on shared state.
pub struct TokenCounter {
    input_tokens: u64,
    output_tokens: u64,
    server_usage: Option<ServerUsage>,
    tuning: EstimatorTuning,
}

impl TokenCounter {
    pub fn new(tuning: EstimatorTuning) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            server_usage: None,
            tuning,
        }
    }

    pub fn record_prompt(&mut self, messages: &[ChatMessage]) {
        self.input_tokens = estimate_messages(messages, &self.tuning);
    }

    pub fn record_output(&mut self, text: &str) {
        self.output_tokens += estimate(text, &self.tuning);
    }

    pub fn record_server_usage(&mut self, usage: ServerUsage) {
        self.server_usage = Some(usage);
    }

    /// Tokens known right now; snapshots only ever grow within a request.
    pub fn snapshot(&self) -> Usage {
        Usage::new(self.input_tokens, self.output_tokens)
    }

    /// Reconciles the backend-reported usage against the local estimate and
    /// returns the final usage for the response.
    pub fn finalize(&self) -> Usage {
        match self.server_usage.as_ref() {
            Some(server) => reconcile(server, self.input_tokens, self.output_tokens, &self.tuning),
            None => self.snapshot(),
        }
    }
}

/// Single-pass heuristic: ASCII runs of non-space, non-punctuation
/// characters count as words, punctuation and non-ASCII characters count
/// individually. Floors the weighted sum; non-blank input scores at least 1.
pub fn estimate(text: &str, tuning: &EstimatorTuning) -> u64 {
    let mut score = 0.0f64;
    let mut in_word = false;
    for ch in text.chars() {
        if !ch.is_ascii() {
            score += tuning.wide_char_weight;
            in_word = false;
        } else if ch.is_ascii_whitespace() {
            in_word = false;
        } else if ch.is_ascii_punctuation() {
            score += tuning.punct_weight;
            in_word = false;
        } else if !in_word {
            score += tuning.word_weight;
            in_word = true;
        }
    }
    let floored = score.floor() as u64;
    if floored == 0 && !text.trim().is_empty() {
        1
    } else {
        floored
    }
}

pub fn estimate_messages(messages: &[ChatMessage], tuning: &EstimatorTuning) -> u64 {
    let mut total = tuning.per_request_overhead;
    for message in messages {
        total += estimate(&message.role, tuning);
        total += estimate(&message.content, tuning);
        total += tuning.per_message_overhead;
    }
    total
}

/// Guards against a backend that omits or badly misreports usage: each field
/// falls back to the local estimate when the server says 0 or deviates by
/// strictly more than the configured tolerance.
pub fn reconcile(
    server: &ServerUsage,
    local_prompt: u64,
    local_completion: u64,
    tuning: &EstimatorTuning,
) -> Usage {
    let prompt = reconcile_field(server.prompt_tokens, local_prompt, tuning.reconcile_tolerance);
    let completion = reconcile_field(
        server.completion_tokens,
        local_completion,
        tuning.reconcile_tolerance,
    );
    Usage::new(prompt, completion).with_details(
        server.prompt_details.clone(),
        server.completion_details.clone(),
    )
}

fn reconcile_field(server: u64, local: u64, tolerance: f64) -> u64 {
    if server == 0 && local > 0 {
        return local;
    }
    if server > 0 && local > 0 {
        let deviation = (server as f64 - local as f64) / local as f64;
        if deviation.abs() > tolerance {
            return local;
        }
    }
    server
}
