use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModelMapEntry {
    pub external_model: String,
    pub backend_model: String,
}

/// Tunables for the heuristic token estimator and server-usage
/// reconciliation. The defaults are deliberate approximations, not a
/// tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct EstimatorTuning {
    pub word_weight: f64,
    pub punct_weight: f64,
    pub wide_char_weight: f64,
    pub per_message_overhead: u64,
    pub per_request_overhead: u64,
    pub reconcile_tolerance: f64,
}

impl Default for EstimatorTuning {
    fn default() -> Self {
        Self {
            word_weight: 1.3,
            punct_weight: 1.0,
            wide_char_weight: 1.5,
            per_message_overhead: 4,
            per_request_overhead: 3,
            reconcile_tolerance: 0.20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backend_base_url: String,
    pub backend_token: Option<String>,
    pub caller_ids: Vec<String>,
    pub fallback_caller_id: String,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub flush_interval_ms: u64,
    pub read_buffer_bytes: usize,
    pub max_line_bytes: usize,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub rate_limit_per_second: u32,
    pub rate_limit_burst: u32,
    pub rate_limit_max_wait_ms: u64,
    pub proxy_urls: Vec<String>,
    pub model_map: Vec<ModelMapEntry>,
    pub estimator: EstimatorTuning,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend_base_url: "http://127.0.0.1:9000".to_string(),
            backend_token: None,
            caller_ids: Vec::new(),
            fallback_caller_id: "linegate-default".to_string(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout_ms: 120_000,
            heartbeat_interval_ms: 15_000,
            flush_interval_ms: 100,
            read_buffer_bytes: 256 * 1024,
            max_line_bytes: 4 * 1024 * 1024,
            cache_enabled: true,
            cache_ttl_secs: 300,
            cache_max_entries: 1024,
            rate_limit_per_second: 0,
            rate_limit_burst: 0,
            rate_limit_max_wait_ms: 2_000,
            proxy_urls: Vec::new(),
            model_map: Vec::new(),
            estimator: EstimatorTuning::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend_base_url: env_string("LINEGATE_BACKEND_URL")
                .unwrap_or(defaults.backend_base_url),
            backend_token: env_string("LINEGATE_BACKEND_TOKEN"),
            caller_ids: env_list("LINEGATE_CALLER_IDS"),
            fallback_caller_id: env_string("LINEGATE_FALLBACK_CALLER_ID")
                .unwrap_or(defaults.fallback_caller_id),
            max_attempts: env_parse("LINEGATE_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            backoff_base_ms: env_parse("LINEGATE_BACKOFF_BASE_MS")
                .unwrap_or(defaults.backoff_base_ms),
            backoff_max_ms: env_parse("LINEGATE_BACKOFF_MAX_MS").unwrap_or(defaults.backoff_max_ms),
            request_timeout_ms: env_parse("LINEGATE_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            heartbeat_interval_ms: env_parse("LINEGATE_HEARTBEAT_MS")
                .unwrap_or(defaults.heartbeat_interval_ms),
            flush_interval_ms: env_parse("LINEGATE_FLUSH_MS").unwrap_or(defaults.flush_interval_ms),
            read_buffer_bytes: env_parse("LINEGATE_READ_BUFFER_BYTES")
                .unwrap_or(defaults.read_buffer_bytes),
            max_line_bytes: env_parse("LINEGATE_MAX_LINE_BYTES").unwrap_or(defaults.max_line_bytes),
            cache_enabled: env_parse("LINEGATE_CACHE_ENABLED").unwrap_or(defaults.cache_enabled),
            cache_ttl_secs: env_parse("LINEGATE_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl_secs),
            cache_max_entries: env_parse("LINEGATE_CACHE_MAX_ENTRIES")
                .unwrap_or(defaults.cache_max_entries),
            rate_limit_per_second: env_parse("LINEGATE_RATE_LIMIT_RPS")
                .unwrap_or(defaults.rate_limit_per_second),
            rate_limit_burst: env_parse("LINEGATE_RATE_LIMIT_BURST")
                .unwrap_or(defaults.rate_limit_burst),
            rate_limit_max_wait_ms: env_parse("LINEGATE_RATE_LIMIT_MAX_WAIT_MS")
                .unwrap_or(defaults.rate_limit_max_wait_ms),
            proxy_urls: env_list("LINEGATE_PROXIES"),
            model_map: parse_model_map(&env_string("LINEGATE_MODEL_MAP").unwrap_or_default()),
            estimator: EstimatorTuning::default(),
        }
    }
}

/// Parses `external=backend` pairs separated by commas; malformed pairs are
/// skipped.
pub fn parse_model_map(raw: &str) -> Vec<ModelMapEntry> {
    raw.split(',')
        .filter_map(|pair| {
            let (external, backend) = pair.split_once('=')?;
            let external = external.trim();
            let backend = backend.trim();
            if external.is_empty() || backend.is_empty() {
                return None;
            }
            Some(ModelMapEntry {
                external_model: external.to_string(),
                backend_model: backend.to_string(),
            })
        })
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    env_string(name)
        .map(|raw| {
            raw.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_map_parses_pairs_and_skips_garbage() {
        let entries = parse_model_map("gpt-4o=prime-v2, deep-1 = prime-r1 ,broken,=x,y=");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].external_model, "gpt-4o");
        assert_eq!(entries[0].backend_model, "prime-v2");
        assert_eq!(entries[1].external_model, "deep-1");
        assert_eq!(entries[1].backend_model, "prime-r1");
    }

    #[test]
    fn empty_model_map_yields_no_entries() {
        assert!(parse_model_map("").is_empty());
    }
}
