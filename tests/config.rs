use linegate::config::{EstimatorTuning, GatewayConfig, parse_model_map};

#[test]
fn default_config_is_runnable() {
    let config = GatewayConfig::default();
    assert!(config.max_attempts >= 1);
    assert!(config.backoff_base_ms <= config.backoff_max_ms);
    assert!(config.max_line_bytes >= config.read_buffer_bytes);
    assert!(config.caller_ids.is_empty());
    assert!(!config.fallback_caller_id.is_empty());
}

#[test]
fn estimator_defaults_match_the_shipped_tunables() {
    let tuning = EstimatorTuning::default();
    assert_eq!(tuning.word_weight, 1.3);
    assert_eq!(tuning.punct_weight, 1.0);
    assert_eq!(tuning.wide_char_weight, 1.5);
    assert_eq!(tuning.per_message_overhead, 4);
    assert_eq!(tuning.per_request_overhead, 3);
    assert_eq!(tuning.reconcile_tolerance, 0.20);
}

#[test]
fn model_map_entries_round_trip_through_the_parser() {
    let entries = parse_model_map("gpt-4o=prime-v2,gpt-4o-mini=prime-lite");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].external_model, "gpt-4o");
    assert_eq!(entries[1].backend_model, "prime-lite");
}
