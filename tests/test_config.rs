/// Test pipeline configuration
use log_pipeline::config::{Config, StoreBackend, DEFAULT_PORT};
use log_pipeline::dispatcher::QueueConfig;
use log_pipeline::line_parser::ParserConfig;
use log_pipeline::scorer_config::{ScorerConfig, SeverityWeights};
use log_pipeline::{LogLevel, PipelineError, PipelineOptions};
use std::collections::HashMap;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_default_options() {
    let options = PipelineOptions::default();

    println!("Default configuration:");
    println!("  Window: {}s, k: {}", options.scorer.window_secs, options.scorer.k);
    println!("  Max lines: {}", options.parser.max_lines);
    println!("  Workers: {}, capacity: {}", options.queue.workers, options.queue.capacity);

    assert_eq!(options.scorer.window_secs, 300);
    assert_eq!(options.scorer.k, 2.0);
    assert_eq!(options.scorer.min_samples, 5);
    assert_eq!(options.scorer.window_minutes(), 5.0);
    assert_eq!(options.parser.max_lines, 1_000_000);
    assert_eq!(options.queue.max_deliveries, 3);
}

#[test]
fn test_scorer_presets() {
    assert_eq!(ScorerConfig::sensitive().k, 1.5);
    assert_eq!(ScorerConfig::conservative().k, 3.0);
    assert_eq!(ScorerConfig::sensitive().window_secs, 300);

    let custom = ScorerConfig::new()
        .with_window_secs(60)
        .with_k(-1.0)
        .with_min_samples(0);
    assert_eq!(custom.window_minutes(), 1.0);
    assert_eq!(custom.k, 0.0);
    assert_eq!(custom.min_samples, 1);

    let warn_heavy = ScorerConfig::new().with_weights(SeverityWeights {
        warn: 1.0,
        ..Default::default()
    });
    assert_eq!(warn_heavy.weights.weight(LogLevel::Warn), 1.0);
    assert_eq!(warn_heavy.weights.weight(LogLevel::Error), 1.0);
    assert_eq!(warn_heavy.weights.weight(LogLevel::Info), 0.0);
}

#[test]
fn test_parser_and_queue_builders() {
    let parser = ParserConfig::new()
        .with_max_lines(50)
        .with_parallel_threshold(0);
    assert_eq!(parser.max_lines, 50);
    assert_eq!(parser.parallel_threshold, 1);

    let queue = QueueConfig::new().with_workers(8).with_capacity(16);
    assert_eq!(queue.workers, 8);
    assert_eq!(queue.capacity, 16);
}

#[test]
fn test_config_from_empty_environment() {
    let config = Config::from_lookup(lookup(&[])).unwrap();

    assert_eq!(config.store_backend, StoreBackend::Memory);
    assert_eq!(config.port, DEFAULT_PORT);
    assert!(config.llm_config().is_none());
    assert!(config.embedding_api_key().is_none());

    let options = config.pipeline_options();
    assert_eq!(options.scorer.k, 2.0);
    assert_eq!(options.queue.workers, 4);
}

#[test]
fn test_config_overrides_flow_into_pipeline() {
    let config = Config::from_lookup(lookup(&[
        ("STORE_BACKEND", "clickhouse"),
        ("MAX_LINES", "2000"),
        ("WORKER_COUNT", "2"),
        ("SCORER_WINDOW_SECS", "600"),
        ("SCORER_K", "2.5"),
        ("INGEST_PORT", "8080"),
    ]))
    .unwrap();

    assert_eq!(config.store_backend, StoreBackend::ClickHouse);
    assert_eq!(config.port, 8080);

    let options = config.pipeline_options();
    assert_eq!(options.parser.max_lines, 2000);
    assert_eq!(options.queue.workers, 2);
    assert_eq!(options.scorer.window_secs, 600);
    assert_eq!(options.scorer.k, 2.5);
}

#[test]
fn test_config_rejects_bad_values() {
    assert!(Config::from_lookup(lookup(&[("SCORER_WINDOW_SECS", "0")])).is_err());
    assert!(Config::from_lookup(lookup(&[("SCORER_K", "abc")])).is_err());
    assert!(Config::from_lookup(lookup(&[("STORE_BACKEND", "postgres")])).is_err());
}

#[test]
fn test_unknown_backend_is_config_error() {
    let err = Config::from_lookup(lookup(&[("STORE_BACKEND", "postgres")])).unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert!(err.to_string().starts_with("configuration error: STORE_BACKEND"));
}
