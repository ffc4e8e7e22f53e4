use std::env;
use std::str::FromStr;

use crate::dispatcher::QueueConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::line_parser::ParserConfig;
use crate::llm_config::{LlmConfig, LlmProviderConfig, DEFAULT_OLLAMA_ENDPOINT};
use crate::pipeline::PipelineOptions;
use crate::scorer_config::ScorerConfig;
use crate::similarity::DEFAULT_EMBEDDING_MODEL;

pub const DEFAULT_PORT: u16 = 3002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    ClickHouse,
}

impl FromStr for StoreBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "clickhouse" => Ok(StoreBackend::ClickHouse),
            other => Err(PipelineError::Config(format!(
                "STORE_BACKEND must be 'memory' or 'clickhouse', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,

    // ClickHouse configuration
    pub clickhouse_url: String,
    pub clickhouse_user: Option<String>,
    pub clickhouse_password: Option<String>,
    pub clickhouse_database: String,

    // Pipeline knobs
    pub max_lines: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_deliveries: u32,
    pub scorer_window_secs: i64,
    pub scorer_k: f64,
    pub scorer_min_samples: usize,

    // LLM configuration (optional; ask-AI falls back to local heuristics)
    pub llm_provider: Option<String>, // "openai", "anthropic", "ollama"
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub ollama_endpoint: Option<String>,
    pub llm_config_file: Option<String>,
    pub embedding_model: String,

    pub port: u16,
}

impl Config {
    pub fn from_env() -> PipelineResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production, a map in tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PipelineResult<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let or_default = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let store_backend = or_default("STORE_BACKEND", "memory").parse()?;
        let llm_provider = var("LLM_PROVIDER").map(|p| p.to_ascii_lowercase());
        let llm_model = var("LLM_MODEL").unwrap_or_else(|| {
            LlmProviderConfig::default_model(llm_provider.as_deref().unwrap_or("ollama")).to_string()
        });

        let defaults = PipelineOptions::default();

        let config = Config {
            store_backend,

            clickhouse_url: or_default("CLICKHOUSE_URL", "http://localhost:8123"),
            clickhouse_user: var("CLICKHOUSE_USER"),
            clickhouse_password: var("CLICKHOUSE_PASSWORD"),
            clickhouse_database: or_default("CLICKHOUSE_DATABASE", "default"),

            max_lines: number(&var, "MAX_LINES", defaults.parser.max_lines)?,
            worker_count: number(&var, "WORKER_COUNT", defaults.queue.workers)?,
            queue_capacity: number(&var, "QUEUE_CAPACITY", defaults.queue.capacity)?,
            max_deliveries: number(&var, "MAX_DELIVERIES", defaults.queue.max_deliveries)?,
            scorer_window_secs: number(&var, "SCORER_WINDOW_SECS", defaults.scorer.window_secs)?,
            scorer_k: number(&var, "SCORER_K", defaults.scorer.k)?,
            scorer_min_samples: number(&var, "SCORER_MIN_SAMPLES", defaults.scorer.min_samples)?,

            llm_provider,
            llm_api_key: var("LLM_API_KEY"),
            llm_model,
            ollama_endpoint: var("OLLAMA_ENDPOINT"),
            llm_config_file: var("LLM_CONFIG_FILE"),
            embedding_model: or_default("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),

            port: number(&var, "INGEST_PORT", DEFAULT_PORT)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> PipelineResult<()> {
        let invalid = |msg: &str| Err(PipelineError::Config(msg.to_string()));
        if self.scorer_window_secs <= 0 {
            return invalid("SCORER_WINDOW_SECS must be positive");
        }
        if !self.scorer_k.is_finite() || self.scorer_k < 0.0 {
            return invalid("SCORER_K must be a non-negative number");
        }
        if self.max_lines == 0 {
            return invalid("MAX_LINES must be at least 1");
        }
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            parser: ParserConfig::new().with_max_lines(self.max_lines),
            scorer: ScorerConfig::new()
                .with_window_secs(self.scorer_window_secs)
                .with_k(self.scorer_k)
                .with_min_samples(self.scorer_min_samples),
            queue: QueueConfig::new()
                .with_workers(self.worker_count)
                .with_capacity(self.queue_capacity)
                .with_max_deliveries(self.max_deliveries),
        }
    }

    /// LLM providers to use, or `None` when ask-AI should stay local
    pub fn llm_config(&self) -> Option<LlmConfig> {
        if let Some(path) = &self.llm_config_file {
            match LlmConfig::from_file(path) {
                Ok(config) => return Some(config),
                Err(e) => tracing::warn!("Ignoring LLM_CONFIG_FILE {}: {}", path, e),
            }
        }

        let provider = self.llm_provider.as_deref()?;
        let endpoint = match provider {
            "ollama" => Some(
                self.ollama_endpoint
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OLLAMA_ENDPOINT.to_string()),
            ),
            _ => None,
        };

        Some(LlmConfig::single(
            LlmProviderConfig::new(provider, &self.llm_model)
                .with_api_key(self.llm_api_key.clone())
                .with_endpoint(endpoint),
        ))
    }

    /// Embeddings need an OpenAI key
    pub fn embedding_api_key(&self) -> Option<&str> {
        match self.llm_provider.as_deref() {
            Some("openai") => self.llm_api_key.as_deref(),
            _ => None,
        }
    }

    pub fn log_config(&self) {
        tracing::info!("📋 Configuration:");
        tracing::info!("   Store Backend: {:?}", self.store_backend);
        if self.store_backend == StoreBackend::ClickHouse {
            tracing::info!("   ClickHouse URL: {}", self.clickhouse_url);
            tracing::info!("   ClickHouse User: {}", self.clickhouse_user.as_deref().unwrap_or("default"));
            tracing::info!("   ClickHouse Password: {}", mask(self.clickhouse_password.as_deref(), 2));
            tracing::info!("   ClickHouse Database: {}", self.clickhouse_database);
        }
        tracing::info!("   Max Lines: {}", self.max_lines);
        tracing::info!(
            "   Workers: {} (queue: {}, max deliveries: {})",
            self.worker_count,
            self.queue_capacity,
            self.max_deliveries
        );
        tracing::info!(
            "   Scorer: window {}s, k {}, min samples {}",
            self.scorer_window_secs,
            self.scorer_k,
            self.scorer_min_samples
        );
        match &self.llm_provider {
            Some(provider) => {
                tracing::info!("   LLM Provider: {}", provider);
                tracing::info!("   LLM Model: {}", self.llm_model);
                tracing::info!("   LLM API Key: {}", mask(self.llm_api_key.as_deref(), 4));
            }
            None => tracing::info!("   LLM Provider: none (local analysis only)"),
        }
        if let Some(ref endpoint) = self.ollama_endpoint {
            tracing::info!("   Ollama Endpoint: {}", endpoint);
        }
        tracing::info!("   Port: {}", self.port);
    }
}

fn number<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> PipelineResult<T> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::Config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(default),
    }
}

fn mask(secret: Option<&str>, visible: usize) -> String {
    match secret {
        Some(s) => format!("{}***", s.chars().take(visible).collect::<String>()),
        None => "(not set)".to_string(),
    }
}
