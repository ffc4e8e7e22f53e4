use serde::{Deserialize, Serialize};

pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";

/// Configuration for a single LLM provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub name: String,
    pub provider: String, // "openai", "ollama", "anthropic"
    pub model: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>, // For Ollama or custom endpoints
    pub timeout_secs: Option<u64>,
}

impl LlmProviderConfig {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            name: provider.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            api_key: None,
            endpoint: None,
            timeout_secs: Some(60),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Default model when none is configured
    pub fn default_model(provider: &str) -> &'static str {
        match provider {
            "openai" => "gpt-4o",
            "anthropic" => "claude-3-5-sonnet-20240620",
            "ollama" => "llama3",
            _ => "gpt-4o",
        }
    }
}

/// Providers tried in order; the first successful completion wins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub providers: Vec<LlmProviderConfig>,
}

impl LlmConfig {
    pub fn single(provider: LlmProviderConfig) -> Self {
        Self {
            providers: vec![provider],
        }
    }

    /// Load a provider list from a JSON file (`LLM_CONFIG_FILE`)
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("At least one LLM provider must be configured");
        }

        for provider in &self.providers {
            match provider.provider.as_str() {
                "openai" | "anthropic" => {
                    if provider.api_key.is_none() {
                        anyhow::bail!("Provider {} requires an API key", provider.name);
                    }
                }
                "ollama" => {}
                other => anyhow::bail!("Unsupported provider: {}", other),
            }
        }

        Ok(())
    }
}
