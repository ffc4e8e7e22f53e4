use anyhow::Result;
use async_trait::async_trait;

use crate::llm_config::{LlmConfig, LlmProviderConfig};
use crate::traits::TextCompletion;

/// Text completion over one or more LLM providers, first success wins
pub struct LlmClient {
    config: LlmConfig,
    http_client: reqwest::Client,
}

/// Single provider client for making API calls
struct ProviderClient<'a> {
    config: &'a LlmProviderConfig,
    http_client: &'a reqwest::Client,
}

impl ProviderClient<'_> {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        match self.config.provider.as_str() {
            "openai" => self.call_openai(system, prompt).await,
            "ollama" => self.call_ollama(system, prompt).await,
            "anthropic" => self.call_anthropic(system, prompt).await,
            _ => anyhow::bail!("Unsupported provider: {}", self.config.provider),
        }
    }

    async fn call_ollama(&self, system: &str, prompt: &str) -> Result<String> {
        let endpoint = self
            .config
            .endpoint
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Ollama endpoint not configured"))?;

        let request_body = serde_json::json!({
            "model": self.config.model,
            "system": system,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": {
                "temperature": 0.3,
            }
        });

        let response = self
            .http_client
            .post(format!("{}/api/generate", endpoint))
            .json(&request_body)
            .send()
            .await?;

        let response_json: serde_json::Value = response.json().await?;

        match response_json.get("response").and_then(|v| v.as_str()) {
            Some(text) => Ok(text.to_string()),
            None => anyhow::bail!("No response from Ollama"),
        }
    }

    async fn call_openai(&self, system: &str, prompt: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("OpenAI API key not configured"))?;

        let mut request_body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.3,
            "max_tokens": 800
        });
        // JSON mode is only accepted by the newer chat models
        if self.config.model.starts_with("gpt-4o") || self.config.model.starts_with("gpt-4-turbo") {
            request_body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let response = self
            .http_client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        let response_json: serde_json::Value = response.json().await?;

        if !status.is_success() {
            anyhow::bail!("OpenAI API error: {}", response_json);
        }

        response_json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("No response from OpenAI"))
    }

    async fn call_anthropic(&self, system: &str, prompt: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Anthropic API key not configured"))?;

        let request_body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": 800,
            "system": system,
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });

        let response = self
            .http_client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        let response_json: serde_json::Value = response.json().await?;

        if !status.is_success() {
            anyhow::bail!("Anthropic API error: {}", response_json);
        }

        response_json
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("No response from Anthropic"))
    }
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        config.validate()?;

        tracing::info!("🤖 LLM client configured with {} provider(s)", config.providers.len());
        for provider in &config.providers {
            tracing::info!("   - {}: {} ({})", provider.name, provider.provider, provider.model);
        }

        let timeout = config
            .providers
            .iter()
            .filter_map(|p| p.timeout_secs)
            .max()
            .unwrap_or(60);

        Ok(Self {
            config,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        })
    }

    pub fn providers(&self) -> &[LlmProviderConfig] {
        &self.config.providers
    }
}

#[async_trait]
impl TextCompletion for LlmClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        for provider_config in &self.config.providers {
            let client = ProviderClient {
                config: provider_config,
                http_client: &self.http_client,
            };

            match client.complete(system, prompt).await {
                Ok(text) => {
                    tracing::debug!("Provider {} succeeded", provider_config.name);
                    return Ok(text);
                }
                Err(e) => {
                    tracing::warn!("Provider {} failed: {}", provider_config.name, e);
                }
            }
        }
        anyhow::bail!("All LLM providers failed")
    }

    fn name(&self) -> &str {
        "llm"
    }
}

/// Slice from the first `{` to the last `}`, if both exist in that order
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}
