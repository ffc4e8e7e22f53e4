/// Root-cause analysis of a handful of log lines through a text-completion
/// collaborator. Any failure collapses to a fixed fallback answer.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm_service::extract_json_object;
use crate::traits::TextCompletion;

/// Logs beyond this many are not sent to the model
pub const MAX_ANALYZED_LOGS: usize = 10;

const SYSTEM_PROMPT: &str =
    "You are a professional system reliability engineer. Analyze logs and return results strictly in JSON format.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub cause: String,
    pub impact: String,
    pub solution: String,
    pub confidence: Confidence,
    pub severity: Severity,
    #[serde(default)]
    pub affected_services: Vec<String>,
}

impl RootCauseAnalysis {
    pub fn fallback() -> Self {
        Self {
            cause: "Manual review required: AI analysis encountered an error.".to_string(),
            impact: "Unconfirmed".to_string(),
            solution: "Check service logs directly for immediate resolution.".to_string(),
            confidence: Confidence::Low,
            severity: Severity::High,
            affected_services: Vec::new(),
        }
    }
}

pub struct RootCauseAnalyzer {
    completion: Arc<dyn TextCompletion>,
}

impl RootCauseAnalyzer {
    pub fn new(completion: Arc<dyn TextCompletion>) -> Self {
        Self { completion }
    }

    /// Never fails; returns `RootCauseAnalysis::fallback()` on any error
    pub async fn analyze(&self, logs: &[String]) -> RootCauseAnalysis {
        match self.try_analyze(logs).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("AI analysis failed ({}): {}", self.completion.name(), e);
                RootCauseAnalysis::fallback()
            }
        }
    }

    pub async fn try_analyze(&self, logs: &[String]) -> anyhow::Result<RootCauseAnalysis> {
        let prompt = build_prompt(logs);
        let reply = self.completion.complete(SYSTEM_PROMPT, &prompt).await?;
        debug!("Completion returned {} bytes", reply.len());
        parse_analysis(&reply)
    }
}

pub fn build_prompt(logs: &[String]) -> String {
    let formatted = logs
        .iter()
        .take(MAX_ANALYZED_LOGS)
        .enumerate()
        .map(|(i, log)| format!("Log {}:\n{}", i + 1, log))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"Analyze the following logs to determine the root cause, impact, and solution.
Return a JSON object with these keys:
- cause: string, the identified root cause
- impact: string, how this affects the system
- solution: string, specific steps to fix it
- confidence: string (HIGH/MEDIUM/LOW)
- severity: string (CRITICAL/HIGH/MEDIUM/LOW)
- affected_services: list of strings

Logs:
{formatted}
"#
    )
}

/// Pull the JSON object out of a model reply and validate it
pub fn parse_analysis(reply: &str) -> anyhow::Result<RootCauseAnalysis> {
    let json = extract_json_object(reply)
        .ok_or_else(|| anyhow::anyhow!("No JSON object in completion"))?;
    serde_json::from_str(json)
        .map_err(|e| anyhow::anyhow!("Failed to parse analysis JSON: {}. Response: {}", e, reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Canned(Result<String, String>);

    #[async_trait]
    impl TextCompletion for Canned {
        async fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            self.0.clone().map_err(|e| anyhow::anyhow!(e))
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn analyzer(reply: Result<&str, &str>) -> RootCauseAnalyzer {
        RootCauseAnalyzer::new(Arc::new(Canned(
            reply.map(str::to_string).map_err(str::to_string),
        )))
    }

    #[tokio::test]
    async fn test_valid_reply() {
        let reply = r#"Here you go: {"cause": "DB pool exhausted", "impact": "Checkout down",
            "solution": "Raise pool size", "confidence": "HIGH", "severity": "CRITICAL",
            "affected_services": ["payment-svc"]}"#;
        let analysis = analyzer(Ok(reply)).analyze(&["[ERROR] payment-svc: timeout".to_string()]).await;

        assert_eq!(analysis.cause, "DB pool exhausted");
        assert_eq!(analysis.confidence, Confidence::High);
        assert_eq!(analysis.severity, Severity::Critical);
        assert_eq!(analysis.affected_services, vec!["payment-svc".to_string()]);
    }

    #[tokio::test]
    async fn test_completion_error_falls_back() {
        let analysis = analyzer(Err("connection refused")).analyze(&[]).await;
        assert_eq!(analysis, RootCauseAnalysis::fallback());
    }

    #[tokio::test]
    async fn test_invalid_enum_falls_back() {
        let reply = r#"{"cause": "x", "impact": "y", "solution": "z", "confidence": "SURE", "severity": "HIGH"}"#;
        let analysis = analyzer(Ok(reply)).analyze(&[]).await;
        assert_eq!(analysis, RootCauseAnalysis::fallback());
    }

    #[test]
    fn test_prompt_caps_logs() {
        let logs: Vec<String> = (0..15).map(|i| format!("line {}", i)).collect();
        let prompt = build_prompt(&logs);

        assert!(prompt.contains("Log 1:\nline 0"));
        assert!(prompt.contains("Log 10:\nline 9"));
        assert!(!prompt.contains("Log 11:"));
    }

    #[test]
    fn test_fallback_shape() {
        let fallback = RootCauseAnalysis::fallback();
        assert_eq!(fallback.confidence, Confidence::Low);
        assert_eq!(fallback.severity, Severity::High);
        assert!(fallback.affected_services.is_empty());
    }
}
