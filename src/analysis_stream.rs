/// Streamed "ask AI" answer: a summary emitted word by word, then one
/// terminal result merging the root-cause analysis with local counts.
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::log_entry::{LogEntry, LogLevel};
use crate::root_cause::{Confidence, RootCauseAnalyzer, Severity, MAX_ANALYZED_LOGS};
use crate::store::ANOMALY_THRESHOLD;

/// Entries fetched as context for one question
pub const CONTEXT_LIMIT: usize = 50;
const MAX_AFFECTED_SERVICES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskAiResult {
    pub cause: String,
    pub confidence: Confidence,
    pub severity: Severity,
    pub affected_services: Vec<String>,
    pub recommendation: String,
    pub impact: String,
    pub solution: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    Token(String),
    Done(AskAiResult),
}

/// Counts over the context entries that drive the local heuristics
#[derive(Debug, Clone, Default)]
struct ContextSummary {
    total: usize,
    errors: usize,
    warnings: usize,
    anomalies: usize,
    services: Vec<String>,
    latest_error: Option<String>,
}

impl ContextSummary {
    fn from_entries(entries: &[LogEntry]) -> Self {
        let mut summary = ContextSummary {
            total: entries.len(),
            ..Default::default()
        };
        let mut services = BTreeSet::new();

        for entry in entries {
            match entry.level {
                LogLevel::Error => {
                    summary.errors += 1;
                    if summary.latest_error.is_none() && !entry.message.is_empty() {
                        summary.latest_error = Some(entry.message.chars().take(200).collect());
                    }
                }
                LogLevel::Warn => summary.warnings += 1,
                _ => {}
            }
            if entry.anomaly_score >= ANOMALY_THRESHOLD {
                summary.anomalies += 1;
            }
            services.insert(entry.service.clone());
        }

        summary.services = services.into_iter().collect();
        summary
    }

    fn confidence(&self) -> Confidence {
        match self.errors {
            n if n > 5 => Confidence::High,
            0 => Confidence::Low,
            _ => Confidence::Medium,
        }
    }

    fn severity(&self) -> Severity {
        match self.errors {
            n if n > 10 => Severity::Critical,
            n if n > 3 => Severity::High,
            _ => Severity::Medium,
        }
    }

    fn cause(&self) -> String {
        if self.errors > 0 {
            let mut cause = format!("Found {} error(s) in recent logs", self.errors);
            if let Some(message) = &self.latest_error {
                cause.push_str(&format!(". Most recent: {}", message));
            }
            cause
        } else if self.warnings > 0 {
            format!("Found {} warning(s) but no errors in recent logs", self.warnings)
        } else {
            "No errors or warnings detected in recent logs".to_string()
        }
    }

    fn recommendation(&self, query: &str) -> String {
        let lead = if self.anomalies > 0 {
            format!(
                "Investigate {} anomalous log entries with scores above {}. ",
                self.anomalies, ANOMALY_THRESHOLD
            )
        } else {
            "No significant anomalies detected. ".to_string()
        };
        format!("{}Query: {}", lead, query)
    }

    fn impact(&self) -> String {
        format!("{} errors affecting {} service(s)", self.errors, self.services.len())
    }

    fn narrative(&self, query: &str) -> String {
        let services = if self.services.is_empty() {
            "none".to_string()
        } else {
            self.services.join(", ")
        };
        format!(
            "Analyzing logs for: {}\n\nFound {} relevant log entries.\nErrors: {}, Warnings: {}, Anomalies: {}\nServices involved: {}\n",
            query, self.total, self.errors, self.warnings, self.anomalies, services
        )
    }

    fn affected_services(&self) -> Vec<String> {
        self.services.iter().take(MAX_AFFECTED_SERVICES).cloned().collect()
    }
}

#[derive(Clone)]
pub struct AnalysisStreamer {
    analyzer: Option<Arc<RootCauseAnalyzer>>,
    token_delay: Duration,
}

impl AnalysisStreamer {
    pub fn new(analyzer: Option<Arc<RootCauseAnalyzer>>) -> Self {
        Self {
            analyzer,
            token_delay: Duration::from_millis(50),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Start producing events for `query` over `entries` (newest first).
    ///
    /// The receiver yields `Token`s followed by exactly one `Done`. Dropping
    /// it stops the producer at its next send.
    pub fn stream(&self, query: &str, entries: Vec<LogEntry>) -> mpsc::Receiver<AnalysisEvent> {
        let (tx, rx) = mpsc::channel(32);
        let streamer = self.clone();
        let query = query.to_string();

        tokio::spawn(async move {
            streamer.produce(query, entries, tx).await;
        });

        rx
    }

    async fn produce(&self, query: String, entries: Vec<LogEntry>, tx: mpsc::Sender<AnalysisEvent>) {
        let summary = ContextSummary::from_entries(&entries);

        for word in summary.narrative(&query).split(' ') {
            if tx.send(AnalysisEvent::Token(format!("{} ", word))).await.is_err() {
                debug!("Analysis consumer went away, stopping");
                return;
            }
            if !self.token_delay.is_zero() {
                tokio::time::sleep(self.token_delay).await;
            }
        }

        // The analyzer may take as long as its provider timeout
        let result = tokio::select! {
            result = self.result(&query, &entries, &summary) => result,
            _ = tx.closed() => {
                debug!("Analysis consumer went away during root-cause analysis");
                return;
            }
        };
        if tx.send(AnalysisEvent::Done(result)).await.is_err() {
            debug!("Analysis consumer went away before the result");
        }
    }

    async fn result(&self, query: &str, entries: &[LogEntry], summary: &ContextSummary) -> AskAiResult {
        let local = AskAiResult {
            cause: summary.cause(),
            confidence: summary.confidence(),
            severity: summary.severity(),
            affected_services: summary.affected_services(),
            recommendation: summary.recommendation(query),
            impact: summary.impact(),
            solution: "Review error logs manually (AI service unavailable)".to_string(),
        };

        let Some(analyzer) = &self.analyzer else {
            return local;
        };

        let texts: Vec<String> = entries
            .iter()
            .take(MAX_ANALYZED_LOGS)
            .map(LogEntry::summary_line)
            .collect();
        let analysis = analyzer.analyze(&texts).await;

        AskAiResult {
            cause: analysis.cause,
            recommendation: analysis.solution.clone(),
            impact: analysis.impact,
            solution: analysis.solution,
            ..local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(level: LogLevel, service: &str, score: f64) -> LogEntry {
        LogEntry {
            job_id: "J".to_string(),
            line_index: 0,
            timestamp: Utc::now(),
            level,
            service: service.to_string(),
            message: format!("{} happened", level),
            raw_line: String::new(),
            anomaly_score: score,
            extra: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<AnalysisEvent>) -> Vec<AnalysisEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn streamer() -> AnalysisStreamer {
        AnalysisStreamer::new(None).with_token_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_tokens_then_exactly_one_done() {
        let entries = vec![
            entry(LogLevel::Error, "payment-svc", 0.9),
            entry(LogLevel::Warn, "auth-svc", 0.1),
        ];
        let events = collect(streamer().stream("why is checkout failing", entries)).await;

        let done: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AnalysisEvent::Done(_)))
            .collect();
        assert_eq!(done.len(), 1);
        assert!(matches!(events.last(), Some(AnalysisEvent::Done(_))));

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AnalysisEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert!(text.starts_with("Analyzing logs for: why is checkout failing"));
        assert!(text.contains("Errors: 1, Warnings: 1, Anomalies: 1"));
        assert!(text.contains("Services involved: auth-svc, payment-svc"));
    }

    #[tokio::test]
    async fn test_local_heuristics() {
        let mut entries: Vec<LogEntry> = (0..11).map(|_| entry(LogLevel::Error, "api", 0.0)).collect();
        for svc in ["a", "b", "c", "d", "e", "f"] {
            entries.push(entry(LogLevel::Info, svc, 0.0));
        }
        let events = collect(streamer().stream("q", entries)).await;

        let Some(AnalysisEvent::Done(result)) = events.last() else {
            panic!("stream did not end with Done");
        };
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.severity, Severity::Critical);
        assert_eq!(result.affected_services, vec!["a", "api", "b", "c", "d"]);
        assert_eq!(result.impact, "11 errors affecting 7 service(s)");
        assert!(result.cause.starts_with("Found 11 error(s)"));
    }

    #[tokio::test]
    async fn test_empty_context() {
        let events = collect(streamer().stream("q", Vec::new())).await;
        let Some(AnalysisEvent::Done(result)) = events.last() else {
            panic!("stream did not end with Done");
        };
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(result.severity, Severity::Medium);
        assert_eq!(result.cause, "No errors or warnings detected in recent logs");
        assert!(result.recommendation.starts_with("No significant anomalies detected."));
    }

    /// Completion that takes far longer than any test waits
    struct Stalled {
        started: tokio::sync::Notify,
        finished: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl crate::traits::TextCompletion for Stalled {
        async fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.finished.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok("{}".to_string())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_analysis_stops_producer() {
        let completion = Arc::new(Stalled {
            started: tokio::sync::Notify::new(),
            finished: std::sync::atomic::AtomicBool::new(false),
        });
        let analyzer = Arc::new(RootCauseAnalyzer::new(completion.clone()));
        let streamer = AnalysisStreamer::new(Some(analyzer)).with_token_delay(Duration::ZERO);

        // Room for every token, so the producer reaches the analyzer unread
        let (tx, rx) = mpsc::channel(1024);
        let entries = vec![entry(LogLevel::Error, "payment-svc", 0.9)];
        let producer = tokio::spawn(async move {
            streamer.produce("q".to_string(), entries, tx).await;
        });

        completion.started.notified().await;
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer kept waiting on the analyzer after the consumer left")
            .unwrap();
        assert!(!completion.finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_producer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        // Returns promptly instead of looping over every token
        tokio::time::timeout(
            Duration::from_secs(1),
            AnalysisStreamer::new(None).produce("q".to_string(), Vec::new(), tx),
        )
        .await
        .expect("producer kept running after the consumer left");
    }
}
