/// Structured log records produced by the line parser
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of severities every input line is normalized into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Unknown,
}

impl LogLevel {
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Critical,
        LogLevel::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Unknown => "UNKNOWN",
        }
    }

    /// Normalize a level token from a log line.
    ///
    /// Case-insensitive; tolerates `[ERROR]` and `ERROR:` wrappers. Returns
    /// `None` for tokens outside the alias table.
    pub fn from_token(token: &str) -> Option<Self> {
        let trimmed = token
            .trim()
            .trim_start_matches(['[', '<', '('])
            .trim_end_matches([']', '>', ')', ':']);
        if trimmed.is_empty() {
            return None;
        }

        match trimmed.to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" | "DBG" | "VERBOSE" => Some(LogLevel::Debug),
            "INFO" | "INFORMATION" | "NOTICE" | "INF" => Some(LogLevel::Info),
            "WARN" | "WARNING" | "WRN" => Some(LogLevel::Warn),
            "ERROR" | "ERR" | "SEVERE" => Some(LogLevel::Error),
            "CRITICAL" | "CRIT" | "FATAL" | "EMERG" | "EMERGENCY" | "ALERT" | "PANIC" => {
                Some(LogLevel::Critical)
            }
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    /// Strict parse of the canonical names (used for query filters)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

/// One record per non-blank input line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Back-reference to the job that produced this entry (empty for ad-hoc parses)
    pub job_id: String,
    /// Position among the non-blank lines of the upload
    pub line_index: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub service: String,
    pub message: String,
    pub raw_line: String,
    pub anomaly_score: f64,
    /// Opaque carrier for anything the closed structure does not model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl LogEntry {
    /// Stable record key: `<job_id>:<line_index>`
    pub fn record_id(&self) -> String {
        format!("{}:{}", self.job_id, self.line_index)
    }

    /// Compact single-line rendering used as LLM / embedding input
    pub fn summary_line(&self) -> String {
        format!("[{}] {}: {}", self.level, self.service, self.message)
    }
}
