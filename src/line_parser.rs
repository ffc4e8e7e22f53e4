/// Converts uploaded text into structured log entries, one per non-blank line
///
/// Canonical shape: `YYYY-MM-DD HH:MM:SS LEVEL SERVICE - MESSAGE`. Anything
/// else degrades to a looser entry; no line is ever dropped.
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use memchr::memchr2_iter;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::log_entry::{LogEntry, LogLevel};

pub const UNKNOWN_SERVICE: &str = "unknown";

static TIMESTAMP_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(\d{4}-\d{2}-\d{2})[T ](\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?)(Z|[+-]\d{2}:?\d{2})?(?:\s+(.*))?$",
    )
    .expect("timestamp regex is valid")
});

static CANONICAL_REST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+)\s+(\S+)\s+-(?:\s+(.*))?$").expect("canonical regex is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Uploads with more non-blank lines than this are rejected outright
    pub max_lines: usize,
    /// Line count from which parsing fans out over the rayon pool
    pub parallel_threshold: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_lines: 1_000_000,
            parallel_threshold: 10_000,
        }
    }
}

impl ParserConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold.max(1);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineParser {
    config: ParserConfig,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ParserConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse an ad-hoc blob, stamping timestamp-less lines with the current time
    pub fn parse(&self, text: &str) -> PipelineResult<Vec<LogEntry>> {
        self.parse_at(text, Utc::now())
    }

    pub fn parse_at(&self, text: &str, ingested_at: DateTime<Utc>) -> PipelineResult<Vec<LogEntry>> {
        self.parse_job(text, "", ingested_at)
    }

    /// Parse an upload on behalf of a job.
    ///
    /// `ingested_at` should be the job's submission time so that a redelivered
    /// job reproduces identical entries.
    pub fn parse_job(
        &self,
        text: &str,
        job_id: &str,
        ingested_at: DateTime<Utc>,
    ) -> PipelineResult<Vec<LogEntry>> {
        let lines = self.collect_lines(text)?;

        let build = |(index, line): (usize, &&str)| {
            let mut entry = Self::parse_line(line, ingested_at);
            entry.job_id = job_id.to_string();
            entry.line_index = index as u64;
            entry
        };

        let entries: Vec<LogEntry> = if lines.len() >= self.config.parallel_threshold {
            lines.par_iter().enumerate().map(build).collect()
        } else {
            lines.iter().enumerate().map(build).collect()
        };

        tracing::debug!("Parsed {} entries (job: {:?})", entries.len(), job_id);
        Ok(entries)
    }

    /// Split on `\n`, `\r\n` or a lone `\r`, dropping blank lines.
    ///
    /// Stops scanning as soon as the line limit is crossed.
    fn collect_lines<'a>(&self, text: &'a str) -> PipelineResult<Vec<&'a str>> {
        let limit = self.config.max_lines;
        let mut lines = Vec::new();
        let mut start = 0;

        let push = |line: &'a str, lines: &mut Vec<&'a str>| -> PipelineResult<()> {
            if line.trim().is_empty() {
                return Ok(());
            }
            lines.push(line);
            if lines.len() > limit {
                return Err(PipelineError::SizeLimitExceeded {
                    lines: lines.len(),
                    limit,
                });
            }
            Ok(())
        };

        for end in memchr2_iter(b'\n', b'\r', text.as_bytes()) {
            push(&text[start..end], &mut lines)?;
            start = end + 1;
        }
        push(&text[start..], &mut lines)?;

        Ok(lines)
    }

    /// Parse a single (non-blank) line. Total: never fails.
    pub fn parse_line(line: &str, ingested_at: DateTime<Utc>) -> LogEntry {
        let mut entry = LogEntry {
            job_id: String::new(),
            line_index: 0,
            timestamp: ingested_at,
            level: LogLevel::Unknown,
            service: UNKNOWN_SERVICE.to_string(),
            message: line.to_string(),
            raw_line: line.to_string(),
            anomaly_score: 0.0,
            extra: None,
        };

        let caps = match TIMESTAMP_PREFIX.captures(line.trim_end()) {
            Some(caps) => caps,
            None => return entry,
        };

        let offset = caps.get(3).map(|m| m.as_str());
        let timestamp = match parse_timestamp(&caps[1], &caps[2], offset) {
            Some(ts) => ts,
            // Timestamp-shaped but not a real instant (month 13 and the like)
            None => return entry,
        };
        entry.timestamp = timestamp;

        let rest = caps.get(4).map(|m| m.as_str().trim()).unwrap_or_default();

        if let Some(parts) = CANONICAL_REST.captures(rest) {
            let token = &parts[1];
            entry.service = parts[2].to_string();
            entry.message = parts.get(3).map(|m| m.as_str().trim()).unwrap_or_default().to_string();
            entry.level = match LogLevel::from_token(token) {
                Some(level) => level,
                None => {
                    entry.extra = Some(format!("level_token={}", token));
                    LogLevel::Info
                }
            };
            return entry;
        }

        // Timestamped but not canonical
        let (first, remainder) = match rest.split_once(char::is_whitespace) {
            Some((first, remainder)) => (first, remainder.trim()),
            None => (rest, ""),
        };

        match LogLevel::from_token(first) {
            Some(level) => {
                entry.level = level;
                entry.message = remainder.to_string();
            }
            None => {
                entry.level = LogLevel::Info;
                entry.message = rest.to_string();
                if !first.is_empty() {
                    entry.extra = Some(format!("level_token={}", first));
                }
            }
        }

        entry
    }
}

fn parse_timestamp(date: &str, time: &str, offset: Option<&str>) -> Option<DateTime<Utc>> {
    let text = format!("{} {}", date, time.replace(',', "."));
    let naive = NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f").ok()?;

    match offset {
        None | Some("Z") => Some(naive.and_utc()),
        Some(raw) => {
            let offset = parse_offset(raw)?;
            naive
                .and_local_timezone(offset)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}

/// `+HH:MM`, `+HHMM`, `-HH:MM`, `-HHMM`
fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, digits) = match raw.split_at(1) {
        ("+", digits) => (1, digits),
        ("-", digits) => (-1, digits),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
