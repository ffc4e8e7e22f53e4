/// Query and aggregation types shared by every `LogStore` implementation
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::log_entry::{LogEntry, LogLevel};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;
/// Entries at or above this score count as anomalies in analytics
pub const ANOMALY_THRESHOLD: f64 = 0.7;

/// Filters for `LogStore::query_logs`; every field is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    pub job_id: Option<String>,
    pub service: Option<String>,
    pub level: Option<LogLevel>,
    pub min_anomaly_score: Option<f64>,
    /// Case-insensitive substring match on the message
    pub search: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl LogQuery {
    pub fn new() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            ..Default::default()
        }
    }

    /// Clamp pagination into range: page >= 1, page_size in 1..=100
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.page_size as usize
    }

    /// In-process evaluation of the filter (used by the memory store and tests)
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(job_id) = &self.job_id {
            if &entry.job_id != job_id {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if &entry.service != service {
                return false;
            }
        }
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if let Some(min) = self.min_anomaly_score {
            if entry.anomaly_score < min {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !entry.message.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if entry.timestamp > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub pages: u64,
}

impl LogPage {
    pub fn new(logs: Vec<LogEntry>, total: u64, query: &LogQuery) -> Self {
        let page_size = query.page_size.max(1) as u64;
        Self {
            logs,
            total,
            page: query.page,
            page_size: query.page_size,
            pages: total.div_ceil(page_size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCount {
    pub service: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourCount {
    /// Two-digit hour of day, `"00"`..`"23"`
    pub hour: String,
    pub count: u64,
}

/// Dashboard aggregates over the last 24 hours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    pub total_logs: u64,
    pub error_count: u64,
    /// Percentage, rounded to two decimals
    pub error_rate: f64,
    pub top_services: Vec<ServiceCount>,
    pub anomaly_count: u64,
    /// Last 12 hours, ascending by hour label
    pub hourly_breakdown: Vec<HourCount>,
}

pub fn error_rate(error_count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (error_count as f64 / total as f64 * 10_000.0).round() / 100.0
}
