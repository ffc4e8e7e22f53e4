/// In-process `LogStore` for local runs and tests
///
/// Entries are keyed by (job_id, line_index), so a redelivered job overwrites
/// its earlier rows instead of duplicating them.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::error::{PipelineError, PipelineResult};
use crate::job::Job;
use crate::log_entry::{LogEntry, LogLevel};
use crate::store::{error_rate, Analytics, HourCount, LogPage, LogQuery, ServiceCount, ANOMALY_THRESHOLD};
use crate::traits::LogStore;

#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<FxHashMap<String, Job>>,
    entries: RwLock<BTreeMap<(String, u64), LogEntry>>,
    /// When set, every entry insert fails (exercises the job-fatal path)
    fail_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `insert_entries` calls fail with a persistence error
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

fn newest_first(a: &&LogEntry, b: &&LogEntry) -> std::cmp::Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| a.job_id.cmp(&b.job_id))
        .then_with(|| a.line_index.cmp(&b.line_index))
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn init(&self) -> PipelineResult<()> {
        tracing::info!("Using in-memory log store");
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn insert_job(&self, job: &Job) -> PipelineResult<()> {
        self.jobs.write().await.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> PipelineResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.job_id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(PipelineError::JobNotFound(job.job_id.clone())),
        }
    }

    async fn get_job(&self, job_id: &str) -> PipelineResult<Option<Job>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn insert_entries(&self, entries: &[LogEntry]) -> PipelineResult<u64> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(PipelineError::Persistence(
                "memory store rejected insert".to_string(),
            ));
        }

        let mut stored = self.entries.write().await;
        for entry in entries {
            stored.insert((entry.job_id.clone(), entry.line_index), entry.clone());
        }
        Ok(entries.len() as u64)
    }

    async fn query_logs(&self, query: &LogQuery) -> PipelineResult<LogPage> {
        let query = query.clone().normalized();
        let stored = self.entries.read().await;

        let mut matching: Vec<&LogEntry> = stored.values().filter(|e| query.matches(e)).collect();
        matching.sort_by(newest_first);

        let total = matching.len() as u64;
        let logs = matching
            .into_iter()
            .skip(query.offset())
            .take(query.page_size as usize)
            .cloned()
            .collect();

        Ok(LogPage::new(logs, total, &query))
    }

    async fn analytics(&self, now: DateTime<Utc>) -> PipelineResult<Analytics> {
        let stored = self.entries.read().await;
        let day_ago = now - Duration::days(1);
        let half_day_ago = now - Duration::hours(12);

        let mut total = 0u64;
        let mut errors = 0u64;
        let mut anomalies = 0u64;
        let mut per_service: FxHashMap<&str, u64> = FxHashMap::default();
        let mut per_hour: BTreeMap<String, u64> = BTreeMap::new();

        for entry in stored.values() {
            if entry.timestamp >= day_ago {
                total += 1;
                if entry.level == LogLevel::Error {
                    errors += 1;
                }
                if entry.anomaly_score >= ANOMALY_THRESHOLD {
                    anomalies += 1;
                }
                *per_service.entry(entry.service.as_str()).or_insert(0) += 1;
            }
            if entry.timestamp >= half_day_ago {
                *per_hour
                    .entry(format!("{:02}", entry.timestamp.hour()))
                    .or_insert(0) += 1;
            }
        }

        let mut top_services: Vec<ServiceCount> = per_service
            .into_iter()
            .map(|(service, count)| ServiceCount {
                service: service.to_string(),
                count,
            })
            .collect();
        top_services.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.service.cmp(&b.service)));
        top_services.truncate(5);

        Ok(Analytics {
            total_logs: total,
            error_count: errors,
            error_rate: error_rate(errors, total),
            top_services,
            anomaly_count: anomalies,
            hourly_breakdown: per_hour
                .into_iter()
                .map(|(hour, count)| HourCount { hour, count })
                .collect(),
        })
    }

    async fn recent_entries(&self, ids: &[String], limit: usize) -> PipelineResult<Vec<LogEntry>> {
        let stored = self.entries.read().await;
        let mut selected: Vec<&LogEntry> = if ids.is_empty() {
            stored.values().collect()
        } else {
            stored
                .values()
                .filter(|e| ids.contains(&e.record_id()))
                .collect()
        };
        selected.sort_by(newest_first);
        Ok(selected.into_iter().take(limit).cloned().collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
