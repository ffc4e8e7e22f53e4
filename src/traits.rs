/// Dependency injection traits for the pipeline's collaborators
///
/// This module provides trait-based abstractions for:
/// - Persistence (ClickHouse, in-memory)
/// - The task queue feeding the worker pool
/// - Text completion (LLM providers) and embeddings
/// - The density baseline anomaly windows are judged against
///
/// This allows you to swap implementations for testing or to point the
/// pipeline at different backends.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::dispatcher::ProcessingTask;
use crate::error::PipelineResult;
use crate::histogram::{BaselineStats, DensityHistogram};
use crate::job::Job;
use crate::log_entry::LogEntry;
use crate::store::{Analytics, LogPage, LogQuery};

// ============================================================================
// Persistence
// ============================================================================

/// Document-store view of the persistence layer.
///
/// Implementations must accept concurrent `insert_entries` calls from
/// several workers. Job updates are last-writer-wins per job id.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Connect / create schema. Called once at startup.
    async fn init(&self) -> PipelineResult<()>;

    /// Release connections. Called once at shutdown.
    async fn close(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Cheap liveness probe for health checks
    async fn ping(&self) -> bool;

    async fn insert_job(&self, job: &Job) -> PipelineResult<()>;

    /// Overwrite the stored job with `job` (keyed by `job.job_id`)
    async fn update_job(&self, job: &Job) -> PipelineResult<()>;

    async fn get_job(&self, job_id: &str) -> PipelineResult<Option<Job>>;

    /// Persist entries, returning how many were written
    async fn insert_entries(&self, entries: &[LogEntry]) -> PipelineResult<u64>;

    /// Filter, sort by timestamp descending, paginate
    async fn query_logs(&self, query: &LogQuery) -> PipelineResult<LogPage>;

    async fn analytics(&self, now: DateTime<Utc>) -> PipelineResult<Analytics>;

    /// Most recent entries, optionally restricted to `<job_id>:<line_index>` ids
    async fn recent_entries(&self, ids: &[String], limit: usize) -> PipelineResult<Vec<LogEntry>>;

    /// Get the name/identifier of this store (for reporting)
    fn name(&self) -> &str;
}

// ============================================================================
// Task Queue
// ============================================================================

/// Hand-off point between submission and the worker pool.
///
/// `submit` either accepts the task (it will be delivered at least once) or
/// fails synchronously.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, task: ProcessingTask) -> PipelineResult<()>;

    /// Stop accepting tasks and drain what was already accepted
    async fn shutdown(&self) {}

    fn name(&self) -> &str;
}

// ============================================================================
// Text Completion / Embeddings
// ============================================================================

/// A fallible, possibly slow text-completion service
///
/// Implementations can use:
/// - LLM APIs (OpenAI, Anthropic, Ollama, etc.)
/// - Canned responses in tests
#[async_trait]
pub trait TextCompletion: Send + Sync {
    /// Complete `prompt` under the given system instruction
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed every text, preserving order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn name(&self) -> &str;
}

// ============================================================================
// Anomaly Baseline
// ============================================================================

/// Supplies the density baseline each (service, window) bucket is compared to.
///
/// The default compares a window against the rest of its own batch; other
/// implementations can bring in history from earlier jobs.
pub trait BaselineProvider: Send + Sync {
    /// Baseline per window of `histogram`. Windows in `exclude` must not
    /// contribute to any baseline, and a window never contributes to its own.
    fn baselines(
        &self,
        service: &str,
        histogram: &DensityHistogram,
        exclude: &BTreeSet<i64>,
    ) -> BTreeMap<i64, Option<BaselineStats>>;

    fn name(&self) -> &str;
}
