/// Entry point of the library: submit uploads, poll jobs, parse and score
/// ad-hoc text without going through the queue.
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

use crate::anomaly_scorer::AnomalyScorer;
use crate::coordinator::JobCoordinator;
use crate::dispatcher::{ChannelQueue, ProcessingTask, QueueConfig};
use crate::error::PipelineResult;
use crate::job::{Job, JobStatusView};
use crate::line_parser::{LineParser, ParserConfig};
use crate::log_entry::LogEntry;
use crate::scorer_config::ScorerConfig;
use crate::traits::{LogStore, TaskQueue};
use crate::worker::JobWorker;

/// Knobs for `LogPipeline::start`
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub parser: ParserConfig,
    pub scorer: ScorerConfig,
    pub queue: QueueConfig,
}

pub struct LogPipeline {
    coordinator: Arc<JobCoordinator>,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn LogStore>,
    parser: Arc<LineParser>,
    scorer: Arc<AnomalyScorer>,
}

impl LogPipeline {
    /// Wire the default in-process worker pool around `store`
    pub fn start(store: Arc<dyn LogStore>, options: PipelineOptions) -> Self {
        let scorer = AnomalyScorer::with_config(options.scorer);
        Self::start_with_scorer(store, options.parser, scorer, options.queue)
    }

    /// Like `start`, with a preconfigured scorer (e.g. a historical baseline)
    pub fn start_with_scorer(
        store: Arc<dyn LogStore>,
        parser: ParserConfig,
        scorer: AnomalyScorer,
        queue: QueueConfig,
    ) -> Self {
        let coordinator = Arc::new(JobCoordinator::new(store.clone()));
        let parser = Arc::new(LineParser::with_config(parser));
        let scorer = Arc::new(scorer);

        let worker = Arc::new(JobWorker::new(
            coordinator.clone(),
            store.clone(),
            parser.clone(),
            scorer.clone(),
        ));
        let queue: Arc<dyn TaskQueue> = Arc::new(ChannelQueue::start(queue, worker));

        Self {
            coordinator,
            queue,
            store,
            parser,
            scorer,
        }
    }

    /// Assemble a pipeline around an externally managed queue
    pub fn with_queue(
        store: Arc<dyn LogStore>,
        queue: Arc<dyn TaskQueue>,
        parser: ParserConfig,
        scorer: AnomalyScorer,
    ) -> Self {
        Self {
            coordinator: Arc::new(JobCoordinator::new(store.clone())),
            queue,
            store,
            parser: Arc::new(LineParser::with_config(parser)),
            scorer: Arc::new(scorer),
        }
    }

    /// Record a Queued job and hand the content to the queue.
    ///
    /// Returns as soon as the task is accepted. If the queue refuses it the
    /// job is marked Failed and the dispatch error is returned.
    pub async fn submit(&self, raw: impl Into<Arc<str>>, filename: &str) -> PipelineResult<String> {
        Ok(self.submit_job(raw, filename).await?.job_id)
    }

    /// `submit`, returning the Queued job record
    pub async fn submit_job(&self, raw: impl Into<Arc<str>>, filename: &str) -> PipelineResult<Job> {
        let job = self.coordinator.create(filename, Utc::now()).await?;
        let task = ProcessingTask::new(&job.job_id, raw.into(), filename, job.created_at);

        if let Err(e) = self.queue.submit(task).await {
            error!("Dispatch failed for job {}: {}", job.job_id, e);
            if let Err(mark) = self.coordinator.fail(&job.job_id, &e.to_string()).await {
                error!("Could not mark job {} failed: {}", job.job_id, mark);
            }
            return Err(e);
        }

        info!("Queued job {} ({})", job.job_id, filename);
        Ok(job)
    }

    pub async fn get_job_status(&self, job_id: &str) -> PipelineResult<JobStatusView> {
        self.coordinator.status(job_id).await
    }

    /// Full job record
    pub async fn get_job(&self, job_id: &str) -> PipelineResult<Job> {
        self.coordinator.job(job_id).await
    }

    /// Parse text without creating a job
    pub fn parse(&self, text: &str) -> PipelineResult<Vec<LogEntry>> {
        self.parser.parse(text)
    }

    /// Score a batch without persisting it
    pub fn score(&self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        self.scorer.score(entries)
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn scorer(&self) -> &AnomalyScorer {
        &self.scorer
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
