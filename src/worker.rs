/// Executes one job end to end: parse -> score -> persist -> status update
use std::sync::Arc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::anomaly_scorer::AnomalyScorer;
use crate::coordinator::JobCoordinator;
use crate::dispatcher::ProcessingTask;
use crate::error::{PipelineError, PipelineResult};
use crate::line_parser::LineParser;
use crate::store::ANOMALY_THRESHOLD;
use crate::traits::LogStore;

pub struct JobWorker {
    coordinator: Arc<JobCoordinator>,
    store: Arc<dyn LogStore>,
    parser: Arc<LineParser>,
    scorer: Arc<AnomalyScorer>,
}

impl JobWorker {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        store: Arc<dyn LogStore>,
        parser: Arc<LineParser>,
        scorer: Arc<AnomalyScorer>,
    ) -> Self {
        Self {
            coordinator,
            store,
            parser,
            scorer,
        }
    }

    /// Process a delivered task. Job-fatal errors are recorded on the job;
    /// a panic anywhere in here is left to the dispatcher to redeliver.
    pub async fn process(&self, task: &ProcessingTask) {
        if task.is_redelivery() {
            info!("Redelivery {} of job {}", task.delivery, task.job_id);
        }

        let job = match self.coordinator.mark_processing(&task.job_id).await {
            Ok(job) => job,
            Err(PipelineError::InvalidTransition { from, .. }) if from.is_terminal() => {
                info!("Job {} already {}, nothing to do", task.job_id, from);
                return;
            }
            Err(e) => {
                error!("Could not start job {}: {}", task.job_id, e);
                self.abandon(task, &e.to_string()).await;
                return;
            }
        };

        let start = Instant::now();
        match self.run(task, job.created_at).await {
            Ok(count) => match self.coordinator.complete(&task.job_id, count).await {
                Ok(_) => info!(
                    "Job {} completed: {} entries in {:?}",
                    task.job_id,
                    count,
                    start.elapsed()
                ),
                Err(e) => {
                    error!("Job {} persisted but could not be completed: {}", task.job_id, e);
                    self.abandon(task, &e.to_string()).await;
                }
            },
            Err(e) => {
                error!("Job {} failed: {}", task.job_id, e);
                self.abandon(task, &e.to_string()).await;
            }
        }
    }

    /// Mark the job Failed with `reason`
    pub async fn abandon(&self, task: &ProcessingTask, reason: &str) {
        if let Err(e) = self.coordinator.fail(&task.job_id, reason).await {
            error!("Could not mark job {} failed: {}", task.job_id, e);
        }
    }

    async fn run(
        &self,
        task: &ProcessingTask,
        ingested_at: chrono::DateTime<chrono::Utc>,
    ) -> PipelineResult<u64> {
        let parser = self.parser.clone();
        let content = task.content.clone();
        let job_id = task.job_id.clone();
        let entries = tokio::task::spawn_blocking(move || {
            parser.parse_job(&content, &job_id, ingested_at)
        })
        .await
        .unwrap_or_else(resume_panic)?;

        debug!("Job {}: parsed {} entries", task.job_id, entries.len());

        let scorer = self.scorer.clone();
        let scored = tokio::task::spawn_blocking(move || scorer.score(entries))
            .await
            .unwrap_or_else(resume_panic);

        let anomalous = scored.iter().filter(|e| e.anomaly_score >= ANOMALY_THRESHOLD).count();
        if anomalous > 0 {
            debug!("Job {}: {} anomalous entries", task.job_id, anomalous);
        }

        let written = self.store.insert_entries(&scored).await?;
        if written != scored.len() as u64 {
            warn!(
                "Job {}: store reported {} of {} entries written",
                task.job_id,
                written,
                scored.len()
            );
        }
        Ok(written)
    }
}

/// Re-raise a blocking-task panic on this task so the dispatcher sees it
fn resume_panic<T>(err: JoinError) -> T {
    match err.try_into_panic() {
        Ok(payload) => std::panic::resume_unwind(payload),
        Err(err) => panic!("blocking task cancelled: {}", err),
    }
}
