/// Job lifecycle owner
///
/// Every status change goes through `transition`, which reads the stored
/// job, checks the move against `JobStatus::can_transition_to` and writes
/// the job back.
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::job::{Job, JobStatus, JobStatusView};
use crate::traits::LogStore;

pub struct JobCoordinator {
    store: Arc<dyn LogStore>,
}

impl JobCoordinator {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    /// Record a new Queued job
    pub async fn create(&self, filename: &str, now: DateTime<Utc>) -> PipelineResult<Job> {
        let job = Job::new(filename, now);
        self.store.insert_job(&job).await?;
        debug!("Created job {} for {}", job.job_id, filename);
        Ok(job)
    }

    pub async fn mark_processing(&self, job_id: &str) -> PipelineResult<Job> {
        self.transition(job_id, JobStatus::Processing, |_| {}).await
    }

    pub async fn complete(&self, job_id: &str, processed_count: u64) -> PipelineResult<Job> {
        self.transition(job_id, JobStatus::Completed, |job| {
            job.processed_count = processed_count;
            job.error = None;
        })
        .await
    }

    pub async fn fail(&self, job_id: &str, error: &str) -> PipelineResult<Job> {
        self.transition(job_id, JobStatus::Failed, |job| {
            job.error = Some(error.to_string());
        })
        .await
    }

    pub async fn status(&self, job_id: &str) -> PipelineResult<JobStatusView> {
        Ok(self.job(job_id).await?.status_view())
    }

    pub async fn job(&self, job_id: &str) -> PipelineResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }

    async fn transition(
        &self,
        job_id: &str,
        to: JobStatus,
        apply: impl FnOnce(&mut Job) + Send,
    ) -> PipelineResult<Job> {
        let mut job = self.job(job_id).await?;

        if !job.status.can_transition_to(to) {
            warn!("Rejected transition {} -> {} for job {}", job.status, to, job_id);
            return Err(PipelineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to,
            });
        }

        job.status = to;
        job.updated_at = Utc::now().max(job.updated_at);
        apply(&mut job);

        self.store.update_job(&job).await?;
        debug!("Job {} is now {}", job_id, to);
        Ok(job)
    }
}
