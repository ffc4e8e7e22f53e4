/// In-process task queue feeding the worker pool
///
/// Submissions go through a bounded channel to a dispatcher loop, which only
/// takes the next task once a worker permit is free, so a busy pool fills the
/// channel and `submit` starts refusing. A delivery that panics is retried
/// with exponential backoff until `max_deliveries` is reached.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::traits::TaskQueue;
use crate::worker::JobWorker;

/// One unit of work: the raw upload of a job
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub job_id: String,
    pub content: Arc<str>,
    pub filename: String,
    pub submitted_at: DateTime<Utc>,
    /// 1 on first delivery, incremented on each redelivery
    pub delivery: u32,
}

impl ProcessingTask {
    pub fn new(job_id: &str, content: Arc<str>, filename: &str, submitted_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            content,
            filename: filename.to_string(),
            submitted_at,
            delivery: 0,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery > 1
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Tasks that may wait in the channel before `submit` is refused
    pub capacity: usize,
    pub workers: usize,
    pub max_deliveries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 4,
            max_deliveries: 3,
            initial_backoff_ms: 500,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }
}

pub struct ChannelQueue {
    tx: Mutex<Option<mpsc::Sender<ProcessingTask>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelQueue {
    /// Spawn the dispatcher loop. Must be called inside a tokio runtime.
    pub fn start(config: QueueConfig, worker: Arc<JobWorker>) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));

        info!(
            "Starting task queue (capacity: {}, workers: {}, max deliveries: {})",
            config.capacity, config.workers, config.max_deliveries
        );
        let dispatcher = tokio::spawn(dispatch_loop(rx, worker, config));

        Self {
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }
}

#[async_trait]
impl TaskQueue for ChannelQueue {
    async fn submit(&self, task: ProcessingTask) -> PipelineResult<()> {
        let guard = self.tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| PipelineError::Dispatch("queue is shut down".to_string()))?;

        tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => {
                PipelineError::Dispatch(format!("queue full, rejected job {}", task.job_id))
            }
            mpsc::error::TrySendError::Closed(task) => {
                PipelineError::Dispatch(format!("queue closed, rejected job {}", task.job_id))
            }
        })
    }

    /// Stop accepting work and wait for in-flight jobs to finish
    async fn shutdown(&self) {
        self.tx.lock().await.take();

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Task dispatcher ended abnormally: {}", e);
            }
        }
        info!("Task queue stopped");
    }

    fn name(&self) -> &str {
        "channel"
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<ProcessingTask>,
    worker: Arc<JobWorker>,
    config: QueueConfig,
) {
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        // Reap finished deliveries while waiting for a free worker
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => permit,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
        };
        let Ok(permit) = permit else {
            error!("Worker pool closed, stopping dispatcher");
            break;
        };

        let Some(task) = rx.recv().await else {
            break;
        };
        debug!("Dispatching job {}", task.job_id);
        in_flight.spawn(deliver(task, worker.clone(), permit, config.clone()));
    }

    if !in_flight.is_empty() {
        info!("Queue closed, waiting for {} in-flight job(s)", in_flight.len());
    }
    while in_flight.join_next().await.is_some() {}
    debug!("Task dispatcher stopped");
}

/// Run a task until it returns normally or exhausts its deliveries
///
/// The worker permit is held across redeliveries and their backoff.
async fn deliver(
    mut task: ProcessingTask,
    worker: Arc<JobWorker>,
    _permit: OwnedSemaphorePermit,
    config: QueueConfig,
) {
    let mut backoff_ms = config.initial_backoff_ms;

    loop {
        task.delivery += 1;

        let attempt = {
            let worker = worker.clone();
            let task = task.clone();
            tokio::spawn(async move {
                worker.process(&task).await;
            })
        };

        match attempt.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                if task.delivery >= config.max_deliveries {
                    error!(
                        "Job {} crashed on delivery {}, giving up",
                        task.job_id, task.delivery
                    );
                    worker
                        .abandon(
                            &task,
                            &format!("task crashed after {} deliveries", task.delivery),
                        )
                        .await;
                    return;
                }

                warn!(
                    "Job {} crashed on delivery {}, redelivering in {}ms",
                    task.job_id, task.delivery, backoff_ms
                );

                let jitter = (backoff_ms as f64 * 0.1 * rand::random::<f64>()) as u64;
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms = backoff_ms.saturating_mul(2);
            }
            Err(e) => {
                error!("Job {} was cancelled: {}", task.job_id, e);
                return;
            }
        }
    }
}
