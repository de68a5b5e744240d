//! Job queue abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use storefront_core::JobId;
use storefront_events::{EventBus, InMemoryEventBus, JobEvent, JobEventKind};

use super::types::{Job, JobCounts, JobPayload, JobState, QueuePolicy};

/// Bus carrying job lifecycle notifications.
pub type LifecycleBus = InMemoryEventBus<JobEvent>;

/// Job queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is locked by an active worker")]
    Locked(JobId),
    #[error("lease on job {0} is not held by this worker")]
    LeaseLost(JobId),
    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        actual: JobState,
        expected: JobState,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Durable FIFO of mutation requests with leased, at-least-once delivery.
///
/// A claimed job is leased to one worker. The worker renews the lease with
/// [`extend_lease`](JobQueue::extend_lease) while it processes, then settles the job with
/// [`complete`](JobQueue::complete) or [`fail`](JobQueue::fail). A lease that lapses is picked up
/// by [`recover_stalled`](JobQueue::recover_stalled) and the job is redelivered.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name (e.g. `productQueue`).
    fn name(&self) -> &str;

    fn policy(&self) -> &QueuePolicy;

    /// Persist a new job in `waiting`. The job is durable once this returns.
    async fn enqueue(&self, payload: JobPayload) -> Result<JobId, QueueError>;

    /// Lease the oldest waiting job to `worker_id`. `None` when nothing is waiting.
    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Push the lease deadline out by another stall timeout.
    async fn extend_lease(&self, job_id: JobId, worker_id: &str) -> Result<(), QueueError>;

    /// Settle a leased job as completed with `result`.
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
    ) -> Result<Job, QueueError>;

    /// Settle a leased job as failed. The retry policy decides whether it runs again;
    /// `retryable = false` fails it terminally.
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Job, QueueError>;

    /// Move delayed jobs whose backoff elapsed back to `waiting`. Returns how many moved.
    async fn promote_delayed(&self) -> Result<usize, QueueError>;

    /// Detect active jobs whose lease lapsed; redeliver or fail them. Returns the stalled ids.
    async fn recover_stalled(&self) -> Result<Vec<JobId>, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Jobs in `state`, oldest first.
    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Re-queue a failed job with a fresh retry budget.
    async fn retry_failed(&self, job_id: JobId) -> Result<Job, QueueError>;

    /// Delete a job that is not currently leased.
    async fn remove(&self, job_id: JobId) -> Result<(), QueueError>;

    async fn counts(&self) -> Result<JobCounts, QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn policy(&self) -> &QueuePolicy {
        (**self).policy()
    }

    async fn enqueue(&self, payload: JobPayload) -> Result<JobId, QueueError> {
        (**self).enqueue(payload).await
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        (**self).claim(worker_id).await
    }

    async fn extend_lease(&self, job_id: JobId, worker_id: &str) -> Result<(), QueueError> {
        (**self).extend_lease(job_id, worker_id).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
    ) -> Result<Job, QueueError> {
        (**self).complete(job_id, worker_id, result).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Job, QueueError> {
        (**self).fail(job_id, worker_id, error, retryable).await
    }

    async fn promote_delayed(&self) -> Result<usize, QueueError> {
        (**self).promote_delayed().await
    }

    async fn recover_stalled(&self) -> Result<Vec<JobId>, QueueError> {
        (**self).recover_stalled().await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        (**self).get(job_id).await
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        (**self).list(state, limit).await
    }

    async fn retry_failed(&self, job_id: JobId) -> Result<Job, QueueError> {
        (**self).retry_failed(job_id).await
    }

    async fn remove(&self, job_id: JobId) -> Result<(), QueueError> {
        (**self).remove(job_id).await
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        (**self).counts().await
    }
}

/// Publishes lifecycle notifications for one queue.
///
/// Publishing is best-effort: a failure is logged and never changes job state.
#[derive(Debug, Clone)]
pub struct JobEvents {
    queue: String,
    bus: Arc<LifecycleBus>,
}

impl JobEvents {
    pub fn new(queue: impl Into<String>, bus: Arc<LifecycleBus>) -> Self {
        Self {
            queue: queue.into(),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<LifecycleBus> {
        &self.bus
    }

    pub fn emit(&self, job_id: JobId, kind: JobEventKind) {
        let event = JobEvent::new(self.queue.clone(), job_id, kind);
        if let Err(e) = self.bus.publish(event) {
            warn!(queue = %self.queue, job_id = %job_id, error = ?e, "failed to publish job event");
        }
    }

    /// Events for a failed attempt, given the job after it was settled.
    pub(crate) fn emit_failure(&self, job: &Job, error: &str) {
        let will_retry = !job.state.is_terminal();
        self.emit(
            job.id,
            JobEventKind::Failed {
                error: error.to_string(),
                attempts: job.attempts_made,
                will_retry,
            },
        );
        match job.state {
            JobState::Waiting => self.emit(job.id, JobEventKind::Waiting),
            JobState::Delayed => {
                let delay_ms = job
                    .scheduled_at
                    .map(|at| (at - chrono::Utc::now()).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                self.emit(job.id, JobEventKind::Delayed { delay_ms });
            }
            _ => {}
        }
    }
}
