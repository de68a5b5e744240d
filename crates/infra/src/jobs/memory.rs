//! In-memory job queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use storefront_core::JobId;
use storefront_events::JobEventKind;

use super::queue::{JobEvents, JobQueue, LifecycleBus, QueueError};
use super::types::{FailOutcome, Job, JobCounts, JobPayload, JobState, QueuePolicy};

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    waiting: VecDeque<JobId>,
    next_seq: u64,
}

/// In-memory job queue.
///
/// - Same lease/stall/retry semantics as the Redis queue
/// - Not durable across restarts
/// - Lease expiry is evaluated lazily by [`JobQueue::recover_stalled`]
#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    policy: QueuePolicy,
    events: JobEvents,
    inner: Mutex<Inner>,
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>, policy: QueuePolicy, bus: Arc<LifecycleBus>) -> Self {
        let name = name.into();
        Self {
            events: JobEvents::new(name.clone(), bus),
            name,
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Backend("job queue lock poisoned".to_string()))
    }

    fn leased_mut<'a>(
        inner: &'a mut Inner,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<&'a mut Job, QueueError> {
        let entry = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if entry.job.state != JobState::Active || !entry.job.is_leased_by(worker_id) {
            return Err(QueueError::LeaseLost(job_id));
        }
        Ok(&mut entry.job)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    async fn enqueue(&self, payload: JobPayload) -> Result<JobId, QueueError> {
        let job = Job::new(self.name.clone(), payload);
        let id = job.id;
        {
            let mut inner = self.lock()?;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.jobs.insert(id, Entry { seq, job });
            inner.waiting.push_back(id);
        }
        self.events.emit(id, JobEventKind::Waiting);
        Ok(id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let claimed = {
            let mut inner = self.lock()?;
            let mut claimed = None;
            while let Some(id) = inner.waiting.pop_front() {
                if let Some(entry) = inner.jobs.get_mut(&id) {
                    entry.job.mark_active(worker_id, self.policy.stall_timeout);
                    claimed = Some(entry.job.clone());
                    break;
                }
            }
            claimed
        };

        if let Some(job) = &claimed {
            self.events.emit(
                job.id,
                JobEventKind::Active {
                    attempt: job.attempts_made,
                },
            );
        }
        Ok(claimed)
    }

    async fn extend_lease(&self, job_id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        let job = Self::leased_mut(&mut inner, job_id, worker_id)?;
        if job.lease_expired(Utc::now()) {
            return Err(QueueError::LeaseLost(job_id));
        }
        job.renew_lease(self.policy.stall_timeout);
        Ok(())
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
    ) -> Result<Job, QueueError> {
        let job = {
            let mut inner = self.lock()?;
            let job = Self::leased_mut(&mut inner, job_id, worker_id)?;
            job.mark_completed(result.clone());
            job.clone()
        };
        self.events.emit(job_id, JobEventKind::Completed { result });
        Ok(job)
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Job, QueueError> {
        let job = {
            let mut inner = self.lock()?;
            let job = Self::leased_mut(&mut inner, job_id, worker_id)?;
            let outcome = FailOutcome::decide(&self.policy.retry, job.attempts_made, retryable);
            job.mark_failed(error, outcome);
            let job = job.clone();
            if outcome == FailOutcome::RetryNow {
                inner.waiting.push_back(job_id);
            }
            job
        };
        self.events.emit_failure(&job, error);
        Ok(job)
    }

    async fn promote_delayed(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let promoted = {
            let mut inner = self.lock()?;
            let mut ready: Vec<(u64, JobId)> = inner
                .jobs
                .values()
                .filter(|e| e.job.state == JobState::Delayed && e.job.is_ready(now))
                .map(|e| (e.seq, e.job.id))
                .collect();
            ready.sort();

            for (_, id) in &ready {
                if let Some(entry) = inner.jobs.get_mut(id) {
                    entry.job.state = JobState::Waiting;
                    entry.job.scheduled_at = None;
                }
                inner.waiting.push_back(*id);
            }
            ready
        };

        for (_, id) in &promoted {
            self.events.emit(*id, JobEventKind::Waiting);
        }
        Ok(promoted.len())
    }

    async fn recover_stalled(&self) -> Result<Vec<JobId>, QueueError> {
        let now = Utc::now();
        let stalled = {
            let mut inner = self.lock()?;
            let mut expired: Vec<(u64, JobId)> = inner
                .jobs
                .values()
                .filter(|e| e.job.state == JobState::Active && e.job.lease_expired(now))
                .map(|e| (e.seq, e.job.id))
                .collect();
            expired.sort();

            let mut stalled = Vec::with_capacity(expired.len());
            // Redelivered jobs go to the front, oldest first.
            for (_, id) in expired.iter().rev() {
                let Some(entry) = inner.jobs.get_mut(id) else {
                    continue;
                };
                let requeued = entry.job.mark_stalled(self.policy.max_stalled_count);
                stalled.push((entry.job.clone(), requeued));
                if requeued {
                    inner.waiting.push_front(*id);
                }
            }
            stalled.reverse();
            stalled
        };

        for (job, requeued) in &stalled {
            self.events.emit(job.id, JobEventKind::Stalled);
            if *requeued {
                self.events.emit(job.id, JobEventKind::Waiting);
            } else {
                self.events.emit_failure(job, job.failed_reason.as_deref().unwrap_or_default());
            }
        }
        Ok(stalled.into_iter().map(|(job, _)| job.id).collect())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let inner = self.lock()?;
        Ok(inner.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let inner = self.lock()?;
        let mut entries: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| e.job.state == state)
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }

    async fn retry_failed(&self, job_id: JobId) -> Result<Job, QueueError> {
        let job = {
            let mut inner = self.lock()?;
            let entry = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::NotFound(job_id))?;
            if entry.job.state != JobState::Failed {
                return Err(QueueError::InvalidState {
                    job_id,
                    actual: entry.job.state,
                    expected: JobState::Failed,
                });
            }
            entry.job.reset_for_retry();
            let job = entry.job.clone();
            inner.waiting.push_back(job_id);
            job
        };
        self.events.emit(job_id, JobEventKind::Waiting);
        Ok(job)
    }

    async fn remove(&self, job_id: JobId) -> Result<(), QueueError> {
        {
            let mut inner = self.lock()?;
            let entry = inner.jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;
            if entry.job.state == JobState::Active && !entry.job.lease_expired(Utc::now()) {
                return Err(QueueError::Locked(job_id));
            }
            inner.jobs.remove(&job_id);
            inner.waiting.retain(|id| *id != job_id);
        }
        self.events.emit(job_id, JobEventKind::Removed);
        Ok(())
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let inner = self.lock()?;
        let mut counts = JobCounts::default();
        for entry in inner.jobs.values() {
            counts.record(entry.job.state);
        }
        Ok(counts)
    }
}
