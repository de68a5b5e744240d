//! Queue worker: applies queued mutations and invalidates the collection cache.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use storefront_core::{CatalogEntity, EntityId, JobId};

use super::queue::{JobQueue, QueueError};
use super::types::{Job, JobState, Mutation, PayloadError};
use crate::cache::CacheStore;
use crate::store::{EntityStore, StoreError};

/// Why a job attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: EntityId },
    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: EntityId },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("stored record unreadable: {0}")]
    Corrupt(String),
}

impl JobError {
    /// Only transient store failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::StoreUnavailable(_))
    }
}

impl From<PayloadError> for JobError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::UnknownOperation(op) => JobError::InvalidOperation(op),
            PayloadError::Malformed(msg) => JobError::InvalidPayload(msg),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { kind, id } => JobError::Conflict { kind, id },
            StoreError::NotFound { kind, id } => JobError::NotFound { kind, id },
            StoreError::Unavailable(msg) => JobError::StoreUnavailable(msg),
            StoreError::Serialization(msg) => JobError::Corrupt(msg),
        }
    }
}

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum jobs processed at once
    pub concurrency: usize,
    /// How long to wait before polling an empty queue again
    pub poll_interval: Duration,
    /// How often to look for stalled jobs (defaults to the queue's stall timeout)
    pub stall_check_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
            stall_check_interval: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop claiming new jobs and wait for in-flight jobs to settle.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

/// Consumes one queue and applies its jobs to the store for entity type `E`.
///
/// Per job: decode the mutation, write it, then delete the collection's cache entry. The
/// invalidation only happens after a successful write and its failure never fails the job.
pub struct Worker<E: CatalogEntity> {
    id: String,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn EntityStore<E>>,
    cache: Arc<dyn CacheStore>,
}

impl<E: CatalogEntity> Worker<E> {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn EntityStore<E>>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            id: format!("{}:{}", queue.name(), Uuid::new_v4()),
            queue,
            store,
            cache,
        }
    }

    /// Override the lease owner id (defaults to `<queue>:<uuid>`).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Apply the job's mutation and invalidate the collection snapshot.
    pub async fn process(&self, job: &Job) -> Result<E, JobError> {
        let entity = match Mutation::<E>::from_payload(&job.payload)? {
            Mutation::Create(mut entity) => {
                entity.stamp_created(Utc::now());
                self.store.insert(entity).await?
            }
            Mutation::Update { id, patch } => {
                let mut entity = self.store.get(&id).await?.ok_or(JobError::NotFound {
                    kind: E::KIND,
                    id,
                })?;
                entity.apply_patch(&patch, Utc::now());
                self.store.update(entity).await?
            }
        };

        self.invalidate(job.id).await;
        Ok(entity)
    }

    async fn invalidate(&self, job_id: JobId) {
        let key = E::list_cache_key();
        match self.cache.delete(&key).await {
            Ok(()) => debug!(job_id = %job_id, key = %key, "cache invalidated"),
            Err(e) => warn!(job_id = %job_id, key = %key, error = %e, "cache invalidation failed"),
        }
    }

    /// Process a claimed job and settle it on the queue. Returns the settled job.
    pub async fn execute(&self, job: Job) -> Result<Job, QueueError> {
        let heartbeat = self.start_heartbeat(job.id);
        let outcome = self.process(&job).await;
        heartbeat.abort();

        match outcome {
            Ok(entity) => {
                let result = serde_json::to_value(&entity).unwrap_or_else(|e| {
                    warn!(job_id = %job.id, error = %e, "failed to encode job result");
                    JsonValue::Null
                });
                debug!(job_id = %job.id, queue = %self.queue.name(), "job completed");
                self.queue.complete(job.id, &self.id, result).await
            }
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    queue = %self.queue.name(),
                    attempt = job.attempts_made,
                    retryable = err.is_retryable(),
                    error = %err,
                    "job attempt failed"
                );
                self.queue
                    .fail(job.id, &self.id, &err.to_string(), err.is_retryable())
                    .await
            }
        }
    }

    /// Promote due retries, then claim and execute at most one job.
    ///
    /// Returns the settled job, or `None` when nothing was waiting.
    pub async fn run_once(&self) -> Result<Option<Job>, QueueError> {
        self.queue.promote_delayed().await?;
        match self.queue.claim(&self.id).await? {
            Some(job) => self.execute(job).await.map(Some),
            None => Ok(None),
        }
    }

    fn start_heartbeat(&self, job_id: JobId) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let owner = self.id.clone();
        let every = queue.policy().heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately; the lease is fresh at claim time.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.extend_lease(job_id, &owner).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost(_)) => {
                        warn!(job_id = %job_id, "lease lost while processing");
                        break;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "failed to extend lease"),
                }
            }
        })
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(
            Arc::new(self),
            config,
            shutdown_rx,
            stats.clone(),
        ));

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn with_stats(stats: &Mutex<WorkerStats>, update: impl FnOnce(&mut WorkerStats)) {
    if let Ok(mut stats) = stats.lock() {
        update(&mut stats);
    }
}

async fn worker_loop<E: CatalogEntity>(
    worker: Arc<Worker<E>>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let queue_name = worker.queue.name().to_string();
    info!(
        worker = %config.name,
        queue = %queue_name,
        concurrency = config.concurrency,
        "worker started"
    );

    let started = Instant::now();
    let concurrency = config.concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    let stall_every = config
        .stall_check_interval
        .unwrap_or(worker.queue.policy().stall_timeout);
    let mut last_stall_check: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        with_stats(&stats, |s| s.uptime_secs = started.elapsed().as_secs());

        if last_stall_check.is_none_or(|at| at.elapsed() >= stall_every) {
            last_stall_check = Some(Instant::now());
            match worker.queue.recover_stalled().await {
                Ok(stalled) if !stalled.is_empty() => {
                    warn!(worker = %config.name, count = stalled.len(), "recovered stalled jobs");
                }
                Ok(_) => {}
                Err(e) => error!(worker = %config.name, error = %e, "stall check failed"),
            }
        }

        if let Err(e) = worker.queue.promote_delayed().await {
            error!(worker = %config.name, error = %e, "failed to promote delayed jobs");
        }

        match worker.queue.claim(&worker.id).await {
            Ok(Some(job)) => {
                debug!(worker = %config.name, job_id = %job.id, attempt = job.attempts_made, "claimed job");
                with_stats(&stats, |s| s.current_running += 1);

                let worker = worker.clone();
                let stats = stats.clone();
                let name = config.name.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let job_id = job.id;
                    let settled = worker.execute(job).await;

                    with_stats(&stats, |s| {
                        s.current_running = s.current_running.saturating_sub(1);
                        s.jobs_processed += 1;
                        match &settled {
                            Ok(job) if job.state == JobState::Completed => s.jobs_succeeded += 1,
                            _ => s.jobs_failed += 1,
                        }
                    });

                    match settled {
                        Err(QueueError::LeaseLost(_)) => {
                            warn!(worker = %name, job_id = %job_id, "lease lost before settling; job will be redelivered");
                        }
                        Err(e) => error!(worker = %name, job_id = %job_id, error = %e, "failed to settle job"),
                        Ok(_) => {}
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(worker = %config.name, error = %e, "failed to claim job");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    // Drain: every permit comes back once in-flight jobs settle.
    let _ = permits.acquire_many(concurrency as u32).await;
    info!(worker = %config.name, queue = %queue_name, "worker stopped");
}
