//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use storefront_core::{CatalogEntity, EntityId, JobId};

/// Mutation kinds understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            other => Err(other.to_string()),
        }
    }
}

/// Body of a queued mutation: `{"operation": "...", "data": {...}}`.
///
/// The operation stays a plain string on the wire so a job carrying a tag this build does not
/// know about can still be stored, claimed and failed with a readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub operation: String,
    pub data: JsonValue,
}

/// `data` of an update job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateData<P> {
    pub id: EntityId,
    #[serde(rename = "updatedData")]
    pub updated_data: P,
}

impl JobPayload {
    pub fn new(operation: Operation, data: JsonValue) -> Self {
        Self {
            operation: operation.as_str().to_string(),
            data,
        }
    }

    /// Payload that inserts `entity` as-is (its id is already assigned).
    pub fn create<E: Serialize>(entity: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::new(Operation::Create, serde_json::to_value(entity)?))
    }

    /// Payload that applies `patch` to the record with `id`.
    pub fn update<P: Serialize>(id: EntityId, patch: P) -> Result<Self, serde_json::Error> {
        let data = UpdateData {
            id,
            updated_data: patch,
        };
        Ok(Self::new(Operation::Update, serde_json::to_value(data)?))
    }

    /// The operation, if it is one this build understands.
    pub fn parsed_operation(&self) -> Option<Operation> {
        self.operation.parse().ok()
    }
}

/// A decoded mutation for entity type `E`.
#[derive(Debug, Clone)]
pub enum Mutation<E: CatalogEntity> {
    Create(E),
    Update { id: EntityId, patch: E::Patch },
}

/// Why a payload could not be turned into a [`Mutation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid operation: {0}")]
    UnknownOperation(String),
    #[error("invalid payload: {0}")]
    Malformed(String),
}

impl<E> Mutation<E>
where
    E: CatalogEntity,
    E::Patch: DeserializeOwned,
{
    pub fn from_payload(payload: &JobPayload) -> Result<Self, PayloadError> {
        let operation = payload
            .parsed_operation()
            .ok_or_else(|| PayloadError::UnknownOperation(payload.operation.clone()))?;

        match operation {
            Operation::Create => serde_json::from_value::<E>(payload.data.clone())
                .map(Mutation::Create)
                .map_err(|e| PayloadError::Malformed(e.to_string())),
            Operation::Update => serde_json::from_value::<UpdateData<E::Patch>>(payload.data.clone())
                .map(|data| Mutation::Update {
                    id: data.id,
                    patch: data.updated_data,
                })
                .map_err(|e| PayloadError::Malformed(e.to_string())),
        }
    }
}

/// Where a job currently sits in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, claimable
    Waiting,
    /// Leased by a worker
    Active,
    /// Waiting out a retry backoff
    Delayed,
    /// Mutation applied
    Completed,
    /// Retry budget exhausted or non-retryable error
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Whether a job that has made `attempts_made` attempts may run again.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Per-queue delivery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub retry: RetryPolicy,
    /// A lease not renewed within this window marks the job stalled.
    pub stall_timeout: Duration,
    /// How many times a job may stall before it is failed instead of redelivered.
    pub max_stalled_count: u32,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stall_timeout: Duration::from_secs(30),
            max_stalled_count: 1,
        }
    }
}

impl QueuePolicy {
    /// Interval at which a worker renews its lease while processing.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stall_timeout / 2).max(Duration::from_millis(10))
    }
}

/// Reason recorded on a job failed by stall recovery.
pub const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// Worker lease on an active job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobAttemptRecord {
    pub fn new(attempt: u32, started_at: DateTime<Utc>, error: Option<String>) -> Self {
        let finished_at = Utc::now();
        Self {
            attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `waiting` right away.
    RetryNow,
    /// Parked in `delayed` for the given backoff.
    RetryAfter(Duration),
    /// Terminally failed.
    Dead,
}

impl FailOutcome {
    pub fn decide(policy: &RetryPolicy, attempts_made: u32, retryable: bool) -> Self {
        if !retryable || !policy.should_retry(attempts_made) {
            return FailOutcome::Dead;
        }
        match policy.delay_for_attempt(attempts_made) {
            Duration::ZERO => FailOutcome::RetryNow,
            delay => FailOutcome::RetryAfter(delay),
        }
    }

    pub fn will_retry(&self) -> bool {
        !matches!(self, FailOutcome::Dead)
    }
}

/// A queued mutation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Queue the job belongs to
    pub queue: String,
    pub payload: JobPayload,
    pub state: JobState,
    /// Attempts started so far (incremented on claim)
    pub attempts_made: u32,
    /// Times the job's lease expired while active
    pub stalled_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// When the current or last attempt started
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes claimable again
    pub scheduled_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub failed_reason: Option<String>,
    /// Result of the completed mutation
    pub return_value: Option<JsonValue>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            stalled_count: 0,
            enqueued_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            scheduled_at: None,
            lease: None,
            failed_reason: None,
            return_value: None,
            history: Vec::new(),
        }
    }

    /// Check if a delayed job's backoff has elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.owner == owner)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_none_or(|lease| lease.expires_at <= now)
    }

    /// Mark job as claimed by `owner`.
    pub fn mark_active(&mut self, owner: &str, lease: Duration) {
        let now = Utc::now();
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.processed_at = Some(now);
        self.scheduled_at = None;
        self.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: now + to_chrono(lease),
        });
    }

    pub fn renew_lease(&mut self, lease: Duration) {
        if let Some(current) = self.lease.as_mut() {
            current.expires_at = Utc::now() + to_chrono(lease);
        }
    }

    /// Mark job as completed with the mutation result.
    pub fn mark_completed(&mut self, result: JsonValue) {
        let started = self.processed_at.unwrap_or(self.enqueued_at);
        let record = JobAttemptRecord::new(self.attempts_made, started, None);
        self.state = JobState::Completed;
        self.finished_at = Some(record.finished_at);
        self.lease = None;
        self.return_value = Some(result);
        self.history.push(record);
    }

    /// Record a failed attempt and move the job according to `outcome`.
    pub fn mark_failed(&mut self, error: &str, outcome: FailOutcome) {
        let started = self.processed_at.unwrap_or(self.enqueued_at);
        let record = JobAttemptRecord::new(self.attempts_made, started, Some(error.to_string()));
        let now = record.finished_at;
        self.history.push(record);
        self.lease = None;
        self.failed_reason = Some(error.to_string());

        match outcome {
            FailOutcome::RetryNow => {
                self.state = JobState::Waiting;
            }
            FailOutcome::RetryAfter(delay) => {
                self.state = JobState::Delayed;
                self.scheduled_at = Some(now + to_chrono(delay));
            }
            FailOutcome::Dead => {
                self.state = JobState::Failed;
                self.finished_at = Some(now);
            }
        }
    }

    /// Record a lease expiry. Returns `true` when the job goes back to `waiting`,
    /// `false` when it exceeded `max_stalled_count` and is now failed.
    pub fn mark_stalled(&mut self, max_stalled_count: u32) -> bool {
        self.stalled_count += 1;
        self.lease = None;
        if self.stalled_count > max_stalled_count {
            self.state = JobState::Failed;
            self.failed_reason = Some(STALLED_LIMIT_REASON.to_string());
            self.finished_at = Some(Utc::now());
            false
        } else {
            self.state = JobState::Waiting;
            true
        }
    }

    /// Reset a failed job so it runs again with a fresh retry budget.
    pub fn reset_for_retry(&mut self) {
        self.state = JobState::Waiting;
        self.attempts_made = 0;
        self.stalled_count = 0;
        self.scheduled_at = None;
        self.finished_at = None;
        self.failed_reason = None;
        self.lease = None;
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }

    pub(crate) fn record(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Active => self.active += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storefront_catalog::{Product, ProductPatch};

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(50, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn fail_outcome_respects_retryability() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert_eq!(FailOutcome::decide(&policy, 1, true), FailOutcome::RetryNow);
        assert_eq!(FailOutcome::decide(&policy, 1, false), FailOutcome::Dead);
        assert_eq!(FailOutcome::decide(&policy, 3, true), FailOutcome::Dead);

        let delayed = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(
            FailOutcome::decide(&delayed, 1, true),
            FailOutcome::RetryAfter(Duration::from_millis(250))
        );
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new("productQueue", JobPayload::new(Operation::Create, json!({})));

        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);

        job.mark_active("worker-1", Duration::from_secs(30));
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 1);
        assert!(job.is_leased_by("worker-1"));
        assert!(!job.lease_expired(Utc::now()));

        job.mark_completed(json!({"id": "p1"}));
        assert_eq!(job.state, JobState::Completed);
        assert!(job.lease.is_none());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn job_failure_and_retry() {
        let mut job = Job::new("productQueue", JobPayload::new(Operation::Create, json!({})));

        job.mark_active("worker-1", Duration::from_secs(30));
        job.mark_failed("error 1", FailOutcome::RetryAfter(Duration::from_secs(5)));
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.scheduled_at.is_some());
        assert!(!job.is_ready(Utc::now()));

        job.mark_active("worker-1", Duration::from_secs(30));
        job.mark_failed("error 2", FailOutcome::Dead);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some("error 2"));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn stalling_past_the_limit_fails_the_job() {
        let mut job = Job::new("productQueue", JobPayload::new(Operation::Create, json!({})));
        job.mark_active("worker-1", Duration::from_millis(1));

        assert!(job.mark_stalled(1));
        assert_eq!(job.state, JobState::Waiting);

        job.mark_active("worker-2", Duration::from_millis(1));
        assert!(!job.mark_stalled(1));
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_LIMIT_REASON));
    }

    #[test]
    fn update_payload_uses_updated_data_key() {
        let patch = ProductPatch {
            price: Some(450),
            ..ProductPatch::default()
        };
        let payload = JobPayload::update(EntityId::parse("p1").unwrap(), &patch).unwrap();
        let wire = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            wire,
            json!({"operation": "update", "data": {"id": "p1", "updatedData": {"price": 450}}})
        );
    }

    #[test]
    fn decodes_create_and_update_mutations() {
        let create = JobPayload {
            operation: "create".into(),
            data: json!({"id": "p1", "name": "bread", "price": 500}),
        };
        match Mutation::<Product>::from_payload(&create).unwrap() {
            Mutation::Create(product) => assert_eq!(product.name, "bread"),
            other => panic!("unexpected mutation: {other:?}"),
        }

        let update = JobPayload {
            operation: "update".into(),
            data: json!({"id": "p1", "updatedData": {"price": 450}}),
        };
        match Mutation::<Product>::from_payload(&update).unwrap() {
            Mutation::Update { id, patch } => {
                assert_eq!(id.as_str(), "p1");
                assert_eq!(patch.price, Some(450));
            }
            other => panic!("unexpected mutation: {other:?}"),
        }
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let payload = JobPayload {
            operation: "delete".into(),
            data: json!({"id": "p1"}),
        };
        let err = Mutation::<Product>::from_payload(&payload).unwrap_err();
        assert_eq!(err, PayloadError::UnknownOperation("delete".into()));
        assert_eq!(err.to_string(), "invalid operation: delete");
    }

    #[test]
    fn update_without_id_is_malformed() {
        let payload = JobPayload {
            operation: "update".into(),
            data: json!({"updatedData": {"price": 1}}),
        };
        assert!(matches!(
            Mutation::<Product>::from_payload(&payload),
            Err(PayloadError::Malformed(_))
        ));
    }
}
