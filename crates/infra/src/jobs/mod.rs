//! Write queue: leased jobs with retry, backoff and stall recovery.
//!
//! ## Design
//!
//! - One queue per collection (`productQueue`, `categoryQueue`)
//! - At-least-once delivery: a job whose lease lapses is redelivered
//! - Retry policy with fixed or exponential backoff
//! - Terminally failed jobs stay inspectable and can be retried or removed
//! - Lifecycle notifications on an [`EventBus`](storefront_events::EventBus)
//!
//! ## Components
//!
//! - `Job`: queued mutation with its counters and attempt history
//! - `JobQueue`: queue abstraction (`InMemoryJobQueue`, `RedisJobQueue`)
//! - `Worker`: claims jobs, applies them to the entity store, invalidates the cache

pub mod memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;
pub mod worker;

pub use memory::InMemoryJobQueue;
pub use queue::{JobEvents, JobQueue, LifecycleBus, QueueError};
#[cfg(feature = "redis")]
pub use self::redis::RedisJobQueue;
pub use types::{
    BackoffStrategy, FailOutcome, Job, JobAttemptRecord, JobCounts, JobPayload, JobState, Lease,
    Mutation, Operation, PayloadError, QueuePolicy, RetryPolicy, STALLED_LIMIT_REASON, UpdateData,
};
pub use worker::{JobError, Worker, WorkerConfig, WorkerHandle, WorkerStats};
