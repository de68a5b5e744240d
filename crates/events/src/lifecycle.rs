//! Job lifecycle notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use storefront_core::JobId;

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEventKind {
    /// Job is queued and claimable.
    Waiting,
    /// A worker claimed the job; `attempt` is 1-based.
    Active { attempt: u32 },
    /// The mutation was applied; `result` is the mutated entity.
    Completed { result: JsonValue },
    /// An attempt failed. `will_retry` is false once the job is terminally failed.
    Failed {
        error: String,
        attempts: u32,
        will_retry: bool,
    },
    /// The worker holding the job stopped renewing its lease.
    Stalled,
    /// The job is parked until its retry backoff elapses.
    Delayed { delay_ms: u64 },
    /// The job was deleted from the queue.
    Removed,
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Waiting => "waiting",
            JobEventKind::Active { .. } => "active",
            JobEventKind::Completed { .. } => "completed",
            JobEventKind::Failed { .. } => "failed",
            JobEventKind::Stalled => "stalled",
            JobEventKind::Delayed { .. } => "delayed",
            JobEventKind::Removed => "removed",
        }
    }
}

/// A lifecycle notification for one job on one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub queue: String,
    pub job_id: JobId,
    pub kind: JobEventKind,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(queue: impl Into<String>, job_id: JobId, kind: JobEventKind) -> Self {
        Self {
            queue: queue.into(),
            job_id,
            kind,
            occurred_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// True for notifications after which the job will not run again on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            JobEventKind::Completed { .. }
                | JobEventKind::Failed {
                    will_retry: false,
                    ..
                }
                | JobEventKind::Removed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_without_retry_is_terminal() {
        let id = JobId::new();
        let retrying = JobEvent::new(
            "productQueue",
            id,
            JobEventKind::Failed {
                error: "boom".into(),
                attempts: 1,
                will_retry: true,
            },
        );
        let dead = JobEvent::new(
            "productQueue",
            id,
            JobEventKind::Failed {
                error: "boom".into(),
                attempts: 3,
                will_retry: false,
            },
        );

        assert!(!retrying.is_terminal());
        assert!(dead.is_terminal());
        assert_eq!(dead.name(), "failed");
    }

    #[test]
    fn serializes_with_event_tag() {
        let event = JobEvent::new("categoryQueue", JobId::new(), JobEventKind::Delayed { delay_ms: 250 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["event"], "delayed");
        assert_eq!(json["kind"]["delay_ms"], 250);
    }
}
