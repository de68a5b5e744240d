//! Redis-backed job queue.
//!
//! ## Layout
//!
//! All keys live under `storefront:<queue>:`:
//!
//! - `wait`: list of waiting ids (LPUSH to enqueue, RPOPLPUSH to claim)
//! - `active`: list of claimed ids
//! - `delayed` / `completed` / `failed`: sorted sets scored by epoch millis
//! - `job:<id>`: hash with the payload, counters and timestamps
//! - `job:<id>:log`: list of JSON attempt records
//! - `lock:<id>`: lease token (`SET PX`); its TTL is the stall timeout
//!
//! Every state transition runs as one Lua script so the job hash and the state structures never
//! disagree, even with several worker processes sharing the queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde_json::Value as JsonValue;
use tracing::instrument;

use storefront_core::JobId;
use storefront_events::JobEventKind;

use super::queue::{JobEvents, JobQueue, LifecycleBus, QueueError};
use super::types::{
    FailOutcome, Job, JobAttemptRecord, JobCounts, JobPayload, JobState, Lease, QueuePolicy,
    STALLED_LIMIT_REASON,
};

/// Default key namespace.
const DEFAULT_KEY_NAMESPACE: &str = "storefront";

const CLAIM_SCRIPT: &str = r#"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not id then
  return false
end
local jobKey = ARGV[1] .. 'job:' .. id
if redis.call('EXISTS', jobKey) == 0 then
  redis.call('LREM', KEYS[2], 1, id)
  return false
end
redis.call('SET', ARGV[1] .. 'lock:' .. id, ARGV[2], 'PX', ARGV[3])
redis.call('HINCRBY', jobKey, 'attemptsMade', 1)
redis.call('HSET', jobKey, 'state', 'active', 'processedAt', ARGV[4], 'leaseOwner', ARGV[2], 'scheduledAt', '')
return id
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const FINISH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[2]) ~= ARGV[1] then
  return 0
end
redis.call('LREM', KEYS[1], 1, ARGV[2])
redis.call('DEL', KEYS[2])
redis.call('HSET', KEYS[3], 'state', ARGV[3], 'leaseOwner', '', 'finishedAt', ARGV[6],
  'failedReason', ARGV[7], 'returnValue', ARGV[8], 'scheduledAt', ARGV[9])
redis.call('RPUSH', KEYS[5], ARGV[10])
if ARGV[5] == 'list' then
  redis.call('LPUSH', KEYS[4], ARGV[2])
else
  redis.call('ZADD', KEYS[4], ARGV[4], ARGV[2])
end
return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = {}
for _, id in ipairs(ids) do
  if redis.call('ZREM', KEYS[1], id) == 1 then
    redis.call('HSET', ARGV[2] .. 'job:' .. id, 'state', 'waiting', 'scheduledAt', '')
    redis.call('LPUSH', KEYS[2], id)
    table.insert(moved, id)
  end
end
return moved
"#;

const STALLED_SCRIPT: &str = r#"
local active = redis.call('LRANGE', KEYS[1], 0, -1)
local result = {}
for i = #active, 1, -1 do
  local id = active[i]
  if redis.call('EXISTS', ARGV[1] .. 'lock:' .. id) == 0 then
    if redis.call('LREM', KEYS[1], 1, id) > 0 then
      local jobKey = ARGV[1] .. 'job:' .. id
      local count = redis.call('HINCRBY', jobKey, 'stalledCount', 1)
      redis.call('HSET', jobKey, 'leaseOwner', '')
      if count > tonumber(ARGV[2]) then
        redis.call('HSET', jobKey, 'state', 'failed', 'failedReason', ARGV[4], 'finishedAt', ARGV[3])
        redis.call('ZADD', KEYS[3], ARGV[3], id)
        table.insert(result, id)
        table.insert(result, 'failed')
      else
        redis.call('HSET', jobKey, 'state', 'waiting')
        redis.call('RPUSH', KEYS[2], id)
        table.insert(result, id)
        table.insert(result, 'waiting')
      end
    end
  end
end
return result
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[3], 'state', 'waiting', 'attemptsMade', 0, 'stalledCount', 0,
  'failedReason', '', 'finishedAt', '', 'scheduledAt', '')
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

const REMOVE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[7]) == 1 then
  return -1
end
if redis.call('EXISTS', KEYS[6]) == 0 then
  return 0
end
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('DEL', KEYS[6], KEYS[8])
return 1
"#;

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn new(namespace: &str, queue: &str) -> Self {
        Self {
            prefix: format!("{namespace}:{queue}:"),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn wait(&self) -> String {
        self.key("wait")
    }

    fn active(&self) -> String {
        self.key("active")
    }

    fn delayed(&self) -> String {
        self.key("delayed")
    }

    fn completed(&self) -> String {
        self.key("completed")
    }

    fn failed(&self) -> String {
        self.key("failed")
    }

    fn job(&self, id: JobId) -> String {
        format!("{}job:{}", self.prefix, id)
    }

    fn log(&self, id: JobId) -> String {
        format!("{}job:{}:log", self.prefix, id)
    }

    fn lock(&self, id: JobId) -> String {
        format!("{}lock:{}", self.prefix, id)
    }
}

struct Scripts {
    claim: Script,
    extend: Script,
    finish: Script,
    promote: Script,
    stalled: Script,
    retry: Script,
    remove: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
            stalled: Script::new(STALLED_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
        }
    }
}

/// Redis job queue (durable, shared by any number of worker processes).
#[derive(Clone)]
pub struct RedisJobQueue {
    name: String,
    policy: QueuePolicy,
    keys: Keys,
    conn: MultiplexedConnection,
    scripts: Arc<Scripts>,
    events: JobEvents,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("name", &self.name)
            .field("prefix", &self.keys.prefix)
            .field("policy", &self.policy)
            .finish()
    }
}

fn backend(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn lease_millis(policy: &QueuePolicy) -> u64 {
    policy.stall_timeout.as_millis().max(1) as u64
}

fn parse_id(raw: &str) -> Result<JobId, QueueError> {
    raw.parse()
        .map_err(|e| QueueError::Serialization(format!("bad job id {raw:?}: {e}")))
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn field_time(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    field(fields, name)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn field_u32(fields: &HashMap<String, String>, name: &str) -> u32 {
    field(fields, name)
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

impl RedisJobQueue {
    /// Connect to Redis and bind the queue `name`.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `name` - queue name (e.g., "productQueue")
    pub async fn connect(
        redis_url: impl AsRef<str>,
        name: impl Into<String>,
        policy: QueuePolicy,
        bus: Arc<LifecycleBus>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;
        Ok(Self::with_connection(conn, DEFAULT_KEY_NAMESPACE, name, policy, bus))
    }

    /// Bind a queue to an existing connection under a custom key namespace.
    pub fn with_connection(
        conn: MultiplexedConnection,
        namespace: &str,
        name: impl Into<String>,
        policy: QueuePolicy,
        bus: Arc<LifecycleBus>,
    ) -> Self {
        let name = name.into();
        Self {
            keys: Keys::new(namespace, &name),
            events: JobEvents::new(name.clone(), bus),
            name,
            policy,
            conn,
            scripts: Arc::new(Scripts::load()),
        }
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let (fields, log): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .cmd("HGETALL")
            .arg(self.keys.job(id))
            .cmd("LRANGE")
            .arg(self.keys.log(id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        if fields.is_empty() {
            return Ok(None);
        }
        self.decode(id, &fields, &log).map(Some)
    }

    async fn load_existing(&self, id: JobId) -> Result<Job, QueueError> {
        self.load(id).await?.ok_or(QueueError::NotFound(id))
    }

    fn decode(
        &self,
        id: JobId,
        fields: &HashMap<String, String>,
        log: &[String],
    ) -> Result<Job, QueueError> {
        let payload: JobPayload = serde_json::from_str(field(fields, "payload").unwrap_or("null"))
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let state = field(fields, "state")
            .unwrap_or("waiting")
            .parse::<JobState>()
            .map_err(QueueError::Serialization)?;
        let return_value = field(fields, "returnValue")
            .map(serde_json::from_str::<JsonValue>)
            .transpose()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let history = log
            .iter()
            .map(|record| serde_json::from_str::<JobAttemptRecord>(record))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let processed_at = field_time(fields, "processedAt");
        // The lock TTL is authoritative; the lease here is the deadline as of the last claim.
        let lease = field(fields, "leaseOwner").map(|owner| Lease {
            owner: owner.to_string(),
            expires_at: processed_at.unwrap_or_else(Utc::now)
                + super::types::to_chrono(self.policy.stall_timeout),
        });

        Ok(Job {
            id,
            queue: field(fields, "queue").unwrap_or(&self.name).to_string(),
            payload,
            state,
            attempts_made: field_u32(fields, "attemptsMade"),
            stalled_count: field_u32(fields, "stalledCount"),
            enqueued_at: field_time(fields, "enqueuedAt").unwrap_or_else(Utc::now),
            processed_at,
            finished_at: field_time(fields, "finishedAt"),
            scheduled_at: field_time(fields, "scheduledAt"),
            lease,
            failed_reason: field(fields, "failedReason").map(str::to_string),
            return_value,
            history,
        })
    }

    /// Apply a settled job to Redis. Fails with `LeaseLost` when `worker_id` no longer holds the
    /// lock.
    async fn finish(
        &self,
        job: &Job,
        worker_id: &str,
        record: &JobAttemptRecord,
    ) -> Result<(), QueueError> {
        let (target, kind, score) = match job.state {
            JobState::Completed => (self.keys.completed(), "zset", now_millis()),
            JobState::Failed => (self.keys.failed(), "zset", now_millis()),
            JobState::Delayed => (
                self.keys.delayed(),
                "zset",
                job.scheduled_at.map(|at| at.timestamp_millis()).unwrap_or_else(now_millis),
            ),
            JobState::Waiting => (self.keys.wait(), "list", 0),
            JobState::Active => {
                return Err(QueueError::InvalidState {
                    job_id: job.id,
                    actual: JobState::Active,
                    expected: JobState::Completed,
                });
            }
        };
        let return_value = job
            .return_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| QueueError::Serialization(e.to_string()))?
            .unwrap_or_default();
        let record = serde_json::to_string(record)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let millis_or_empty = |at: Option<DateTime<Utc>>| {
            at.map(|at| at.timestamp_millis().to_string())
                .unwrap_or_default()
        };

        let mut invocation = self.scripts.finish.prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(self.keys.lock(job.id))
            .key(self.keys.job(job.id))
            .key(target)
            .key(self.keys.log(job.id))
            .arg(worker_id)
            .arg(job.id.to_string())
            .arg(job.state.as_str())
            .arg(score)
            .arg(kind)
            .arg(millis_or_empty(job.finished_at))
            .arg(job.failed_reason.clone().unwrap_or_default())
            .arg(return_value)
            .arg(millis_or_empty(job.scheduled_at))
            .arg(record);

        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        if applied == 0 {
            return Err(QueueError::LeaseLost(job.id));
        }
        Ok(())
    }

    async fn leased(&self, job_id: JobId, worker_id: &str) -> Result<Job, QueueError> {
        let job = self.load_existing(job_id).await?;
        if job.state != JobState::Active || !job.is_leased_by(worker_id) {
            return Err(QueueError::LeaseLost(job_id));
        }
        Ok(job)
    }

    async fn list_ids(&self, state: JobState, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let count = limit as isize;
        let ids: Vec<String> = match state {
            // Lists grow on the left and are consumed from the right: oldest is last.
            JobState::Waiting | JobState::Active => {
                let key = if state == JobState::Waiting {
                    self.keys.wait()
                } else {
                    self.keys.active()
                };
                let mut ids: Vec<String> = redis::cmd("LRANGE")
                    .arg(key)
                    .arg(-count)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                ids.reverse();
                ids
            }
            JobState::Delayed | JobState::Completed | JobState::Failed => {
                let key = match state {
                    JobState::Delayed => self.keys.delayed(),
                    JobState::Completed => self.keys.completed(),
                    _ => self.keys.failed(),
                };
                redis::cmd("ZRANGE")
                    .arg(key)
                    .arg(0)
                    .arg(count - 1)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?
            }
        };
        Ok(ids)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    #[instrument(skip(self, payload), fields(queue = %self.name), err)]
    async fn enqueue(&self, payload: JobPayload) -> Result<JobId, QueueError> {
        let job = Job::new(self.name.clone(), payload);
        let payload_json = serde_json::to_string(&job.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = job.id.to_string();

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.keys.job(job.id))
            .arg("id")
            .arg(&id)
            .arg("queue")
            .arg(&self.name)
            .arg("payload")
            .arg(payload_json)
            .arg("state")
            .arg(JobState::Waiting.as_str())
            .arg("attemptsMade")
            .arg(0)
            .arg("stalledCount")
            .arg(0)
            .arg("enqueuedAt")
            .arg(job.enqueued_at.timestamp_millis())
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.wait())
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        self.events.emit(job.id, JobEventKind::Waiting);
        Ok(job.id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .key(self.keys.wait())
            .key(self.keys.active())
            .arg(&self.keys.prefix)
            .arg(worker_id)
            .arg(lease_millis(&self.policy))
            .arg(now_millis());

        let mut conn = self.conn.clone();
        let claimed: Option<String> = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        let Some(raw) = claimed else {
            return Ok(None);
        };

        let job = self.load_existing(parse_id(&raw)?).await?;
        self.events.emit(
            job.id,
            JobEventKind::Active {
                attempt: job.attempts_made,
            },
        );
        Ok(Some(job))
    }

    async fn extend_lease(&self, job_id: JobId, worker_id: &str) -> Result<(), QueueError> {
        let mut invocation = self.scripts.extend.prepare_invoke();
        invocation
            .key(self.keys.lock(job_id))
            .arg(worker_id)
            .arg(lease_millis(&self.policy));

        let mut conn = self.conn.clone();
        let renewed: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        if renewed == 0 {
            return Err(QueueError::LeaseLost(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, result), fields(queue = %self.name), err)]
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
    ) -> Result<Job, QueueError> {
        let mut job = self.leased(job_id, worker_id).await?;
        job.mark_completed(result.clone());
        let record = job
            .history
            .last()
            .cloned()
            .ok_or_else(|| QueueError::Backend("missing attempt record".to_string()))?;

        self.finish(&job, worker_id, &record).await?;
        self.events.emit(job_id, JobEventKind::Completed { result });
        Ok(job)
    }

    #[instrument(skip(self), fields(queue = %self.name), err)]
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Job, QueueError> {
        let mut job = self.leased(job_id, worker_id).await?;
        let outcome = FailOutcome::decide(&self.policy.retry, job.attempts_made, retryable);
        job.mark_failed(error, outcome);
        let record = job
            .history
            .last()
            .cloned()
            .ok_or_else(|| QueueError::Backend("missing attempt record".to_string()))?;

        self.finish(&job, worker_id, &record).await?;
        self.events.emit_failure(&job, error);
        Ok(job)
    }

    async fn promote_delayed(&self) -> Result<usize, QueueError> {
        let mut invocation = self.scripts.promote.prepare_invoke();
        invocation
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .arg(now_millis())
            .arg(&self.keys.prefix);

        let mut conn = self.conn.clone();
        let moved: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        for raw in &moved {
            self.events.emit(parse_id(raw)?, JobEventKind::Waiting);
        }
        Ok(moved.len())
    }

    #[instrument(skip(self), fields(queue = %self.name), err)]
    async fn recover_stalled(&self) -> Result<Vec<JobId>, QueueError> {
        let mut invocation = self.scripts.stalled.prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.failed())
            .arg(&self.keys.prefix)
            .arg(self.policy.max_stalled_count)
            .arg(now_millis())
            .arg(STALLED_LIMIT_REASON);

        let mut conn = self.conn.clone();
        let flat: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(backend)?;

        let mut stalled = Vec::with_capacity(flat.len() / 2);
        for pair in flat.chunks_exact(2) {
            let id = parse_id(&pair[0])?;
            self.events.emit(id, JobEventKind::Stalled);
            if pair[1] == JobState::Failed.as_str() {
                match self.load(id).await? {
                    Some(job) => self.events.emit_failure(&job, STALLED_LIMIT_REASON),
                    None => self.events.emit(
                        id,
                        JobEventKind::Failed {
                            error: STALLED_LIMIT_REASON.to_string(),
                            attempts: 0,
                            will_retry: false,
                        },
                    ),
                }
            } else {
                self.events.emit(id, JobEventKind::Waiting);
            }
            stalled.push(id);
        }
        Ok(stalled)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        self.load(job_id).await
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let ids = self.list_ids(state, limit).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            if let Some(job) = self.load(parse_id(&raw)?).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn retry_failed(&self, job_id: JobId) -> Result<Job, QueueError> {
        let mut invocation = self.scripts.retry.prepare_invoke();
        invocation
            .key(self.keys.failed())
            .key(self.keys.wait())
            .key(self.keys.job(job_id))
            .arg(job_id.to_string());

        let mut conn = self.conn.clone();
        let moved: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        if moved == 0 {
            let job = self.load_existing(job_id).await?;
            return Err(QueueError::InvalidState {
                job_id,
                actual: job.state,
                expected: JobState::Failed,
            });
        }

        self.events.emit(job_id, JobEventKind::Waiting);
        self.load_existing(job_id).await
    }

    async fn remove(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut invocation = self.scripts.remove.prepare_invoke();
        invocation
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.delayed())
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(self.keys.job(job_id))
            .key(self.keys.lock(job_id))
            .key(self.keys.log(job_id))
            .arg(job_id.to_string());

        let mut conn = self.conn.clone();
        let removed: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        match removed {
            -1 => Err(QueueError::Locked(job_id)),
            0 => Err(QueueError::NotFound(job_id)),
            _ => {
                self.events.emit(job_id, JobEventKind::Removed);
                Ok(())
            }
        }
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.keys.wait())
                .cmd("LLEN")
                .arg(self.keys.active())
                .cmd("ZCARD")
                .arg(self.keys.delayed())
                .cmd("ZCARD")
                .arg(self.keys.completed())
                .cmd("ZCARD")
                .arg(self.keys.failed())
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use storefront_events::{EventBus, JobEvent, Subscription};

    use super::*;
    use crate::jobs::types::{Operation, RetryPolicy};

    #[test]
    fn keys_are_namespaced_per_queue() {
        let keys = Keys::new("storefront", "productQueue");
        let id = JobId::new();

        assert_eq!(keys.wait(), "storefront:productQueue:wait");
        assert_eq!(keys.failed(), "storefront:productQueue:failed");
        assert_eq!(keys.job(id), format!("storefront:productQueue:job:{id}"));
        assert_eq!(keys.lock(id), format!("storefront:productQueue:lock:{id}"));
        assert_eq!(keys.log(id), format!("storefront:productQueue:job:{id}:log"));
    }

    #[test]
    fn empty_hash_fields_read_as_absent() {
        let mut fields = HashMap::new();
        fields.insert("finishedAt".to_string(), String::new());
        fields.insert("processedAt".to_string(), "1700000000000".to_string());
        fields.insert("attemptsMade".to_string(), "2".to_string());

        assert!(field_time(&fields, "finishedAt").is_none());
        assert_eq!(
            field_time(&fields, "processedAt").map(|at| at.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert_eq!(field_u32(&fields, "attemptsMade"), 2);
        assert_eq!(field_u32(&fields, "stalledCount"), 0);
    }

    // The tests below need a running Redis. Set STOREFRONT_REDIS_URL and run with `--ignored`.
    // Each test works under its own key namespace and deletes it afterwards.

    struct LiveQueue {
        queue: RedisJobQueue,
        events: Subscription<JobEvent>,
        conn: MultiplexedConnection,
        namespace: String,
    }

    impl LiveQueue {
        async fn purge(mut self) {
            let keys: Vec<String> = redis::cmd("KEYS")
                .arg(format!("{}:*", self.namespace))
                .query_async(&mut self.conn)
                .await
                .unwrap();
            if !keys.is_empty() {
                let _: () = redis::cmd("DEL")
                    .arg(keys)
                    .query_async(&mut self.conn)
                    .await
                    .unwrap();
            }
        }
    }

    async fn live_queue(policy: QueuePolicy) -> Option<LiveQueue> {
        let url = std::env::var("STOREFRONT_REDIS_URL").ok()?;
        let conn = redis::Client::open(url)
            .unwrap()
            .get_multiplexed_tokio_connection()
            .await
            .unwrap();
        let bus = Arc::new(LifecycleBus::new());
        let events = bus.subscribe();
        let namespace = format!("storefront-test-{}", uuid::Uuid::new_v4());
        let queue =
            RedisJobQueue::with_connection(conn.clone(), &namespace, "productQueue", policy, bus);
        Some(LiveQueue {
            queue,
            events,
            conn,
            namespace,
        })
    }

    fn payload(n: u32) -> JobPayload {
        JobPayload::new(Operation::Create, json!({"id": format!("p{n}")}))
    }

    fn names(events: &Subscription<JobEvent>) -> Vec<&'static str> {
        events.drain().iter().map(JobEvent::name).collect()
    }

    #[tokio::test]
    #[ignore]
    async fn redis_claims_in_fifo_order() {
        let Some(live) = live_queue(QueuePolicy::default()).await else {
            return;
        };
        let queue = &live.queue;

        let first = queue.enqueue(payload(1)).await.unwrap();
        let second = queue.enqueue(payload(2)).await.unwrap();

        let claimed = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);
        assert_eq!(claimed.payload, payload(1));
        assert_eq!(queue.claim("w2").await.unwrap().unwrap().id, second);
        assert!(queue.claim("w1").await.unwrap().is_none());

        let job = queue.complete(first, "w1", json!({"id": "p1"})).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        let stored = queue.get(first).await.unwrap().unwrap();
        assert_eq!(stored.return_value, Some(json!({"id": "p1"})));
        assert_eq!(stored.history.len(), 1);

        live.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn redis_rejects_settlement_by_another_worker() {
        let Some(live) = live_queue(QueuePolicy::default()).await else {
            return;
        };
        let queue = &live.queue;
        let id = queue.enqueue(payload(1)).await.unwrap();
        queue.claim("w1").await.unwrap();

        assert!(matches!(
            queue.complete(id, "w2", json!(null)).await,
            Err(QueueError::LeaseLost(_))
        ));
        assert!(matches!(
            queue.fail(id, "w2", "boom", true).await,
            Err(QueueError::LeaseLost(_))
        ));
        assert!(matches!(
            queue.extend_lease(id, "w2").await,
            Err(QueueError::LeaseLost(_))
        ));
        queue.extend_lease(id, "w1").await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().unwrap().state, JobState::Active);

        live.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn redis_backoff_parks_job_until_promoted() {
        let policy = QueuePolicy {
            retry: RetryPolicy::fixed(3, Duration::from_millis(200)),
            ..QueuePolicy::default()
        };
        let Some(live) = live_queue(policy).await else {
            return;
        };
        let queue = &live.queue;
        let id = queue.enqueue(payload(1)).await.unwrap();
        queue.claim("w1").await.unwrap();

        let job = queue.fail(id, "w1", "store unavailable", true).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(queue.counts().await.unwrap().delayed, 1);
        assert!(queue.claim("w1").await.unwrap().is_none());
        assert_eq!(queue.promote_delayed().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.promote_delayed().await.unwrap(), 1);
        let again = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts_made, 2);

        assert_eq!(
            names(&live.events),
            vec!["waiting", "active", "failed", "delayed", "waiting", "active"]
        );
        live.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn redis_expired_lock_is_redelivered_then_failed() {
        let policy = QueuePolicy {
            stall_timeout: Duration::from_millis(50),
            max_stalled_count: 1,
            ..QueuePolicy::default()
        };
        let Some(live) = live_queue(policy).await else {
            return;
        };
        let queue = &live.queue;
        let id = queue.enqueue(payload(1)).await.unwrap();

        queue.claim("w1").await.unwrap();
        assert!(queue.recover_stalled().await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.recover_stalled().await.unwrap(), vec![id]);

        let redelivered = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(redelivered.id, id);
        assert_eq!(redelivered.stalled_count, 1);
        assert!(matches!(
            queue.complete(id, "w1", json!(null)).await,
            Err(QueueError::LeaseLost(_))
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.recover_stalled().await.unwrap(), vec![id]);
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_LIMIT_REASON));
        assert_eq!(queue.counts().await.unwrap().failed, 1);

        live.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn redis_failed_jobs_can_be_retried_and_removed() {
        let Some(live) = live_queue(QueuePolicy::default()).await else {
            return;
        };
        let queue = &live.queue;
        let id = queue.enqueue(payload(1)).await.unwrap();
        queue.claim("w1").await.unwrap();

        assert!(matches!(queue.remove(id).await, Err(QueueError::Locked(_))));
        assert!(matches!(
            queue.retry_failed(id).await,
            Err(QueueError::InvalidState { .. })
        ));

        queue
            .fail(id, "w1", "invalid operation: delete", false)
            .await
            .unwrap();
        assert_eq!(queue.list(JobState::Failed, 10).await.unwrap().len(), 1);

        let retried = queue.retry_failed(id).await.unwrap();
        assert_eq!(retried.state, JobState::Waiting);
        assert_eq!(retried.attempts_made, 0);
        assert!(retried.failed_reason.is_none());

        queue.remove(id).await.unwrap();
        assert!(queue.get(id).await.unwrap().is_none());
        assert!(queue.claim("w1").await.unwrap().is_none());
        assert!(matches!(queue.remove(id).await, Err(QueueError::NotFound(_))));
        assert_eq!(names(&live.events).last(), Some(&"removed"));

        live.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn redis_counts_track_states() {
        let Some(live) = live_queue(QueuePolicy::default()).await else {
            return;
        };
        let queue = &live.queue;
        for n in 0..5 {
            queue.enqueue(payload(n)).await.unwrap();
        }
        assert_eq!(queue.counts().await.unwrap().waiting, 5);

        let job = queue.claim("w1").await.unwrap().unwrap();
        queue.claim("w1").await.unwrap();
        queue.complete(job.id, "w1", json!({})).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting, 3);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total(), 5);

        live.purge().await;
    }
}
