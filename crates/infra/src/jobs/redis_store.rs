//! Redis-backed job store (feature `redis`).
//!
//! Key layout under `{prefix}`:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `{prefix}:jobs` | hash | job id → JSON record |
//! | `{prefix}:queue` | sorted set | Priority Lane, score = [`LaneScore`] |
//! | `{prefix}:active` | list | In-Flight Set |
//! | `{prefix}:completed` / `:failed` / `:dead_letter` / `:cancelled` | list | terminal lanes, newest at head |
//! | `{prefix}:stats` | hash | counters |
//!
//! Multi-key transitions run as Lua scripts so each is one atomic server-side
//! step. `try_claim` is the important one: `ZREM` decides the winner, and only
//! the winner's `LPUSH` runs. `update_if` decodes the stored record inside the
//! script so the status check and the write cannot be split.

use std::collections::HashMap;
use std::sync::Arc;

use redis::{Commands, Script};
use tracing::instrument;

use taskforge_core::{Job, JobId, JobStatus, LaneScore, Priority};

use super::store::{Counters, JobFilter, JobStore, JobStoreError, StatCounter, TerminalLane};

const SUBMIT_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
redis.call('HINCRBY', KEYS[3], 'submitted', 1)
return 1
"#;

const UPDATE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

const UPDATE_IF_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  return -1
end
if cjson.decode(raw)['status'] ~= ARGV[3] then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
"#;

const RESCHEDULE_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

// KEYS: active, completed, failed, dead_letter, cancelled, queue
const REQUEUE_SCRIPT: &str = r#"
for i = 1, 5 do
  redis.call('LREM', KEYS[i], 0, ARGV[1])
end
redis.call('ZADD', KEYS[6], ARGV[2], ARGV[1])
return 1
"#;

// KEYS: active, queue, lane, stats
const SETTLE_SCRIPT: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[1])
redis.call('HINCRBY', KEYS[4], ARGV[2], 1)
return 1
"#;

// KEYS: jobs, queue, active, completed, failed, dead_letter, cancelled
const DELETE_SCRIPT: &str = r#"
local removed = 0
for _, id in ipairs(ARGV) do
  removed = removed + redis.call('HDEL', KEYS[1], id)
  redis.call('ZREM', KEYS[2], id)
  for i = 3, 7 do
    redis.call('LREM', KEYS[i], 0, id)
  end
end
return removed
"#;

impl From<redis::RedisError> for JobStoreError {
    fn from(e: redis::RedisError) -> Self {
        JobStoreError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone)]
struct Keys {
    jobs: String,
    queue: String,
    active: String,
    completed: String,
    failed: String,
    dead_letter: String,
    cancelled: String,
    stats: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            jobs: format!("{prefix}:jobs"),
            queue: format!("{prefix}:queue"),
            active: format!("{prefix}:active"),
            completed: format!("{prefix}:completed"),
            failed: format!("{prefix}:failed"),
            dead_letter: format!("{prefix}:dead_letter"),
            cancelled: format!("{prefix}:cancelled"),
            stats: format!("{prefix}:stats"),
        }
    }

    fn terminal(&self, lane: TerminalLane) -> &str {
        match lane {
            TerminalLane::Completed => &self.completed,
            TerminalLane::Failed => &self.failed,
            TerminalLane::DeadLetter => &self.dead_letter,
            TerminalLane::Cancelled => &self.cancelled,
        }
    }
}

/// Job store over a shared Redis instance. Safe to use from many processes.
#[derive(Debug, Clone)]
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    keys: Keys,
}

impl RedisJobStore {
    /// Open a client for `redis_url`; keys are namespaced by `key_prefix`.
    pub fn new(redis_url: impl AsRef<str>, key_prefix: &str) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self {
            client: Arc::new(client),
            keys: Keys::new(key_prefix),
        })
    }

    /// Round-trip a `PING` to fail fast on a bad URL.
    pub fn ping(&self) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query(&mut conn)?;
        Ok(())
    }

    fn conn(&self) -> Result<redis::Connection, JobStoreError> {
        Ok(self.client.get_connection()?)
    }

    fn encode(job: &Job) -> Result<String, JobStoreError> {
        serde_json::to_string(job).map_err(|e| JobStoreError::Serialization(e.to_string()))
    }

    fn decode(raw: &str) -> Result<Job, JobStoreError> {
        serde_json::from_str(raw).map_err(|e| JobStoreError::Serialization(e.to_string()))
    }

    fn parse_id(raw: &str) -> Result<JobId, JobStoreError> {
        raw.parse()
            .map_err(|e: taskforge_core::QueueError| JobStoreError::Serialization(e.to_string()))
    }

    fn parse_ids(raw: Vec<String>) -> Result<Vec<JobId>, JobStoreError> {
        raw.iter().map(|s| Self::parse_id(s)).collect()
    }
}

impl JobStore for RedisJobStore {
    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let created: bool = conn.hset_nx(&self.keys.jobs, job.id.to_string(), Self::encode(job)?)?;
        if !created {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.hget(&self.keys.jobs, id.to_string())?;
        raw.as_deref().map(Self::decode).transpose()
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let written: i64 = Script::new(UPDATE_SCRIPT)
            .key(&self.keys.jobs)
            .arg(job.id.to_string())
            .arg(Self::encode(job)?)
            .invoke(&mut conn)?;
        if written == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    fn update_if(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError> {
        let mut conn = self.conn()?;
        let written: i64 = Script::new(UPDATE_IF_SCRIPT)
            .key(&self.keys.jobs)
            .arg(job.id.to_string())
            .arg(Self::encode(job)?)
            .arg(expected.as_str())
            .invoke(&mut conn)?;
        match written {
            -1 => Err(JobStoreError::NotFound(job.id)),
            n => Ok(n == 1),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn.hvals(&self.keys.jobs)?;
        let mut jobs = Vec::with_capacity(raw.len());
        for r in raw {
            let job = Self::decode(&r)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
        }
        Ok(filter.finish(jobs))
    }

    fn delete(&self, ids: &[JobId]) -> Result<usize, JobStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let delete = Script::new(DELETE_SCRIPT);
        let mut script = delete.prepare_invoke();
        script
            .key(&self.keys.jobs)
            .key(&self.keys.queue)
            .key(&self.keys.active)
            .key(&self.keys.completed)
            .key(&self.keys.failed)
            .key(&self.keys.dead_letter)
            .key(&self.keys.cancelled);
        for id in ids {
            script.arg(id.to_string());
        }
        let removed: i64 = script.invoke(&mut conn)?;
        Ok(removed.max(0) as usize)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn submit(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let created: i64 = Script::new(SUBMIT_SCRIPT)
            .key(&self.keys.jobs)
            .key(&self.keys.queue)
            .key(&self.keys.stats)
            .arg(job.id.to_string())
            .arg(Self::encode(job)?)
            .arg(job.lane_score().raw())
            .invoke(&mut conn)?;
        if created == 0 {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        Ok(())
    }

    fn peek_ready(&self, now_ms: u64) -> Result<Option<JobId>, JobStoreError> {
        let mut conn = self.conn()?;
        for priority in Priority::ALL {
            let (lo, hi) = LaneScore::ready_range(priority, now_ms);
            let head: Vec<String> =
                conn.zrangebyscore_limit(&self.keys.queue, lo.raw(), hi.raw(), 0, 1)?;
            if let Some(raw) = head.first() {
                return Self::parse_id(raw).map(Some);
            }
        }
        Ok(None)
    }

    fn try_claim(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut conn = self.conn()?;
        let won: i64 = Script::new(CLAIM_SCRIPT)
            .key(&self.keys.queue)
            .key(&self.keys.active)
            .arg(id.to_string())
            .invoke(&mut conn)?;
        Ok(won == 1)
    }

    fn reschedule(&self, id: JobId, score: LaneScore) -> Result<bool, JobStoreError> {
        let mut conn = self.conn()?;
        let moved: i64 = Script::new(RESCHEDULE_SCRIPT)
            .key(&self.keys.queue)
            .arg(id.to_string())
            .arg(score.raw())
            .invoke(&mut conn)?;
        Ok(moved == 1)
    }

    fn lane_len(&self) -> Result<usize, JobStoreError> {
        let mut conn = self.conn()?;
        Ok(conn.zcard(&self.keys.queue)?)
    }

    fn in_flight(&self) -> Result<Vec<JobId>, JobStoreError> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn.lrange(&self.keys.active, 0, -1)?;
        Self::parse_ids(raw)
    }

    fn in_flight_len(&self) -> Result<usize, JobStoreError> {
        let mut conn = self.conn()?;
        Ok(conn.llen(&self.keys.active)?)
    }

    fn release(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.lrem(&self.keys.active, 0, id.to_string())?;
        Ok(removed > 0)
    }

    fn requeue(&self, id: JobId, score: LaneScore) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let _: i64 = Script::new(REQUEUE_SCRIPT)
            .key(&self.keys.active)
            .key(&self.keys.completed)
            .key(&self.keys.failed)
            .key(&self.keys.dead_letter)
            .key(&self.keys.cancelled)
            .key(&self.keys.queue)
            .arg(id.to_string())
            .arg(score.raw())
            .invoke(&mut conn)?;
        Ok(())
    }

    #[instrument(skip(self), fields(lane = lane.as_str()), err)]
    fn settle(&self, id: JobId, lane: TerminalLane) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let _: i64 = Script::new(SETTLE_SCRIPT)
            .key(&self.keys.active)
            .key(&self.keys.queue)
            .key(self.keys.terminal(lane))
            .key(&self.keys.stats)
            .arg(id.to_string())
            .arg(lane.counter().as_str())
            .invoke(&mut conn)?;
        Ok(())
    }

    fn lane_members(&self, lane: TerminalLane, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let stop = isize::try_from(limit).map_or(-1, |l| l - 1);
        let raw: Vec<String> = conn.lrange(self.keys.terminal(lane), 0, stop)?;
        Self::parse_ids(raw)
    }

    fn terminal_len(&self, lane: TerminalLane) -> Result<usize, JobStoreError> {
        let mut conn = self.conn()?;
        Ok(conn.llen(self.keys.terminal(lane))?)
    }

    fn increment(&self, counter: StatCounter) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let _: i64 = conn.hincr(&self.keys.stats, counter.as_str(), 1)?;
        Ok(())
    }

    fn counters(&self) -> Result<Counters, JobStoreError> {
        let mut conn = self.conn()?;
        let raw: HashMap<String, u64> = conn.hgetall(&self.keys.stats)?;
        let mut counters = Counters::default();
        for (name, value) in raw {
            counters.set(&name, value);
        }
        Ok(counters)
    }
}
