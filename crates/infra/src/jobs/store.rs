//! Job storage: record store, Priority Lane, In-Flight Set, terminal lanes and
//! stats counters behind one trait.
//!
//! Every method that touches more than one structure (`submit`, `try_claim`,
//! `requeue`, `settle`, `delete`) must be a single indivisible operation in
//! each implementation, and so must the compare-and-write `update_if`. Those
//! are the only coordination points between dispatchers; nothing above this
//! trait takes a cross-process lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use taskforge_core::{Job, JobId, JobStatus, LaneScore, Priority, QueueError};

/// Terminal list a finished job is filed under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalLane {
    Completed,
    /// Exhausted retries with dead-lettering disabled.
    Failed,
    DeadLetter,
    Cancelled,
}

impl TerminalLane {
    pub const ALL: [TerminalLane; 4] = [
        TerminalLane::Completed,
        TerminalLane::Failed,
        TerminalLane::DeadLetter,
        TerminalLane::Cancelled,
    ];

    /// Counter bumped when a job is settled into this lane.
    pub fn counter(self) -> StatCounter {
        match self {
            TerminalLane::Completed => StatCounter::Completed,
            TerminalLane::Failed | TerminalLane::DeadLetter => StatCounter::Failed,
            TerminalLane::Cancelled => StatCounter::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminalLane::Completed => "completed",
            TerminalLane::Failed => "failed",
            TerminalLane::DeadLetter => "dead_letter",
            TerminalLane::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatCounter {
    Submitted,
    Completed,
    Failed,
    Cancelled,
    Retried,
}

impl StatCounter {
    pub fn as_str(self) -> &'static str {
        match self {
            StatCounter::Submitted => "submitted",
            StatCounter::Completed => "completed",
            StatCounter::Failed => "failed",
            StatCounter::Cancelled => "cancelled",
            StatCounter::Retried => "retried",
        }
    }
}

/// Monotonic totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

impl Counters {
    pub fn bump(&mut self, counter: StatCounter) {
        let slot = match counter {
            StatCounter::Submitted => &mut self.submitted,
            StatCounter::Completed => &mut self.completed,
            StatCounter::Failed => &mut self.failed,
            StatCounter::Cancelled => &mut self.cancelled,
            StatCounter::Retried => &mut self.retried,
        };
        *slot += 1;
    }

    pub fn set(&mut self, name: &str, value: u64) {
        match name {
            "submitted" => self.submitted = value,
            "completed" => self.completed = value,
            "failed" => self.failed = value,
            "cancelled" => self.cancelled = value,
            "retried" => self.retried = value,
            _ => {}
        }
    }
}

/// Record filter for [`JobStore::list`]. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub priority: Option<Priority>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
            && self.priority.is_none_or(|p| job.priority == p)
    }

    /// Sort newest first and apply the limit.
    pub fn finish(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = self.limit {
            jobs.truncate(limit);
        }
        jobs
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<JobStoreError> for QueueError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => QueueError::NotFound(id),
            other => QueueError::store(other.to_string()),
        }
    }
}

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    // --- record store ---

    /// Create a record. Fails if the id is taken.
    fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Full overwrite, last writer wins.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Overwrite the record only while its stored status is still `expected`.
    /// `false` means another writer moved the job on and nothing was written.
    fn update_if(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError>;

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Remove records together with any lane membership. Returns how many
    /// records existed.
    fn delete(&self, ids: &[JobId]) -> Result<usize, JobStoreError>;

    // --- priority lane ---

    /// Create the record, enqueue it at `job.lane_score()` and bump
    /// `submitted`, as one operation.
    fn submit(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Highest-priority entry whose visibility instant is `<= now_ms`.
    fn peek_ready(&self, now_ms: u64) -> Result<Option<JobId>, JobStoreError>;

    /// Move `id` from the lane to the In-Flight Set. `false` when the entry is
    /// already gone (another dispatcher won).
    fn try_claim(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Re-score an existing lane entry; `false` if it is not in the lane.
    fn reschedule(&self, id: JobId, score: LaneScore) -> Result<bool, JobStoreError>;

    fn lane_len(&self) -> Result<usize, JobStoreError>;

    // --- in-flight set ---

    fn in_flight(&self) -> Result<Vec<JobId>, JobStoreError>;

    fn in_flight_len(&self) -> Result<usize, JobStoreError>;

    fn release(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Take `id` out of the In-Flight Set and every terminal lane and put it
    /// back into the Priority Lane at `score`.
    fn requeue(&self, id: JobId, score: LaneScore) -> Result<(), JobStoreError>;

    // --- terminal lanes / stats ---

    /// Release `id` from the In-Flight Set, file it under `lane` and bump the
    /// lane's counter.
    fn settle(&self, id: JobId, lane: TerminalLane) -> Result<(), JobStoreError>;

    /// Lane members, most recently settled first.
    fn lane_members(&self, lane: TerminalLane, limit: usize) -> Result<Vec<JobId>, JobStoreError>;

    fn terminal_len(&self, lane: TerminalLane) -> Result<usize, JobStoreError>;

    fn increment(&self, counter: StatCounter) -> Result<(), JobStoreError>;

    fn counters(&self) -> Result<Counters, JobStoreError>;
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn update_if(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError> {
        (**self).update_if(job, expected)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter)
    }

    fn delete(&self, ids: &[JobId]) -> Result<usize, JobStoreError> {
        (**self).delete(ids)
    }

    fn submit(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).submit(job)
    }

    fn peek_ready(&self, now_ms: u64) -> Result<Option<JobId>, JobStoreError> {
        (**self).peek_ready(now_ms)
    }

    fn try_claim(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).try_claim(id)
    }

    fn reschedule(&self, id: JobId, score: LaneScore) -> Result<bool, JobStoreError> {
        (**self).reschedule(id, score)
    }

    fn lane_len(&self) -> Result<usize, JobStoreError> {
        (**self).lane_len()
    }

    fn in_flight(&self) -> Result<Vec<JobId>, JobStoreError> {
        (**self).in_flight()
    }

    fn in_flight_len(&self) -> Result<usize, JobStoreError> {
        (**self).in_flight_len()
    }

    fn release(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).release(id)
    }

    fn requeue(&self, id: JobId, score: LaneScore) -> Result<(), JobStoreError> {
        (**self).requeue(id, score)
    }

    fn settle(&self, id: JobId, lane: TerminalLane) -> Result<(), JobStoreError> {
        (**self).settle(id, lane)
    }

    fn lane_members(&self, lane: TerminalLane, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        (**self).lane_members(lane, limit)
    }

    fn terminal_len(&self, lane: TerminalLane) -> Result<usize, JobStoreError> {
        (**self).terminal_len(lane)
    }

    fn increment(&self, counter: StatCounter) -> Result<(), JobStoreError> {
        (**self).increment(counter)
    }

    fn counters(&self) -> Result<Counters, JobStoreError> {
        (**self).counters()
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<JobId, Job>,
    /// Keyed by (score, insertion sequence) so equal scores stay FIFO.
    lane: BTreeMap<(LaneScore, u64), JobId>,
    lane_index: HashMap<JobId, (LaneScore, u64)>,
    seq: u64,
    in_flight: Vec<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    dead_letter: VecDeque<JobId>,
    cancelled: VecDeque<JobId>,
    counters: Counters,
}

impl Inner {
    fn lane_insert(&mut self, id: JobId, score: LaneScore) {
        self.lane_remove(id);
        self.seq += 1;
        let key = (score, self.seq);
        self.lane.insert(key, id);
        self.lane_index.insert(id, key);
    }

    fn lane_remove(&mut self, id: JobId) -> bool {
        match self.lane_index.remove(&id) {
            Some(key) => {
                self.lane.remove(&key);
                true
            }
            None => false,
        }
    }

    fn release(&mut self, id: JobId) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|x| *x != id);
        before != self.in_flight.len()
    }

    fn terminal(&mut self, lane: TerminalLane) -> &mut VecDeque<JobId> {
        match lane {
            TerminalLane::Completed => &mut self.completed,
            TerminalLane::Failed => &mut self.failed,
            TerminalLane::DeadLetter => &mut self.dead_letter,
            TerminalLane::Cancelled => &mut self.cancelled,
        }
    }

    fn remove_terminal(&mut self, id: JobId, lane: TerminalLane) -> bool {
        let list = self.terminal(lane);
        let before = list.len();
        list.retain(|x| *x != id);
        before != list.len()
    }
}

/// In-memory job store for tests and single-process use.
///
/// One mutex guards every structure, so each trait method is trivially
/// atomic with respect to the others.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    /// Put `id` straight into the In-Flight Set without touching the lane.
    /// Simulates a dispatcher that crashed mid-claim.
    pub fn force_in_flight(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        inner.lane_remove(id);
        if !inner.in_flight.contains(&id) {
            inner.in_flight.insert(0, id);
        }
        Ok(())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        if inner.records.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        inner.records.insert(job.id, job.clone());
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.records.get(&id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        match inner.records.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn update_if(&self, job: &Job, expected: JobStatus) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        match inner.records.get_mut(&job.id) {
            Some(slot) if slot.status == expected => {
                *slot = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.lock()?;
        let jobs = inner
            .records
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        Ok(filter.finish(jobs))
    }

    fn delete(&self, ids: &[JobId]) -> Result<usize, JobStoreError> {
        let mut inner = self.lock()?;
        let mut removed = 0;
        for id in ids {
            if inner.records.remove(id).is_some() {
                removed += 1;
            }
            inner.lane_remove(*id);
            inner.release(*id);
            for lane in TerminalLane::ALL {
                inner.remove_terminal(*id, lane);
            }
        }
        Ok(removed)
    }

    fn submit(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        if inner.records.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        inner.records.insert(job.id, job.clone());
        inner.lane_insert(job.id, job.lane_score());
        inner.counters.bump(StatCounter::Submitted);
        Ok(())
    }

    fn peek_ready(&self, now_ms: u64) -> Result<Option<JobId>, JobStoreError> {
        let inner = self.lock()?;
        for priority in Priority::ALL {
            let (lo, hi) = LaneScore::ready_range(priority, now_ms);
            if let Some((_, id)) = inner.lane.range((lo, 0)..=(hi, u64::MAX)).next() {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    fn try_claim(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        if !inner.lane_remove(id) {
            return Ok(false);
        }
        inner.in_flight.insert(0, id);
        Ok(true)
    }

    fn reschedule(&self, id: JobId, score: LaneScore) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        if !inner.lane_index.contains_key(&id) {
            return Ok(false);
        }
        inner.lane_insert(id, score);
        Ok(true)
    }

    fn lane_len(&self) -> Result<usize, JobStoreError> {
        Ok(self.lock()?.lane.len())
    }

    fn in_flight(&self) -> Result<Vec<JobId>, JobStoreError> {
        Ok(self.lock()?.in_flight.clone())
    }

    fn in_flight_len(&self) -> Result<usize, JobStoreError> {
        Ok(self.lock()?.in_flight.len())
    }

    fn release(&self, id: JobId) -> Result<bool, JobStoreError> {
        Ok(self.lock()?.release(id))
    }

    fn requeue(&self, id: JobId, score: LaneScore) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        inner.release(id);
        for lane in TerminalLane::ALL {
            inner.remove_terminal(id, lane);
        }
        inner.lane_insert(id, score);
        Ok(())
    }

    fn settle(&self, id: JobId, lane: TerminalLane) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        inner.release(id);
        inner.lane_remove(id);
        inner.remove_terminal(id, lane);
        inner.terminal(lane).push_front(id);
        inner.counters.bump(lane.counter());
        Ok(())
    }

    fn lane_members(&self, lane: TerminalLane, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let mut inner = self.lock()?;
        Ok(inner.terminal(lane).iter().take(limit).copied().collect())
    }

    fn terminal_len(&self, lane: TerminalLane) -> Result<usize, JobStoreError> {
        Ok(self.lock()?.terminal(lane).len())
    }

    fn increment(&self, counter: StatCounter) -> Result<(), JobStoreError> {
        self.lock()?.counters.bump(counter);
        Ok(())
    }

    fn counters(&self) -> Result<Counters, JobStoreError> {
        Ok(self.lock()?.counters)
    }
}
