//! `JobQueue`: the explicitly constructed queue service.
//!
//! Wraps a [`Dispatcher`] with the submission, control and query surface.
//! Nothing is global: the store, broadcaster and access guard are injected,
//! and the lifecycle is `start()` (recovery sweep, then dispatcher thread)
//! followed by `close()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use taskforge_core::{Job, JobId, JobOptions, JobStatus, Priority, QueueError, QueueResult};
use taskforge_events::{Broadcaster, EventChannel, JobEvent, Subscription};

use super::dispatcher::{Dispatcher, DispatcherHandle, TickReport};
use super::guard::{AccessGuard, AllowAll, GuardedAction};
use super::recovery::{self, RecoveryReport};
use super::registry::{JobContext, JobResult};
use super::store::{Counters, JobFilter, JobStore, TerminalLane};
use crate::config::QueueConfig;

/// Longest stretch `wait_for_job` listens for events before re-reading the
/// record store.
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Read-modify-write rounds a control operation tries before giving up on a
/// record that keeps changing under it.
const MAX_WRITE_ROUNDS: usize = 8;

/// Counters plus live lane sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub counters: Counters,
    pub pending: usize,
    pub active: usize,
    pub dead_letter: usize,
    pub failed_lane: usize,
    pub completed_lane: usize,
    pub cancelled_lane: usize,
    pub paused: bool,
}

pub struct JobQueue<S: JobStore + 'static> {
    core: Arc<Dispatcher<S>>,
    guard: Arc<dyn AccessGuard>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    closed: AtomicBool,
}

impl<S: JobStore + 'static> JobQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self::from_channel(store, config, EventChannel::new())
    }

    /// Queue whose lifecycle events are also published to other processes.
    pub fn with_broadcaster(store: S, config: QueueConfig, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self::from_channel(store, config, EventChannel::new().with_broadcaster(broadcaster))
    }

    fn from_channel(store: S, config: QueueConfig, events: EventChannel) -> Self {
        Self {
            core: Arc::new(Dispatcher::new(store, config, events)),
            guard: Arc::new(AllowAll),
            dispatcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_guard(mut self, guard: impl AccessGuard + 'static) -> Self {
        self.guard = Arc::new(guard);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.core.config
    }

    pub fn store(&self) -> &S {
        &self.core.store
    }

    /// The queue's event channel, for feeding in events received from other
    /// processes.
    pub fn events(&self) -> Arc<EventChannel> {
        self.core.events.clone()
    }

    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.core.events.subscribe()
    }

    pub fn register_handler<F>(&self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(&Job, &JobContext) -> JobResult + Send + Sync + 'static,
    {
        let job_type = job_type.into();
        info!(job_type = %job_type, "handler registered");
        self.core.registry.register(job_type, handler);
    }

    // ---- lifecycle ----

    /// Run the recovery sweep, then start the dispatcher thread.
    pub fn start(&self) -> QueueResult<RecoveryReport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let mut slot = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let report = self.recover()?;
        let handle = self
            .core
            .spawn()
            .map_err(|e| QueueError::store(format!("failed to spawn dispatcher: {e}")))?;
        *slot = Some(handle);

        info!(worker = %self.core.worker_id(), "job queue started");
        Ok(report)
    }

    /// Stop dispatching, wait up to `shutdown_timeout` for running handlers,
    /// then close the event channel. Returns whether every handler finished in
    /// time. Closing twice is a no-op.
    pub fn close(&self) -> QueueResult<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(true);
        }

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }

        let timeout = self.core.config.shutdown_timeout;
        let drained = self.core.active.wait_idle(timeout);
        if !drained {
            warn!(
                running = self.core.active.current(),
                timeout_ms = timeout.as_millis() as u64,
                "shutdown timeout elapsed with handlers still running"
            );
        }

        self.core.events.close();
        info!(drained, "job queue closed");
        Ok(drained)
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn pause(&self) {
        self.core.pause();
        info!("dispatcher paused");
    }

    pub fn resume(&self) {
        self.core.resume();
        info!("dispatcher resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    /// One dispatcher tick on the calling thread.
    pub fn tick(&self) -> TickReport {
        self.core.tick()
    }

    pub fn recover(&self) -> QueueResult<RecoveryReport> {
        Ok(recovery::sweep(&self.core.store, &self.core.events)?)
    }

    /// Block until no handler started by this process is running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.core.active.wait_idle(timeout)
    }

    // ---- submission / control ----

    pub fn add_job(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: impl Into<JobOptions>,
    ) -> QueueResult<JobId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(QueueError::validation("job type must not be empty"));
        }
        let options = options.into();
        self.guard
            .check(&GuardedAction::Submit {
                job_type: &job_type,
                priority: options.priority,
            })
            .map_err(QueueError::Unauthorized)?;

        let job = Job::from_options(job_type, payload, &options, self.core.config.retry.max_attempts)?;
        self.core.store.submit(&job)?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            delayed = options.delay.is_some(),
            "job added"
        );
        let id = job.id;
        self.core.events.emit(JobEvent::Added { job });
        Ok(id)
    }

    pub fn get_job(&self, id: JobId) -> QueueResult<Job> {
        self.core.store.get(id)?.ok_or(QueueError::NotFound(id))
    }

    /// Cancel a pending or running job. Running handlers are not interrupted;
    /// their cancellation token is flipped and their outcome will be ignored.
    pub fn cancel_job(&self, id: JobId) -> QueueResult<Job> {
        self.guard
            .check(&GuardedAction::Cancel { job_id: id })
            .map_err(QueueError::Unauthorized)?;

        let mut rounds = 0;
        let (job, was_running) = loop {
            let mut job = self.get_job(id)?;
            let seen = job.status;
            job.cancel(Utc::now())?;
            if self.core.store.update_if(&job, seen)? {
                break (job, seen == JobStatus::Running);
            }
            rounds += 1;
            if rounds >= MAX_WRITE_ROUNDS {
                return Err(QueueError::store(format!("job {id} kept changing while being cancelled")));
            }
        };
        self.core.store.settle(id, TerminalLane::Cancelled)?;
        let signalled = self.core.tokens.cancel(id);

        info!(job_id = %id, was_running, signalled, "job cancelled");
        self.core.events.emit(JobEvent::Cancelled { job: job.clone() });
        Ok(job)
    }

    /// Manually retry a failed job from a clean retry budget.
    pub fn retry_job(&self, id: JobId) -> QueueResult<Job> {
        let job = self.get_job(id)?;
        self.revive(job, "retry")
    }

    /// Pull a dead-lettered job back into the Priority Lane.
    pub fn requeue_dead_letter_job(&self, id: JobId) -> QueueResult<Job> {
        let job = self.get_job(id)?;
        if job.status != JobStatus::Failed || job.dead_lettered_at.is_none() {
            return Err(QueueError::invalid_state(id, job.status, "requeue dead-letter"));
        }
        self.revive(job, "requeue dead-letter")
    }

    fn revive(&self, mut job: Job, action: &'static str) -> QueueResult<Job> {
        if job.status != JobStatus::Failed {
            return Err(QueueError::invalid_state(job.id, job.status, action));
        }
        job.reset_for_retry(Utc::now())?;
        if !self.core.store.update_if(&job, JobStatus::Failed)? {
            return Err(self.stale(job.id, action));
        }
        self.core.store.requeue(job.id, job.lane_score())?;

        info!(job_id = %job.id, action, "job requeued");
        self.core.events.emit(JobEvent::Requeued { job: job.clone() });
        Ok(job)
    }

    /// Change priority of a job that is not running; a pending job is
    /// re-scored in the lane. A job claimed or cancelled part-way through is
    /// reported as `InvalidState` with its current status.
    pub fn update_job_priority(&self, id: JobId, priority: Priority) -> QueueResult<Job> {
        let mut job = self.get_job(id)?;
        let seen = job.status;
        job.set_priority(priority)?;
        // Lane first: a pending job that has left the lane was claimed.
        if seen == JobStatus::Pending && !self.core.store.reschedule(id, job.lane_score())? {
            return Err(self.stale(id, "update priority of"));
        }
        if !self.core.store.update_if(&job, seen)? {
            return Err(self.stale(id, "update priority of"));
        }
        info!(job_id = %id, priority = %priority, "job priority updated");
        Ok(job)
    }

    /// `InvalidState` for a record that changed under a conditional write.
    fn stale(&self, id: JobId, action: &'static str) -> QueueError {
        match self.get_job(id) {
            Ok(current) => QueueError::invalid_state(id, current.status, action),
            Err(e) => e,
        }
    }

    // ---- queries / maintenance ----

    pub fn get_stats(&self) -> QueueResult<QueueStats> {
        let store = &self.core.store;
        Ok(QueueStats {
            counters: store.counters()?,
            pending: store.lane_len()?,
            active: store.in_flight_len()?,
            dead_letter: store.terminal_len(TerminalLane::DeadLetter)?,
            failed_lane: store.terminal_len(TerminalLane::Failed)?,
            completed_lane: store.terminal_len(TerminalLane::Completed)?,
            cancelled_lane: store.terminal_len(TerminalLane::Cancelled)?,
            paused: self.is_paused(),
        })
    }

    /// Records matching `filter`, newest first.
    pub fn get_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        Ok(self.core.store.list(filter)?)
    }

    /// Terminal jobs, most recently finished first.
    pub fn get_job_history(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let mut jobs = self.terminal_jobs(limit)?;
        jobs.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Records filed under the terminal lanes, up to `per_lane` from the head
    /// (newest end) of each.
    fn terminal_jobs(&self, per_lane: usize) -> QueueResult<Vec<Job>> {
        let store = &self.core.store;
        let mut jobs = Vec::new();
        for lane in TerminalLane::ALL {
            for id in store.lane_members(lane, per_lane)? {
                if let Some(job) = store.get(id)? {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    /// Dead-lettered jobs, most recently quarantined first.
    pub fn get_dead_letter_jobs(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let ids = self.core.store.lane_members(TerminalLane::DeadLetter, limit)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.core.store.get(id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Delete terminal jobs that finished more than `max_age` ago. Returns the
    /// number of records removed.
    pub fn cleanup(&self, max_age: Duration) -> QueueResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| QueueError::validation(format!("max_age out of range: {e}")))?;
        let cutoff = Utc::now() - max_age;

        let expired: Vec<JobId> = self
            .terminal_jobs(usize::MAX)?
            .into_iter()
            .filter(|j| j.status.is_terminal() && j.completed_at.unwrap_or(j.created_at) < cutoff)
            .map(|j| j.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let removed = self.core.store.delete(&expired)?;
        info!(removed, cutoff = %cutoff, "cleaned up terminal jobs");
        Ok(removed)
    }

    /// Block until `id` reaches a terminal status or `timeout` elapses.
    ///
    /// Resolves on local lifecycle events, on broadcasts from other processes,
    /// and on a store re-read every [`WAIT_SLICE`], so a missed event only
    /// delays the answer. Timing out never changes the job.
    pub fn wait_for_job(&self, id: JobId, timeout: Duration) -> QueueResult<Job> {
        // Subscribe before the first read so a transition in between is not lost.
        let subscription = self.core.events.subscribe();
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let job = self.get_job(id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }

            let slice_end = deadline.min(Instant::now() + WAIT_SLICE);
            loop {
                let now = Instant::now();
                if now >= slice_end {
                    break;
                }
                match subscription.recv_timeout(slice_end - now) {
                    Ok(event) => {
                        if let Some(job) = event.settles(id) {
                            return Ok(job.clone());
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return Err(QueueError::Closed),
                }
            }

            if Instant::now() >= deadline {
                // One last look so a transition at the deadline still counts.
                let job = self.get_job(id)?;
                if job.status.is_terminal() {
                    return Ok(job);
                }
                return Err(QueueError::Timeout {
                    id,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }
}

impl<S: JobStore + 'static> Drop for JobQueue<S> {
    fn drop(&mut self) {
        let handle = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }
}

impl<S: JobStore + 'static> std::fmt::Debug for JobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("worker", &self.core.worker_id())
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use serde_json::json;

    fn queue() -> JobQueue<Arc<InMemoryJobStore>> {
        JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default())
    }

    #[test]
    fn add_job_rejects_empty_type() {
        let q = queue();
        assert!(matches!(
            q.add_job("  ", json!({}), Priority::Low),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn guard_can_refuse_submission() {
        let q = queue().with_guard(|action: &GuardedAction<'_>| match action {
            GuardedAction::Submit { job_type, .. } if job_type.starts_with("admin.") => {
                Err("admin jobs need elevated rights".to_string())
            }
            _ => Ok(()),
        });

        assert!(q.add_job("mail.send", json!({}), JobOptions::default()).is_ok());
        assert!(matches!(
            q.add_job("admin.purge", json!({}), JobOptions::default()),
            Err(QueueError::Unauthorized(_))
        ));
    }

    #[test]
    fn get_missing_job_is_not_found() {
        let id = JobId::new();
        assert_eq!(queue().get_job(id), Err(QueueError::NotFound(id)));
    }

    #[test]
    fn start_twice_is_rejected_and_close_is_idempotent() {
        let q = queue();
        q.start().unwrap();
        assert_eq!(q.start(), Err(QueueError::AlreadyRunning));
        assert!(q.close().unwrap());
        assert!(q.close().unwrap());
        assert_eq!(q.start(), Err(QueueError::Closed));
        assert!(matches!(
            q.add_job("t", json!({}), Priority::Low),
            Err(QueueError::Closed)
        ));
    }

    #[test]
    fn priority_update_rescores_pending_job() {
        let q = queue();
        let low = q.add_job("t", json!({}), Priority::Low).unwrap();
        q.add_job("t", json!({}), Priority::Medium).unwrap();

        q.update_job_priority(low, Priority::Critical).unwrap();

        let now_ms = Utc::now().timestamp_millis() as u64;
        assert_eq!(q.store().peek_ready(now_ms).unwrap(), Some(low));
        assert_eq!(q.get_job(low).unwrap().priority, Priority::Critical);
    }

    #[test]
    fn retry_requires_failed_status() {
        let q = queue();
        let id = q.add_job("t", json!({}), Priority::Low).unwrap();
        assert!(matches!(
            q.retry_job(id),
            Err(QueueError::InvalidState { status: JobStatus::Pending, .. })
        ));
        assert!(q.requeue_dead_letter_job(id).is_err());
    }

    #[test]
    fn stats_reflect_lanes() {
        let q = queue();
        q.add_job("t", json!({}), Priority::Low).unwrap();
        let id = q.add_job("t", json!({}), Priority::High).unwrap();
        q.cancel_job(id).unwrap();

        let stats = q.get_stats().unwrap();
        assert_eq!(stats.counters.submitted, 2);
        assert_eq!(stats.counters.cancelled, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.active, 0);
    }
}
