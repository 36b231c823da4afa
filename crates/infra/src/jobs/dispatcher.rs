//! Dispatcher: claims ready jobs under the concurrency budget and runs their
//! handlers, then drives the completion, retry and dead-letter paths.
//!
//! One dispatcher thread per process ticks every `poll_interval`. Each claimed
//! job runs on its own handler thread. Store and transport errors are logged
//! and never end the dispatcher thread; the next tick simply tries again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use taskforge_core::{Job, JobId, JobStatus, WorkerId};
use taskforge_events::{EventChannel, JobEvent};

use super::registry::{HandlerRegistry, JobContext, JobHandler, JobResult, ProgressSink, invoke};
use super::store::{JobStore, StatCounter, TerminalLane};
use crate::config::QueueConfig;

/// Consecutive lost claim races tolerated within one tick.
const MAX_LOST_RACES: usize = 16;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<JobId>,
    pub lost_races: usize,
    /// Claimed ids whose record was missing or no longer pending.
    pub discarded: usize,
    pub paused: bool,
}

/// Cancellation tokens of the jobs running in this process.
#[derive(Debug, Default)]
pub struct CancelTokens {
    tokens: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
}

impl CancelTokens {
    fn issue(&self, id: JobId) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        token
    }

    /// Flip the token for `id`; `false` if the job is not running here.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.tokens.lock().unwrap_or_else(PoisonError::into_inner).get(&id) {
            Some(token) => {
                token.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: JobId) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Counts handler threads so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct ActiveHandlers {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveHandlers {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        ActiveGuard(self.clone())
    }

    pub fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no handler is running or `timeout` elapses. Returns whether
    /// the handlers drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == 0
    }
}

struct ActiveGuard(Arc<ActiveHandlers>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut n = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// State shared by the dispatcher thread, handler threads and the queue API.
pub struct Dispatcher<S: JobStore> {
    pub(crate) store: S,
    pub(crate) config: QueueConfig,
    pub(crate) events: Arc<EventChannel>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) tokens: CancelTokens,
    pub(crate) active: Arc<ActiveHandlers>,
    paused: AtomicBool,
    worker: WorkerId,
}

impl<S: JobStore + 'static> Dispatcher<S> {
    pub fn new(store: S, config: QueueConfig, events: EventChannel) -> Self {
        Self {
            store,
            config,
            events: Arc::new(events),
            registry: HandlerRegistry::new(),
            tokens: CancelTokens::default(),
            active: Arc::new(ActiveHandlers::default()),
            paused: AtomicBool::new(false),
            worker: WorkerId::new(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Claim and start jobs until the budget is spent or the lane has nothing
    /// ready.
    pub fn tick(self: &Arc<Self>) -> TickReport {
        let mut report = TickReport {
            paused: self.is_paused(),
            ..TickReport::default()
        };
        if report.paused {
            return report;
        }

        loop {
            match self.store.in_flight_len() {
                Ok(n) if n >= self.config.max_concurrent_jobs => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(worker = %self.worker, error = %e, "failed to read in-flight set");
                    break;
                }
            }

            let now_ms = Utc::now().timestamp_millis().max(0) as u64;
            let candidate = match self.store.peek_ready(now_ms) {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = %self.worker, error = %e, "failed to read priority lane");
                    break;
                }
            };

            match self.store.try_claim(candidate) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(worker = %self.worker, job_id = %candidate, "lost claim race");
                    report.lost_races += 1;
                    if report.lost_races >= MAX_LOST_RACES {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(worker = %self.worker, job_id = %candidate, error = %e, "claim failed");
                    break;
                }
            }

            match self.start_claimed(candidate) {
                Some(()) => report.started.push(candidate),
                None => report.discarded += 1,
            }
        }

        report
    }

    /// Mark a freshly claimed job running and hand it to a handler thread.
    fn start_claimed(self: &Arc<Self>, id: JobId) -> Option<()> {
        let mut job = match self.store.get(id) {
            Ok(Some(job)) if job.status == JobStatus::Pending => job,
            Ok(other) => {
                debug!(
                    job_id = %id,
                    status = ?other.map(|j| j.status),
                    "claimed job is not pending, releasing"
                );
                self.release(id);
                return None;
            }
            Err(e) => {
                // Left in flight; the recovery sweep puts it back.
                error!(job_id = %id, error = %e, "failed to load claimed job");
                return None;
            }
        };

        if let Err(e) = job.start(Utc::now()) {
            warn!(job_id = %id, error = %e, "claimed job refused to start");
            self.release(id);
            return None;
        }
        match self.store.update_if(&job, JobStatus::Pending) {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %id, "claimed job changed before start, releasing");
                self.release(id);
                return None;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to persist running status, requeueing");
                self.requeue_unstarted(id);
                return None;
            }
        }

        info!(
            worker = %self.worker,
            job_id = %id,
            job_type = %job.job_type,
            priority = %job.priority,
            attempt = job.retry_info.attempts,
            "job started"
        );
        self.events.emit(JobEvent::Started { job: job.clone() });

        let handler = self.registry.resolve(&job.job_type);
        let token = self.tokens.issue(id);
        let guard = self.active.enter();
        let core = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("taskforge-job-{id}"))
            .spawn(move || {
                let _guard = guard;
                core.execute(job, handler, token);
            });

        if let Err(e) = spawned {
            error!(job_id = %id, error = %e, "failed to spawn handler thread");
            self.tokens.remove(id);
            self.requeue_unstarted(id);
            return None;
        }
        Some(())
    }

    fn execute(self: Arc<Self>, job: Job, handler: Option<JobHandler>, token: Arc<AtomicBool>) {
        let started = Instant::now();
        let outcome = match handler {
            Some(handler) => {
                let ctx = JobContext::new(job.id, token, self.clone());
                invoke(&handler, &job, &ctx)
            }
            None => JobResult::Failure(format!(
                "no handler registered for job type {}",
                job.job_type
            )),
        };
        self.tokens.remove(job.id);

        debug!(
            job_id = %job.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "handler returned"
        );

        match outcome {
            JobResult::Success(value) => self.on_success(job.id, value),
            JobResult::Failure(error) => self.on_failure(job.id, error),
        }
    }

    /// Load the record a handler just finished with, if its outcome still
    /// counts. A record that was cancelled (or otherwise moved on) while the
    /// handler ran is released and the outcome dropped.
    fn reload_running(&self, id: JobId) -> Option<Job> {
        match self.store.get(id) {
            Ok(Some(job)) if job.status == JobStatus::Running => Some(job),
            Ok(Some(job)) => {
                info!(job_id = %id, status = %job.status, "handler outcome discarded");
                self.release(id);
                None
            }
            Ok(None) => {
                warn!(job_id = %id, "job record vanished while running");
                self.release(id);
                None
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to reload job after handler");
                None
            }
        }
    }

    /// Write back a record the handler finished with. The write only lands if
    /// the stored record is still running; otherwise the outcome is dropped.
    fn persist_running(&self, job: &Job, outcome: &'static str) -> bool {
        match self.store.update_if(job, JobStatus::Running) {
            Ok(true) => true,
            Ok(false) => {
                info!(job_id = %job.id, outcome, "job changed while finishing, outcome discarded");
                self.release(job.id);
                false
            }
            Err(e) => {
                error!(job_id = %job.id, outcome, error = %e, "failed to persist handler outcome");
                false
            }
        }
    }

    /// Completion path.
    pub fn on_success(&self, id: JobId, result: serde_json::Value) {
        let Some(mut job) = self.reload_running(id) else {
            return;
        };
        if let Err(e) = job.complete(result, Utc::now()) {
            warn!(job_id = %id, error = %e, "cannot complete job");
            return;
        }
        if !self.persist_running(&job, "completion") {
            return;
        }
        if let Err(e) = self.store.settle(id, TerminalLane::Completed) {
            error!(job_id = %id, error = %e, "failed to settle completed job");
        }

        info!(job_id = %id, job_type = %job.job_type, "job completed");
        self.events.emit(JobEvent::Completed { job });
    }

    /// Failure path: retry with backoff while attempts remain, otherwise file
    /// under the dead-letter (or plain failed) lane.
    pub fn on_failure(&self, id: JobId, error: String) {
        let Some(mut job) = self.reload_running(id) else {
            return;
        };
        let now = Utc::now();

        if !job.retry_info.exhausted() {
            let attempt = job.retry_info.attempts + 1;
            let delay = self.config.retry.delay_for_attempt(attempt);
            if let Err(e) = job.schedule_retry(error.clone(), delay, now) {
                warn!(job_id = %id, error = %e, "cannot schedule retry");
                return;
            }
            if !self.persist_running(&job, "retry") {
                return;
            }
            if let Err(e) = self.store.requeue(id, job.lane_score()) {
                error!(job_id = %id, error = %e, "failed to requeue retry");
                return;
            }
            if let Err(e) = self.store.increment(StatCounter::Retried) {
                warn!(job_id = %id, error = %e, "failed to bump retried counter");
            }

            warn!(
                job_id = %id,
                job_type = %job.job_type,
                attempt,
                max_attempts = job.retry_info.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "job failed, retry scheduled"
            );
            self.events.emit(JobEvent::Retrying {
                job,
                delay_ms: delay.as_millis() as u64,
            });
            return;
        }

        let dead_letter = self.config.dead_letter_enabled;
        if let Err(e) = job.fail(error.clone(), dead_letter, now) {
            warn!(job_id = %id, error = %e, "cannot fail job");
            return;
        }
        if !self.persist_running(&job, "failure") {
            return;
        }
        let lane = if dead_letter {
            TerminalLane::DeadLetter
        } else {
            TerminalLane::Failed
        };
        if let Err(e) = self.store.settle(id, lane) {
            error!(job_id = %id, error = %e, "failed to settle failed job");
        }

        error!(
            job_id = %id,
            job_type = %job.job_type,
            attempts = job.retry_info.attempts,
            lane = lane.as_str(),
            error = %error,
            "job failed permanently"
        );
        self.events.emit(JobEvent::Failed {
            job,
            dead_lettered: dead_letter,
        });
    }

    fn release(&self, id: JobId) {
        if let Err(e) = self.store.release(id) {
            warn!(job_id = %id, error = %e, "failed to release job from in-flight set");
        }
    }

    /// Undo a claim whose start never took effect. A record that has moved
    /// on to another status is only released.
    fn requeue_unstarted(&self, id: JobId) {
        let mut job = match self.store.get(id) {
            Ok(Some(job)) => job,
            _ => return,
        };
        let status = job.status;
        match status {
            JobStatus::Pending => {}
            JobStatus::Running if job.recover().is_ok() => {
                match self.store.update_if(&job, JobStatus::Running) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.release(id);
                        return;
                    }
                    Err(e) => {
                        // Still in flight; the recovery sweep resets it.
                        warn!(job_id = %id, error = %e, "failed to reset job to pending");
                        return;
                    }
                }
            }
            _ => {
                self.release(id);
                return;
            }
        }
        if let Err(e) = self.store.requeue(id, job.lane_score()) {
            error!(job_id = %id, error = %e, "failed to requeue job; recovery sweep will pick it up");
        }
    }

    /// Spawn the dispatcher thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<DispatcherHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let core = self.clone();
        let join = thread::Builder::new()
            .name(format!("taskforge-dispatcher-{}", self.worker))
            .spawn(move || dispatcher_loop(core, shutdown_rx))?;

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

impl<S: JobStore + 'static> ProgressSink for Dispatcher<S> {
    fn report(&self, job_id: JobId, progress: u8) {
        let mut job = match self.store.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to load job for progress");
                return;
            }
        };

        // Another process may have cancelled the job; surface it to the handler.
        if job.status != JobStatus::Running {
            self.tokens.cancel(job_id);
            return;
        }
        if !job.set_progress(progress) {
            return;
        }
        match self.store.update_if(&job, JobStatus::Running) {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, "job left running before progress was written");
                self.tokens.cancel(job_id);
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to persist progress");
                return;
            }
        }

        debug!(job_id = %job_id, progress, "job progress");
        self.events.emit(JobEvent::Progress { job });
    }
}

fn dispatcher_loop<S: JobStore + 'static>(core: Arc<Dispatcher<S>>, shutdown_rx: mpsc::Receiver<()>) {
    info!(
        worker = %core.worker,
        max_concurrent = core.config.max_concurrent_jobs,
        poll_interval_ms = core.config.poll_interval.as_millis() as u64,
        "dispatcher started"
    );

    loop {
        let report = core.tick();
        if !report.started.is_empty() || report.lost_races > 0 {
            debug!(
                worker = %core.worker,
                started = report.started.len(),
                lost_races = report.lost_races,
                "tick"
            );
        }

        match shutdown_rx.recv_timeout(core.config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %core.worker, "dispatcher stopped");
}

/// Handle to a running dispatcher thread.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop ticking and join the dispatcher thread. Handler threads keep
    /// running.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}
