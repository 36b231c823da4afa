//! The job record and its state machine.
//!
//! ```text
//! pending ──► running ──► completed
//!    │           │ └────► cancelled
//!    │           ├──────► failed ──► pending   (manual retry / dead-letter requeue)
//!    │           └──────► pending             (automatic retry, crash recovery)
//!    └──────────────────► cancelled
//! ```
//!
//! Every mutation goes through a method that checks the edge first, so a record
//! can never be driven into two different terminal states.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use crate::priority::{BAND_WIDTH, LaneScore, Priority};

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// In the Priority Lane, waiting to be claimed
    Pending,
    /// Claimed by a dispatcher; handler executing
    Running,
    /// Handler returned success
    Completed,
    /// Retries exhausted (or retries disabled)
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal edges of the state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry bookkeeping carried on every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    /// Automatic retries performed so far.
    pub attempts: u32,
    /// Retries allowed before the job is forced into `failed`.
    pub max_attempts: u32,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
}

impl RetryInfo {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            last_attempt_time: None,
            next_retry_time: None,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Submission options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Priority,
    /// Overrides the queue-wide retry limit for this job.
    pub retry_attempts: Option<u32>,
    /// Keep the job invisible to dispatchers for this long after submission.
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl From<Priority> for JobOptions {
    fn from(priority: Priority) -> Self {
        Self::default().with_priority(priority)
    }
}

/// A unit of work and the full record of its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Selects the handler.
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub payload: serde_json::Value,
    /// 0–100, handler-reported.
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// First error ever recorded; later attempts only overwrite `error`.
    pub original_error: Option<String>,
    pub retry_info: RetryInfo,
    pub created_at: DateTime<Utc>,
    /// Initial visibility instant when submitted with a delay.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the job was quarantined in the dead-letter lane.
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            priority: Priority::default(),
            payload,
            progress: 0,
            result: None,
            error: None,
            original_error: None,
            retry_info: RetryInfo::new(max_attempts),
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            dead_lettered_at: None,
        }
    }

    /// Create a pending job from submission options. A `delay` reaching past
    /// the last instant a lane score can hold is a validation error.
    pub fn from_options(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: &JobOptions,
        default_max_attempts: u32,
    ) -> QueueResult<Self> {
        let mut job = Self::new(
            job_type,
            payload,
            options.retry_attempts.unwrap_or(default_max_attempts),
        );
        job.priority = options.priority;
        if let Some(delay) = options.delay {
            let at = offset(job.created_at, delay).ok_or_else(|| {
                QueueError::validation(format!("delay of {}s is out of range", delay.as_secs()))
            })?;
            job.scheduled_at = Some(at);
        }
        Ok(job)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Instant from which the job may be claimed.
    pub fn visible_at(&self) -> DateTime<Utc> {
        self.retry_info
            .next_retry_time
            .or(self.scheduled_at)
            .unwrap_or(self.created_at)
    }

    /// Where this job belongs in the Priority Lane.
    pub fn lane_score(&self) -> LaneScore {
        LaneScore::new(self.priority, self.visible_at())
    }

    fn transition(&mut self, next: JobStatus, action: &'static str) -> QueueResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::invalid_state(self.id, self.status, action));
        }
        self.status = next;
        Ok(())
    }

    /// Claimed by a dispatcher.
    pub fn start(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(JobStatus::Running, "start")?;
        self.started_at = Some(now);
        self.retry_info.last_attempt_time = Some(now);
        Ok(())
    }

    /// Handler succeeded.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(JobStatus::Completed, "complete")?;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Handler failed and retries remain: back to pending, visible after `delay`.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        if self.retry_info.exhausted() {
            return Err(QueueError::invalid_state(self.id, self.status, "retry"));
        }
        self.transition(JobStatus::Pending, "retry")?;
        self.record_error(error.into());
        self.retry_info.attempts += 1;
        self.retry_info.next_retry_time = Some(offset(now, delay).unwrap_or_else(latest_visible));
        self.progress = 0;
        self.started_at = None;
        Ok(())
    }

    /// Handler failed with no retries left.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        dead_letter: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.transition(JobStatus::Failed, "fail")?;
        self.record_error(error.into());
        self.retry_info.next_retry_time = None;
        self.completed_at = Some(now);
        if dead_letter {
            self.dead_lettered_at = Some(now);
        }
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(JobStatus::Cancelled, "cancel")?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Manual retry of a failed (or dead-lettered) job.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(JobStatus::Pending, "retry")?;
        self.retry_info = RetryInfo::new(self.retry_info.max_attempts);
        self.error = None;
        self.original_error = None;
        self.result = None;
        self.progress = 0;
        self.started_at = None;
        self.completed_at = None;
        self.dead_lettered_at = None;
        self.scheduled_at = Some(now);
        Ok(())
    }

    /// Orphaned by a crashed dispatcher: back to pending. A record still
    /// `pending` (crash between claim and persist) is accepted as-is.
    ///
    /// `retry_info.attempts` is kept: a crash is not a handler failure, but the
    /// failures that came before it still count against the budget.
    pub fn recover(&mut self) -> QueueResult<()> {
        if self.status != JobStatus::Pending {
            self.transition(JobStatus::Pending, "recover")?;
        }
        self.started_at = None;
        self.progress = 0;
        Ok(())
    }

    /// Record handler progress. Only moves forward while running.
    pub fn set_progress(&mut self, progress: u8) -> bool {
        let progress = progress.min(100);
        if self.status != JobStatus::Running || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        true
    }

    pub fn set_priority(&mut self, priority: Priority) -> QueueResult<()> {
        if self.status == JobStatus::Running {
            return Err(QueueError::invalid_state(self.id, self.status, "reprioritize"));
        }
        self.priority = priority;
        Ok(())
    }

    fn record_error(&mut self, error: String) {
        if self.original_error.is_none() {
            self.original_error = Some(error.clone());
        }
        self.error = Some(error);
    }
}

/// `from + delay`, or `None` past the last instant a lane score can express.
fn offset(from: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay).ok()?;
    let at = from.checked_add_signed(delay)?;
    (at.timestamp_millis() < BAND_WIDTH as i64).then_some(at)
}

fn latest_visible() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(BAND_WIDTH as i64 - 1).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_job(max_attempts: u32) -> Job {
        let mut job = Job::new("test", json!({}), max_attempts);
        job.start(Utc::now()).unwrap();
        job
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new("test", json!({"key": "value"}), 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_info.attempts, 0);

        job.start(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        assert!(job.set_progress(40));
        job.complete(json!({"ok": true}), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.error.is_none());
    }

    #[test]
    fn retry_then_exhaust() {
        let mut job = running_job(2);
        let now = Utc::now();

        job.schedule_retry("boom 1", Duration::from_millis(100), now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_info.attempts, 1);
        assert_eq!(job.visible_at(), now + chrono::Duration::milliseconds(100));

        job.start(Utc::now()).unwrap();
        job.schedule_retry("boom 2", Duration::from_millis(200), now).unwrap();
        assert_eq!(job.retry_info.attempts, 2);

        job.start(Utc::now()).unwrap();
        let err = job.schedule_retry("boom 3", Duration::ZERO, now).unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { action: "retry", .. }));

        job.fail("boom 3", true, now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom 3"));
        assert_eq!(job.original_error.as_deref(), Some("boom 1"));
        assert!(job.dead_lettered_at.is_some());
    }

    #[test]
    fn progress_is_monotonic_and_reset_on_retry() {
        let mut job = running_job(3);
        assert!(job.set_progress(50));
        assert!(!job.set_progress(20));
        assert!(job.set_progress(250));
        assert_eq!(job.progress, 100);

        job.schedule_retry("x", Duration::ZERO, Utc::now()).unwrap();
        assert_eq!(job.progress, 0);
        assert!(!job.set_progress(10), "progress ignored while pending");
    }

    #[test]
    fn cancel_twice_is_rejected() {
        let mut job = Job::new("test", json!({}), 3);
        job.cancel(Utc::now()).unwrap();
        let err = job.cancel(Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidState {
                status: JobStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn manual_retry_only_from_failed() {
        let mut job = running_job(0);
        job.fail("nope", false, Utc::now()).unwrap();
        job.reset_for_retry(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_info.attempts, 0);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_none());

        let mut done = running_job(0);
        done.complete(json!(1), Utc::now()).unwrap();
        assert!(done.reset_for_retry(Utc::now()).is_err());
    }

    #[test]
    fn recover_clears_start() {
        let mut job = running_job(3);
        job.set_progress(70);
        job.recover().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert_eq!(job.progress, 0);

        let mut done = running_job(3);
        done.complete(json!(null), Utc::now()).unwrap();
        assert!(done.recover().is_err());
    }

    #[test]
    fn delayed_submission_moves_visibility() {
        let opts = JobOptions::default()
            .with_priority(Priority::High)
            .with_delay(Duration::from_secs(60))
            .with_retry_attempts(7);
        let job = Job::from_options("t", json!({}), &opts, 3).unwrap();
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.retry_info.max_attempts, 7);
        assert_eq!(job.visible_at(), job.created_at + chrono::Duration::seconds(60));
    }

    #[test]
    fn out_of_range_delay_is_rejected() {
        let opts = JobOptions::default().with_delay(Duration::from_secs(u64::MAX));
        assert!(matches!(
            Job::from_options("t", json!({}), &opts, 3),
            Err(QueueError::Validation(_))
        ));

        // Past the lane's last expressible instant but inside chrono's range.
        let opts = JobOptions::default().with_delay(Duration::from_secs(400 * 365 * 86_400));
        assert!(Job::from_options("t", json!({}), &opts, 3).is_err());
    }

    #[test]
    fn huge_retry_backoff_is_clamped() {
        let mut job = running_job(3);
        job.schedule_retry("boom", Duration::from_secs(u64::MAX), Utc::now())
            .unwrap();
        let at = job.retry_info.next_retry_time.unwrap();
        assert_eq!(at.timestamp_millis(), BAND_WIDTH as i64 - 1);
        assert_eq!(job.lane_score().priority(), job.priority);
    }

    #[test]
    fn priority_change_rejected_while_running() {
        let mut job = running_job(3);
        assert!(job.set_priority(Priority::Low).is_err());
    }

    #[test]
    fn serializes_type_field() {
        let job = Job::new("report.build", json!({}), 1);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "report.build");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["retryInfo"]["maxAttempts"], 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Start,
            Complete,
            Retry,
            Fail,
            Cancel,
            ManualRetry,
            Recover,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Start),
                Just(Op::Complete),
                Just(Op::Retry),
                Just(Op::Fail),
                Just(Op::Cancel),
                Just(Op::ManualRetry),
                Just(Op::Recover),
            ]
        }

        proptest! {
            /// Property: any operation sequence only walks legal edges, attempts
            /// never exceed the maximum, and a terminal status is only left via
            /// the explicit failed -> pending retry edge.
            #[test]
            fn state_machine_holds(max in 0u32..4, ops in prop::collection::vec(op(), 0..40)) {
                let mut job = Job::new("prop", serde_json::json!({}), max);
                for op in ops {
                    let before = job.status;
                    let now = Utc::now();
                    let res = match op {
                        Op::Start => job.start(now),
                        Op::Complete => job.complete(serde_json::json!(null), now),
                        Op::Retry => job.schedule_retry("e", Duration::ZERO, now),
                        Op::Fail => job.fail("e", false, now),
                        Op::Cancel => job.cancel(now),
                        Op::ManualRetry => job.reset_for_retry(now),
                        Op::Recover => job.recover(),
                    };
                    if res.is_ok() && before != job.status {
                        prop_assert!(before.can_transition_to(job.status));
                    }
                    if res.is_err() {
                        prop_assert_eq!(before, job.status);
                    }
                    if matches!(before, JobStatus::Completed | JobStatus::Cancelled) {
                        prop_assert_eq!(job.status, before);
                    }
                    prop_assert!(job.retry_info.attempts <= job.retry_info.max_attempts);
                }
            }
        }
    }
}
