//! Job lifecycle events and broadcast topics.

use serde::{Deserialize, Serialize};
use taskforge_core::{Job, JobId};

/// Cross-process broadcast topic.
///
/// Published on channel `{prefix}:{topic}`, e.g. `taskforge:job:completed`,
/// each message carrying the serialized job record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "job:added")]
    Added,
    #[serde(rename = "job:completed")]
    Completed,
    #[serde(rename = "job:failed")]
    Failed,
    #[serde(rename = "job:progress")]
    Progress,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Added, Topic::Completed, Topic::Failed, Topic::Progress];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Added => "job:added",
            Topic::Completed => "job:completed",
            Topic::Failed => "job:failed",
            Topic::Progress => "job:progress",
        }
    }

    /// Fully qualified channel name under `prefix`.
    pub fn channel(self, prefix: &str) -> String {
        format!("{prefix}:{}", self.as_str())
    }

    /// Inverse of [`Topic::channel`].
    pub fn from_channel(prefix: &str, channel: &str) -> Option<Topic> {
        let rest = channel.strip_prefix(prefix)?.strip_prefix(':')?;
        Topic::ALL.into_iter().find(|t| t.as_str() == rest)
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event on the in-process channel.
///
/// Events that carry a [`Job`] carry a snapshot taken right after the
/// transition was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Added { job: Job },
    Started { job: Job },
    Progress { job: Job },
    Completed { job: Job },
    /// Failed attempt rescheduled; `delay_ms` until it becomes visible again.
    Retrying { job: Job, delay_ms: u64 },
    /// Retries exhausted.
    Failed { job: Job, dead_lettered: bool },
    Cancelled { job: Job },
    /// Manually retried or pulled out of the dead-letter lane.
    Requeued { job: Job },
    /// Returned to pending by the recovery sweep.
    Recovered { job: Job },
    /// Lifecycle broadcast received from another process.
    Remote { topic: Topic, job: Job },
    /// The broadcast transport gave up reconnecting.
    TransportDegraded { reason: String },
}

impl JobEvent {
    pub fn job(&self) -> Option<&Job> {
        match self {
            JobEvent::Added { job }
            | JobEvent::Started { job }
            | JobEvent::Progress { job }
            | JobEvent::Completed { job }
            | JobEvent::Retrying { job, .. }
            | JobEvent::Failed { job, .. }
            | JobEvent::Cancelled { job }
            | JobEvent::Requeued { job }
            | JobEvent::Recovered { job }
            | JobEvent::Remote { job, .. } => Some(job),
            JobEvent::TransportDegraded { .. } => None,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job().map(|j| j.id)
    }

    /// Topic this event is broadcast on, if any. Remote events are never
    /// re-broadcast.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            JobEvent::Added { .. } => Some(Topic::Added),
            JobEvent::Progress { .. } => Some(Topic::Progress),
            JobEvent::Completed { .. } => Some(Topic::Completed),
            JobEvent::Failed { .. } => Some(Topic::Failed),
            _ => None,
        }
    }

    /// The terminal record for `id`, if this event settles it.
    ///
    /// Remote events count when their snapshot is already terminal, so a job
    /// finished by another process still resolves a local wait.
    pub fn settles(&self, id: JobId) -> Option<&Job> {
        let job = match self {
            JobEvent::Completed { job }
            | JobEvent::Failed { job, .. }
            | JobEvent::Cancelled { job } => job,
            JobEvent::Remote { job, .. } if job.status.is_terminal() => job,
            _ => return None,
        };
        (job.id == id).then_some(job)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Added { .. } => "added",
            JobEvent::Started { .. } => "started",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Retrying { .. } => "retrying",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Cancelled { .. } => "cancelled",
            JobEvent::Requeued { .. } => "requeued",
            JobEvent::Recovered { .. } => "recovered",
            JobEvent::Remote { .. } => "remote",
            JobEvent::TransportDegraded { .. } => "transport_degraded",
        }
    }
}
