//! Startup recovery sweep.
//!
//! Membership in the In-Flight Set is the lease on a job. A process that dies
//! mid-handler leaves its jobs there; the sweep, run before the dispatcher
//! starts ticking, puts every non-terminal member back into the Priority Lane
//! at its original submission score. Terminal or missing records are only
//! released.
//!
//! The sweep does not distinguish jobs held by a live peer from orphans, so
//! it belongs at process start, before this process claims anything.

use tracing::{info, warn};

use taskforge_core::JobId;
use taskforge_events::{EventChannel, JobEvent};

use super::store::{JobStore, JobStoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Returned to `pending` and re-enqueued.
    pub requeued: Vec<JobId>,
    /// Dropped from the In-Flight Set without requeueing.
    pub released: Vec<JobId>,
}

pub fn sweep<S: JobStore + ?Sized>(
    store: &S,
    events: &EventChannel,
) -> Result<RecoveryReport, JobStoreError> {
    let mut report = RecoveryReport::default();

    for id in store.in_flight()? {
        let mut job = match store.get(id)? {
            Some(job) if !job.status.is_terminal() => job,
            other => {
                store.release(id)?;
                warn!(
                    job_id = %id,
                    status = ?other.map(|j| j.status),
                    "released stale in-flight entry"
                );
                report.released.push(id);
                continue;
            }
        };

        let seen = job.status;
        if let Err(e) = job.recover() {
            warn!(job_id = %id, error = %e, "cannot recover job, releasing");
            store.release(id)?;
            report.released.push(id);
            continue;
        }
        // Fresh submission for backoff purposes: original priority and age.
        job.retry_info.next_retry_time = None;

        if !store.update_if(&job, seen)? {
            // Cancelled or settled between the read and the write.
            store.release(id)?;
            report.released.push(id);
            continue;
        }
        store.requeue(id, job.lane_score())?;
        info!(job_id = %id, job_type = %job.job_type, "recovered orphaned job");
        events.emit(JobEvent::Recovered { job });
        report.requeued.push(id);
    }

    if !report.requeued.is_empty() || !report.released.is_empty() {
        info!(
            requeued = report.requeued.len(),
            released = report.released.len(),
            "recovery sweep finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, TerminalLane};
    use chrono::Utc;
    use serde_json::json;
    use taskforge_core::{Job, JobStatus, Priority};

    #[test]
    fn running_jobs_go_back_to_pending() {
        let store = InMemoryJobStore::new();
        let events = EventChannel::new();
        let sub = events.subscribe();

        let mut job = Job::new("test", json!({}), 3).with_priority(Priority::High);
        store.submit(&job).unwrap();
        assert!(store.try_claim(job.id).unwrap());
        job.start(Utc::now()).unwrap();
        job.set_progress(40);
        store.update(&job).unwrap();

        let report = sweep(&store, &events).unwrap();
        assert_eq!(report.requeued, vec![job.id]);

        let recovered = store.get(job.id).unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert!(recovered.started_at.is_none());
        assert_eq!(recovered.progress, 0);
        assert_eq!(store.in_flight_len().unwrap(), 0);
        assert_eq!(store.lane_len().unwrap(), 1);
        assert!(matches!(sub.try_recv(), Ok(JobEvent::Recovered { .. })));
    }

    #[test]
    fn terminal_and_missing_entries_are_released() {
        let store = InMemoryJobStore::new();
        let mut done = Job::new("test", json!({}), 3);
        store.submit(&done).unwrap();
        store.try_claim(done.id).unwrap();
        done.start(Utc::now()).unwrap();
        done.complete(json!(null), Utc::now()).unwrap();
        store.update(&done).unwrap();

        let ghost = JobId::new();
        store.force_in_flight(ghost).unwrap();

        let report = sweep(&store, &EventChannel::new()).unwrap();
        assert!(report.requeued.is_empty());
        assert_eq!(report.released.len(), 2);
        assert_eq!(store.in_flight_len().unwrap(), 0);
        assert_eq!(store.lane_len().unwrap(), 0);
        assert_eq!(store.terminal_len(TerminalLane::Completed).unwrap(), 0);
    }
}
