//! Redis-backed store and broadcast checks.
//!
//! Run with `REDIS_URL=redis://127.0.0.1/ cargo test -p taskforge-infra --features redis`.
//! Without `REDIS_URL` every test returns early.
#![cfg(feature = "redis")]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use taskforge_core::{Job, JobId, JobStatus, Priority, RetryPolicy};
use taskforge_events::{EventChannel, JobEvent, Topic};
use taskforge_infra::config::QueueConfig;
use taskforge_infra::event_bus::{RedisBroadcastListener, RedisBroadcaster};
use taskforge_infra::jobs::{JobQueue, JobResult, JobStore, RedisJobStore, StatCounter, TerminalLane};

const KEYS: [&str; 8] = [
    "jobs",
    "queue",
    "active",
    "completed",
    "failed",
    "dead_letter",
    "cancelled",
    "stats",
];

struct Fixture {
    url: String,
    prefix: String,
}

impl Fixture {
    fn new() -> Option<Self> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(Self {
            url,
            prefix: format!("taskforge-test-{}", JobId::new()),
        })
    }

    fn store(&self) -> RedisJobStore {
        let store = RedisJobStore::new(&self.url, &self.prefix).unwrap();
        store.ping().unwrap();
        store
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let Ok(client) = redis::Client::open(self.url.as_str()) else {
            return;
        };
        let Ok(mut conn) = client.get_connection() else {
            return;
        };
        let keys: Vec<String> = KEYS.iter().map(|k| format!("{}:{k}", self.prefix)).collect();
        let _: redis::RedisResult<()> = redis::cmd("DEL").arg(keys).query(&mut conn);
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

#[test]
fn submit_peek_claim_settle() {
    let Some(fx) = Fixture::new() else { return };
    let store = fx.store();

    let low = Job::new("t", json!({}), 3).with_priority(Priority::Low);
    let critical = Job::new("t", json!({}), 3).with_priority(Priority::Critical);
    store.submit(&low).unwrap();
    store.submit(&critical).unwrap();

    assert_eq!(store.lane_len().unwrap(), 2);
    assert_eq!(store.peek_ready(now_ms()).unwrap(), Some(critical.id));

    assert!(store.try_claim(critical.id).unwrap());
    assert!(!store.try_claim(critical.id).unwrap());
    assert_eq!(store.in_flight().unwrap(), vec![critical.id]);

    store.settle(critical.id, TerminalLane::Completed).unwrap();
    assert_eq!(store.in_flight_len().unwrap(), 0);
    assert_eq!(store.terminal_len(TerminalLane::Completed).unwrap(), 1);
    assert_eq!(store.counters().unwrap().submitted, 2);

    let fetched = store.get(low.id).unwrap().unwrap();
    assert_eq!(fetched, low);
}

#[test]
fn requeue_and_delete_clear_every_lane() {
    let Some(fx) = Fixture::new() else { return };
    let store = fx.store();

    let job = Job::new("t", json!({}), 3);
    store.submit(&job).unwrap();
    assert!(store.try_claim(job.id).unwrap());
    store.settle(job.id, TerminalLane::DeadLetter).unwrap();

    store.requeue(job.id, job.lane_score()).unwrap();
    assert_eq!(store.terminal_len(TerminalLane::DeadLetter).unwrap(), 0);
    assert_eq!(store.lane_len().unwrap(), 1);

    store.increment(StatCounter::Retried).unwrap();
    assert_eq!(store.counters().unwrap().retried, 1);

    assert_eq!(store.delete(&[job.id]).unwrap(), 1);
    assert_eq!(store.lane_len().unwrap(), 0);
    assert!(store.get(job.id).unwrap().is_none());
}

#[test]
fn update_if_only_writes_over_expected_status() {
    let Some(fx) = Fixture::new() else { return };
    let store = fx.store();

    let job = Job::new("t", json!({}), 3);
    store.submit(&job).unwrap();

    let mut running = job.clone();
    running.start(Utc::now()).unwrap();
    assert!(!store.update_if(&running, JobStatus::Running).unwrap());
    assert_eq!(store.get(job.id).unwrap().unwrap().status, JobStatus::Pending);

    assert!(store.update_if(&running, JobStatus::Pending).unwrap());
    assert_eq!(store.get(job.id).unwrap().unwrap().status, JobStatus::Running);

    let missing = Job::new("t", json!({}), 3);
    assert!(store.update_if(&missing, JobStatus::Pending).is_err());
}

#[test]
fn cancelled_lane_is_cleared_by_requeue_and_delete() {
    let Some(fx) = Fixture::new() else { return };
    let store = fx.store();

    let job = Job::new("t", json!({}), 3);
    store.submit(&job).unwrap();
    store.settle(job.id, TerminalLane::Cancelled).unwrap();
    assert_eq!(store.lane_len().unwrap(), 0);
    assert_eq!(store.lane_members(TerminalLane::Cancelled, usize::MAX).unwrap(), vec![job.id]);
    assert_eq!(store.counters().unwrap().cancelled, 1);

    store.requeue(job.id, job.lane_score()).unwrap();
    assert_eq!(store.terminal_len(TerminalLane::Cancelled).unwrap(), 0);

    store.settle(job.id, TerminalLane::Cancelled).unwrap();
    store.delete(&[job.id]).unwrap();
    assert_eq!(store.terminal_len(TerminalLane::Cancelled).unwrap(), 0);
}

#[test]
fn concurrent_claims_have_one_winner_per_job() {
    let Some(fx) = Fixture::new() else { return };
    let store = Arc::new(fx.store());

    let jobs: Vec<Job> = (0..50).map(|n| Job::new("t", json!({ "n": n }), 3)).collect();
    for job in &jobs {
        store.submit(job).unwrap();
    }

    let won = Arc::new(Mutex::new(Vec::new()));
    let claimers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let won = won.clone();
            thread::spawn(move || {
                while let Some(id) = store.peek_ready(now_ms()).unwrap() {
                    if store.try_claim(id).unwrap() {
                        won.lock().unwrap().push(id);
                    }
                }
            })
        })
        .collect();
    for claimer in claimers {
        claimer.join().unwrap();
    }

    let won = won.lock().unwrap();
    let distinct: HashSet<JobId> = won.iter().copied().collect();
    assert_eq!(won.len(), jobs.len());
    assert_eq!(distinct.len(), jobs.len());
    assert_eq!(store.in_flight_len().unwrap(), jobs.len());
    assert_eq!(store.lane_len().unwrap(), 0);
}

#[test]
fn delayed_job_is_not_ready() {
    let Some(fx) = Fixture::new() else { return };
    let store = fx.store();

    let mut job = Job::new("t", json!({}), 3);
    job.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(5));
    store.submit(&job).unwrap();

    assert_eq!(store.peek_ready(now_ms()).unwrap(), None);
}

#[test]
fn queue_runs_jobs_and_broadcasts_completion() {
    let Some(fx) = Fixture::new() else { return };

    let observer = Arc::new(EventChannel::new());
    let events = observer.subscribe();
    let listener = RedisBroadcastListener::new(&fx.url, fx.prefix.clone(), RetryPolicy::default())
        .unwrap()
        .spawn(observer.clone())
        .unwrap();
    // Give the listener a moment to subscribe.
    std::thread::sleep(Duration::from_millis(200));

    let broadcaster = RedisBroadcaster::new(&fx.url, fx.prefix.clone()).unwrap();
    let config = QueueConfig::default()
        .with_key_prefix(fx.prefix.clone())
        .with_poll_interval(Duration::from_millis(10));
    let queue = JobQueue::with_broadcaster(fx.store(), config, Arc::new(broadcaster));
    queue.register_handler("double", |job, _| {
        let n = job.payload["n"].as_i64().unwrap_or(0);
        JobResult::Success(json!(n * 2))
    });
    queue.start().unwrap();

    let id = queue.add_job("double", json!({"n": 21}), Priority::High).unwrap();
    let job = queue.wait_for_job(id, Duration::from_secs(5)).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!(42)));

    let mut seen_completed = false;
    while let Ok(event) = events.recv_timeout(Duration::from_secs(2)) {
        if let JobEvent::Remote { topic: Topic::Completed, job } = event {
            if job.id == id {
                seen_completed = true;
                break;
            }
        }
    }
    assert!(seen_completed);

    queue.close().unwrap();
    listener.stop();
}
