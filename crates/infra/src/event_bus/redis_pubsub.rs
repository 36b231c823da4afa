//! Redis pub/sub transport for lifecycle broadcasts (optional).
//!
//! Redis pub/sub is not durable: messages published while a listener is
//! disconnected are lost. That is acceptable here because every broadcast is
//! a notification about state that already lives in the job store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use redis::Commands;
use tracing::{debug, error, info, warn};

use taskforge_core::{Job, RetryPolicy};
use taskforge_events::{BroadcastError, Broadcaster, EventChannel, JobEvent, Topic};

/// How long a blocked read waits before re-checking the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

fn transport(e: redis::RedisError) -> BroadcastError {
    BroadcastError::Transport(e.to_string())
}

/// Publishes lifecycle topics as JSON job records on `{prefix}:{topic}`.
#[derive(Debug, Clone)]
pub struct RedisBroadcaster {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisBroadcaster {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, BroadcastError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(transport)?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.into(),
        })
    }
}

impl Broadcaster for RedisBroadcaster {
    fn broadcast(&self, topic: Topic, job: &Job) -> Result<(), BroadcastError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.client.get_connection().map_err(transport)?;
        let receivers: i64 = conn
            .publish(topic.channel(&self.prefix), payload)
            .map_err(transport)?;
        debug!(topic = %topic, job_id = %job.id, receivers, "broadcast published");
        Ok(())
    }
}

/// Background subscriber that feeds broadcasts from other processes into the
/// local event channel as [`JobEvent::Remote`].
///
/// On a dropped connection it reconnects with the policy's backoff and
/// re-subscribes to every topic. Once `max_attempts` consecutive reconnects
/// have failed it emits [`JobEvent::TransportDegraded`] and stops; job
/// processing is unaffected.
#[derive(Debug, Clone)]
pub struct RedisBroadcastListener {
    client: Arc<redis::Client>,
    prefix: String,
    policy: RetryPolicy,
}

impl RedisBroadcastListener {
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, BroadcastError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(transport)?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.into(),
            policy,
        })
    }

    pub fn spawn(self, events: Arc<EventChannel>) -> std::io::Result<ListenerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let join = thread::Builder::new()
            .name("taskforge-broadcast-listener".to_string())
            .spawn(move || self.run(&events, &stop_flag))?;

        Ok(ListenerHandle {
            stop,
            join: Some(join),
        })
    }

    fn run(&self, events: &EventChannel, stop: &AtomicBool) {
        let mut failures: u32 = 0;

        while !stop.load(Ordering::Acquire) {
            let err = match self.session(events, stop, &mut failures) {
                Ok(()) => break,
                Err(e) => e,
            };

            failures += 1;
            if failures > self.policy.max_attempts {
                let reason = format!(
                    "broadcast transport unreachable after {} reconnect attempts: {err}",
                    self.policy.max_attempts
                );
                error!(prefix = %self.prefix, %reason, "broadcast listener giving up");
                events.emit_local(JobEvent::TransportDegraded { reason });
                return;
            }

            let delay = self.policy.delay_for_attempt(failures);
            warn!(
                prefix = %self.prefix,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "broadcast listener disconnected, reconnecting"
            );
            sleep_unless_stopped(delay, stop);
        }

        info!(prefix = %self.prefix, "broadcast listener stopped");
    }

    /// One connection's lifetime. `Ok` means a stop was requested.
    fn session(
        &self,
        events: &EventChannel,
        stop: &AtomicBool,
        failures: &mut u32,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_connection()?;
        conn.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut pubsub = conn.as_pubsub();
        for topic in Topic::ALL {
            pubsub.subscribe(topic.channel(&self.prefix))?;
        }
        *failures = 0;
        info!(prefix = %self.prefix, "broadcast listener subscribed");

        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let msg = match pubsub.get_message() {
                Ok(msg) => msg,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            };

            let Some(topic) = Topic::from_channel(&self.prefix, msg.get_channel_name()) else {
                continue;
            };
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "non-text broadcast payload");
                    continue;
                }
            };
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => events.emit_local(JobEvent::Remote { topic, job }),
                Err(e) => debug!(topic = %topic, error = %e, "undecodable broadcast payload"),
            }
        }
    }
}

fn sleep_unless_stopped(delay: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

/// Handle to a running [`RedisBroadcastListener`].
#[derive(Debug)]
pub struct ListenerHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("broadcast listener thread panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}
