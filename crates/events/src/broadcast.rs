//! Event channel: local fan-out plus an optional cross-process broadcaster.

use std::sync::Arc;

use taskforge_core::Job;
use thiserror::Error;

use crate::bus::{EventBus, Subscription};
use crate::in_memory_bus::InMemoryEventBus;
use crate::lifecycle::{JobEvent, Topic};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast transport error: {0}")]
    Transport(String),
    #[error("broadcast serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cross-process publisher of lifecycle topics.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, topic: Topic, job: &Job) -> Result<(), BroadcastError>;
}

impl<B: Broadcaster + ?Sized> Broadcaster for Arc<B> {
    fn broadcast(&self, topic: Topic, job: &Job) -> Result<(), BroadcastError> {
        (**self).broadcast(topic, job)
    }
}

/// The queue's event channel.
///
/// Every event goes to local subscribers; events with a [`Topic`] are also
/// handed to the broadcaster. Broadcast failures are logged and swallowed:
/// job state never depends on a notification being delivered.
pub struct EventChannel {
    local: InMemoryEventBus<JobEvent>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            local: InMemoryEventBus::new(),
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn emit(&self, event: JobEvent) {
        if let (Some(broadcaster), Some(topic)) = (&self.broadcaster, event.topic()) {
            if let Some(job) = event.job() {
                if let Err(e) = broadcaster.broadcast(topic, job) {
                    tracing::warn!(
                        topic = %topic,
                        job_id = %job.id,
                        error = %e,
                        "lifecycle broadcast failed"
                    );
                }
            }
        }

        if let Err(e) = self.local.publish(event) {
            tracing::debug!(error = ?e, "local event dropped");
        }
    }

    /// Emit to local subscribers only (used for events that arrived over the
    /// broadcast transport).
    pub fn emit_local(&self, event: JobEvent) {
        if let Err(e) = self.local.publish(event) {
            tracing::debug!(error = ?e, "local event dropped");
        }
    }

    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.local.subscribe()
    }

    /// Unsubscribe everybody. Pending `wait_for_job` calls observe the
    /// disconnect and return.
    pub fn close(&self) {
        self.local.close();
    }

    pub fn is_closed(&self) -> bool {
        self.local.is_closed()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.local.subscriber_count())
            .field("broadcast", &self.broadcaster.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(Topic, String)>>,
        fail: bool,
    }

    impl Broadcaster for Recording {
        fn broadcast(&self, topic: Topic, job: &Job) -> Result<(), BroadcastError> {
            if self.fail {
                return Err(BroadcastError::Transport("down".into()));
            }
            self.sent.lock().unwrap().push((topic, job.job_type.clone()));
            Ok(())
        }
    }

    #[test]
    fn lifecycle_topics_reach_broadcaster() {
        let recording = Arc::new(Recording::default());
        let channel = EventChannel::new().with_broadcaster(recording.clone());
        let sub = channel.subscribe();
        let job = Job::new("mail.send", json!({}), 1);

        channel.emit(JobEvent::Added { job: job.clone() });
        channel.emit(JobEvent::Started { job });

        assert_eq!(sub.drain().len(), 2);
        assert_eq!(
            *recording.sent.lock().unwrap(),
            vec![(Topic::Added, "mail.send".to_string())]
        );
    }

    #[test]
    fn broadcast_failure_still_delivers_locally() {
        let channel = EventChannel::new().with_broadcaster(Arc::new(Recording {
            fail: true,
            ..Default::default()
        }));
        let sub = channel.subscribe();

        channel.emit(JobEvent::Added {
            job: Job::new("t", json!(null), 0),
        });

        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn close_ends_subscriptions() {
        let channel = EventChannel::new();
        let sub = channel.subscribe();
        channel.close();
        assert!(sub.recv().is_err());
        assert!(channel.is_closed());
    }
}
