//! In-memory event bus.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
    #[error("event bus closed")]
    Closed,
}

#[derive(Debug)]
struct Subscribers<M> {
    senders: Vec<mpsc::Sender<M>>,
    closed: bool,
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out
/// - `close()` disconnects every subscriber; later subscriptions are born closed
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Subscribers<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every subscriber so blocked receivers observe `Disconnected`.
    pub fn close(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.closed = true;
            subs.senders.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().map(|s| s.closed).unwrap_or(true)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.senders.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;
        if subs.closed {
            return Err(InMemoryBusError::Closed);
        }

        // Drop any dead subscribers while publishing.
        subs.senders.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned or closed bus hands out a subscription whose sender is
        // already gone.
        if let Ok(mut subs) = self.subscribers.lock() {
            if !subs.closed {
                subs.senders.push(tx);
            }
        }

        Subscription::new(rx)
    }
}
