//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the in-process half of the event channel: lifecycle events are
//! fanned out to every subscriber (dispatcher observers, `wait_for_job`
//! callers, progress listeners).
//!
//! - **Transport-agnostic**: the trait says nothing about how messages move.
//! - **Best-effort**: a missed event never corrupts job state, because state is
//!   always re-derivable from the job record store.
//! - **No persistence**: the bus is for distribution, not storage.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every event published after it was
/// created (broadcast semantics). Dropping the subscription unsubscribes; the
/// bus prunes the dead sender on its next publish.
///
/// ```ignore
/// let subscription = channel.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(50)) {
///         Ok(event) => handle(event),
///         Err(RecvTimeoutError::Timeout) => continue,     // check deadline
///         Err(RecvTimeoutError::Disconnected) => break,   // bus closed
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Pub/sub abstraction.
///
/// `publish()` can fail (closed bus, poisoned lock); callers on the job
/// lifecycle path log the failure and carry on.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
