//! Infrastructure event transports.
//!
//! The event channel itself lives in `taskforge-events` as pure mechanics.
//! This module provides the cross-process broadcast transport (Redis).

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{ListenerHandle, RedisBroadcastListener, RedisBroadcaster};
