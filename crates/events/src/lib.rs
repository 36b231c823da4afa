//! `taskforge-events`: lifecycle events and the event channel.

pub mod broadcast;
pub mod bus;
pub mod in_memory_bus;
pub mod lifecycle;

pub use broadcast::{BroadcastError, Broadcaster, EventChannel};
pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{JobEvent, Topic};
