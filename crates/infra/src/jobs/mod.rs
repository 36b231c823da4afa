//! Durable priority job queue with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are ordered by priority class, then by visibility time
//! - Claiming is a single atomic lane-to-in-flight move in the store
//! - Retry policy with exponential backoff; retries stay invisible until due
//! - Dead-letter lane for jobs that exhausted their retries
//! - In-flight membership doubles as the crash-recovery lease
//!
//! ## Components
//!
//! - `JobStore`: records, Priority Lane, In-Flight Set, terminal lanes, stats
//!   (in-memory, or Redis behind the `redis` feature)
//! - `HandlerRegistry`: job type → handler
//! - `Dispatcher`: claims work and drives completion / failure
//! - `recovery::sweep`: startup reconciliation of orphaned in-flight jobs
//! - `JobQueue`: the service callers construct and talk to

pub mod dispatcher;
pub mod guard;
pub mod queue;
pub mod recovery;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod registry;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherHandle, TickReport};
pub use guard::{AccessGuard, AllowAll, GuardedAction};
pub use queue::{JobQueue, QueueStats};
pub use recovery::{RecoveryReport, sweep};
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use registry::{HandlerRegistry, JobContext, JobHandler, JobResult, ProgressSink};
pub use store::{
    Counters, InMemoryJobStore, JobFilter, JobStore, JobStoreError, StatCounter, TerminalLane,
};
