//! `taskforge-core`: job model building blocks.
//!
//! This crate contains the **pure** job model (no infrastructure concerns):
//! identifiers, the job state machine, priority scoring and retry policy.

pub mod error;
pub mod id;
pub mod job;
pub mod priority;
pub mod retry;

pub use error::{QueueError, QueueResult};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobOptions, JobStatus, RetryInfo};
pub use priority::{BAND_WIDTH, LaneScore, Priority};
pub use retry::RetryPolicy;
