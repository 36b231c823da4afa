//! Access guard consulted before submission and cancellation.
//!
//! Authorization itself lives outside the queue; this is the seam it plugs
//! into.

use serde::Serialize;

use taskforge_core::{JobId, Priority};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GuardedAction<'a> {
    Submit { job_type: &'a str, priority: Priority },
    Cancel { job_id: JobId },
}

pub trait AccessGuard: Send + Sync {
    /// `Err(reason)` refuses the action.
    fn check(&self, action: &GuardedAction<'_>) -> Result<(), String>;
}

/// Lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGuard for AllowAll {
    fn check(&self, _action: &GuardedAction<'_>) -> Result<(), String> {
        Ok(())
    }
}

impl<F> AccessGuard for F
where
    F: Fn(&GuardedAction<'_>) -> Result<(), String> + Send + Sync,
{
    fn check(&self, action: &GuardedAction<'_>) -> Result<(), String> {
        self(action)
    }
}
