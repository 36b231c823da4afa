//! Handler registry and the handler-side job context.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use taskforge_core::{Job, JobId};

/// Outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Stored as the job's `result`.
    Success(serde_json::Value),
    /// Goes through the retry / dead-letter path.
    Failure(String),
}

impl JobResult {
    pub fn success() -> Self {
        JobResult::Success(serde_json::Value::Null)
    }

    pub fn failure(error: impl Into<String>) -> Self {
        JobResult::Failure(error.into())
    }
}

impl<E: std::fmt::Display> From<Result<serde_json::Value, E>> for JobResult {
    fn from(result: Result<serde_json::Value, E>) -> Self {
        match result {
            Ok(value) => JobResult::Success(value),
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

/// Receives progress reports on behalf of a running job.
pub trait ProgressSink: Send + Sync {
    fn report(&self, job_id: JobId, progress: u8);
}

struct Discard;

impl ProgressSink for Discard {
    fn report(&self, _job_id: JobId, _progress: u8) {}
}

/// What a handler sees besides the job itself.
///
/// Cancellation is cooperative: `cancel_job` flips the token, and a handler
/// that wants to stop early polls [`JobContext::is_cancelled`]. Whatever the
/// handler returns after that is discarded.
pub struct JobContext {
    job_id: JobId,
    cancelled: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
    last_progress: AtomicU8,
}

impl JobContext {
    pub fn new(job_id: JobId, cancelled: Arc<AtomicBool>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            job_id,
            cancelled,
            sink,
            last_progress: AtomicU8::new(0),
        }
    }

    /// Context with no sink and a fresh token, for calling handlers directly.
    pub fn detached(job_id: JobId) -> Self {
        Self::new(job_id, Arc::new(AtomicBool::new(false)), Arc::new(Discard))
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report progress (clamped to 100). Reports that do not move forward are
    /// dropped here, before they reach the store.
    pub fn report_progress(&self, progress: u8) {
        let progress = progress.min(100);
        let previous = self.last_progress.fetch_max(progress, Ordering::AcqRel);
        if progress > previous {
            self.sink.report(self.job_id, progress);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&Job, &JobContext) -> JobResult + Send + Sync>;

/// Maps job types to handlers.
///
/// Lookup order: exact type, then the longest matching `prefix.*` pattern,
/// then `*`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `pattern`.
    pub fn register<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job, &JobContext) -> JobResult + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.into(), Arc::new(handler));
    }

    pub fn resolve(&self, job_type: &str) -> Option<JobHandler> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(h) = handlers.get(job_type) {
            return Some(h.clone());
        }

        // Category match (e.g. "report.*" matches "report.monthly").
        let category = handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());
        if category.is_some() {
            return category;
        }

        handlers.get("*").cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HandlerRegistry")
            .field("patterns", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Run `handler`, turning a panic into [`JobResult::Failure`].
pub fn invoke(handler: &JobHandler, job: &Job, ctx: &JobContext) -> JobResult {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(job, ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            JobResult::Failure(format!("handler panicked: {msg}"))
        }
    }
}
