//! Tracing and logging setup shared by taskforge binaries.

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LogFormat;
