//! Standalone worker process: connects to Redis, recovers orphaned jobs and
//! runs handlers until Ctrl-C.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use taskforge_events::JobEvent;
use taskforge_infra::config::QueueConfig;
use taskforge_infra::event_bus::{RedisBroadcastListener, RedisBroadcaster};
use taskforge_infra::jobs::{JobQueue, JobResult, RedisJobStore};

fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = QueueConfig::from_env().context("invalid queue configuration")?;
    let store = RedisJobStore::new(&config.redis_url, &config.key_prefix)
        .context("failed to open job store")?;
    store.ping().context("job store unreachable")?;

    let broadcaster = RedisBroadcaster::new(&config.redis_url, config.key_prefix.clone())
        .context("failed to open broadcaster")?;
    let listener = RedisBroadcastListener::new(
        &config.redis_url,
        config.key_prefix.clone(),
        config.reconnect.clone(),
    )
    .context("failed to open broadcast listener")?;

    let queue = JobQueue::with_broadcaster(store, config, Arc::new(broadcaster));
    register_builtin_handlers(&queue);

    let listener = listener
        .spawn(queue.events())
        .context("failed to spawn broadcast listener")?;
    let events = queue.subscribe();

    let report = queue.start().context("failed to start queue")?;
    tracing::info!(
        requeued = report.requeued.len(),
        released = report.released.len(),
        "worker started"
    );

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    loop {
        if stop_rx.recv_timeout(Duration::from_millis(200)).is_ok() {
            break;
        }
        for event in events.drain() {
            if let JobEvent::TransportDegraded { reason } = event {
                tracing::warn!(%reason, "cross-process notifications unavailable");
            }
        }
    }

    tracing::info!("shutting down");
    let drained = queue.close().context("failed to close queue")?;
    listener.stop();
    if !drained {
        tracing::warn!("some handlers were still running at shutdown");
    }
    Ok(())
}

/// Demo handlers so a fresh deployment can be smoke-tested end to end.
fn register_builtin_handlers(queue: &JobQueue<RedisJobStore>) {
    queue.register_handler("echo", |job, _| JobResult::Success(job.payload.clone()));

    // `{"ms": 1000}`: sleeps in ten steps, reporting progress and honouring
    // cancellation between steps.
    queue.register_handler("sleep", |job, ctx| {
        let total = job.payload["ms"].as_u64().unwrap_or(1_000);
        for step in 1..=10u8 {
            if ctx.is_cancelled() {
                return JobResult::failure("cancelled");
            }
            std::thread::sleep(Duration::from_millis(total / 10));
            ctx.report_progress(step * 10);
        }
        JobResult::Success(json!({ "sleptMs": total }))
    });
}
