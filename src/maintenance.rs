//! Periodic maintenance tasks for the filter chain.
//!
//! The offender cache needs a periodic eviction sweep and, when configured,
//! a periodic offender-list log line. Both run as plain tokio interval loops
//! held by a [`MaintenanceHandle`]; dropping or shutting down the handle
//! stops them. Reconfiguration is shutdown-then-spawn against a freshly
//! built processor, never in-place.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::processor::SpamProcessor;

/// How often the offender cache eviction sweep runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle over the spawned maintenance tasks. Aborts them on drop.
#[derive(Debug)]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Spawn maintenance for `processor` on the current tokio runtime.
    ///
    /// A chain without an offender cache needs no upkeep; the returned
    /// handle is then empty and shutdown is a no-op.
    pub fn spawn(processor: Arc<SpamProcessor>) -> Self {
        let mut tasks = Vec::new();

        if let Some(cache) = processor.offender_cache() {
            let cleanup_cache = Arc::clone(cache);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
                // The first tick fires immediately; skip it, there is
                // nothing to evict yet.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    cleanup_cache.clean_up();
                }
            }));

            let log_cache = Arc::clone(cache);
            let frequency = log_cache.config().print_frequency();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(frequency);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    log_cache.log_spammers();
                }
            }));
        }

        debug!(tasks = tasks.len(), "spam filter maintenance started");
        Self { tasks }
    }

    /// Stop all maintenance tasks.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
