//! Small helper for recording per-task tokio runtime metrics around the
//! optional [`crate::driver`] event loop. Kept separate from `mod.rs` since
//! it only matters to the `tokio-driver` feature's task, not the
//! synchronous engine core.

use std::sync::Arc;
use std::time::Instant;

use super::Metrics;

/// Wraps a named task with start/stop timestamps so its poll time can be
/// recorded against the `tokio` metrics block regardless of which
/// `Metrics` implementation the host supplied.
pub struct TaskTiming {
    name: Arc<str>,
    started: Instant,
}

impl TaskTiming {
    pub fn start(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into(), started: Instant::now() }
    }

    /// Records total poll time elapsed since `start`, in microseconds.
    pub fn finish(self, metrics: &impl Metrics) {
        let micros = self.started.elapsed().as_micros() as u64;
        metrics
            .tokio_runtime_task_total_poll_time_micros(&self.name)
            .inc_by(micros);
    }
}
