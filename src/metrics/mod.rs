// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Metrics collected by the engine core. Handshake/H3/bandwidth metrics
//! from the original crate this was lifted from are out of scope here
//! (those live with the connection state machine, an external
//! collaborator); this module only covers what the scheduler itself can
//! observe: connection population, ingress accept/drop, egress batch
//! shape, and send backpressure.

pub mod labels;
pub mod tokio_task;

use foundations::telemetry::metrics::metrics;
use foundations::telemetry::metrics::Counter;
use foundations::telemetry::metrics::Gauge;
use foundations::telemetry::metrics::Histogram;
use foundations::telemetry::metrics::HistogramBuilder;
use foundations::telemetry::metrics::TimeHistogram;
use std::sync::Arc;

/// Trait to direct the metrics emitted by the crate to a Prometheus registry.
pub trait Metrics: Send + Sync + Clone + Unpin + 'static {
    /// Number of connections currently held in the arena.
    fn connections_in_memory(&self) -> Gauge;

    /// Number of connections destroyed (all membership bits cleared).
    fn connections_destroyed(&self) -> Counter;

    /// Number of ingress datagrams delivered to a live connection.
    fn ingress_accepted_count(&self) -> Counter;

    /// Number of ingress datagrams dropped, by reason.
    fn ingress_dropped_count(&self, reason: labels::IngressDropReason) -> Counter;

    /// Number of UDP packets dropped at the socket layer before even
    /// reaching `packet_in` (host-reported).
    fn udp_drop_count(&self) -> Counter;

    /// Number of egress write errors or partial writes, by reason.
    fn write_errors(&self, reason: labels::SendFailureReason) -> Counter;

    /// Distribution of egress batch sizes actually flushed.
    fn batch_size(&self) -> Histogram;

    /// Number of times send backpressure (`!CAN_SEND`) was entered.
    fn backpressure_activations(&self) -> Counter;

    // ==== tokio runtime metrics (ambient, `tokio-driver` feature) ====

    /// Histogram of task schedule delays.
    fn tokio_runtime_task_schedule_delay_histogram(
        &self, task: &Arc<str>,
    ) -> TimeHistogram;

    /// Histogram of task poll durations.
    fn tokio_runtime_task_poll_duration_histogram(
        &self, task: &Arc<str>,
    ) -> TimeHistogram;

    /// Total poll time accumulated by a task, in microseconds.
    fn tokio_runtime_task_total_poll_time_micros(&self, task: &Arc<str>) -> Counter;
}

/// Standard implementation of [`Metrics`] using
/// [`foundations::telemetry::metrics`].
#[derive(Default, Clone)]
pub struct DefaultMetrics;

impl Metrics for DefaultMetrics {
    fn connections_in_memory(&self) -> Gauge {
        quic::connections_in_memory()
    }

    fn connections_destroyed(&self) -> Counter {
        quic::connections_destroyed()
    }

    fn ingress_accepted_count(&self) -> Counter {
        quic::ingress_accepted_count()
    }

    fn ingress_dropped_count(&self, reason: labels::IngressDropReason) -> Counter {
        quic::ingress_dropped_count(reason)
    }

    fn udp_drop_count(&self) -> Counter {
        quic::udp_drop_count()
    }

    fn write_errors(&self, reason: labels::SendFailureReason) -> Counter {
        quic::write_errors(reason)
    }

    fn batch_size(&self) -> Histogram {
        quic::batch_size()
    }

    fn backpressure_activations(&self) -> Counter {
        quic::backpressure_activations()
    }

    fn tokio_runtime_task_schedule_delay_histogram(
        &self, task: &Arc<str>,
    ) -> TimeHistogram {
        tokio::runtime_task_schedule_delay_histogram(task)
    }

    fn tokio_runtime_task_poll_duration_histogram(
        &self, task: &Arc<str>,
    ) -> TimeHistogram {
        tokio::runtime_task_poll_duration_histogram(task)
    }

    fn tokio_runtime_task_total_poll_time_micros(&self, task: &Arc<str>) -> Counter {
        tokio::runtime_task_total_poll_time_micros(task)
    }
}

#[metrics]
pub(crate) mod quic {
    /// Number of connections currently held in the arena.
    pub fn connections_in_memory() -> Gauge;

    /// Number of connections destroyed.
    pub fn connections_destroyed() -> Counter;

    /// Number of ingress datagrams delivered to a live connection.
    pub fn ingress_accepted_count() -> Counter;

    /// Number of ingress datagrams dropped, by reason.
    pub fn ingress_dropped_count(reason: labels::IngressDropReason) -> Counter;

    /// Number of UDP packets dropped at the socket layer.
    pub fn udp_drop_count() -> Counter;

    /// Number of egress write errors or partial writes, by reason.
    pub fn write_errors(reason: labels::SendFailureReason) -> Counter;

    /// Distribution of egress batch sizes actually flushed.
    #[ctor = HistogramBuilder { buckets: &[1.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0], }]
    pub fn batch_size() -> Histogram;

    /// Number of times send backpressure was entered.
    pub fn backpressure_activations() -> Counter;
}

#[metrics]
mod tokio {
    /// Histogram of task schedule delays.
    #[ctor = HistogramBuilder { buckets: &[0.0, 1E-4, 2E-4, 3E-4, 4E-4, 5E-4, 6E-4, 7E-4, 8E-4, 9E-4, 1E-3, 1E-2, 2E-2, 4E-2, 8E-2, 1E-1, 1.0], }]
    pub fn runtime_task_schedule_delay_histogram(
        task: &Arc<str>,
    ) -> TimeHistogram;

    /// Histogram of task poll durations.
    #[ctor = HistogramBuilder { buckets: &[0.0, 1E-4, 2E-4, 3E-4, 4E-4, 5E-4, 6E-4, 7E-4, 8E-4, 9E-4, 1E-3, 1E-2, 2E-2, 4E-2, 8E-2, 1E-1, 1.0], }]
    pub fn runtime_task_poll_duration_histogram(task: &Arc<str>)
        -> TimeHistogram;

    /// Total poll time accumulated by a task, in microseconds.
    pub fn runtime_task_total_poll_time_micros(task: &Arc<str>) -> Counter;
}
