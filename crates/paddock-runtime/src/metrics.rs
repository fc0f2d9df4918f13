//! Periodic metrics reporting.
//!
//! Metrics are computed on demand by the engine; a [`MetricsSink`]
//! decides where a round of them goes. The default sink turns each
//! snapshot into a structured `tracing` event.

use std::sync::{Arc, Mutex, PoisonError};

use paddock_common::metrics::{Capacity, Metrics};
use paddock_common::types::{ContainerHandle, Properties};

use crate::engine::Engine;

/// Consumer of metrics snapshots.
pub trait MetricsSink: Send + Sync {
    /// Receives the metrics of one container.
    fn report_container(&self, handle: &ContainerHandle, metrics: &Metrics);

    /// Receives the server-wide capacity snapshot.
    fn report_capacity(&self, capacity: &Capacity);
}

/// Emits every snapshot as an `info` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn report_container(&self, handle: &ContainerHandle, metrics: &Metrics) {
        tracing::info!(
            %handle,
            memory_usage = metrics.memory.usage_in_bytes,
            memory_limit = metrics.memory.limit_in_bytes,
            oom_kills = metrics.memory.oom_kills,
            disk_exclusive = metrics.disk.exclusive_bytes_used,
            disk_total = metrics.disk.total_bytes_used,
            processes = metrics.process_count,
            "container metrics"
        );
    }

    fn report_capacity(&self, capacity: &Capacity) {
        tracing::info!(
            memory = capacity.memory_in_bytes,
            disk = capacity.disk_in_bytes,
            max_containers = capacity.max_containers,
            live_workers = capacity.diagnostics.live_workers,
            threads = capacity.diagnostics.threads,
            "server capacity"
        );
    }
}

/// Keeps every snapshot in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    containers: Arc<Mutex<Vec<(ContainerHandle, Metrics)>>>,
    capacity: Arc<Mutex<Vec<Capacity>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Container snapshots received so far.
    #[must_use]
    pub fn containers(&self) -> Vec<(ContainerHandle, Metrics)> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Capacity snapshots received so far.
    #[must_use]
    pub fn capacity(&self) -> Vec<Capacity> {
        self.capacity.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl MetricsSink for MemorySink {
    fn report_container(&self, handle: &ContainerHandle, metrics: &Metrics) {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle.clone(), metrics.clone()));
    }

    fn report_capacity(&self, capacity: &Capacity) {
        self.capacity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(capacity.clone());
    }
}

/// Sends one round of metrics: every live container, then capacity.
/// Containers destroyed mid-round are skipped.
pub async fn report(engine: &Engine, sink: &dyn MetricsSink) {
    for handle in engine.containers(&Properties::new()).await {
        match engine.metrics(&handle).await {
            Ok(metrics) => sink.report_container(&handle, &metrics),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(%handle, error = %e, "metrics unavailable"),
        }
    }
    sink.report_capacity(&engine.capacity());
}
