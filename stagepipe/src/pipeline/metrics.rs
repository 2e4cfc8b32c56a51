use crate::pipeline::{ExecutionMode, Statefulness};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-stage counters, shared between a runner and the pipeline.
#[derive(Debug, Default)]
pub struct StageMetricsStorage {
    items_in: AtomicU64,
    items_out: AtomicU64,
    failures: AtomicU64,
    outstanding: AtomicU64,
    peak_outstanding: AtomicU64,
}

pub type SharedStageMetrics = Arc<StageMetricsStorage>;

impl StageMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an item (or batch) handed to the stage's executor.
    pub fn record_submitted(&self) {
        self.items_in.fetch_add(1, Ordering::Relaxed);
        let now = self.outstanding.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_outstanding.fetch_max(now, Ordering::Relaxed);
    }

    /// Record a result leaving the stage.
    pub fn record_completed(&self, failed: bool) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.items_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forget outstanding work whose results will never be consumed.
    pub fn record_discarded(&self, count: usize) {
        self.outstanding.fetch_sub(count as u64, Ordering::Relaxed);
    }

    pub fn items_in(&self) -> u64 {
        self.items_in.load(Ordering::Relaxed)
    }

    pub fn items_out(&self) -> u64 {
        self.items_out.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn peak_outstanding(&self) -> u64 {
        self.peak_outstanding.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub index: usize,
    pub name: String,
    pub statefulness: Statefulness,
    pub execution: ExecutionMode,
    pub feed_batch_size: usize,
    pub items_in: u64,
    pub items_out: u64,
    pub failures: u64,
    /// Work still submitted but not drained when the snapshot was taken.
    pub outstanding: u64,
    pub peak_outstanding: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub pool_size: usize,
    pub dedicated_workers: usize,
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn stage(&self, name: &str) -> Option<&StageMetrics> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}
