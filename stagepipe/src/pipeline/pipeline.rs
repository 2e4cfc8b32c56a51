//! Pipeline orchestrator.
//!
//! Owns the stage list, sizes the shared pool, wires one runner per stage on
//! the first pull, and releases every worker on close.

use super::metrics::{PipelineMetrics, SharedStageMetrics, StageMetrics, StageMetricsStorage};
use super::pool::{SharedPool, panic_message};
use super::stage::{ExclusiveFn, ExecutionMode, StageDescriptor, StagePlan, Transform};
use super::stateful::StatefulWorker;
use super::stateless::StatelessRunner;
use super::{Item, ResultBatches};
use crate::errors::{StagepipeError, StagepipeResult};
use crate::options::PipelineOptions;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

type ItemSource = Box<dyn Iterator<Item = Item> + Send>;
type ItemStream = Box<dyn Iterator<Item = StagepipeResult<Item>> + Send>;

/// Observable lifecycle of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Constructed, no input bound yet.
    Unconstructed,
    /// Input bound, no worker started yet.
    Bound,
    /// Workers started (also after the first error, until closed).
    Running,
    Closed,
}

enum Phase {
    Unconstructed,
    Bound(ItemSource),
    Running(ItemStream),
    /// Stopped yielding after an error; resources stay up until close.
    Failed,
    Closed,
}

struct StageSlot {
    name: String,
    plan: StagePlan,
    transform: Option<Transform>,
    metrics: SharedStageMetrics,
}

/// A lazily started, order-preserving chain of stages.
///
/// No thread exists until the first call to [`next`](Iterator::next). The
/// pipeline is single-consumer and can run one input to completion; after
/// that it only reports metrics.
pub struct Pipeline {
    stages: Vec<StageSlot>,
    options: PipelineOptions,
    pool_size: usize,
    dedicated_workers: usize,
    phase: Phase,
    pool: Option<SharedPool>,
    workers: Vec<StatefulWorker>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("state", &self.state())
            .field("pool_size", &self.pool_size)
            .field("dedicated_workers", &self.dedicated_workers)
            .finish()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<StageDescriptor>) -> StagepipeResult<Self> {
        Self::with_options(stages, PipelineOptions::default())
    }

    /// Validate every stage and compute pool sizing. Nothing is started here.
    pub fn with_options(
        stages: Vec<StageDescriptor>,
        options: PipelineOptions,
    ) -> StagepipeResult<Self> {
        options.sanitize()?;

        let mut slots = Vec::with_capacity(stages.len());
        for stage in stages {
            let plan = stage.plan()?;
            let (name, transform) = stage.into_parts();
            slots.push(StageSlot {
                name,
                plan,
                transform: Some(transform),
                metrics: Arc::new(StageMetricsStorage::new()),
            });
        }

        let dedicated_workers = slots
            .iter()
            .filter(|slot| slot.plan.mode == ExecutionMode::DedicatedWorker)
            .count();
        let pool_size = options.shared_pool_size(dedicated_workers);

        tracing::debug!(
            stages = slots.len(),
            pool_size,
            dedicated_workers,
            "Pipeline constructed"
        );

        Ok(Self {
            stages: slots,
            options,
            pool_size,
            dedicated_workers,
            phase: Phase::Unconstructed,
            pool: None,
            workers: Vec::new(),
            started_at: None,
            finished_at: None,
        })
    }

    /// Bind the input to process. Rebinding is allowed until the first pull.
    pub fn apply<I>(&mut self, input: I) -> StagepipeResult<&mut Self>
    where
        I: IntoIterator<Item = Item>,
        I::IntoIter: Send + 'static,
    {
        match self.phase {
            Phase::Unconstructed | Phase::Bound(_) => {
                self.phase = Phase::Bound(Box::new(input.into_iter()));
                Ok(self)
            }
            _ => Err(StagepipeError::InvalidState(format!(
                "cannot bind input to a pipeline that is {:?}",
                self.state()
            ))),
        }
    }

    /// Build a pipeline, run `f` over its outputs for `input`, and close it
    /// whether `f` returns or unwinds.
    pub fn scoped<I, F, R>(
        stages: Vec<StageDescriptor>,
        options: PipelineOptions,
        input: I,
        f: F,
    ) -> StagepipeResult<R>
    where
        I: IntoIterator<Item = Item>,
        I::IntoIter: Send + 'static,
        F: FnOnce(&mut Pipeline) -> R,
    {
        let mut pipeline = Self::with_options(stages, options)?;
        pipeline.apply(input)?;
        let result = f(&mut pipeline);
        if !pipeline.close(None) {
            tracing::warn!("Pipeline did not shut down cleanly");
        }
        Ok(result)
    }

    pub fn state(&self) -> PipelineState {
        match self.phase {
            Phase::Unconstructed => PipelineState::Unconstructed,
            Phase::Bound(_) => PipelineState::Bound,
            Phase::Running(_) | Phase::Failed => PipelineState::Running,
            Phase::Closed => PipelineState::Closed,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn dedicated_worker_count(&self) -> usize {
        self.dedicated_workers
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let total_duration_ms = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start).as_millis(),
            (Some(start), None) => start.elapsed().as_millis(),
            _ => 0,
        };

        PipelineMetrics {
            pool_size: self.pool_size,
            dedicated_workers: self.dedicated_workers,
            total_duration_ms,
            stages: self
                .stages
                .iter()
                .enumerate()
                .map(|(index, slot)| StageMetrics {
                    index,
                    name: slot.name.clone(),
                    statefulness: slot.plan.statefulness,
                    execution: slot.plan.mode,
                    feed_batch_size: slot.plan.feed_batch_size,
                    items_in: slot.metrics.items_in(),
                    items_out: slot.metrics.items_out(),
                    failures: slot.metrics.failures(),
                    outstanding: slot.metrics.outstanding(),
                    peak_outstanding: slot.metrics.peak_outstanding(),
                })
                .collect(),
        }
    }

    /// Release every worker: stateful workers first, then the shared pool.
    ///
    /// Returns false if anything was still running when `timeout` expired.
    /// Closing an already closed pipeline is a no-op returning true.
    pub fn close(&mut self, timeout: Option<Duration>) -> bool {
        if matches!(self.phase, Phase::Closed) {
            return true;
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        // Dropping the runner chain releases its channel ends and pending handles.
        self.phase = Phase::Closed;

        let mut clean = true;
        for worker in &mut self.workers {
            clean &= worker.shutdown(deadline);
        }
        if let Some(pool) = &self.pool {
            clean &= pool.shutdown(deadline);
        }

        if self.started_at.is_some() {
            self.finished_at = Some(Instant::now());
        }
        tracing::debug!(clean, "Pipeline closed");
        clean
    }

    /// Start workers and compose one runner per stage over `source`.
    fn start(&mut self, source: ItemSource) -> StagepipeResult<ItemStream> {
        self.started_at = Some(Instant::now());

        let needs_pool = self
            .stages
            .iter()
            .any(|slot| slot.plan.mode == ExecutionMode::SharedPool);
        if needs_pool {
            self.pool = Some(SharedPool::new(self.pool_size, &self.options.thread_name)?);
        }

        let mut stream: ItemStream = Box::new(source.map(Ok));
        for slot in &mut self.stages {
            let transform = slot.transform.take().ok_or_else(|| {
                StagepipeError::InvalidState(format!("stage '{}' was already started", slot.name))
            })?;
            let plan = slot.plan;

            if let Some(n) = plan.statefulness.batch_size() {
                stream = Box::new(ResultBatches::new(n, stream));
            }

            stream = match plan.mode {
                ExecutionMode::Master => Box::new(InlineRunner {
                    stage: slot.name.clone(),
                    upstream: stream,
                    transform: transform.into_exclusive(),
                    metrics: Arc::clone(&slot.metrics),
                }),
                ExecutionMode::SharedPool => {
                    let Transform::Shared(transform) = transform else {
                        return Err(StagepipeError::InvalidPolicy(format!(
                            "stage '{}' owns mutable state and cannot run on the shared pool",
                            slot.name
                        )));
                    };
                    let pool = self.pool.clone().ok_or_else(|| {
                        StagepipeError::Internal("shared pool was not started".into())
                    })?;
                    Box::new(StatelessRunner::new(
                        slot.name.clone(),
                        stream,
                        pool,
                        transform,
                        plan.feed_batch_size,
                        Arc::clone(&slot.metrics),
                    ))
                }
                ExecutionMode::DedicatedWorker => {
                    let worker = StatefulWorker::spawn(
                        slot.name.clone(),
                        transform.into_exclusive(),
                        plan.feed_batch_size,
                        &self.options.thread_name,
                    )?;
                    let runner = worker.runner(stream, Arc::clone(&slot.metrics));
                    self.workers.push(worker);
                    Box::new(runner)
                }
            };

            tracing::debug!(
                stage = %slot.name,
                mode = ?plan.mode,
                statefulness = ?plan.statefulness,
                feed_batch_size = plan.feed_batch_size,
                "Stage wired"
            );
        }

        Ok(stream)
    }
}

impl Iterator for Pipeline {
    type Item = StagepipeResult<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.phase, Phase::Failed) {
            Phase::Unconstructed => {
                self.phase = Phase::Unconstructed;
                Some(Err(StagepipeError::InvalidState(
                    "no input bound; call apply() first".into(),
                )))
            }
            Phase::Bound(source) => match self.start(source) {
                Ok(stream) => {
                    self.phase = Phase::Running(stream);
                    self.next()
                }
                Err(e) => Some(Err(e)),
            },
            Phase::Running(mut stream) => match stream.next() {
                Some(Ok(item)) => {
                    self.phase = Phase::Running(stream);
                    Some(Ok(item))
                }
                // The first error ends iteration; close stays with the caller.
                Some(Err(e)) => Some(Err(e)),
                None => {
                    drop(stream);
                    if !self.close(None) {
                        tracing::warn!("Pipeline did not shut down cleanly after its input ended");
                    }
                    None
                }
            },
            Phase::Failed => None,
            Phase::Closed => {
                self.phase = Phase::Closed;
                None
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !matches!(self.phase, Phase::Closed) {
            self.close(None);
        }
    }
}

/// Runs a transform on the consuming thread, item by item.
struct InlineRunner {
    stage: String,
    upstream: ItemStream,
    transform: ExclusiveFn,
    metrics: SharedStageMetrics,
}

impl Iterator for InlineRunner {
    type Item = StagepipeResult<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.upstream.next()? {
            Ok(item) => item,
            Err(e) => return Some(Err(e)),
        };

        self.metrics.record_submitted();
        let transform = &mut self.transform;
        let result = catch_unwind(AssertUnwindSafe(|| transform(item)))
            .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(&*panic))))
            .map_err(|e| StagepipeError::stage(&self.stage, e));
        self.metrics.record_completed(result.is_err());
        Some(result)
    }
}
