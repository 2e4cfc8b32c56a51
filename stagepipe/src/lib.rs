//! stagepipe: batched, multi-stage parallel pipelines.
//!
//! A pipeline chains unary stage transforms over a lazy input. Each stage
//! declares its statefulness, and the pipeline picks an executor for it:
//! a pool shared by all stateless stages, one dedicated worker per stateful
//! stage, or inline execution on the consuming thread. Output order always
//! equals input order.
//!
//! Start from [`Pipeline`] and [`StageDescriptor`]; [`SequentialExecutor`]
//! computes the same result eagerly on one thread.

pub mod errors;
pub mod options;
pub mod pipeline;
pub mod stream;

pub use errors::{StagepipeError, StagepipeResult};
pub use options::PipelineOptions;
pub use pipeline::{
    ExecutionMode, Item, Pipeline, PipelineMetrics, PipelineState, SequentialExecutor,
    SharedPool, StageDescriptor, StageMetrics, StagePlan, StagePolicy, Statefulness, Transform,
    classify, feed_batch_size, group, group_results, runs_in_master,
};
pub use stream::PipelineStream;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a `tracing` subscriber that writes to stderr.
///
/// Honors `RUST_LOG`, defaulting to `info`. Calling it twice is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
