//! Batched multi-stage parallel pipeline.
//!
//! Chains stage transforms over a lazy input. Each stage is scheduled by its
//! declared statefulness:
//! - Stateless and ConditionallyStateless stages share one worker pool
//! - Stateful stages each own one dedicated worker thread
//! - `run_in_master` stages run inline on the consuming thread
//!
//! ## Architecture
//!
//! ```text
//! input ─▶ [stage 0 runner] ─▶ [stage 1 runner] ─▶ ... ─▶ Pipeline::next()
//!
//! - StagePlan: validated policy of one stage (mode, batch size, window)
//! - Runner: pull-based iterator wrapping the previous stage's output
//! - Pipeline: sizes the pool, wires runners lazily, tears everything down on close
//! ```
//!
//! Every runner preserves order, so the whole chain does too.
//!
//! ## Example
//!
//! ```
//! use stagepipe::{Pipeline, StageDescriptor};
//! use serde_json::json;
//!
//! let stages = vec![
//!     StageDescriptor::new("double", |v| Ok(json!(v.as_i64().unwrap_or(0) * 2)))
//!         .stateless()
//!         .feed_batch_size(2),
//!     StageDescriptor::new("stringify", |v| Ok(json!(v.to_string()))),
//! ];
//!
//! let mut pipeline = Pipeline::new(stages)?;
//! let outputs = pipeline
//!     .apply((1..=5).map(|v| json!(v)))?
//!     .collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(outputs, vec![json!("2"), json!("4"), json!("6"), json!("8"), json!("10")]);
//! assert!(pipeline.close(None));
//! # Ok::<(), stagepipe::StagepipeError>(())
//! ```

mod batch;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod pool;
mod sequential;
mod stage;
mod stateful;
mod stateless;

/// Opaque payload flowing between stages. A batch is a `Value::Array` of its items.
pub type Item = serde_json::Value;

pub use batch::{Batches, ResultBatches, group, group_results};
pub use metrics::{PipelineMetrics, SharedStageMetrics, StageMetrics, StageMetricsStorage};
pub use pipeline::{Pipeline, PipelineState};
pub use pool::{Pending, SharedPool};
pub use sequential::SequentialExecutor;
pub use stage::{
    ExclusiveFn, ExecutionMode, SharedFn, StageDescriptor, StagePlan, StagePolicy, Statefulness,
    Transform, classify, feed_batch_size, runs_in_master,
};
pub use stateful::{StatefulRunner, StatefulWorker};
pub use stateless::StatelessRunner;
