//! Stateless stage runner.
//!
//! Keeps up to `window` submissions outstanding on the shared pool and yields
//! their results in submission order:
//!
//! ```text
//! upstream ──▶ [submit while window has room] ──▶ FIFO of Pending ──▶ pop oldest, wait
//! ```
//!
//! Popping the oldest entry is the only place this runner blocks.

use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::Item;
use crate::pipeline::metrics::SharedStageMetrics;
use crate::pipeline::pool::{Pending, SharedPool};
use crate::pipeline::stage::SharedFn;
use std::collections::VecDeque;

/// An entry in the sliding window.
#[derive(Debug)]
enum Outstanding {
    /// Submitted to the pool, not yet resolved.
    Submitted(Pending),
    /// Already resolved before submission (upstream error or refused submit).
    Ready(StagepipeError),
}

/// Iterator that runs a stateless transform on the shared pool.
pub struct StatelessRunner<I> {
    stage: String,
    upstream: I,
    upstream_done: bool,
    failed: bool,
    pool: SharedPool,
    transform: SharedFn,
    window: usize,
    outstanding: VecDeque<Outstanding>,
    metrics: SharedStageMetrics,
}

impl<I> StatelessRunner<I>
where
    I: Iterator<Item = StagepipeResult<Item>>,
{
    pub fn new(
        stage: impl Into<String>,
        upstream: I,
        pool: SharedPool,
        transform: SharedFn,
        window: usize,
        metrics: SharedStageMetrics,
    ) -> Self {
        let window = window.max(1);
        Self {
            stage: stage.into(),
            upstream,
            upstream_done: false,
            failed: false,
            pool,
            transform,
            window,
            outstanding: VecDeque::new(),
            metrics,
        }
    }

    /// Pull from upstream and submit until the window is full or upstream ends.
    fn fill(&mut self) {
        while !self.upstream_done && self.outstanding.len() < self.window {
            match self.upstream.next() {
                Some(Ok(item)) => {
                    let transform = self.transform.clone();
                    let entry = match self.pool.submit(move || transform(item)) {
                        Ok(pending) => Outstanding::Submitted(pending),
                        Err(e) => {
                            self.upstream_done = true;
                            Outstanding::Ready(e)
                        }
                    };
                    self.metrics.record_submitted();
                    self.outstanding.push_back(entry);
                }
                Some(Err(e)) => {
                    // Keep the upstream error behind the work already in flight.
                    self.upstream_done = true;
                    self.metrics.record_submitted();
                    self.outstanding.push_back(Outstanding::Ready(e));
                }
                None => self.upstream_done = true,
            }
        }
    }
}

impl<I> Iterator for StatelessRunner<I>
where
    I: Iterator<Item = StagepipeResult<Item>>,
{
    type Item = StagepipeResult<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.fill();

        let result = match self.outstanding.pop_front()? {
            Outstanding::Submitted(pending) => match pending.wait() {
                Ok(Ok(item)) => Ok(item),
                Ok(Err(source)) => Err(StagepipeError::stage(&self.stage, source)),
                Err(e) => Err(e),
            },
            Outstanding::Ready(e) => Err(e),
        };

        self.metrics.record_completed(result.is_err());
        if result.is_err() {
            // Nothing after a failure is yielded; abandon the rest of the window.
            self.failed = true;
            self.upstream_done = true;
            self.metrics.record_discarded(self.outstanding.len());
            self.outstanding.clear();
        }
        tracing::trace!(stage = %self.stage, ok = result.is_ok(), "Stateless result popped");
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::metrics::StageMetricsStorage;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn shared<F>(f: F) -> SharedFn
    where
        F: Fn(Item) -> anyhow::Result<Item> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn ok_items(values: impl IntoIterator<Item = i64>) -> Vec<StagepipeResult<Item>> {
        values.into_iter().map(|v| Ok(json!(v))).collect()
    }

    #[test]
    fn test_results_follow_submission_order() {
        let pool = SharedPool::new(4, "test").unwrap();
        // Earlier items sleep longer, so they complete last.
        let transform = shared(|v| {
            let n = v.as_i64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis((10 - n) as u64 * 3));
            Ok(json!(n * 10))
        });
        let metrics = Arc::new(StageMetricsStorage::new());
        let runner = StatelessRunner::new(
            "slow",
            ok_items(0..10).into_iter(),
            pool,
            transform,
            4,
            metrics.clone(),
        );

        let out: Vec<Item> = runner.map(|r| r.unwrap()).collect();
        assert_eq!(out, (0..10).map(|n| json!(n * 10)).collect::<Vec<_>>());
        assert_eq!(metrics.items_out(), 10);
        assert!(metrics.peak_outstanding() <= 4);
    }

    #[test]
    fn test_error_surfaces_at_its_position() {
        let pool = SharedPool::new(2, "test").unwrap();
        let transform = shared(|v| {
            if v == json!(0) {
                anyhow::bail!("zero is not allowed");
            }
            Ok(v)
        });
        let metrics = Arc::new(StageMetricsStorage::new());
        let mut runner = StatelessRunner::new(
            "check",
            ok_items([1, 0, 2]).into_iter(),
            pool,
            transform,
            3,
            metrics,
        );

        assert_eq!(runner.next().unwrap().unwrap(), json!(1));
        let err = runner.next().unwrap().unwrap_err();
        assert!(matches!(err, StagepipeError::Stage { ref stage, .. } if stage == "check"));
        // "2" was already submitted but its result is never yielded.
        assert!(runner.next().is_none());
    }

    #[test]
    fn test_upstream_error_follows_in_flight_work() {
        let pool = SharedPool::new(2, "test").unwrap();
        let transform = shared(Ok);
        let input = vec![
            Ok(json!(1)),
            Ok(json!(2)),
            Err(StagepipeError::Internal("upstream".into())),
            Ok(json!(3)),
        ];
        let metrics = Arc::new(StageMetricsStorage::new());
        let mut runner = StatelessRunner::new("id", input.into_iter(), pool, transform, 8, metrics);

        assert_eq!(runner.next().unwrap().unwrap(), json!(1));
        assert_eq!(runner.next().unwrap().unwrap(), json!(2));
        assert!(matches!(
            runner.next(),
            Some(Err(StagepipeError::Internal(_)))
        ));
        assert!(runner.next().is_none());
    }

    #[test]
    fn test_huge_window_over_short_input() {
        let pool = SharedPool::new(2, "test").unwrap();
        let metrics = Arc::new(StageMetricsStorage::new());
        let runner = StatelessRunner::new(
            "id",
            ok_items(1..=3).into_iter(),
            pool,
            shared(Ok),
            1 << 40,
            metrics.clone(),
        );

        let out: Vec<Item> = runner.map(|r| r.unwrap()).collect();
        assert_eq!(out, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(metrics.peak_outstanding(), 3);
    }

    #[test]
    fn test_empty_input() {
        let pool = SharedPool::new(1, "test").unwrap();
        let transform = shared(Ok);
        let metrics = Arc::new(StageMetricsStorage::new());
        let mut runner = StatelessRunner::new("id", std::iter::empty(), pool, transform, 2, metrics);
        assert!(runner.next().is_none());
    }
}
