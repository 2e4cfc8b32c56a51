//! Reference sequential executor.
//!
//! Runs the same stage list eagerly on the calling thread, one stage at a time.
//! Batching is honored; there is no pool, no worker and nothing to tear down.
//! Its output is the expected output of [`Pipeline`](crate::Pipeline) for the
//! same deterministic stages and finite input.

use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::batch::Batches;
use crate::pipeline::stage::StageDescriptor;
use crate::pipeline::Item;
use serde_json::Value;

pub struct SequentialExecutor;

impl SequentialExecutor {
    /// Apply `stages` in order to every item of `input`.
    ///
    /// Stops at the first failing item and returns its error.
    pub fn run<I>(stages: Vec<StageDescriptor>, input: I) -> StagepipeResult<Vec<Item>>
    where
        I: IntoIterator<Item = Item>,
    {
        let plans = stages
            .iter()
            .map(StageDescriptor::plan)
            .collect::<StagepipeResult<Vec<_>>>()?;

        let mut items: Vec<Item> = input.into_iter().collect();

        for (stage, plan) in stages.into_iter().zip(plans) {
            let (name, transform) = stage.into_parts();
            let mut transform = transform.into_exclusive();

            let batched: Vec<Item> = match plan.statefulness.batch_size() {
                Some(n) => Batches::new(n, items.into_iter())
                    .map(|batch| Value::Array(batch.into_vec()))
                    .collect(),
                None => items,
            };

            items = batched
                .into_iter()
                .map(|item| transform(item).map_err(|e| StagepipeError::stage(&name, e)))
                .collect::<StagepipeResult<Vec<_>>>()?;

            tracing::trace!(stage = %name, items = items.len(), "Sequential stage applied");
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_with_batches() {
        let stages = vec![
            StageDescriptor::new("double", |v| Ok(json!(v.as_i64().unwrap_or(0) * 2))).stateless(),
            StageDescriptor::new("sum", |v| {
                let total: i64 = v
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(json!(total))
            })
            .conditionally_stateless(2),
        ];

        let out = SequentialExecutor::run(stages, (1..=5).map(|v| json!(v))).unwrap();
        // [2,4,6,8,10] -> [2+4, 6+8]; 10 cannot fill a pair.
        assert_eq!(out, vec![json!(6), json!(14)]);
    }

    #[test]
    fn test_stops_at_first_error() {
        let stages = vec![StageDescriptor::new("reject", |v| {
            if v == json!(0) {
                anyhow::bail!("zero");
            }
            Ok(v)
        })];

        let err = SequentialExecutor::run(stages, vec![json!(1), json!(0), json!(2)]).unwrap_err();
        assert!(matches!(err, StagepipeError::Stage { ref stage, .. } if stage == "reject"));
    }

    #[test]
    fn test_invalid_policy_fails_before_running() {
        let stages = vec![StageDescriptor::new("bad", |_| panic!("must not run")).conditionally_stateless(0)];
        assert!(matches!(
            SequentialExecutor::run(stages, vec![json!(1)]),
            Err(StagepipeError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_huge_batch_size_yields_nothing() {
        let stages = vec![StageDescriptor::new("sum", Ok).conditionally_stateless(1 << 40)];
        let out = SequentialExecutor::run(stages, vec![json!(1), json!(2), json!(3)]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_exclusive_state_is_kept() {
        let mut seen = 0;
        let stages = vec![StageDescriptor::exclusive("count", move |_| {
            seen += 1;
            Ok(json!(seen))
        })];
        let out = SequentialExecutor::run(stages, vec![json!("a"), json!("b")]).unwrap();
        assert_eq!(out, vec![json!(1), json!(2)]);
    }
}
