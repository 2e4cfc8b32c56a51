//! Stage descriptors and statefulness classification.
//!
//! Every stage declares how it may be executed:
//!
//! ```text
//! statefulness absent      -> Stateful (one dedicated worker)
//! statefulness true        -> Stateful
//! statefulness false/null  -> Stateless (shared pool)
//! statefulness n >= 1      -> ConditionallyStateless(n) (shared pool, batches of n)
//! ```
//!
//! `feed_batch_size` bounds how many items a stage may have outstanding, and
//! `run_in_master` forces synchronous execution on the consuming thread.

use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::Item;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// How a stage may be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Statefulness {
    /// Safe to run concurrently, in any order, across items.
    Stateless,
    /// Must see every item through one exclusive worker.
    Stateful,
    /// Stateless only when fed fixed-size batches of exactly `n` items.
    ConditionallyStateless(usize),
}

impl Statefulness {
    /// Batch size the stage must be fed with, if any.
    pub fn batch_size(&self) -> Option<usize> {
        match self {
            Statefulness::ConditionallyStateless(n) => Some(*n),
            _ => None,
        }
    }
}

/// Where a stage's transform actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionMode {
    /// Synchronously on the thread pulling pipeline output.
    Master,
    /// On the pool shared by all stateless stages.
    SharedPool,
    /// On a long-lived thread owned by this stage alone.
    DedicatedWorker,
}

/// Declared per-stage policy, as written by the stage author.
///
/// `statefulness` keeps the difference between an absent declaration
/// (`None`, conservatively Stateful) and an explicit `null` (`Some(Null)`,
/// Stateless).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePolicy {
    #[serde(default, deserialize_with = "deserialize_declared")]
    pub statefulness: Option<Value>,
    #[serde(default)]
    pub feed_batch_size: Option<i64>,
    #[serde(default)]
    pub run_in_master: bool,
}

fn deserialize_declared<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl StagePolicy {
    /// Parse a policy from its JSON form.
    pub fn from_json(json: &str) -> StagepipeResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| StagepipeError::Config(format!("invalid stage policy JSON: {}", e)))
    }
}

/// Classify a declared policy.
pub fn classify(policy: &StagePolicy) -> StagepipeResult<Statefulness> {
    let declared = match &policy.statefulness {
        None => return Ok(Statefulness::Stateful),
        Some(value) => value,
    };

    match declared {
        Value::Bool(true) => Ok(Statefulness::Stateful),
        Value::Bool(false) | Value::Null => Ok(Statefulness::Stateless),
        Value::Number(n) => match n.as_u64() {
            Some(n) if n >= 1 => usize::try_from(n)
                .map(Statefulness::ConditionallyStateless)
                .map_err(|_| StagepipeError::InvalidPolicy(format!("batch size {} too large", n))),
            _ => Err(StagepipeError::InvalidPolicy(format!(
                "statefulness must be a positive integer, got {}",
                n
            ))),
        },
        other => Err(StagepipeError::InvalidPolicy(format!(
            "unsupported statefulness declaration: {}",
            other
        ))),
    }
}

/// Number of items or batches a stage may have outstanding (default 1, floor 1).
pub fn feed_batch_size(policy: &StagePolicy) -> usize {
    policy
        .feed_batch_size
        .map(|n| usize::try_from(n.max(1)).unwrap_or(usize::MAX))
        .unwrap_or(1)
}

pub fn runs_in_master(policy: &StagePolicy) -> bool {
    policy.run_in_master
}

/// Validated, immutable execution plan for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub statefulness: Statefulness,
    pub feed_batch_size: usize,
    pub run_in_master: bool,
    pub mode: ExecutionMode,
}

impl StagePlan {
    pub fn from_policy(policy: &StagePolicy) -> StagepipeResult<Self> {
        let statefulness = classify(policy)?;
        let run_in_master = runs_in_master(policy);
        let mode = match (run_in_master, statefulness) {
            (true, _) => ExecutionMode::Master,
            (false, Statefulness::Stateful) => ExecutionMode::DedicatedWorker,
            (false, _) => ExecutionMode::SharedPool,
        };

        Ok(Self {
            statefulness,
            feed_batch_size: feed_batch_size(policy),
            run_in_master,
            mode,
        })
    }
}

pub type SharedFn = Arc<dyn Fn(Item) -> anyhow::Result<Item> + Send + Sync>;
pub type ExclusiveFn = Box<dyn FnMut(Item) -> anyhow::Result<Item> + Send>;

/// A stage's unary transform.
pub enum Transform {
    /// Callable from any thread; required for pool execution.
    Shared(SharedFn),
    /// Owns mutable state; only ever called from a single thread.
    Exclusive(ExclusiveFn),
}

impl Transform {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Transform::Exclusive(_))
    }

    /// Convert into a callable owned by a single thread.
    pub(crate) fn into_exclusive(self) -> ExclusiveFn {
        match self {
            Transform::Shared(f) => Box::new(move |item| f(item)),
            Transform::Exclusive(f) => f,
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Shared(_) => f.write_str("Transform::Shared"),
            Transform::Exclusive(_) => f.write_str("Transform::Exclusive"),
        }
    }
}

/// One stage of a pipeline: a transform plus its declared policy.
///
/// Built once by the caller, then consumed by a [`Pipeline`](crate::Pipeline)
/// or the [`SequentialExecutor`](crate::SequentialExecutor).
///
/// ```
/// use stagepipe::StageDescriptor;
/// use serde_json::json;
///
/// let double = StageDescriptor::new("double", |v| Ok(json!(v.as_i64().unwrap_or(0) * 2)))
///     .stateless()
///     .feed_batch_size(2);
/// assert!(double.plan().is_ok());
/// ```
#[derive(Debug)]
pub struct StageDescriptor {
    name: String,
    transform: Transform,
    policy: StagePolicy,
}

impl StageDescriptor {
    /// Stage with a shareable transform. Defaults to Stateful until declared otherwise.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Item) -> anyhow::Result<Item> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            transform: Transform::Shared(Arc::new(f)),
            policy: StagePolicy::default(),
        }
    }

    /// Stage whose transform owns mutable state across items.
    pub fn exclusive<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(Item) -> anyhow::Result<Item> + Send + 'static,
    {
        Self {
            name: name.into(),
            transform: Transform::Exclusive(Box::new(f)),
            policy: StagePolicy::default(),
        }
    }

    /// Replace the whole declared policy (e.g. one loaded from config).
    pub fn with_policy(mut self, policy: StagePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Declare statefulness using its raw form (`true`, `false`, `null`, or `n`).
    pub fn statefulness(mut self, declared: Value) -> Self {
        self.policy.statefulness = Some(declared);
        self
    }

    pub fn stateless(self) -> Self {
        self.statefulness(Value::Bool(false))
    }

    pub fn stateful(self) -> Self {
        self.statefulness(Value::Bool(true))
    }

    pub fn conditionally_stateless(self, n: i64) -> Self {
        self.statefulness(Value::from(n))
    }

    pub fn feed_batch_size(mut self, n: i64) -> Self {
        self.policy.feed_batch_size = Some(n);
        self
    }

    pub fn run_in_master(mut self) -> Self {
        self.policy.run_in_master = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    /// Classify and validate this stage.
    pub fn plan(&self) -> StagepipeResult<StagePlan> {
        let plan = StagePlan::from_policy(&self.policy)
            .map_err(|e| annotate(&self.name, e))?;

        if self.transform.is_exclusive() && plan.mode == ExecutionMode::SharedPool {
            return Err(StagepipeError::InvalidPolicy(format!(
                "stage '{}' owns mutable state and cannot run on the shared pool",
                self.name
            )));
        }

        Ok(plan)
    }

    pub(crate) fn into_parts(self) -> (String, Transform) {
        (self.name, self.transform)
    }
}

fn annotate(stage: &str, err: StagepipeError) -> StagepipeError {
    match err {
        StagepipeError::InvalidPolicy(msg) => {
            StagepipeError::InvalidPolicy(format!("stage '{}': {}", stage, msg))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(v: Item) -> anyhow::Result<Item> {
        Ok(v)
    }

    #[test]
    fn test_classify_absent_is_stateful() {
        assert_eq!(
            classify(&StagePolicy::default()).unwrap(),
            Statefulness::Stateful
        );
    }

    #[test]
    fn test_classify_declared_values() {
        let policy = |v: Value| StagePolicy {
            statefulness: Some(v),
            ..Default::default()
        };

        assert_eq!(classify(&policy(json!(true))).unwrap(), Statefulness::Stateful);
        assert_eq!(classify(&policy(json!(false))).unwrap(), Statefulness::Stateless);
        assert_eq!(classify(&policy(Value::Null)).unwrap(), Statefulness::Stateless);
        assert_eq!(
            classify(&policy(json!(3))).unwrap(),
            Statefulness::ConditionallyStateless(3)
        );
    }

    #[test]
    fn test_classify_rejects_invalid() {
        for bad in [json!(0), json!(-1), json!(2.5), json!("yes"), json!([1])] {
            let policy = StagePolicy {
                statefulness: Some(bad.clone()),
                ..Default::default()
            };
            assert!(
                matches!(classify(&policy), Err(StagepipeError::InvalidPolicy(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_feed_batch_size_default_and_floor() {
        let mut policy = StagePolicy::default();
        assert_eq!(feed_batch_size(&policy), 1);

        policy.feed_batch_size = Some(0);
        assert_eq!(feed_batch_size(&policy), 1);

        policy.feed_batch_size = Some(-4);
        assert_eq!(feed_batch_size(&policy), 1);

        policy.feed_batch_size = Some(8);
        assert_eq!(feed_batch_size(&policy), 8);

        policy.feed_batch_size = Some(i64::MAX);
        assert_eq!(
            feed_batch_size(&policy),
            usize::try_from(i64::MAX).unwrap_or(usize::MAX)
        );
    }

    #[test]
    fn test_policy_json_absent_vs_null() {
        let absent = StagePolicy::from_json("{}").unwrap();
        assert_eq!(absent.statefulness, None);
        assert_eq!(classify(&absent).unwrap(), Statefulness::Stateful);

        let null = StagePolicy::from_json(r#"{"statefulness": null}"#).unwrap();
        assert_eq!(null.statefulness, Some(Value::Null));
        assert_eq!(classify(&null).unwrap(), Statefulness::Stateless);

        let full = StagePolicy::from_json(
            r#"{"statefulness": 4, "feed_batch_size": 3, "run_in_master": true}"#,
        )
        .unwrap();
        let plan = StagePlan::from_policy(&full).unwrap();
        assert_eq!(plan.statefulness, Statefulness::ConditionallyStateless(4));
        assert_eq!(plan.feed_batch_size, 3);
        assert_eq!(plan.mode, ExecutionMode::Master);
    }

    #[test]
    fn test_plan_modes() {
        let stateless = StageDescriptor::new("a", identity).stateless();
        assert_eq!(stateless.plan().unwrap().mode, ExecutionMode::SharedPool);

        let batched = StageDescriptor::new("b", identity).conditionally_stateless(2);
        assert_eq!(batched.plan().unwrap().mode, ExecutionMode::SharedPool);

        let stateful = StageDescriptor::new("c", identity);
        assert_eq!(stateful.plan().unwrap().mode, ExecutionMode::DedicatedWorker);

        let master = StageDescriptor::new("d", identity).stateful().run_in_master();
        assert_eq!(master.plan().unwrap().mode, ExecutionMode::Master);
    }

    #[test]
    fn test_exclusive_transform_rejected_on_pool() {
        let mut count = 0;
        let stage = StageDescriptor::exclusive("counter", move |_| {
            count += 1;
            Ok(json!(count))
        })
        .stateless();

        let err = stage.plan().unwrap_err();
        assert!(matches!(err, StagepipeError::InvalidPolicy(_)));
        assert!(err.to_string().contains("counter"));

        let in_master = StageDescriptor::exclusive("counter", |v| Ok(v))
            .stateless()
            .run_in_master();
        assert!(in_master.plan().is_ok());
    }

    #[test]
    fn test_invalid_policy_names_stage() {
        let err = StageDescriptor::new("broken", identity)
            .conditionally_stateless(-1)
            .plan()
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
