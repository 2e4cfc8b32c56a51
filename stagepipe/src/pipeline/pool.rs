//! Shared worker pool for stateless stages.
//!
//! Wraps a `rayon::ThreadPool`. Each submission hands back a [`Pending`]
//! handle whose result arrives over a one-slot channel. The pool tracks how
//! many jobs are in flight so shutdown can wait for them with a deadline.

use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::Item;
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Counter of jobs submitted but not yet finished.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Wait until no job is in flight. Returns false if the deadline passed first.
    fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                None => self.idle.wait(&mut count),
            }
        }
        true
    }
}

/// Pool shared by every Stateless and ConditionallyStateless stage.
#[derive(Clone)]
pub struct SharedPool {
    pool: Arc<rayon::ThreadPool>,
    in_flight: Arc<InFlight>,
    accepting: Arc<AtomicBool>,
    size: usize,
}

impl std::fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPool")
            .field("size", &self.size)
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

impl SharedPool {
    pub fn new(size: usize, thread_name: &str) -> StagepipeResult<Self> {
        let size = size.max(1);
        let prefix = thread_name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(move |i| format!("{}-pool-{}", prefix, i))
            .build()
            .map_err(|e| StagepipeError::Internal(format!("failed to build worker pool: {}", e)))?;

        tracing::debug!(pool_size = size, "Started shared worker pool");

        Ok(Self {
            pool: Arc::new(pool),
            in_flight: Arc::new(InFlight::default()),
            accepting: Arc::new(AtomicBool::new(true)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Submit `job` for asynchronous execution. Never blocks.
    ///
    /// Errors and panics inside the job are captured and returned from
    /// [`Pending::wait`].
    pub fn submit<F>(&self, job: F) -> StagepipeResult<Pending>
    where
        F: FnOnce() -> anyhow::Result<Item> + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(StagepipeError::Closed);
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.begin();

        self.pool.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(job))
                .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(&*panic))));
            // The receiver is gone when the consumer stopped early; nothing to report.
            let _ = tx.send(result);
            in_flight.end();
        });

        Ok(Pending { rx })
    }

    /// Stop accepting work and wait for in-flight jobs until `deadline`.
    pub fn shutdown(&self, deadline: Option<Instant>) -> bool {
        self.accepting.store(false, Ordering::Release);
        let drained = self.in_flight.wait_idle(deadline);
        if drained {
            tracing::debug!(pool_size = self.size, "Shared worker pool drained");
        } else {
            tracing::warn!(
                pool_size = self.size,
                "Shared worker pool still had jobs in flight at close deadline"
            );
        }
        drained
    }
}

/// Handle for a job submitted to the [`SharedPool`].
#[derive(Debug)]
pub struct Pending {
    rx: Receiver<anyhow::Result<Item>>,
}

impl Pending {
    /// Block until the job resolves.
    pub fn wait(self) -> StagepipeResult<anyhow::Result<Item>> {
        self.rx.recv().map_err(|_| {
            StagepipeError::Internal("pool job finished without producing a result".into())
        })
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("transform panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("transform panicked: {}", msg)
    } else {
        "transform panicked".to_string()
    }
}
