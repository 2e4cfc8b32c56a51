//! Stateful stage runner.
//!
//! Each stateful stage gets one long-lived worker thread that exclusively owns
//! the stage's transform. The driver (running on the consuming thread) talks to
//! it over a channel pair:
//!
//! ```text
//!  driver ── Feed::Item / Feed::EndOfStream ──▶ worker
//!  driver ◀── Reply::Item / Reply::Failed / Reply::EndOfStream ── worker
//! ```
//!
//! The driver keeps at most `feed_batch_size` items in flight (sent but not yet
//! drained), which bounds the depth of both channels. With one worker and FIFO
//! channels, results come back in input order.

use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::Item;
use crate::pipeline::metrics::SharedStageMetrics;
use crate::pipeline::pool::panic_message;
use crate::pipeline::stage::ExclusiveFn;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

/// Message on a worker's feed-in channel.
#[derive(Debug)]
pub(crate) enum Feed {
    Item(Item),
    EndOfStream,
}

/// Message on a worker's results-out channel.
#[derive(Debug)]
pub(crate) enum Reply {
    Item(Item),
    Failed(anyhow::Error),
    EndOfStream,
}

/// A dedicated worker and its channel pair. Lives until [`shutdown`](Self::shutdown).
pub struct StatefulWorker {
    stage: String,
    capacity: usize,
    feed_tx: Sender<Feed>,
    results_rx: Receiver<Reply>,
    /// Disconnects when the worker thread returns.
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
    /// Set once the end-of-stream echo has been observed.
    finished: Arc<AtomicBool>,
}

impl std::fmt::Debug for StatefulWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulWorker")
            .field("stage", &self.stage)
            .field("capacity", &self.capacity)
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish()
    }
}

impl StatefulWorker {
    /// Start the worker thread for `stage`.
    pub fn spawn(
        stage: impl Into<String>,
        transform: ExclusiveFn,
        capacity: usize,
        thread_name: &str,
    ) -> StagepipeResult<Self> {
        let stage = stage.into();
        let capacity = capacity.max(1);
        // Depth is bounded by the driver's in-flight count, not by the channels.
        let (feed_tx, feed_rx) = crossbeam_channel::unbounded();
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let worker_stage = stage.clone();
        let join = std::thread::Builder::new()
            .name(format!("{}-{}", thread_name, stage))
            .spawn(move || {
                run_worker(&worker_stage, transform, feed_rx, results_tx);
                drop(done_tx);
            })?;

        tracing::debug!(stage = %stage, capacity, "Started dedicated stage worker");

        Ok(Self {
            stage,
            capacity,
            feed_tx,
            results_rx,
            done_rx,
            join: Some(join),
            finished: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Build the driver that feeds `upstream` through this worker.
    pub fn runner<I>(&self, upstream: I, metrics: SharedStageMetrics) -> StatefulRunner<I>
    where
        I: Iterator<Item = StagepipeResult<Item>>,
    {
        StatefulRunner {
            stage: self.stage.clone(),
            upstream,
            upstream_done: false,
            feed_tx: self.feed_tx.clone(),
            results_rx: self.results_rx.clone(),
            capacity: self.capacity,
            in_flight: 0,
            pending_error: None,
            failed: false,
            finished: Arc::clone(&self.finished),
            metrics,
        }
    }

    /// Terminate the worker: send end-of-stream, discard results until it echoes,
    /// then wait for the thread to exit.
    ///
    /// Returns false if `deadline` passed before the worker exited. Calling it
    /// again after it returned true is a no-op.
    pub fn shutdown(&mut self, deadline: Option<Instant>) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };

        if !self.finished.load(Ordering::Acquire) {
            // Fails only when the worker already exited.
            let sent = self.feed_tx.send(Feed::EndOfStream).is_ok();
            if sent && !self.drain_until_echo(deadline) {
                return self.abandon(join);
            }
            self.finished.store(true, Ordering::Release);
        }

        // The done channel never carries a message; it disconnects when the thread returns.
        let exited = match deadline {
            Some(deadline) => !matches!(
                self.done_rx.recv_deadline(deadline),
                Err(RecvTimeoutError::Timeout)
            ),
            None => {
                let _ = self.done_rx.recv();
                true
            }
        };
        if !exited {
            return self.abandon(join);
        }

        if join.join().is_err() {
            tracing::warn!(stage = %self.stage, "Stage worker panicked");
        }
        tracing::debug!(stage = %self.stage, "Stopped dedicated stage worker");
        true
    }

    /// Discard results until the end-of-stream echo (or the worker vanished).
    fn drain_until_echo(&self, deadline: Option<Instant>) -> bool {
        loop {
            let reply = match deadline {
                Some(deadline) => match self.results_rx.recv_deadline(deadline) {
                    Ok(reply) => reply,
                    Err(RecvTimeoutError::Disconnected) => return true,
                    Err(RecvTimeoutError::Timeout) => return false,
                },
                None => match self.results_rx.recv() {
                    Ok(reply) => reply,
                    Err(_) => return true,
                },
            };
            if matches!(reply, Reply::EndOfStream) {
                return true;
            }
        }
    }

    fn abandon(&mut self, join: JoinHandle<()>) -> bool {
        tracing::warn!(
            stage = %self.stage,
            "Stage worker did not exit before close deadline; detaching"
        );
        drop(join);
        false
    }
}

fn run_worker(
    stage: &str,
    mut transform: ExclusiveFn,
    feed_rx: Receiver<Feed>,
    results_tx: Sender<Reply>,
) {
    while let Ok(msg) = feed_rx.recv() {
        let item = match msg {
            Feed::Item(item) => item,
            Feed::EndOfStream => {
                let _ = results_tx.send(Reply::EndOfStream);
                break;
            }
        };

        let reply = match catch_unwind(AssertUnwindSafe(|| transform(item))) {
            Ok(Ok(out)) => Reply::Item(out),
            Ok(Err(e)) => Reply::Failed(e),
            Err(panic) => Reply::Failed(anyhow::anyhow!(panic_message(&*panic))),
        };

        // A failure ends the worker; its state can no longer be trusted.
        let failed = matches!(reply, Reply::Failed(_));
        if results_tx.send(reply).is_err() || failed {
            break;
        }
    }
    tracing::trace!(stage = %stage, "Stage worker loop finished");
}

/// Driver iterator feeding one [`StatefulWorker`].
pub struct StatefulRunner<I> {
    stage: String,
    upstream: I,
    upstream_done: bool,
    feed_tx: Sender<Feed>,
    results_rx: Receiver<Reply>,
    capacity: usize,
    in_flight: usize,
    /// Upstream error waiting behind in-flight results.
    pending_error: Option<StagepipeError>,
    failed: bool,
    finished: Arc<AtomicBool>,
    metrics: SharedStageMetrics,
}

impl<I> StatefulRunner<I>
where
    I: Iterator<Item = StagepipeResult<Item>>,
{
    fn fill(&mut self) {
        while !self.upstream_done && self.in_flight < self.capacity {
            match self.upstream.next() {
                Some(Ok(item)) => {
                    if self.feed_tx.send(Feed::Item(item)).is_err() {
                        self.upstream_done = true;
                        self.pending_error = Some(StagepipeError::WorkerLost(self.stage.clone()));
                    } else {
                        self.in_flight += 1;
                        self.metrics.record_submitted();
                    }
                }
                Some(Err(e)) => {
                    self.upstream_done = true;
                    self.pending_error = Some(e);
                }
                None => self.upstream_done = true,
            }
        }
    }

    fn fail(&mut self, err: StagepipeError) -> Option<StagepipeResult<Item>> {
        self.failed = true;
        if self.in_flight > 0 {
            self.metrics.record_completed(true);
            self.metrics.record_discarded(self.in_flight - 1);
        }
        self.in_flight = 0;
        Some(Err(err))
    }

    /// Upstream is exhausted and nothing is in flight: send end-of-stream and
    /// wait for the echo.
    fn terminate(&mut self) -> Option<StagepipeError> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }
        if self.feed_tx.send(Feed::EndOfStream).is_err() {
            return Some(StagepipeError::WorkerLost(self.stage.clone()));
        }
        loop {
            match self.results_rx.recv() {
                Ok(Reply::EndOfStream) => break,
                Ok(Reply::Item(_)) => {
                    return Some(StagepipeError::Internal(format!(
                        "stage '{}' produced a result after its input ended",
                        self.stage
                    )));
                }
                Ok(Reply::Failed(source)) => {
                    return Some(StagepipeError::stage(&self.stage, source));
                }
                Err(_) => return Some(StagepipeError::WorkerLost(self.stage.clone())),
            }
        }
        self.finished.store(true, Ordering::Release);
        tracing::debug!(stage = %self.stage, "Stage worker drained at end of input");
        None
    }
}

impl<I> Iterator for StatefulRunner<I>
where
    I: Iterator<Item = StagepipeResult<Item>>,
{
    type Item = StagepipeResult<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        self.fill();

        if self.in_flight > 0 {
            return match self.results_rx.recv() {
                Ok(Reply::Item(item)) => {
                    self.in_flight -= 1;
                    self.metrics.record_completed(false);
                    tracing::trace!(stage = %self.stage, "Stateful result drained");
                    Some(Ok(item))
                }
                Ok(Reply::Failed(source)) => self.fail(StagepipeError::stage(&self.stage, source)),
                Ok(Reply::EndOfStream) => self.fail(StagepipeError::Internal(format!(
                    "stage '{}' ended while items were in flight",
                    self.stage
                ))),
                Err(_) => {
                    tracing::warn!(stage = %self.stage, "Stage worker disconnected");
                    self.fail(StagepipeError::WorkerLost(self.stage.clone()))
                }
            };
        }

        if let Some(err) = self.pending_error.take() {
            return self.fail(err);
        }

        let err = self.terminate()?;
        self.fail(err)
    }
}
