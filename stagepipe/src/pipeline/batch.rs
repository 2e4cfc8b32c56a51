//! Batch grouping for conditionally stateless stages.
//!
//! A window of `n` items is filled from the input and emitted whole. Items left
//! over at the end that cannot fill a window are dropped.

use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::Item;
use serde_json::Value;

/// Upper bound on memory reserved up front for one window.
const MAX_PREALLOC: usize = 1024;

/// Group `items` into fixed-size windows of `batch_size`.
///
/// ```
/// let batches: Vec<_> = stagepipe::group(2, 1..=5).unwrap().collect();
/// assert_eq!(batches, vec![vec![1, 2].into_boxed_slice(), vec![3, 4].into_boxed_slice()]);
/// ```
pub fn group<I>(batch_size: i64, items: I) -> StagepipeResult<Batches<I::IntoIter>>
where
    I: IntoIterator,
{
    let size = checked_size(batch_size)?;
    Ok(Batches::new(size, items.into_iter()))
}

/// Group a fallible stream into `Value::Array` batches of `batch_size`.
///
/// An upstream error is forwarded as soon as it is seen and ends the stream;
/// items already collected into the current window are discarded with it.
pub fn group_results<I>(batch_size: i64, items: I) -> StagepipeResult<ResultBatches<I::IntoIter>>
where
    I: IntoIterator<Item = StagepipeResult<Item>>,
{
    let size = checked_size(batch_size)?;
    Ok(ResultBatches::new(size, items.into_iter()))
}

fn checked_size(batch_size: i64) -> StagepipeResult<usize> {
    if batch_size < 1 {
        return Err(StagepipeError::InvalidBatchSize(batch_size));
    }
    usize::try_from(batch_size).map_err(|_| StagepipeError::InvalidBatchSize(batch_size))
}

/// Iterator returned by [`group`].
#[derive(Debug)]
pub struct Batches<I> {
    inner: I,
    size: usize,
}

impl<I> Batches<I> {
    /// `size` must be at least 1.
    pub(crate) fn new(size: usize, inner: I) -> Self {
        Self {
            inner,
            size: size.max(1),
        }
    }
}

impl<I: Iterator> Iterator for Batches<I> {
    type Item = Box<[I::Item]>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut window = Vec::with_capacity(self.size.min(MAX_PREALLOC));
        for item in self.inner.by_ref() {
            window.push(item);
            if window.len() == self.size {
                return Some(window.into_boxed_slice());
            }
        }

        if !window.is_empty() {
            tracing::debug!(
                dropped = window.len(),
                batch_size = self.size,
                "Dropping trailing items that do not fill a batch"
            );
        }
        None
    }
}

/// Iterator returned by [`group_results`].
#[derive(Debug)]
pub struct ResultBatches<I> {
    inner: I,
    size: usize,
    done: bool,
}

impl<I> ResultBatches<I> {
    /// `size` must be at least 1.
    pub(crate) fn new(size: usize, inner: I) -> Self {
        Self {
            inner,
            size: size.max(1),
            done: false,
        }
    }
}

impl<I> Iterator for ResultBatches<I>
where
    I: Iterator<Item = StagepipeResult<Item>>,
{
    type Item = StagepipeResult<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut window = Vec::with_capacity(self.size.min(MAX_PREALLOC));
        for item in self.inner.by_ref() {
            match item {
                Ok(item) => {
                    window.push(item);
                    if window.len() == self.size {
                        return Some(Ok(Value::Array(window)));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        self.done = true;
        if !window.is_empty() {
            tracing::debug!(
                dropped = window.len(),
                batch_size = self.size,
                "Dropping trailing items that do not fill a batch"
            );
        }
        None
    }
}
