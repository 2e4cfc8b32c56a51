//! Async consumption of a [`Pipeline`].
//!
//! The pipeline itself blocks while it waits on workers, so it is driven on a
//! tokio blocking thread and hands results over a one-slot channel. A slow
//! consumer therefore still holds back the whole chain.

use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::{Item, Pipeline};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// Stream of pipeline outputs, created by [`Pipeline::into_stream`].
#[derive(Debug)]
pub struct PipelineStream {
    inner: ReceiverStream<StagepipeResult<Item>>,
    driver: JoinHandle<bool>,
}

impl Pipeline {
    /// Move the pipeline onto a blocking thread and consume it as a stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_stream(self) -> PipelineStream {
        let (tx, rx) = mpsc::channel(1);
        let driver = tokio::task::spawn_blocking(move || {
            let mut pipeline = self;
            while let Some(result) = pipeline.next() {
                if tx.blocking_send(result).is_err() {
                    tracing::debug!("Pipeline stream dropped by consumer");
                    break;
                }
            }
            pipeline.close(None)
        });

        PipelineStream {
            inner: ReceiverStream::new(rx),
            driver,
        }
    }
}

impl PipelineStream {
    /// Stop consuming, wait for the pipeline to close, and return close's result.
    pub async fn finish(self) -> StagepipeResult<bool> {
        let PipelineStream { inner, driver } = self;
        drop(inner);
        driver
            .await
            .map_err(|e| StagepipeError::Internal(format!("pipeline driver failed: {}", e)))
    }
}

impl Stream for PipelineStream {
    type Item = StagepipeResult<Item>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
