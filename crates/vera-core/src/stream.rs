//! Streaming verification worker
//!
//! Runs a verification on a spawned task and hands progress to the caller
//! over a bounded channel. Dropping the stream cancels the run; the worker
//! still stops the project before it exits.

use crate::coordinator::{VerificationCoordinator, VerificationOutcome, VerificationRequest};
use crate::progress::{ProgressEvent, ProgressSink};
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Item delivered by a [`VerificationStream`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Stage progress
    Progress(ProgressEvent),
    /// Final outcome; always the last item
    Finished(VerificationOutcome),
}

/// Progress and outcome of a running verification
///
/// Dropping the stream cancels the verification.
#[derive(Debug)]
pub struct VerificationStream {
    events: mpsc::Receiver<StreamEvent>,
    _cancel: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl VerificationStream {
    /// Receive the next event
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Drain progress and return the outcome
    pub async fn outcome(mut self) -> Option<VerificationOutcome> {
        while let Some(event) = self.events.recv().await {
            if let StreamEvent::Finished(outcome) = event {
                return Some(outcome);
            }
        }
        None
    }

    /// Cancel and wait until cleanup has finished
    pub async fn cancel(self) {
        let Self {
            events,
            _cancel: cancel,
            worker,
        } = self;
        drop(cancel);
        drop(events);
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "verification worker ended abnormally");
        }
    }
}

impl Stream for VerificationStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

#[async_trait]
impl ProgressSink for ChannelSink {
    async fn emit(&self, event: ProgressEvent) {
        if self.tx.send(StreamEvent::Progress(event)).await.is_err() {
            tracing::debug!("stream receiver dropped");
        }
    }
}

impl VerificationCoordinator {
    /// Run a verification on a spawned task
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn_stream(&self, request: VerificationRequest) -> VerificationStream {
        let (tx, events) = mpsc::channel(self.stream_capacity());
        let (cancel, cancelled) = oneshot::channel::<()>();
        let coordinator = self.clone();

        let worker = tokio::spawn(async move {
            let started = Instant::now();
            let sink = ChannelSink { tx };
            let cancelled = async move {
                let _ = cancelled.await;
            };

            let outcome = match coordinator.run_until(&request, Some(&sink), cancelled).await {
                Ok(outcome) => outcome,
                Err(e) => VerificationOutcome::degraded(
                    &e,
                    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                ),
            };
            if sink.tx.send(StreamEvent::Finished(outcome)).await.is_err() {
                tracing::debug!("stream receiver dropped before outcome");
            }
        });

        VerificationStream {
            events,
            _cancel: cancel,
            worker,
        }
    }
}
