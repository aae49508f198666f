//! Progress reporting
//!
//! Stages of a verification run and the events emitted as it advances.
//! Sinks are optional everywhere; a run without one behaves identically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Verification stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Deciding how to start the project
    AnalyzingStartup,
    /// Provisioning the runtime
    StartingProject,
    /// Waiting for readiness
    WaitingHealth,
    /// Obtaining test source
    GeneratingTests,
    /// Executing tests against the service
    RunningTests,
    /// Releasing the runtime
    Cleanup,
    /// Finished with an outcome
    Complete,
    /// Finished with an error
    Error,
}

impl Stage {
    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AnalyzingStartup => "analyzing_startup",
            Stage::StartingProject => "starting_project",
            Stage::WaitingHealth => "waiting_health",
            Stage::GeneratingTests => "generating_tests",
            Stage::RunningTests => "running_tests",
            Stage::Cleanup => "cleanup",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    /// Check if no further events follow
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage entered
    pub stage: Stage,
    /// Human-readable message
    pub message: String,
    /// Emission time
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    /// Create new event stamped now
    #[must_use]
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// JSON payload
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "stage": self.stage.as_str(),
            "message": self.message,
            "at": self.at.to_rfc3339(),
        })
        .to_string()
    }

    /// Server-sent events frame
    #[must_use]
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Receives progress events
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Deliver one event; delivery failures are the sink's concern
    async fn emit(&self, event: ProgressEvent);
}

#[async_trait]
impl ProgressSink for mpsc::Sender<ProgressEvent> {
    async fn emit(&self, event: ProgressEvent) {
        if self.send(event).await.is_err() {
            tracing::debug!("progress receiver dropped");
        }
    }
}

/// Emit to an optional sink
pub(crate) async fn emit(sink: Option<&dyn ProgressSink>, stage: Stage, message: impl Into<String>) {
    let message = message.into();
    tracing::info!(stage = stage.as_str(), "{message}");
    if let Some(sink) = sink {
        sink.emit(ProgressEvent::new(stage, message)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Stage::AnalyzingStartup).unwrap(),
            "\"analyzing_startup\""
        );
        assert_eq!(Stage::WaitingHealth.to_string(), "waiting_health");
        assert!(Stage::Error.is_terminal());
        assert!(!Stage::Cleanup.is_terminal());
    }

    #[test]
    fn sse_frame_carries_stage_and_message() {
        let event = ProgressEvent::new(Stage::RunningTests, "Running tests...");
        let frame = event.to_sse();

        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));

        let payload: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(payload["stage"], "running_tests");
        assert_eq!(payload["message"], "Running tests...");
        assert!(payload["at"].is_string());
    }

    #[tokio::test]
    async fn channel_sender_is_a_sink() {
        let (tx, mut rx) = mpsc::channel(4);
        emit(Some(&tx), Stage::Cleanup, "Cleaning up...").await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.stage, Stage::Cleanup);

        drop(rx);
        emit(Some(&tx), Stage::Complete, "done").await;
        emit(None, Stage::Complete, "done").await;
    }
}
