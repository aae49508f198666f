//! Error types for Vera Core
//!
//! Covers:
//! - Collaborator failures (planner, test generator)
//! - Project start failures
//! - Verification failures, each attributed to the stage that raised it
//! - Settings loading

use crate::progress::Stage;
use std::path::PathBuf;
use vera_sandbox::{HealthCheckTimeout, SandboxError, StartMethod};

/// Failure reported by an external collaborator
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// Collaborator could not be reached or refused the request
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// Collaborator answered with something unusable
    #[error("invalid collaborator response: {0}")]
    InvalidResponse(String),

    /// Reading collaborator input failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a project instance could not be started
#[derive(Debug, thiserror::Error)]
pub enum StartFailure {
    /// Plan has no start strategy
    #[error("unsupported start method: {0}")]
    UnsupportedMethod(StartMethod),

    /// Backend failed to provision the runtime
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] SandboxError),

    /// Service never became ready
    #[error("{0}")]
    HealthCheckTimeout(#[from] HealthCheckTimeout),

    /// Project was stopped while it was starting
    #[error("project stopped while starting")]
    Aborted,
}

impl StartFailure {
    /// Runtime logs captured with the failure, if any
    #[inline]
    #[must_use]
    pub fn logs(&self) -> Option<&str> {
        match self {
            Self::HealthCheckTimeout(timeout) if !timeout.logs.is_empty() => {
                Some(timeout.logs.as_str())
            }
            _ => None,
        }
    }
}

/// Verification error
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// Could not decide how to start the project
    #[error("planning failed: {0}")]
    Planning(String),

    /// Project failed to start
    #[error("failed to start project: {0}")]
    Start(#[from] StartFailure),

    /// Test generator failed
    #[error("test generation failed: {0}")]
    TestGeneration(#[source] CollaboratorError),

    /// Caller went away
    #[error("verification cancelled during {0}")]
    Cancelled(Stage),
}

impl VerificationError {
    /// Check if the error aborts the verification
    ///
    /// Cancellation is caller-initiated and not a failure of the project.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled(_))
    }

    /// Stage that raised the error
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Planning(_) | Self::Start(StartFailure::UnsupportedMethod(_)) => {
                Stage::AnalyzingStartup
            }
            Self::Start(StartFailure::Provisioning(_) | StartFailure::Aborted) => {
                Stage::StartingProject
            }
            Self::Start(StartFailure::HealthCheckTimeout(_)) => Stage::WaitingHealth,
            Self::TestGeneration(_) => Stage::GeneratingTests,
            Self::Cancelled(stage) => *stage,
        }
    }
}

/// Settings loading error
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Settings file unreadable
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Settings file is not valid TOML for this schema
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override has an unusable value
    #[error("invalid value for {var}: {value:?}")]
    InvalidOverride {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_attributed_to_stages() {
        assert_eq!(
            VerificationError::Planning("no config".into()).stage(),
            Stage::AnalyzingStartup
        );
        assert_eq!(
            VerificationError::Start(StartFailure::Provisioning(SandboxError::MissingStartCommand))
                .stage(),
            Stage::StartingProject
        );
        let timeout = HealthCheckTimeout {
            url: "http://localhost:3000".into(),
            waited_secs: 180,
            logs: String::new(),
        };
        assert_eq!(
            VerificationError::Start(timeout.into()).stage(),
            Stage::WaitingHealth
        );
        assert_eq!(
            VerificationError::TestGeneration(CollaboratorError::Unavailable("down".into())).stage(),
            Stage::GeneratingTests
        );
    }

    #[test]
    fn cancellation_is_not_fatal() {
        assert!(!VerificationError::Cancelled(Stage::RunningTests).is_fatal());
        assert!(VerificationError::Planning(String::new()).is_fatal());
    }

    #[test]
    fn health_timeout_exposes_logs() {
        let failure = StartFailure::HealthCheckTimeout(HealthCheckTimeout {
            url: "http://localhost:8080/health".into(),
            waited_secs: 3,
            logs: String::new(),
        });
        assert!(failure.logs().is_none());

        let failure = match failure {
            StartFailure::HealthCheckTimeout(t) => {
                StartFailure::HealthCheckTimeout(t.with_logs("EADDRINUSE"))
            }
            other => other,
        };
        assert_eq!(failure.logs(), Some("EADDRINUSE"));
        assert!(failure.to_string().contains("health check timeout after 3s"));
    }
}
