//! Vera Core - functional verification orchestration
//!
//! Decides how to start an arbitrary project, supervises its isolated
//! lifecycle and runs generated end-to-end tests against it:
//! - Starts projects through an isolation backend with bounded readiness waits
//! - Tracks live instances and guarantees teardown on every exit path
//! - Drives the verification stages and reports progress
//! - Streams progress from a cancellable background worker
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vera_core::{
//!     FileTestGenerator, LifecycleManager, ProjectRegistry, StaticPlanner,
//!     VerificationCoordinator, VerificationRequest,
//! };
//! use vera_sandbox::{DockerBackend, DockerSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let lifecycle = LifecycleManager::new(
//!     Arc::new(DockerBackend::new(DockerSettings::default())),
//!     Arc::new(ProjectRegistry::new()),
//! );
//! let coordinator = VerificationCoordinator::new(
//!     Arc::new(lifecycle),
//!     Arc::new(StaticPlanner::from_file("plan.toml".as_ref())?),
//!     Arc::new(FileTestGenerator::new("tests.mjs")),
//! );
//!
//! let request = VerificationRequest::new("./project", "Create a channel");
//! let outcome = coordinator.run_functional_verification(&request, None).await;
//! println!("passed: {}", outcome.tests_passed);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod collaborators;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod progress;
pub mod project;
pub mod registry;
pub mod settings;
pub mod stream;

pub use collaborators::{
    FeatureAnalysis, FileTestGenerator, GeneratedTests, ImplementationLocation, ProjectFiles,
    StartupPlanner, StaticPlanner, TestGenerationRequest, TestGenerator,
};
pub use coordinator::{TestRun, VerificationCoordinator, VerificationOutcome, VerificationRequest};
pub use error::{CollaboratorError, SettingsError, StartFailure, VerificationError};
pub use lifecycle::LifecycleManager;
pub use progress::{ProgressEvent, ProgressSink, Stage};
pub use project::{ProjectState, RunningProject};
pub use registry::ProjectRegistry;
pub use settings::{PortAllocation, VeraSettings};
pub use stream::{StreamEvent, VerificationStream};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Vera Core
    pub use crate::{
        LifecycleManager, ProgressSink, ProjectRegistry, StartupPlanner, TestGenerator,
        VerificationCoordinator, VerificationOutcome, VerificationRequest, VeraSettings,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
