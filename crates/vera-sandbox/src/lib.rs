//! Vera Sandbox - isolated execution for verification runs
//!
//! The low-level half of Vera:
//! - Runs shell commands with hard timeouts and whole-tree kill
//! - Polls service readiness against a deadline
//! - Provisions and releases isolated runtimes (compose, image build, native runtime)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use vera_sandbox::CommandExecutor;
//!
//! # async fn example() -> Result<(), vera_sandbox::SandboxError> {
//! let executor = CommandExecutor::new();
//! let result = executor
//!     .run("npm test", std::path::Path::new("."), Duration::from_secs(60))
//!     .await?;
//!
//! println!("exit {} in {}ms", result.exit_code, result.duration_ms);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod backend;
pub mod docker;
pub mod error;
pub mod exec;
pub mod health;
pub mod host;
pub mod manifest;
pub mod types;

pub use backend::{IsolationBackend, Provision};
pub use docker::{DockerBackend, DockerSettings, PathRewrite};
pub use error::{HealthCheckTimeout, SandboxError, TeardownWarning};
pub use exec::{kill_process_group, tail, CommandExecutor, CommandSpec};
pub use health::HealthProber;
pub use host::HostBackend;
pub use manifest::Ecosystem;
pub use types::{ExecutionResult, ProjectId, StartMethod, StartupConfig, Strategy};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
