//! Project manifest discovery
//!
//! Locates compose and build manifests, prepares environment files that
//! compose manifests commonly require, and detects the project ecosystem
//! when no runtime image was planned.

use crate::error::SandboxError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Compose manifest names, in lookup order
pub const COMPOSE_MANIFESTS: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// Build manifest names, in lookup order
pub const BUILD_MANIFESTS: &[&str] = &["Dockerfile", "Containerfile"];

/// Example environment files, in lookup order
pub const ENV_EXAMPLES: &[&str] = &[".env.example", ".env.sample", ".env.template"];

/// First candidate that exists as a file in `dir`
#[must_use]
pub fn find_manifest(dir: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Copy the first example environment file to `.env` when none exists
///
/// Returns the source that was copied, if any.
///
/// # Errors
/// Propagates the copy failure.
pub fn prepare_env_file(dir: &Path) -> Result<Option<PathBuf>, SandboxError> {
    let target = dir.join(".env");
    if target.exists() {
        return Ok(None);
    }
    let Some(source) = find_manifest(dir, ENV_EXAMPLES) else {
        return Ok(None);
    };
    std::fs::copy(&source, &target)?;
    tracing::info!(source = %source.display(), "created .env from example");
    Ok(Some(source))
}

/// Parsed compose manifest (only what orchestration needs)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeManifest {
    #[serde(default)]
    services: BTreeMap<String, serde_yaml::Value>,
}

impl ComposeManifest {
    /// Load and validate a compose manifest
    ///
    /// # Errors
    /// - `SandboxError::Io` if the file cannot be read
    /// - `SandboxError::InvalidManifest` if it is not YAML or declares no services
    pub fn load(path: &Path) -> Result<Self, SandboxError> {
        let text = std::fs::read_to_string(path)?;
        let manifest: ComposeManifest =
            serde_yaml::from_str(&text).map_err(|e| SandboxError::InvalidManifest {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if manifest.services.is_empty() {
            return Err(SandboxError::InvalidManifest {
                path: path.to_path_buf(),
                reason: "no services declared".to_string(),
            });
        }
        Ok(manifest)
    }

    /// Declared service names
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

/// Language ecosystem of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    /// Node.js
    Node,
    /// Python
    Python,
    /// Rust
    Rust,
    /// Go
    Go,
    /// Nothing recognised
    Generic,
}

impl Ecosystem {
    /// Detect from marker files in `dir`
    #[must_use]
    pub fn detect(dir: &Path) -> Self {
        let has = |name: &str| dir.join(name).is_file();
        if has("package.json") {
            Ecosystem::Node
        } else if has("pyproject.toml") || has("requirements.txt") {
            Ecosystem::Python
        } else if has("Cargo.toml") {
            Ecosystem::Rust
        } else if has("go.mod") {
            Ecosystem::Go
        } else {
            Ecosystem::Generic
        }
    }

    /// Key used in runtime image tables
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Node => "nodejs",
            Ecosystem::Python => "python",
            Ecosystem::Rust => "rust",
            Ecosystem::Go => "go",
            Ecosystem::Generic => "generic",
        }
    }
}
