//! External collaborators
//!
//! The planner decides how to start a project and the test generator writes
//! the end-to-end tests. Both are usually model-backed; the built-in
//! implementations here serve fixed inputs for local and offline use.

use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vera_sandbox::StartupConfig;

/// Files shown to the planner, in lookup order
pub const CONFIG_FILES: &[&str] = &[
    "package.json",
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yaml",
    "Dockerfile",
    "README.md",
    "pyproject.toml",
    "requirements.txt",
    ".env.example",
    "Makefile",
    "Cargo.toml",
    "go.mod",
];

/// Per-file size limit for planner input
pub const MAX_FILE_BYTES: usize = 5000;

const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Configuration files collected from a project root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectFiles {
    root: PathBuf,
    files: BTreeMap<String, String>,
}

impl ProjectFiles {
    /// Collect [`CONFIG_FILES`] present under `root`
    ///
    /// Unreadable files are skipped. Content is read lossily and truncated to
    /// [`MAX_FILE_BYTES`].
    pub async fn collect(root: &Path) -> Self {
        let mut files = BTreeMap::new();
        for name in CONFIG_FILES {
            let path = root.join(name);
            if !path.is_file() {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let content = String::from_utf8_lossy(&bytes);
                    files.insert((*name).to_string(), truncate(&content));
                }
                Err(e) => {
                    tracing::warn!(file = name, error = %e, "failed to read config file");
                }
            }
        }
        tracing::debug!(root = %root.display(), found = files.len(), "collected config files");
        Self {
            root: root.to_path_buf(),
            files,
        }
    }

    /// Project root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content of one collected file
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    /// Collected files by name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of collected files
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if nothing was found
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files as markdown sections, for prompt construction
    #[must_use]
    pub fn render(&self) -> String {
        self.files
            .iter()
            .map(|(name, content)| format!("## {name}\n```\n{content}\n```"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn truncate(content: &str) -> String {
    if content.len() <= MAX_FILE_BYTES {
        return content.to_string();
    }
    let mut end = MAX_FILE_BYTES;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &content[..end])
}

/// Code location implementing a feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationLocation {
    /// File path relative to the project root
    pub file: String,
    /// Function or method name
    #[serde(default)]
    pub function: String,
    /// Line range, e.g. `13-16`
    #[serde(default)]
    pub lines: String,
}

/// One analysed feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAnalysis {
    /// Feature description
    pub feature_description: String,
    /// Where it is implemented
    #[serde(default)]
    pub implementation_location: Vec<ImplementationLocation>,
}

impl FeatureAnalysis {
    /// One-line summary (`description: file:function, ...`)
    #[must_use]
    pub fn summary(&self) -> String {
        let locations = self
            .implementation_location
            .iter()
            .map(|loc| format!("{}:{}", loc.file, loc.function))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}: {}", self.feature_description, locations)
    }
}

/// Input to the test generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestGenerationRequest {
    /// Original feature requirements
    pub problem_description: String,
    /// Located features
    pub features: Vec<FeatureAnalysis>,
    /// Base address of the running service
    pub service_address: String,
    /// Port the service answers on
    pub service_port: u16,
}

/// Generated test program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTests {
    /// Test source
    pub source: String,
    /// Source language
    pub language: String,
    /// Test framework or client used
    pub framework: String,
}

impl GeneratedTests {
    /// JavaScript tests runnable with plain node
    #[must_use]
    pub fn javascript(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            language: "javascript".to_string(),
            framework: "node-fetch".to_string(),
        }
    }

    /// Extract the first fenced code block from model output
    ///
    /// Output without a fence is taken verbatim.
    #[must_use]
    pub fn from_model_output(output: &str) -> Self {
        Self::javascript(strip_code_fence(output))
    }
}

fn strip_code_fence(output: &str) -> String {
    for fence in ["```javascript", "```js", "```"] {
        if let Some(start) = output.find(fence) {
            let body = &output[start + fence.len()..];
            let end = body.find("```").unwrap_or(body.len());
            return body[..end].trim().to_string();
        }
    }
    output.trim().to_string()
}

/// Decides how to start a project
#[async_trait]
pub trait StartupPlanner: Send + Sync {
    /// Produce a startup plan from the collected files
    async fn plan(&self, files: &ProjectFiles) -> Result<StartupConfig, CollaboratorError>;
}

/// Writes end-to-end tests for a running service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TestGenerator: Send + Sync {
    /// Generate test source
    async fn generate(
        &self,
        request: &TestGenerationRequest,
    ) -> Result<GeneratedTests, CollaboratorError>;
}

/// Planner returning a fixed plan
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    config: StartupConfig,
}

impl StaticPlanner {
    /// Create new planner
    #[inline]
    #[must_use]
    pub fn new(config: StartupConfig) -> Self {
        Self { config }
    }

    /// Load the plan from a `.json` or `.toml` file
    ///
    /// # Errors
    /// - `CollaboratorError::Io` if the file cannot be read
    /// - `CollaboratorError::InvalidResponse` if it does not parse
    pub fn from_file(path: &Path) -> Result<Self, CollaboratorError> {
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str(&text)
                .map_err(|e| CollaboratorError::InvalidResponse(format!("{}: {e}", path.display())))?
        } else {
            toml::from_str(&text)
                .map_err(|e| CollaboratorError::InvalidResponse(format!("{}: {e}", path.display())))?
        };
        Ok(Self::new(config))
    }

    /// The fixed plan
    #[inline]
    #[must_use]
    pub fn config(&self) -> &StartupConfig {
        &self.config
    }
}

#[async_trait]
impl StartupPlanner for StaticPlanner {
    async fn plan(&self, files: &ProjectFiles) -> Result<StartupConfig, CollaboratorError> {
        tracing::debug!(files = files.len(), "static plan");
        Ok(self.config.clone())
    }
}

/// Test generator serving source from a file
#[derive(Debug, Clone)]
pub struct FileTestGenerator {
    path: PathBuf,
}

impl FileTestGenerator {
    /// Create new generator
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TestGenerator for FileTestGenerator {
    async fn generate(
        &self,
        request: &TestGenerationRequest,
    ) -> Result<GeneratedTests, CollaboratorError> {
        let source = tokio::fs::read_to_string(&self.path).await?;
        if source.trim().is_empty() {
            return Err(CollaboratorError::InvalidResponse(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        tracing::debug!(
            path = %self.path.display(),
            service = %request.service_address,
            "serving test source from file"
        );
        Ok(GeneratedTests::from_model_output(&source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use vera_sandbox::StartMethod;

    #[tokio::test]
    async fn collects_only_known_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{\"name\":\"api\"}").unwrap();
        std::fs::write(dir.path().join("Makefile"), "run:\n\tnode index.js\n").unwrap();
        std::fs::write(dir.path().join("index.js"), "console.log(1)").unwrap();

        let files = ProjectFiles::collect(dir.path()).await;

        assert_eq!(files.len(), 2);
        assert_eq!(files.get("package.json"), Some("{\"name\":\"api\"}"));
        assert!(files.get("index.js").is_none());
        assert!(files.render().contains("## Makefile\n```\nrun:"));
    }

    #[tokio::test]
    async fn large_files_are_truncated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.md"), "é".repeat(4000)).unwrap();

        let files = ProjectFiles::collect(dir.path()).await;
        let readme = files.get("README.md").unwrap();

        assert!(readme.ends_with("\n... (truncated)"));
        assert!(readme.len() <= MAX_FILE_BYTES + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn empty_project_collects_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(ProjectFiles::collect(dir.path()).await.is_empty());
    }

    #[test]
    fn code_fences_are_stripped() {
        let output = "Here are the tests:\n```javascript\nconsole.log('ok');\n```\nDone.";
        assert_eq!(
            GeneratedTests::from_model_output(output).source,
            "console.log('ok');"
        );
        assert_eq!(
            GeneratedTests::from_model_output("```\nplain();\n```").source,
            "plain();"
        );
        assert_eq!(GeneratedTests::from_model_output("  raw();  ").source, "raw();");
    }

    #[test]
    fn feature_summary_lists_locations() {
        let feature = FeatureAnalysis {
            feature_description: "Create a channel".into(),
            implementation_location: vec![ImplementationLocation {
                file: "src/channel.resolver.ts".into(),
                function: "createChannel".into(),
                lines: "13-16".into(),
            }],
        };
        assert_eq!(
            feature.summary(),
            "Create a channel: src/channel.resolver.ts:createChannel"
        );
    }

    #[test]
    fn static_planner_loads_json_and_toml() {
        let dir = TempDir::new().unwrap();
        let json = dir.path().join("plan.json");
        std::fs::write(
            &json,
            r#"{"start_method": "docker-compose", "service_port": 8080}"#,
        )
        .unwrap();
        let toml_path = dir.path().join("plan.toml");
        std::fs::write(
            &toml_path,
            "start_method = \"npm\"\nstart_command = \"npm start\"\n",
        )
        .unwrap();

        let from_json = StaticPlanner::from_file(&json).unwrap();
        assert_eq!(from_json.config().start_method, StartMethod::Compose);
        assert_eq!(from_json.config().service_port, 8080);

        let from_toml = StaticPlanner::from_file(&toml_path).unwrap();
        assert_eq!(from_toml.config().start_method, StartMethod::NativeRuntime);
        assert_eq!(from_toml.config().start(), Some("npm start"));

        std::fs::write(&json, "{not json").unwrap();
        assert!(matches!(
            StaticPlanner::from_file(&json),
            Err(CollaboratorError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn file_generator_rejects_empty_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.mjs");
        std::fs::write(&path, "   \n").unwrap();
        let request = TestGenerationRequest {
            problem_description: String::new(),
            features: Vec::new(),
            service_address: "http://localhost:3000".into(),
            service_port: 3000,
        };

        let generator = FileTestGenerator::new(&path);
        assert!(generator.generate(&request).await.is_err());

        std::fs::write(&path, "process.exit(0)\n").unwrap();
        assert_eq!(
            generator.generate(&request).await.unwrap().source,
            "process.exit(0)"
        );
    }
}
