//! Registry of live project instances
//!
//! Identifiers are reserved at creation and released at teardown, so two
//! concurrent creations never share a namespace even before either is
//! registered as started.

use crate::project::RunningProject;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use vera_sandbox::ProjectId;

/// Live project instances, keyed by id
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    /// Started projects
    projects: DashMap<ProjectId, Arc<RunningProject>>,
    /// Every id in use, started or not
    reserved: DashSet<ProjectId>,
}

impl ProjectRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh identifier
    pub fn reserve(&self) -> ProjectId {
        loop {
            let id = ProjectId::generate();
            if self.reserved.insert(id.clone()) {
                return id;
            }
            tracing::debug!(project_id = %id, "project id collision, regenerating");
        }
    }

    /// Register a started project
    pub fn insert(&self, project: Arc<RunningProject>) {
        self.reserved.insert(project.id().clone());
        self.projects.insert(project.id().clone(), project);
    }

    /// Remove a project and release its id
    pub fn remove(&self, id: &ProjectId) -> Option<Arc<RunningProject>> {
        self.reserved.remove(id);
        self.projects.remove(id).map(|(_, project)| project)
    }

    /// Look up a started project
    #[must_use]
    pub fn get(&self, id: &ProjectId) -> Option<Arc<RunningProject>> {
        self.projects.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Check if an id is in use
    #[inline]
    #[must_use]
    pub fn is_reserved(&self, id: &ProjectId) -> bool {
        self.reserved.contains(id)
    }

    /// Started projects
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<RunningProject>> {
        self.projects
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of started projects
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Check if no project is started
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Number of ids in use
    #[inline]
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }
}
