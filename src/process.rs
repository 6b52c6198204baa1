//! Data structures for tracking project state.
//!
//! A project is a named step sequence with a working directory. `ProjectState` holds what the
//! UI knows about its current or most recent run.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::output::OutputBuffer;
use crate::runner::RunId;
use crate::sequence::Step;

/// Identifier of a project; at most one process runs per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawKey", into = "String")]
pub struct ProjectKey(String);

// Config files written by older tools use numeric ids.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawKey {
    Text(String),
    Number(i64),
}

impl From<RawKey> for ProjectKey {
    fn from(raw: RawKey) -> Self {
        match raw {
            RawKey::Text(text) => ProjectKey(text),
            RawKey::Number(number) => ProjectKey(number.to_string()),
        }
    }
}

impl From<ProjectKey> for String {
    fn from(key: ProjectKey) -> Self {
        key.0
    }
}

impl ProjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Specification for a project to be run.
#[derive(Debug, Clone)]
pub struct ProjectSpec {
    pub key: ProjectKey,
    /// Friendly name for the project.
    pub name: String,
    /// Working directory; the current directory when unset.
    pub working_dir: Option<PathBuf>,
    /// Steps run in order, each only if the previous one succeeded.
    pub steps: Vec<Step>,
}

/// The current lifecycle status of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectStatus {
    /// Never started in this session.
    Idle,
    /// Process is actively running.
    Running,
    /// Termination was requested; waiting for the exit notification.
    Stopping,
    /// Process has exited.
    Exited { code: Option<i32> },
    /// Process could not be started.
    Failed { error: String },
}

/// Runtime state of a single project.
#[derive(Debug, Clone)]
pub struct ProjectState {
    pub spec: ProjectSpec,
    pub status: ProjectStatus,
    /// Run currently owned by this project, if any.
    pub run: Option<RunId>,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub output: OutputBuffer,
    /// Current scroll position in the output view.
    pub scroll: usize,
    /// Whether the output view follows new lines.
    pub follow: bool,
}

impl ProjectState {
    pub fn new(spec: ProjectSpec, max_lines: usize) -> Self {
        Self {
            spec,
            status: ProjectStatus::Idle,
            run: None,
            pid: None,
            started_at: None,
            output: OutputBuffer::new(max_lines),
            scroll: 0,
            follow: true,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, ProjectStatus::Running | ProjectStatus::Stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        id: ProjectKey,
    }

    #[test]
    fn keys_accept_strings_and_numbers() {
        let text: Holder = serde_json::from_str(r#"{"id":"api"}"#).unwrap();
        assert_eq!(text.id, ProjectKey::new("api"));
        let number: Holder = serde_json::from_str(r#"{"id":1712345678901}"#).unwrap();
        assert_eq!(number.id.as_str(), "1712345678901");
    }

    #[test]
    fn keys_serialize_as_strings() {
        let json = serde_json::to_string(&ProjectKey::new("7")).unwrap();
        assert_eq!(json, "\"7\"");
    }
}
