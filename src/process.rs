//! Data structures for tracking process state.
//!
//! This module defines the resolved identity of a runnable project
//! (`ProjectDescriptor`), the registry key (`ProcessKey`), the lifecycle state
//! (`ProcessState`) and the supervisor's record of a spawned process
//! (`ManagedProcess`).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::runtime::RuntimeKind;

/// Resolved identity of one runnable project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDescriptor {
    pub kind: RuntimeKind,
    /// Project name: `main` for the web root, otherwise the directory name.
    pub name: String,
    pub entry_path: PathBuf,
    pub working_dir: PathBuf,
    pub port: u16,
}

impl ProjectDescriptor {
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.kind, self.name.clone())
    }
}

/// Registry key: one live process per runtime and project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessKey {
    pub kind: RuntimeKind,
    pub project: String,
}

impl ProcessKey {
    pub fn new(kind: RuntimeKind, project: impl Into<String>) -> Self {
        Self {
            kind,
            project: project.into(),
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.project)
    }
}

/// The current lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Stopped,
    /// Spawned, readiness not yet confirmed.
    Starting,
    Running,
    Stopping,
    /// Startup failed; stays here until an explicit new start.
    Error,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub at: SystemTime,
    /// Failure message for records left in the `Error` state.
    pub detail: Option<String>,
}

impl ExitInfo {
    pub fn new(code: Option<i32>) -> Self {
        Self {
            code,
            at: SystemTime::now(),
            detail: None,
        }
    }
}

/// Supervisor's record of a spawned process.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub descriptor: ProjectDescriptor,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub started_at: Option<SystemTime>,
    pub last_exit: Option<ExitInfo>,
}

impl ManagedProcess {
    pub fn key(&self) -> ProcessKey {
        self.descriptor.key()
    }
}

/// Control side of a spawned child. The child itself is owned by the task
/// waiting on it; this handle can ask that task to kill it and observe when
/// it has exited.
#[derive(Debug, Clone)]
pub(crate) struct ChildHandle {
    pub pid: u32,
    pub kill: Arc<Notify>,
    pub exited: watch::Receiver<Option<ExitInfo>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_joins_kind_and_project() {
        let key = ProcessKey::new(RuntimeKind::Go, "api");
        assert_eq!(key.to_string(), "go/api");
    }

    #[test]
    fn state_serializes_in_upper_case() {
        let json = serde_json::to_string(&ProcessState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        assert_eq!(ProcessState::Error.to_string(), "ERROR");
    }
}
