//! Per-project resource statistics.
//!
//! The collector reads registry snapshots and samples CPU and resident memory
//! of each process tree with `sysinfo`. Sampling never fails a batch: a key
//! that cannot be sampled is summarized as `ERROR` with the reason.

use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::error::SupervisorError;
use crate::process::{ManagedProcess, ProcessKey, ProcessState};
use crate::registry::ProcessRegistry;

/// One resource reading of a process tree.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSample {
    pub pid: u32,
    /// Sum over the process and its descendants; may exceed 100 on
    /// multi-core machines.
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub sampled_at: SystemTime,
}

/// Point-in-time summary of one project, as delivered to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub service: &'static str,
    pub project: String,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<StatsSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatsSnapshot {
    fn bare(key: &ProcessKey, state: ProcessState) -> Self {
        Self {
            service: key.kind.service_name(),
            project: key.project.clone(),
            state,
            port: None,
            uptime_secs: None,
            sample: None,
            error: None,
        }
    }
}

pub struct StatsCollector {
    registry: ProcessRegistry,
    system: Mutex<System>,
}

impl StatsCollector {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self {
            registry,
            system: Mutex::new(System::new()),
        }
    }

    /// Summarizes one key from the current registry contents.
    pub fn snapshot(&self, key: &ProcessKey) -> StatsSnapshot {
        let record = self.registry.get(key);
        self.summarize(key, record.as_ref())
    }

    /// Summarizes every registered key, sorted by key.
    pub fn snapshot_all(&self) -> Vec<StatsSnapshot> {
        self.refresh();
        self.registry
            .snapshot()
            .iter()
            .map(|record| self.summarize_refreshed(&record.key(), Some(record)))
            .collect()
    }

    pub fn summarize(&self, key: &ProcessKey, record: Option<&ManagedProcess>) -> StatsSnapshot {
        self.refresh();
        self.summarize_refreshed(key, record)
    }

    fn summarize_refreshed(&self, key: &ProcessKey, record: Option<&ManagedProcess>) -> StatsSnapshot {
        let Some(record) = record else {
            return StatsSnapshot::bare(key, ProcessState::Stopped);
        };
        let mut snapshot = StatsSnapshot::bare(key, record.state);
        snapshot.port = Some(record.descriptor.port);
        if record.state == ProcessState::Error {
            snapshot.error = record
                .last_exit
                .as_ref()
                .and_then(|exit| exit.detail.clone());
            return snapshot;
        }
        let Some(pid) = record.pid else {
            return snapshot;
        };
        snapshot.uptime_secs = record
            .started_at
            .and_then(|started| started.elapsed().ok())
            .map(|uptime| uptime.as_secs());
        match self.sample_refreshed(pid) {
            Ok(sample) => snapshot.sample = Some(sample),
            Err(err) => {
                tracing::debug!(%key, "{}", err);
                snapshot.state = ProcessState::Error;
                snapshot.error = Some(err.to_string());
            }
        }
        snapshot
    }

    fn refresh(&self) {
        let mut system = self.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
    }

    /// Samples a pid and its descendants from the last refresh.
    fn sample_refreshed(&self, pid: u32) -> Result<StatsSample, SupervisorError> {
        let system = self.lock();
        let root = Pid::from_u32(pid);
        if system.process(root).is_none() {
            return Err(SupervisorError::Sample {
                pid,
                message: "process not found".to_string(),
            });
        }
        let mut pids = vec![root];
        collect_descendants(&system, root, &mut pids);

        let mut cpu_percent = 0.0f32;
        let mut memory_bytes = 0u64;
        for pid in &pids {
            if let Some(process) = system.process(*pid) {
                cpu_percent += process.cpu_usage();
                memory_bytes += process.memory();
            }
        }
        Ok(StatsSample {
            pid,
            cpu_percent: (cpu_percent * 10.0).round() / 10.0,
            memory_bytes,
            sampled_at: SystemTime::now(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, System> {
        self.system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn collect_descendants(system: &System, parent: Pid, pids: &mut Vec<Pid>) {
    for (pid, process) in system.processes() {
        if process.parent() == Some(parent) && !pids.contains(pid) {
            pids.push(*pid);
            collect_descendants(system, *pid, pids);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::process::{ExitInfo, ProjectDescriptor};
    use crate::runtime::RuntimeKind;

    fn record(pid: Option<u32>, state: ProcessState) -> ManagedProcess {
        ManagedProcess {
            descriptor: ProjectDescriptor {
                kind: RuntimeKind::Python,
                name: "blog".to_string(),
                entry_path: PathBuf::from("index.py"),
                working_dir: PathBuf::from("."),
                port: 4000,
            },
            pid,
            state,
            started_at: Some(SystemTime::now()),
            last_exit: None,
        }
    }

    fn key() -> ProcessKey {
        ProcessKey::new(RuntimeKind::Python, "blog")
    }

    #[test]
    fn unregistered_key_is_stopped() {
        let collector = StatsCollector::new(ProcessRegistry::new());
        let snapshot = collector.snapshot(&key());
        assert_eq!(snapshot.state, ProcessState::Stopped);
        assert_eq!(snapshot.service, "python");
        assert!(snapshot.sample.is_none());
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn failed_start_reports_its_message() {
        let collector = StatsCollector::new(ProcessRegistry::new());
        let mut failed = record(None, ProcessState::Error);
        let mut exit = ExitInfo::new(None);
        exit.detail = Some("python/blog did not respond".to_string());
        failed.last_exit = Some(exit);
        let snapshot = collector.summarize(&key(), Some(&failed));
        assert_eq!(snapshot.state, ProcessState::Error);
        assert_eq!(snapshot.error.as_deref(), Some("python/blog did not respond"));
    }

    #[cfg(unix)]
    #[test]
    fn vanished_pid_is_an_error() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let collector = StatsCollector::new(ProcessRegistry::new());
        let snapshot = collector.summarize(&key(), Some(&record(Some(pid), ProcessState::Running)));
        assert_eq!(snapshot.state, ProcessState::Error);
        assert!(snapshot.error.unwrap().contains("process not found"));
    }

    #[test]
    fn live_pid_is_sampled() {
        let pid = std::process::id();
        let collector = StatsCollector::new(ProcessRegistry::new());
        let snapshot = collector.summarize(&key(), Some(&record(Some(pid), ProcessState::Running)));
        assert_eq!(snapshot.state, ProcessState::Running);
        assert_eq!(snapshot.port, Some(4000));
        assert!(snapshot.uptime_secs.is_some());
        let sample = snapshot.sample.unwrap();
        assert_eq!(sample.pid, pid);
        assert!(sample.memory_bytes > 0);
        assert!(sample.cpu_percent >= 0.0);
    }

    #[test]
    fn snapshot_all_covers_registered_keys() {
        let registry = ProcessRegistry::new();
        registry.insert(record(Some(std::process::id()), ProcessState::Running), 1, None);
        let collector = StatsCollector::new(registry);
        let snapshots = collector.snapshot_all();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].project, "blog");
    }

    #[test]
    fn snapshot_serializes_state_names() {
        let snapshot = StatsSnapshot::bare(&key(), ProcessState::Stopped);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "STOPPED");
        assert_eq!(json["project"], "blog");
        assert!(json.get("sample").is_none());
    }
}
