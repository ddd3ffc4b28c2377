//! Process execution and supervision.
//!
//! `ProcessSupervisor` spawns project processes, verifies their readiness,
//! stops them as a process tree, and keeps the `ProcessRegistry` current when
//! a process exits on its own. It is the only writer of process state.
//!
//! Operations on the same key are serialized by a per-key lock, so a `start`
//! issued while a `stop` is in flight waits for the stop to resolve first.
//! Operations on different keys run concurrently.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;

use crate::error::{exit_label, SupervisorError};
use crate::output::{sanitize_text, StreamKind};
use crate::probe::{self, ProbeOutcome};
use crate::process::{
    ChildHandle, ExitInfo, ManagedProcess, ProcessKey, ProcessState, ProjectDescriptor,
};
use crate::registry::ProcessRegistry;
use crate::runtime::{locate_program, RuntimeTable};
use crate::scanner::{self, MAIN_PROJECT};
use crate::sink::{project_line, SharedSink};

/// Consecutive read errors after which an output stream is abandoned.
const MAX_READ_FAILURES: u32 = 8;

/// Fixed delays used by the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Pause between readiness attempts.
    pub ready_interval: Duration,
    /// How long a terminated process may take to exit before it is killed.
    pub stop_grace: Duration,
    /// Pause after a stop before the key is released.
    pub settle: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            ready_interval: Duration::from_millis(500),
            stop_grace: Duration::from_millis(3000),
            settle: Duration::from_millis(500),
        }
    }
}

/// Cloneable handle to the supervisor.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: ProcessRegistry,
    runtimes: RuntimeTable,
    sink: SharedSink,
    timings: Timings,
    locks: Mutex<HashMap<ProcessKey, Arc<tokio::sync::Mutex<()>>>>,
    last_known: Mutex<HashMap<ProcessKey, ProjectDescriptor>>,
    generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(
        registry: ProcessRegistry,
        runtimes: RuntimeTable,
        sink: SharedSink,
        timings: Timings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                runtimes,
                sink,
                timings,
                locks: Mutex::new(HashMap::new()),
                last_known: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn runtimes(&self) -> &RuntimeTable {
        &self.inner.runtimes
    }

    /// Starts a project, stopping any process already registered for its key.
    ///
    /// Resolves to `Running` once the readiness probe succeeds. On failure the
    /// spawned process is killed, the key is left in `Error`, and the error is
    /// returned; there is no automatic retry.
    pub async fn start(&self, descriptor: ProjectDescriptor) -> Result<ProcessState, SupervisorError> {
        let lock = self.key_lock(&descriptor.key());
        let _guard = lock.lock().await;
        self.start_locked(descriptor).await
    }

    /// Stops the project's process tree. Unknown keys are a no-op.
    pub async fn stop(&self, key: &ProcessKey) -> ProcessState {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.stop_locked(key).await
    }

    /// Stops and starts a project again, re-reading its descriptor from disk
    /// and falling back to the last one used.
    pub async fn restart(&self, key: &ProcessKey) -> Result<ProcessState, SupervisorError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let Some(profile) = self.inner.runtimes.get(key.kind).cloned() else {
            return Err(SupervisorError::Config {
                what: "runtime",
                path: key.kind.to_string(),
            });
        };
        let descriptor = match scanner::find(&profile, &key.project) {
            Some(candidate) => {
                scanner::resolve(&profile, &candidate).or_else(|| self.last_known(key))
            }
            None => {
                // The project is gone from disk.
                if self.inner.registry.contains(key) {
                    self.log(key, "Project removed, stopping...");
                }
                return Ok(self.stop_locked(key).await);
            }
        };
        let Some(descriptor) = descriptor else {
            self.log(key, "Port not found, skipping restart.");
            return Ok(self.state_of(key));
        };
        self.log(key, "Restarting...");
        self.start_locked(descriptor).await
    }

    /// Starts many projects concurrently and reports each outcome.
    pub async fn start_all(
        &self,
        descriptors: Vec<ProjectDescriptor>,
    ) -> Vec<(ProcessKey, Result<ProcessState, SupervisorError>)> {
        let mut set = JoinSet::new();
        for descriptor in descriptors {
            let supervisor = self.clone();
            set.spawn(async move {
                let key = descriptor.key();
                let result = supervisor.start(descriptor).await;
                (key, result)
            });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!("start task failed: {}", err),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Stops every registered key concurrently. A key that fails to stop
    /// cleanly does not keep the others from stopping.
    pub async fn stop_all(&self) -> Vec<(ProcessKey, ProcessState)> {
        let mut set = JoinSet::new();
        for key in self.inner.registry.keys() {
            let supervisor = self.clone();
            set.spawn(async move {
                let state = supervisor.stop(&key).await;
                (key, state)
            });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!("stop task failed: {}", err),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    fn key_lock(&self, key: &ProcessKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    fn last_known(&self, key: &ProcessKey) -> Option<ProjectDescriptor> {
        self.inner
            .last_known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn remember(&self, descriptor: &ProjectDescriptor) {
        self.inner
            .last_known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(descriptor.key(), descriptor.clone());
    }

    fn state_of(&self, key: &ProcessKey) -> ProcessState {
        self.inner
            .registry
            .get(key)
            .map(|record| record.state)
            .unwrap_or(ProcessState::Stopped)
    }

    async fn start_locked(&self, descriptor: ProjectDescriptor) -> Result<ProcessState, SupervisorError> {
        let key = descriptor.key();
        self.remember(&descriptor);

        let Some(profile) = self.inner.runtimes.get(key.kind).cloned() else {
            let err = SupervisorError::Config {
                what: "runtime",
                path: key.kind.to_string(),
            };
            return Err(self.reject(&key, err));
        };
        let Some(program) = locate_program(&profile.program) else {
            let err = SupervisorError::Config {
                what: "executable",
                path: profile.program.display().to_string(),
            };
            return Err(self.reject(&key, err));
        };
        if !key.kind.is_service() && !descriptor.entry_path.is_file() {
            let err = SupervisorError::Config {
                what: "entry script",
                path: descriptor.entry_path.display().to_string(),
            };
            return Err(self.reject(&key, err));
        }

        if self.inner.registry.contains(&key) {
            self.log(&key, "Existing process found, stopping before start...");
            self.stop_locked(&key).await;
        }

        let siblings = (profile.kind.aggregates_siblings() && descriptor.name == MAIN_PROJECT)
            .then(|| scanner::sibling_ports(&profile));
        let args = profile.render_args(&descriptor, siblings.as_ref());
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let child = match self.spawn(&key, &program, &args, &descriptor.working_dir, generation) {
            Ok(child) => child,
            Err(err) => return Err(self.reject(&key, err)),
        };
        tracing::info!(%key, pid = child.pid, port = descriptor.port, "spawned");

        let port = descriptor.port;
        self.inner.registry.insert(
            ManagedProcess {
                descriptor,
                pid: Some(child.pid),
                state: ProcessState::Starting,
                started_at: Some(SystemTime::now()),
                last_exit: None,
            },
            generation,
            Some(child.clone()),
        );
        self.emit_status(&key, ProcessState::Starting);
        self.log(
            &key,
            &format!("Waiting for a response from http://localhost:{}...", port),
        );

        let outcome = probe::wait_until_ready(
            profile.kind.readiness(),
            port,
            self.inner.timings.ready_interval,
            profile.ready_timeout,
            child.exited.clone(),
        )
        .await;

        let exited_early = child.exited.borrow().clone();
        let err = match outcome {
            // A response that arrives after the child exited came from
            // some other listener on the port.
            ProbeOutcome::Ready => match exited_early {
                None => {
                    self.inner
                        .registry
                        .set_state(&key, generation, ProcessState::Running);
                    self.emit_status(&key, ProcessState::Running);
                    self.log(&key, "Is running.");
                    return Ok(ProcessState::Running);
                }
                Some(info) => SupervisorError::ExitedDuringStartup {
                    key: key.to_string(),
                    code: info.code,
                },
            },
            ProbeOutcome::TimedOut => SupervisorError::StartupTimeout {
                key: key.to_string(),
                port,
                timeout_ms: profile.ready_timeout.as_millis() as u64,
            },
            ProbeOutcome::Exited(info) => SupervisorError::ExitedDuringStartup {
                key: key.to_string(),
                code: info.code,
            },
        };

        child.kill.notify_one();
        let mut exited = child.exited.clone();
        if !wait_for_exit(&mut exited, self.inner.timings.stop_grace).await {
            tracing::warn!(%key, pid = child.pid, "process did not exit after kill");
        }
        let mut exit = exited.borrow().clone().unwrap_or_else(|| ExitInfo::new(None));
        exit.detail = Some(err.to_string());
        self.inner.registry.mark_failed(&key, generation, exit);
        tracing::warn!(%key, "{}", err);
        self.log(&key, &format!("Failed to start: {}", err));
        self.emit_status(&key, ProcessState::Error);
        Err(err)
    }

    async fn stop_locked(&self, key: &ProcessKey) -> ProcessState {
        let Some((generation, child)) = self.inner.registry.child(key) else {
            return ProcessState::Stopped;
        };
        let Some(child) = child else {
            // A failed start leaves a record without a process.
            self.inner.registry.remove(key);
            self.emit_status(key, ProcessState::Stopped);
            return ProcessState::Stopped;
        };

        self.inner
            .registry
            .set_state(key, generation, ProcessState::Stopping);
        self.log(key, "Stopping...");
        if let Err(source) = terminate_tree(child.pid).await {
            let err = SupervisorError::StopSignal {
                pid: child.pid,
                source,
            };
            tracing::warn!(%key, "{}", err);
            self.log(key, &err.to_string());
        }

        let mut exited = child.exited.clone();
        if !wait_for_exit(&mut exited, self.inner.timings.stop_grace).await {
            tracing::warn!(%key, pid = child.pid, "ignored terminate, killing");
            self.log(key, "Did not stop in time, killing...");
            child.kill.notify_one();
            if !wait_for_exit(&mut exited, self.inner.timings.stop_grace).await {
                tracing::error!(%key, pid = child.pid, "process may still be alive");
            }
        }
        tokio::time::sleep(self.inner.timings.settle).await;

        self.inner.registry.remove_if(
            key,
            generation,
            &[ProcessState::Stopping, ProcessState::Running, ProcessState::Starting],
        );
        self.log(key, "Has stopped.");
        self.emit_status(key, ProcessState::Stopped);
        ProcessState::Stopped
    }

    /// Spawns the command in its own process group and hands the child to a
    /// task that waits for it to exit.
    fn spawn(
        &self,
        key: &ProcessKey,
        program: &Path,
        args: &[String],
        cwd: &Path,
        generation: u64,
    ) -> Result<ChildHandle, SupervisorError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Threading::{
                CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW,
            };
            command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);

        let service = key.kind.service_name();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(
                self.inner.sink.clone(),
                service,
                key.project.clone(),
                StreamKind::Stdout,
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                self.inner.sink.clone(),
                service,
                key.project.clone(),
                StreamKind::Stderr,
                stderr,
            ));
        }

        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);
        let supervisor = self.clone();
        let waiter_key = key.clone();
        let waiter_kill = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = waiter_kill.notified() => {
                    force_kill_tree(pid).await;
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = ExitInfo::new(status.ok().and_then(|status| status.code()));
            let _ = exit_tx.send(Some(info.clone()));
            supervisor.handle_exit(&waiter_key, generation, info).await;
        });

        Ok(ChildHandle {
            pid,
            kill,
            exited: exit_rx,
        })
    }

    /// Called when a spawned process exits. Exits of running processes are
    /// reported here; exits during start or stop belong to that operation.
    ///
    /// Takes the key lock, so an in-flight start settles the record first.
    /// The exit is already published on the child's channel, which any
    /// operation holding the lock is waiting on.
    async fn handle_exit(&self, key: &ProcessKey, generation: u64, info: ExitInfo) {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let removed = self
            .inner
            .registry
            .remove_if(key, generation, &[ProcessState::Running]);
        if removed.is_none() {
            tracing::debug!(%key, generation, "exit handled by in-flight operation");
            return;
        }
        let err = SupervisorError::RuntimeExit {
            key: key.to_string(),
            code: info.code,
        };
        tracing::warn!(at = ?info.at, "{}", err);
        self.log(key, &format!("Process exited ({}).", exit_label(&info.code)));
        self.emit_status(key, ProcessState::Stopped);
    }

    // Reports a failure that happened before anything was spawned.
    fn reject(&self, key: &ProcessKey, err: SupervisorError) -> SupervisorError {
        tracing::warn!(%key, "{}", err);
        self.log(key, &err.to_string());
        self.emit_status(key, ProcessState::Error);
        err
    }

    fn log(&self, key: &ProcessKey, message: &str) {
        self.inner
            .sink
            .log(key.kind.service_name(), &project_line(&key.project, message));
    }

    fn emit_status(&self, key: &ProcessKey, state: ProcessState) {
        tracing::debug!(%key, %state, "status");
        self.inner
            .sink
            .status(key.kind.service_name(), &key.project, state);
    }
}

/// Waits until `exited` reports an exit or `timeout` elapses. Returns whether
/// the process is known to have exited.
async fn wait_for_exit(exited: &mut watch::Receiver<Option<ExitInfo>>, timeout: Duration) -> bool {
    if exited.borrow().is_some() {
        return true;
    }
    // A closed channel means the waiter task is gone together with the child.
    tokio::time::timeout(timeout, exited.wait_for(|info| info.is_some()))
        .await
        .is_ok()
}

/// Forwards one output stream line by line until EOF. The pipe stays open
/// for as long as the child writes to it, whatever bytes it contains.
async fn forward_output<R>(
    sink: SharedSink,
    service: &'static str,
    project: String,
    stream: StreamKind,
    reader: R,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut failures = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => failures = 0,
            Err(err) => {
                failures += 1;
                tracing::debug!(%project, ?stream, "read error: {}", err);
                if failures >= MAX_READ_FAILURES {
                    break;
                }
                continue;
            }
        }
        let text = sanitize_text(&buf);
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }
        let message = match stream {
            StreamKind::Stdout => project_line(&project, text),
            StreamKind::Stderr => project_line(&project, &format!("ERROR: {}", text)),
        };
        sink.log(service, &message);
    }
}

/// Sends the terminate signal to the process group and the process itself.
#[cfg(unix)]
async fn terminate_tree(pid: u32) -> std::io::Result<()> {
    signal_tree(pid, libc::SIGTERM)
}

#[cfg(unix)]
async fn force_kill_tree(pid: u32) {
    let _ = signal_tree(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_tree(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    if pid == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "process has no pid",
        ));
    }
    let pid = pid as i32;
    let group = unsafe { libc::kill(-pid, signal) };
    let direct = unsafe { libc::kill(pid, signal) };
    if group == 0 || direct == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(windows)]
async fn terminate_tree(pid: u32) -> std::io::Result<()> {
    taskkill(pid, false).await
}

#[cfg(windows)]
async fn force_kill_tree(pid: u32) {
    let _ = taskkill(pid, true).await;
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) -> std::io::Result<()> {
    let mut command = Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        command.arg("/F");
    }
    let status = command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {}", status)))
    }
}

#[cfg(not(any(unix, windows)))]
async fn terminate_tree(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
async fn force_kill_tree(_pid: u32) {}
