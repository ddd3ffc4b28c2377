//! File watching and auto-restart.
//!
//! A watcher thread per runtime web root turns filesystem notifications into
//! `ChangeEvent`s. The `RestartCoordinator` maps each event to the project it
//! touched, collects projects while changes keep arriving, and emits one
//! `RestartRequest` per project once the tree has been quiet for the debounce
//! window.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::SupervisorError;
use crate::events::Event;
use crate::process::ProcessKey;
use crate::runtime::{RuntimeKind, RuntimeProfile};
use crate::scanner::MAIN_PROJECT;
use crate::sink::{project_line, SharedSink};

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        }
    }
}

/// A filesystem change below a watched web root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// A debounced request to restart one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub key: ProcessKey,
    /// The first change that queued the request.
    pub reason: String,
    pub queued_at: Instant,
}

/// Watch settings shared by every runtime.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub window: Duration,
    pub ignore: Vec<String>,
    pub respect_gitignore: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            ignore: Vec::new(),
            respect_gitignore: false,
        }
    }
}

/// Debounces change events for one runtime into restart requests.
pub struct RestartCoordinator {
    kind: RuntimeKind,
    root: PathBuf,
    window: Duration,
    matcher: IgnoreMatcher,
}

impl RestartCoordinator {
    pub fn new(profile: &RuntimeProfile, settings: &WatchSettings) -> Result<Self> {
        let matcher = IgnoreMatcher::new(
            &profile.web_root,
            &settings.ignore,
            settings.respect_gitignore,
        )?;
        Ok(Self {
            kind: profile.kind,
            root: profile.web_root.clone(),
            window: settings.window,
            matcher,
        })
    }

    /// Maps a changed path to the project it belongs to: the first path
    /// segment below the web root, or `main` for files directly in it.
    /// Hidden and ignored paths map to nothing.
    ///
    /// A top-level path that no longer exists counts as a file only when it
    /// looks like one of the runtime's sources; anything else was a project
    /// directory.
    pub fn project_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_string_lossy();
                    if part.starts_with('.') {
                        return None;
                    }
                    parts.push(part.into_owned());
                }
                _ => return None,
            }
        }
        if parts.is_empty() || self.matcher.is_ignored(path) {
            return None;
        }
        if parts.len() == 1 && self.is_root_file(path) {
            return Some(MAIN_PROJECT.to_string());
        }
        parts.into_iter().next()
    }

    fn is_root_file(&self, path: &Path) -> bool {
        if path.exists() {
            return !path.is_dir();
        }
        let Some(entry) = self.kind.entry_file() else {
            return false;
        };
        let entry = Path::new(entry);
        path.file_name() == entry.file_name()
            || (path.extension().is_some() && path.extension() == entry.extension())
    }

    /// Consumes change events until the stream closes, forwarding restart
    /// requests to the event loop.
    pub async fn run(self, mut changes: mpsc::Receiver<ChangeEvent>, tx: mpsc::Sender<Event>) {
        let mut pending: BTreeMap<String, (String, Instant)> = BTreeMap::new();
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                change = changes.recv() => {
                    let Some(change) = change else {
                        break;
                    };
                    let Some(project) = self.project_for(&change.path) else {
                        continue;
                    };
                    let now = Instant::now();
                    let reason = self.describe(&change);
                    tracing::debug!(kind = %self.kind, %project, "{}", reason);
                    pending.entry(project).or_insert((reason, now));
                    deadline = Some(now + self.window);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    for (project, (reason, queued_at)) in std::mem::take(&mut pending) {
                        let request = RestartRequest {
                            key: ProcessKey::new(self.kind, project),
                            reason,
                            queued_at,
                        };
                        if tx.send(Event::Restart(request)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn describe(&self, change: &ChangeEvent) -> String {
        let relative = change.path.strip_prefix(&self.root).unwrap_or(&change.path);
        format!("{} {}", relative.display(), change.kind.as_str())
    }
}

/// Starts watching the profile's web root and spawns a coordinator for it.
/// The watcher lives on its own thread for as long as the coordinator runs.
pub fn spawn_watcher(
    profile: &RuntimeProfile,
    settings: &WatchSettings,
    tx: mpsc::Sender<Event>,
    sink: SharedSink,
) -> Result<()> {
    let coordinator = RestartCoordinator::new(profile, settings)?;
    let root = profile.web_root.clone();
    let service = profile.kind.service_name();
    let (change_tx, change_rx) = mpsc::channel(256);

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;

    tokio::spawn(coordinator.run(change_rx, tx));
    sink.log(
        service,
        &project_line("WATCHER", &format!("Watching {} projects...", service)),
    );

    std::thread::spawn(move || {
        let _watcher = watcher;
        while let Ok(res) = raw_rx.recv() {
            match res {
                Ok(event) => {
                    for change in changes_from(event) {
                        if change_tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let err = SupervisorError::Watch {
                        path: root.display().to_string(),
                        message: err.to_string(),
                    };
                    tracing::warn!("{}", err);
                    sink.log(service, &project_line("WATCHER", &format!("Watcher error: {}", err)));
                }
            }
        }
    });
    Ok(())
}

fn changes_from(event: NotifyEvent) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .map(|path| ChangeEvent { path, kind })
        .collect()
}

struct IgnoreMatcher {
    // Combines explicit ignore globs with optional gitignore rules.
    base: PathBuf,
    globset: Option<GlobSet>,
    gitignore: Option<Gitignore>,
}

impl IgnoreMatcher {
    fn new(base: &Path, patterns: &[String], respect_gitignore: bool) -> Result<Self> {
        let globset = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                for expanded in expand_pattern(pattern) {
                    builder.add(
                        Glob::new(&expanded)
                            .with_context(|| format!("invalid watch_ignore pattern {}", pattern))?,
                    );
                }
            }
            Some(builder.build()?)
        };

        let gitignore = if respect_gitignore {
            Some(build_gitignore(base)?)
        } else {
            None
        };

        Ok(Self {
            base: base.to_path_buf(),
            globset,
            gitignore,
        })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if let Some(globset) = &self.globset {
            if globset.is_match(path) {
                return true;
            }
            if let Ok(relative) = path.strip_prefix(&self.base) {
                // bare names like `node_modules` match at any depth
                if globset.is_match(relative)
                    || relative
                        .components()
                        .any(|part| globset.is_match(Path::new(part.as_os_str())))
                {
                    return true;
                }
            }
        }
        if let Some(gitignore) = &self.gitignore {
            if path.starts_with(&self.base)
                && gitignore
                    .matched_path_or_any_parents(path, path.is_dir())
                    .is_ignore()
            {
                return true;
            }
        }
        false
    }
}

fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim_end_matches('/');
    let has_glob = pattern.contains('*') || pattern.contains('?') || pattern.contains('[');
    if has_glob {
        vec![pattern.to_string()]
    } else {
        vec![trimmed.to_string(), format!("{}/**", trimmed)]
    }
}

fn build_gitignore(base: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(base);
    for ancestor in base.ancestors() {
        let path = ancestor.join(".gitignore");
        if path.exists() {
            builder.add(path);
        }
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(root: &Path, ignore: &[&str], window: Duration) -> RestartCoordinator {
        let profile = RuntimeProfile::new(RuntimeKind::Go, root);
        let settings = WatchSettings {
            window,
            ignore: ignore.iter().map(|s| s.to_string()).collect(),
            respect_gitignore: false,
        };
        RestartCoordinator::new(&profile, &settings).unwrap()
    }

    fn modified(path: PathBuf) -> ChangeEvent {
        ChangeEvent {
            path,
            kind: ChangeKind::Modified,
        }
    }

    #[test]
    fn paths_map_to_their_project() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("api/handlers")).unwrap();
        let coordinator = coordinator(root, &["node_modules"], DEFAULT_WINDOW);

        assert_eq!(
            coordinator.project_for(&root.join("api/handlers/users.go")),
            Some("api".to_string())
        );
        assert_eq!(coordinator.project_for(&root.join("index.go")), Some("main".to_string()));
        // a new project directory restarts that project, not main
        assert_eq!(coordinator.project_for(&root.join("api")), Some("api".to_string()));
        assert_eq!(coordinator.project_for(&root.join(".git/HEAD")), None);
        assert_eq!(coordinator.project_for(&root.join("api/.env")), None);
        assert_eq!(
            coordinator.project_for(&root.join("web/node_modules/x/index.js")),
            None
        );
        assert_eq!(coordinator.project_for(Path::new("/elsewhere/index.go")), None);
        assert_eq!(coordinator.project_for(root), None);
    }

    #[test]
    fn removed_top_level_paths_map_by_shape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("api")).unwrap();
        std::fs::write(root.join("api/index.go"), "port := \"5001\"\n").unwrap();
        let coordinator = coordinator(root, &[], DEFAULT_WINDOW);

        std::fs::remove_dir_all(root.join("api")).unwrap();
        assert_eq!(coordinator.project_for(&root.join("api")), Some("api".to_string()));
        assert_eq!(
            coordinator.project_for(&root.join("api/index.go")),
            Some("api".to_string())
        );
        // deleted root sources still belong to main
        assert_eq!(coordinator.project_for(&root.join("index.go")), Some("main".to_string()));
        assert_eq!(coordinator.project_for(&root.join("helpers.go")), Some("main".to_string()));
    }

    #[test]
    fn gitignore_rules_apply_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join(".gitignore"), "*.log\n").unwrap();
        let profile = RuntimeProfile::new(RuntimeKind::Go, root);
        let settings = WatchSettings {
            respect_gitignore: true,
            ..WatchSettings::default()
        };
        let coordinator = RestartCoordinator::new(&profile, &settings).unwrap();
        assert_eq!(coordinator.project_for(&root.join("api/server.log")), None);
        assert_eq!(
            coordinator.project_for(&root.join("api/server.go")),
            Some("api".to_string())
        );
    }

    #[test]
    fn expand_pattern_adds_recursive_glob_for_dirs() {
        assert_eq!(
            expand_pattern("vendor/"),
            vec!["vendor".to_string(), "vendor/**".to_string()]
        );
        assert_eq!(expand_pattern("*.tmp"), vec!["*.tmp".to_string()]);
    }

    #[test]
    fn notify_events_translate_to_changes() {
        let event = NotifyEvent::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/srv/go_web/api/index.go"));
        assert_eq!(
            changes_from(event),
            vec![ChangeEvent {
                path: PathBuf::from("/srv/go_web/api/index.go"),
                kind: ChangeKind::Removed,
            }]
        );
        let access = NotifyEvent::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/srv/go_web/api/index.go"));
        assert!(changes_from(access).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_collapses_into_one_restart() {
        let root = PathBuf::from("/srv/go_web");
        let coordinator = coordinator(&root, &[], Duration::from_millis(1000));
        let (change_tx, change_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(coordinator.run(change_rx, tx));

        let started = Instant::now();
        let mut last = 0;
        for at in [0u64, 200, 400, 600, 900] {
            tokio::time::sleep(Duration::from_millis(at - last)).await;
            last = at;
            change_tx
                .send(modified(root.join("api/main.go")))
                .await
                .unwrap();
        }

        let Some(Event::Restart(request)) = rx.recv().await else {
            panic!("expected a restart request");
        };
        let fired = started.elapsed();
        assert!(fired >= Duration::from_millis(1900), "{:?}", fired);
        assert!(fired < Duration::from_millis(1950), "{:?}", fired);
        assert_eq!(request.key, ProcessKey::new(RuntimeKind::Go, "api"));
        assert_eq!(request.reason, "api/main.go modified");
        assert!(request.queued_at < started + Duration::from_millis(100));

        // nothing else was queued
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn each_changed_project_restarts_once() {
        let root = PathBuf::from("/srv/go_web");
        let coordinator = coordinator(&root, &[], Duration::from_millis(1000));
        let (change_tx, change_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(coordinator.run(change_rx, tx));

        for path in ["worker/a.go", "api/b.go", "worker/c.go", "index.go"] {
            change_tx.send(modified(root.join(path))).await.unwrap();
        }
        let mut projects = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(Event::Restart(request)) => projects.push(request.key.project),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(projects, vec!["api", "main", "worker"]);
    }
}
