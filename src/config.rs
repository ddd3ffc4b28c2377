//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file
//! and turns it into the runtime table, supervisor timings and watch settings
//! the rest of the crate consumes. Every field is optional.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::runtime::{RuntimeKind, RuntimeProfile, RuntimeTable};
use crate::supervisor::Timings;
use crate::watch::WatchSettings;

pub const CONFIG_FILE: &str = "devrack.toml";
pub const DEFAULT_BASE_DIR: &str = "public_html";
pub const DEFAULT_RESOURCES_DIR: &str = "resources";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Parent directory of the `<kind>_web` roots.
    pub base_dir: Option<String>,
    /// Location of bundled runtimes, used when `use_system_path` is false.
    pub resources_dir: Option<String>,
    /// Look executables up on `PATH` instead of the resources directory (default: true).
    pub use_system_path: Option<bool>,
    /// Restart projects when their files change (default: true).
    pub watch: Option<bool>,
    /// Quiet period before queued restarts run.
    pub debounce_ms: Option<u64>,
    pub ready_interval_ms: Option<u64>,
    /// How long a stopping process may take before it is killed.
    pub stop_grace_ms: Option<u64>,
    pub settle_ms: Option<u64>,
    /// Period of stats snapshots; 0 disables them.
    pub stats_interval_ms: Option<u64>,
    /// Prepend elapsed time to console lines.
    pub timestamp: Option<bool>,
    /// Glob patterns ignored by the watcher.
    pub watch_ignore: Option<Vec<String>>,
    /// Whether to respect .gitignore when watching (default: false).
    pub watch_ignore_gitignore: Option<bool>,
    /// Per-runtime overrides keyed by runtime name (`go`, `node`, ...).
    #[serde(default)]
    pub runtime: BTreeMap<String, RuntimeConfig>,
}

/// Overrides for a single runtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    pub enabled: Option<bool>,
    /// Command template; `{entry}`, `{port}`, `{cwd}`, `{project}` and
    /// `{web_root}` are substituted per project. Apache and Nginx default to
    /// `httpd.conf` and `nginx.conf` inside the web root, which must listen
    /// on the configured port.
    pub command: Option<String>,
    pub web_root: Option<String>,
    /// Listen port for service runtimes and the Node aggregator.
    pub port: Option<u16>,
    pub ready_timeout_ms: Option<u64>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

impl Config {
    /// Builds a profile for every runtime kind, applying overrides.
    pub fn runtime_table(&self) -> Result<RuntimeTable> {
        for name in self.runtime.keys() {
            if RuntimeKind::from_name(name).is_none() {
                bail!("unknown runtime [runtime.{}] in config", name);
            }
        }
        let base_dir = PathBuf::from(self.base_dir.as_deref().unwrap_or(DEFAULT_BASE_DIR));
        let resources_dir =
            PathBuf::from(self.resources_dir.as_deref().unwrap_or(DEFAULT_RESOURCES_DIR));
        let use_system_path = self.use_system_path.unwrap_or(true);

        let mut profiles = Vec::new();
        for kind in RuntimeKind::ALL {
            let mut profile = RuntimeProfile::new(kind, base_dir.join(kind.default_web_root()));
            if !use_system_path {
                profile.program = resources_dir.join(kind.bundled_program());
            }
            if let Some(overrides) = self.overrides_for(kind) {
                apply_overrides(&mut profile, overrides)?;
            }
            profiles.push(profile);
        }
        Ok(RuntimeTable::new(profiles))
    }

    pub fn timings(&self) -> Timings {
        let defaults = Timings::default();
        Timings {
            ready_interval: millis_or(self.ready_interval_ms, defaults.ready_interval),
            stop_grace: millis_or(self.stop_grace_ms, defaults.stop_grace),
            settle: millis_or(self.settle_ms, defaults.settle),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        let defaults = WatchSettings::default();
        WatchSettings {
            window: millis_or(self.debounce_ms, defaults.window),
            ignore: self.watch_ignore.clone().unwrap_or_default(),
            respect_gitignore: self.watch_ignore_gitignore.unwrap_or(false),
        }
    }

    // Aliases such as `golang` are accepted as table names.
    fn overrides_for(&self, kind: RuntimeKind) -> Option<&RuntimeConfig> {
        self.runtime
            .iter()
            .find(|(name, _)| RuntimeKind::from_name(name) == Some(kind))
            .map(|(_, overrides)| overrides)
    }
}

fn apply_overrides(profile: &mut RuntimeProfile, overrides: &RuntimeConfig) -> Result<()> {
    if let Some(enabled) = overrides.enabled {
        profile.enabled = enabled;
    }
    if let Some(command) = &overrides.command {
        let mut parts = shell_words::split(command)
            .with_context(|| format!("failed to parse command for {}", profile.kind))?;
        if parts.is_empty() {
            return Err(anyhow!("empty command for {}", profile.kind));
        }
        profile.program = PathBuf::from(parts.remove(0));
        profile.args = parts;
    }
    if let Some(web_root) = &overrides.web_root {
        profile.web_root = PathBuf::from(web_root);
    }
    if let Some(port) = overrides.port {
        if port == 0 {
            bail!("port 0 is not valid for {}", profile.kind);
        }
        profile.port = Some(port);
    }
    if let Some(timeout) = overrides.ready_timeout_ms {
        profile.ready_timeout = Duration::from_millis(timeout);
    }
    Ok(())
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
base_dir = "sites"
resources_dir = "bundle"
use_system_path = true
watch = false
debounce_ms = 250
ready_interval_ms = 100
stop_grace_ms = 1500
settle_ms = 50
stats_interval_ms = 2000
timestamp = true
watch_ignore = ["node_modules", "**/*.log"]
watch_ignore_gitignore = true

[runtime.go]
command = "go run -race {entry}"
ready_timeout_ms = 9000

[runtime.nodejs]
port = 4000

[runtime.mysql]
enabled = false
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.watch, Some(false));
        assert_eq!(config.stats_interval_ms, Some(2000));
        assert_eq!(config.timestamp, Some(true));

        let timings = config.timings();
        assert_eq!(timings.ready_interval, Duration::from_millis(100));
        assert_eq!(timings.stop_grace, Duration::from_millis(1500));
        assert_eq!(timings.settle, Duration::from_millis(50));

        let watch = config.watch_settings();
        assert_eq!(watch.window, Duration::from_millis(250));
        assert_eq!(watch.ignore.len(), 2);
        assert!(watch.respect_gitignore);

        let table = config.runtime_table().unwrap();
        let go = table.get(RuntimeKind::Go).unwrap();
        assert_eq!(go.program, PathBuf::from("go"));
        assert_eq!(go.args, vec!["run", "-race", "{entry}"]);
        assert_eq!(go.web_root, PathBuf::from("sites/go_web"));
        assert_eq!(go.ready_timeout, Duration::from_millis(9000));
        assert_eq!(table.get(RuntimeKind::Node).unwrap().port, Some(4000));
        assert!(!table.get(RuntimeKind::MySql).unwrap().enabled);
        assert_eq!(table.enabled().count(), RuntimeKind::ALL.len() - 1);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let timings = config.timings();
        assert_eq!(timings.ready_interval, Duration::from_millis(500));
        assert_eq!(timings.stop_grace, Duration::from_millis(3000));
        let table = config.runtime_table().unwrap();
        let redis = table.get(RuntimeKind::Redis).unwrap();
        assert_eq!(redis.web_root, PathBuf::from("public_html/redis"));
        assert_eq!(redis.port, Some(6379));
        assert_eq!(redis.args, vec!["--port", "{port}"]);
    }

    #[test]
    fn bundled_runtimes_live_under_resources() {
        let config: Config = toml::from_str("use_system_path = false").unwrap();
        let table = config.runtime_table().unwrap();
        let ruby = table.get(RuntimeKind::Ruby).unwrap();
        let expected = format!("resources/ruby/bin/ruby{}", std::env::consts::EXE_SUFFIX);
        assert_eq!(ruby.program, PathBuf::from(expected));
        assert_eq!(ruby.args, vec!["{entry}"]);
    }

    #[test]
    fn rejects_unknown_runtimes_and_empty_commands() {
        let config: Config = toml::from_str("[runtime.cobol]\nport = 1").unwrap();
        assert!(config.runtime_table().is_err());
        let config: Config = toml::from_str("[runtime.go]\ncommand = \"  \"").unwrap();
        assert!(config.runtime_table().is_err());
    }

    #[test]
    fn load_config_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "watch = [").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
