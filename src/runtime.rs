//! Supported runtimes and their capabilities.
//!
//! Every backend differs only in its executable, entry-file convention, port
//! declaration and readiness semantics. `RuntimeKind` captures the built-in
//! defaults; `RuntimeProfile` is the kind plus whatever `devrack.toml`
//! overrides, and is what the scanner and supervisor consume.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::ProjectDescriptor;

/// A supported backend technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum RuntimeKind {
    Go,
    Node,
    Python,
    Ruby,
    Apache,
    Nginx,
    Redis,
    #[value(name = "mysql")]
    MySql,
}

/// How a freshly spawned process is confirmed to be serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// GET `/` must answer with one of the accepted status codes.
    Http { accepted: &'static [u16] },
    /// A TCP connection must be accepted.
    Tcp,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 8] = [
        RuntimeKind::Go,
        RuntimeKind::Node,
        RuntimeKind::Python,
        RuntimeKind::Ruby,
        RuntimeKind::Apache,
        RuntimeKind::Nginx,
        RuntimeKind::Redis,
        RuntimeKind::MySql,
    ];

    /// Short name used in configuration tables and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            RuntimeKind::Go => "go",
            RuntimeKind::Node => "node",
            RuntimeKind::Python => "python",
            RuntimeKind::Ruby => "ruby",
            RuntimeKind::Apache => "apache",
            RuntimeKind::Nginx => "nginx",
            RuntimeKind::Redis => "redis",
            RuntimeKind::MySql => "mysql",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "go" | "golang" => Some(RuntimeKind::Go),
            "node" | "nodejs" => Some(RuntimeKind::Node),
            "python" => Some(RuntimeKind::Python),
            "ruby" => Some(RuntimeKind::Ruby),
            "apache" | "httpd" => Some(RuntimeKind::Apache),
            "nginx" => Some(RuntimeKind::Nginx),
            "redis" => Some(RuntimeKind::Redis),
            "mysql" => Some(RuntimeKind::MySql),
            _ => None,
        }
    }

    /// Service identifier reported on the status sink.
    pub fn service_name(self) -> &'static str {
        match self {
            RuntimeKind::Go => "golang",
            RuntimeKind::Node => "nodejs",
            other => other.name(),
        }
    }

    /// Entry file whose presence marks a project. Service kinds have none and
    /// expose a single `main` project.
    pub fn entry_file(self) -> Option<&'static str> {
        match self {
            RuntimeKind::Go => Some("index.go"),
            RuntimeKind::Node => Some("index.js"),
            RuntimeKind::Python => Some("index.py"),
            RuntimeKind::Ruby => Some("index.rb"),
            RuntimeKind::Apache | RuntimeKind::Nginx | RuntimeKind::Redis | RuntimeKind::MySql => {
                None
            }
        }
    }

    pub fn default_command(self) -> &'static str {
        match self {
            RuntimeKind::Go => "go run {entry}",
            RuntimeKind::Node => "node {entry} {port}",
            RuntimeKind::Python => "python {entry}",
            RuntimeKind::Ruby => "ruby {entry}",
            RuntimeKind::Apache => "httpd -f {web_root}/httpd.conf -DFOREGROUND",
            RuntimeKind::Nginx => "nginx -p {web_root} -c {web_root}/nginx.conf -g 'daemon off;'",
            RuntimeKind::Redis => "redis-server --port {port}",
            RuntimeKind::MySql => "mysqld --port={port}",
        }
    }

    /// Location of the bundled executable relative to the resources directory.
    pub fn bundled_program(self) -> PathBuf {
        let relative = match self {
            RuntimeKind::Go => "go/bin/go",
            RuntimeKind::Node => "nodejs/node",
            RuntimeKind::Python => "python/python",
            RuntimeKind::Ruby => "ruby/bin/ruby",
            RuntimeKind::Apache => "apache/bin/httpd",
            RuntimeKind::Nginx => "nginx/nginx",
            RuntimeKind::Redis => "redis/redis-server",
            RuntimeKind::MySql => "mysql/bin/mysqld",
        };
        PathBuf::from(format!("{}{}", relative, std::env::consts::EXE_SUFFIX))
    }

    pub fn default_web_root(self) -> &'static str {
        match self {
            RuntimeKind::Go => "go_web",
            RuntimeKind::Node => "node_web",
            RuntimeKind::Python => "python_web",
            RuntimeKind::Ruby => "ruby_web",
            RuntimeKind::Apache => "apache_web",
            RuntimeKind::Nginx => "nginx_web",
            RuntimeKind::Redis => "redis",
            RuntimeKind::MySql => "mysql",
        }
    }

    /// Configured listen port for kinds that do not declare one in source.
    /// For Node this is the port of the `main` aggregator.
    pub fn default_port(self) -> Option<u16> {
        match self {
            RuntimeKind::Node => Some(2999),
            RuntimeKind::Apache => Some(8000),
            RuntimeKind::Nginx => Some(8080),
            RuntimeKind::Redis => Some(6379),
            RuntimeKind::MySql => Some(3306),
            RuntimeKind::Go | RuntimeKind::Python | RuntimeKind::Ruby => None,
        }
    }

    pub fn readiness(self) -> Readiness {
        match self {
            RuntimeKind::Nginx => Readiness::Http {
                accepted: &[200, 403],
            },
            RuntimeKind::Redis | RuntimeKind::MySql => Readiness::Tcp,
            _ => Readiness::Http { accepted: &[200] },
        }
    }

    pub fn default_ready_timeout(self) -> Duration {
        match self {
            RuntimeKind::Go | RuntimeKind::Node | RuntimeKind::Ruby => Duration::from_millis(7000),
            _ => Duration::from_millis(5000),
        }
    }

    /// Whether the `main` project receives its siblings' port map as an
    /// extra argument.
    pub fn aggregates_siblings(self) -> bool {
        self == RuntimeKind::Node
    }

    pub fn is_service(self) -> bool {
        self.entry_file().is_none()
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime kind with configuration applied.
#[derive(Debug, Clone)]
pub struct RuntimeProfile {
    pub kind: RuntimeKind,
    /// Executable to launch (bare name for `PATH` lookup, or a path).
    pub program: PathBuf,
    /// Argument templates; see [`render_template`].
    pub args: Vec<String>,
    pub web_root: PathBuf,
    pub port: Option<u16>,
    pub ready_timeout: Duration,
    pub enabled: bool,
}

impl RuntimeProfile {
    /// Builds a profile from the kind's built-in defaults.
    pub fn new(kind: RuntimeKind, web_root: impl Into<PathBuf>) -> Self {
        // The built-in commands are valid shell words.
        let mut parts = shell_words::split(kind.default_command()).unwrap_or_default();
        let program = if parts.is_empty() {
            PathBuf::from(kind.name())
        } else {
            PathBuf::from(parts.remove(0))
        };
        Self {
            kind,
            program,
            args: parts,
            web_root: web_root.into(),
            port: kind.default_port(),
            ready_timeout: kind.default_ready_timeout(),
            enabled: true,
        }
    }

    /// Renders the argument list for one descriptor. When `siblings` is given
    /// it is appended as a JSON object mapping project names to ports.
    pub fn render_args(
        &self,
        descriptor: &ProjectDescriptor,
        siblings: Option<&BTreeMap<String, u16>>,
    ) -> Vec<String> {
        let mut args = self
            .args
            .iter()
            .map(|arg| render_template(arg, descriptor, &self.web_root))
            .collect::<Vec<_>>();
        if let Some(siblings) = siblings {
            // A BTreeMap<String, u16> always serializes.
            args.push(serde_json::to_string(siblings).unwrap_or_else(|_| "{}".to_string()));
        }
        args
    }
}

// Simple token replacement for command templates.
fn render_template(template: &str, descriptor: &ProjectDescriptor, web_root: &Path) -> String {
    template
        .replace("{web_root}", &web_root.to_string_lossy())
        .replace("{entry}", &descriptor.entry_path.to_string_lossy())
        .replace("{port}", &descriptor.port.to_string())
        .replace("{cwd}", &descriptor.working_dir.to_string_lossy())
        .replace("{project}", &descriptor.name)
}

/// The set of configured runtimes.
#[derive(Debug, Clone, Default)]
pub struct RuntimeTable {
    profiles: BTreeMap<RuntimeKind, RuntimeProfile>,
}

impl RuntimeTable {
    pub fn new(profiles: impl IntoIterator<Item = RuntimeProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.kind, p)).collect(),
        }
    }

    pub fn get(&self, kind: RuntimeKind) -> Option<&RuntimeProfile> {
        self.profiles.get(&kind)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RuntimeProfile> {
        self.profiles.values().filter(|p| p.enabled)
    }

    /// Disables every runtime not in `only` (no-op when `only` is empty).
    pub fn retain_kinds(&mut self, only: &[RuntimeKind]) {
        if only.is_empty() {
            return;
        }
        for profile in self.profiles.values_mut() {
            if !only.contains(&profile.kind) {
                profile.enabled = false;
            }
        }
    }
}

/// Resolves an executable the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn locate_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !std::env::consts::EXE_SUFFIX.is_empty() {
            let mut with_suffix = candidate.into_os_string();
            with_suffix.push(std::env::consts::EXE_SUFFIX);
            let with_suffix = PathBuf::from(with_suffix);
            if with_suffix.is_file() {
                return Some(with_suffix);
            }
        }
    }
    None
}
