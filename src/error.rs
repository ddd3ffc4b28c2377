//! Error taxonomy for the supervisor core.

/// Errors raised while discovering, launching, stopping or sampling projects.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A required executable, entry script or runtime is missing; nothing was spawned.
    #[error("{what} not found: {path}")]
    Config { what: &'static str, path: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process was spawned but never became ready.
    #[error("{key} did not respond on port {port} within {timeout_ms}ms")]
    StartupTimeout {
        key: String,
        port: u16,
        timeout_ms: u64,
    },

    #[error("{key} exited before becoming ready ({})", exit_label(.code))]
    ExitedDuringStartup { key: String, code: Option<i32> },

    /// A running process terminated outside supervisor control.
    #[error("{key} exited unexpectedly ({})", exit_label(.code))]
    RuntimeExit { key: String, code: Option<i32> },

    #[error("failed to signal pid {pid}: {source}")]
    StopSignal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("watch error on {path}: {message}")]
    Watch { path: String, message: String },

    #[error("failed to sample pid {pid}: {message}")]
    Sample { pid: u32, message: String },
}

pub fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "signal".to_string(),
    }
}
