//! The observer interface through which the core reports to its host.
//!
//! The supervisor, scanner, restart coordinator and stats collector never
//! talk to a terminal or UI transport directly; they emit log lines, state
//! transitions and statistics through a `StatusSink` the application owns.

use std::sync::Arc;

use crate::process::ProcessState;
use crate::stats::StatsSnapshot;

pub trait StatusSink: Send + Sync {
    /// A log line for `service` (e.g. `golang`). Project output arrives
    /// already prefixed with `[PROJECT] `.
    fn log(&self, service: &str, message: &str);

    /// A state transition of one project.
    fn status(&self, service: &str, project: &str, state: ProcessState);

    /// A point-in-time resource summary of one project.
    fn stats(&self, snapshot: &StatsSnapshot);
}

pub type SharedSink = Arc<dyn StatusSink>;

/// Formats `message` with the `[PROJECT] ` prefix used for per-project lines.
pub fn project_line(project: &str, message: &str) -> String {
    format!("[{}] {}", project.to_uppercase(), message)
}

#[cfg(test)]
pub mod testing {
    //! A sink that records everything, for assertions in tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Recorded {
        Log { service: String, message: String },
        Status { service: String, project: String, state: ProcessState },
        Stats { project: String, state: ProcessState },
    }

    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<Recorded>>,
    }

    impl RecordingSink {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn events(&self) -> Vec<Recorded> {
            self.events.lock().unwrap().clone()
        }

        /// States reported for `project`, in order.
        pub fn states(&self, project: &str) -> Vec<ProcessState> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Recorded::Status {
                        project: p, state, ..
                    } if p == project => Some(state),
                    _ => None,
                })
                .collect()
        }

        pub fn logs(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Recorded::Log { message, .. } => Some(message),
                    _ => None,
                })
                .collect()
        }
    }

    impl StatusSink for RecordingSink {
        fn log(&self, service: &str, message: &str) {
            self.events.lock().unwrap().push(Recorded::Log {
                service: service.to_string(),
                message: message.to_string(),
            });
        }

        fn status(&self, service: &str, project: &str, state: ProcessState) {
            self.events.lock().unwrap().push(Recorded::Status {
                service: service.to_string(),
                project: project.to_string(),
                state,
            });
        }

        fn stats(&self, snapshot: &StatsSnapshot) {
            self.events.lock().unwrap().push(Recorded::Stats {
                project: snapshot.project.clone(),
                state: snapshot.state,
            });
        }
    }
}
