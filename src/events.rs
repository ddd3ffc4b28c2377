//! Event definitions for the application event loop.
//!
//! Restart requests from the watchers and shutdown signals both arrive on a
//! single channel that the main loop drains.

use crate::watch::RestartRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// Debounced file changes touched a project.
    Restart(RestartRequest),
    /// The supervisor itself was asked to exit.
    Shutdown { signal: ProcessSignal },
}
