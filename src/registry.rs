//! The registry of managed processes.
//!
//! One entry per `ProcessKey`. Only the supervisor mutates it (the mutating
//! methods are crate-private); everyone else reads point-in-time snapshots.
//! Critical sections are short and never span an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::process::{ChildHandle, ExitInfo, ManagedProcess, ProcessKey, ProcessState};

struct Entry {
    record: ManagedProcess,
    /// Distinguishes successive spawns for the same key.
    generation: u64,
    child: Option<ChildHandle>,
}

/// Cheaply cloneable handle to the shared process registry.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<ProcessKey, Entry>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessKey, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &ProcessKey) -> Option<ManagedProcess> {
        self.lock().get(key).map(|entry| entry.record.clone())
    }

    pub fn contains(&self, key: &ProcessKey) -> bool {
        self.lock().contains_key(key)
    }

    /// All records, sorted by key.
    pub fn snapshot(&self) -> Vec<ManagedProcess> {
        let mut records = self
            .lock()
            .values()
            .map(|entry| entry.record.clone())
            .collect::<Vec<_>>();
        records.sort_by_key(|record| record.key());
        records
    }

    pub fn keys(&self) -> Vec<ProcessKey> {
        let mut keys = self.lock().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn insert(&self, record: ManagedProcess, generation: u64, child: Option<ChildHandle>) {
        let key = record.key();
        self.lock().insert(
            key,
            Entry {
                record,
                generation,
                child,
            },
        );
    }

    pub(crate) fn child(&self, key: &ProcessKey) -> Option<(u64, Option<ChildHandle>)> {
        self.lock()
            .get(key)
            .map(|entry| (entry.generation, entry.child.clone()))
    }

    /// Updates the state of the entry spawned as `generation`.
    pub(crate) fn set_state(&self, key: &ProcessKey, generation: u64, state: ProcessState) -> bool {
        match self.lock().get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.record.state = state;
                true
            }
            _ => false,
        }
    }

    /// Turns the entry into a childless `Error` record.
    pub(crate) fn mark_failed(&self, key: &ProcessKey, generation: u64, exit: ExitInfo) {
        if let Some(entry) = self.lock().get_mut(key) {
            if entry.generation == generation {
                entry.record.state = ProcessState::Error;
                entry.record.pid = None;
                entry.record.last_exit = Some(exit);
                entry.child = None;
            }
        }
    }

    pub(crate) fn remove(&self, key: &ProcessKey) -> Option<ManagedProcess> {
        self.lock().remove(key).map(|entry| entry.record)
    }

    /// Removes the entry only if it still belongs to `generation` and is in
    /// one of `states`.
    pub(crate) fn remove_if(
        &self,
        key: &ProcessKey,
        generation: u64,
        states: &[ProcessState],
    ) -> Option<ManagedProcess> {
        let mut entries = self.lock();
        let matches = entries
            .get(key)
            .map(|entry| entry.generation == generation && states.contains(&entry.record.state))
            .unwrap_or(false);
        if matches {
            entries.remove(key).map(|entry| entry.record)
        } else {
            None
        }
    }
}
