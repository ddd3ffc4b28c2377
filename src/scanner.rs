//! Project discovery.
//!
//! A runtime's web root is project `main` when it directly contains the
//! kind's entry file; every immediate sub-directory containing the entry file
//! is a project named after the directory. Service kinds have no entry file
//! and expose `main` whenever the web root exists.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::port;
use crate::process::ProjectDescriptor;
use crate::runtime::RuntimeProfile;
use crate::sink::{project_line, StatusSink};

pub const MAIN_PROJECT: &str = "main";

/// A discovered project whose port has not been resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCandidate {
    pub name: String,
    pub entry_path: PathBuf,
    pub working_dir: PathBuf,
}

/// Lists the projects under the profile's web root, sorted by name.
/// A missing web root yields an empty list.
pub fn scan(profile: &RuntimeProfile) -> Vec<ProjectCandidate> {
    let root = &profile.web_root;
    if !root.is_dir() {
        return Vec::new();
    }
    let Some(entry_file) = profile.kind.entry_file() else {
        return vec![ProjectCandidate {
            name: MAIN_PROJECT.to_string(),
            entry_path: root.clone(),
            working_dir: root.clone(),
        }];
    };

    let mut projects = BTreeMap::new();
    let root_entry = root.join(entry_file);
    if root_entry.is_file() {
        projects.insert(
            MAIN_PROJECT.to_string(),
            ProjectCandidate {
                name: MAIN_PROJECT.to_string(),
                entry_path: root_entry,
                working_dir: root.clone(),
            },
        );
    }

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("failed to read {}: {}", root.display(), err);
            return projects.into_values().collect();
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let script = path.join(entry_file);
        if !script.is_file() {
            continue;
        }
        if projects.contains_key(&name) {
            tracing::warn!(
                "{}: directory {} shadows the root project, skipping",
                profile.kind,
                path.display()
            );
            continue;
        }
        projects.insert(
            name.clone(),
            ProjectCandidate {
                name,
                entry_path: script,
                working_dir: path,
            },
        );
    }
    projects.into_values().collect()
}

/// Finds a single project by name, re-reading the filesystem.
pub fn find(profile: &RuntimeProfile, name: &str) -> Option<ProjectCandidate> {
    scan(profile).into_iter().find(|candidate| candidate.name == name)
}

/// Resolves the candidate's port. Script kinds read the entry file; service
/// kinds and the Node `main` aggregator fall back to the configured port.
pub fn resolve(profile: &RuntimeProfile, candidate: &ProjectCandidate) -> Option<ProjectDescriptor> {
    let kind = profile.kind;
    let declared = if kind.is_service() {
        None
    } else {
        port::resolve_port(kind, &candidate.entry_path)
    };
    let port = declared.or_else(|| {
        let uses_config =
            kind.is_service() || (kind.aggregates_siblings() && candidate.name == MAIN_PROJECT);
        if uses_config {
            profile.port
        } else {
            None
        }
    })?;
    Some(ProjectDescriptor {
        kind,
        name: candidate.name.clone(),
        entry_path: candidate.entry_path.clone(),
        working_dir: candidate.working_dir.clone(),
        port,
    })
}

/// Scans and resolves every project of a runtime. Projects without a port are
/// skipped with a warning on the sink; port collisions are reported but not
/// prevented.
pub fn resolve_all(profile: &RuntimeProfile, sink: Option<&dyn StatusSink>) -> Vec<ProjectDescriptor> {
    let service = profile.kind.service_name();
    let mut descriptors = Vec::new();
    for candidate in scan(profile) {
        match resolve(profile, &candidate) {
            Some(descriptor) => descriptors.push(descriptor),
            None => {
                tracing::warn!("{}/{}: no port declared", profile.kind, candidate.name);
                if let Some(sink) = sink {
                    sink.log(service, &project_line(&candidate.name, "No port found, skipping"));
                }
            }
        }
    }

    let mut by_port: HashMap<u16, Vec<&str>> = HashMap::new();
    for descriptor in &descriptors {
        by_port
            .entry(descriptor.port)
            .or_default()
            .push(descriptor.name.as_str());
    }
    for (port, names) in by_port.into_iter().filter(|(_, names)| names.len() > 1) {
        let message = format!("Port {} is declared by {}", port, names.join(", "));
        tracing::warn!("{}: {}", profile.kind, message);
        if let Some(sink) = sink {
            sink.log(service, &message);
        }
    }
    descriptors
}

/// Ports of every resolvable project except `main`, for the aggregator.
pub fn sibling_ports(profile: &RuntimeProfile) -> BTreeMap<String, u16> {
    resolve_all(profile, None)
        .into_iter()
        .filter(|descriptor| descriptor.name != MAIN_PROJECT)
        .map(|descriptor| (descriptor.name, descriptor.port))
        .collect()
}
