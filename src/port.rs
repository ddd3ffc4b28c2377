//! Port declaration parsing.
//!
//! Script runtimes declare their listen port with a literal assignment near
//! the top of the entry file. Grammar per kind (case-insensitive, first
//! match wins):
//!
//! - Go:     `port := "5000"` (single or double quotes required)
//! - Node:   `const port = 5000` (also `let` / `var`)
//! - Python: `port = 5000`
//! - Ruby:   `PORT = 5000` (quotes optional)
//!
//! Anything else, including computed ports, is treated as "not declared".

use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::runtime::RuntimeKind;

/// Only this many leading bytes of an entry file are inspected.
const PREFIX_LIMIT: u64 = 16 * 1024;

fn pattern(kind: RuntimeKind) -> Option<&'static Regex> {
    static GO: OnceLock<Option<Regex>> = OnceLock::new();
    static NODE: OnceLock<Option<Regex>> = OnceLock::new();
    static PYTHON: OnceLock<Option<Regex>> = OnceLock::new();
    static RUBY: OnceLock<Option<Regex>> = OnceLock::new();
    let (cell, source) = match kind {
        RuntimeKind::Go => (&GO, r#"(?i)port\s*:=\s*["'](\d+)["']"#),
        RuntimeKind::Node => (&NODE, r"(?i)\b(?:const|let|var)\s+port\s*=\s*(\d+)\b"),
        RuntimeKind::Python => (&PYTHON, r"(?i)port\s*=\s*(\d+)"),
        RuntimeKind::Ruby => (&RUBY, r#"(?i)PORT\s*=\s*["']?(\d+)["']?"#),
        _ => return None,
    };
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

/// Extracts the declared port from entry-script text.
pub fn extract_port(kind: RuntimeKind, text: &str) -> Option<u16> {
    let captures = pattern(kind)?.captures(text)?;
    let port = captures.get(1)?.as_str().parse::<u16>().ok()?;
    (port != 0).then_some(port)
}

/// Reads the head of `entry` and extracts its declared port.
pub fn resolve_port(kind: RuntimeKind, entry: &Path) -> Option<u16> {
    let text = match read_prefix(entry) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!("failed to read port from {}: {}", entry.display(), err);
            return None;
        }
    };
    extract_port(kind, &text)
}

fn read_prefix(path: &Path) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut buffer = Vec::new();
    file.take(PREFIX_LIMIT).read_to_end(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
