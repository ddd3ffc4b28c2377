//! Terminal rendition of the status sink.
//!
//! `ConsoleSink` prints project output, state transitions and statistics as
//! prefixed lines, optionally with an elapsed `mm:ss` timestamp and colored
//! state names.

use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

use strip_ansi_escapes::strip;

use crate::process::ProcessState;
use crate::sink::{project_line, StatusSink};
use crate::stats::StatsSnapshot;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Display options for [`ConsoleSink`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOptions {
    /// Prepend the elapsed time since startup to each line.
    pub timestamp: bool,
    /// Colorize state names.
    pub colors: bool,
}

pub struct ConsoleSink {
    options: ConsoleOptions,
    start: Instant,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout(options: ConsoleOptions) -> Self {
        Self::new(options, Box::new(std::io::stdout()))
    }

    pub fn new(options: ConsoleOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            options,
            start: Instant::now(),
            out: Mutex::new(out),
        }
    }

    fn format_prefix(&self, service: &str) -> String {
        let prefix = format!("[{}]", service);
        if self.options.timestamp {
            format!("{} {} ", self.elapsed(), prefix)
        } else {
            format!("{} ", prefix)
        }
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }

    fn state_label(&self, state: ProcessState) -> String {
        if self.options.colors {
            apply_color(state.as_str(), state_color(state))
        } else {
            state.as_str().to_string()
        }
    }

    fn write_line(&self, service: &str, text: &str) {
        let line = format!("{}{}", self.format_prefix(service), text);
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

impl StatusSink for ConsoleSink {
    fn log(&self, service: &str, message: &str) {
        self.write_line(service, message);
    }

    fn status(&self, service: &str, project: &str, state: ProcessState) {
        self.write_line(service, &project_line(project, &self.state_label(state)));
    }

    fn stats(&self, snapshot: &StatsSnapshot) {
        self.write_line(snapshot.service, &format_stats(snapshot, &self.state_label(snapshot.state)));
    }
}

/// One-line rendition of a stats snapshot.
pub fn format_stats(snapshot: &StatsSnapshot, state: &str) -> String {
    let mut text = state.to_string();
    if let Some(sample) = &snapshot.sample {
        text.push_str(&format!(
            " pid {} cpu {:.1}% mem {}",
            sample.pid,
            sample.cpu_percent,
            format_bytes(sample.memory_bytes)
        ));
    }
    if let Some(port) = snapshot.port {
        text.push_str(&format!(" port {}", port));
    }
    if let Some(uptime) = snapshot.uptime_secs {
        text.push_str(&format!(" up {}s", uptime));
    }
    if let Some(error) = &snapshot.error {
        text.push_str(&format!(" ({})", error));
    }
    project_line(&snapshot.project, &text)
}

fn format_bytes(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

fn state_color(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Running => "green",
        ProcessState::Starting | ProcessState::Stopping => "yellow",
        ProcessState::Error => "red",
        ProcessState::Stopped => "gray",
    }
}

fn apply_color(text: &str, color: &str) -> String {
    let code = match color {
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "gray" => "90",
        _ => return text.to_string(),
    };
    format!("\u{1b}[{}m{}\u{1b}[0m", code, text)
}

/// Strips ANSI escape codes from raw output. Invalid UTF-8 sequences are
/// replaced.
pub fn sanitize_text(raw: &[u8]) -> String {
    let decoded = String::from_utf8_lossy(raw);
    let stripped = strip(decoded.as_bytes());
    String::from_utf8_lossy(&stripped).into_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use super::*;
    use crate::stats::StatsSample;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn lines_carry_service_prefix() {
        let captured = Captured::default();
        let sink = ConsoleSink::new(ConsoleOptions::default(), Box::new(captured.clone()));
        sink.log("golang", "[API] listening");
        sink.status("golang", "api", ProcessState::Running);
        assert_eq!(
            captured.text(),
            "[golang] [API] listening\n[golang] [API] RUNNING\n"
        );
    }

    #[test]
    fn timestamp_prefixes_elapsed_time() {
        let captured = Captured::default();
        let options = ConsoleOptions {
            timestamp: true,
            colors: false,
        };
        let sink = ConsoleSink::new(options, Box::new(captured.clone()));
        sink.log("redis", "[MAIN] ready");
        assert_eq!(captured.text(), "00:00 [redis] [MAIN] ready\n");
    }

    #[test]
    fn stats_line_includes_sample_and_port() {
        let snapshot = StatsSnapshot {
            service: "nodejs",
            project: "shop".to_string(),
            state: ProcessState::Running,
            port: Some(3001),
            uptime_secs: Some(42),
            sample: Some(StatsSample {
                pid: 77,
                cpu_percent: 2.5,
                memory_bytes: 3 * 1024 * 1024,
                sampled_at: SystemTime::now(),
            }),
            error: None,
        };
        assert_eq!(
            format_stats(&snapshot, "RUNNING"),
            "[SHOP] RUNNING pid 77 cpu 2.5% mem 3.0 MB port 3001 up 42s"
        );
    }

    #[test]
    fn colored_states_are_wrapped_in_escapes() {
        let captured = Captured::default();
        let options = ConsoleOptions {
            timestamp: false,
            colors: true,
        };
        let sink = ConsoleSink::new(options, Box::new(captured.clone()));
        sink.status("python", "blog", ProcessState::Error);
        assert_eq!(captured.text(), "[python] [BLOG] \u{1b}[31mERROR\u{1b}[0m\n");
        assert_eq!(
            sanitize_text(captured.text().as_bytes()),
            "[python] [BLOG] ERROR\n"
        );
    }

    #[test]
    fn sanitize_replaces_invalid_bytes() {
        assert_eq!(sanitize_text(b"bad \xff byte"), "bad \u{fffd} byte");
    }
}
