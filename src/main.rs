//! devrack: a local development supervisor for multi-runtime web projects.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, discovers projects under each runtime's
//! web root, starts them, and runs the event loop that drives restarts,
//! statistics and shutdown.

mod config;
mod error;
mod events;
mod logging;
mod output;
mod port;
mod probe;
mod process;
mod registry;
mod runtime;
mod scanner;
mod sink;
mod stats;
mod supervisor;
mod watch;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Interval;

use crate::events::{Event, ProcessSignal};
use crate::output::{ConsoleOptions, ConsoleSink};
use crate::registry::ProcessRegistry;
use crate::runtime::{RuntimeKind, RuntimeTable};
use crate::sink::SharedSink;
use crate::stats::StatsCollector;
use crate::supervisor::{ProcessSupervisor, Timings};
use crate::watch::WatchSettings;

/// Service name used for the supervisor's own messages.
const SERVICE: &str = "devrack";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Runs and watches Go, Node, Python, Ruby, Apache, Nginx, Redis and MySQL projects",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to devrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any devrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Only manage these runtimes (repeatable).
    #[arg(long = "runtime", value_enum, global = true)]
    runtimes: Vec<RuntimeKind>,
    /// Do not restart projects when their files change.
    #[arg(long)]
    no_watch: bool,
    /// Prepend elapsed time to each line.
    #[arg(long)]
    timestamp: bool,
    /// Diagnostic log filter (e.g. "info", "devrack=debug"); RUST_LOG wins.
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Print resource statistics every N milliseconds (0 disables).
    #[arg(long)]
    stats_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Start every project and watch for changes (default).
    Run,
    /// Print the projects that would be started.
    Scan,
    /// Show version information.
    Version,
}

/// Everything `run` needs, merged from the config file and the command line.
struct Settings {
    runtimes: RuntimeTable,
    timings: Timings,
    watch: Option<WatchSettings>,
    stats_interval: Option<Duration>,
    console: ConsoleOptions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Version => {
            println!("devrack {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Scan => {
            logging::init(cli.log_level.as_deref())?;
            let settings = load_settings(&cli)?;
            print_scan(&settings.runtimes);
            Ok(())
        }
        Commands::Run => {
            logging::init(cli.log_level.as_deref())?;
            let settings = load_settings(&cli)?;
            run(settings).await
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let sink: SharedSink = Arc::new(ConsoleSink::stdout(settings.console));
    let registry = ProcessRegistry::new();
    let supervisor = ProcessSupervisor::new(
        registry.clone(),
        settings.runtimes.clone(),
        sink.clone(),
        settings.timings,
    );
    let (tx, mut rx) = mpsc::channel::<Event>(256);
    spawn_signal_listener(tx.clone());

    let mut descriptors = Vec::new();
    for profile in settings.runtimes.enabled() {
        if !profile.web_root.is_dir() {
            tracing::info!(
                "{}: web root {} not found, skipping",
                profile.kind,
                profile.web_root.display()
            );
            continue;
        }
        descriptors.extend(scanner::resolve_all(profile, Some(sink.as_ref())));
        if let Some(watch_settings) = &settings.watch {
            if profile.kind.is_service() {
                continue;
            }
            if let Err(err) = watch::spawn_watcher(profile, watch_settings, tx.clone(), sink.clone()) {
                tracing::warn!("{}: {:#}", profile.kind, err);
                sink.log(
                    profile.kind.service_name(),
                    &crate::sink::project_line("WATCHER", &format!("Watcher error: {:#}", err)),
                );
            }
        }
    }
    if descriptors.is_empty() {
        sink.log(SERVICE, "No projects found.");
    }

    // Startup runs in the background so a signal can interrupt it.
    let starter = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start_all(descriptors).await })
    };

    let stats = Arc::new(StatsCollector::new(registry));
    let mut ticker = settings.stats_interval.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker
    });
    let mut restarts = JoinSet::new();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Event::Restart(request)) => {
                    tracing::info!(key = %request.key, reason = %request.reason, "restart queued");
                    let supervisor = supervisor.clone();
                    restarts.spawn(async move {
                        if let Err(err) = supervisor.restart(&request.key).await {
                            tracing::debug!(key = %request.key, "restart failed: {}", err);
                        }
                    });
                }
                Some(Event::Shutdown { signal }) => {
                    tracing::info!(?signal, "shutdown requested");
                    break;
                }
                None => break,
            },
            Some(_) = restarts.join_next(), if !restarts.is_empty() => {}
            _ = next_tick(&mut ticker) => {
                let collector = stats.clone();
                match tokio::task::spawn_blocking(move || collector.snapshot_all()).await {
                    Ok(snapshots) => {
                        for snapshot in &snapshots {
                            sink.stats(snapshot);
                        }
                    }
                    Err(err) => tracing::warn!("stats sampling failed: {}", err),
                }
            }
        }
    }

    // Abandoned starts leave their processes registered; stop_all reaps them.
    starter.abort();
    restarts.abort_all();
    sink.log(SERVICE, "Stopping all projects...");
    let outcomes = supervisor.stop_all().await;
    tracing::info!("stopped {} projects", outcomes.len());
    sink.log(SERVICE, "All projects stopped.");
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut config = config::Config::default();
    if !cli.no_config {
        let config_path = cli.config.clone().or_else(config::default_config_path);
        if let Some(path) = config_path {
            config = config::load_config(&path)?;
            tracing::debug!("loaded {}", path.display());
        }
    }

    let mut runtimes = config.runtime_table()?;
    runtimes.retain_kinds(&cli.runtimes);

    let watch = (!cli.no_watch && config.watch.unwrap_or(true)).then(|| config.watch_settings());
    let stats_interval = cli
        .stats_interval_ms
        .or(config.stats_interval_ms)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);
    let console = ConsoleOptions {
        timestamp: cli.timestamp || config.timestamp.unwrap_or(false),
        colors: std::io::stdout().is_terminal(),
    };
    Ok(Settings {
        runtimes,
        timings: config.timings(),
        watch,
        stats_interval,
        console,
    })
}

fn print_scan(runtimes: &RuntimeTable) {
    for profile in runtimes.enabled() {
        let descriptors = scanner::resolve_all(profile, None);
        if descriptors.is_empty() {
            println!("{:<8} (no projects in {})", profile.kind, profile.web_root.display());
            continue;
        }
        for descriptor in descriptors {
            println!(
                "{:<8} {:<16} {:>5}  {}",
                profile.kind,
                descriptor.name,
                descriptor.port,
                descriptor.entry_path.display()
            );
        }
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Event::Shutdown { signal: ProcessSignal::SigInt }).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Event::Shutdown { signal: ProcessSignal::SigTerm }).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx
                .send(Event::Shutdown {
                    signal: ProcessSignal::SigInt,
                })
                .await;
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
