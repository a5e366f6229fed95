//! Stagehand: a local development orchestrator.
//!
//! This is the entry point of the application. It parses command-line arguments, loads
//! configuration, starts the requested projects and echoes their status and output to
//! the terminal until interrupted.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stagehand::config::{default_config_path, ConfigStore};
use stagehand::events::Event;
use stagehand::orchestrator::Orchestrator;
use stagehand::project::ProjectSnapshot;
use stagehand::service::ServiceState;

const CONSOLE_USER: &str = "console";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Local development orchestrator for shell services and mock endpoints",
    styles = help_styles(),
    color = clap::ColorChoice::Always
)]
struct Cli {
    /// Path to the configuration file (default: ~/.stagehand/config.json).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Project (id or name) to start on launch. May be repeated.
    #[arg(long = "start", value_name = "PROJECT")]
    start: Vec<String>,
    /// Diagnostic log filter, e.g. "debug" or "stagehand=trace".
    #[arg(long)]
    log_level: Option<String>,
    /// Do not echo service output to stdout.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let store = ConfigStore::file(&path);

    // The configured filter lives in the file, so peek at it before building anything.
    let configured_level = store
        .load_or_bootstrap()
        .ok()
        .and_then(|config| config.server.log_level);
    init_tracing(cli.log_level.as_deref(), configured_level.as_deref())?;

    let orchestrator = Orchestrator::open(store)
        .await
        .with_context(|| format!("failed to open configuration {}", path.display()))?;
    info!(config = %path.display(), "configuration loaded");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = orchestrator.connect_session(CONSOLE_USER, event_tx).await;
    let printer = tokio::spawn(print_events(event_rx, cli.quiet));

    for project in &cli.start {
        match orchestrator.start_project(project).await {
            Ok(true) => info!(project = %project, "project started"),
            Ok(false) => warn!(project = %project, "some services failed to start"),
            Err(err) => error!(project = %project, "{err}"),
        }
    }

    let signal = wait_for_shutdown_signal().await;
    info!(signal, "shutting down");
    orchestrator.shutdown().await;
    orchestrator.disconnect_session(session.id()).await;
    drop(session);
    printer.abort();
    Ok(())
}

/// CLI flag, then `RUST_LOG`, then the configuration file, then `info`.
fn init_tracing(cli_level: Option<&str>, configured_level: Option<&str>) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(configured_level.unwrap_or("info"))
                .context("invalid server.log_level")?,
        },
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

/// Display names of every known service, keyed by service id.
#[derive(Debug, Default)]
struct ServiceNames {
    names: HashMap<String, String>,
}

impl ServiceNames {
    fn track(&mut self, project: &ProjectSnapshot) {
        for service in &project.services {
            let name = if service.name().is_empty() {
                service.id()
            } else {
                service.name()
            };
            self.names.insert(service.id().to_string(), name.to_string());
        }
    }

    fn get<'a>(&'a self, id: &'a str) -> &'a str {
        self.names.get(id).map(String::as_str).unwrap_or(id)
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<Event>, quiet: bool) {
    let mut names = ServiceNames::default();
    while let Some(event) = rx.recv().await {
        for line in render_event(&event, &mut names, quiet) {
            println!("{line}");
        }
    }
}

fn render_event(event: &Event, names: &mut ServiceNames, quiet: bool) -> Vec<String> {
    match event {
        Event::ProjectList { projects } => {
            for project in projects {
                names.track(project);
            }
            Vec::new()
        }
        Event::ProjectUpdate { project, .. } => {
            names.track(project);
            vec![format_tool_message(&format!("project {} updated", project.name))]
        }
        Event::ProjectRemoval { project, .. } => {
            vec![format_tool_message(&format!("project {} removed", project.name))]
        }
        Event::ServiceStatus { id, status, .. } => {
            vec![format_tool_message(&format!(
                "{} is {}",
                names.get(id),
                status_label(*status)
            ))]
        }
        Event::ServiceLog { .. } if quiet => Vec::new(),
        Event::ServiceLog { id, content, .. } => {
            let prefix = apply_color(&format!("[{}]", names.get(id)), "cyan");
            content
                .lines()
                .map(|line| format!("{prefix} {line}"))
                .collect()
        }
    }
}

fn status_label(status: ServiceState) -> &'static str {
    match status {
        ServiceState::Stopped => "stopped",
        ServiceState::Running => "running",
        ServiceState::Dead => "dead",
        ServiceState::Failed => "failed",
    }
}

fn apply_color(prefix: &str, color: &str) -> String {
    let code = match color {
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "cyan" => "36",
        _ => return prefix.to_string(),
    };
    format!("\u{1b}[{code}m{prefix}\u{1b}[0m")
}

fn format_tool_message(text: &str) -> String {
    format!("[stagehand] {text}")
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
