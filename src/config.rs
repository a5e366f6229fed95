//! Configuration management for Stagehand.
//!
//! This module defines the structure of the configuration file, the runtime `Settings`
//! derived from its `server` section, and the `ConfigStore` that loads and saves it.
//! Files ending in `.toml` are read and written as TOML, everything else as JSON.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::OrchestraError;
use crate::output::DEFAULT_HISTORY_LIMIT;
use crate::project::{ProjectConfig, ProjectSnapshot};
use crate::service::RUNNABLE_SERVICE_TYPE;

/// How long a mock listener may take to drain in-flight requests on stop.
pub const DEFAULT_MOCK_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[cfg(unix)]
const DEFAULT_SHELL: &str = "bash";
#[cfg(not(unix))]
const DEFAULT_SHELL: &str = "cmd";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Projects and their raw service entries.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    /// Orchestrator settings.
    #[serde(default)]
    pub server: ServerConfig,
}

/// The `server` section of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Log filter used when neither the CLI nor `RUST_LOG` sets one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Shell command line used to run runnable services (default: `bash`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Maximum number of log lines retained per service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<usize>,
    /// Whether to strip ANSI escape codes from captured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_ansi: Option<bool>,
    /// Grace period for mock listeners to drain on stop, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_shutdown_grace_ms: Option<u64>,
}

impl Config {
    /// The configuration written when no file exists yet.
    pub fn bootstrap() -> Self {
        Self {
            projects: vec![ProjectConfig {
                id: String::new(),
                name: "Test".to_string(),
                description: String::new(),
                services: vec![json!({
                    "type": RUNNABLE_SERVICE_TYPE,
                    "name": "Hello World",
                    "commands": ["echo 'hello world'"],
                })],
            }],
            server: ServerConfig::default(),
        }
    }
}

/// The shell program (and its arguments) runnable services are fed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    /// Parses a shell command line such as `bash --noprofile`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts =
            shell_words::split(line).with_context(|| format!("failed to parse shell {line:?}"))?;
        if parts.is_empty() {
            bail!("shell command is empty");
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
        })
    }

    /// Builds a fresh command for this shell.
    pub fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self {
            program: DEFAULT_SHELL.to_string(),
            args: Vec::new(),
        }
    }
}

/// Runtime settings resolved from the `server` section.
#[derive(Debug, Clone)]
pub struct Settings {
    pub shell: ShellCommand,
    pub history_limit: usize,
    pub strip_ansi: bool,
    pub mock_shutdown_grace: Duration,
    working_dir: OnceLock<PathBuf>,
}

impl Settings {
    pub fn from_config(server: &ServerConfig) -> Result<Self> {
        let shell = match server.shell.as_deref() {
            Some(line) => ShellCommand::parse(line)?,
            None => ShellCommand::default(),
        };
        Ok(Self {
            shell,
            history_limit: server.max_lines.unwrap_or(DEFAULT_HISTORY_LIMIT),
            strip_ansi: server.strip_ansi.unwrap_or(false),
            mock_shutdown_grace: Duration::from_millis(
                server
                    .mock_shutdown_grace_ms
                    .unwrap_or(DEFAULT_MOCK_SHUTDOWN_GRACE_MS),
            ),
            working_dir: OnceLock::new(),
        })
    }

    /// The orchestrator's own working directory, resolved on first use.
    pub fn default_working_dir(&self) -> Result<PathBuf, OrchestraError> {
        if let Some(dir) = self.working_dir.get() {
            return Ok(dir.clone());
        }
        let dir = std::env::current_dir()
            .map_err(|err| OrchestraError::io("failed to resolve working directory", err))?;
        tracing::debug!(dir = %dir.display(), "inferred default working directory");
        Ok(self.working_dir.get_or_init(|| dir).clone())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shell: ShellCommand::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            strip_ansi: false,
            mock_shutdown_grace: Duration::from_millis(DEFAULT_MOCK_SHUTDOWN_GRACE_MS),
            working_dir: OnceLock::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

#[derive(Serialize)]
struct SavedConfig<'a> {
    projects: &'a [ProjectSnapshot],
    server: &'a ServerConfig,
}

/// Where the configuration lives.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// A store that never touches the disk.
    pub fn memory() -> Self {
        Self { path: None }
    }

    /// A store backed by the file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the configuration, falling back to `Config::bootstrap` when the file is missing.
    pub fn load_or_bootstrap(&self) -> Result<Config> {
        let Some(path) = self.path.as_deref() else {
            return Ok(Config::bootstrap());
        };
        if !path.exists() {
            return Ok(Config::bootstrap());
        }
        load_config(path)
    }

    /// Writes the given projects and server section.
    pub fn save(&self, projects: &[ProjectSnapshot], server: &ServerConfig) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let saved = SavedConfig { projects, server };
        let raw = match ConfigFormat::for_path(path) {
            ConfigFormat::Json => serde_json::to_string_pretty(&saved)
                .context("failed to serialize configuration")?,
            ConfigFormat::Toml => {
                toml::to_string_pretty(&saved).context("failed to serialize configuration")?
            }
        };
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = match ConfigFormat::for_path(path) {
        ConfigFormat::Json => serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?,
        ConfigFormat::Toml => toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?,
    };
    Ok(config)
}

/// `$HOME/.stagehand/config.json`, or `./stagehand.json` without a home directory.
pub fn default_config_path() -> PathBuf {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match home {
        Some(home) => PathBuf::from(home).join(".stagehand").join("config.json"),
        None => PathBuf::from("stagehand.json"),
    }
}
