//! Configuration for thopter-shell.
//!
//! Settings are read from `~/.thopter-shell/config.toml`. Every field is
//! optional; a missing file means all defaults.
//!
//! ```toml
//! # Escape character: a single printable character, or "none"
//! escape_char = "~"
//!
//! # Upper bound on how long the session loop waits for I/O (milliseconds)
//! poll_interval_ms = 100
//!
//! # Time the remote shell gets to exit after SIGTERM before SIGKILL
//! terminate_grace_ms = 2000
//!
//! [launcher]
//! program = "modal"
//! args = ["sandbox", "exec", "{sandbox}", "bash"]
//!
//! [log]
//! level = "info"
//! file = "/tmp/thopter-shell.log"
//! ```
//!
//! `{sandbox}` in the launcher arguments is replaced by the sandbox named on
//! the command line.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ui::escape::{parse_escape_char, DEFAULT_ESCAPE_CHAR};

/// Placeholder substituted with the sandbox identifier
pub const SANDBOX_PLACEHOLDER: &str = "{sandbox}";

/// Directory under the home directory holding config and logs
const APP_DIR: &str = ".thopter-shell";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Escape character, or "none"
    pub escape_char: String,
    /// Bound on a single readiness wait
    pub poll_interval_ms: u64,
    /// SIGTERM to SIGKILL grace period
    pub terminate_grace_ms: u64,
    /// Remote-attach launcher
    pub launcher: LauncherConfig,
    /// Logging
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            escape_char: (DEFAULT_ESCAPE_CHAR as char).to_string(),
            poll_interval_ms: 100,
            terminate_grace_ms: 2000,
            launcher: LauncherConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Command used to reach the remote shell
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "modal".to_string(),
            args: vec![
                "sandbox".to_string(),
                "exec".to_string(),
                SANDBOX_PLACEHOLDER.to_string(),
                "bash".to_string(),
            ],
        }
    }
}

impl LauncherConfig {
    /// Program and arguments for attaching to `sandbox`
    pub fn command_for(&self, sandbox: &str) -> (String, Vec<String>) {
        let args = self
            .args
            .iter()
            .map(|arg| arg.replace(SANDBOX_PLACEHOLDER, sandbox))
            .collect();
        (self.program.replace(SANDBOX_PLACEHOLDER, sandbox), args)
    }
}

/// Log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. "info" or "thopter_shell=debug"
    pub level: String,
    /// Log file; defaults to ~/.thopter-shell/thopter-shell.log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config: Self =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.escape_byte()?;
        if self.launcher.program.is_empty() {
            return Err(ConfigError::Invalid(
                "launcher.program must not be empty".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Escape character as a byte; `None` disables escapes
    pub fn escape_byte(&self) -> Result<Option<u8>, ConfigError> {
        parse_escape_char(&self.escape_char).map_err(ConfigError::Invalid)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Log file location
    pub fn log_path(&self) -> PathBuf {
        self.log.file.clone().unwrap_or_else(|| {
            app_dir()
                .map(|dir| dir.join("thopter-shell.log"))
                .unwrap_or_else(|| PathBuf::from("thopter-shell.log"))
        })
    }

    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        app_dir().map(|dir| dir.join("config.toml"))
    }
}

fn app_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(APP_DIR))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}
