//! Configuration for ptyhost.
//!
//! Settings are read from `~/.ptyhost/config.toml`. Every key is optional:
//!
//! ```toml
//! # Tool to run: a bare name is looked up (npm shims, then PATH),
//! # anything else is used as a command line verbatim
//! command = "claude"
//!
//! # Defaults to the home directory
//! working_directory = "C:/src/project"
//!
//! rows = 30
//! columns = 120
//!
//! # Overridden by RUST_LOG
//! log_level = "info"
//!
//! [reader]
//! buffer_size = 4096
//! backlog_events = 1024
//!
//! [shutdown]
//! timeout_ms = 2000
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::pty::ConsoleSize;
use crate::core::session::SessionOptions;
use crate::locate::DEFAULT_TOOL;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tool name or command line
    pub command: String,
    /// Directory the tool starts in
    pub working_directory: Option<PathBuf>,
    pub rows: u16,
    pub columns: u16,
    /// Log filter used when RUST_LOG is unset
    pub log_level: String,
    pub reader: ReaderConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        let size = ConsoleSize::default();
        Self {
            command: DEFAULT_TOOL.to_string(),
            working_directory: None,
            rows: size.rows,
            columns: size.columns,
            log_level: "info".to_string(),
            reader: ReaderConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Output reader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub buffer_size: usize,
    pub backlog_events: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        let options = SessionOptions::default();
        Self {
            buffer_size: options.read_buffer_size,
            backlog_events: options.backlog_events,
        }
    }
}

/// Shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `~/.ptyhost`, created on first use
    pub fn config_dir() -> Option<PathBuf> {
        let dir = home_dir()?.join(".ptyhost");
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Configured size, or the default if it is out of range
    pub fn console_size(&self) -> ConsoleSize {
        ConsoleSize::new(self.rows, self.columns).unwrap_or_else(|e| {
            warn!("{}; using the default size", e);
            ConsoleSize::default()
        })
    }

    /// Configured directory, else home, else the current directory
    pub fn working_directory(&self) -> PathBuf {
        self.working_directory
            .clone()
            .or_else(home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_buffer_size: self.reader.buffer_size.max(1),
            backlog_events: self.reader.backlog_events,
            shutdown_timeout: Duration::from_millis(self.shutdown.timeout_ms),
        }
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
