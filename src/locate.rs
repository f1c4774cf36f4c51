//! Locating the CLI tool to run
//!
//! Node-based CLIs are usually installed as npm shims, so a bare tool name
//! is looked up in the npm global bin directory first and then on the search
//! path. On Windows, shims are batch scripts that need `cmd.exe` to run.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::command::CommandLine;

/// Tool started when no command is configured.
pub const DEFAULT_TOOL: &str = "claude";

/// Finds a tool by name in a fixed set of directories.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    npm_dir: Option<PathBuf>,
    search_path: Vec<PathBuf>,
}

impl Resolver {
    pub fn new(npm_dir: Option<PathBuf>, search_path: Vec<PathBuf>) -> Self {
        Self { npm_dir, search_path }
    }

    /// `%APPDATA%\npm` (Windows only) and the directories in `PATH`.
    pub fn from_env() -> Self {
        let npm_dir = if cfg!(windows) {
            env::var_os("APPDATA").map(|appdata| PathBuf::from(appdata).join("npm"))
        } else {
            None
        };
        let search_path = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect())
            .unwrap_or_default();
        Self::new(npm_dir, search_path)
    }

    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if let Some(npm_dir) = &self.npm_dir {
            let shim = npm_dir.join(format!("{}.cmd", name));
            if is_runnable(&shim) {
                return Some(shim);
            }
        }

        for dir in &self.search_path {
            for candidate in candidates(name) {
                let path = dir.join(candidate);
                if is_runnable(&path) {
                    return Some(path);
                }
            }
        }
        None
    }
}

fn candidates(name: &str) -> Vec<String> {
    if cfg!(windows) {
        vec![
            format!("{}.cmd", name),
            name.to_string(),
            format!("{}-code", name),
            format!("{}-code.cmd", name),
        ]
    } else {
        vec![name.to_string(), format!("{}-code", name)]
    }
}

#[cfg(unix)]
fn is_runnable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_runnable(path: &Path) -> bool {
    path.is_file()
}

/// Scripts and extensionless shims only run through `cmd.exe`.
pub fn needs_cmd_shim(path: &Path) -> bool {
    match path.extension().and_then(OsStr::to_str) {
        None => true,
        Some(ext) => ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat"),
    }
}

/// Command line that runs the tool at `path`.
pub fn tool_command(path: &Path) -> CommandLine {
    let program = path.to_string_lossy();
    if cfg!(windows) && needs_cmd_shim(path) {
        return CommandLine::new("cmd.exe").arg("/c").arg(program);
    }
    CommandLine::new(program)
}

/// Turn a configured command into a command line.
///
/// A bare tool name is resolved, falling back to the name itself when it is
/// not installed anywhere we look. Anything else is taken verbatim.
pub fn command_for(requested: &str, resolver: &Resolver) -> CommandLine {
    let requested = requested.trim();
    let requested = if requested.is_empty() { DEFAULT_TOOL } else { requested };

    let bare = !requested.contains(|c: char| c.is_whitespace() || c == '"' || c == '/' || c == '\\');
    if bare {
        return match resolver.resolve(requested) {
            Some(path) => {
                debug!("Resolved {} to {}", requested, path.display());
                tool_command(&path)
            }
            None => {
                debug!("{} not found; using the bare name", requested);
                tool_command(Path::new(requested))
            }
        };
    }

    CommandLine::parse(requested).unwrap_or_else(|| CommandLine::new(DEFAULT_TOOL))
}
