//! Pseudo console abstractions
//!
//! This module defines the seam between the session and the operating
//! system: pipe pairs, the pseudo console object, and the attached child
//! process. Each platform backend implements [`PtySystem`]; the session is
//! generic over it so tests can substitute a double that injects failures.

use std::io::{self, Read, Write};
use std::path::Path;

use thiserror::Error;

use super::command::CommandLine;
use super::session::SessionState;

#[derive(Error, Debug)]
pub enum PtyError {
    /// The OS could not allocate pipe objects (resource exhaustion).
    #[error("Failed to create pipe (os error {code})")]
    PipeCreation { code: i32 },

    #[error("Pseudo console is not supported on this system")]
    ConsoleUnavailable,

    #[error("Failed to create pseudo console (code {code:#x})")]
    ConsoleCreation { code: i32 },

    #[error("Failed to spawn process (code {code:#x})")]
    ProcessSpawn { code: i32 },

    #[error("Failed to resize pseudo console (code {code:#x})")]
    Resize { code: i32 },

    #[error("Session is not running")]
    NotRunning,

    #[error("Failed to write to pseudo console: {0}")]
    Write(#[source] io::Error),

    #[error("Invalid console size {rows}x{columns}")]
    InvalidSize { rows: u16, columns: u16 },

    #[error("Session cannot be initialized from the {0:?} state")]
    InvalidState(SessionState),

    #[error("Failed to start output reader: {0}")]
    ReaderSpawn(#[source] io::Error),
}

impl PtyError {
    /// True when the failure means "not supported here" rather than "try again".
    pub fn is_unsupported(&self) -> bool {
        matches!(self, PtyError::ConsoleUnavailable)
    }

    /// OS status code carried by the error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            PtyError::PipeCreation { code }
            | PtyError::ConsoleCreation { code }
            | PtyError::ProcessSpawn { code }
            | PtyError::Resize { code } => Some(*code),
            PtyError::Write(e) | PtyError::ReaderSpawn(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Largest dimension a console coordinate can hold.
pub const MAX_DIMENSION: u16 = i16::MAX as u16;

/// Viewport size communicated to the pseudo console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleSize {
    pub rows: u16,
    pub columns: u16,
}

impl ConsoleSize {
    pub fn new(rows: u16, columns: u16) -> Result<Self> {
        let valid = |n: u16| (1..=MAX_DIMENSION).contains(&n);
        if !valid(rows) || !valid(columns) {
            return Err(PtyError::InvalidSize { rows, columns });
        }
        Ok(Self { rows, columns })
    }
}

impl Default for ConsoleSize {
    fn default() -> Self {
        Self { rows: 30, columns: 120 }
    }
}

/// Which end of a pipe pair stays in the parent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// An anonymous unidirectional pipe.
pub struct PipePair<R, W> {
    pub read: R,
    pub write: W,
}

/// Platform pseudo console facility.
///
/// Creation happens in three steps that the session drives in order:
/// two pipe pairs, a console over their far ends, then a child attached to
/// the console. Every returned object releases its OS resources on drop.
pub trait PtySystem: Send + Sync + 'static {
    type Reader: Read + Send + 'static;
    type Writer: Write + Send + 'static;
    type Console: PseudoConsole + 'static;
    type Process: ChildProcess + 'static;

    /// Create a pipe; the `keep` end has its inheritance flag cleared.
    fn create_pipe_pair(&self, keep: PipeEnd) -> Result<PipePair<Self::Reader, Self::Writer>>;

    /// Create a pseudo console reading `input` and writing `output`.
    ///
    /// The console duplicates what it needs; the caller still owns and must
    /// close its own copies once a process is attached.
    fn create_console(
        &self,
        size: ConsoleSize,
        input: &Self::Reader,
        output: &Self::Writer,
    ) -> Result<Self::Console>;

    /// Spawn `command` attached to `console`.
    fn spawn(
        &self,
        command: &CommandLine,
        working_directory: &Path,
        console: &Self::Console,
    ) -> Result<Self::Process>;
}

/// A live pseudo console. Dropping it destroys the console, which must only
/// happen after the attached child has been signaled to stop.
pub trait PseudoConsole: Send {
    /// Apply a new size; on failure the previous size stays in effect.
    fn resize(&self, size: ConsoleSize) -> Result<()>;
}

/// Blocks until the child has exited. Runs on its own thread.
pub type ExitWait = Box<dyn FnOnce() + Send>;

/// The child attached to a pseudo console. Dropping it closes the process
/// handle and terminates the child.
pub trait ChildProcess: Send {
    fn pid(&self) -> u32;

    /// Exit code if the child has exited, `None` while it is still running.
    fn try_exit_code(&mut self) -> io::Result<Option<i32>>;

    /// A wait for the child's exit, for consoles that keep the output pipe
    /// open after the child is gone. `None` when output reaches end-of-stream
    /// on its own.
    fn exit_wait(&mut self) -> Option<ExitWait> {
        None
    }
}

#[cfg(windows)]
pub type NativePtySystem = super::conpty::ConPtySystem;

#[cfg(unix)]
pub type NativePtySystem = super::unix::UnixPtySystem;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_size_rejects_zero_dimensions() {
        assert!(matches!(
            ConsoleSize::new(0, 80),
            Err(PtyError::InvalidSize { rows: 0, columns: 80 })
        ));
        assert!(ConsoleSize::new(24, 0).is_err());
        assert!(ConsoleSize::new(24, MAX_DIMENSION + 1).is_err());
        assert_eq!(
            ConsoleSize::new(24, 80).unwrap(),
            ConsoleSize { rows: 24, columns: 80 }
        );
    }

    #[test]
    fn unsupported_is_distinguishable_from_transient() {
        assert!(PtyError::ConsoleUnavailable.is_unsupported());
        let transient = PtyError::ConsoleCreation { code: 5 };
        assert!(!transient.is_unsupported());
        assert_eq!(transient.code(), Some(5));
    }
}
