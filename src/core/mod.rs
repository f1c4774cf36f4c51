//! Core pseudo console components.
//!
//! - **pty**: platform seam (pipes, console, child process) and errors
//! - **session**: one child process behind a pseudo console, with an
//!   output reader thread and ordered event delivery
//! - **events**: subscriber fan-out with a backlog for late subscribers
//! - **command**: program plus arguments for the child
//!
//! # Architecture
//!
//! ```text
//! Session<S: PtySystem>
//! ├── input pipe (write end)  ──► console ──► child stdin
//! ├── output pipe (read end)  ◄── console ◄── child stdout/stderr
//! ├── PseudoConsole (resize, destroyed on dispose)
//! ├── ChildProcess (terminated on dispose)
//! ├── reader thread ──► EventHub<SessionEvent> ──► subscribers
//! └── exit watcher (ConPTY): closes the console once the child exits
//! ```
//!
//! `S` is ConPTY on Windows and `openpty` on Unix.

pub mod command;
pub mod events;
pub mod pty;
pub mod session;

#[cfg(windows)]
pub mod conpty;
#[cfg(unix)]
pub mod unix;

#[cfg(test)]
pub(crate) mod testing;

pub use command::CommandLine;
pub use events::SubscriptionId;
pub use pty::{ConsoleSize, NativePtySystem, PtyError, PtySystem};
pub use session::{Session, SessionEvent, SessionOptions, SessionState};
