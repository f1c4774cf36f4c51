//! ptyhost - run an interactive CLI tool behind a pseudo console
//!
//! The [`core::Session`] starts a child process attached to a pseudo console
//! (ConPTY on Windows, `openpty` on Unix), streams its output bytes to
//! subscribers, forwards input bytes and resizes, and tears everything down
//! on dispose. [`connection::PtyConnection`] adapts a session to a text-based
//! front end.
//!
//! ```no_run
//! use std::path::Path;
//! use ptyhost::core::{CommandLine, ConsoleSize, Session, SessionEvent};
//!
//! let session = Session::new(CommandLine::new("sh"), ConsoleSize::new(24, 80)?);
//! let events = session.events();
//! if session.initialize(Path::new("/tmp")) {
//!     session.write_input("echo hi\nexit\n")?;
//!     for event in events {
//!         if let SessionEvent::Output(bytes) = event {
//!             print!("{}", String::from_utf8_lossy(&bytes));
//!         }
//!     }
//! }
//! # Ok::<(), ptyhost::core::PtyError>(())
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod locate;
