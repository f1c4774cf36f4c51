//! Host-side terminal handling for the `ptyhost` binary.
//!
//! - **screen**: raw mode, alternate screen, output passthrough
//! - **keymapper**: keyboard input to child input byte sequences
//! - **modes**: input modes the child switches through its output

pub mod keymapper;
pub mod modes;
pub mod screen;

pub use keymapper::KeyMapper;
pub use modes::ModeTracker;
pub use screen::HostTerminal;
