//! Host terminal setup and output passthrough
//!
//! The child draws its own screen; the host only switches its terminal into
//! raw mode on the alternate screen and copies output bytes through.

use std::io::{self, Write};

use crossterm::{
    cursor::{MoveTo, Show},
    event::{DisableBracketedPaste, EnableBracketedPaste},
    execute,
    style::{Attribute, ResetColor, SetAttribute},
    terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use tracing::debug;

/// Raw-mode host terminal, restored on drop
pub struct HostTerminal {
    active: bool,
}

impl Default for HostTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTerminal {
    pub fn new() -> Self {
        Self { active: false }
    }

    pub fn init(&mut self) -> io::Result<()> {
        #[cfg(windows)]
        enable_virtual_terminal_output();

        terminal::enable_raw_mode()?;
        self.active = true;

        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, Clear(ClearType::All), MoveTo(0, 0))?;
        // Not available through the legacy console API
        if let Err(e) = execute!(stdout, EnableBracketedPaste) {
            debug!("Bracketed paste unavailable: {}", e);
        }
        stdout.flush()
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        let mut stdout = io::stdout();
        let _ = execute!(stdout, DisableBracketedPaste);
        let _ = execute!(stdout, ResetColor, SetAttribute(Attribute::Reset), Show);
        let _ = execute!(stdout, LeaveAlternateScreen);
        let _ = stdout.flush();

        terminal::disable_raw_mode()
    }

    /// Columns and rows of the host terminal
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }

    /// Copy child output to the host terminal unchanged
    pub fn write_output(bytes: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.flush()
    }
}

impl Drop for HostTerminal {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Let the console interpret the child's escape sequences itself.
#[cfg(windows)]
fn enable_virtual_terminal_output() {
    use windows::Win32::System::Console::{
        GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE, DISABLE_NEWLINE_AUTO_RETURN,
        ENABLE_PROCESSED_OUTPUT, ENABLE_VIRTUAL_TERMINAL_PROCESSING, STD_OUTPUT_HANDLE,
    };

    unsafe {
        let Ok(handle) = GetStdHandle(STD_OUTPUT_HANDLE) else {
            return;
        };
        let mut mode = CONSOLE_MODE(0);
        if GetConsoleMode(handle, &mut mode).is_err() {
            debug!("Output is not a console");
            return;
        }
        let wanted = mode | ENABLE_PROCESSED_OUTPUT | ENABLE_VIRTUAL_TERMINAL_PROCESSING | DISABLE_NEWLINE_AUTO_RETURN;
        if let Err(e) = SetConsoleMode(handle, wanted) {
            debug!("SetConsoleMode failed: {}", e);
        }
    }
}
