//! Input-affecting terminal modes, tracked from the output stream
//!
//! The host writes child output straight to its own terminal, so it never
//! builds a screen model. It still has to know a few modes the child sets,
//! because they change how keys are encoded.

/// Modes that change what a key press sends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputModes {
    /// DECCKM: arrows send `ESC O x` instead of `ESC [ x`
    pub application_cursor: bool,
    /// LNM: Enter sends CR LF
    pub linefeed_newline: bool,
    /// Paste is wrapped in `ESC [200~` / `ESC [201~`
    pub bracketed_paste: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Ground,
    Escape,
    Csi,
}

/// Streaming scanner for mode set/reset sequences.
///
/// Sequences may be split across chunks; the scanner state carries over.
#[derive(Debug)]
pub struct ModeTracker {
    modes: InputModes,
    scan: Scan,
    private: bool,
    params: Vec<u16>,
    current: Option<u16>,
}

impl Default for ModeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeTracker {
    pub fn new() -> Self {
        Self {
            modes: InputModes::default(),
            scan: Scan::Ground,
            private: false,
            params: Vec::new(),
            current: None,
        }
    }

    pub fn modes(&self) -> InputModes {
        self.modes
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.step(byte);
        }
    }

    fn step(&mut self, byte: u8) {
        match (self.scan, byte) {
            // CAN and SUB abort any sequence
            (_, 0x18 | 0x1A) => self.scan = Scan::Ground,
            (_, 0x1B) => self.scan = Scan::Escape,
            (Scan::Ground, _) => {}
            (Scan::Escape, b'[') => {
                self.scan = Scan::Csi;
                self.private = false;
                self.params.clear();
                self.current = None;
            }
            (Scan::Escape, b'c') => {
                // RIS
                self.modes = InputModes::default();
                self.scan = Scan::Ground;
            }
            (Scan::Escape, _) => self.scan = Scan::Ground,
            (Scan::Csi, b'?') if self.params.is_empty() && self.current.is_none() => self.private = true,
            (Scan::Csi, b'0'..=b'9') => {
                let digit = u16::from(byte - b'0');
                let value = self.current.unwrap_or(0);
                self.current = Some(value.saturating_mul(10).saturating_add(digit));
            }
            (Scan::Csi, b';') => self.params.push(self.current.take().unwrap_or(0)),
            (Scan::Csi, 0x40..=0x7E) => {
                if let Some(last) = self.current.take() {
                    self.params.push(last);
                }
                match byte {
                    b'h' => self.apply(true),
                    b'l' => self.apply(false),
                    _ => {}
                }
                self.scan = Scan::Ground;
            }
            // Intermediates and stray controls inside a CSI
            (Scan::Csi, _) => {}
        }
    }

    fn apply(&mut self, set: bool) {
        for &param in &self.params {
            match (self.private, param) {
                (true, 1) => self.modes.application_cursor = set,
                (true, 2004) => self.modes.bracketed_paste = set,
                (false, 20) => self.modes.linefeed_newline = set,
                _ => {}
            }
        }
    }
}
