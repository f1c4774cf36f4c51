//! Key mapping for terminal input
//!
//! Converts host key events into the byte sequences an xterm-compatible
//! child expects on its input.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use super::modes::InputModes;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        result.set(Modifiers::SHIFT, mods.contains(KeyModifiers::SHIFT));
        result.set(Modifiers::ALT, mods.contains(KeyModifiers::ALT));
        result.set(Modifiers::CTRL, mods.contains(KeyModifiers::CONTROL));
        result
    }
}

impl Modifiers {
    /// xterm modifier parameter: 1 + shift(1) + alt(2) + ctrl(4)
    fn xterm_param(self) -> u8 {
        1 + self.bits()
    }
}

/// Function keys F1-F12: SS3 final byte for F1-F4, tilde code after that
const FUNCTION_KEYS: [FunctionKey; 12] = [
    FunctionKey::Ss3(b'P'),
    FunctionKey::Ss3(b'Q'),
    FunctionKey::Ss3(b'R'),
    FunctionKey::Ss3(b'S'),
    FunctionKey::Tilde(15),
    FunctionKey::Tilde(17),
    FunctionKey::Tilde(18),
    FunctionKey::Tilde(19),
    FunctionKey::Tilde(20),
    FunctionKey::Tilde(21),
    FunctionKey::Tilde(23),
    FunctionKey::Tilde(24),
];

#[derive(Clone, Copy)]
enum FunctionKey {
    Ss3(u8),
    Tilde(u8),
}

/// Key mapper for converting key events to bytes
pub struct KeyMapper;

impl KeyMapper {
    /// Map a crossterm KeyEvent to input bytes; `None` for keys with no encoding
    pub fn map(event: &KeyEvent, modes: &InputModes) -> Option<Vec<u8>> {
        let mods = Modifiers::from(event.modifiers);

        let bytes = match event.code {
            KeyCode::Char(ch) => Self::map_char(ch, mods),
            KeyCode::Enter if modes.linefeed_newline => b"\r\n".to_vec(),
            KeyCode::Enter => b"\r".to_vec(),
            KeyCode::Backspace if mods.contains(Modifiers::ALT) => b"\x1b\x7f".to_vec(),
            KeyCode::Backspace => vec![0x7F],
            KeyCode::Tab => b"\t".to_vec(),
            KeyCode::BackTab => b"\x1b[Z".to_vec(),
            KeyCode::Esc => vec![0x1B],

            KeyCode::Up => Self::cursor_key(b'A', mods, modes.application_cursor),
            KeyCode::Down => Self::cursor_key(b'B', mods, modes.application_cursor),
            KeyCode::Right => Self::cursor_key(b'C', mods, modes.application_cursor),
            KeyCode::Left => Self::cursor_key(b'D', mods, modes.application_cursor),
            KeyCode::Home => Self::cursor_key(b'H', mods, modes.application_cursor),
            KeyCode::End => Self::cursor_key(b'F', mods, modes.application_cursor),

            KeyCode::Insert => Self::tilde_key(2, mods),
            KeyCode::Delete => Self::tilde_key(3, mods),
            KeyCode::PageUp => Self::tilde_key(5, mods),
            KeyCode::PageDown => Self::tilde_key(6, mods),

            KeyCode::F(n) => {
                let key = FUNCTION_KEYS.get(usize::from(n).checked_sub(1)?)?;
                match (*key, mods.is_empty()) {
                    (FunctionKey::Ss3(last), true) => vec![0x1B, b'O', last],
                    (FunctionKey::Ss3(last), false) => {
                        format!("\x1b[1;{}{}", mods.xterm_param(), last as char).into_bytes()
                    }
                    (FunctionKey::Tilde(code), _) => Self::tilde_key(code, mods),
                }
            }

            _ => return None,
        };
        Some(bytes)
    }

    /// Encode pasted text, bracketed if the child asked for it
    pub fn paste(text: &str, modes: &InputModes) -> Vec<u8> {
        if modes.bracketed_paste {
            format!("\x1b[200~{}\x1b[201~", text).into_bytes()
        } else {
            text.as_bytes().to_vec()
        }
    }

    fn map_char(ch: char, mods: Modifiers) -> Vec<u8> {
        let ctrl = mods.contains(Modifiers::CTRL);
        let alt = mods.contains(Modifiers::ALT);

        if ctrl {
            if let Some(code) = Self::control_code(ch) {
                return if alt { vec![0x1B, code] } else { vec![code] };
            }
        }

        let mut bytes = Vec::with_capacity(5);
        if alt {
            bytes.push(0x1B);
        }
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        bytes
    }

    /// C0 code produced by Ctrl+`ch`
    fn control_code(ch: char) -> Option<u8> {
        match ch {
            'a'..='z' => Some(ch as u8 - b'a' + 1),
            'A'..='Z' => Some(ch as u8 - b'A' + 1),
            '@' | '`' | ' ' | '2' => Some(0x00),
            '[' | '3' => Some(0x1B),
            '\\' | '4' => Some(0x1C),
            ']' | '5' => Some(0x1D),
            '^' | '~' | '6' => Some(0x1E),
            '_' | '?' | '7' => Some(0x1F),
            _ => None,
        }
    }

    /// Arrows, Home and End
    fn cursor_key(last: u8, mods: Modifiers, application: bool) -> Vec<u8> {
        if !mods.is_empty() {
            format!("\x1b[1;{}{}", mods.xterm_param(), last as char).into_bytes()
        } else if application {
            vec![0x1B, b'O', last]
        } else {
            vec![0x1B, b'[', last]
        }
    }

    fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            format!("\x1b[{}~", code).into_bytes()
        } else {
            format!("\x1b[{};{}~", code, mods.xterm_param()).into_bytes()
        }
    }
}
