//! Resolved command lines for the attached child process

use std::fmt;

/// Program plus arguments, already resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Split a command string on whitespace; double quotes group words.
    ///
    /// Backslashes are literal so Windows paths survive unchanged.
    /// Returns `None` for an empty or blank string.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut quoted = false;

        for ch in line.chars() {
            match ch {
                '"' => {
                    quoted = !quoted;
                    in_word = true;
                }
                c if c.is_whitespace() && !quoted => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            }
        }
        if in_word {
            words.push(current);
        }

        let mut words = words.into_iter();
        let program = words.next()?;
        Some(Self::new(program).args(words))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Render as a single `CreateProcessW` command line.
    pub fn to_windows_command_line(&self) -> String {
        let mut line = String::new();
        quote_windows_arg(&self.program, &mut line);
        for arg in &self.args {
            line.push(' ');
            quote_windows_arg(arg, &mut line);
        }
        line
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_windows_command_line())
    }
}

/// Quote one argument following the MSVC runtime's parsing rules.
fn quote_windows_arg(arg: &str, out: &mut String) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\x0b', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                // Escape the run of backslashes and the quote itself
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            c => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    // Trailing backslashes precede the closing quote
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_groups_quoted_words() {
        let cmd = CommandLine::parse(r#"cmd.exe /c "C:\Program Files\nodejs\claude.cmd""#).unwrap();
        assert_eq!(cmd.program(), "cmd.exe");
        assert_eq!(cmd.arguments(), ["/c", r"C:\Program Files\nodejs\claude.cmd"]);
    }

    #[test]
    fn parse_blank_is_none() {
        assert!(CommandLine::parse("").is_none());
        assert!(CommandLine::parse("   \t ").is_none());
    }

    #[test]
    fn parse_keeps_empty_quoted_argument() {
        let cmd = CommandLine::parse(r#"sh -c """#).unwrap();
        assert_eq!(cmd.arguments(), ["-c", ""]);
    }

    #[test]
    fn windows_quoting_leaves_plain_words_alone() {
        let cmd = CommandLine::new("claude").arg("--verbose");
        assert_eq!(cmd.to_windows_command_line(), "claude --verbose");
    }

    #[test]
    fn windows_quoting_escapes_spaces_and_quotes() {
        let cmd = CommandLine::new(r"C:\Program Files\tool.exe")
            .arg(r#"say "hi""#)
            .arg(r"C:\dir with space\")
            .arg("");
        assert_eq!(
            cmd.to_windows_command_line(),
            r#""C:\Program Files\tool.exe" "say \"hi\"" "C:\dir with space\\" """#
        );
    }
}
