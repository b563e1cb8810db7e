//! In-band escape commands
//!
//! Scans operator keystrokes for the ssh-style escape language. A command is
//! only recognized when the escape character is typed at the start of a line:
//!
//! | Keys | Action |
//! |------|--------|
//! | `~.` | Disconnect |
//! | `~?` | Show help |
//! | `~~` | Send a literal `~` |
//!
//! Anything else following the escape character is sent through unchanged,
//! escape character included.

/// Default escape character
pub const DEFAULT_ESCAPE_CHAR: u8 = b'~';

/// Position of the detector within the input stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeState {
    /// Mid-line, escape character is ordinary data
    Normal,
    /// At the start of a line, escape character opens a command
    AfterNewline,
    /// Escape character consumed, waiting for the command byte
    EscapePending,
}

/// Outcome of feeding one byte to the detector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeAction {
    /// Send this byte to the remote side
    Forward(u8),
    /// Send the held escape character followed by this byte
    ForwardPair(u8, u8),
    /// End the session
    Disconnect,
    /// Print the escape help locally
    ShowHelp,
    /// Nothing to send yet
    Swallow,
}

/// Byte-at-a-time escape sequence filter
#[derive(Clone, Debug)]
pub struct EscapeDetector {
    introducer: u8,
    state: EscapeState,
}

impl EscapeDetector {
    /// Create a detector; sessions start at the beginning of a line
    pub fn new(introducer: u8) -> Self {
        Self {
            introducer,
            state: EscapeState::AfterNewline,
        }
    }

    pub fn introducer(&self) -> u8 {
        self.introducer
    }

    #[allow(dead_code)]
    pub fn state(&self) -> EscapeState {
        self.state
    }

    /// True when an escape character typed now would open a command
    #[allow(dead_code)]
    pub fn after_newline(&self) -> bool {
        self.state == EscapeState::AfterNewline
    }

    /// Feed one input byte
    pub fn push(&mut self, byte: u8) -> EscapeAction {
        match self.state {
            EscapeState::EscapePending => {
                self.state = EscapeState::Normal;
                match byte {
                    b'.' => EscapeAction::Disconnect,
                    b'?' => EscapeAction::ShowHelp,
                    b if b == self.introducer => EscapeAction::Forward(self.introducer),
                    b => {
                        self.state = line_state(b);
                        EscapeAction::ForwardPair(self.introducer, b)
                    }
                }
            }
            EscapeState::AfterNewline if byte == self.introducer => {
                self.state = EscapeState::EscapePending;
                EscapeAction::Swallow
            }
            EscapeState::AfterNewline | EscapeState::Normal => {
                self.state = line_state(byte);
                EscapeAction::Forward(byte)
            }
        }
    }
}

impl Default for EscapeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_ESCAPE_CHAR)
    }
}

fn line_state(byte: u8) -> EscapeState {
    if byte == b'\r' || byte == b'\n' {
        EscapeState::AfterNewline
    } else {
        EscapeState::Normal
    }
}

/// Help block shown for `~?`.
///
/// Uses CR LF line endings because the local terminal is in raw mode while
/// the session runs.
pub fn help_text(introducer: u8) -> String {
    let c = introducer as char;
    format!(
        "\r\nSupported escape sequences:\r\n\
         \x20 {c}.  - disconnect\r\n\
         \x20 {c}?  - this message\r\n\
         \x20 {c}{c}  - send the escape character by typing it twice\r\n\
         (Note that escapes are only recognized immediately after newline.)\r\n"
    )
}

/// Parse an escape character setting: a single ASCII character or `none`
pub fn parse_escape_char(value: &str) -> Result<Option<u8>, String> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let bytes = value.as_bytes();
    match bytes {
        [b] if b.is_ascii() && !b.is_ascii_control() => Ok(Some(*b)),
        _ => Err(format!(
            "invalid escape character '{}': expected a single printable ASCII character or 'none'",
            value
        )),
    }
}
