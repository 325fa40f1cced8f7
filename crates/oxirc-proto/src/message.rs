//! Line parsing and serialization.
//!
//! One wire line is `[":" prefix SP] verb *( SP param ) [SP ":" trailing]`
//! terminated by CR-LF and capped at 512 bytes. Parsing splits a line
//! into at most [`PARAMS_MAX`] middle parameters plus one trailing
//! parameter; serialization writes the same shape back and truncates
//! anything past 510 bytes before appending the terminator.

use crate::{PARAMS_MAX, PAYLOAD_MAX};
use thiserror::Error;

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message source, without the leading `:`.
    pub prefix: Option<String>,
    /// Verb: alphabetic command or three-digit numeric.
    pub command: String,
    /// Parameters, the last of which may have been a trailing parameter.
    pub params: Vec<String>,
    /// Whether the final parameter was introduced by ` :`.
    trailing: bool,
}

/// Errors produced while parsing a line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("missing command")]
    MissingCommand,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl Message {
    /// Build an outbound message. The trailing flag is derived on
    /// serialization, so callers never set it by hand.
    pub fn new<C: Into<String>>(prefix: Option<String>, command: C, params: Vec<String>) -> Self {
        Self {
            prefix,
            command: command.into(),
            params,
            trailing: false,
        }
    }

    /// Parse one line (without its CR-LF terminator).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (pfx, tail) = match stripped.split_once(' ') {
                Some((p, t)) => (p, t),
                None => return Err(ParseError::MissingCommand),
            };
            if pfx.is_empty() {
                return Err(ParseError::MissingCommand);
            }
            prefix = Some(pfx.to_string());
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut tail) = match rest.split_once(' ') {
            Some((c, t)) => (c, t.trim_start_matches(' ')),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        let numeric = command.len() == 3 && command.bytes().all(|b| b.is_ascii_digit());
        if !numeric && !command.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(ParseError::InvalidCommand(command.to_string()));
        }

        let mut params = Vec::new();
        let mut trailing = false;
        while !tail.is_empty() {
            if let Some(t) = tail.strip_prefix(':') {
                params.push(t.to_string());
                trailing = true;
                break;
            }
            if params.len() == PARAMS_MAX {
                // Fifteenth parameter absorbs the remainder.
                params.push(tail.to_string());
                trailing = true;
                break;
            }
            match tail.split_once(' ') {
                Some((p, t)) => {
                    params.push(p.to_string());
                    tail = t.trim_start_matches(' ');
                }
                None => {
                    params.push(tail.to_string());
                    break;
                }
            }
        }

        Ok(Self {
            prefix,
            command: command.to_string(),
            params,
            trailing,
        })
    }

    /// Whether the final parameter requires the ` :` introducer to
    /// survive a round trip.
    fn needs_trailing(&self) -> bool {
        match self.params.last() {
            Some(last) => {
                self.trailing || last.is_empty() || last.contains(' ') || last.starts_with(':')
            }
            None => false,
        }
    }

    /// Serialize without the CR-LF terminator, truncated to 510 bytes.
    pub fn to_line(&self) -> String {
        let mut out = String::with_capacity(64);
        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);

        let needs_trailing = self.needs_trailing();
        for (i, param) in self.params.iter().enumerate() {
            out.push(' ');
            if i + 1 == self.params.len() && needs_trailing {
                out.push(':');
            }
            out.push_str(param);
        }

        if out.len() > PAYLOAD_MAX {
            let mut cut = PAYLOAD_MAX;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
        }
        out
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_line())
    }
}
