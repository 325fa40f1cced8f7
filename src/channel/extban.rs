//! Extended ban types.
//!
//! An extban is a `$`-prefixed variant of a list mask, identified by a
//! character and a single bit inside the extban word. Two disjoint
//! classes exist: *matching* extbans participate in `is_banned`-style
//! checks with their own predicate, *acting* extbans apply a side
//! effect at a specific moment (mute at send time, join restriction at
//! join time) and otherwise carry an ordinary `nick!user@host` payload.
//! A mask may combine at most one acting and one matching extban, e.g.
//! `$m$a:account` mutes everyone logged into a matching account.

use super::{Ban, Channel, ListType};
use crate::core::client::Client;

/// Matching extban: server name (`$s:<glob>`).
pub const EXTBAN_SERVER: u32 = 1 << 0;
/// Matching extban: services account (`$a:<glob>`).
pub const EXTBAN_ACCOUNT: u32 = 1 << 1;
/// Acting extban: suppress channel speech (`$m:<n!u@h>`).
pub const EXTBAN_MUTE: u32 = 1 << 16;
/// Acting extban: deny join (`$j:<n!u@h>`).
pub const EXTBAN_JOIN: u32 = 1 << 17;

/// Bits of all registered matching extbans.
pub const fn matching_mask() -> u32 {
    EXTBAN_SERVER | EXTBAN_ACCOUNT
}

/// Bits of all registered acting extbans.
pub const fn acting_mask() -> u32 {
    EXTBAN_MUTE | EXTBAN_JOIN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtbanClass {
    Matching,
    Acting,
}

/// Outcome of parsing the `$`-prefix of a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedPrefix {
    /// No `$` prefix; a plain mask.
    None,
    /// Unknown character or an invalid combination.
    Invalid,
    /// Recognized prefix; `offset` is the byte length consumed
    /// including the `:` separator.
    Extban { word: u32, offset: usize },
}

/// Predicate for matching extbans. The payload is `ban.host`.
pub type MatchFn = fn(&Client, &Channel, &Ban, me_name: &str) -> bool;

/// A registered extban type.
pub struct Extban {
    pub character: char,
    pub flag: u32,
    pub class: ExtbanClass,
    /// Which of the ban/except/invex lists this type may appear on.
    pub types: u32,
    pub matches: Option<MatchFn>,
}

fn server_matches(_client: &Client, _channel: &Channel, ban: &Ban, me_name: &str) -> bool {
    oxirc_proto::match_mask(&ban.host, me_name)
}

fn account_matches(client: &Client, _channel: &Channel, ban: &Ban, _me_name: &str) -> bool {
    client.account != "*" && oxirc_proto::match_mask(&ban.host, &client.account)
}

/// The registered extban table.
pub struct ExtbanRegistry {
    entries: Vec<Extban>,
}

impl Default for ExtbanRegistry {
    fn default() -> Self {
        Self {
            entries: vec![
                Extban {
                    character: 's',
                    flag: EXTBAN_SERVER,
                    class: ExtbanClass::Matching,
                    types: ListType::Ban.bit() | ListType::Invex.bit(),
                    matches: Some(server_matches),
                },
                Extban {
                    character: 'a',
                    flag: EXTBAN_ACCOUNT,
                    class: ExtbanClass::Matching,
                    types: ListType::Ban.bit() | ListType::Except.bit() | ListType::Invex.bit(),
                    matches: Some(account_matches),
                },
                Extban {
                    character: 'm',
                    flag: EXTBAN_MUTE,
                    class: ExtbanClass::Acting,
                    types: ListType::Ban.bit() | ListType::Except.bit(),
                    matches: None,
                },
                Extban {
                    character: 'j',
                    flag: EXTBAN_JOIN,
                    class: ExtbanClass::Acting,
                    types: ListType::Ban.bit() | ListType::Except.bit(),
                    matches: None,
                },
            ],
        }
    }
}

impl ExtbanRegistry {
    pub fn find_char(&self, c: char) -> Option<&Extban> {
        self.entries.iter().find(|e| e.character == c)
    }

    /// Look up by any flag bit set in `word`.
    pub fn find_flag(&self, word: u32) -> Option<&Extban> {
        self.entries.iter().find(|e| e.flag & word != 0)
    }

    /// Parse the extban prefix of `mask`.
    ///
    /// At most one matching and one acting extban may combine; a second
    /// of either class, or an unknown character, fails the parse.
    pub fn parse(&self, mask: &str) -> ParsedPrefix {
        if !mask.starts_with('$') {
            return ParsedPrefix::None;
        }
        let mut word = 0u32;
        let mut offset = 0usize;
        let mut chars = mask.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '$' {
                let Some(&(_, flag_char)) = chars.peek() else {
                    return ParsedPrefix::Invalid;
                };
                let Some(entry) = self.find_char(flag_char) else {
                    return ParsedPrefix::Invalid;
                };
                let class_mask = match entry.class {
                    ExtbanClass::Matching => matching_mask(),
                    ExtbanClass::Acting => acting_mask(),
                };
                if word & class_mask != 0 {
                    return ParsedPrefix::Invalid;
                }
                word |= entry.flag;
                chars.next();
            } else if c == ':' {
                offset = i + 1;
                break;
            } else {
                return ParsedPrefix::Invalid;
            }
        }
        if offset == 0 {
            return ParsedPrefix::Invalid;
        }
        ParsedPrefix::Extban { word, offset }
    }

    /// Re-render an extban word into its canonical `$ch[$ch]:` prefix.
    /// Empty for a zero word.
    pub fn format(&self, word: u32) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            if word & entry.flag != 0 {
                out.push('$');
                out.push(entry.character);
            }
        }
        if !out.is_empty() {
            out.push(':');
        }
        out
    }

    /// Validate that every extban bit in `word` may appear on `list`.
    pub fn allowed_on(&self, word: u32, list: ListType) -> bool {
        self.entries
            .iter()
            .filter(|e| word & e.flag != 0)
            .all(|e| e.types & list.bit() != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ExtbanRegistry {
        ExtbanRegistry::default()
    }

    #[test]
    fn plain_masks_pass_through() {
        assert_eq!(registry().parse("*!*@host"), ParsedPrefix::None);
    }

    #[test]
    fn single_extban_parses() {
        match registry().parse("$s:hub.*") {
            ParsedPrefix::Extban { word, offset } => {
                assert_eq!(word, EXTBAN_SERVER);
                assert_eq!(&"$s:hub.*"[offset..], "hub.*");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn acting_and_matching_combine() {
        match registry().parse("$m$a:spammer") {
            ParsedPrefix::Extban { word, offset } => {
                assert_eq!(word, EXTBAN_MUTE | EXTBAN_ACCOUNT);
                assert_eq!(&"$m$a:spammer"[offset..], "spammer");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_prefixes_fail() {
        assert_eq!(registry().parse("$x:foo"), ParsedPrefix::Invalid);
        assert_eq!(registry().parse("$"), ParsedPrefix::Invalid);
        assert_eq!(registry().parse("$s$a:foo"), ParsedPrefix::Invalid);
        assert_eq!(registry().parse("$m$j:foo"), ParsedPrefix::Invalid);
        assert_eq!(registry().parse("$snocolon"), ParsedPrefix::Invalid);
    }

    #[test]
    fn canonical_format() {
        let reg = registry();
        assert_eq!(reg.format(EXTBAN_SERVER), "$s:");
        assert_eq!(reg.format(EXTBAN_ACCOUNT | EXTBAN_MUTE), "$a$m:");
        assert_eq!(reg.format(0), "");
    }

    #[test]
    fn list_applicability() {
        let reg = registry();
        assert!(reg.allowed_on(EXTBAN_SERVER, ListType::Ban));
        assert!(reg.allowed_on(EXTBAN_SERVER, ListType::Invex));
        assert!(!reg.allowed_on(EXTBAN_SERVER, ListType::Except));
        assert!(!reg.allowed_on(EXTBAN_MUTE, ListType::Invex));
    }
}
