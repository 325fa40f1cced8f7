//! Wire protocol support for oxircd.
//!
//! This crate owns everything about the byte-level protocol: line
//! parsing and serialization, RFC 1459 casemapping, hostmask globbing,
//! and the tokio codec used by the daemon's connection tasks. It has no
//! knowledge of server state.

pub mod casemap;
pub mod codec;
pub mod mask;
pub mod message;
pub mod numeric;

pub use casemap::{fold, irc_eq, is_chan_prefix};
pub use codec::LineCodec;
pub use mask::{collapse, match_mask, split_nuh};
pub use message::{Message, ParseError};
pub use numeric::Numeric;

/// Maximum length of one wire line including the CR-LF terminator.
pub const LINE_MAX: usize = 512;

/// Maximum length of the payload before the CR-LF terminator.
pub const PAYLOAD_MAX: usize = LINE_MAX - 2;

/// Maximum number of space-separated middle parameters.
pub const PARAMS_MAX: usize = 14;
