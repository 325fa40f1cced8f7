//! Client and connection state.
//!
//! A `Client` is any endpoint the server knows about: a locally
//! connected user, a remote user learned over a link, a peer server, or
//! a connection that has not registered yet. Locally connected clients
//! additionally carry a `Connection` with the send queue and the
//! negotiated capability set.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use tokio::sync::mpsc;

/// Stable short identifier: the 3-byte server id for servers, a
/// 9-byte TS6 uid for users.
pub type Uid = String;

/// Maximum nickname length.
pub const NICKLEN: usize = 30;

/// User mode bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes(pub u32);

impl UserModes {
    pub const OPER: u32 = 1 << 0;
    pub const ADMIN: u32 = 1 << 1;
    pub const INVISIBLE: u32 = 1 << 2;
    pub const DEAF: u32 = 1 << 3;
    /// Connected over TLS.
    pub const SECURE: u32 = 1 << 4;
    /// Identified to a services account.
    pub const REGISTERED: u32 = 1 << 5;
    pub const WALLOP: u32 = 1 << 6;
    /// Receives flood notices.
    pub const FLOOD: u32 = 1 << 7;
    /// Receives reserved-channel rejection notices.
    pub const REJ: u32 = 1 << 8;
    pub const SERVNOTICE: u32 = 1 << 9;

    #[inline]
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
    #[inline]
    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }
    #[inline]
    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    /// Letters for the wire, in a fixed order.
    pub fn letters(self) -> String {
        const TABLE: &[(u32, char)] = &[
            (UserModes::ADMIN, 'a'),
            (UserModes::DEAF, 'D'),
            (UserModes::FLOOD, 'f'),
            (UserModes::INVISIBLE, 'i'),
            (UserModes::REJ, 'j'),
            (UserModes::OPER, 'o'),
            (UserModes::REGISTERED, 'r'),
            (UserModes::SECURE, 'S'),
            (UserModes::SERVNOTICE, 's'),
            (UserModes::WALLOP, 'w'),
        ];
        TABLE
            .iter()
            .filter(|(bit, _)| self.has(*bit))
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn from_letters(letters: &str) -> Self {
        let mut modes = Self::default();
        for c in letters.chars() {
            match c {
                'a' => modes.set(Self::ADMIN),
                'D' => modes.set(Self::DEAF),
                'f' => modes.set(Self::FLOOD),
                'i' => modes.set(Self::INVISIBLE),
                'j' => modes.set(Self::REJ),
                'o' => modes.set(Self::OPER),
                'r' => modes.set(Self::REGISTERED),
                'S' => modes.set(Self::SECURE),
                's' => modes.set(Self::SERVNOTICE),
                'w' => modes.set(Self::WALLOP),
                _ => {}
            }
        }
        modes
    }
}

/// Client capability bits negotiated via CAP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps(pub u32);

impl Caps {
    pub const MULTI_PREFIX: u32 = 1 << 0;
    pub const UHNAMES: u32 = 1 << 1;
    pub const EXTENDED_JOIN: u32 = 1 << 2;
    pub const AWAY_NOTIFY: u32 = 1 << 3;
    pub const ACCOUNT_NOTIFY: u32 = 1 << 4;

    pub const NAMES: &[(&'static str, u32)] = &[
        ("multi-prefix", Self::MULTI_PREFIX),
        ("userhost-in-names", Self::UHNAMES),
        ("extended-join", Self::EXTENDED_JOIN),
        ("away-notify", Self::AWAY_NOTIFY),
        ("account-notify", Self::ACCOUNT_NOTIFY),
    ];

    /// True when all bits in `mask` are present.
    #[inline]
    pub fn has_all(self, mask: u32) -> bool {
        self.0 & mask == mask
    }
    /// True when any bit in `mask` is present.
    #[inline]
    pub fn has_any(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    pub fn from_token(token: &str) -> Option<u32> {
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, bit)| *bit)
    }
}

/// Server link capability bits exchanged via CAPAB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCaps(pub u32);

impl ServerCaps {
    /// Quit storm: peer understands SQUIT-implied quits.
    pub const QS: u32 = 1 << 0;
    /// Ban exceptions (+e).
    pub const EX: u32 = 1 << 1;
    /// Invite exceptions (+I).
    pub const IE: u32 = 1 << 2;
    pub const ENCAP: u32 = 1 << 3;
    pub const TBURST: u32 = 1 << 4;
    pub const EOB: u32 = 1 << 5;

    pub const NAMES: &[(&'static str, u32)] = &[
        ("QS", Self::QS),
        ("EX", Self::EX),
        ("IE", Self::IE),
        ("ENCAP", Self::ENCAP),
        ("TBURST", Self::TBURST),
        ("EOB", Self::EOB),
    ];

    #[inline]
    pub fn has_all(self, mask: u32) -> bool {
        self.0 & mask == mask
    }
    #[inline]
    pub fn has_any(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    /// The full set we advertise.
    pub fn ours() -> Self {
        Self(Self::QS | Self::EX | Self::IE | Self::ENCAP | Self::TBURST | Self::EOB)
    }

    pub fn advertisement() -> String {
        Self::NAMES
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn parse(tokens: &str) -> Self {
        let mut caps = Self::default();
        for token in tokens.split_ascii_whitespace() {
            if let Some((_, bit)) = Self::NAMES.iter().find(|(name, _)| *name == token) {
                caps.0 |= bit;
            }
        }
        caps
    }
}

/// Registration lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Accepted but not yet registered.
    Unknown,
    /// Outbound link with TCP connect in flight.
    Connecting,
    /// Outbound or inbound link that has sent PASS/CAPAB/SERVER.
    Handshake,
    /// Registered peer server.
    Server,
    /// Registered user.
    Client,
}

/// Miscellaneous client flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientFlags(pub u32);

impl ClientFlags {
    /// Socket is unusable; skipped by fan-out, reaped at end of tick.
    pub const DEAD: u32 = 1 << 0;
    /// Exited because the send queue overflowed.
    pub const SENDQEX: u32 = 1 << 1;
    /// Ping cookie has been echoed back.
    pub const PING_COOKIE: u32 = 1 << 2;
    /// Network service (exempt from most checks).
    pub const SERVICE: u32 = 1 << 3;
    /// Peer finished bursting.
    pub const EOB: u32 = 1 << 4;
    /// Hidden server.
    pub const HIDDEN: u32 = 1 << 5;

    #[inline]
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
    #[inline]
    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }
    #[inline]
    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }
}

/// Registration progress of a local connection.
#[derive(Debug, Clone, Default)]
pub struct RegProgress {
    pub nick: bool,
    pub user: bool,
    pub cap_negotiating: bool,
}

/// Per-connection state for locally connected clients.
#[derive(Debug)]
pub struct Connection {
    /// Send queue feeding the writer task.
    pub tx: mpsc::UnboundedSender<String>,
    /// Bytes currently queued, shared with the writer task.
    pub sendq_bytes: Arc<AtomicUsize>,
    /// Queue cap from the class block.
    pub sendq_limit: usize,
    /// Negotiated client capabilities.
    pub caps: Caps,
    /// Link capabilities from CAPAB (server links).
    pub server_caps: ServerCaps,
    /// Fan-out dedup marker; compared against the core serial.
    pub serial: u64,
    /// PASS argument, checked at registration.
    pub password: Option<String>,
    /// Random cookie the client must echo in PONG.
    pub ping_cookie: Option<u32>,
    /// Connected over a TLS listener.
    pub is_tls: bool,
    /// For links: PASS/CAPAB/SERVER already sent (outbound connects).
    pub sent_handshake: bool,
    pub reg: RegProgress,
    /// Class this connection is bound to.
    pub class: String,
    /// Monotonic second of the last PING we sent.
    pub last_ping: u64,
    /// Monotonic second of the last data from the peer.
    pub last_data: u64,
    /// Spambot tracking.
    pub join_leave_count: u32,
    pub oper_warn_countdown: u32,
    pub last_join_time: u64,
    pub last_leave_time: u64,
    /// Monotonic second of the last paced command.
    pub last_paced: u64,
    /// Messages counted on enqueue.
    pub messages_sent: u64,
    /// Bytes counted by the writer task after successful writes.
    pub bytes_sent: Arc<AtomicU64>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<String>, sendq_limit: usize, class: String) -> Self {
        Self {
            tx,
            sendq_bytes: Arc::new(AtomicUsize::new(0)),
            sendq_limit,
            caps: Caps::default(),
            server_caps: ServerCaps::default(),
            serial: 0,
            password: None,
            ping_cookie: None,
            is_tls: false,
            sent_handshake: false,
            reg: RegProgress::default(),
            class,
            last_ping: 0,
            last_data: 0,
            join_leave_count: 0,
            oper_warn_countdown: 0,
            last_join_time: 0,
            last_leave_time: 0,
            last_paced: 0,
            messages_sent: 0,
            bytes_sent: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// A user, server, or unregistered connection.
#[derive(Debug)]
pub struct Client {
    pub uid: Uid,
    /// Display nick for users, server name for servers.
    pub name: String,
    pub username: String,
    /// Shown host (may be a cloak).
    pub host: String,
    /// Actual resolved host.
    pub realhost: String,
    /// Textual socket address.
    pub sockhost: String,
    pub ip: Option<IpAddr>,
    /// Real name / server description.
    pub info: String,
    /// Services account label, `*` when logged out.
    pub account: String,
    pub away: String,
    pub umodes: UserModes,
    pub status: Status,
    pub flags: ClientFlags,
    /// Uplink: own uid for local clients, the introducing peer's uid
    /// for remote ones. Never reassigned while the peer is connected.
    pub from: Uid,
    /// Wall-clock creation second; TS6 nick timestamp.
    pub tsinfo: u64,
    /// Monotonic creation second.
    pub created_monotonic: u64,
    /// Folded names of channels this client is on.
    pub channels: HashSet<String>,
    /// TLS certificate fingerprint, when one was presented.
    pub certfp: Option<String>,
    /// Present only for locally connected clients.
    pub conn: Option<Connection>,
}

impl Client {
    pub fn new(uid: Uid, status: Status) -> Self {
        Self {
            from: uid.clone(),
            uid,
            name: String::new(),
            username: String::new(),
            host: String::new(),
            realhost: String::new(),
            sockhost: String::new(),
            ip: None,
            info: String::new(),
            account: "*".to_string(),
            away: String::new(),
            umodes: UserModes::default(),
            status,
            flags: ClientFlags::default(),
            tsinfo: 0,
            created_monotonic: 0,
            channels: HashSet::new(),
            certfp: None,
            conn: None,
        }
    }

    /// Locally connected?
    #[inline]
    pub fn is_local(&self) -> bool {
        self.conn.is_some()
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.status == Status::Server
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.status == Status::Client
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flags.has(ClientFlags::DEAD)
    }

    #[inline]
    pub fn is_service(&self) -> bool {
        self.flags.has(ClientFlags::SERVICE)
    }

    /// `nick!user@host` form used in client-facing prefixes.
    pub fn prefix(&self) -> String {
        format!("{}!{}@{}", self.name, self.username, self.host)
    }

    /// Client caps, empty for remote clients.
    #[inline]
    pub fn caps(&self) -> Caps {
        self.conn.as_ref().map(|c| c.caps).unwrap_or_default()
    }

    /// Name with host, IP-masked unless `show_ip`.
    pub fn describe(&self, show_ip: bool) -> String {
        if show_ip {
            format!("{}[{}]", self.name, self.sockhost)
        } else {
            format!("{}[{}]", self.name, self.host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umode_letters_round_trip() {
        let mut modes = UserModes::default();
        modes.set(UserModes::OPER);
        modes.set(UserModes::WALLOP);
        modes.set(UserModes::SECURE);
        assert_eq!(modes.letters(), "oSw");
        assert_eq!(UserModes::from_letters("oSw"), modes);
        assert_eq!(UserModes::from_letters("xyz9"), UserModes::default());
    }

    #[test]
    fn caps_lookup() {
        assert_eq!(Caps::from_token("multi-prefix"), Some(Caps::MULTI_PREFIX));
        assert_eq!(Caps::from_token("sasl"), None);
        let caps = Caps(Caps::MULTI_PREFIX | Caps::AWAY_NOTIFY);
        assert!(caps.has_all(Caps::MULTI_PREFIX));
        assert!(!caps.has_all(Caps::MULTI_PREFIX | Caps::UHNAMES));
        assert!(caps.has_any(Caps::UHNAMES | Caps::AWAY_NOTIFY));
    }

    #[test]
    fn server_caps_parse() {
        let caps = ServerCaps::parse("QS EX BOGUS IE");
        assert!(caps.has_all(ServerCaps::QS | ServerCaps::EX | ServerCaps::IE));
        assert!(!caps.has_any(ServerCaps::ENCAP));
    }
}
