//! Channel state: membership, modes, ban lists, topic, flood control.
//!
//! A channel owns its member arena (keyed by client uid), the pending
//! invite set and the three mask lists. Local members are tracked in a
//! separate subset so fan-out and ban-cache invalidation touch only
//! connections this server owns. A channel with no members is freed;
//! nothing persists across restarts.

pub mod engine;
pub mod extban;
pub mod modes;

use crate::core::client::Uid;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// Maximum channel name length, not counting the prefix character.
pub const CHANNELLEN: usize = 50;
/// Maximum channel key length.
pub const KEYLEN: usize = 24;
/// Parameter-taking mode changes per emitted MODE/TMODE line.
pub const MAXMODEPARAMS: usize = 4;

/// Per-member privilege and cache flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags(pub u32);

impl MemberFlags {
    pub const CHANOP: u32 = 1 << 0;
    pub const HALFOP: u32 = 1 << 1;
    pub const VOICE: u32 = 1 << 2;
    /// is_banned result has been cached for this member.
    pub const BAN_CHECKED: u32 = 1 << 3;
    /// Cached is_banned result: the member is silenced.
    pub const BAN_SILENCED: u32 = 1 << 4;
    /// Mute-extban result has been cached.
    pub const MUTE_CHECKED: u32 = 1 << 5;
    /// Cached mute result: the member is muted.
    pub const MUTE_SILENCED: u32 = 1 << 6;

    pub const STATUS_MASK: u32 = Self::CHANOP | Self::HALFOP | Self::VOICE;
    pub const CACHE_MASK: u32 =
        Self::BAN_CHECKED | Self::BAN_SILENCED | Self::MUTE_CHECKED | Self::MUTE_SILENCED;

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

    /// Prefix string: highest only, or all when `combine` (multi-prefix).
    pub fn prefix(self, combine: bool) -> &'static str {
        if self.has(Self::CHANOP) {
            if !combine {
                return "@";
            }
        } else if self.has(Self::HALFOP) {
            if !combine {
                return "%";
            }
        } else if self.has(Self::VOICE) {
            return "+";
        } else {
            return "";
        }
        match (
            self.has(Self::CHANOP),
            self.has(Self::HALFOP),
            self.has(Self::VOICE),
        ) {
            (true, true, true) => "@%+",
            (true, true, false) => "@%",
            (true, false, true) => "@+",
            (true, false, false) => "@",
            (false, true, true) => "%+",
            (false, true, false) => "%",
            (false, false, true) => "+",
            (false, false, false) => "",
        }
    }
}

/// The (channel, client) edge.
#[derive(Debug, Clone)]
pub struct Member {
    pub uid: Uid,
    pub flags: MemberFlags,
}

/// Which mask list a ban entry lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListType {
    Ban,
    Except,
    Invex,
}

impl ListType {
    /// Bit used in extban applicability masks.
    pub const fn bit(self) -> u32 {
        match self {
            Self::Ban => 1,
            Self::Except => 2,
            Self::Invex => 4,
        }
    }

    pub const fn letter(self) -> char {
        match self {
            Self::Ban => 'b',
            Self::Except => 'e',
            Self::Invex => 'I',
        }
    }
}

/// Parsed host portion of a ban mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Netmask {
    /// Not an address: glob against host names.
    Host,
    /// CIDR match with the given prefix length.
    Cidr { addr: IpAddr, bits: u8 },
}

impl Netmask {
    /// Parse `host` as an address or `addr/prefix`, falling back to a
    /// host glob.
    pub fn parse(host: &str) -> Self {
        let (addr_part, bits_part) = match host.split_once('/') {
            Some((a, b)) => (a, Some(b)),
            None => (host, None),
        };
        let Ok(addr) = addr_part.parse::<IpAddr>() else {
            return Self::Host;
        };
        let full = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let bits = match bits_part {
            Some(b) => match b.parse::<u8>() {
                Ok(n) if n <= full => n,
                _ => return Self::Host,
            },
            None => full,
        };
        Self::Cidr { addr, bits }
    }

    /// Does `ip` fall within this netmask?
    pub fn matches(&self, ip: IpAddr) -> bool {
        let Self::Cidr { addr, bits } = self else {
            return false;
        };
        let bits = *bits as u32;
        match (addr, ip) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(*a) & mask) == (u32::from(b) & mask)
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(*a) & mask) == (u128::from(b) & mask)
            }
            _ => false,
        }
    }
}

/// One entry on a ban, exception or invite-exception list.
#[derive(Debug, Clone)]
pub struct Ban {
    /// Canonical mask string; list-wide unique under folding.
    pub banstr: String,
    /// Parsed components. Matching extbans keep their payload in `host`.
    pub name: String,
    pub user: String,
    pub host: String,
    /// Extban flag word; zero for plain masks.
    pub extban: u32,
    pub netmask: Netmask,
    /// Who set the entry.
    pub who: String,
    /// Wall-clock second the entry was set.
    pub when: u64,
}

/// Channel topic with setter metadata.
#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: u64,
}

/// Simple (parameterless) channel mode bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleModes(pub u32);

impl SimpleModes {
    pub const NOCTRL: u32 = 1 << 0; // +c
    pub const INVITEONLY: u32 = 1 << 1; // +i
    pub const MODERATED: u32 = 1 << 2; // +m
    pub const NOPRIVMSGS: u32 = 1 << 3; // +n
    pub const PRIVATE: u32 = 1 << 4; // +p
    pub const REGISTERED: u32 = 1 << 5; // +r
    pub const SECRET: u32 = 1 << 6; // +s
    pub const TOPICLIMIT: u32 = 1 << 7; // +t
    pub const HIDEBMASKS: u32 = 1 << 8; // +u
    pub const NOCTCP: u32 = 1 << 9; // +C
    pub const NOKNOCK: u32 = 1 << 10; // +K
    pub const EXTLIMIT: u32 = 1 << 11; // +L
    pub const MODREG: u32 = 1 << 12; // +M
    pub const NONICKCHANGE: u32 = 1 << 13; // +N
    pub const OPERONLY: u32 = 1 << 14; // +O
    pub const REGONLY: u32 = 1 << 15; // +R
    pub const SECUREONLY: u32 = 1 << 16; // +S
    pub const NONOTICE: u32 = 1 << 17; // +T

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

/// Channel-level flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags(pub u32);

impl ChannelFlags {
    /// A join-flood notice has been emitted and the bucket has not
    /// emptied since.
    pub const JOIN_FLOOD_NOTICED: u32 = 1 << 0;

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

/// A named group of members.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    /// Wall-clock creation second; the TS used for conflict resolution.
    pub creation_time: u64,
    pub modes: SimpleModes,
    pub limit: Option<u32>,
    pub key: Option<String>,
    pub topic: Option<Topic>,
    /// All members, keyed by uid.
    pub members: HashMap<Uid, Member>,
    /// Locally connected members; always a subset of `members`.
    pub members_local: HashSet<Uid>,
    /// Clients holding a pending invite.
    pub invites: HashSet<Uid>,
    pub bans: Vec<Ban>,
    pub excepts: Vec<Ban>,
    pub invex: Vec<Ban>,
    pub flags: ChannelFlags,
    /// Join-flood leaky bucket.
    pub number_joined: f32,
    /// Monotonic second of the last counted join.
    pub last_join_time: u64,
}

impl Channel {
    pub fn new(name: &str, creation_time: u64, now_monotonic: u64) -> Self {
        Self {
            name: name.to_string(),
            creation_time,
            modes: SimpleModes::default(),
            limit: None,
            key: None,
            topic: None,
            members: HashMap::new(),
            members_local: HashSet::new(),
            invites: HashSet::new(),
            bans: Vec::new(),
            excepts: Vec::new(),
            invex: Vec::new(),
            flags: ChannelFlags::default(),
            number_joined: 0.0,
            last_join_time: now_monotonic,
        }
    }

    pub fn list(&self, list: ListType) -> &Vec<Ban> {
        match list {
            ListType::Ban => &self.bans,
            ListType::Except => &self.excepts,
            ListType::Invex => &self.invex,
        }
    }

    pub fn list_mut(&mut self, list: ListType) -> &mut Vec<Ban> {
        match list {
            ListType::Ban => &mut self.bans,
            ListType::Except => &mut self.excepts,
            ListType::Invex => &mut self.invex,
        }
    }

    /// Total entries across the three mask lists.
    pub fn mask_count(&self) -> usize {
        self.bans.len() + self.excepts.len() + self.invex.len()
    }

    /// Drop cached ban results on every local member. Called whenever
    /// any mask list mutates.
    pub fn clear_ban_cache(&mut self) {
        for uid in &self.members_local {
            if let Some(member) = self.members.get_mut(uid) {
                member.flags.clear(MemberFlags::CACHE_MASK);
            }
        }
    }

    /// NAMES visibility symbol: `@` secret, `*` private, `=` public.
    pub fn visibility_symbol(&self) -> &'static str {
        if self.modes.has(SimpleModes::SECRET) {
            "@"
        } else if self.modes.has(SimpleModes::PRIVATE) {
            "*"
        } else {
            "="
        }
    }

    /// Simple-mode letters plus limit/key, as shown to `with_params`
    /// viewers (members and servers see parameter values).
    pub fn mode_string(&self, with_params: bool) -> (String, String) {
        let mut letters = String::from("+");
        let mut params = String::new();
        for entry in modes::table() {
            if let modes::ModeKind::Simple(bit) = entry.kind
                && self.modes.has(bit)
            {
                letters.push(entry.letter);
            }
        }
        if let Some(limit) = self.limit {
            letters.push('l');
            if with_params {
                params.push_str(&format!("{limit} "));
            }
        }
        if let Some(key) = &self.key {
            letters.push('k');
            if with_params {
                params.push_str(&format!("{key} "));
            }
        }
        if params.ends_with(' ') {
            params.pop();
        }
        (letters, params)
    }

    /// Count one join against the leaky bucket and decay it.
    ///
    /// Returns true exactly when the counter first crosses the
    /// threshold, i.e. when the one flood notice should go out. The
    /// decay subtraction runs unconditionally, also for uncounted
    /// (burst) joins.
    pub fn count_join(
        &mut self,
        now_monotonic: u64,
        counted: bool,
        flood_count: u32,
        flood_time: u64,
    ) -> bool {
        if flood_time == 0 {
            return false;
        }
        if counted {
            self.number_joined += 1.0;
        }
        let elapsed = now_monotonic.saturating_sub(self.last_join_time) as f32;
        self.number_joined -= elapsed * (flood_count as f32 / flood_time as f32);

        let mut notice = false;
        if self.number_joined <= 0.0 {
            self.number_joined = 0.0;
            self.flags.clear(ChannelFlags::JOIN_FLOOD_NOTICED);
        } else if self.number_joined >= flood_count as f32 {
            self.number_joined = flood_count as f32;
            if !self.flags.has(ChannelFlags::JOIN_FLOOD_NOTICED) {
                self.flags.set(ChannelFlags::JOIN_FLOOD_NOTICED);
                notice = true;
            }
        }
        self.last_join_time = now_monotonic;
        notice
    }
}

/// Validate a channel name.
///
/// Names start with a prefix character and contain only channel
/// characters; local creations additionally require printable
/// characters when fake channels are disabled. The accepted length is
/// `CHANNELLEN + 1` counting the leading prefix, matching the
/// original's scan bound.
pub fn check_name(name: &str, local: bool, disable_fake: bool) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !oxirc_proto::casemap::is_chan_prefix(first) {
        return false;
    }
    let strict = local && disable_fake;
    for c in chars.clone() {
        let ok = if strict {
            oxirc_proto::casemap::is_visible_chan_char(c)
        } else {
            oxirc_proto::casemap::is_chan_char(c)
        };
        if !ok {
            return false;
        }
    }
    name.chars().count() <= CHANNELLEN + 1
}

/// Sanitize a channel key: 7-bit, no space/colon/comma, at most
/// [`KEYLEN`] bytes.
pub fn fix_key(arg: &str) -> String {
    arg.bytes()
        .take(KEYLEN)
        .map(|b| b & 0x7f)
        .filter(|&b| b != b':' && b != b',' && b > b' ')
        .map(|b| b as char)
        .collect()
}
