//! Channel mode parsing, application and wire emission.
//!
//! One MODE invocation walks the mode string left to right under the
//! current direction sigil, dispatching each letter through the mode
//! table. Changes accumulate in a per-invocation builder and are
//! emitted afterwards in two independent passes: a client-facing MODE
//! line (names as parameters) and a server-facing TMODE line tagged
//! with the channel creation timestamp (ids as parameters). Both passes
//! split at MAXMODEPARAMS parameter-taking changes or the line cap.

use super::extban::{self, ParsedPrefix};
use super::{Ban, ListType, MAXMODEPARAMS, MemberFlags, Netmask, SimpleModes, fix_key};
use crate::core::Core;
use crate::core::client::{Client, Status, Uid, UserModes};
use oxirc_proto::{Numeric, collapse, fold, irc_eq, split_nuh};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Quantized channel access of the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    NotOnChan,
    Peon,
    HalfOp,
    ChanOp,
    /// Non-local initiator; peer servers are trusted and bypass checks.
    Remote,
}

/// How a mode letter behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    /// Toggle a bit in the channel's simple mode set.
    Simple(u32),
    /// Set or clear a member status flag.
    Flag(u32),
    /// Add or delete an entry on a mask list.
    Mask(ListType),
    Limit,
    Key,
}

/// One entry of the mode table.
pub struct ChanMode {
    pub letter: char,
    pub kind: ModeKind,
    pub required: Access,
    pub only_opers: bool,
    pub only_servers: bool,
}

const fn simple(letter: char, bit: u32) -> ChanMode {
    ChanMode {
        letter,
        kind: ModeKind::Simple(bit),
        required: Access::HalfOp,
        only_opers: false,
        only_servers: false,
    }
}

static TABLE: &[ChanMode] = &[
    ChanMode {
        letter: 'b',
        kind: ModeKind::Mask(ListType::Ban),
        required: Access::HalfOp,
        only_opers: false,
        only_servers: false,
    },
    simple('c', SimpleModes::NOCTRL),
    ChanMode {
        letter: 'e',
        kind: ModeKind::Mask(ListType::Except),
        required: Access::HalfOp,
        only_opers: false,
        only_servers: false,
    },
    ChanMode {
        letter: 'h',
        kind: ModeKind::Flag(MemberFlags::HALFOP),
        required: Access::ChanOp,
        only_opers: false,
        only_servers: false,
    },
    simple('i', SimpleModes::INVITEONLY),
    ChanMode {
        letter: 'k',
        kind: ModeKind::Key,
        required: Access::HalfOp,
        only_opers: false,
        only_servers: false,
    },
    ChanMode {
        letter: 'l',
        kind: ModeKind::Limit,
        required: Access::HalfOp,
        only_opers: false,
        only_servers: false,
    },
    simple('m', SimpleModes::MODERATED),
    simple('n', SimpleModes::NOPRIVMSGS),
    ChanMode {
        letter: 'o',
        kind: ModeKind::Flag(MemberFlags::CHANOP),
        required: Access::ChanOp,
        only_opers: false,
        only_servers: false,
    },
    simple('p', SimpleModes::PRIVATE),
    ChanMode {
        letter: 'r',
        kind: ModeKind::Simple(SimpleModes::REGISTERED),
        required: Access::Remote,
        only_opers: false,
        only_servers: true,
    },
    simple('s', SimpleModes::SECRET),
    simple('t', SimpleModes::TOPICLIMIT),
    simple('u', SimpleModes::HIDEBMASKS),
    ChanMode {
        letter: 'v',
        kind: ModeKind::Flag(MemberFlags::VOICE),
        required: Access::HalfOp,
        only_opers: false,
        only_servers: false,
    },
    simple('C', SimpleModes::NOCTCP),
    ChanMode {
        letter: 'I',
        kind: ModeKind::Mask(ListType::Invex),
        required: Access::HalfOp,
        only_opers: false,
        only_servers: false,
    },
    simple('K', SimpleModes::NOKNOCK),
    ChanMode {
        letter: 'L',
        kind: ModeKind::Simple(SimpleModes::EXTLIMIT),
        required: Access::HalfOp,
        only_opers: true,
        only_servers: false,
    },
    simple('M', SimpleModes::MODREG),
    simple('N', SimpleModes::NONICKCHANGE),
    ChanMode {
        letter: 'O',
        kind: ModeKind::Simple(SimpleModes::OPERONLY),
        required: Access::HalfOp,
        only_opers: true,
        only_servers: false,
    },
    simple('R', SimpleModes::REGONLY),
    simple('S', SimpleModes::SECUREONLY),
    simple('T', SimpleModes::NONOTICE),
];

/// The full mode table, in letter order.
pub fn table() -> &'static [ChanMode] {
    TABLE
}

/// Simple-mode bit for a letter, if it names a simple mode.
pub(crate) fn simple_bit_for(letter: char) -> Option<u32> {
    match lookup(letter)?.kind {
        ModeKind::Simple(bit) => Some(bit),
        _ => None,
    }
}

/// 256-slot letter lookup, built on first use.
fn mode_map() -> &'static [Option<u8>; 256] {
    static MAP: OnceLock<[Option<u8>; 256]> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut map = [None; 256];
        for (i, entry) in TABLE.iter().enumerate() {
            map[entry.letter as usize] = Some(i as u8);
        }
        map
    })
}

fn lookup(letter: char) -> Option<&'static ChanMode> {
    if !letter.is_ascii() {
        return None;
    }
    mode_map()[letter as usize].map(|i| &TABLE[i as usize])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Add,
    Del,
    Query,
}

/// One applied change, queued for emission.
#[derive(Debug, Clone)]
pub struct ModeChange {
    /// `'\0'` marks a nullified (superseded) change.
    pub letter: char,
    pub dir: Direction,
    pub arg: Option<String>,
    /// Id form of the argument for server propagation.
    pub id: Option<Uid>,
    /// Zero shows the change to everyone; otherwise only to members
    /// whose status intersects the mask (hidden ban masks).
    pub hide_from: u32,
}

// Error classes reported at most once per invocation.
const SM_ERR_NOOPS: u32 = 1 << 0;
const SM_ERR_UNKNOWN: u32 = 1 << 1;
const SM_ERR_RPL_B: u32 = 1 << 2;
const SM_ERR_RPL_E: u32 = 1 << 3;
const SM_ERR_RPL_I: u32 = 1 << 4;
const SM_ERR_NOTONCHANNEL: u32 = 1 << 5;
const SM_ERR_NOTOPER: u32 = 1 << 6;
const SM_ERR_ONLYSERVER: u32 = 1 << 7;

/// Per-invocation scratch state.
#[derive(Default)]
struct ModeBuilder {
    changes: Vec<ModeChange>,
    /// Parameter-taking changes consumed by a local initiator.
    mode_limit: usize,
    /// Simple modes already coalesced this invocation.
    simple_mask: u32,
    errors: u32,
    numerics: Vec<(Numeric, String)>,
}

impl ModeBuilder {
    fn numeric_once(&mut self, class: u32, numeric: Numeric, tail: String) {
        if self.errors & class != 0 {
            return;
        }
        self.errors |= class;
        self.numerics.push((numeric, tail));
    }
}

/// Source attributes snapshotted before parsing.
struct SourceInfo {
    uid: Uid,
    local: bool,
    server_or_service: bool,
    oper: bool,
    prefix: String,
    name: String,
}

/// Compute the initiator's access level on the channel.
pub fn channel_access(core: &Core, source: &str, channel: &str) -> Access {
    let Some(client) = core.clients.get(source) else {
        return Access::Remote;
    };
    if !client.is_local() {
        return Access::Remote;
    }
    match core.membership(channel, source) {
        None => Access::NotOnChan,
        Some(flags) if flags.has(MemberFlags::CHANOP) => Access::ChanOp,
        Some(flags) if flags.has(MemberFlags::HALFOP) => Access::HalfOp,
        Some(_) => Access::Peon,
    }
}

/// Apply and propagate one MODE invocation.
///
/// `parv[0]` is the mode string, the rest are its parameters. All
/// changes are applied in parse order before anything is emitted;
/// failures inside the batch leave prior changes in place.
pub fn channel_mode_set(core: &mut Core, source: &str, channel: &str, parv: &[String]) {
    let alevel = channel_access(core, source, channel);
    let src = {
        let Some(client) = core.clients.get(source) else {
            return;
        };
        SourceInfo {
            uid: source.to_string(),
            local: client.is_local(),
            server_or_service: client.is_server() || client.is_service(),
            oper: client.umodes.has(UserModes::OPER),
            prefix: client.prefix(),
            name: client.name.clone(),
        }
    };

    let mut builder = ModeBuilder::default();

    {
        // Split the core so the channel can be mutated while clients
        // and registries stay readable.
        let Core {
            channels,
            clients,
            nicks,
            extbans,
            config,
            time,
            ..
        } = core;
        let Some(chan) = channels.get_mut(channel) else {
            return;
        };

        let mut dir = Direction::Add;
        let mut parn = 1usize;
        let mut ms_idx = 0usize;

        if parv.is_empty() {
            return;
        }
        // After one mode string is exhausted, a leftover parameter
        // opening with a direction sigil continues the invocation.
        loop {
            for c in parv[ms_idx].chars() {
                match c {
                    '+' => dir = Direction::Add,
                    '-' => dir = Direction::Del,
                    '=' => dir = Direction::Query,
                    letter => match lookup(letter) {
                        None => {
                            builder.numeric_once(
                                SM_ERR_UNKNOWN,
                                Numeric::ErrUnknownMode,
                                format!("{letter} :is unknown mode char to me"),
                            );
                        }
                        Some(mode) => match mode.kind {
                            ModeKind::Simple(bit) => {
                                chm_simple(&mut builder, chan, &src, alevel, dir, mode, bit)
                            }
                            ModeKind::Flag(bit) => chm_flag(
                                &mut builder,
                                chan,
                                clients,
                                nicks,
                                &src,
                                alevel,
                                dir,
                                mode,
                                bit,
                                parv,
                                &mut parn,
                            ),
                            ModeKind::Mask(list) => chm_mask(
                                &mut builder,
                                chan,
                                extbans,
                                config,
                                time.real,
                                &src,
                                alevel,
                                dir,
                                mode,
                                list,
                                parv,
                                &mut parn,
                            ),
                            ModeKind::Limit => chm_limit(
                                &mut builder, chan, &src, alevel, dir, mode, parv, &mut parn,
                            ),
                            ModeKind::Key => chm_key(
                                &mut builder, chan, &src, alevel, dir, mode, parv, &mut parn,
                            ),
                        },
                    },
                }
            }
            if parn < parv.len() && parv[parn].starts_with(['+', '-', '=']) {
                ms_idx = parn;
                parn += 1;
            } else {
                break;
            }
        }
    }

    for (numeric, tail) in std::mem::take(&mut builder.numerics) {
        core.sendto_one_numeric(source, numeric, &tail);
    }

    if builder.changes.iter().all(|c| c.letter == '\0') {
        return;
    }

    send_mode_changes_client(core, &src, channel, &builder.changes);
    send_mode_changes_server(core, &src, channel, &builder.changes);
}

fn access_denied(builder: &mut ModeBuilder, chan_name: &str, alevel: Access) {
    let (numeric, tail) = if alevel == Access::NotOnChan {
        (
            Numeric::ErrNotOnChannel,
            format!("{chan_name} :You're not on that channel"),
        )
    } else {
        (
            Numeric::ErrChanOpPrivsNeeded,
            format!("{chan_name} :You're not channel operator"),
        )
    };
    builder.numeric_once(SM_ERR_NOOPS, numeric, tail);
}

fn chm_simple(
    builder: &mut ModeBuilder,
    chan: &mut super::Channel,
    src: &SourceInfo,
    alevel: Access,
    dir: Direction,
    mode: &ChanMode,
    bit: u32,
) {
    if mode.only_opers && src.local && !src.oper {
        builder.numeric_once(
            SM_ERR_NOTOPER,
            Numeric::ErrNoPrivileges,
            ":Permission Denied - You're not an IRC operator".to_string(),
        );
        return;
    }
    if mode.only_servers && !src.server_or_service {
        let (numeric, tail) = if alevel == Access::NotOnChan {
            (
                Numeric::ErrNotOnChannel,
                format!("{} :You're not on that channel", chan.name),
            )
        } else {
            (
                Numeric::ErrOnlyServersCanChange,
                format!("{} :Only servers can change that mode", chan.name),
            )
        };
        builder.numeric_once(SM_ERR_ONLYSERVER, numeric, tail);
        return;
    }
    if alevel < mode.required {
        access_denied(builder, &chan.name, alevel);
        return;
    }

    // Each simple mode is coalesced at most once per invocation.
    if builder.simple_mask & bit != 0 {
        return;
    }
    builder.simple_mask |= bit;

    match dir {
        Direction::Add => {
            if src.local && chan.modes.has(bit) {
                return;
            }
            chan.modes.set(bit);
        }
        Direction::Del => {
            if src.local && !chan.modes.has(bit) {
                return;
            }
            chan.modes.clear(bit);
        }
        Direction::Query => return,
    }

    builder.changes.push(ModeChange {
        letter: mode.letter,
        dir,
        arg: None,
        id: None,
        hide_from: 0,
    });
}

#[allow(clippy::too_many_arguments)]
fn chm_flag(
    builder: &mut ModeBuilder,
    chan: &mut super::Channel,
    clients: &HashMap<Uid, Client>,
    nicks: &HashMap<String, Uid>,
    src: &SourceInfo,
    alevel: Access,
    dir: Direction,
    mode: &ChanMode,
    bit: u32,
    parv: &[String],
    parn: &mut usize,
) {
    if alevel < mode.required {
        access_denied(builder, &chan.name, alevel);
        return;
    }
    if dir == Direction::Query || parv.len() <= *parn {
        return;
    }

    let target_arg = &parv[*parn];
    *parn += 1;

    // Chase by uid first, then by nick.
    let target = clients
        .get(target_arg.as_str())
        .or_else(|| nicks.get(&fold(target_arg)).and_then(|u| clients.get(u)))
        .filter(|c| c.status == Status::Client);
    let Some(target) = target else {
        builder
            .numerics
            .push((Numeric::ErrNoSuchNick, format!("{target_arg} :No such nick/channel")));
        return;
    };

    let Some(member) = chan.members.get_mut(&target.uid) else {
        builder.numeric_once(
            SM_ERR_NOTONCHANNEL,
            Numeric::ErrUserNotInChannel,
            format!("{} {} :They aren't on that channel", target.name, chan.name),
        );
        return;
    };

    if src.local {
        builder.mode_limit += 1;
        if builder.mode_limit > MAXMODEPARAMS {
            return;
        }
    }

    match dir {
        Direction::Add => {
            if member.flags.has(bit) {
                return; // No redundant mode changes.
            }
            member.flags.set(bit);
        }
        Direction::Del => {
            if !member.flags.has(bit) {
                return;
            }
            member.flags.clear(bit);
        }
        Direction::Query => return,
    }

    builder.changes.push(ModeChange {
        letter: mode.letter,
        dir,
        arg: Some(target.name.clone()),
        id: Some(target.uid.clone()),
        hide_from: 0,
    });
}

/// Canonical mask string for storage: extban prefix plus either the
/// raw payload (matching extbans) or the normalized `n!u@h`.
fn render_mask(extbans: &extban::ExtbanRegistry, ban: &Ban) -> String {
    let prefix = extbans.format(ban.extban);
    if ban.extban & extban::matching_mask() != 0 {
        format!("{prefix}{}", ban.host)
    } else {
        format!("{prefix}{}!{}@{}", ban.name, ban.user, ban.host)
    }
}

#[allow(clippy::too_many_arguments)]
fn add_id(
    builder: &mut ModeBuilder,
    chan: &mut super::Channel,
    extbans: &extban::ExtbanRegistry,
    config: &crate::config::Config,
    now_real: u64,
    src: &SourceInfo,
    list: ListType,
    mask_arg: &str,
) -> Option<String> {
    let mut mask = mask_arg.to_string();

    if src.local && !src.server_or_service {
        let cap = if chan.modes.has(SimpleModes::EXTLIMIT) {
            config.channel.max_bans_large
        } else {
            config.channel.max_bans
        };
        if chan.mask_count() >= cap {
            builder.numerics.push((
                Numeric::ErrBanListFull,
                format!("{} {mask_arg} :Channel ban list is full", chan.name),
            ));
            return None;
        }
        mask = collapse(&mask);
    }

    let parsed = extbans.parse(&mask);
    let (word, payload) = match parsed {
        ParsedPrefix::None => (0, mask.as_str()),
        ParsedPrefix::Invalid => {
            if src.local {
                builder.numerics.push((
                    Numeric::ErrInvalidBan,
                    format!("{} {mask} :Invalid ban mask", chan.name),
                ));
            }
            return None;
        }
        ParsedPrefix::Extban { word, offset } => (word, &mask[offset..]),
    };

    if src.local {
        if word != 0 && !config.channel.enable_extbans {
            builder.numerics.push((
                Numeric::ErrInvalidBan,
                format!("{} {mask} :Invalid ban mask", chan.name),
            ));
            return None;
        }
        if word != 0 && !extbans.allowed_on(word, list) {
            builder.numerics.push((
                Numeric::ErrInvalidBan,
                format!("{} {mask} :Invalid ban mask", chan.name),
            ));
            return None;
        }
    }

    if payload.is_empty() {
        return None;
    }
    // Anything past the first space is discarded; an empty result
    // becomes a match-all.
    let payload = payload.split(' ').next().unwrap_or("*");
    let payload = if payload.is_empty() { "*" } else { payload };

    let mut ban = if word & extban::matching_mask() != 0 {
        Ban {
            banstr: String::new(),
            name: String::new(),
            user: String::new(),
            host: payload.to_string(),
            extban: word,
            netmask: Netmask::Host,
            who: String::new(),
            when: now_real,
        }
    } else {
        let (name, user, host) = split_nuh(payload);
        let netmask = Netmask::parse(&host);
        Ban {
            banstr: String::new(),
            name,
            user,
            host,
            extban: word,
            netmask,
            who: String::new(),
            when: now_real,
        }
    };

    ban.banstr = if src.local {
        render_mask(extbans, &ban)
    } else {
        mask_arg.to_string()
    };

    if chan.list(list).iter().any(|b| irc_eq(&b.banstr, &ban.banstr)) {
        return None;
    }

    chan.clear_ban_cache();

    ban.who = if src.server_or_service {
        src.name.clone()
    } else {
        src.prefix.clone()
    };

    let banstr = ban.banstr.clone();
    chan.list_mut(list).push(ban);
    Some(banstr)
}

/// Add a mask learned from a peer burst: stored verbatim, duplicate
/// entries skipped, no cardinality cap.
pub(crate) fn remote_add_mask(
    chan: &mut super::Channel,
    extbans: &extban::ExtbanRegistry,
    list: ListType,
    mask: &str,
    who: &str,
    when: u64,
) -> bool {
    let (word, payload) = match extbans.parse(mask) {
        ParsedPrefix::None => (0, mask),
        ParsedPrefix::Invalid => return false,
        ParsedPrefix::Extban { word, offset } => (word, &mask[offset..]),
    };
    if payload.is_empty() || mask.starts_with(':') || mask.contains(' ') {
        return false;
    }
    if chan.list(list).iter().any(|b| irc_eq(&b.banstr, mask)) {
        return false;
    }

    let ban = if word & extban::matching_mask() != 0 {
        Ban {
            banstr: mask.to_string(),
            name: String::new(),
            user: String::new(),
            host: payload.to_string(),
            extban: word,
            netmask: Netmask::Host,
            who: who.to_string(),
            when,
        }
    } else {
        let (name, user, host) = split_nuh(payload);
        let netmask = Netmask::parse(&host);
        Ban {
            banstr: mask.to_string(),
            name,
            user,
            host,
            extban: word,
            netmask,
            who: who.to_string(),
            when,
        }
    };

    chan.clear_ban_cache();
    chan.list_mut(list).push(ban);
    true
}

fn del_id(chan: &mut super::Channel, list: ListType, mask: &str) -> Option<String> {
    let index = chan
        .list(list)
        .iter()
        .position(|b| irc_eq(&b.banstr, mask))?;
    // Stored case may differ from the argument.
    let stored = chan.list_mut(list).remove(index).banstr;
    chan.clear_ban_cache();
    Some(stored)
}

#[allow(clippy::too_many_arguments)]
fn chm_mask(
    builder: &mut ModeBuilder,
    chan: &mut super::Channel,
    extbans: &extban::ExtbanRegistry,
    config: &crate::config::Config,
    now_real: u64,
    src: &SourceInfo,
    alevel: Access,
    dir: Direction,
    mode: &ChanMode,
    list: ListType,
    parv: &[String],
    parn: &mut usize,
) {
    let (errtype, rpl_list, rpl_end, end_text) = match list {
        ListType::Ban => (
            SM_ERR_RPL_B,
            Numeric::RplBanList,
            Numeric::RplEndOfBanList,
            "End of Channel Ban List",
        ),
        ListType::Except => (
            SM_ERR_RPL_E,
            Numeric::RplExceptList,
            Numeric::RplEndOfExceptList,
            "End of Channel Exception List",
        ),
        ListType::Invex => (
            SM_ERR_RPL_I,
            Numeric::RplInvexList,
            Numeric::RplEndOfInvexList,
            "End of Channel Invite List",
        ),
    };

    // Query form: list the entries, at most once per list letter.
    if dir == Direction::Query || parv.len() <= *parn {
        if builder.errors & errtype != 0 {
            return;
        }
        builder.errors |= errtype;

        let visible = !chan.modes.has(SimpleModes::HIDEBMASKS) || alevel >= mode.required;
        if visible {
            for ban in chan.list(list) {
                builder.numerics.push((
                    rpl_list,
                    format!("{} {} {} {}", chan.name, ban.banstr, ban.who, ban.when),
                ));
            }
        }
        builder
            .numerics
            .push((rpl_end, format!("{} :{end_text}", chan.name)));
        return;
    }

    if alevel < mode.required {
        access_denied(builder, &chan.name, alevel);
        return;
    }

    if src.local {
        builder.mode_limit += 1;
        if builder.mode_limit > MAXMODEPARAMS {
            return;
        }
    }

    let mask = &parv[*parn];
    *parn += 1;

    if mask.starts_with(':') || (!src.local && mask.contains(' ')) {
        return;
    }

    let stored = match dir {
        Direction::Add => add_id(builder, chan, extbans, config, now_real, src, list, mask),
        Direction::Del => del_id(chan, list, mask),
        Direction::Query => return,
    };
    let Some(stored) = stored else {
        return;
    };

    let hide_from = if chan.modes.has(SimpleModes::HIDEBMASKS) {
        MemberFlags::CHANOP | MemberFlags::HALFOP
    } else {
        0
    };
    builder.changes.push(ModeChange {
        letter: mode.letter,
        dir,
        arg: Some(stored),
        id: None,
        hide_from,
    });
}

#[allow(clippy::too_many_arguments)]
fn chm_limit(
    builder: &mut ModeBuilder,
    chan: &mut super::Channel,
    src: &SourceInfo,
    alevel: Access,
    dir: Direction,
    mode: &ChanMode,
    parv: &[String],
    parn: &mut usize,
) {
    let _ = src;
    if alevel < mode.required {
        access_denied(builder, &chan.name, alevel);
        return;
    }
    match dir {
        Direction::Query => {}
        Direction::Add => {
            if parv.len() <= *parn {
                return;
            }
            let arg = &parv[*parn];
            *parn += 1;
            let Ok(limit) = arg.parse::<u32>() else {
                return;
            };
            if limit == 0 {
                return;
            }

            // MODE #channel +ll 1 2 keeps the latter value.
            for change in &mut builder.changes {
                if change.letter == mode.letter && change.dir == Direction::Add {
                    change.letter = '\0';
                }
            }

            chan.limit = Some(limit);
            builder.changes.push(ModeChange {
                letter: mode.letter,
                dir,
                arg: Some(limit.to_string()),
                id: None,
                hide_from: 0,
            });
        }
        Direction::Del => {
            if chan.limit.is_none() {
                return;
            }
            chan.limit = None;
            builder.changes.push(ModeChange {
                letter: mode.letter,
                dir,
                arg: None,
                id: None,
                hide_from: 0,
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn chm_key(
    builder: &mut ModeBuilder,
    chan: &mut super::Channel,
    src: &SourceInfo,
    alevel: Access,
    dir: Direction,
    mode: &ChanMode,
    parv: &[String],
    parn: &mut usize,
) {
    let _ = src;
    if alevel < mode.required {
        access_denied(builder, &chan.name, alevel);
        return;
    }
    match dir {
        Direction::Query => {}
        Direction::Add => {
            if parv.len() <= *parn {
                return;
            }
            let key = fix_key(&parv[*parn]);
            *parn += 1;
            if key.is_empty() {
                return;
            }

            // MODE #channel +kk a b keeps the latter key.
            for change in &mut builder.changes {
                if change.letter == mode.letter && change.dir == Direction::Add {
                    change.letter = '\0';
                }
            }

            chan.key = Some(key.clone());
            builder.changes.push(ModeChange {
                letter: mode.letter,
                dir,
                arg: Some(key),
                id: None,
                hide_from: 0,
            });
        }
        Direction::Del => {
            if parv.len() > *parn {
                *parn += 1;
            }
            if chan.key.is_none() {
                return;
            }
            chan.key = None;
            builder.changes.push(ModeChange {
                letter: mode.letter,
                dir,
                arg: Some("*".to_string()),
                id: None,
                hide_from: 0,
            });
        }
    }
}

/// One emission batch: letters with direction sigils plus parameters.
struct LineAccumulator {
    base: String,
    letters: String,
    params: Vec<String>,
    dir: Direction,
    lines: Vec<String>,
}

impl LineAccumulator {
    fn new(base: String) -> Self {
        Self {
            base,
            letters: String::new(),
            params: Vec::new(),
            dir: Direction::Query,
            lines: Vec::new(),
        }
    }

    fn flush(&mut self) {
        if self.letters.is_empty() {
            return;
        }
        let mut line = format!("{}{}", self.base, self.letters);
        if !self.params.is_empty() {
            line.push(' ');
            line.push_str(&self.params.join(" "));
        }
        self.lines.push(line);
        self.letters.clear();
        self.params.clear();
        self.dir = Direction::Query;
    }

    fn push(&mut self, change: &ModeChange, arg: Option<&str>) {
        let arg_len = arg.map(|a| a.len() + 1).unwrap_or(0);
        let projected = self.base.len()
            + self.letters.len()
            + self.params.iter().map(|p| p.len() + 1).sum::<usize>()
            + arg_len
            + 2;
        if self.params.len() >= MAXMODEPARAMS || projected > oxirc_proto::PAYLOAD_MAX {
            self.flush();
        }
        if self.dir != change.dir {
            self.letters
                .push(if change.dir == Direction::Add { '+' } else { '-' });
            self.dir = change.dir;
        }
        self.letters.push(change.letter);
        if let Some(arg) = arg {
            self.params.push(arg.to_string());
        }
    }
}

/// Server pass: `:id TMODE <ts> <channel> ...` with id-form parameters.
fn send_mode_changes_server(core: &mut Core, src: &SourceInfo, channel: &str, changes: &[ModeChange]) {
    let Some(chan) = core.channels.get(channel) else {
        return;
    };
    let base = format!(":{} TMODE {} {} ", src.uid, chan.creation_time, chan.name);
    let mut acc = LineAccumulator::new(base);
    for change in changes {
        if change.letter == '\0' {
            continue;
        }
        let arg = change.id.as_deref().or(change.arg.as_deref());
        acc.push(change, arg);
    }
    acc.flush();
    for line in acc.lines {
        core.sendto_server(Some(&src.uid), 0, 0, &line);
    }
}

/// Client pass: two sweeps, the unrestricted changes then the ones
/// visible only to ops and halfops (hidden ban masks).
fn send_mode_changes_client(core: &mut Core, src: &SourceInfo, channel: &str, changes: &[ModeChange]) {
    let Some(chan) = core.channels.get(channel) else {
        return;
    };
    let chan_name = chan.name.clone();
    let source_is_server = src.server_or_service;
    let prefix = if source_is_server {
        let hidden = core
            .clients
            .get(&src.uid)
            .is_some_and(|c| c.flags.has(crate::core::client::ClientFlags::HIDDEN));
        if hidden { core.me.name.clone() } else { src.name.clone() }
    } else {
        src.prefix.clone()
    };

    for flags in [0u32, MemberFlags::CHANOP | MemberFlags::HALFOP] {
        let base = format!(":{prefix} MODE {chan_name} ");
        let mut acc = LineAccumulator::new(base);
        for change in changes {
            if change.letter == '\0' || change.hide_from != flags {
                continue;
            }
            acc.push(change, change.arg.as_deref());
        }
        acc.flush();
        for line in acc.lines {
            core.sendto_channel_local(None, channel, flags, 0, 0, &line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup_covers_every_letter() {
        for entry in table() {
            let found = lookup(entry.letter).expect("letter present");
            assert_eq!(found.letter, entry.letter);
        }
        assert!(lookup('x').is_none());
        assert!(lookup('é').is_none());
    }

    #[test]
    fn access_ordering_gates_remote_above_all() {
        assert!(Access::Remote > Access::ChanOp);
        assert!(Access::ChanOp > Access::HalfOp);
        assert!(Access::HalfOp > Access::Peon);
        assert!(Access::Peon > Access::NotOnChan);
    }

    #[test]
    fn accumulator_splits_at_maxmodeparams() {
        let mut acc = LineAccumulator::new(":srv MODE #t ".to_string());
        for i in 0..6 {
            let change = ModeChange {
                letter: 'o',
                dir: Direction::Add,
                arg: Some(format!("nick{i}")),
                id: None,
                hide_from: 0,
            };
            acc.push(&change, change.arg.as_deref());
        }
        acc.flush();
        assert_eq!(acc.lines.len(), 2);
        assert_eq!(acc.lines[0], ":srv MODE #t +oooo nick0 nick1 nick2 nick3");
        assert_eq!(acc.lines[1], ":srv MODE #t +oo nick4 nick5");
    }

    #[test]
    fn accumulator_emits_sigil_only_on_direction_change() {
        let mut acc = LineAccumulator::new(":srv MODE #t ".to_string());
        let plus_o = ModeChange {
            letter: 'o',
            dir: Direction::Add,
            arg: Some("bob".into()),
            id: None,
            hide_from: 0,
        };
        let minus_v = ModeChange {
            letter: 'v',
            dir: Direction::Del,
            arg: Some("bob".into()),
            id: None,
            hide_from: 0,
        };
        let plus_o2 = ModeChange {
            letter: 'o',
            dir: Direction::Add,
            arg: Some("carol".into()),
            id: None,
            hide_from: 0,
        };
        acc.push(&plus_o, plus_o.arg.as_deref());
        acc.push(&minus_v, minus_v.arg.as_deref());
        acc.push(&plus_o2, plus_o2.arg.as_deref());
        acc.flush();
        assert_eq!(acc.lines, vec![":srv MODE #t +o-v+o bob bob carol"]);
    }
}
