//! Channel operations: join, part, access checks, ban matching, topic,
//! NAMES, member demotion and client teardown.

use super::extban;
use super::{Ban, Channel, ListType, Member, MemberFlags, Netmask, SimpleModes, Topic, check_name};
use crate::core::Core;
use crate::core::client::{Caps, ClientFlags, Status, Uid, UserModes};
use crate::send::NoticeLevel;
use oxirc_proto::{Numeric, fold, match_mask};

/// Maximum stored topic length.
pub const TOPICLEN: usize = 390;

/// Countdown between repeated spambot warnings for one client.
pub const OPER_SPAM_COUNTDOWN: u32 = 5;
/// Seconds after which one unit of join/leave count decays.
pub const JOIN_LEAVE_COUNT_EXPIRE_TIME: u64 = 120;

/// Result of a send-permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanSend {
    /// Op, halfop or voice; bypasses moderation.
    Opv,
    /// Allowed, without channel privileges.
    NonOp,
    Denied(Numeric),
}

/// Does one ban entry match this client?
fn ban_matches(core: &Core, channel: &Channel, client_uid: &str, ban: &Ban) -> bool {
    let Some(client) = core.clients.get(client_uid) else {
        return false;
    };

    // Matching extbans carry their own predicate.
    if ban.extban & extban::matching_mask() != 0 {
        let Some(entry) = core.extbans.find_flag(ban.extban & extban::matching_mask()) else {
            return false;
        };
        let Some(matches) = entry.matches else {
            return false;
        };
        return matches(client, channel, ban, &core.me.name);
    }

    if !match_mask(&ban.name, &client.name) || !match_mask(&ban.user, &client.username) {
        return false;
    }
    match &ban.netmask {
        Netmask::Host => {
            match_mask(&ban.host, &client.realhost)
                || match_mask(&ban.host, &client.sockhost)
                || match_mask(&ban.host, &client.host)
        }
        netmask => client.ip.is_some_and(|ip| netmask.matches(ip)),
    }
}

/// Walk one mask list looking for a match.
///
/// With `hunting` set, only entries carrying that acting-extban flag
/// are considered; otherwise acting extbans are skipped, since they
/// apply at their own moment rather than in general ban checks.
pub fn find_bmask(
    core: &Core,
    channel: &Channel,
    client_uid: &str,
    list: ListType,
    hunting: Option<u32>,
) -> bool {
    channel.list(list).iter().any(|ban| {
        match hunting {
            Some(flag) => {
                if ban.extban & flag == 0 {
                    return false;
                }
            }
            None => {
                if ban.extban & extban::acting_mask() != 0 {
                    return false;
                }
            }
        }
        ban_matches(core, channel, client_uid, ban)
    })
}

/// Banned iff some ban entry matches and no exception does.
pub fn is_banned(core: &Core, channel: &Channel, client_uid: &str) -> bool {
    find_bmask(core, channel, client_uid, ListType::Ban, None)
        && !find_bmask(core, channel, client_uid, ListType::Except, None)
}

/// Evaluate whether a local client may join. The first failing check
/// decides the numeric.
pub fn can_join(
    core: &Core,
    channel: &Channel,
    client_uid: &str,
    key: Option<&str>,
) -> Result<(), Numeric> {
    let Some(client) = core.clients.get(client_uid) else {
        return Err(Numeric::ErrBannedFromChan);
    };

    if channel.modes.has(SimpleModes::SECUREONLY) && !client.umodes.has(UserModes::SECURE) {
        return Err(Numeric::ErrSecureOnlyChan);
    }
    if channel.modes.has(SimpleModes::REGONLY) && !client.umodes.has(UserModes::REGISTERED) {
        return Err(Numeric::ErrNeedReggedNick);
    }
    if channel.modes.has(SimpleModes::OPERONLY) && !client.umodes.has(UserModes::OPER) {
        return Err(Numeric::ErrOperOnlyChan);
    }
    if channel.modes.has(SimpleModes::INVITEONLY)
        && !channel.invites.contains(client_uid)
        && !find_bmask(core, channel, client_uid, ListType::Invex, None)
    {
        return Err(Numeric::ErrInviteOnlyChan);
    }
    if let Some(chan_key) = &channel.key
        && key != Some(chan_key.as_str())
    {
        return Err(Numeric::ErrBadChannelKey);
    }
    if let Some(limit) = channel.limit
        && channel.members.len() >= limit as usize
    {
        return Err(Numeric::ErrChannelIsFull);
    }
    if is_banned(core, channel, client_uid) {
        return Err(Numeric::ErrBannedFromChan);
    }
    // Acting join-gate extbans run last.
    if find_bmask(core, channel, client_uid, ListType::Ban, Some(extban::EXTBAN_JOIN))
        && !find_bmask(
            core,
            channel,
            client_uid,
            ListType::Except,
            Some(extban::EXTBAN_JOIN),
        )
    {
        return Err(Numeric::ErrBannedFromChan);
    }
    Ok(())
}

impl Core {
    /// Membership flags of `uid` on `channel` (folded name), if any.
    ///
    /// Probes through whichever side of the bipartite graph currently
    /// holds fewer entries.
    pub fn membership(&self, channel: &str, uid: &str) -> Option<MemberFlags> {
        let chan = self.channels.get(channel)?;
        let client = self.clients.get(uid)?;
        if chan.members.len() < client.channels.len() {
            chan.members.get(uid).map(|m| m.flags)
        } else if client.channels.contains(channel) {
            chan.members.get(uid).map(|m| m.flags)
        } else {
            None
        }
    }

    /// Add a client to a channel, maintaining both sides of the edge
    /// and the join-flood bucket. Returns true when the flood counter
    /// first crosses its threshold.
    pub fn add_user_to_channel(
        &mut self,
        channel: &str,
        uid: &str,
        flags: MemberFlags,
        flood_ctrl: bool,
    ) -> bool {
        let flood_count = self.config.general.joinfloodcount;
        let flood_time = self.config.general.joinfloodtime;
        let now = self.time.mono;

        let Some(chan) = self.channels.get_mut(channel) else {
            return false;
        };
        let notice = chan.count_join(now, flood_ctrl, flood_count, flood_time);

        chan.members.insert(
            uid.to_string(),
            Member {
                uid: uid.to_string(),
                flags,
            },
        );
        let local = self
            .clients
            .get(uid)
            .map(|c| c.is_local())
            .unwrap_or(false);
        if local {
            chan.members_local.insert(uid.to_string());
        }
        if let Some(client) = self.clients.get_mut(uid) {
            client.channels.insert(channel.to_string());
        }
        notice
    }

    /// Remove a membership edge; frees the channel when it empties.
    pub fn remove_user_from_channel(&mut self, channel: &str, uid: &str) {
        let mut empty = false;
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.members.remove(uid);
            chan.members_local.remove(uid);
            chan.invites.remove(uid);
            empty = chan.members.is_empty();
        }
        if let Some(client) = self.clients.get_mut(uid) {
            client.channels.remove(channel);
        }
        if empty {
            self.channels.remove(channel);
        }
    }

    /// Tear down a client: QUIT fan-out, membership removal, registry
    /// cleanup. Servers take their whole subtree with them.
    pub fn exit_client(&mut self, uid: &str, reason: &str) {
        let Some(client) = self.clients.get(uid) else {
            return;
        };
        let status = client.status;
        let name = client.name.clone();
        let prefix = client.prefix();
        let was_local = client.is_local();
        let reason = if client.flags.has(ClientFlags::SENDQEX) {
            "SendQ exceeded".to_string()
        } else {
            reason.to_string()
        };

        match status {
            Status::Client => {
                let quit_line = format!(":{prefix} QUIT :{reason}");
                self.sendto_common_channels_local(uid, false, 0, 0, &quit_line);

                let channels: Vec<String> = self
                    .clients
                    .get(uid)
                    .map(|c| c.channels.iter().cloned().collect())
                    .unwrap_or_default();
                for channel in channels {
                    self.remove_user_from_channel(&channel, uid);
                }

                self.sendto_server(Some(uid), 0, 0, &format!(":{uid} QUIT :{reason}"));
                self.nicks.remove(&fold(&name));
                self.local_clients.remove(uid);
                self.opers.remove(uid);
            }
            Status::Server => {
                self.remove_dependents(uid, &reason);
                self.server_names.remove(&fold(&name));
                self.local_servers.remove(uid);
                let me_id = self.me.id.clone();
                self.sendto_server(Some(uid), 0, 0, &format!(":{me_id} SQUIT {name} :{reason}"));
                if was_local {
                    tracing::info!(server = %name, %reason, "link closed");
                }
            }
            _ => {
                self.pending_links.retain(|p| !oxirc_proto::irc_eq(&p.name, &name));
            }
        }

        self.clients.remove(uid);
    }

    /// Remove every client and server introduced through `peer`.
    fn remove_dependents(&mut self, peer: &str, reason: &str) {
        let dependents: Vec<Uid> = self
            .clients
            .values()
            .filter(|c| c.from == peer && c.uid != peer)
            .map(|c| c.uid.clone())
            .collect();
        for uid in dependents {
            let is_server = self.clients.get(&uid).is_some_and(|c| c.is_server());
            if is_server {
                self.remove_dependents(&uid, reason);
                if let Some(client) = self.clients.remove(&uid) {
                    self.server_names.remove(&fold(&client.name));
                }
            } else {
                let prefix = self.prefix_of(&uid);
                let quit_line = format!(":{prefix} QUIT :{reason}");
                self.sendto_common_channels_local(&uid, false, 0, 0, &quit_line);
                let channels: Vec<String> = self
                    .clients
                    .get(&uid)
                    .map(|c| c.channels.iter().cloned().collect())
                    .unwrap_or_default();
                for channel in channels {
                    self.remove_user_from_channel(&channel, &uid);
                }
                if let Some(client) = self.clients.remove(&uid) {
                    self.nicks.remove(&fold(&client.name));
                }
            }
        }
    }

    /// Spambot accounting for joins (`name` set) and parts (`None`).
    pub fn check_spambot_warning(&mut self, uid: &str, name: Option<&str>) {
        let spam_num = self.config.general.spam_num;
        let spam_time = self.config.general.spam_time;
        let now = self.time.mono;

        let Some(client) = self.clients.get(uid) else {
            return;
        };
        let (nick, user, host) = (
            client.name.clone(),
            client.username.clone(),
            client.host.clone(),
        );
        let Some(conn) = self.clients.get_mut(uid).and_then(|c| c.conn.as_mut()) else {
            return;
        };

        let mut warn = None;
        if spam_num != 0 && conn.join_leave_count >= spam_num {
            if conn.oper_warn_countdown > 0 {
                conn.oper_warn_countdown -= 1;
            }
            if conn.oper_warn_countdown == 0 {
                conn.oper_warn_countdown = OPER_SPAM_COUNTDOWN;
                warn = Some(match name {
                    Some(chan) => format!(
                        "User {nick} ({user}@{host}) trying to join {chan} is a possible spambot"
                    ),
                    None => format!("User {nick} ({user}@{host}) is a possible spambot"),
                });
            }
        } else {
            let delta = now.saturating_sub(conn.last_leave_time);
            if delta > JOIN_LEAVE_COUNT_EXPIRE_TIME {
                let decrement = (delta / JOIN_LEAVE_COUNT_EXPIRE_TIME) as u32;
                conn.join_leave_count = conn.join_leave_count.saturating_sub(decrement);
            } else if now.saturating_sub(conn.last_join_time) < spam_time {
                conn.join_leave_count += 1;
            }
            if name.is_some() {
                conn.last_join_time = now;
            } else {
                conn.last_leave_time = now;
            }
        }

        if let Some(text) = warn {
            self.sendto_realops_flags(UserModes::FLOOD, NoticeLevel::All, &text);
        }
    }

    /// JOIN for a local client: comma-separated names with their keys.
    pub fn channel_do_join(&mut self, uid: &str, chan_list: &str, key_list: &str) {
        let mut keys = key_list.split(',');

        for name in chan_list.split(',') {
            if name.is_empty() {
                continue;
            }
            let key = keys.next().filter(|k| !k.is_empty());

            if !check_name(name, true, self.config.channel.disable_fake_channels) {
                self.sendto_one_numeric(
                    uid,
                    Numeric::ErrBadChanName,
                    &format!("{name} :Illegal channel name"),
                );
                continue;
            }

            // Reserved channel names are refused unless the client is
            // exempt.
            let is_oper = self
                .clients
                .get(uid)
                .is_some_and(|c| c.umodes.has(UserModes::OPER));
            if !is_oper
                && let Some(resv) = self
                    .config
                    .channel
                    .resv
                    .iter()
                    .find(|r| match_mask(&r.mask, name))
            {
                let reason = resv.reason.clone();
                self.sendto_one_numeric(
                    uid,
                    Numeric::ErrChanBanReason,
                    &format!("{name} :Cannot join channel ({reason})"),
                );
                let shown = self
                    .clients
                    .get(uid)
                    .map(|c| c.describe(false))
                    .unwrap_or_default();
                self.sendto_realops_flags(
                    UserModes::REJ,
                    NoticeLevel::All,
                    &format!("Forbidding reserved channel {name} from user {shown}"),
                );
                continue;
            }

            let at_limit = self.clients.get(uid).is_some_and(|c| {
                c.channels.len() >= self.max_channels_for(c)
            });
            if at_limit {
                self.sendto_one_numeric(
                    uid,
                    Numeric::ErrTooManyChannels,
                    &format!("{name} :You have joined too many channels"),
                );
                break;
            }

            let folded = fold(name);
            let mut flags = MemberFlags::default();
            let created = if let Some(channel) = self.channels.get(&folded) {
                if channel.members.contains_key(uid) {
                    continue;
                }
                if let Err(numeric) = can_join(self, channel, uid, key) {
                    let mode_char = match numeric {
                        Numeric::ErrSecureOnlyChan => "(+S)",
                        Numeric::ErrNeedReggedNick => "(+r)",
                        Numeric::ErrOperOnlyChan => "(+O)",
                        Numeric::ErrInviteOnlyChan => "(+i)",
                        Numeric::ErrBadChannelKey => "(+k)",
                        Numeric::ErrChannelIsFull => "(+l)",
                        _ => "(+b)",
                    };
                    let chan_name = channel.name.clone();
                    self.sendto_one_numeric(
                        uid,
                        numeric,
                        &format!("{chan_name} :Cannot join channel {mode_char}"),
                    );
                    continue;
                }
                if channel.members.is_empty() {
                    flags.set(MemberFlags::CHANOP);
                }
                false
            } else {
                flags.set(MemberFlags::CHANOP);
                let channel = Channel::new(name, self.time.real, self.time.mono);
                self.channels.insert(folded.clone(), channel);
                true
            };

            if !is_oper {
                self.check_spambot_warning(uid, Some(name));
            }

            let flood_notice = self.add_user_to_channel(&folded, uid, flags, true);
            if flood_notice {
                let shown = self
                    .clients
                    .get(uid)
                    .map(|c| c.describe(false))
                    .unwrap_or_default();
                let me_name = self.me.name.clone();
                let chan_name = self.channels.get(&folded).map(|c| c.name.clone()).unwrap_or_default();
                self.sendto_realops_flags(
                    UserModes::FLOOD,
                    NoticeLevel::All,
                    &format!("Possible Join Flooder {shown} on {me_name} target: {chan_name}"),
                );
            }

            let Some((prefix, account, info, away)) = self.clients.get(uid).map(|client| {
                (
                    client.prefix(),
                    client.account.clone(),
                    client.info.clone(),
                    client.away.clone(),
                )
            }) else {
                continue;
            };
            let chan_name = self
                .channels
                .get(&folded)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| name.to_string());

            if created || flags.has(MemberFlags::CHANOP) {
                let now_real = self.time.real;
                let Some(ts) = self.channels.get_mut(&folded).map(|channel| {
                    channel.creation_time = now_real;
                    channel.modes.set(SimpleModes::TOPICLIMIT);
                    channel.modes.set(SimpleModes::NOPRIVMSGS);
                    channel.creation_time
                }) else {
                    continue;
                };
                let me_id = self.me.id.clone();
                self.sendto_server(
                    None,
                    0,
                    0,
                    &format!(":{me_id} SJOIN {ts} {chan_name} +nt :@{uid}"),
                );
                self.sendto_channel_local(
                    None,
                    &folded,
                    0,
                    Caps::EXTENDED_JOIN,
                    0,
                    &format!(":{prefix} JOIN {chan_name} {account} :{info}"),
                );
                self.sendto_channel_local(
                    None,
                    &folded,
                    0,
                    0,
                    Caps::EXTENDED_JOIN,
                    &format!(":{prefix} JOIN :{chan_name}"),
                );
                let me_name = self.me.name.clone();
                self.sendto_channel_local(
                    None,
                    &folded,
                    0,
                    0,
                    0,
                    &format!(":{me_name} MODE {chan_name} +nt"),
                );
            } else {
                let ts = self
                    .channels
                    .get(&folded)
                    .map(|c| c.creation_time)
                    .unwrap_or_default();
                self.sendto_server(None, 0, 0, &format!(":{uid} JOIN {ts} {chan_name} +"));
                self.sendto_channel_local(
                    None,
                    &folded,
                    0,
                    Caps::EXTENDED_JOIN,
                    0,
                    &format!(":{prefix} JOIN {chan_name} {account} :{info}"),
                );
                self.sendto_channel_local(
                    None,
                    &folded,
                    0,
                    0,
                    Caps::EXTENDED_JOIN,
                    &format!(":{prefix} JOIN :{chan_name}"),
                );
            }

            if !away.is_empty() {
                self.sendto_channel_local(
                    Some(uid),
                    &folded,
                    0,
                    Caps::AWAY_NOTIFY,
                    0,
                    &format!(":{prefix} AWAY :{away}"),
                );
            }

            if let Some(channel) = self.channels.get_mut(&folded) {
                channel.invites.remove(uid);
            }

            let topic = self
                .channels
                .get(&folded)
                .and_then(|c| c.topic.as_ref())
                .cloned();
            if let Some(topic) = topic {
                self.sendto_one_numeric(
                    uid,
                    Numeric::RplTopic,
                    &format!("{chan_name} :{}", topic.text),
                );
                self.sendto_one_numeric(
                    uid,
                    Numeric::RplTopicWhoTime,
                    &format!("{chan_name} {} {}", topic.set_by, topic.set_at),
                );
            }

            self.send_namereply(uid, &folded);

            let now = self.time.mono;
            if let Some(conn) = self.clients.get_mut(uid).and_then(|c| c.conn.as_mut()) {
                conn.last_join_time = now;
            }
        }
    }

    /// PART one client from one channel.
    fn channel_part_one(&mut self, uid: &str, name: &str, reason: &str) {
        let folded = fold(name);
        let Some(channel) = self.channels.get(&folded) else {
            self.sendto_one_numeric(
                uid,
                Numeric::ErrNoSuchChannel,
                &format!("{name} :No such channel"),
            );
            return;
        };
        let chan_name = channel.name.clone();
        if !channel.members.contains_key(uid) {
            self.sendto_one_numeric(
                uid,
                Numeric::ErrNotOnChannel,
                &format!("{chan_name} :You're not on that channel"),
            );
            return;
        }

        let Some((is_local, is_oper, created_monotonic)) = self.clients.get(uid).map(|client| {
            (
                client.is_local(),
                client.umodes.has(UserModes::OPER),
                client.created_monotonic,
            )
        }) else {
            return;
        };
        if is_local && !is_oper {
            self.check_spambot_warning(uid, None);
        }

        // Part reasons are shown only from connections old enough to be
        // past the anti-spam window and still allowed to speak.
        let reason_ok = !reason.is_empty()
            && (!is_local
                || (created_monotonic + self.config.general.anti_spam_exit_message_time
                    < self.time.mono
                    && !matches!(
                        self.can_send(&folded, uid, reason, false),
                        CanSend::Denied(_)
                    )));

        let prefix = self.prefix_of(uid);
        if reason_ok {
            self.sendto_server(Some(uid), 0, 0, &format!(":{uid} PART {chan_name} :{reason}"));
            self.sendto_channel_local(
                None,
                &folded,
                0,
                0,
                0,
                &format!(":{prefix} PART {chan_name} :{reason}"),
            );
        } else {
            self.sendto_server(Some(uid), 0, 0, &format!(":{uid} PART {chan_name}"));
            self.sendto_channel_local(
                None,
                &folded,
                0,
                0,
                0,
                &format!(":{prefix} PART {chan_name}"),
            );
        }

        self.remove_user_from_channel(&folded, uid);
    }

    /// PART for a comma-separated channel list.
    pub fn channel_do_part(&mut self, uid: &str, chan_list: &str, reason: &str) {
        for name in chan_list.split(',') {
            if !name.is_empty() {
                self.channel_part_one(uid, name, reason);
            }
        }
    }

    /// Store a topic. Local settings truncate to the configured
    /// maximum, remote ones to the buffer bound.
    pub fn set_topic(&mut self, channel: &str, text: &str, set_by: &str, set_at: u64, local: bool) {
        let max = if local {
            self.config.general.max_topic_length.min(TOPICLEN)
        } else {
            TOPICLEN
        };
        let mut text = text.to_string();
        if text.len() > max {
            let mut cut = max;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.topic = Some(Topic {
                text,
                set_by: set_by.to_string(),
                set_at,
            });
        }
    }

    /// Strip every member's op/halfop/voice, announcing the removals to
    /// local members in MAXMODEPARAMS-sized MODE batches.
    pub fn channel_demote_members(&mut self, channel: &str, actor: &str) {
        const TABLE: &[(char, u32)] = &[
            ('o', MemberFlags::CHANOP),
            ('h', MemberFlags::HALFOP),
            ('v', MemberFlags::VOICE),
        ];

        let actor_name = self.name_of(actor);
        let Some(chan) = self.channels.get_mut(channel) else {
            return;
        };
        let chan_name = chan.name.clone();

        let mut lines = Vec::new();
        let mut letters = String::new();
        let mut args: Vec<String> = Vec::new();

        let mut uids: Vec<Uid> = chan.members.keys().cloned().collect();
        uids.sort();
        for uid in uids {
            let name = self
                .clients
                .get(&uid)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| uid.clone());
            let Some(member) = chan.members.get_mut(&uid) else {
                continue;
            };
            for (letter, flag) in TABLE {
                if member.flags.has(*flag) {
                    member.flags.clear(*flag);
                    letters.push(*letter);
                    args.push(name.clone());
                    if args.len() >= super::MAXMODEPARAMS {
                        lines.push(format!(
                            ":{actor_name} MODE {chan_name} -{letters} {}",
                            args.join(" ")
                        ));
                        letters.clear();
                        args.clear();
                    }
                }
            }
        }
        if !args.is_empty() {
            lines.push(format!(
                ":{actor_name} MODE {chan_name} -{letters} {}",
                args.join(" ")
            ));
        }

        for line in lines {
            self.sendto_channel_local(None, channel, 0, 0, 0, &line);
        }
    }

    /// RPL_NAMREPLY/RPL_ENDOFNAMES for one channel.
    pub fn send_namereply(&mut self, uid: &str, channel: &str) {
        let Some(chan) = self.channels.get(channel) else {
            return;
        };
        let chan_name = chan.name.clone();
        let symbol = chan.visibility_symbol();
        let is_member = chan.members.contains_key(uid);
        let public = !chan
            .modes
            .has(SimpleModes::SECRET | SimpleModes::PRIVATE);

        let caps = self.clients.get(uid).map(|c| c.caps()).unwrap_or_default();
        let multi_prefix = caps.has_all(Caps::MULTI_PREFIX);
        let uhnames = caps.has_all(Caps::UHNAMES);

        let nick = self.name_of(uid);
        let base = format!(
            ":{} {} {} {} {} :",
            self.me.name,
            Numeric::RplNamReply,
            nick,
            symbol,
            chan_name
        );

        let mut lines = Vec::new();
        if public || is_member {
            let mut names = String::new();
            let mut uids: Vec<&Uid> = chan.members.keys().collect();
            uids.sort();
            for member_uid in uids {
                let Some(member) = chan.members.get(member_uid) else {
                    continue;
                };
                let Some(target) = self.clients.get(member_uid) else {
                    continue;
                };
                if target.umodes.has(UserModes::INVISIBLE) && !is_member {
                    continue;
                }
                let entry = if uhnames {
                    format!("{}{}", member.flags.prefix(multi_prefix), target.prefix())
                } else {
                    format!("{}{}", member.flags.prefix(multi_prefix), target.name)
                };
                if !names.is_empty()
                    && base.len() + names.len() + entry.len() + 1 > oxirc_proto::PAYLOAD_MAX
                {
                    lines.push(format!("{base}{names}"));
                    names.clear();
                }
                if !names.is_empty() {
                    names.push(' ');
                }
                names.push_str(&entry);
            }
            if !names.is_empty() {
                lines.push(format!("{base}{names}"));
            }
        }

        for line in lines {
            self.sendto_one(uid, &line);
        }
        self.sendto_one_numeric(
            uid,
            Numeric::RplEndOfNames,
            &format!("{chan_name} :End of /NAMES list."),
        );
    }

    /// Send-permission check with per-member ban caching.
    pub fn can_send(&mut self, channel: &str, uid: &str, message: &str, notice: bool) -> CanSend {
        let Some(client) = self.clients.get(uid) else {
            return CanSend::Denied(Numeric::ErrCannotSendToChan);
        };
        if client.is_server() || client.is_service() {
            return CanSend::Opv;
        }
        let is_local = client.is_local();
        let registered_umode = client.umodes.has(UserModes::REGISTERED);

        let Some(chan) = self.channels.get(channel) else {
            return CanSend::Denied(Numeric::ErrNoSuchChannel);
        };
        let modes = chan.modes;

        if modes.has(SimpleModes::NOCTRL) && msg_has_ctrls(message) {
            return CanSend::Denied(Numeric::ErrCannotSendToChan);
        }
        if modes.has(SimpleModes::NOCTCP)
            && message.starts_with('\u{1}')
            && !message[1..].starts_with("ACTION ")
        {
            return CanSend::Denied(Numeric::ErrCannotSendToChan);
        }

        let member_flags = chan.members.get(uid).map(|m| m.flags);
        if let Some(flags) = member_flags
            && flags.has(MemberFlags::STATUS_MASK)
        {
            return CanSend::Opv;
        }
        if member_flags.is_none() && modes.has(SimpleModes::NOPRIVMSGS) {
            return CanSend::Denied(Numeric::ErrCannotSendToChan);
        }
        if modes.has(SimpleModes::MODERATED) {
            return CanSend::Denied(Numeric::ErrCannotSendToChan);
        }
        if modes.has(SimpleModes::MODREG) && !registered_umode {
            return CanSend::Denied(Numeric::ErrNeedReggedNick);
        }
        if modes.has(SimpleModes::NONOTICE) && notice {
            return CanSend::Denied(Numeric::ErrCannotSendToChan);
        }

        // Ban state is cached on the membership until a list mutates.
        if is_local {
            if let Some(flags) = member_flags {
                if flags.has(MemberFlags::BAN_SILENCED) {
                    return CanSend::Denied(Numeric::ErrCannotSendToChan);
                }
                if !flags.has(MemberFlags::BAN_CHECKED) {
                    let banned = match self.channels.get(channel) {
                        Some(chan) => is_banned(self, chan, uid),
                        None => return CanSend::Denied(Numeric::ErrCannotSendToChan),
                    };
                    let Some(member) = self
                        .channels
                        .get_mut(channel)
                        .and_then(|c| c.members.get_mut(uid))
                    else {
                        return CanSend::Denied(Numeric::ErrCannotSendToChan);
                    };
                    member.flags.set(MemberFlags::BAN_CHECKED);
                    if banned {
                        member.flags.set(MemberFlags::BAN_SILENCED);
                        return CanSend::Denied(Numeric::ErrCannotSendToChan);
                    }
                }
            } else {
                let banned = match self.channels.get(channel) {
                    Some(chan) => is_banned(self, chan, uid),
                    None => return CanSend::Denied(Numeric::ErrCannotSendToChan),
                };
                if banned {
                    return CanSend::Denied(Numeric::ErrCannotSendToChan);
                }
            }
        }

        self.extban_mute_can_send(channel, uid)
    }

    /// Acting mute extban, consulted at send time and cached like the
    /// plain ban check.
    fn extban_mute_can_send(&mut self, channel: &str, uid: &str) -> CanSend {
        let Some(chan) = self.channels.get(channel) else {
            return CanSend::NonOp;
        };
        if let Some(member) = chan.members.get(uid) {
            if member.flags.has(MemberFlags::MUTE_CHECKED) {
                return if member.flags.has(MemberFlags::MUTE_SILENCED) {
                    CanSend::Denied(Numeric::ErrCannotSendToChan)
                } else {
                    CanSend::NonOp
                };
            }
        }
        let muted = find_bmask(self, chan, uid, ListType::Ban, Some(extban::EXTBAN_MUTE))
            && !find_bmask(self, chan, uid, ListType::Except, Some(extban::EXTBAN_MUTE));
        if let Some(member) = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.members.get_mut(uid))
        {
            member.flags.set(MemberFlags::MUTE_CHECKED);
            if muted {
                member.flags.set(MemberFlags::MUTE_SILENCED);
            }
        }
        if muted {
            CanSend::Denied(Numeric::ErrCannotSendToChan)
        } else {
            CanSend::NonOp
        }
    }
}

/// Control codes other than CTCP and ISO 2022 shifts mark a message as
/// unsendable on `+c` channels.
fn msg_has_ctrls(message: &str) -> bool {
    let bytes = message.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b > 31 || b == 1 {
            i += 1;
            continue;
        }
        if b == 27 && matches!(bytes.get(i + 1), Some(b'$') | Some(b'(')) {
            i += 2;
            continue;
        }
        return true;
    }
    false
}
