//! Message fan-out.
//!
//! Every fan-out primitive builds two serialized lines, one with the
//! source's `nick!user@host` prefix for local clients and one with its
//! id for peer-bound traffic, then walks exactly one candidate set.
//! A monotonic serial, bumped before each fan-out and stamped on every
//! peer connection it reaches, guarantees each remote peer at most one
//! copy per invocation no matter how many candidates route through it.

use crate::core::Core;
use crate::core::client::{ClientFlags, UserModes};
use std::sync::atomic::Ordering;

/// Which oper tier a server notice targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    All,
    /// Admins only; notices carrying real IPs go here.
    Admin,
    /// Non-admin opers; the IP-masked tier.
    Oper,
}

impl Core {
    /// Enqueue one line on a locally connected client.
    ///
    /// Overflowing the class send queue is fatal: the connection is
    /// marked dead and, for servers, an oper notice names the culprit.
    pub(crate) fn send_message(&mut self, to: &str, line: &str) {
        let Some(client) = self.clients.get_mut(to) else {
            return;
        };
        if client.is_dead() {
            return;
        }
        let Some(conn) = client.conn.as_mut() else {
            return;
        };

        let queued = conn.sendq_bytes.load(Ordering::Relaxed) + line.len() + 2;
        if queued > conn.sendq_limit {
            let limit = conn.sendq_limit;
            let is_server = client.is_server();
            let shown = client.describe(true);
            if client.is_client() {
                client.flags.set(ClientFlags::SENDQEX);
            }
            self.mark_dead(to);
            if is_server {
                self.sendto_realops_flags(
                    UserModes::SERVNOTICE,
                    NoticeLevel::All,
                    &format!("Max SendQ limit exceeded for {shown}: {queued} > {limit}"),
                );
            }
            return;
        }

        conn.sendq_bytes.fetch_add(line.len() + 2, Ordering::Relaxed);
        conn.messages_sent += 1;
        let _ = conn.tx.send(line.to_string());
        self.messages_sent += 1;
    }

    /// Forward a line toward a remote client through its uplink,
    /// guarding against a message bouncing back where it came from.
    pub(crate) fn send_message_remote(&mut self, uplink: &str, from: &str, line: &str) {
        let from_route = self.route_of(from);
        if from_route.as_deref() == Some(uplink) {
            let from_name = self.name_of(from);
            let to_name = self.name_of(uplink);
            self.sendto_realops_flags(
                UserModes::SERVNOTICE,
                NoticeLevel::All,
                &format!("Send message to {to_name} dropped from {from_name} (Fake Dir)"),
            );
            return;
        }
        self.send_message(uplink, line);
    }

    /// The two prefix forms of a source: client-facing and peer-facing.
    fn dual_prefixes(&self, from: &str) -> (String, String) {
        (self.prefix_of(from), self.id_of(from))
    }

    /// Send one line to a single target, local or remote.
    pub fn sendto_one(&mut self, to: &str, line: &str) {
        let Some(route) = self.route_of(to) else {
            return;
        };
        if self.clients.get(&route).is_none_or(|c| c.is_dead()) {
            return;
        }
        self.send_message(&route, line);
    }

    /// Numeric reply to the initiator. The prefix and target collapse
    /// to names for local targets and ids for remote ones.
    pub fn sendto_one_numeric(&mut self, to: &str, numeric: oxirc_proto::Numeric, tail: &str) {
        let Some(route) = self.route_of(to) else {
            return;
        };
        if self.clients.get(&route).is_none_or(|c| c.is_dead()) {
            return;
        }
        let local = route == to;
        let (me, dest) = if local {
            (self.me.name.clone(), self.name_of(to))
        } else {
            (self.me.id.clone(), to.to_string())
        };
        let line = format!(":{me} {numeric} {dest} {tail}");
        self.send_message(&route, &line);
    }

    pub fn sendto_one_notice(&mut self, to: &str, tail: &str) {
        let Some(route) = self.route_of(to) else {
            return;
        };
        let local = route == to;
        let (me, dest) = if local {
            (self.me.name.clone(), self.name_of(to))
        } else {
            (self.me.id.clone(), to.to_string())
        };
        let line = format!(":{me} NOTICE {dest} :{tail}");
        self.send_message(&route, &line);
    }

    /// Fan a line to every member of a channel, local and remote.
    ///
    /// `one` skips everything reached through that client's uplink,
    /// `member_flags` restricts to members holding one of the status
    /// bits, and `+D` (deaf) users never receive channel fan-out.
    pub fn sendto_channel_butone(
        &mut self,
        one: Option<&str>,
        from: &str,
        channel: &str,
        member_flags: u32,
        tail: &str,
    ) {
        let (prefix, id) = self.dual_prefixes(from);
        let line_local = format!(":{prefix} {tail}");
        let line_remote = format!(":{id} {tail}");

        self.serial += 1;
        let serial = self.serial;
        let one_route = one.and_then(|o| self.route_of(o));

        let targets: Vec<(String, u32)> = match self.channels.get(channel) {
            Some(chan) => chan
                .members
                .values()
                .map(|m| (m.uid.clone(), m.flags.0))
                .collect(),
            None => return,
        };

        for (uid, flags) in targets {
            if member_flags != 0 && flags & member_flags == 0 {
                continue;
            }
            let Some(target) = self.clients.get(&uid) else {
                continue;
            };
            let route = target.from.clone();
            if self.clients.get(&route).is_none_or(|c| c.is_dead()) {
                continue;
            }
            if one_route.as_deref() == Some(route.as_str()) {
                continue;
            }
            if self
                .clients
                .get(&uid)
                .is_some_and(|c| c.umodes.has(UserModes::DEAF))
            {
                continue;
            }

            if route == uid {
                self.send_message(&uid, &line_local);
                if let Some(conn) = self.clients.get_mut(&uid).and_then(|c| c.conn.as_mut()) {
                    conn.serial = serial;
                }
            } else {
                let already = self
                    .clients
                    .get(&route)
                    .and_then(|c| c.conn.as_ref())
                    .is_some_and(|conn| conn.serial == serial);
                if !already {
                    self.send_message_remote(&route, from, &line_remote);
                    if let Some(conn) = self.clients.get_mut(&route).and_then(|c| c.conn.as_mut()) {
                        conn.serial = serial;
                    }
                }
            }
        }
    }

    /// Send a fully formed line to every directly linked server that
    /// has all `caps` and none of `nocaps`.
    pub fn sendto_server(&mut self, one: Option<&str>, caps: u32, nocaps: u32, line: &str) {
        let one_route = one.and_then(|o| self.route_of(o));
        let servers: Vec<String> = self.local_servers.iter().cloned().collect();
        for uid in servers {
            let Some(server) = self.clients.get(&uid) else {
                continue;
            };
            if server.is_dead() {
                continue;
            }
            if one_route.as_deref() == Some(uid.as_str()) {
                continue;
            }
            let server_caps = server
                .conn
                .as_ref()
                .map(|c| c.server_caps)
                .unwrap_or_default();
            if caps != 0 && !server_caps.has_all(caps) {
                continue;
            }
            if nocaps != 0 && server_caps.has_any(nocaps) {
                continue;
            }
            self.send_message(&uid, line);
        }
    }

    /// Send a fully formed line to locally connected channel members,
    /// filtered by member status and capability bits.
    pub fn sendto_channel_local(
        &mut self,
        one: Option<&str>,
        channel: &str,
        status: u32,
        poscap: u32,
        negcap: u32,
        line: &str,
    ) {
        let targets: Vec<(String, u32)> = match self.channels.get(channel) {
            Some(chan) => chan
                .members_local
                .iter()
                .filter_map(|uid| chan.members.get(uid))
                .map(|m| (m.uid.clone(), m.flags.0))
                .collect(),
            None => return,
        };
        for (uid, flags) in targets {
            if status != 0 && flags & status == 0 {
                continue;
            }
            if one.is_some_and(|o| o == uid) {
                continue;
            }
            let Some(target) = self.clients.get(&uid) else {
                continue;
            };
            if target.is_dead() {
                continue;
            }
            let caps = target.caps();
            if poscap != 0 && !caps.has_all(poscap) {
                continue;
            }
            if negcap != 0 && caps.has_any(negcap) {
                continue;
            }
            self.send_message(&uid, line);
        }
    }

    /// Send to every local client sharing at least one channel with
    /// `user`, each at most once, optionally including the user.
    pub fn sendto_common_channels_local(
        &mut self,
        user: &str,
        touser: bool,
        poscap: u32,
        negcap: u32,
        line: &str,
    ) {
        self.serial += 1;
        let serial = self.serial;

        let channel_names: Vec<String> = self
            .clients
            .get(user)
            .map(|c| c.channels.iter().cloned().collect())
            .unwrap_or_default();

        for name in channel_names {
            let locals: Vec<String> = match self.channels.get(&name) {
                Some(chan) => chan.members_local.iter().cloned().collect(),
                None => continue,
            };
            for uid in locals {
                if uid == user {
                    continue;
                }
                let Some(target) = self.clients.get(&uid) else {
                    continue;
                };
                if target.is_dead() {
                    continue;
                }
                let caps = target.caps();
                if target
                    .conn
                    .as_ref()
                    .is_some_and(|conn| conn.serial == serial)
                {
                    continue;
                }
                if poscap != 0 && !caps.has_all(poscap) {
                    continue;
                }
                if negcap != 0 && caps.has_any(negcap) {
                    continue;
                }
                if let Some(conn) = self.clients.get_mut(&uid).and_then(|c| c.conn.as_mut()) {
                    conn.serial = serial;
                }
                self.send_message(&uid, line);
            }
        }

        if touser {
            let eligible = self.clients.get(user).is_some_and(|c| {
                c.is_local()
                    && !c.is_dead()
                    && c.caps().has_all(poscap)
                    && (negcap == 0 || !c.caps().has_any(negcap))
            });
            if eligible {
                self.send_message(user, line);
            }
        }
    }

    /// Send to all local clients whose host (or server) matches a mask,
    /// and pass the id-form line to every other server.
    pub fn sendto_match_butone(
        &mut self,
        one: Option<&str>,
        from: &str,
        mask: &str,
        match_host: bool,
        tail: &str,
    ) {
        let (prefix, id) = self.dual_prefixes(from);
        let line_local = format!(":{prefix} {tail}");
        let line_remote = format!(":{id} {tail}");
        let one_route = one.and_then(|o| self.route_of(o));

        let locals: Vec<String> = self.local_clients.iter().cloned().collect();
        for uid in locals {
            let Some(client) = self.clients.get(&uid) else {
                continue;
            };
            if client.is_dead() || one_route.as_deref() == Some(uid.as_str()) {
                continue;
            }
            let subject = if match_host {
                client.host.clone()
            } else {
                self.me.name.clone()
            };
            if !oxirc_proto::match_mask(mask, &subject) {
                continue;
            }
            self.send_message(&uid, &line_local);
        }

        // Let every peer decide for its own clients.
        let servers: Vec<String> = self.local_servers.iter().cloned().collect();
        for uid in servers {
            if self.clients.get(&uid).is_none_or(|c| c.is_dead()) {
                continue;
            }
            if one_route.as_deref() == Some(uid.as_str()) {
                continue;
            }
            self.send_message_remote(&uid, from, &line_remote);
        }
    }

    /// Send to all servers whose name matches `mask` and which carry
    /// all of `caps`, one copy per direct peer.
    pub fn sendto_match_servs(&mut self, source: &str, mask: &str, caps: u32, tail: &str) {
        let line = format!(":{} {tail}", self.id_of(source));
        self.serial += 1;
        let serial = self.serial;
        let source_route = self.route_of(source);

        let servers: Vec<(String, String)> = self
            .clients
            .values()
            .filter(|c| c.is_server())
            .map(|c| (c.uid.clone(), c.name.clone()))
            .collect();

        for (uid, name) in servers {
            let Some(route) = self.route_of(&uid) else {
                continue;
            };
            if self.clients.get(&route).is_none_or(|c| c.is_dead()) {
                continue;
            }
            if source_route.as_deref() == Some(route.as_str()) {
                continue;
            }
            let peer_caps = self
                .clients
                .get(&route)
                .and_then(|c| c.conn.as_ref())
                .map(|c| c.server_caps)
                .unwrap_or_default();
            if caps != 0 && !peer_caps.has_all(caps) {
                continue;
            }
            if !oxirc_proto::match_mask(mask, &name) {
                continue;
            }
            let already = self
                .clients
                .get(&route)
                .and_then(|c| c.conn.as_ref())
                .is_some_and(|conn| conn.serial == serial);
            if already {
                continue;
            }
            if let Some(conn) = self.clients.get_mut(&route).and_then(|c| c.conn.as_mut()) {
                conn.serial = serial;
            }
            self.send_message_remote(&route, source, &line);
        }
    }

    /// Deliver a command to a target whose location is unknown.
    pub fn sendto_anywhere(&mut self, to: &str, from: &str, command: &str, tail: &str) {
        let Some(route) = self.route_of(to) else {
            return;
        };
        if self.clients.get(&route).is_none_or(|c| c.is_dead()) {
            return;
        }
        let local = route == to;
        let line = if local {
            format!(
                ":{} {command} {} {tail}",
                self.prefix_of(from),
                self.name_of(to)
            )
        } else {
            format!(":{} {command} {to} {tail}", self.id_of(from))
        };
        if local {
            self.send_message(&route, &line);
        } else {
            self.send_message_remote(&route, from, &line);
        }
    }

    /// Notice to local opers holding all `flags`, filtered by tier.
    pub fn sendto_realops_flags(&mut self, flags: u32, level: NoticeLevel, text: &str) {
        let line = format!(":{} NOTICE * :*** Notice -- {text}", self.me.name);
        let opers: Vec<String> = self.opers.iter().cloned().collect();
        for uid in opers {
            let Some(client) = self.clients.get(&uid) else {
                continue;
            };
            if client.is_dead() {
                continue;
            }
            let is_admin = client.umodes.has(UserModes::ADMIN);
            if (level == NoticeLevel::Admin && !is_admin)
                || (level == NoticeLevel::Oper && is_admin)
            {
                continue;
            }
            if flags != 0 && !client.umodes.has(flags) {
                continue;
            }
            self.send_message(&uid, &line);
        }
    }

    /// Rate-limited variant: at most one warning per 20 seconds.
    pub fn sendto_realops_ratelimited(&mut self, text: &str) {
        if self.time.mono.saturating_sub(self.rate_warn_ts) < 20 {
            return;
        }
        self.rate_warn_ts = self.time.mono;
        tracing::warn!(target: "oxircd::ts", "{text}");
        self.sendto_realops_flags(UserModes::SERVNOTICE, NoticeLevel::All, text);
    }

    /// WALLOPS to local opers carrying `flags`.
    pub fn sendto_wallops(&mut self, from: &str, flags: u32, text: &str) {
        let line = format!(":{} WALLOPS :{text}", self.prefix_of(from));
        let opers: Vec<String> = self.opers.iter().cloned().collect();
        for uid in opers {
            let Some(client) = self.clients.get(&uid) else {
                continue;
            };
            if client.is_dead() {
                continue;
            }
            if flags != 0 && !client.umodes.has(flags) {
                continue;
            }
            self.send_message(&uid, &line);
        }
    }
}
