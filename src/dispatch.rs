//! Command dispatch.
//!
//! A verb table maps uppercase commands to an entry with one handler
//! slot per source class: unregistered connections, registered users,
//! peer servers, service-encap subcommands, and opers. Each slot
//! carries a minimum argument count enforced before the handler runs;
//! `parv[0]` is always the verb.

use crate::core::Core;
use crate::core::client::{Status, UserModes};
use oxirc_proto::{Message, Numeric};
use std::collections::HashMap;
use std::sync::OnceLock;

/// A command handler. `parv[0]` is the verb, the rest its parameters.
pub type HandlerFn = fn(&mut Core, &str, &[String]);

/// What one source class is allowed to do with a verb.
#[derive(Clone, Copy)]
pub enum Slot {
    Func { min_args: usize, func: HandlerFn },
    /// Silently dropped for this class.
    Ignore,
    /// ERR_NOTREGISTERED.
    NotRegistered,
    /// ERR_NOPRIVILEGES.
    NotOper,
    /// ERR_ALREADYREGISTERED.
    AlreadyRegistered,
}

/// Convenience constructor for a live handler slot.
pub const fn func(min_args: usize, func: HandlerFn) -> Slot {
    Slot::Func { min_args, func }
}

pub struct CommandEntry {
    pub verb: &'static str,
    pub unregistered: Slot,
    pub client: Slot,
    pub server: Slot,
    pub encap: Slot,
    pub oper: Slot,
    /// Subject to RPL_LOAD2HI pacing for local non-opers.
    pub paced: bool,
    /// Dropped from remote users when remote commands are disabled.
    pub remote_gated: bool,
}

impl CommandEntry {
    const fn new(verb: &'static str) -> Self {
        Self {
            verb,
            unregistered: Slot::NotRegistered,
            client: Slot::Ignore,
            server: Slot::Ignore,
            encap: Slot::Ignore,
            oper: Slot::Ignore,
            paced: false,
            remote_gated: false,
        }
    }
}

/// Source class selected for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceClass {
    Unregistered,
    Client,
    Server,
    Oper,
}

pub struct CommandTable {
    map: HashMap<&'static str, CommandEntry>,
}

impl CommandTable {
    fn build() -> Self {
        use crate::handlers::{channel, messaging, mode, registration, server};

        let mut entries: Vec<CommandEntry> = Vec::new();

        let mut e = CommandEntry::new("PASS");
        e.unregistered = func(2, registration::mr_pass);
        e.client = Slot::AlreadyRegistered;
        entries.push(e);

        let mut e = CommandEntry::new("NICK");
        e.unregistered = func(2, registration::mr_nick);
        e.client = func(2, registration::m_nick);
        e.server = func(2, registration::m_nick);
        e.oper = func(2, registration::m_nick);
        entries.push(e);

        let mut e = CommandEntry::new("USER");
        e.unregistered = func(5, registration::mr_user);
        e.client = Slot::AlreadyRegistered;
        entries.push(e);

        let mut e = CommandEntry::new("CAP");
        e.unregistered = func(2, registration::m_cap);
        e.client = func(2, registration::m_cap);
        e.oper = func(2, registration::m_cap);
        entries.push(e);

        let mut e = CommandEntry::new("PING");
        e.client = func(2, registration::m_ping);
        e.server = func(2, registration::ms_ping);
        e.oper = func(2, registration::m_ping);
        entries.push(e);

        let mut e = CommandEntry::new("PONG");
        e.unregistered = func(1, registration::mr_pong);
        e.client = func(1, registration::m_pong);
        e.server = func(2, registration::ms_pong);
        e.oper = func(1, registration::m_pong);
        entries.push(e);

        let mut e = CommandEntry::new("QUIT");
        e.unregistered = func(1, registration::m_quit);
        e.client = func(1, registration::m_quit);
        e.server = func(1, registration::m_quit);
        e.oper = func(1, registration::m_quit);
        entries.push(e);

        let mut e = CommandEntry::new("ERROR");
        e.unregistered = func(1, server::m_error);
        e.server = func(1, server::m_error);
        entries.push(e);

        // Channel commands.
        let mut e = CommandEntry::new("JOIN");
        e.client = func(2, channel::m_join);
        e.server = func(4, channel::ms_join);
        e.oper = func(2, channel::m_join);
        entries.push(e);

        let mut e = CommandEntry::new("PART");
        e.client = func(2, channel::m_part);
        e.server = func(2, channel::m_part);
        e.oper = func(2, channel::m_part);
        entries.push(e);

        let mut e = CommandEntry::new("TOPIC");
        e.client = func(2, channel::m_topic);
        e.server = func(2, channel::m_topic);
        e.oper = func(2, channel::m_topic);
        entries.push(e);

        let mut e = CommandEntry::new("NAMES");
        e.client = func(1, channel::m_names);
        e.oper = func(1, channel::m_names);
        e.paced = true;
        e.remote_gated = true;
        entries.push(e);

        let mut e = CommandEntry::new("INVITE");
        e.client = func(3, channel::m_invite);
        e.server = func(3, channel::m_invite);
        e.oper = func(3, channel::m_invite);
        e.remote_gated = true;
        entries.push(e);

        // Modes.
        let mut e = CommandEntry::new("MODE");
        e.client = func(2, mode::m_mode);
        e.server = func(2, mode::m_mode);
        e.oper = func(2, mode::m_mode);
        entries.push(e);

        let mut e = CommandEntry::new("TMODE");
        e.server = func(4, mode::ms_tmode);
        entries.push(e);

        let mut e = CommandEntry::new("SJOIN");
        e.server = func(5, server::ms_sjoin);
        entries.push(e);

        let mut e = CommandEntry::new("BMASK");
        e.server = func(5, server::ms_bmask);
        entries.push(e);

        // Messaging.
        let mut e = CommandEntry::new("PRIVMSG");
        e.client = func(3, messaging::m_privmsg);
        e.server = func(3, messaging::m_privmsg);
        e.oper = func(3, messaging::m_privmsg);
        entries.push(e);

        let mut e = CommandEntry::new("NOTICE");
        e.client = func(3, messaging::m_notice);
        e.server = func(3, messaging::m_notice);
        e.oper = func(3, messaging::m_notice);
        entries.push(e);

        let mut e = CommandEntry::new("AWAY");
        e.client = func(1, messaging::m_away);
        e.server = func(1, messaging::m_away);
        e.oper = func(1, messaging::m_away);
        entries.push(e);

        let mut e = CommandEntry::new("WALLOPS");
        e.client = Slot::NotOper;
        e.server = func(2, messaging::ms_wallops);
        e.oper = func(2, messaging::mo_wallops);
        entries.push(e);

        // Server-to-server.
        let mut e = CommandEntry::new("CAPAB");
        e.unregistered = func(2, server::mr_capab);
        entries.push(e);

        let mut e = CommandEntry::new("SERVER");
        e.unregistered = func(4, server::mr_server);
        entries.push(e);

        let mut e = CommandEntry::new("SID");
        e.server = func(5, server::ms_sid);
        entries.push(e);

        let mut e = CommandEntry::new("UID");
        e.server = func(11, server::ms_uid);
        entries.push(e);

        let mut e = CommandEntry::new("SQUIT");
        e.server = func(3, server::ms_squit);
        e.oper = func(2, server::mo_squit);
        entries.push(e);

        let mut e = CommandEntry::new("ENCAP");
        e.server = func(3, server::ms_encap);
        entries.push(e);

        let mut e = CommandEntry::new("SVSACCOUNT");
        e.server = func(4, server::ms_svsaccount);
        e.encap = func(4, server::ms_svsaccount);
        entries.push(e);

        let mut e = CommandEntry::new("EOB");
        e.server = func(1, server::ms_eob);
        entries.push(e);

        let mut e = CommandEntry::new("CONNECT");
        e.client = Slot::NotOper;
        e.server = func(2, server::mo_connect);
        e.oper = func(2, server::mo_connect);
        entries.push(e);

        let mut map = HashMap::new();
        for entry in entries {
            map.insert(entry.verb, entry);
        }
        Self { map }
    }

    pub fn get(&self, verb: &str) -> Option<&CommandEntry> {
        self.map.get(verb)
    }
}

/// The process-wide verb table, built on first dispatch.
pub fn table() -> &'static CommandTable {
    static TABLE: OnceLock<CommandTable> = OnceLock::new();
    TABLE.get_or_init(CommandTable::build)
}

/// Parse one inbound line from `conn_uid` and run the matching handler.
pub fn dispatch(core: &mut Core, conn_uid: &str, line: &str) {
    let Ok(msg) = Message::parse(line) else {
        return;
    };
    let verb = msg.command.to_ascii_uppercase();

    let Some(conn_client) = core.clients.get(conn_uid) else {
        return;
    };
    let conn_status = conn_client.status;
    let conn_is_server = conn_status == Status::Server;

    // A prefix is only meaningful on server links; elsewhere the
    // connection itself is the source.
    let source = if conn_is_server && let Some(prefix) = &msg.prefix {
        match core.resolve_prefix(prefix) {
            Some(uid) => {
                // Hunt for messages arriving from the wrong direction.
                let route = core.route_of(&uid);
                if uid != conn_uid && route.as_deref() != Some(conn_uid) {
                    tracing::debug!(%prefix, conn = %conn_uid, "dropping message from wrong direction");
                    return;
                }
                uid
            }
            None => {
                tracing::debug!(%prefix, "dropping message with unknown prefix");
                return;
            }
        }
    } else {
        conn_uid.to_string()
    };

    // The slot is picked by the local connection's class; the handler
    // receives the resolved source. A remote user's command therefore
    // arrives through the server slot of its uplink.
    let class = match conn_status {
        Status::Unknown | Status::Connecting | Status::Handshake => SourceClass::Unregistered,
        Status::Server => SourceClass::Server,
        Status::Client => {
            if conn_client.umodes.has(UserModes::OPER) {
                SourceClass::Oper
            } else {
                SourceClass::Client
            }
        }
    };

    let mut parv = Vec::with_capacity(msg.params.len() + 1);
    parv.push(verb.clone());
    parv.extend(msg.params);

    let Some(entry) = table().get(verb.as_str()) else {
        match class {
            SourceClass::Server => {
                tracing::debug!(%verb, peer = %conn_uid, "unknown command from server")
            }
            _ => {
                core.sendto_one_numeric(
                    &source,
                    Numeric::ErrUnknownCommand,
                    &format!("{verb} :Unknown command"),
                );
            }
        }
        return;
    };

    // Remote users lose access to gated commands when the
    // disable_remote_commands switch is on.
    if entry.remote_gated
        && core.config.general.disable_remote_commands
        && class == SourceClass::Server
        && core.clients.get(&source).is_some_and(|c| c.is_client())
    {
        return;
    }

    let slot = match class {
        SourceClass::Unregistered => entry.unregistered,
        SourceClass::Client => entry.client,
        SourceClass::Server => entry.server,
        SourceClass::Oper => entry.oper,
    };

    match slot {
        Slot::Func { min_args, func } => {
            if parv.len() < min_args {
                core.sendto_one_numeric(
                    &source,
                    Numeric::ErrNeedMoreParams,
                    &format!("{verb} :Not enough parameters"),
                );
                return;
            }
            if entry.paced && !pace_ok(core, &source) {
                core.sendto_one_numeric(
                    &source,
                    Numeric::RplLoad2Hi,
                    &format!(
                        "{verb} :Server load is temporarily too heavy. Please wait a while and try again."
                    ),
                );
                return;
            }
            func(core, &source, &parv);
        }
        Slot::Ignore => {}
        Slot::NotRegistered => {
            core.sendto_one_numeric(
                &source,
                Numeric::ErrNotRegistered,
                ":You have not registered",
            );
        }
        Slot::NotOper => {
            core.sendto_one_numeric(
                &source,
                Numeric::ErrNoPrivileges,
                ":Permission Denied - You're not an IRC operator",
            );
        }
        Slot::AlreadyRegistered => {
            core.sendto_one_numeric(
                &source,
                Numeric::ErrAlreadyRegistered,
                ":You may not reregister",
            );
        }
    }
}

/// Pacing gate: local non-opers may run paced commands at most once
/// per `pace_wait` seconds.
fn pace_ok(core: &mut Core, source: &str) -> bool {
    let pace_wait = core.config.general.pace_wait;
    let now = core.time.mono;
    let Some(client) = core.clients.get_mut(source) else {
        return true;
    };
    if client.umodes.has(UserModes::OPER) {
        return true;
    }
    let Some(conn) = client.conn.as_mut() else {
        return true;
    };
    if now.saturating_sub(conn.last_paced) < pace_wait {
        return false;
    }
    conn.last_paced = now;
    true
}
