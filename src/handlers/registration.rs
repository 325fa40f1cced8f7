//! Registration and liveness: PASS, NICK, USER, CAP, PING, PONG, QUIT.

use crate::core::Core;
use crate::core::client::{Caps, ClientFlags, NICKLEN, Status, UserModes};
use oxirc_proto::{Numeric, fold};

/// Nick validation: RFC 1459 nick characters, not starting with a
/// digit or hyphen.
fn valid_nick(nick: &str) -> bool {
    if nick.is_empty() || nick.len() > NICKLEN {
        return false;
    }
    let mut chars = nick.chars();
    let first = chars.next().unwrap_or(' ');
    if first.is_ascii_digit() || first == '-' {
        return false;
    }
    nick.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}' | '-')
    })
}

pub fn mr_pass(core: &mut Core, source: &str, parv: &[String]) {
    if let Some(conn) = core.clients.get_mut(source).and_then(|c| c.conn.as_mut()) {
        conn.password = Some(parv[1].clone());
    }
}

pub fn mr_nick(core: &mut Core, source: &str, parv: &[String]) {
    let nick = parv[1].clone();
    if !valid_nick(&nick) {
        core.sendto_one_numeric(
            source,
            Numeric::ErrErroneousNickname,
            &format!("{nick} :Erroneous Nickname"),
        );
        return;
    }
    if core.nicks.contains_key(&fold(&nick)) {
        core.sendto_one_numeric(
            source,
            Numeric::ErrNicknameInUse,
            &format!("{nick} :Nickname is already in use."),
        );
        return;
    }
    if let Some(client) = core.clients.get_mut(source) {
        client.name = nick;
        if let Some(conn) = client.conn.as_mut() {
            conn.reg.nick = true;
        }
    }
    try_register(core, source);
}

pub fn mr_user(core: &mut Core, source: &str, parv: &[String]) {
    if let Some(client) = core.clients.get_mut(source) {
        let mut username = parv[1].clone();
        username.truncate(10);
        client.username = username;
        client.info = parv[4].clone();
        if let Some(conn) = client.conn.as_mut() {
            conn.reg.user = true;
        }
    }
    try_register(core, source);
}

/// Capability negotiation. LS and REQ before registration hold the
/// handshake open until CAP END.
pub fn m_cap(core: &mut Core, source: &str, parv: &[String]) {
    let sub = parv[1].to_ascii_uppercase();
    let nick = core.name_of(source);
    let me = core.me.name.clone();
    let registered = core
        .clients
        .get(source)
        .is_some_and(|c| c.status == Status::Client);

    match sub.as_str() {
        "LS" => {
            if !registered
                && let Some(conn) = core.clients.get_mut(source).and_then(|c| c.conn.as_mut())
            {
                conn.reg.cap_negotiating = true;
            }
            let caps = Caps::NAMES
                .iter()
                .map(|(name, _)| *name)
                .collect::<Vec<_>>()
                .join(" ");
            core.sendto_one(source, &format!(":{me} CAP {nick} LS :{caps}"));
        }
        "LIST" => {
            let set = core.clients.get(source).map(|c| c.caps()).unwrap_or_default();
            let names = Caps::NAMES
                .iter()
                .filter(|(_, bit)| set.has_all(*bit))
                .map(|(name, _)| *name)
                .collect::<Vec<_>>()
                .join(" ");
            core.sendto_one(source, &format!(":{me} CAP {nick} LIST :{names}"));
        }
        "REQ" => {
            let request = parv.get(2).cloned().unwrap_or_default();
            let mut add = 0u32;
            let mut remove = 0u32;
            let mut ok = true;
            for token in request.split_ascii_whitespace() {
                let (token, removing) = match token.strip_prefix('-') {
                    Some(t) => (t, true),
                    None => (token, false),
                };
                match Caps::from_token(token) {
                    Some(bit) if removing => remove |= bit,
                    Some(bit) => add |= bit,
                    None => ok = false,
                }
            }
            if let Some(conn) = core.clients.get_mut(source).and_then(|c| c.conn.as_mut()) {
                if !registered {
                    conn.reg.cap_negotiating = true;
                }
                if ok {
                    conn.caps.0 |= add;
                    conn.caps.0 &= !remove;
                }
            }
            let reply = if ok { "ACK" } else { "NAK" };
            core.sendto_one(source, &format!(":{me} CAP {nick} {reply} :{request}"));
        }
        "END" => {
            if let Some(conn) = core.clients.get_mut(source).and_then(|c| c.conn.as_mut()) {
                conn.reg.cap_negotiating = false;
            }
            try_register(core, source);
        }
        _ => {}
    }
}

pub fn m_ping(core: &mut Core, source: &str, parv: &[String]) {
    let me = core.me.name.clone();
    core.sendto_one(source, &format!(":{me} PONG {me} :{}", parv[1]));
}

/// Server PING: answer, or pass it along when the destination is a
/// third party.
pub fn ms_ping(core: &mut Core, source: &str, parv: &[String]) {
    if let Some(destination) = parv.get(2)
        && !oxirc_proto::irc_eq(destination, &core.me.name)
        && destination != &core.me.id
    {
        if let Some(target) = core.find_server(destination).map(|c| c.uid.clone()) {
            core.sendto_one(&target, &format!(":{source} PING {} {target}", parv[1]));
        } else {
            core.sendto_one_numeric(
                source,
                Numeric::ErrNoSuchServer,
                &format!("{destination} :No such server"),
            );
        }
        return;
    }
    let me_id = core.me.id.clone();
    core.sendto_one(source, &format!(":{me_id} PONG {} :{source}", core.me.name));
}

/// Unregistered PONG: the ping-cookie gate.
pub fn mr_pong(core: &mut Core, source: &str, parv: &[String]) {
    let Some(cookie_arg) = parv.get(1).filter(|p| !p.is_empty()) else {
        core.sendto_one_numeric(source, Numeric::ErrNoOrigin, ":No origin specified");
        return;
    };
    if !core.config.general.ping_cookie {
        return;
    }
    let expected = core
        .clients
        .get(source)
        .and_then(|c| c.conn.as_ref())
        .and_then(|conn| conn.ping_cookie);
    let Some(expected) = expected else {
        return;
    };
    if cookie_arg.parse::<u32>() == Ok(expected) {
        if let Some(client) = core.clients.get_mut(source) {
            client.flags.set(ClientFlags::PING_COOKIE);
        }
        try_register(core, source);
    } else {
        core.sendto_one_numeric(
            source,
            Numeric::ErrWrongPong,
            &format!(":To connect type /QUOTE PONG {expected}"),
        );
    }
}

pub fn m_pong(_core: &mut Core, _source: &str, _parv: &[String]) {
    // Liveness is tracked when the line is read; nothing further.
}

/// Server PONG: route onward, or treat as end-of-burst from a direct
/// peer.
pub fn ms_pong(core: &mut Core, source: &str, parv: &[String]) {
    if parv.get(1).is_none_or(|p| p.is_empty()) {
        core.sendto_one_numeric(source, Numeric::ErrNoOrigin, ":No origin specified");
        return;
    }
    if let Some(destination) = parv.get(2)
        && !oxirc_proto::irc_eq(destination, &core.me.name)
        && destination != &core.me.id
    {
        if let Some(target) = core.find_server(destination).map(|c| c.uid.clone()) {
            core.sendto_one(&target, &format!(":{source} PONG {} {target}", parv[1]));
        }
        return;
    }
    // First PONG addressed to us after the burst marks the peer synced.
    let newly_synced = core.clients.get_mut(source).is_some_and(|client| {
        if client.is_server() && !client.flags.has(ClientFlags::EOB) {
            client.flags.set(ClientFlags::EOB);
            true
        } else {
            false
        }
    });
    if newly_synced {
        let name = core.name_of(source);
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            crate::send::NoticeLevel::All,
            &format!("End of burst from {name}"),
        );
    }
}

pub fn m_quit(core: &mut Core, source: &str, parv: &[String]) {
    let reason = parv.get(1).cloned().unwrap_or_default();
    let Some(client) = core.clients.get(source) else {
        return;
    };
    let reason = if client.is_local() && client.status == Status::Client {
        let young = client.created_monotonic + core.config.general.anti_spam_exit_message_time
            > core.time.mono;
        if reason.is_empty() || young {
            "Client Quit".to_string()
        } else {
            format!("Quit: {reason}")
        }
    } else if reason.is_empty() {
        core.name_of(source)
    } else {
        reason
    };
    core.exit_client(source, &reason);
}

/// NICK from a registered user: a rename, locally validated and fanned
/// to every common channel exactly once.
pub fn m_nick(core: &mut Core, source: &str, parv: &[String]) {
    let new_nick = parv[1].clone();
    let Some(client) = core.clients.get(source) else {
        return;
    };
    let is_local = client.is_local();
    let old_name = client.name.clone();
    let old_prefix = client.prefix();

    if oxirc_proto::irc_eq(&old_name, &new_nick) && old_name == new_nick {
        return;
    }
    if is_local {
        if !valid_nick(&new_nick) {
            core.sendto_one_numeric(
                source,
                Numeric::ErrErroneousNickname,
                &format!("{new_nick} :Erroneous Nickname"),
            );
            return;
        }
        if let Some(holder) = core.nicks.get(&fold(&new_nick))
            && holder != source
        {
            core.sendto_one_numeric(
                source,
                Numeric::ErrNicknameInUse,
                &format!("{new_nick} :Nickname is already in use."),
            );
            return;
        }
    }

    core.nicks.remove(&fold(&old_name));
    core.nicks.insert(fold(&new_nick), source.to_string());
    let ts = core.time.real;
    if let Some(client) = core.clients.get_mut(source) {
        client.name = new_nick.clone();
        client.tsinfo = ts;
    }

    let line = format!(":{old_prefix} NICK :{new_nick}");
    core.sendto_common_channels_local(source, true, 0, 0, &line);
    core.sendto_server(Some(source), 0, 0, &format!(":{source} NICK {new_nick} :{ts}"));
}

/// Complete local registration once NICK, USER, CAP and the ping
/// cookie have all been satisfied.
pub fn try_register(core: &mut Core, source: &str) {
    let ready = {
        let Some(client) = core.clients.get(source) else {
            return;
        };
        if client.status != Status::Unknown {
            return;
        }
        let Some(conn) = client.conn.as_ref() else {
            return;
        };
        conn.reg.nick
            && conn.reg.user
            && !conn.reg.cap_negotiating
            && (!core.config.general.ping_cookie || client.flags.has(ClientFlags::PING_COOKIE))
    };
    if !ready {
        return;
    }
    register_local_user(core, source);
}

fn register_local_user(core: &mut Core, source: &str) {
    let (nick, is_tls) = {
        let Some(client) = core.clients.get_mut(source) else {
            return;
        };
        let is_tls = client.conn.as_ref().is_some_and(|c| c.is_tls);
        if is_tls {
            client.umodes.set(UserModes::SECURE);
        }
        client.status = Status::Client;
        client.tsinfo = core.time.real;
        (client.name.clone(), is_tls)
    };

    // A racing registration may have taken the nick since NICK time.
    if core.nicks.contains_key(&fold(&nick)) {
        core.sendto_one_numeric(
            source,
            Numeric::ErrNicknameInUse,
            &format!("{nick} :Nickname is already in use."),
        );
        if let Some(client) = core.clients.get_mut(source) {
            client.status = Status::Unknown;
            if let Some(conn) = client.conn.as_mut() {
                conn.reg.nick = false;
            }
        }
        return;
    }

    core.nicks.insert(fold(&nick), source.to_string());
    core.local_clients.insert(source.to_string());

    let prefix = core.prefix_of(source);
    let me = core.me.name.clone();
    core.sendto_one(
        source,
        &format!(":{me} 001 {nick} :Welcome to the Internet Relay Network {prefix}"),
    );

    let (ts, umodes, username, host, sockhost, account, info) = {
        let Some(client) = core.clients.get(source) else {
            return;
        };
        (
            client.tsinfo,
            client.umodes.letters(),
            client.username.clone(),
            client.host.clone(),
            client.sockhost.clone(),
            client.account.clone(),
            client.info.clone(),
        )
    };
    let me_id = core.me.id.clone();
    core.sendto_server(
        None,
        0,
        0,
        &format!(
            ":{me_id} UID {nick} 1 {ts} +{umodes} {username} {host} {sockhost} {source} {account} :{info}"
        ),
    );
    tracing::debug!(uid = %source, %nick, tls = is_tls, "local user registered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{add_server, drain, test_core};
    use crate::core::client::{Client, Connection, Status};
    use crate::dispatch::dispatch;
    use tokio::sync::mpsc;

    fn add_unregistered(core: &mut Core) -> crate::core::tests::TestClient {
        let uid = core.next_uid();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = Client::new(uid.clone(), Status::Unknown);
        client.host = "h".to_string();
        client.realhost = "h".to_string();
        client.sockhost = "127.0.0.1".to_string();
        client.created_monotonic = core.time.mono;
        client.conn = Some(Connection::new(tx, 1 << 20, "default".to_string()));
        core.clients.insert(uid.clone(), client);
        crate::core::tests::TestClient { uid, rx }
    }

    #[test]
    fn nick_user_sequence_registers_and_bursts_uid() {
        let mut core = test_core();
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        let mut c = add_unregistered(&mut core);
        dispatch(&mut core, &c.uid.clone(), "NICK alice");
        dispatch(&mut core, &c.uid.clone(), "USER ada 0 * :Ada L");
        let out = drain(&mut c);
        assert!(out[0].contains(" 001 alice :Welcome"));
        assert_eq!(core.clients[&c.uid].status, Status::Client);
        assert!(core.local_clients.contains(&c.uid));

        let burst = drain(&mut hub);
        assert_eq!(burst.len(), 1);
        assert!(burst[0].starts_with(&format!(":001 UID alice 1 {} +", core.time.real)));
        assert!(burst[0].contains(&c.uid));
    }

    #[test]
    fn ping_cookie_gates_registration() {
        let mut core = crate::core::tests::core_from("[general]\nping_cookie = true");
        let mut c = add_unregistered(&mut core);
        if let Some(conn) = core.clients.get_mut(&c.uid).unwrap().conn.as_mut() {
            conn.ping_cookie = Some(12345);
        }
        dispatch(&mut core, &c.uid.clone(), "NICK alice");
        dispatch(&mut core, &c.uid.clone(), "USER ada 0 * :Ada L");
        assert_eq!(core.clients[&c.uid].status, Status::Unknown);

        // A wrong cookie is refused with ERR_WRONGPONG.
        dispatch(&mut core, &c.uid.clone(), "PONG 99");
        let out = drain(&mut c);
        assert!(out.iter().any(|l| l.contains(" 513 ")));
        assert_eq!(core.clients[&c.uid].status, Status::Unknown);

        dispatch(&mut core, &c.uid.clone(), "PONG 12345");
        assert_eq!(core.clients[&c.uid].status, Status::Client);
    }

    #[test]
    fn cap_negotiation_holds_registration_until_end() {
        let mut core = test_core();
        let mut c = add_unregistered(&mut core);
        dispatch(&mut core, &c.uid.clone(), "CAP LS 302");
        dispatch(&mut core, &c.uid.clone(), "NICK alice");
        dispatch(&mut core, &c.uid.clone(), "USER ada 0 * :Ada L");
        assert_eq!(core.clients[&c.uid].status, Status::Unknown);

        dispatch(&mut core, &c.uid.clone(), "CAP REQ :multi-prefix away-notify");
        dispatch(&mut core, &c.uid.clone(), "CAP END");
        assert_eq!(core.clients[&c.uid].status, Status::Client);
        let caps = core.clients[&c.uid].caps();
        assert!(caps.has_all(crate::core::client::Caps::MULTI_PREFIX));
        assert!(caps.has_all(crate::core::client::Caps::AWAY_NOTIFY));

        let out = drain(&mut c);
        assert!(out.iter().any(|l| l.contains("CAP * LS :")));
        assert!(out.iter().any(|l| l.contains("ACK :multi-prefix away-notify")));
    }

    #[test]
    fn nick_change_renames_and_propagates() {
        let mut core = test_core();
        let mut alice = crate::core::tests::add_local_user(&mut core, "alice", "a", "h");
        let mut bob = crate::core::tests::add_local_user(&mut core, "bob", "b", "h2");
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        core.channel_do_join(&alice.uid, "#test", "");
        core.channel_do_join(&bob.uid, "#test", "");
        drain(&mut alice);
        drain(&mut bob);
        drain(&mut hub);

        dispatch(&mut core, &alice.uid.clone(), "NICK alicia");
        let seen = drain(&mut bob);
        assert_eq!(seen, vec![":alice!a@h NICK :alicia".to_string()]);
        assert!(core.nicks.contains_key("alicia"));
        assert!(!core.nicks.contains_key("alice"));
        let hub_lines = drain(&mut hub);
        assert_eq!(hub_lines.len(), 1);
        assert!(hub_lines[0].starts_with(&format!(":{} NICK alicia :", alice.uid)));
    }
}
