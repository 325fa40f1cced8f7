//! Server-link verbs: CAPAB, SERVER, SID, UID, SJOIN, BMASK, SQUIT,
//! ENCAP, SVSACCOUNT, EOB, ERROR, and the oper CONNECT.

use crate::channel::modes::{remote_add_mask, simple_bit_for};
use crate::channel::{Channel, ListType, MAXMODEPARAMS, MemberFlags, SimpleModes, check_name};
use crate::core::Core;
use crate::core::client::{Caps, ClientFlags, ServerCaps, Status, UserModes};
use crate::link::{HuntStatus, server_connect, valid_server_name};
use crate::send::NoticeLevel;
use oxirc_proto::{Message, Numeric, fold, irc_eq, match_mask};

pub fn mr_capab(core: &mut Core, source: &str, parv: &[String]) {
    if let Some(conn) = core.clients.get_mut(source).and_then(|c| c.conn.as_mut()) {
        conn.server_caps = ServerCaps::parse(&parv[1..].join(" "));
    }
}

/// SERVER from an unregistered link: the peer introduces itself and
/// both sides settle into a registered link plus a state burst.
pub fn mr_server(core: &mut Core, source: &str, parv: &[String]) {
    let name = parv[1].clone();
    let sid = parv[3].clone();
    // parv[4] is the +flags word when present, else already the info.
    let has_flags = parv.get(4).is_some_and(|f| f.starts_with('+'));
    let flags_word = if has_flags { parv.get(4).cloned() } else { None };
    let info = if has_flags {
        parv.get(5).cloned().unwrap_or_default()
    } else {
        parv.get(4).cloned().unwrap_or_default()
    };

    if !valid_server_name(&name) {
        core.exit_client(source, "Bogus server name");
        return;
    }
    if core.find_server(&name).is_some() || core.clients.contains_key(&sid) {
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            NoticeLevel::All,
            &format!("Link {name} dropped, already linked"),
        );
        core.exit_client(source, "Server already exists");
        return;
    }

    let Some(block) = core
        .connects
        .iter()
        .find(|c| irc_eq(&c.block.name, &name))
        .map(|c| c.block.clone())
    else {
        let shown = core
            .clients
            .get(source)
            .map(|c| c.describe(true))
            .unwrap_or_else(|| name.clone());
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            NoticeLevel::Admin,
            &format!("No connect block for {shown}"),
        );
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            NoticeLevel::Oper,
            &format!("No connect block for {name}"),
        );
        core.exit_client(source, "No connect block");
        return;
    };

    let password_ok = core
        .clients
        .get(source)
        .and_then(|c| c.conn.as_ref())
        .and_then(|conn| conn.password.as_deref())
        .map(|p| p == block.accept_password)
        .unwrap_or(false);
    if !password_ok {
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            NoticeLevel::All,
            &format!("Access denied (bad password) for {name}"),
        );
        core.exit_client(source, "Bad password");
        return;
    }

    // The placeholder uid gives way to the peer's SID.
    core.rekey_client(source, &sid);
    let outbound = {
        let Some(client) = core.clients.get_mut(&sid) else {
            return;
        };
        client.name = name.clone();
        client.info = info.clone();
        client.status = Status::Server;
        if flags_word.is_some_and(|flags| flags.contains('h')) {
            client.flags.set(ClientFlags::HIDDEN);
        }
        client.conn.as_ref().is_some_and(|c| c.sent_handshake)
    };
    core.server_names.insert(fold(&name), sid.clone());
    core.local_servers.insert(sid.clone());
    core.pending_links.retain(|p| !irc_eq(&p.name, &name));

    if !outbound {
        // Inbound link: answer with our own handshake before bursting.
        let me = core.me.clone();
        let flags = if me.hidden { "h" } else { "" };
        core.sendto_one(&sid, &format!("PASS {}", block.send_password));
        core.sendto_one(&sid, &format!("CAPAB :{}", ServerCaps::advertisement()));
        core.sendto_one(
            &sid,
            &format!("SERVER {} 1 {} +{flags} :{}", me.name, me.id, me.info),
        );
        if let Some(conn) = core.clients.get_mut(&sid).and_then(|c| c.conn.as_mut()) {
            conn.sent_handshake = true;
        }
    }

    core.sendto_realops_flags(
        UserModes::SERVNOTICE,
        NoticeLevel::All,
        &format!("Link with {name} established"),
    );
    tracing::info!(server = %name, %sid, "server link registered");

    crate::link::send_burst(core, &sid);

    // Introduce the new peer to the rest of the network.
    let me_id = core.me.id.clone();
    core.sendto_server(Some(&sid), 0, 0, &format!(":{me_id} SID {name} 2 {sid} :{info}"));
}

/// A server behind a direct peer.
pub fn ms_sid(core: &mut Core, source: &str, parv: &[String]) {
    let name = parv[1].clone();
    let sid = parv[3].clone();
    let info = parv[4].clone();
    if core.clients.contains_key(&sid) || core.find_server(&name).is_some() {
        core.exit_client(source, "SID collision");
        return;
    }
    let from = core.route_of(source).unwrap_or_else(|| source.to_string());
    let mut client = crate::core::client::Client::new(sid.clone(), Status::Server);
    client.name = name.clone();
    client.info = info.clone();
    client.from = from;
    core.clients.insert(sid.clone(), client);
    core.server_names.insert(fold(&name), sid.clone());

    core.sendto_server(
        Some(source),
        0,
        0,
        &format!(":{source} SID {name} {} {sid} :{info}", parv[2]),
    );
}

/// A user introduction from the network.
pub fn ms_uid(core: &mut Core, source: &str, parv: &[String]) {
    let nick = parv[1].clone();
    let Ok(ts) = parv[3].parse::<u64>() else {
        return;
    };
    let uid = parv[8].clone();
    if core.clients.contains_key(&uid) {
        return;
    }

    // Nick collision: the older registration survives.
    if let Some(holder) = core.nicks.get(&fold(&nick)).cloned() {
        let holder_ts = core.clients.get(&holder).map(|c| c.tsinfo).unwrap_or(0);
        if holder_ts <= ts {
            tracing::warn!(%nick, %uid, "dropping colliding introduction");
            return;
        }
        core.exit_client(&holder, "Nick collision (older wins)");
    }

    let from = core.route_of(source).unwrap_or_else(|| source.to_string());
    let mut client = crate::core::client::Client::new(uid.clone(), Status::Client);
    client.name = nick.clone();
    client.tsinfo = ts;
    client.umodes = UserModes::from_letters(parv[4].trim_start_matches('+'));
    client.username = parv[5].clone();
    client.host = parv[6].clone();
    client.realhost = parv[6].clone();
    client.sockhost = parv[7].clone();
    client.account = parv[9].clone();
    client.info = parv[10].clone();
    client.from = from;
    core.clients.insert(uid.clone(), client);
    core.nicks.insert(fold(&nick), uid.clone());

    let line = Message::new(
        Some(source.to_string()),
        "UID",
        parv[1..].to_vec(),
    )
    .to_line();
    core.sendto_server(Some(source), 0, 0, &line);
}

/// Apply an SJOIN mode snapshot: simple letters plus key and limit.
fn apply_sjoin_modes(chan: &mut Channel, letters: &str, params: &[String]) {
    let mut param_idx = 0usize;
    for c in letters.chars() {
        match c {
            '+' => {}
            'k' => {
                if let Some(key) = params.get(param_idx) {
                    param_idx += 1;
                    chan.key = Some(key.clone());
                }
            }
            'l' => {
                if let Some(arg) = params.get(param_idx) {
                    param_idx += 1;
                    if let Ok(limit) = arg.parse::<u32>() {
                        chan.limit = Some(limit);
                    }
                }
            }
            letter => {
                if let Some(bit) = simple_bit_for(letter) {
                    chan.modes.set(bit);
                }
            }
        }
    }
}

/// Bulk channel state from a peer: membership with prefixes, resolved
/// by timestamp. The older creation time wins; the losing side drops
/// its statuses and simple modes.
pub fn ms_sjoin(core: &mut Core, source: &str, parv: &[String]) {
    let Ok(ts) = parv[1].parse::<u64>() else {
        return;
    };
    let name = parv[2].clone();
    if !check_name(&name, false, false) {
        return;
    }
    let folded = fold(&name);
    let letters = parv[3].clone();
    let mode_params = &parv[4..parv.len() - 1];
    let members = parv[parv.len() - 1].clone();

    let mut keep_their_modes = true;
    let mut strip_their_status = false;

    if let Some(chan) = core.channels.get(&folded) {
        let ours = chan.creation_time;
        if ts < ours {
            let me_id = core.me.id.clone();
            core.channel_demote_members(&folded, &me_id);
            if let Some(chan) = core.channels.get_mut(&folded) {
                chan.modes = SimpleModes::default();
                chan.key = None;
                chan.limit = None;
                chan.creation_time = ts;
            }
        } else if ts > ours {
            keep_their_modes = false;
            strip_their_status = true;
        }
    } else {
        core.channels
            .insert(folded.clone(), Channel::new(&name, ts, core.time.mono));
    }

    if keep_their_modes
        && let Some(chan) = core.channels.get_mut(&folded)
    {
        apply_sjoin_modes(chan, &letters, mode_params);
    }

    let peer_synced = core
        .clients
        .get(source)
        .map(|c| c.flags.has(ClientFlags::EOB))
        .unwrap_or(false);

    let mut accepted: Vec<String> = Vec::new();
    let mut status_changes: Vec<(char, String)> = Vec::new();
    for token in members.split_ascii_whitespace() {
        let mut flags = MemberFlags::default();
        let mut uid = token;
        loop {
            match uid.chars().next() {
                Some('@') => {
                    flags.set(MemberFlags::CHANOP);
                    uid = &uid[1..];
                }
                Some('%') => {
                    flags.set(MemberFlags::HALFOP);
                    uid = &uid[1..];
                }
                Some('+') => {
                    flags.set(MemberFlags::VOICE);
                    uid = &uid[1..];
                }
                _ => break,
            }
        }
        if strip_their_status {
            flags = MemberFlags::default();
        }
        let Some(client) = core.clients.get(uid) else {
            continue;
        };
        if client.is_server() {
            continue;
        }
        let prefix = client.prefix();
        let account = client.account.clone();
        let info = client.info.clone();

        if core.channels[&folded].members.contains_key(uid) {
            continue;
        }
        core.add_user_to_channel(&folded, uid, flags, peer_synced);
        accepted.push(format!("{}{uid}", flags.prefix(true)));

        core.sendto_channel_local(
            None,
            &folded,
            0,
            Caps::EXTENDED_JOIN,
            0,
            &format!(":{prefix} JOIN {name} {account} :{info}"),
        );
        core.sendto_channel_local(
            None,
            &folded,
            0,
            0,
            Caps::EXTENDED_JOIN,
            &format!(":{prefix} JOIN :{name}"),
        );

        let member_name = core.name_of(uid);
        if flags.has(MemberFlags::CHANOP) {
            status_changes.push(('o', member_name.clone()));
        }
        if flags.has(MemberFlags::HALFOP) {
            status_changes.push(('h', member_name.clone()));
        }
        if flags.has(MemberFlags::VOICE) {
            status_changes.push(('v', member_name));
        }
    }

    // Show the carried statuses to local members in MODE batches.
    let server_name = core.name_of(source);
    for batch in status_changes.chunks(MAXMODEPARAMS) {
        let letters: String = batch.iter().map(|(l, _)| *l).collect();
        let args: Vec<&str> = batch.iter().map(|(_, n)| n.as_str()).collect();
        core.sendto_channel_local(
            None,
            &folded,
            0,
            0,
            0,
            &format!(":{server_name} MODE {name} +{letters} {}", args.join(" ")),
        );
    }

    if accepted.is_empty() {
        // Nothing new; the channel may still exist from before.
        return;
    }

    let (final_ts, mode_letters, mode_args) = {
        let chan = &core.channels[&folded];
        let (letters, args) = chan.mode_string(true);
        (chan.creation_time, letters, args)
    };
    let mut line = format!(":{source} SJOIN {final_ts} {name} {mode_letters}");
    if !mode_args.is_empty() {
        line.push(' ');
        line.push_str(&mode_args);
    }
    line.push_str(&format!(" :{}", accepted.join(" ")));
    core.sendto_server(Some(source), 0, 0, &line);
}

/// Bulk mask-list state from a peer.
pub fn ms_bmask(core: &mut Core, source: &str, parv: &[String]) {
    let Ok(ts) = parv[1].parse::<u64>() else {
        return;
    };
    let folded = fold(&parv[2]);
    let list = match parv[3].as_str() {
        "b" => ListType::Ban,
        "e" => ListType::Except,
        "I" => ListType::Invex,
        _ => return,
    };
    let who = core.name_of(source);
    let when = core.time.real;

    {
        let Core {
            channels, extbans, ..
        } = core;
        let Some(chan) = channels.get_mut(&folded) else {
            return;
        };
        if ts > chan.creation_time {
            return;
        }
        for mask in parv[4].split_ascii_whitespace() {
            remote_add_mask(chan, extbans, list, mask, &who, when);
        }
    }

    let line = Message::new(Some(source.to_string()), "BMASK", parv[1..].to_vec()).to_line();
    core.sendto_server(Some(source), 0, 0, &line);
}

/// Encapsulated command: dispatch locally when the target mask covers
/// us, and pass it to every other matching server.
pub fn ms_encap(core: &mut Core, source: &str, parv: &[String]) {
    let mask = parv[1].clone();
    let subverb = parv[2].to_ascii_uppercase();

    let tail = Message::new(None, "ENCAP", parv[1..].to_vec()).to_line();
    core.sendto_match_servs(source, &mask, ServerCaps::ENCAP, &tail);

    if !match_mask(&mask, &core.me.name) {
        return;
    }
    let Some(entry) = crate::dispatch::table().get(subverb.as_str()) else {
        return;
    };
    let crate::dispatch::Slot::Func { min_args, func } = entry.encap else {
        return;
    };
    let mut sub_parv = vec![subverb];
    sub_parv.extend_from_slice(&parv[3..]);
    if sub_parv.len() < min_args {
        return;
    }
    func(core, source, &sub_parv);
}

/// Services-issued account label change.
pub fn ms_svsaccount(core: &mut Core, source: &str, parv: &[String]) {
    let source_ok = core
        .clients
        .get(source)
        .is_some_and(|c| c.is_server() || c.is_service());
    if !source_ok {
        return;
    }
    let Some(target) = core.find_person(&parv[1]).map(|c| c.uid.clone()) else {
        return;
    };
    let Ok(ts) = parv[2].parse::<u64>() else {
        return;
    };
    let tsinfo = core.clients.get(&target).map(|c| c.tsinfo).unwrap_or(0);
    if ts != 0 && ts != tsinfo {
        return;
    }

    let account = parv[3].clone();
    let prefix = {
        let Some(client) = core.clients.get_mut(&target) else {
            return;
        };
        client.account = account.clone();
        if account == "*" {
            client.umodes.clear(UserModes::REGISTERED);
        } else {
            client.umodes.set(UserModes::REGISTERED);
        }
        client.prefix()
    };

    core.sendto_common_channels_local(
        &target,
        true,
        Caps::ACCOUNT_NOTIFY,
        0,
        &format!(":{prefix} ACCOUNT {account}"),
    );
    core.sendto_server(
        Some(source),
        0,
        0,
        &format!(":{source} SVSACCOUNT {target} {tsinfo} {account}"),
    );
}

pub fn ms_eob(core: &mut Core, source: &str, _parv: &[String]) {
    let newly = core.clients.get_mut(source).is_some_and(|client| {
        if !client.flags.has(ClientFlags::EOB) {
            client.flags.set(ClientFlags::EOB);
            true
        } else {
            false
        }
    });
    if newly {
        let name = core.name_of(source);
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            NoticeLevel::All,
            &format!("End of burst from {name}"),
        );
    }
}

pub fn m_error(core: &mut Core, source: &str, parv: &[String]) {
    let text = parv.get(1).cloned().unwrap_or_default();
    let name = core.name_of(source);
    tracing::warn!(peer = %name, %text, "ERROR from peer");
    core.sendto_realops_flags(
        UserModes::SERVNOTICE,
        NoticeLevel::All,
        &format!("ERROR :from {name} -- {text}"),
    );
    core.exit_client(source, "ERROR received");
}

pub fn ms_squit(core: &mut Core, _source: &str, parv: &[String]) {
    let target = parv[1].clone();
    let reason = parv[2].clone();
    if target == core.me.id || irc_eq(&target, &core.me.name) {
        return;
    }
    if let Some(uid) = core.find_server(&target).map(|c| c.uid.clone()) {
        core.exit_client(&uid, &reason);
    }
}

pub fn mo_squit(core: &mut Core, source: &str, parv: &[String]) {
    let target = parv[1].clone();
    let reason = parv
        .get(2)
        .cloned()
        .unwrap_or_else(|| core.name_of(source));
    let Some(uid) = core.find_server(&target).map(|c| c.uid.clone()) else {
        core.sendto_one_numeric(
            source,
            Numeric::ErrNoSuchServer,
            &format!("{target} :No such server"),
        );
        return;
    };
    if core.local_servers.contains(&uid) {
        core.exit_client(&uid, &reason);
    } else {
        let route = core.route_of(&uid).unwrap_or_default();
        core.sendto_one(&route, &format!(":{source} SQUIT {uid} :{reason}"));
    }
}

/// Oper-initiated connect, possibly hunted to a remote server.
pub fn mo_connect(core: &mut Core, source: &str, parv: &[String]) {
    if let Some(remote) = parv.get(3) {
        match core.hunt_server(source, remote) {
            HuntStatus::IsMe => {}
            HuntStatus::Pass(target) => {
                core.sendto_one(
                    &target,
                    &format!(":{source} CONNECT {} {} {target}", parv[1], parv[2]),
                );
                return;
            }
            HuntStatus::NoSuch => return,
        }
    }

    let name = parv[1].clone();
    if core.find_server(&name).is_some() {
        core.sendto_one_notice(source, &format!("Connect: server {name} already exists"));
        return;
    }
    let known = core
        .connects
        .iter()
        .any(|c| irc_eq(&c.block.name, &name));
    if !known {
        core.sendto_one_notice(source, &format!("Connect: no connect block for {name}"));
        return;
    }
    server_connect(core, &name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{add_local_user, add_remote_user, add_server, drain, test_core};
    use crate::dispatch::dispatch;

    fn add_inbound_link(core: &mut Core) -> crate::core::tests::TestClient {
        let uid = core.next_uid();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut client = crate::core::client::Client::new(uid.clone(), Status::Unknown);
        client.sockhost = "203.0.113.9".to_string();
        client.created_monotonic = core.time.mono;
        client.conn = Some(crate::core::client::Connection::new(
            tx,
            1 << 20,
            "default".to_string(),
        ));
        core.clients.insert(uid.clone(), client);
        crate::core::tests::TestClient { uid, rx }
    }

    #[test]
    fn inbound_link_handshake_registers_and_bursts() {
        let mut core = crate::core::tests::core_from(
            r#"
            [[connect]]
            name = "hub.example.org"
            host = "203.0.113.9"
            port = 6667
            send_password = "ours"
            accept_password = "theirs"
        "#,
        );
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        drain(&mut alice);

        let mut link = add_inbound_link(&mut core);
        dispatch(&mut core, &link.uid.clone(), "PASS theirs");
        dispatch(&mut core, &link.uid.clone(), "CAPAB :QS EX IE ENCAP TBURST EOB");
        dispatch(
            &mut core,
            &link.uid.clone(),
            "SERVER hub.example.org 1 002 + :Example Hub",
        );

        // The placeholder uid gave way to the peer's SID.
        assert!(!core.clients.contains_key(&link.uid));
        assert!(core.clients.contains_key("002"));
        assert_eq!(core.clients["002"].status, Status::Server);
        assert!(core.local_servers.contains("002"));
        assert_eq!(
            core.server_names.get("hub.example.org"),
            Some(&"002".to_string())
        );

        let lines = drain(&mut link);
        // Our half of the handshake, then the burst.
        assert_eq!(lines[0], "PASS ours");
        assert!(lines[1].starts_with("CAPAB :QS EX IE"));
        assert_eq!(lines[2], "SERVER irc.example.org 1 001 + :test server");
        assert!(lines.iter().any(|l| l.contains(" UID alice ")));
        assert!(lines.iter().any(|l| l.contains(" SJOIN ")));
        assert_eq!(lines.last().unwrap(), "PING :001");
    }

    #[test]
    fn inbound_link_with_bad_password_is_dropped() {
        let mut core = crate::core::tests::core_from(
            r#"
            [[connect]]
            name = "hub.example.org"
            host = "203.0.113.9"
            port = 6667
            send_password = "ours"
            accept_password = "theirs"
        "#,
        );
        let mut link = add_inbound_link(&mut core);
        dispatch(&mut core, &link.uid.clone(), "PASS wrong");
        dispatch(
            &mut core,
            &link.uid.clone(),
            "SERVER hub.example.org 1 002 + :Example Hub",
        );
        assert!(!core.clients.contains_key(&link.uid));
        assert!(!core.clients.contains_key("002"));
        assert!(core.local_servers.is_empty());
    }

    #[test]
    fn sjoin_older_timestamp_demotes_and_takes_over() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        add_remote_user(&mut core, "002", "remote1", "002AAAAAA");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        drain(&mut alice);
        drain(&mut hub);
        let ours = core.channels[&fold("#t")].creation_time;

        let line = format!(":002 SJOIN {} #t +i :@002AAAAAA", ours - 100);
        dispatch(&mut core, &"002".to_string(), &line);

        let chan = &core.channels[&fold("#t")];
        assert_eq!(chan.creation_time, ours - 100);
        // Our creator lost op; their member carries it.
        assert!(
            !chan.members[&alice.uid]
                .flags
                .has(MemberFlags::CHANOP)
        );
        assert!(
            chan.members["002AAAAAA"]
                .flags
                .has(MemberFlags::CHANOP)
        );
        // Their +i applied, our +nt from creation was wiped first.
        assert!(chan.modes.has(SimpleModes::INVITEONLY));
        assert!(!chan.modes.has(SimpleModes::NOPRIVMSGS));

        let seen = drain(&mut alice);
        assert!(seen.iter().any(|l| l.contains("MODE #t -o alice")));
        assert!(
            seen.iter()
                .any(|l| l == ":remote1!remote1@remote.example JOIN :#t")
        );
        assert!(seen.iter().any(|l| l.contains("MODE #t +o remote1")));
    }

    #[test]
    fn sjoin_newer_timestamp_strips_their_status() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        add_remote_user(&mut core, "002", "remote1", "002AAAAAA");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        drain(&mut alice);
        drain(&mut hub);
        let ours = core.channels[&fold("#t")].creation_time;

        let line = format!(":002 SJOIN {} #t +i :@002AAAAAA", ours + 100);
        dispatch(&mut core, &"002".to_string(), &line);

        let chan = &core.channels[&fold("#t")];
        assert_eq!(chan.creation_time, ours);
        assert!(chan.members[&alice.uid].flags.has(MemberFlags::CHANOP));
        assert!(
            !chan.members["002AAAAAA"]
                .flags
                .has(MemberFlags::CHANOP)
        );
        assert!(!chan.modes.has(SimpleModes::INVITEONLY));
    }

    #[test]
    fn bmask_merges_lists_quietly() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        drain(&mut alice);
        drain(&mut hub);
        let ts = core.channels[&fold("#t")].creation_time;

        dispatch(
            &mut core,
            &"002".to_string(),
            &format!(":002 BMASK {ts} #t b :*!*@one.example *!*@two.example"),
        );
        assert_eq!(core.channels[&fold("#t")].bans.len(), 2);
        // Local members are not notified of burst masks.
        assert!(drain(&mut alice).is_empty());

        // A stale timestamp is ignored.
        dispatch(
            &mut core,
            &"002".to_string(),
            &format!(":002 BMASK {} #t b :*!*@three.example", ts + 5),
        );
        assert_eq!(core.channels[&fold("#t")].bans.len(), 2);
    }

    #[test]
    fn svsaccount_sets_label_and_notifies() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut watcher = add_local_user(&mut core, "watcher", "w", "h2");
        if let Some(conn) = core.clients.get_mut(&watcher.uid).unwrap().conn.as_mut() {
            conn.caps = Caps(Caps::ACCOUNT_NOTIFY);
        }
        let mut hub = add_server(&mut core, "services.example.org", "002");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        dispatch(&mut core, &watcher.uid.clone(), "JOIN #t");
        drain(&mut alice);
        drain(&mut watcher);
        drain(&mut hub);

        let ts = core.clients[&alice.uid].tsinfo;
        dispatch(
            &mut core,
            &"002".to_string(),
            &format!(":002 SVSACCOUNT alice {ts} services-acct"),
        );
        assert_eq!(core.clients[&alice.uid].account, "services-acct");
        assert!(core.clients[&alice.uid].umodes.has(UserModes::REGISTERED));
        assert_eq!(
            drain(&mut watcher),
            vec![":alice!a@h ACCOUNT services-acct".to_string()]
        );

        // A wrong timestamp is ignored.
        dispatch(
            &mut core,
            &"002".to_string(),
            &format!(":002 SVSACCOUNT alice {} other", ts + 3),
        );
        assert_eq!(core.clients[&alice.uid].account, "services-acct");
    }

    #[test]
    fn uid_introduction_registers_remote_user() {
        let mut core = test_core();
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        drain(&mut hub);
        dispatch(
            &mut core,
            &"002".to_string(),
            ":002 UID remy 1 1700000100 +i ru remote.example 198.51.100.9 002AAAAAC * :Remy",
        );
        let client = &core.clients["002AAAAAC"];
        assert_eq!(client.name, "remy");
        assert_eq!(client.from, "002");
        assert!(client.umodes.has(UserModes::INVISIBLE));
        assert!(core.nicks.contains_key("remy"));
    }

    #[test]
    fn squit_removes_subtree() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        add_remote_user(&mut core, "002", "r1", "002AAAAAA");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        core.add_user_to_channel(&fold("#t"), "002AAAAAA", MemberFlags::default(), false);
        drain(&mut alice);
        drain(&mut hub);

        core.exit_client(&"002".to_string(), "remote split");

        assert!(!core.clients.contains_key("002"));
        assert!(!core.clients.contains_key("002AAAAAA"));
        assert!(!core.nicks.contains_key("r1"));
        // Alice saw the dependent user quit.
        let seen = drain(&mut alice);
        assert!(seen.iter().any(|l| l.contains("QUIT")));
    }
}
