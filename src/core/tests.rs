//! End-to-end scenario tests over the core: joins, modes, bans,
//! fan-out and teardown, asserted as literal wire lines.

use crate::channel::engine::{CanSend, is_banned};
use crate::channel::{MemberFlags, SimpleModes};
use crate::config::Config;
use crate::core::Core;
use crate::core::client::{Caps, Client, ClientFlags, Connection, ServerCaps, Status, Uid};
use oxirc_proto::fold;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct TestClient {
    pub uid: Uid,
    pub rx: mpsc::UnboundedReceiver<String>,
}

pub(crate) fn core_from(extra: &str) -> Core {
    let text = format!(
        r#"
        [server]
        name = "irc.example.org"
        sid = "001"
        description = "test server"
        {extra}
        "#
    );
    let config: Config = toml::from_str(&text).expect("test config parses");
    let mut core = Core::new(Arc::new(config));
    core.time.real = 1_700_000_000;
    core.time.mono = 1_000;
    core
}

pub(crate) fn test_core() -> Core {
    core_from("")
}

pub(crate) fn add_local_user(core: &mut Core, nick: &str, user: &str, host: &str) -> TestClient {
    let uid = core.next_uid();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut client = Client::new(uid.clone(), Status::Client);
    client.name = nick.to_string();
    client.username = user.to_string();
    client.host = host.to_string();
    client.realhost = host.to_string();
    client.sockhost = "127.0.0.1".to_string();
    client.info = format!("{nick} gecos");
    client.tsinfo = core.time.real;
    client.created_monotonic = core.time.mono;
    client.conn = Some(Connection::new(tx, 1 << 20, "default".to_string()));
    core.nicks.insert(fold(nick), uid.clone());
    core.local_clients.insert(uid.clone());
    core.clients.insert(uid.clone(), client);
    TestClient { uid, rx }
}

pub(crate) fn add_server(core: &mut Core, name: &str, sid: &str) -> TestClient {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut client = Client::new(sid.to_string(), Status::Server);
    client.name = name.to_string();
    client.info = format!("{name} description");
    let mut conn = Connection::new(tx, 1 << 20, "default".to_string());
    conn.server_caps = ServerCaps::ours();
    client.conn = Some(conn);
    core.server_names.insert(fold(name), sid.to_string());
    core.local_servers.insert(sid.to_string());
    core.clients.insert(sid.to_string(), client);
    TestClient {
        uid: sid.to_string(),
        rx,
    }
}

pub(crate) fn add_remote_user(core: &mut Core, via: &str, nick: &str, uid: &str) -> Uid {
    let mut client = Client::new(uid.to_string(), Status::Client);
    client.name = nick.to_string();
    client.username = nick.to_string();
    client.host = "remote.example".to_string();
    client.realhost = "remote.example".to_string();
    client.from = via.to_string();
    client.tsinfo = core.time.real;
    core.nicks.insert(fold(nick), uid.to_string());
    core.clients.insert(uid.to_string(), client);
    uid.to_string()
}

pub(crate) fn drain(client: &mut TestClient) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(line) = client.rx.try_recv() {
        out.push(line);
    }
    out
}

fn mode_parv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Every member edge appears exactly once on both sides, and the local
/// subset only holds locally connected clients.
fn assert_membership_invariants(core: &Core) {
    for (folded, channel) in &core.channels {
        assert!(
            !channel.members.is_empty(),
            "channel {folded} present but empty"
        );
        assert!(channel.members_local.len() <= channel.members.len());
        for uid in &channel.members_local {
            assert!(channel.members.contains_key(uid));
            assert!(core.clients.get(uid).is_some_and(|c| c.is_local()));
        }
        for uid in channel.members.keys() {
            let client = core.clients.get(uid).expect("member client exists");
            assert!(
                client.channels.contains(folded),
                "member {uid} missing back-edge to {folded}"
            );
        }
    }
    for client in core.clients.values() {
        for name in &client.channels {
            assert!(
                core.channels
                    .get(name)
                    .is_some_and(|c| c.members.contains_key(&client.uid)),
                "client {} holds stale channel edge {name}",
                client.uid
            );
        }
    }
}

#[test]
fn s1_creation_join_and_names() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut hub = add_server(&mut core, "hub.example.org", "002");

    core.channel_do_join(&alice.uid, "#test", "");

    let out = drain(&mut alice);
    assert_eq!(
        out,
        vec![
            ":alice!a@h JOIN :#test".to_string(),
            ":irc.example.org MODE #test +nt".to_string(),
            ":irc.example.org 353 alice = #test :@alice".to_string(),
            ":irc.example.org 366 alice #test :End of /NAMES list.".to_string(),
        ]
    );

    let uplink = drain(&mut hub);
    assert_eq!(
        uplink,
        vec![format!(
            ":001AAAAAA SJOIN {} #test +nt :@001AAAAAA",
            core.channels[&fold("#test")].creation_time
        )]
    );

    assert_membership_invariants(&core);
    let chan = &core.channels[&fold("#test")];
    assert!(chan.modes.has(SimpleModes::NOPRIVMSGS));
    assert!(chan.modes.has(SimpleModes::TOPICLIMIT));
    assert!(
        chan.members[&alice.uid]
            .flags
            .has(MemberFlags::CHANOP)
    );
}

#[test]
fn s2_key_mismatch_rejects_without_membership_change() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");

    core.channel_do_join(&alice.uid, "#test", "");
    drain(&mut alice);
    core.channels.get_mut(&fold("#test")).unwrap().key = Some("secret".to_string());

    core.channel_do_join(&bob.uid, "#test", "wrong");
    let out = drain(&mut bob);
    assert_eq!(
        out,
        vec![":irc.example.org 475 bob #test :Cannot join channel (+k)".to_string()]
    );
    assert!(!core.channels[&fold("#test")].members.contains_key(&bob.uid));

    // The right key passes.
    core.channel_do_join(&bob.uid, "#test", "secret");
    assert!(core.channels[&fold("#test")].members.contains_key(&bob.uid));
    assert_membership_invariants(&core);
}

#[test]
fn s3_mode_coalescing_single_line_both_directions() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "o", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");
    let mut carol = add_local_user(&mut core, "carol", "c", "h3");

    core.channel_do_join(&alice.uid, "#test", "");
    core.channel_do_join(&bob.uid, "#test", "");
    core.channel_do_join(&carol.uid, "#test", "");
    let mut hub = add_server(&mut core, "hub.example.org", "002");
    drain(&mut alice);
    drain(&mut bob);
    drain(&mut carol);

    // Give bob voice so -v is a real change.
    core.channels
        .get_mut(&fold("#test"))
        .unwrap()
        .members
        .get_mut(&bob.uid)
        .unwrap()
        .flags
        .set(MemberFlags::VOICE);

    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &fold("#test"),
        &mode_parv(&["+o-v", "bob", "bob", "+o", "carol"]),
    );

    let out = drain(&mut bob);
    assert_eq!(
        out,
        vec![":alice!o@h MODE #test +o-v+o bob bob carol".to_string()]
    );

    let ts = core.channels[&fold("#test")].creation_time;
    let uplink = drain(&mut hub);
    assert_eq!(
        uplink,
        vec![format!(
            ":{} TMODE {ts} #test +o-v+o {} {} {}",
            alice.uid, bob.uid, bob.uid, carol.uid
        )]
    );

    let chan = &core.channels[&fold("#test")];
    assert!(chan.members[&bob.uid].flags.has(MemberFlags::CHANOP));
    assert!(!chan.members[&bob.uid].flags.has(MemberFlags::VOICE));
    assert!(chan.members[&carol.uid].flags.has(MemberFlags::CHANOP));
}

#[test]
fn s4_join_flood_notice_emitted_once() {
    let mut core = core_from(
        r#"
        [general]
        joinfloodcount = 3
        joinfloodtime = 10
        "#,
    );
    let mut oper = add_local_user(&mut core, "opnick", "o", "oh");
    {
        let client = core.clients.get_mut(&oper.uid).unwrap();
        client.umodes.set(crate::core::client::UserModes::OPER);
        client.umodes.set(crate::core::client::UserModes::FLOOD);
    }
    core.opers.insert(oper.uid.clone());

    let mut users = Vec::new();
    for (nick, user) in [("u1", "a"), ("u2", "b"), ("u3", "c"), ("u4", "d")] {
        users.push(add_local_user(&mut core, nick, user, "h"));
    }

    // Three joins inside the 10-second window cross the threshold.
    for user in users.iter().take(3) {
        core.channel_do_join(&user.uid, "#flood", "");
    }
    let notices = drain(&mut oper);
    let flood: Vec<&String> = notices
        .iter()
        .filter(|l| l.contains("Possible Join Flooder"))
        .collect();
    assert_eq!(flood.len(), 1);
    assert!(flood[0].contains("target: #flood"));
    assert!(flood[0].contains("on irc.example.org"));

    // A fourth join within the window stays silent.
    core.channel_do_join(&users[3].uid, "#flood", "");
    let notices = drain(&mut oper);
    assert!(!notices.iter().any(|l| l.contains("Possible Join Flooder")));
}

#[test]
fn s5_ban_with_exception() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.channel_do_join(&alice.uid, "#test", "");
    drain(&mut alice);

    let folded = fold("#test");
    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+b", "*!*@evil.example"]),
    );
    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+e", "baduser!*@evil.example"]),
    );

    let mallory = add_local_user(&mut core, "mallory", "m", "evil.example");
    let baduser = add_local_user(&mut core, "baduser", "bad", "evil.example");

    let chan = core.channels.get(&folded).unwrap();
    assert!(is_banned(&core, chan, &mallory.uid));
    assert!(!is_banned(&core, chan, &baduser.uid));
}

#[test]
fn s6_mode_list_query_replies_once_per_letter() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.channel_do_join(&alice.uid, "#test", "");
    let folded = fold("#test");
    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+b", "*!*@evil.example"]),
    );
    drain(&mut alice);

    // A doubled query letter produces one list and one end-of-list.
    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["bb"]),
    );
    let out = drain(&mut alice);
    let lists: Vec<&String> = out.iter().filter(|l| l.contains(" 367 ")).collect();
    let ends: Vec<&String> = out.iter().filter(|l| l.contains(" 368 ")).collect();
    assert_eq!(lists.len(), 1);
    assert_eq!(ends.len(), 1);
    assert!(lists[0].contains("*!*@evil.example"));
    assert!(lists[0].contains("alice!a@h"));
}

#[test]
fn duplicate_key_and_limit_keep_the_latter() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.channel_do_join(&alice.uid, "#test", "");
    drain(&mut alice);
    let folded = fold("#test");

    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+ll", "1", "2"]),
    );
    assert_eq!(core.channels[&folded].limit, Some(2));
    let out = drain(&mut alice);
    assert_eq!(out, vec![":alice!a@h MODE #test +l 2".to_string()]);

    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+kk", "first", "second"]),
    );
    assert_eq!(core.channels[&folded].key.as_deref(), Some("second"));
    let out = drain(&mut alice);
    assert_eq!(out, vec![":alice!a@h MODE #test +k second".to_string()]);
}

#[test]
fn duplicate_ban_add_is_a_noop() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.channel_do_join(&alice.uid, "#test", "");
    let folded = fold("#test");
    let parv = mode_parv(&["+b", "*!*@dup.example"]);
    crate::channel::modes::channel_mode_set(&mut core, &alice.uid.clone(), &folded, &parv);
    drain(&mut alice);

    crate::channel::modes::channel_mode_set(&mut core, &alice.uid.clone(), &folded, &parv);
    let out = drain(&mut alice);
    assert!(out.is_empty(), "second add produced output: {out:?}");
    assert_eq!(core.channels[&folded].bans.len(), 1);
}

#[test]
fn redundant_op_grant_produces_no_output() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.channel_do_join(&alice.uid, "#test", "");
    drain(&mut alice);

    // Alice already holds chanop from creation.
    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &fold("#test"),
        &mode_parv(&["+o", "alice"]),
    );
    assert!(drain(&mut alice).is_empty());
}

#[test]
fn ban_list_cardinality_is_capped() {
    let mut core = core_from(
        r#"
        [channel]
        max_bans = 3
        "#,
    );
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.channel_do_join(&alice.uid, "#test", "");
    let folded = fold("#test");
    drain(&mut alice);

    for i in 0..5 {
        crate::channel::modes::channel_mode_set(
            &mut core,
            &alice.uid.clone(),
            &folded,
            &mode_parv(&["+b", &format!("*!*@host{i}.example")]),
        );
    }
    let chan = &core.channels[&folded];
    assert_eq!(chan.mask_count(), 3);
    let out = drain(&mut alice);
    assert!(out.iter().any(|l| l.contains(" 478 ")));
}

#[test]
fn ban_mutation_invalidates_member_caches() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");
    core.channel_do_join(&alice.uid, "#test", "");
    core.channel_do_join(&bob.uid, "#test", "");
    let folded = fold("#test");
    drain(&mut alice);
    drain(&mut bob);

    assert!(matches!(
        core.can_send(&folded, &bob.uid, "hello", false),
        CanSend::NonOp
    ));
    assert!(
        core.channels[&folded].members[&bob.uid]
            .flags
            .has(MemberFlags::BAN_CHECKED)
    );

    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+b", "*!*@h2"]),
    );
    // Cache cleared on every member after the list mutation.
    for member in core.channels[&folded].members.values() {
        assert!(!member.flags.has(MemberFlags::BAN_CHECKED));
    }
    // And the fresh check silences bob.
    assert!(matches!(
        core.can_send(&folded, &bob.uid, "hello", false),
        CanSend::Denied(_)
    ));
}

#[test]
fn serial_dedup_one_copy_per_peer() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut hub = add_server(&mut core, "hub.example.org", "002");
    add_remote_user(&mut core, "002", "r1", "002AAAAAA");
    add_remote_user(&mut core, "002", "r2", "002AAAAAB");

    core.channel_do_join(&alice.uid, "#test", "");
    core.add_user_to_channel(&fold("#test"), "002AAAAAA", MemberFlags::default(), false);
    core.add_user_to_channel(&fold("#test"), "002AAAAAB", MemberFlags::default(), false);
    drain(&mut alice);
    drain(&mut hub);

    core.sendto_channel_butone(
        Some(&alice.uid),
        &alice.uid.clone(),
        &fold("#test"),
        0,
        "PRIVMSG #test :hi",
    );
    let lines = drain(&mut hub);
    // Two remote members, one uplink: exactly one copy.
    assert_eq!(
        lines,
        vec![format!(":{} PRIVMSG #test :hi", alice.uid)]
    );
}

#[test]
fn quit_tears_down_memberships_and_frees_empty_channels() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");
    core.channel_do_join(&alice.uid, "#one,#two", "");
    core.channel_do_join(&bob.uid, "#one", "");
    drain(&mut alice);
    drain(&mut bob);

    core.exit_client(&alice.uid.clone(), "bye");

    // Bob saw the quit once even though they shared a channel.
    let out = drain(&mut bob);
    assert_eq!(out, vec![":alice!a@h QUIT :bye".to_string()]);

    // #two died with its last member; #one remains with bob.
    assert!(!core.channels.contains_key(&fold("#two")));
    assert!(core.channels.contains_key(&fold("#one")));
    assert!(!core.clients.contains_key(&alice.uid));
    assert!(!core.nicks.contains_key(&fold("alice")));
    assert_membership_invariants(&core);
}

#[test]
fn sendq_overflow_marks_dead_and_reaps() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.clients
        .get_mut(&alice.uid)
        .unwrap()
        .conn
        .as_mut()
        .unwrap()
        .sendq_limit = 16;

    core.send_message(&alice.uid.clone(), "a line well over the sendq cap");
    assert!(
        core.clients[&alice.uid]
            .flags
            .has(ClientFlags::DEAD)
    );
    assert!(
        core.clients[&alice.uid]
            .flags
            .has(ClientFlags::SENDQEX)
    );
    // Nothing was queued past the overflow.
    assert!(drain(&mut alice).is_empty());

    core.reap_dead();
    assert!(!core.clients.contains_key(&alice.uid));
}

#[test]
fn extended_join_and_away_fanout_respect_caps() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");
    if let Some(conn) = core.clients.get_mut(&bob.uid).unwrap().conn.as_mut() {
        conn.caps = Caps(Caps::EXTENDED_JOIN | Caps::AWAY_NOTIFY);
    }
    core.channel_do_join(&bob.uid, "#test", "");
    drain(&mut bob);

    core.clients.get_mut(&alice.uid).unwrap().account = "alice-acct".to_string();
    core.clients.get_mut(&alice.uid).unwrap().away = "gone fishing".to_string();
    core.channel_do_join(&alice.uid, "#test", "");

    let out = drain(&mut bob);
    assert_eq!(
        out,
        vec![
            ":alice!a@h JOIN #test alice-acct :alice gecos".to_string(),
            ":alice!a@h AWAY :gone fishing".to_string(),
        ]
    );

    // Alice herself received the plain join form.
    let own = drain(&mut alice);
    assert_eq!(own[0], ":alice!a@h JOIN :#test");
}

#[test]
fn moderated_channel_denies_non_voiced() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");
    core.channel_do_join(&alice.uid, "#test", "");
    core.channel_do_join(&bob.uid, "#test", "");
    drain(&mut alice);
    drain(&mut bob);

    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &fold("#test"),
        &mode_parv(&["+m"]),
    );

    assert!(matches!(
        core.can_send(&fold("#test"), &bob.uid, "hi", false),
        CanSend::Denied(_)
    ));
    // Ops bypass moderation.
    assert!(matches!(
        core.can_send(&fold("#test"), &alice.uid, "hi", false),
        CanSend::Opv
    ));
}

#[test]
fn mute_extban_silences_without_banning_join() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    core.channel_do_join(&alice.uid, "#test", "");
    let folded = fold("#test");
    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+b", "$m:*!*@muted.example"]),
    );
    drain(&mut alice);

    let mut mallory = add_local_user(&mut core, "mallory", "m", "muted.example");
    core.channel_do_join(&mallory.uid, "#test", "");
    let out = drain(&mut mallory);
    // Acting extbans do not gate the join itself.
    assert!(out.iter().any(|l| l.contains("JOIN")), "join denied: {out:?}");
    assert!(matches!(
        core.can_send(&folded, &mallory.uid, "hello", false),
        CanSend::Denied(_)
    ));
}

#[test]
fn hidden_ban_masks_target_only_privileged_members() {
    let mut core = test_core();
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");
    core.channel_do_join(&alice.uid, "#test", "");
    core.channel_do_join(&bob.uid, "#test", "");
    let folded = fold("#test");
    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+u"]),
    );
    drain(&mut alice);
    drain(&mut bob);

    crate::channel::modes::channel_mode_set(
        &mut core,
        &alice.uid.clone(),
        &folded,
        &mode_parv(&["+b", "*!*@hidden.example"]),
    );

    // The op sees the mask change, the peon does not.
    let alice_out = drain(&mut alice);
    assert!(alice_out.iter().any(|l| l.contains("+b *!*@hidden.example")));
    let bob_out = drain(&mut bob);
    assert!(!bob_out.iter().any(|l| l.contains("+b")));
}

#[test]
fn demote_members_strips_status_in_batches() {
    let mut core = test_core();
    let mut clients = Vec::new();
    for (nick, user) in [("n1", "a"), ("n2", "b"), ("n3", "c")] {
        clients.push(add_local_user(&mut core, nick, user, "h"));
    }
    let folded = fold("#test");
    for c in &clients {
        core.channel_do_join(&c.uid, "#test", "");
    }
    // Grant everyone op+voice so six flags need stripping.
    for c in &clients {
        let member = core
            .channels
            .get_mut(&folded)
            .unwrap()
            .members
            .get_mut(&c.uid)
            .unwrap();
        member.flags.set(MemberFlags::CHANOP);
        member.flags.set(MemberFlags::VOICE);
    }
    for c in clients.iter_mut() {
        drain(c);
    }

    core.channel_demote_members(&folded, &core.me.id.clone());

    let out = drain(&mut clients[0]);
    // Six removals chunked at four parameters per line.
    assert_eq!(out.len(), 2);
    for line in &out {
        assert!(line.starts_with(":irc.example.org MODE #test -"));
    }
    let stripped: usize = out
        .iter()
        .map(|l| l.split(' ').nth(3).map(|m| m.len() - 1).unwrap_or(0))
        .sum();
    assert_eq!(stripped, 6);
    for member in core.channels[&folded].members.values() {
        assert!(!member.flags.has(MemberFlags::STATUS_MASK));
    }
}

#[test]
fn part_reason_suppressed_inside_antispam_window() {
    let mut core = core_from(
        r#"
        [general]
        anti_spam_exit_message_time = 60
        "#,
    );
    let mut alice = add_local_user(&mut core, "alice", "a", "h");
    let mut bob = add_local_user(&mut core, "bob", "b", "h2");
    core.channel_do_join(&alice.uid, "#test", "");
    core.channel_do_join(&bob.uid, "#test", "");
    drain(&mut alice);
    drain(&mut bob);

    // Bob's connection is brand new; the reason is dropped.
    core.channel_do_part(&bob.uid, "#test", "goodbye cruel world");
    let out = drain(&mut alice);
    assert_eq!(out, vec![":bob!b@h2 PART #test".to_string()]);

    // Re-join past the window: the reason goes through.
    core.channel_do_join(&bob.uid, "#test", "");
    drain(&mut alice);
    core.time.mono += 120;
    core.channel_do_part(&bob.uid, "#test", "goodbye cruel world");
    let out = drain(&mut alice);
    assert_eq!(
        out,
        vec![":bob!b@h2 PART #test :goodbye cruel world".to_string()]
    );
}
