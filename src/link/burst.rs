//! State burst for a freshly registered link: servers, users, then
//! per-channel SJOIN membership batches and BMASK list batches.

use crate::core::Core;
use oxirc_proto::PAYLOAD_MAX;

/// Send everything we know to `peer`, closing with a PING whose PONG
/// marks the peer's burst as consumed.
pub fn send_burst(core: &mut Core, peer: &str) {
    let me_id = core.me.id.clone();

    // Servers behind us, depth-first is not required; any order works
    // because SID carries the introducer in the prefix.
    let servers: Vec<String> = core
        .clients
        .values()
        .filter(|c| c.is_server() && c.uid != peer && c.from != peer)
        .map(|c| format!(":{me_id} SID {} 2 {} :{}", c.name, c.uid, c.info))
        .collect();
    for line in servers {
        core.sendto_one(peer, &line);
    }

    // Users not reached through the new peer.
    let users: Vec<String> = core
        .clients
        .values()
        .filter(|c| c.is_client() && c.from != peer)
        .map(|c| {
            format!(
                ":{me_id} UID {} 1 {} +{} {} {} {} {} {} :{}",
                c.name,
                c.tsinfo,
                c.umodes.letters(),
                c.username,
                c.host,
                c.sockhost,
                c.uid,
                c.account,
                c.info
            )
        })
        .collect();
    for line in users {
        core.sendto_one(peer, &line);
    }

    let channels: Vec<String> = core.channels.keys().cloned().collect();
    for folded in channels {
        let lines = channel_burst_lines(core, &folded);
        for line in lines {
            core.sendto_one(peer, &line);
        }
    }

    core.sendto_one(peer, &format!("PING :{me_id}"));
}

/// SJOIN batches split at the line cap, followed by BMASK batches for
/// each non-empty mask list.
fn channel_burst_lines(core: &Core, folded: &str) -> Vec<String> {
    let Some(chan) = core.channels.get(folded) else {
        return Vec::new();
    };
    let me_id = &core.me.id;
    let mut lines = Vec::new();

    let (letters, params) = chan.mode_string(true);
    let mut base = format!(":{me_id} SJOIN {} {} {letters}", chan.creation_time, chan.name);
    if !params.is_empty() {
        base.push(' ');
        base.push_str(&params);
    }
    base.push_str(" :");

    let mut members = String::new();
    let mut uids: Vec<&String> = chan.members.keys().collect();
    uids.sort();
    for uid in uids {
        let Some(member) = chan.members.get(uid) else {
            continue;
        };
        let token = format!("{}{uid}", member.flags.prefix(true));
        if !members.is_empty() && base.len() + members.len() + token.len() + 1 > PAYLOAD_MAX {
            lines.push(format!("{base}{members}"));
            members.clear();
        }
        if !members.is_empty() {
            members.push(' ');
        }
        members.push_str(&token);
    }
    if !members.is_empty() {
        lines.push(format!("{base}{members}"));
    }

    for list in [
        crate::channel::ListType::Ban,
        crate::channel::ListType::Except,
        crate::channel::ListType::Invex,
    ] {
        let entries = chan.list(list);
        if entries.is_empty() {
            continue;
        }
        let base = format!(
            ":{me_id} BMASK {} {} {} :",
            chan.creation_time,
            chan.name,
            list.letter()
        );
        let mut masks = String::new();
        for ban in entries {
            if !masks.is_empty() && base.len() + masks.len() + ban.banstr.len() + 1 > PAYLOAD_MAX {
                lines.push(format!("{base}{masks}"));
                masks.clear();
            }
            if !masks.is_empty() {
                masks.push(' ');
            }
            masks.push_str(&ban.banstr);
        }
        if !masks.is_empty() {
            lines.push(format!("{base}{masks}"));
        }
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemberFlags;
    use crate::core::tests::{add_local_user, add_server, drain, test_core};
    use oxirc_proto::fold;

    #[test]
    fn burst_covers_users_channels_and_lists() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut bob = add_local_user(&mut core, "bob", "b", "h2");
        core.channel_do_join(&alice.uid, "#test", "");
        core.channel_do_join(&bob.uid, "#test", "");
        crate::channel::modes::channel_mode_set(
            &mut core,
            &alice.uid.clone(),
            &fold("#test"),
            &["+b".to_string(), "*!*@evil.example".to_string()],
        );
        drain(&mut alice);
        drain(&mut bob);

        let mut hub = add_server(&mut core, "hub.example.org", "002");
        crate::link::send_burst(&mut core, &"002".to_string());
        let lines = drain(&mut hub);

        let uid_lines: Vec<&String> = lines.iter().filter(|l| l.contains(" UID ")).collect();
        assert_eq!(uid_lines.len(), 2);
        assert!(uid_lines.iter().any(|l| l.contains(" alice ")));

        let ts = core.channels[&fold("#test")].creation_time;
        let sjoin: Vec<&String> = lines.iter().filter(|l| l.contains(" SJOIN ")).collect();
        assert_eq!(sjoin.len(), 1);
        assert!(sjoin[0].starts_with(&format!(":001 SJOIN {ts} #test +nt :")));
        assert!(sjoin[0].contains(&format!("@{}", alice.uid)));
        assert!(sjoin[0].contains(&bob.uid));

        let bmask: Vec<&String> = lines.iter().filter(|l| l.contains(" BMASK ")).collect();
        assert_eq!(
            bmask,
            vec![&format!(":001 BMASK {ts} #test b :*!*@evil.example")]
        );

        assert_eq!(lines.last().unwrap(), "PING :001");
    }

    #[test]
    fn long_member_lists_split_into_batches() {
        let mut core = test_core();
        let mut first = add_local_user(&mut core, "n0", "u", "h");
        core.channel_do_join(&first.uid, "#big", "");
        for i in 1..80 {
            let user = add_local_user(&mut core, &format!("n{i}"), "u", "h");
            core.channel_do_join(&user.uid, "#big", "");
            // Receivers dropped; their queues just fill.
        }
        drain(&mut first);

        let mut hub = add_server(&mut core, "hub.example.org", "002");
        crate::link::send_burst(&mut core, &"002".to_string());
        let lines = drain(&mut hub);
        let sjoin: Vec<&String> = lines.iter().filter(|l| l.contains(" SJOIN ")).collect();
        assert!(sjoin.len() > 1, "80 members should not fit one line");
        for line in sjoin {
            assert!(line.len() <= PAYLOAD_MAX);
        }
    }
}
