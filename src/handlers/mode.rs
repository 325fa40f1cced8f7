//! MODE and TMODE.

use crate::channel::modes::channel_mode_set;
use crate::core::Core;
use crate::core::client::UserModes;
use oxirc_proto::{Numeric, fold, is_chan_prefix};

pub fn m_mode(core: &mut Core, source: &str, parv: &[String]) {
    let target = parv[1].clone();
    if target.starts_with(|c: char| is_chan_prefix(c)) {
        let folded = fold(&target);
        let Some(chan) = core.channels.get(&folded) else {
            core.sendto_one_numeric(
                source,
                Numeric::ErrNoSuchChannel,
                &format!("{target} :No such channel"),
            );
            return;
        };
        let chan_name = chan.name.clone();

        // Bare MODE query: current simple modes plus creation time.
        if parv.len() == 2 {
            let is_member = chan.members.contains_key(source);
            let is_server = core.clients.get(source).is_some_and(|c| c.is_server());
            let (letters, params) = chan.mode_string(is_member || is_server);
            let creation = chan.creation_time;
            let tail = if params.is_empty() {
                format!("{chan_name} {letters}")
            } else {
                format!("{chan_name} {letters} {params}")
            };
            core.sendto_one_numeric(source, Numeric::RplChannelModeIs, &tail);
            core.sendto_one_numeric(
                source,
                Numeric::RplCreationTime,
                &format!("{chan_name} {creation}"),
            );
            return;
        }

        channel_mode_set(core, source, &folded, &parv[2..]);
        return;
    }

    // User modes apply only to oneself.
    let self_named = core
        .clients
        .get(source)
        .is_some_and(|c| oxirc_proto::irc_eq(&c.name, &target));
    if !self_named {
        return;
    }
    let Some(mode_string) = parv.get(2) else {
        let letters = core
            .clients
            .get(source)
            .map(|c| c.umodes.letters())
            .unwrap_or_default();
        let name = core.name_of(source);
        let me = core.me.name.clone();
        core.sendto_one(source, &format!(":{me} 221 {name} +{letters}"));
        return;
    };

    const SETTABLE: &[(char, u32)] = &[
        ('i', UserModes::INVISIBLE),
        ('w', UserModes::WALLOP),
        ('D', UserModes::DEAF),
        ('s', UserModes::SERVNOTICE),
    ];
    let mut adding = true;
    let mut applied = String::new();
    for c in mode_string.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            'o' if !adding => {
                // Opers may always drop the umode; never grant it here.
                let was_oper = core
                    .clients
                    .get(source)
                    .is_some_and(|cl| cl.umodes.has(UserModes::OPER));
                if was_oper && let Some(client) = core.clients.get_mut(source) {
                    client.umodes.clear(UserModes::OPER);
                    core.opers.remove(source);
                    applied.push_str("-o");
                }
            }
            letter => {
                if let Some((_, bit)) = SETTABLE.iter().find(|(l, _)| *l == letter)
                    && let Some(client) = core.clients.get_mut(source)
                {
                    let changed = if adding {
                        let missing = !client.umodes.has(*bit);
                        client.umodes.set(*bit);
                        missing
                    } else {
                        let present = client.umodes.has(*bit);
                        client.umodes.clear(*bit);
                        present
                    };
                    if changed {
                        applied.push(if adding { '+' } else { '-' });
                        applied.push(letter);
                    }
                }
            }
        }
    }
    if !applied.is_empty() {
        let name = core.name_of(source);
        core.sendto_one(source, &format!(":{name} MODE {name} :{applied}"));
    }
}

/// Server-to-server mode change, gated on the channel timestamp: a
/// change stamped newer than the channel we know is stale and dropped.
pub fn ms_tmode(core: &mut Core, source: &str, parv: &[String]) {
    let Ok(ts) = parv[1].parse::<u64>() else {
        return;
    };
    let folded = fold(&parv[2]);
    let Some(chan) = core.channels.get(&folded) else {
        return;
    };
    if ts > chan.creation_time {
        return;
    }
    channel_mode_set(core, source, &folded, &parv[3..]);
}

#[cfg(test)]
mod tests {
    use crate::core::tests::{add_local_user, add_remote_user, add_server, drain, test_core};
    use crate::dispatch::dispatch;
    use oxirc_proto::fold;

    #[test]
    fn bare_mode_query_reports_modes_and_creation() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        dispatch(&mut core, &alice.uid.clone(), "MODE #t +k sekrit");
        drain(&mut alice);
        dispatch(&mut core, &alice.uid.clone(), "MODE #t");
        let out = drain(&mut alice);
        let ts = core.channels[&fold("#t")].creation_time;
        assert_eq!(
            out,
            vec![
                ":irc.example.org 324 alice #t +ntk sekrit".to_string(),
                format!(":irc.example.org 329 alice #t {ts}"),
            ]
        );
    }

    #[test]
    fn stale_tmode_is_dropped() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut hub = add_server(&mut core, "hub.example.org", "002");
        add_remote_user(&mut core, "002", "remoteop", "002AAAAAA");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        core.add_user_to_channel(
            &fold("#t"),
            "002AAAAAA",
            crate::channel::MemberFlags::default(),
            false,
        );
        drain(&mut alice);
        drain(&mut hub);
        let ts = core.channels[&fold("#t")].creation_time;

        // Stale (newer) timestamp: ignored.
        dispatch(
            &mut core,
            &"002".to_string(),
            &format!(":002AAAAAA TMODE {} #t +m", ts + 100),
        );
        assert!(
            !core.channels[&fold("#t")]
                .modes
                .has(crate::channel::SimpleModes::MODERATED)
        );

        // Matching timestamp applies, with remote access bypass.
        dispatch(
            &mut core,
            &"002".to_string(),
            &format!(":002AAAAAA TMODE {ts} #t +m"),
        );
        assert!(
            core.channels[&fold("#t")]
                .modes
                .has(crate::channel::SimpleModes::MODERATED)
        );
        // And the local member saw the change from the remote user.
        let out = drain(&mut alice);
        assert_eq!(out, vec![":remoteop!remoteop@remote.example MODE #t +m".to_string()]);
    }
}
