//! Channel verbs: JOIN, PART, TOPIC, NAMES, INVITE.

use crate::channel::{MemberFlags, SimpleModes, check_name};
use crate::core::Core;
use oxirc_proto::{Numeric, fold};

pub fn m_join(core: &mut Core, source: &str, parv: &[String]) {
    let Some(client) = core.clients.get(source) else {
        return;
    };
    if !client.is_local() {
        return;
    }
    if parv[1] == "0" {
        // JOIN 0 leaves every channel.
        let channels: Vec<String> = client.channels.iter().cloned().collect();
        for folded in channels {
            let name = core
                .channels
                .get(&folded)
                .map(|c| c.name.clone())
                .unwrap_or(folded);
            core.channel_do_part(source, &name, "");
        }
        return;
    }
    let keys = parv.get(2).cloned().unwrap_or_default();
    core.channel_do_join(source, &parv[1].clone(), &keys);
}

/// Remote user joining an existing channel: `:uid JOIN <ts> <name> +`.
pub fn ms_join(core: &mut Core, source: &str, parv: &[String]) {
    let Ok(ts) = parv[1].parse::<u64>() else {
        return;
    };
    let name = parv[2].clone();
    if !check_name(&name, false, false) {
        return;
    }
    let folded = fold(&name);

    if !core.channels.contains_key(&folded) {
        let channel = crate::channel::Channel::new(&name, ts, core.time.mono);
        core.channels.insert(folded.clone(), channel);
    } else {
        let ours = core.channels[&folded].creation_time;
        if ts < ours {
            // The older timestamp wins; our statuses and simple modes go.
            let me_id = core.me.id.clone();
            core.channel_demote_members(&folded, &me_id);
            if let Some(chan) = core.channels.get_mut(&folded) {
                chan.modes = SimpleModes::default();
                chan.key = None;
                chan.limit = None;
                chan.creation_time = ts;
            }
        }
    }

    if core.channels[&folded].members.contains_key(source) {
        return;
    }
    core.add_user_to_channel(&folded, source, MemberFlags::default(), true);

    let Some((prefix, account, info)) = core
        .clients
        .get(source)
        .map(|c| (c.prefix(), c.account.clone(), c.info.clone()))
    else {
        return;
    };
    core.sendto_channel_local(
        None,
        &folded,
        0,
        crate::core::client::Caps::EXTENDED_JOIN,
        0,
        &format!(":{prefix} JOIN {name} {account} :{info}"),
    );
    core.sendto_channel_local(
        None,
        &folded,
        0,
        0,
        crate::core::client::Caps::EXTENDED_JOIN,
        &format!(":{prefix} JOIN :{name}"),
    );

    let ts = core.channels[&folded].creation_time;
    core.sendto_server(Some(source), 0, 0, &format!(":{source} JOIN {ts} {name} +"));
}

pub fn m_part(core: &mut Core, source: &str, parv: &[String]) {
    let reason = parv.get(2).cloned().unwrap_or_default();
    core.channel_do_part(source, &parv[1].clone(), &reason);
}

pub fn m_topic(core: &mut Core, source: &str, parv: &[String]) {
    let name = parv[1].clone();
    let folded = fold(&name);
    let Some(chan) = core.channels.get(&folded) else {
        core.sendto_one_numeric(
            source,
            Numeric::ErrNoSuchChannel,
            &format!("{name} :No such channel"),
        );
        return;
    };
    let chan_name = chan.name.clone();

    // Query form.
    if parv.len() == 2 {
        match chan.topic.clone() {
            Some(topic) => {
                core.sendto_one_numeric(
                    source,
                    Numeric::RplTopic,
                    &format!("{chan_name} :{}", topic.text),
                );
                core.sendto_one_numeric(
                    source,
                    Numeric::RplTopicWhoTime,
                    &format!("{chan_name} {} {}", topic.set_by, topic.set_at),
                );
            }
            None => {
                core.sendto_one_numeric(
                    source,
                    Numeric::RplNoTopic,
                    &format!("{chan_name} :No topic is set."),
                );
            }
        }
        return;
    }

    let is_local = core.clients.get(source).is_some_and(|c| c.is_local());
    if is_local {
        let Some(flags) = core.membership(&folded, source) else {
            core.sendto_one_numeric(
                source,
                Numeric::ErrNotOnChannel,
                &format!("{chan_name} :You're not on that channel"),
            );
            return;
        };
        let locked = core.channels[&folded].modes.has(SimpleModes::TOPICLIMIT);
        if locked && !flags.has(MemberFlags::CHANOP | MemberFlags::HALFOP) {
            core.sendto_one_numeric(
                source,
                Numeric::ErrChanOpPrivsNeeded,
                &format!("{chan_name} :You're not channel operator"),
            );
            return;
        }
    }

    let text = parv[2].clone();
    let prefix = core.prefix_of(source);
    core.set_topic(&folded, &text, &prefix, core.time.real, is_local);
    let stored = core
        .channels
        .get(&folded)
        .and_then(|c| c.topic.as_ref())
        .map(|t| t.text.clone())
        .unwrap_or_default();

    core.sendto_channel_local(
        None,
        &folded,
        0,
        0,
        0,
        &format!(":{prefix} TOPIC {chan_name} :{stored}"),
    );
    core.sendto_server(
        Some(source),
        0,
        0,
        &format!(":{source} TOPIC {chan_name} :{stored}"),
    );
}

pub fn m_names(core: &mut Core, source: &str, parv: &[String]) {
    match parv.get(1) {
        Some(list) => {
            for name in list.split(',').filter(|n| !n.is_empty()) {
                let folded = fold(name);
                if core.channels.contains_key(&folded) {
                    core.send_namereply(source, &folded);
                } else {
                    core.sendto_one_numeric(
                        source,
                        Numeric::RplEndOfNames,
                        &format!("{name} :End of /NAMES list."),
                    );
                }
            }
        }
        None => {
            core.sendto_one_numeric(
                source,
                Numeric::RplEndOfNames,
                "* :End of /NAMES list.",
            );
        }
    }
}

pub fn m_invite(core: &mut Core, source: &str, parv: &[String]) {
    let nick = parv[1].clone();
    let name = parv[2].clone();
    let folded = fold(&name);

    let Some(target) = core.find_person(&nick).map(|c| c.uid.clone()) else {
        core.sendto_one_numeric(
            source,
            Numeric::ErrNoSuchNick,
            &format!("{nick} :No such nick/channel"),
        );
        return;
    };
    let Some(chan) = core.channels.get(&folded) else {
        core.sendto_one_numeric(
            source,
            Numeric::ErrNoSuchChannel,
            &format!("{name} :No such channel"),
        );
        return;
    };
    let chan_name = chan.name.clone();
    let invite_only = chan.modes.has(SimpleModes::INVITEONLY);
    let target_member = chan.members.contains_key(&target);

    let is_local = core.clients.get(source).is_some_and(|c| c.is_local());
    if is_local {
        let Some(flags) = core.membership(&folded, source) else {
            core.sendto_one_numeric(
                source,
                Numeric::ErrNotOnChannel,
                &format!("{chan_name} :You're not on that channel"),
            );
            return;
        };
        if invite_only && !flags.has(MemberFlags::CHANOP | MemberFlags::HALFOP) {
            core.sendto_one_numeric(
                source,
                Numeric::ErrChanOpPrivsNeeded,
                &format!("{chan_name} :You're not channel operator"),
            );
            return;
        }
    }
    if target_member {
        let target_name = core.name_of(&target);
        core.sendto_one_numeric(
            source,
            Numeric::ErrUserOnChannel,
            &format!("{target_name} {chan_name} :is already on channel"),
        );
        return;
    }

    if let Some(chan) = core.channels.get_mut(&folded) {
        chan.invites.insert(target.clone());
    }
    if is_local {
        let target_name = core.name_of(&target);
        core.sendto_one_numeric(
            source,
            Numeric::RplInviting,
            &format!("{target_name} {chan_name}"),
        );
    }
    core.sendto_anywhere(&target, source, "INVITE", &format!(":{chan_name}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{add_local_user, drain, test_core};
    use crate::dispatch::dispatch;

    #[test]
    fn join_zero_leaves_everything() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #a,#b,#c");
        drain(&mut alice);
        dispatch(&mut core, &alice.uid.clone(), "JOIN 0");
        assert!(core.channels.is_empty());
        assert!(core.clients[&alice.uid].channels.is_empty());
    }

    #[test]
    fn topic_lock_requires_halfop() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut bob = add_local_user(&mut core, "bob", "b", "h2");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        dispatch(&mut core, &bob.uid.clone(), "JOIN #t");
        drain(&mut alice);
        drain(&mut bob);

        // +t is set at creation; the peon is refused.
        dispatch(&mut core, &bob.uid.clone(), "TOPIC #t :my topic");
        let out = drain(&mut bob);
        assert!(out[0].contains(" 482 "));
        assert!(core.channels[&fold("#t")].topic.is_none());

        dispatch(&mut core, &alice.uid.clone(), "TOPIC #t :their topic");
        let seen = drain(&mut bob);
        assert_eq!(seen, vec![":alice!a@h TOPIC #t :their topic".to_string()]);

        // Query returns 332 and 333.
        dispatch(&mut core, &bob.uid.clone(), "TOPIC #t");
        let out = drain(&mut bob);
        assert!(out[0].contains(" 332 bob #t :their topic"));
        assert!(out[1].contains(" 333 bob #t alice!a@h "));
    }

    #[test]
    fn invite_allows_join_through_invite_only() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut bob = add_local_user(&mut core, "bob", "b", "h2");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        dispatch(&mut core, &alice.uid.clone(), "MODE #t +i");
        drain(&mut alice);

        dispatch(&mut core, &bob.uid.clone(), "JOIN #t");
        let out = drain(&mut bob);
        assert!(out[0].contains(" 473 bob #t :Cannot join channel (+i)"));

        dispatch(&mut core, &alice.uid.clone(), "INVITE bob #t");
        let invited = drain(&mut bob);
        assert_eq!(invited, vec![":alice!a@h INVITE bob :#t".to_string()]);
        let out = drain(&mut alice);
        assert!(out[0].contains(" 341 alice bob #t"));

        dispatch(&mut core, &bob.uid.clone(), "JOIN #t");
        assert!(core.channels[&fold("#t")].members.contains_key(&bob.uid));
        // The pending invite is consumed by the join.
        assert!(core.channels[&fold("#t")].invites.is_empty());
    }
}
