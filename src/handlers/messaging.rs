//! PRIVMSG, NOTICE, AWAY and WALLOPS.

use crate::channel::MemberFlags;
use crate::channel::engine::CanSend;
use crate::core::Core;
use crate::core::client::{Caps, UserModes};
use oxirc_proto::{Numeric, fold, is_chan_prefix};

pub fn m_privmsg(core: &mut Core, source: &str, parv: &[String]) {
    relay_message(core, source, parv, false);
}

pub fn m_notice(core: &mut Core, source: &str, parv: &[String]) {
    relay_message(core, source, parv, true);
}

/// Status-prefixed channel targets restrict delivery to members at or
/// above the prefix rank.
fn strip_status_prefix(target: &str) -> (u32, &str) {
    match target.chars().next() {
        Some('@') => (MemberFlags::CHANOP, &target[1..]),
        Some('%') => (MemberFlags::CHANOP | MemberFlags::HALFOP, &target[1..]),
        Some('+') => (
            MemberFlags::CHANOP | MemberFlags::HALFOP | MemberFlags::VOICE,
            &target[1..],
        ),
        _ => (0, target),
    }
}

fn relay_message(core: &mut Core, source: &str, parv: &[String], notice: bool) {
    let command = if notice { "NOTICE" } else { "PRIVMSG" };
    let text = parv[2].clone();

    for target in parv[1].split(',').filter(|t| !t.is_empty()) {
        let (status, name) = strip_status_prefix(target);
        if name.starts_with(|c: char| is_chan_prefix(c)) {
            let folded = fold(name);
            if !core.channels.contains_key(&folded) {
                if !notice {
                    core.sendto_one_numeric(
                        source,
                        Numeric::ErrNoSuchChannel,
                        &format!("{name} :No such channel"),
                    );
                }
                continue;
            }
            match core.can_send(&folded, source, &text, notice) {
                CanSend::Denied(numeric) => {
                    // Notices never generate error replies.
                    if !notice {
                        let tail = match numeric {
                            Numeric::ErrNeedReggedNick => format!(
                                "{name} :You need to identify to a registered nick to speak in that channel"
                            ),
                            _ => format!("{name} :Cannot send to channel"),
                        };
                        core.sendto_one_numeric(source, numeric, &tail);
                    }
                }
                CanSend::Opv | CanSend::NonOp => {
                    let chan_name = core
                        .channels
                        .get(&folded)
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| name.to_string());
                    let shown = if status == 0 {
                        chan_name
                    } else {
                        format!("{}{chan_name}", &target[..1])
                    };
                    core.sendto_channel_butone(
                        Some(source),
                        source,
                        &folded,
                        status,
                        &format!("{command} {shown} :{text}"),
                    );
                }
            }
            continue;
        }

        match core.find_person(name).map(|c| (c.uid.clone(), c.away.clone())) {
            Some((uid, away)) => {
                core.sendto_anywhere(&uid, source, command, &format!(":{text}"));
                if !notice && !away.is_empty() {
                    let target_name = core.name_of(&uid);
                    core.sendto_one_numeric(
                        source,
                        Numeric::RplAway,
                        &format!("{target_name} :{away}"),
                    );
                }
            }
            None => {
                if !notice {
                    core.sendto_one_numeric(
                        source,
                        Numeric::ErrNoSuchNick,
                        &format!("{name} :No such nick/channel"),
                    );
                }
            }
        }
    }
}

/// AWAY: set or clear, notify away-notify watchers, propagate.
pub fn m_away(core: &mut Core, source: &str, parv: &[String]) {
    let message = parv.get(1).cloned().unwrap_or_default();
    let Some(client) = core.clients.get_mut(source) else {
        return;
    };
    let is_local = client.is_local();
    let prefix = client.prefix();
    client.away = message.clone();

    if message.is_empty() {
        if is_local {
            core.sendto_one_numeric(
                source,
                Numeric::RplUnaway,
                ":You are no longer marked as being away",
            );
        }
        core.sendto_common_channels_local(source, false, Caps::AWAY_NOTIFY, 0, &format!(":{prefix} AWAY"));
        core.sendto_server(Some(source), 0, 0, &format!(":{source} AWAY"));
    } else {
        if is_local {
            core.sendto_one_numeric(
                source,
                Numeric::RplNowAway,
                ":You have been marked as being away",
            );
        }
        core.sendto_common_channels_local(
            source,
            false,
            Caps::AWAY_NOTIFY,
            0,
            &format!(":{prefix} AWAY :{message}"),
        );
        core.sendto_server(Some(source), 0, 0, &format!(":{source} AWAY :{message}"));
    }
}

pub fn mo_wallops(core: &mut Core, source: &str, parv: &[String]) {
    let text = parv[1].clone();
    core.sendto_wallops(source, UserModes::WALLOP, &text);
    core.sendto_server(Some(source), 0, 0, &format!(":{source} WALLOPS :{text}"));
}

pub fn ms_wallops(core: &mut Core, source: &str, parv: &[String]) {
    mo_wallops(core, source, parv);
}

#[cfg(test)]
mod tests {
    use crate::core::tests::{add_local_user, add_server, drain, test_core};
    use crate::dispatch::dispatch;

    #[test]
    fn channel_message_reaches_members_but_not_sender() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut bob = add_local_user(&mut core, "bob", "b", "h2");
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        dispatch(&mut core, &bob.uid.clone(), "JOIN #t");
        drain(&mut alice);
        drain(&mut bob);

        dispatch(&mut core, &alice.uid.clone(), "PRIVMSG #t :hello there");
        assert_eq!(
            drain(&mut bob),
            vec![":alice!a@h PRIVMSG #t :hello there".to_string()]
        );
        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn status_prefixed_message_filters_by_rank() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut bob = add_local_user(&mut core, "bob", "b", "h2");
        let mut carol = add_local_user(&mut core, "carol", "c", "h3");
        dispatch(&mut core, &carol.uid.clone(), "JOIN #t"); // carol is op
        dispatch(&mut core, &alice.uid.clone(), "JOIN #t");
        dispatch(&mut core, &bob.uid.clone(), "JOIN #t");
        drain(&mut alice);
        drain(&mut bob);
        drain(&mut carol);

        dispatch(&mut core, &alice.uid.clone(), "PRIVMSG @#t :ops only");
        assert_eq!(
            drain(&mut carol),
            vec![":alice!a@h PRIVMSG @#t :ops only".to_string()]
        );
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn private_message_routes_and_reports_away() {
        let mut core = test_core();
        let mut alice = add_local_user(&mut core, "alice", "a", "h");
        let mut bob = add_local_user(&mut core, "bob", "b", "h2");
        dispatch(&mut core, &bob.uid.clone(), "AWAY :gone out");
        drain(&mut bob);

        dispatch(&mut core, &alice.uid.clone(), "PRIVMSG bob :you there?");
        assert_eq!(
            drain(&mut bob),
            vec![":alice!a@h PRIVMSG bob :you there?".to_string()]
        );
        let replies = drain(&mut alice);
        assert_eq!(
            replies,
            vec![":irc.example.org 301 alice bob :gone out".to_string()]
        );
    }

    #[test]
    fn wallops_goes_to_wallop_opers_and_servers() {
        let mut core = test_core();
        let mut oper = add_local_user(&mut core, "op", "o", "h");
        {
            let client = core.clients.get_mut(&oper.uid).unwrap();
            client.umodes.set(crate::core::client::UserModes::OPER);
            client.umodes.set(crate::core::client::UserModes::WALLOP);
        }
        core.opers.insert(oper.uid.clone());
        let mut plain = add_local_user(&mut core, "plain", "p", "h2");
        let mut hub = add_server(&mut core, "hub.example.org", "002");

        dispatch(&mut core, &oper.uid.clone(), "WALLOPS :network maintenance");
        assert_eq!(
            drain(&mut oper),
            vec![":op!o@h WALLOPS :network maintenance".to_string()]
        );
        assert!(drain(&mut plain).is_empty());
        assert_eq!(
            drain(&mut hub),
            vec![format!(":{} WALLOPS :network maintenance", oper.uid)]
        );
    }
}
