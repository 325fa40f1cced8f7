//! Periodic maintenance: autoconnect, liveness probes, handshake
//! deadlines and the links-file rewrite.

use crate::core::client::{Status, Uid};
use crate::net::Shared;
use std::sync::Arc;
use std::time::Duration;

/// Grace period for connections that never complete registration.
const REGISTRATION_TIMEOUT_SECS: u64 = 60;

pub fn spawn_periodic(shared: Arc<Shared>) {
    {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let mut core = shared.lock();
                crate::link::try_connections(&mut core);
                sweep_liveness(&mut core);
                sweep_handshakes(&mut core);
                core.reap_dead();
            }
        });
    }

    let (path, delay) = {
        let core = shared.lock();
        (
            core.config.serverhide.flatten_links_file.clone(),
            core.config.serverhide.flatten_links_delay.unwrap_or(300),
        )
    };
    if !path.is_empty() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(delay.max(1)));
            loop {
                interval.tick().await;
                let mut core = shared.lock();
                crate::link::write_links_file(&mut core);
            }
        });
    }
}

/// PING quiet connections; exit the ones that stayed silent past twice
/// their class ping time.
fn sweep_liveness(core: &mut crate::core::Core) {
    let now = core.time.mono;
    let me_name = core.me.name.clone();

    let locals: Vec<Uid> = core
        .clients
        .values()
        .filter(|c| c.is_local() && matches!(c.status, Status::Client | Status::Server))
        .map(|c| c.uid.clone())
        .collect();

    for uid in locals {
        let (ping_time, last_data, last_ping) = {
            let Some(client) = core.clients.get(&uid) else {
                continue;
            };
            let Some(conn) = client.conn.as_ref() else {
                continue;
            };
            let class = core.config.class(&conn.class);
            (class.ping_time, conn.last_data, conn.last_ping)
        };

        let silent = now.saturating_sub(last_data);
        if silent >= ping_time * 2 {
            core.exit_client(&uid, &format!("Ping timeout: {silent} seconds"));
        } else if silent >= ping_time && last_ping <= last_data {
            core.sendto_one(&uid, &format!("PING :{me_name}"));
            if let Some(conn) = core.clients.get_mut(&uid).and_then(|c| c.conn.as_mut()) {
                conn.last_ping = now;
            }
        }
    }
}

/// Abandon stuck handshakes: unregistered sockets and outbound link
/// attempts that outlived their deadline.
fn sweep_handshakes(core: &mut crate::core::Core) {
    let now = core.time.mono;

    let stuck: Vec<Uid> = core
        .clients
        .values()
        .filter(|c| {
            c.is_local()
                && matches!(c.status, Status::Unknown | Status::Connecting | Status::Handshake)
                && now.saturating_sub(c.created_monotonic) > REGISTRATION_TIMEOUT_SECS
        })
        .map(|c| c.uid.clone())
        .collect();
    for uid in stuck {
        core.exit_client(&uid, "Registration timeout");
    }

    core.pending_links
        .retain(|p| now.saturating_sub(p.started_monotonic) <= crate::link::HANDSHAKE_TIMEOUT_SECS);
}
