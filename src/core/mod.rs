//! The process core: every registry and all mutable server state,
//! bundled into one `Core` owned by the runtime and guarded by a
//! mutex. Connection tasks lock it for the duration of one dispatched
//! line, timers for one tick; nothing else touches state, so handlers
//! never observe each other mid-flight.

pub mod client;

#[cfg(test)]
pub mod tests;

use crate::channel::Channel;
use crate::channel::extban::ExtbanRegistry;
use crate::config::{Config, ConnectBlock};
use crate::core::client::{Client, ClientFlags, Status, Uid};
use oxirc_proto::fold;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// This server's identity on the wire.
#[derive(Debug, Clone)]
pub struct MyInfo {
    pub name: String,
    pub id: String,
    pub info: String,
    pub hidden: bool,
}

/// Cached event-loop time, refreshed before each dispatch or tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreTime {
    /// Wall-clock seconds since the epoch.
    pub real: u64,
    /// Monotonic seconds since process start.
    pub mono: u64,
}

/// DNS state of a connect block. The resolver itself lives outside the
/// core; it flips this gate when a lookup settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsStatus {
    Pending,
    Failed,
    Resolved(IpAddr),
}

/// Runtime state attached to one configured connect block.
#[derive(Debug, Clone)]
pub struct ConnectRuntime {
    pub block: ConnectBlock,
    /// Monotonic second before which autoconnect leaves this entry alone.
    pub until: u64,
    pub dns: DnsStatus,
}

/// An outbound link whose TCP/TLS handshake is still in flight.
#[derive(Debug, Clone)]
pub struct PendingLink {
    pub name: String,
    pub started_monotonic: u64,
}

pub struct Core {
    pub config: Arc<Config>,
    pub me: MyInfo,
    pub time: CoreTime,

    /// Every known client and server, by uid.
    pub clients: HashMap<Uid, Client>,
    /// Folded nick -> uid.
    pub nicks: HashMap<String, Uid>,
    /// Folded server name -> uid.
    pub server_names: HashMap<String, Uid>,
    /// Folded channel name -> channel.
    pub channels: HashMap<String, Channel>,
    /// Locally connected, registered users.
    pub local_clients: HashSet<Uid>,
    /// Directly linked peer servers.
    pub local_servers: HashSet<Uid>,
    /// Local users with the oper umode.
    pub opers: HashSet<Uid>,

    /// Fan-out dedup counter; bumped before every multi-target send.
    pub serial: u64,
    pub extbans: ExtbanRegistry,

    /// Process-wide counters. Bytes are updated by writer tasks.
    pub messages_sent: u64,
    pub bytes_sent: Arc<AtomicU64>,

    /// Autoconnect round-robin queue.
    pub connects: VecDeque<ConnectRuntime>,
    /// Outbound links between socket open and SERVER registration.
    pub pending_links: Vec<PendingLink>,
    /// Cached flattened links lines, rewritten periodically.
    pub flatten_links: Vec<String>,

    /// Gate for rate-limited oper warnings.
    pub rate_warn_ts: u64,

    /// Channel to the link manager task that performs outbound
    /// connects; absent in tests.
    pub link_requests: Option<tokio::sync::mpsc::UnboundedSender<crate::link::ConnectRequest>>,

    uid_suffix: [u8; 6],
    /// Uids marked dead during this tick, awaiting reap.
    pub dead: Vec<Uid>,
}

impl Core {
    pub fn new(config: Arc<Config>) -> Self {
        let me = MyInfo {
            name: config.server.name.clone(),
            id: config.server.sid.clone(),
            info: config.server.description.clone(),
            hidden: config.serverhide.hidden,
        };
        let connects = config
            .connect
            .iter()
            .map(|block| ConnectRuntime {
                block: block.clone(),
                until: 0,
                dns: DnsStatus::Pending,
            })
            .collect();
        Self {
            config,
            me,
            time: CoreTime::default(),
            clients: HashMap::new(),
            nicks: HashMap::new(),
            server_names: HashMap::new(),
            channels: HashMap::new(),
            local_clients: HashSet::new(),
            local_servers: HashSet::new(),
            opers: HashSet::new(),
            serial: 0,
            extbans: ExtbanRegistry::default(),
            messages_sent: 0,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            connects,
            pending_links: Vec::new(),
            flatten_links: Vec::new(),
            rate_warn_ts: 0,
            link_requests: None,
            uid_suffix: *b"AAAAAA",
            dead: Vec::new(),
        }
    }

    /// Generate the next TS6 uid: the server id followed by a six
    /// character counter over `A-Z0-9`.
    pub fn next_uid(&mut self) -> Uid {
        let uid = format!(
            "{}{}",
            self.me.id,
            std::str::from_utf8(&self.uid_suffix).unwrap_or("AAAAAA")
        );
        for slot in self.uid_suffix.iter_mut().rev() {
            *slot = match *slot {
                b'Z' => b'0',
                b'9' => {
                    *slot = b'A';
                    continue;
                }
                other => other + 1,
            };
            break;
        }
        uid
    }

    /// Look up by uid first (server-originated references), then by name.
    pub fn find_person(&self, name_or_id: &str) -> Option<&Client> {
        self.clients
            .get(name_or_id)
            .or_else(|| self.nicks.get(&fold(name_or_id)).and_then(|u| self.clients.get(u)))
            .filter(|c| c.is_client())
    }

    pub fn find_server(&self, name_or_id: &str) -> Option<&Client> {
        self.clients
            .get(name_or_id)
            .or_else(|| {
                self.server_names
                    .get(&fold(name_or_id))
                    .and_then(|u| self.clients.get(u))
            })
            .filter(|c| c.is_server() || c.uid == self.me.id)
    }

    /// Resolve a message prefix to the client it names.
    pub fn resolve_prefix(&self, prefix: &str) -> Option<Uid> {
        let bare = prefix.split('!').next().unwrap_or(prefix);
        if let Some(client) = self.clients.get(bare) {
            return Some(client.uid.clone());
        }
        let folded = fold(bare);
        self.nicks
            .get(&folded)
            .or_else(|| self.server_names.get(&folded))
            .cloned()
    }

    /// Mark a connection dead. Dead clients are skipped by every
    /// fan-out and reaped at the end of the tick.
    pub fn mark_dead(&mut self, uid: &str) {
        if let Some(client) = self.clients.get_mut(uid) {
            if !client.flags.has(ClientFlags::DEAD) {
                client.flags.set(ClientFlags::DEAD);
                self.dead.push(uid.to_string());
            }
        }
    }

    /// The uplink through which `uid` is reached.
    pub fn route_of(&self, uid: &str) -> Option<Uid> {
        self.clients.get(uid).map(|c| c.from.clone())
    }

    /// `nick!user@host` for users, bare name for servers.
    pub fn prefix_of(&self, uid: &str) -> String {
        match self.clients.get(uid) {
            Some(c) if c.is_client() => c.prefix(),
            Some(c) => c.name.clone(),
            None if uid == self.me.id => self.me.name.clone(),
            None => uid.to_string(),
        }
    }

    /// Id form of a prefix for server-bound traffic.
    pub fn id_of(&self, uid: &str) -> String {
        uid.to_string()
    }

    /// Name (not nick!user@host) of a client, for numerics targets.
    pub fn name_of(&self, uid: &str) -> String {
        match self.clients.get(uid) {
            Some(c) if !c.name.is_empty() => c.name.clone(),
            _ if uid == self.me.id => self.me.name.clone(),
            _ => "*".to_string(),
        }
    }

    /// Insert a freshly accepted local connection.
    pub fn insert_local(&mut self, client: Client) {
        let uid = client.uid.clone();
        self.clients.insert(uid, client);
    }

    /// Channels a local client may occupy, honoring its class override.
    pub fn max_channels_for(&self, client: &Client) -> usize {
        let class_max = client
            .conn
            .as_ref()
            .map(|conn| self.config.class(&conn.class).max_channels)
            .unwrap_or(0);
        if class_max > 0 {
            class_max
        } else {
            self.config.channel.max_channels
        }
    }

    /// Is a link handshake already in progress for this server name?
    pub fn link_in_progress(&self, name: &str) -> bool {
        self.pending_links
            .iter()
            .any(|p| oxirc_proto::irc_eq(&p.name, name))
            || self.clients.values().any(|c| {
                matches!(c.status, Status::Connecting | Status::Handshake)
                    && oxirc_proto::irc_eq(&c.name, name)
            })
    }

    /// Re-key a client whose definitive id arrives late: a peer's SID
    /// replaces the placeholder uid assigned at accept time.
    pub fn rekey_client(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        if let Some(mut client) = self.clients.remove(old) {
            client.uid = new.to_string();
            if client.from == old {
                client.from = new.to_string();
            }
            self.clients.insert(new.to_string(), client);
        }
        if self.local_clients.remove(old) {
            self.local_clients.insert(new.to_string());
        }
        if self.local_servers.remove(old) {
            self.local_servers.insert(new.to_string());
        }
        for uid in self.dead.iter_mut() {
            if uid == old {
                *uid = new.to_string();
            }
        }
    }

    /// Reap clients marked dead during this tick.
    ///
    /// Dropping the connection closes its mpsc queue, which ends the
    /// writer task and the socket.
    pub fn reap_dead(&mut self) {
        while let Some(uid) = self.dead.pop() {
            self.exit_client(&uid, "Write error: connection closed");
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(
            toml::from_str(
                r#"
                [server]
                name = "irc.example.org"
                sid = "001"
                description = "test"
            "#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn uid_generation_increments_and_rolls() {
        let mut core = Core::new(test_config());
        assert_eq!(core.next_uid(), "001AAAAAA");
        assert_eq!(core.next_uid(), "001AAAAAB");
        core.uid_suffix = *b"AAAAAZ";
        assert_eq!(core.next_uid(), "001AAAAAZ");
        assert_eq!(core.next_uid(), "001AAAAA0");
        core.uid_suffix = *b"AAAAA9";
        assert_eq!(core.next_uid(), "001AAAAA9");
        assert_eq!(core.next_uid(), "001AAAABA");
    }
}
