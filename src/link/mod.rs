//! Server links: autoconnect scheduling, the outbound connect state
//! machine, message hunting and the flattened links file.
//!
//! The original threads one logical connect across a chain of
//! callbacks; here it is a single async task walking explicit states:
//! TCP connect (with deadline), optional TLS handshake (with its own
//! deadline), then the PASS/CAPAB/SERVER handshake, after which the
//! shared read loop takes over. Failures at every stage report to the
//! admin tier with the real address and to plain opers masked.

pub mod burst;

pub use burst::send_burst;

use crate::config::ConnectBlock;
use crate::core::client::{Client, Connection, ServerCaps, Status, Uid, UserModes};
use crate::core::{Core, DnsStatus, PendingLink};
use crate::error::LinkError;
use crate::net::Shared;
use crate::send::NoticeLevel;
use oxirc_proto::{Numeric, irc_eq, match_mask};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Deadline for the TLS handshake on a link.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// A pending link older than this is abandoned.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 60;

/// Hostname length cap for server names.
const HOSTLEN: usize = 63;

/// A connect order handed to the link manager task.
#[derive(Debug)]
pub struct ConnectRequest {
    pub name: String,
    pub addr: IpAddr,
    pub block: ConnectBlock,
}

/// Server names need at least one dot and hostname characters only.
pub fn valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= HOSTLEN
        && name.contains('.')
        && name.chars().all(oxirc_proto::casemap::is_serv_char)
}

/// Where a hunted message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HuntStatus {
    IsMe,
    /// Forward toward this uid.
    Pass(Uid),
    NoSuch,
}

impl Core {
    /// Resolve a target server parameter: ourselves, a known client or
    /// server, or a wildcard scanned against the network.
    pub fn hunt_server(&mut self, source: &str, mask: &str) -> HuntStatus {
        if mask.is_empty() {
            return HuntStatus::IsMe;
        }
        if mask == self.me.id || irc_eq(mask, &self.me.name) {
            return HuntStatus::IsMe;
        }

        let source_route = self.route_of(source);
        let direct = self
            .find_person(mask)
            .or_else(|| self.find_server(mask))
            .map(|c| (c.uid.clone(), c.from.clone(), c.is_local()));

        // Refuse matches that would send the message back where it
        // came from.
        let mut target = match direct {
            Some((_, ref from, local)) if !local && source_route.as_deref() == Some(from) => None,
            Some((uid, _, _)) => Some(uid),
            None => None,
        };

        if target.is_none() && (mask.contains('*') || mask.contains('?')) {
            target = self
                .clients
                .values()
                .filter(|c| c.is_server() || c.is_client())
                .find(|c| {
                    match_mask(mask, &c.name)
                        && !(!c.is_local() && source_route.as_deref() == Some(c.from.as_str()))
                })
                .map(|c| c.uid.clone());
        }

        match target {
            Some(uid) => {
                let local_client = self
                    .clients
                    .get(&uid)
                    .is_some_and(|c| c.is_client() && c.is_local());
                if local_client {
                    HuntStatus::IsMe
                } else {
                    HuntStatus::Pass(uid)
                }
            }
            None => {
                self.sendto_one_numeric(
                    source,
                    Numeric::ErrNoSuchServer,
                    &format!("{mask} :No such server"),
                );
                HuntStatus::NoSuch
            }
        }
    }
}

/// Periodic autoconnect scan: pick at most one eligible connect block
/// per tick, push it to the tail for round-robin fairness, and hand it
/// to the link manager.
pub fn try_connections(core: &mut Core) {
    let now = core.time.mono;

    let mut chosen = None;
    for (idx, entry) in core.connects.iter_mut().enumerate() {
        if !entry.block.autoconnect || entry.block.port == 0 {
            continue;
        }
        // Hold times update even for entries we end up skipping.
        if entry.until > now {
            continue;
        }
        let con_freq = core.config.class(&entry.block.class).con_freq;
        entry.until = now + con_freq;

        chosen = Some(idx);
        break;
    }
    let Some(idx) = chosen else {
        return;
    };

    let name = core.connects[idx].block.name.clone();
    let host = core.connects[idx].block.host.clone();
    let class = core.connects[idx].block.class.clone();

    if core.find_server(&name).is_some() {
        return;
    }
    let class_limit = core.config.class(&class).max_total;
    let in_class = core
        .local_servers
        .iter()
        .filter_map(|uid| self_class(core, uid))
        .filter(|c| *c == class)
        .count();
    if in_class >= class_limit {
        return;
    }

    // Move to the tail so every block gets its turn.
    if let Some(entry) = core.connects.remove(idx) {
        core.connects.push_back(entry);
    }

    if core.link_in_progress(&name) {
        return;
    }

    if core.config.serverhide.hide_server_ips {
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            NoticeLevel::All,
            &format!("Connection to {name} activated."),
        );
    } else {
        core.sendto_realops_flags(
            UserModes::SERVNOTICE,
            NoticeLevel::All,
            &format!("Connection to {name}[{host}] activated."),
        );
    }

    server_connect(core, &name);
}

fn self_class(core: &Core, uid: &str) -> Option<String> {
    core.clients
        .get(uid)
        .and_then(|c| c.conn.as_ref())
        .map(|conn| conn.class.clone())
}

/// Begin an outbound link: gate on DNS state, record the attempt, and
/// queue the socket work for the link manager task.
pub fn server_connect(core: &mut Core, name: &str) {
    let Some(entry) = core
        .connects
        .iter()
        .find(|c| irc_eq(&c.block.name, name))
        .cloned()
    else {
        return;
    };

    let addr = match entry.dns {
        DnsStatus::Pending => {
            core.sendto_realops_flags(
                UserModes::SERVNOTICE,
                NoticeLevel::All,
                &format!("Error connecting to {name}: {}.", LinkError::DnsPending),
            );
            return;
        }
        DnsStatus::Failed => {
            core.sendto_realops_flags(
                UserModes::SERVNOTICE,
                NoticeLevel::All,
                &format!("Error connecting to {name}: {}.", LinkError::DnsFailed),
            );
            return;
        }
        DnsStatus::Resolved(addr) => addr,
    };

    tracing::info!(server = %name, host = %entry.block.host, %addr, "initiating link");
    core.pending_links.push(PendingLink {
        name: name.to_string(),
        started_monotonic: core.time.mono,
    });

    if let Some(tx) = core.link_requests.clone() {
        let _ = tx.send(ConnectRequest {
            name: name.to_string(),
            addr,
            block: entry.block,
        });
    }
}

/// Spawn the link manager: resolves connect-block hosts and executes
/// connect requests. Returns the request channel for the core.
pub fn spawn_link_manager(shared: Arc<Shared>) -> mpsc::UnboundedSender<ConnectRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectRequest>();

    // Resolver: refresh the DNS gate of every connect block.
    {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let blocks: Vec<(String, String, u16)> = {
                    let core = shared.lock();
                    core.connects
                        .iter()
                        .map(|c| (c.block.name.clone(), c.block.host.clone(), c.block.port))
                        .collect()
                };
                for (name, host, port) in blocks {
                    let status = match tokio::net::lookup_host((host.as_str(), port)).await {
                        Ok(mut addrs) => match addrs.next() {
                            Some(addr) => DnsStatus::Resolved(addr.ip()),
                            None => DnsStatus::Failed,
                        },
                        Err(_) => DnsStatus::Failed,
                    };
                    let mut core = shared.lock();
                    if let Some(entry) = core
                        .connects
                        .iter_mut()
                        .find(|c| irc_eq(&c.block.name, &name))
                    {
                        entry.dns = status;
                    }
                }
                tokio::time::sleep(Duration::from_secs(300)).await;
            }
        });
    }

    {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                tokio::spawn(connect_task(Arc::clone(&shared), request));
            }
        });
    }

    tx
}

fn connect_failed(shared: &Shared, name: &str, host: &str, addr: IpAddr, error: &str) {
    let mut core = shared.lock();
    core.pending_links.retain(|p| !irc_eq(&p.name, name));
    core.sendto_realops_flags(
        UserModes::SERVNOTICE,
        NoticeLevel::Admin,
        &format!("Error connecting to {name}[{addr}]: {error}"),
    );
    core.sendto_realops_flags(
        UserModes::SERVNOTICE,
        NoticeLevel::Oper,
        &format!("Error connecting to {name}[{host}]: {error}"),
    );
}

/// One outbound connect, end to end.
async fn connect_task(shared: Arc<Shared>, request: ConnectRequest) {
    let ConnectRequest { name, addr, block } = request;
    let timeout = Duration::from_secs(block.timeout);

    let stream =
        match tokio::time::timeout(timeout, TcpStream::connect((addr, block.port))).await {
            Err(_) => {
                connect_failed(
                    &shared,
                    &name,
                    &block.host,
                    addr,
                    &LinkError::ConnectTimeout.to_string(),
                );
                return;
            }
            Ok(Err(e)) => {
                connect_failed(&shared, &name, &block.host, addr, &LinkError::Io(e).to_string());
                return;
            }
            Ok(Ok(stream)) => stream,
        };

    if block.tls {
        let connector = tls_connector();
        let server_name = match tokio_rustls::rustls::pki_types::ServerName::try_from(
            block.host.clone(),
        ) {
            Ok(sn) => sn,
            Err(_) => {
                connect_failed(&shared, &name, &block.host, addr, "Bad TLS server name");
                return;
            }
        };
        let tls_stream =
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
                .await
            {
                Err(_) => {
                    connect_failed(
                        &shared,
                        &name,
                        &block.host,
                        addr,
                        &LinkError::TlsTimeout.to_string(),
                    );
                    return;
                }
                Ok(Err(e)) => {
                    connect_failed(
                        &shared,
                        &name,
                        &block.host,
                        addr,
                        &LinkError::Tls(e.to_string()).to_string(),
                    );
                    return;
                }
                Ok(Ok(tls_stream)) => tls_stream,
            };

        // Record the fingerprint whatever the verification outcome; a
        // mismatch against the pinned value is logged but the link
        // proceeds.
        let certfp = {
            let (_, session) = tls_stream.get_ref();
            session.peer_certificates().and_then(|certs| {
                certs.first().map(|cert| {
                    let digest = Sha256::digest(cert.as_ref());
                    digest
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<String>()
                })
            })
        };
        if let (Some(expected), Some(actual)) = (&block.tls_fingerprint, &certfp)
            && !expected.eq_ignore_ascii_case(actual)
        {
            tracing::warn!(server = %name, %expected, %actual, "server gave bad TLS certificate");
        }

        let uid = register_outbound(&shared, &name, addr, &block, certfp);
        if let Some((uid, rx)) = uid {
            crate::net::run_io(shared, uid, tls_stream, rx).await;
        }
    } else {
        let uid = register_outbound(&shared, &name, addr, &block, None);
        if let Some((uid, rx)) = uid {
            crate::net::run_io(shared, uid, stream, rx).await;
        }
    }
}

/// Create the half-registered link client and send our side of the
/// handshake. The peer's SERVER reply completes registration.
fn register_outbound(
    shared: &Shared,
    name: &str,
    addr: IpAddr,
    block: &ConnectBlock,
    certfp: Option<String>,
) -> Option<(Uid, mpsc::UnboundedReceiver<String>)> {
    let mut core = shared.lock();
    if core.find_server(name).is_some() {
        core.pending_links.retain(|p| !irc_eq(&p.name, name));
        return None;
    }

    let uid = core.next_uid();
    let (tx, rx) = mpsc::unbounded_channel();
    let class = core.config.class(&block.class);

    let mut client = Client::new(uid.clone(), Status::Handshake);
    client.name = name.to_string();
    client.host = block.host.clone();
    client.realhost = block.host.clone();
    client.sockhost = addr.to_string();
    client.ip = Some(addr);
    client.tsinfo = core.time.real;
    client.created_monotonic = core.time.mono;
    client.certfp = certfp;
    let mut conn = Connection::new(tx, class.sendq, class.name.clone());
    conn.is_tls = block.tls;
    conn.sent_handshake = true;
    client.conn = Some(conn);
    core.insert_local(client);

    let me = core.me.clone();
    let flags = if me.hidden { "h" } else { "" };
    core.sendto_one(&uid, &format!("PASS {}", block.send_password));
    core.sendto_one(&uid, &format!("CAPAB :{}", ServerCaps::advertisement()));
    core.sendto_one(
        &uid,
        &format!("SERVER {} 1 {} +{flags} :{}", me.name, me.id, me.info),
    );

    Some((uid, rx))
}

/// TLS connector for links: certificates are fingerprinted rather than
/// chain-verified, so every presented certificate is accepted here.
fn tls_connector() -> tokio_rustls::TlsConnector {
    use tokio_rustls::rustls::ClientConfig;
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Accepts every certificate; identity is checked via the pinned
/// fingerprint instead of the web PKI.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &tokio_rustls::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        use tokio_rustls::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Rewrite the flattened links file: one `servername uplink :1 info`
/// line per visible peer.
pub fn write_links_file(core: &mut Core) {
    let path = core.config.serverhide.flatten_links_file.clone();
    if path.is_empty() {
        return;
    }

    let hide_services = core.config.serverhide.hide_services;
    let me_name = core.me.name.clone();
    let mut lines: Vec<String> = core
        .clients
        .values()
        .filter(|c| c.is_server())
        .filter(|c| !c.flags.has(crate::core::client::ClientFlags::HIDDEN))
        .filter(|c| !(hide_services && c.is_service()))
        .map(|c| format!("{} {} :1 {}", c.name, me_name, c.info))
        .collect();
    lines.sort();
    core.flatten_links = lines.clone();

    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    if let Err(e) = std::fs::write(&path, text) {
        tracing::error!(%path, error = %e, "couldn't write links file");
    }
}

/// Seed the cached links lines from the previous run's file.
pub fn read_links_file(core: &mut Core) {
    let path = core.config.serverhide.flatten_links_file.clone();
    if path.is_empty() {
        return;
    }
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            core.flatten_links = text.lines().map(|l| l.to_string()).collect();
        }
        Err(e) => {
            tracing::info!(%path, error = %e, "couldn't read links file");
        }
    }
}
