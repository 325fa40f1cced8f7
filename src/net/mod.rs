//! Listeners and connection tasks.
//!
//! Each accepted socket gets a reader and a writer task. The writer
//! drains the connection's unbounded queue into the framed socket and
//! settles the byte accounting the enqueue side charged; the reader
//! locks the core once per line, refreshes the cached clock, and runs
//! the dispatcher. All state mutation happens under that lock, so
//! handlers never observe each other mid-flight.

use crate::core::client::{Client, Connection, Status, Uid};
use crate::core::{Core, CoreTime};
use crate::dispatch::dispatch;
use futures_util::{SinkExt, StreamExt};
use oxirc_proto::LineCodec;
use parking_lot::{Mutex, MutexGuard};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info};

/// The shared runtime state: the core under its lock, plus the
/// monotonic epoch everything is measured against.
pub struct Shared {
    core: Mutex<Core>,
    start: Instant,
}

impl Shared {
    pub fn new(core: Core) -> Self {
        Self {
            core: Mutex::new(core),
            start: Instant::now(),
        }
    }

    /// Lock the core and refresh its cached clock.
    pub fn lock(&self) -> MutexGuard<'_, Core> {
        let mut core = self.core.lock();
        core.time = CoreTime {
            real: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            mono: self.start.elapsed().as_secs(),
        };
        core
    }
}

/// Bind every configured listener and start accepting.
pub async fn spawn_listeners(shared: Arc<Shared>) -> anyhow::Result<()> {
    let listen_blocks = {
        let core = shared.lock();
        core.config.listen.clone()
    };
    for block in listen_blocks {
        let listener = TcpListener::bind(block.address).await?;
        info!(address = %block.address, tls = block.tls.is_some(), "listening");

        let acceptor = match &block.tls {
            Some(tls) => Some(build_acceptor(&tls.cert_path, &tls.key_path)?),
            None => None,
        };

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                let shared = Arc::clone(&shared);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    handle_accept(shared, stream, peer_addr, acceptor).await;
                });
            }
        });
    }
    Ok(())
}

fn build_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        cert_path,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        key_path,
    )?))?
    .ok_or_else(|| anyhow::anyhow!("no private key in {key_path}"))?;
    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn handle_accept(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    match acceptor {
        Some(acceptor) => {
            let tls_stream = match tokio::time::timeout(
                crate::link::TLS_HANDSHAKE_TIMEOUT,
                acceptor.accept(stream),
            )
            .await
            {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    debug!(peer = %peer_addr, error = %e, "TLS accept failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer_addr, "TLS accept timed out");
                    return;
                }
            };
            let (uid, rx) = accept_connection(&shared, peer_addr, true);
            run_io(shared, uid, tls_stream, rx).await;
        }
        None => {
            let (uid, rx) = accept_connection(&shared, peer_addr, false);
            run_io(shared, uid, stream, rx).await;
        }
    }
}

/// Register a freshly accepted, unregistered connection.
fn accept_connection(
    shared: &Shared,
    peer_addr: SocketAddr,
    is_tls: bool,
) -> (Uid, mpsc::UnboundedReceiver<String>) {
    let mut core = shared.lock();
    let uid = core.next_uid();
    let (tx, rx) = mpsc::unbounded_channel();
    let class = core.config.class("default");

    let mut client = Client::new(uid.clone(), Status::Unknown);
    let ip_text = peer_addr.ip().to_string();
    client.host = ip_text.clone();
    client.realhost = ip_text.clone();
    client.sockhost = ip_text;
    client.ip = Some(peer_addr.ip());
    client.tsinfo = core.time.real;
    client.created_monotonic = core.time.mono;
    let mut conn = Connection::new(tx, class.sendq, class.name.clone());
    conn.is_tls = is_tls;
    conn.last_data = core.time.mono;
    if core.config.general.ping_cookie {
        let cookie: u32 = rand::random::<u32>() | 1;
        conn.ping_cookie = Some(cookie);
    }
    let cookie = conn.ping_cookie;
    client.conn = Some(conn);
    core.insert_local(client);

    if let Some(cookie) = cookie {
        core.sendto_one(&uid, &format!("PING :{cookie}"));
    }
    debug!(%uid, peer = %peer_addr, tls = is_tls, "connection accepted");
    (uid, rx)
}

/// Drive one connection: writer task plus the read-dispatch loop.
/// Returns when the socket closes or the client is exited.
pub(crate) async fn run_io<S>(
    shared: Arc<Shared>,
    uid: Uid,
    stream: S,
    mut rx: mpsc::UnboundedReceiver<String>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, LineCodec::new());

    let (sendq_bytes, conn_bytes, core_bytes) = {
        let core = shared.lock();
        let conn = core.clients.get(&uid).and_then(|c| c.conn.as_ref());
        match conn {
            Some(conn) => (
                Arc::clone(&conn.sendq_bytes),
                Arc::clone(&conn.bytes_sent),
                Arc::clone(&core.bytes_sent),
            ),
            None => return,
        }
    };

    let writer = tokio::spawn(async move {
        let mut writer = FramedWrite::new(write_half, LineCodec::new());
        while let Some(line) = rx.recv().await {
            let len = line.len() + 2;
            if writer.send(line).await.is_err() {
                break;
            }
            sendq_bytes.fetch_sub(len.min(sendq_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
            conn_bytes.fetch_add(len as u64, Ordering::Relaxed);
            core_bytes.fetch_add(len as u64, Ordering::Relaxed);
        }
        let _ = writer.flush().await;
    });

    while let Some(item) = reader.next().await {
        let Ok(line) = item else {
            break;
        };
        if line.is_empty() {
            continue;
        }
        let mut core = shared.lock();
        let now = core.time.mono;
        match core.clients.get_mut(&uid) {
            Some(client) => {
                if let Some(conn) = client.conn.as_mut() {
                    conn.last_data = now;
                }
            }
            None => break,
        }
        dispatch(&mut core, &uid, &line);
        core.reap_dead();
        if !core.clients.contains_key(&uid) {
            break;
        }
    }

    {
        let mut core = shared.lock();
        if core.clients.contains_key(&uid) {
            core.exit_client(&uid, "Connection closed");
        }
    }
    writer.abort();
}
