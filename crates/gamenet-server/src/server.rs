//! See [`Server`].
//!
//! Shape follows `aeronet_webtransport::server`'s listener-plus-background-task
//! split: one task owns the socket and feeds datagrams to per-connection
//! state, a second drains the shared outbound queue, and accepted
//! connections are handed to the application over a channel rather than a
//! callback - the same "stream of connections" shape `tokio::net::TcpListener`
//! users already expect.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::client::{ClientHandles, ClientInstance};
use crate::config::ServerConfig;
use crate::crypto::SealKey;
use crate::error::HandshakeRejectedReason;
use crate::token::{now_ms, ChallengeToken, ConnectToken, TokenError};
use crate::wire::{self, PacketType};

/// Largest UDP datagram the intake loop will read; any send from a peer
/// larger than this is truncated by the kernel and rejected by decoding, same
/// as any other malformed datagram.
const MAX_DATAGRAM_LEN: usize = 4096;

/// How long a [`Pending`] handshake may sit unanswered before it is reaped.
const PENDING_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Cadence of the background reaper that prunes stopped clients and expired
/// pending handshakes.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// A freshly accepted connection, handed out by [`Server::accept`].
pub struct Connection {
    /// Handle to send to and query this peer.
    pub instance: ClientInstance,
    /// Reliable and unreliable messages delivered from this peer.
    pub messages: mpsc::UnboundedReceiver<Bytes>,
}

struct ConnectedClient {
    instance: ClientInstance,
    inbound: mpsc::Sender<Bytes>,
}

/// A connect token that has been accepted and challenged, awaiting the
/// matching `ConnectionResponse` (`spec.md` §4.5).
struct Pending {
    client_id: u64,
    send_key: SealKey,
    recv_key: SealKey,
    user_data: Vec<u8>,
    challenge_sequence: u64,
    created_at_ms: u64,
}

struct Inner {
    config: ServerConfig,
    local_addr: SocketAddr,
    challenge_key: SealKey,
    clients: Mutex<HashMap<SocketAddr, ConnectedClient>>,
    pending: Mutex<HashMap<SocketAddr, Pending>>,
    challenge_sequence: AtomicU64,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    accepted_tx: mpsc::UnboundedSender<Connection>,
}

/// An authoritative UDP server accepting connect-token handshakes and
/// running one [`ClientInstance`] per connected peer (`spec.md` §2).
pub struct Server {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    accepted: AsyncMutex<mpsc::UnboundedReceiver<Connection>>,
}

impl Server {
    /// Binds a UDP socket at `config.listen_address` and starts the intake,
    /// outbound-writer, and reaper background tasks.
    ///
    /// # Errors
    ///
    /// Returns any [`io::Error`] from binding the socket.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.listen_address).await?);
        let local_addr = socket.local_addr()?;
        info!(address = %local_addr, "server listening");

        let mut challenge_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut challenge_key);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            local_addr,
            challenge_key,
            clients: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            challenge_sequence: AtomicU64::new(0),
            outbound_tx,
            accepted_tx,
        });

        let writer = tokio::spawn(run_writer(socket.clone(), outbound_rx));
        let intake = tokio::spawn(run_intake(socket, inner.clone()));
        let reaper = tokio::spawn(run_reaper(inner.clone()));

        Ok(Self {
            inner,
            tasks: Mutex::new(vec![writer, intake, reaper]),
            accepted: AsyncMutex::new(accepted_rx),
        })
    }

    /// Configuration this server was bound with.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Address the underlying socket was actually bound to, resolving a `:0`
    /// `listen_address` port to the one the OS assigned.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    /// Waits for the next completed handshake.
    ///
    /// Returns `None` once the server has been shut down and every pending
    /// accept has been drained.
    pub async fn accept(&self) -> Option<Connection> {
        self.accepted.lock().await.recv().await
    }

    /// Closes every connected client (sending each a disconnect burst) and
    /// stops the background tasks. The bound socket is dropped once every
    /// task has observed the shutdown.
    pub async fn shutdown(self) {
        let clients = std::mem::take(&mut *self.inner.clients.lock().unwrap());
        for (_, client) in clients {
            client.instance.close();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
    }
}

async fn run_writer(socket: Arc<UdpSocket>, mut outbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
    while let Some((addr, datagram)) = outbound_rx.recv().await {
        if let Err(err) = socket.send_to(&datagram, addr).await {
            warn!(%addr, %err, "failed to write outbound datagram");
        }
    }
}

async fn run_intake(socket: Arc<UdpSocket>, inner: Arc<Inner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "socket read failed, stopping intake loop");
                return;
            }
        };
        if len > inner.config.max_packet_size_bytes {
            trace!(%addr, len, "dropping oversized datagram");
            continue;
        }
        let datagram = Bytes::copy_from_slice(&buf[..len]);
        handle_datagram(&inner, addr, datagram).await;
    }
}

async fn run_reaper(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        let now = now_ms();

        {
            let mut clients = inner.clients.lock().unwrap();
            let before = clients.len();
            clients.retain(|_, client| !client.instance.is_stopped());
            let reaped = before - clients.len();
            if reaped > 0 {
                debug!(reaped, "pruned stopped clients");
            }
        }
        {
            let mut pending = inner.pending.lock().unwrap();
            pending.retain(|_, entry| now.saturating_sub(entry.created_at_ms) < PENDING_HANDSHAKE_TIMEOUT_MS);
        }
    }
}

async fn handle_datagram(inner: &Arc<Inner>, addr: SocketAddr, datagram: Bytes) {
    let Some(outer) = wire::decode_outer(datagram) else {
        trace!(%addr, "dropped unrecognized datagram");
        return;
    };

    match outer.packet_type {
        PacketType::Request => handle_request(inner, addr, outer.body),
        PacketType::Response => handle_response(inner, addr, outer.body).await,
        PacketType::KeepAlive | PacketType::Payload | PacketType::Disconnect => {
            forward_to_client(inner, addr, wire::encode_outer(outer.packet_type, &outer.body)).await;
        }
        PacketType::Denied | PacketType::Challenge => {
            trace!(%addr, ?outer.packet_type, "dropped server-to-client-only packet type from peer");
        }
    }
}

async fn forward_to_client(inner: &Arc<Inner>, addr: SocketAddr, datagram: Bytes) {
    let inbound = {
        let clients = inner.clients.lock().unwrap();
        clients.get(&addr).map(|client| client.inbound.clone())
    };
    let Some(inbound) = inbound else {
        trace!(%addr, "dropped packet for unknown client");
        return;
    };
    if inbound.try_send(datagram).is_err() {
        warn!(%addr, "client inbound queue full or closed, dropping datagram");
    }
}

fn handle_request(inner: &Arc<Inner>, addr: SocketAddr, token_blob: Bytes) {
    if inner.clients.lock().unwrap().contains_key(&addr) {
        trace!(%addr, "dropped connect request from already-connected address");
        return;
    }

    let token = match ConnectToken::open(&inner.config.private_key, &token_blob, now_ms()) {
        Ok(token) => token,
        Err(TokenError::Unauthenticated | TokenError::Malformed) => {
            trace!(%addr, "dropped connect request with an invalid token");
            return;
        }
        Err(TokenError::Expired) => {
            trace!(%addr, "dropped connect request with an expired token");
            return;
        }
    };

    if !token.allows(inner.config.public_address) {
        deny(inner, addr, HandshakeRejectedReason::NotWhitelisted);
        return;
    }
    if inner.clients.lock().unwrap().len() >= inner.config.max_clients {
        deny(inner, addr, HandshakeRejectedReason::AtCapacity);
        return;
    }

    let challenge_sequence = inner.challenge_sequence.fetch_add(1, Ordering::Relaxed);
    let challenge = ChallengeToken {
        client_id: token.client_id,
        user_data: token.user_data.clone(),
    };
    let sealed = challenge.seal(&inner.challenge_key, challenge_sequence);

    inner.pending.lock().unwrap().insert(
        addr,
        Pending {
            client_id: token.client_id,
            send_key: token.send_key,
            recv_key: token.recv_key,
            user_data: token.user_data,
            challenge_sequence,
            created_at_ms: now_ms(),
        },
    );

    let body = wire::encode_sequenced_body(challenge_sequence, &sealed);
    let datagram = wire::encode_outer(PacketType::Challenge, &body);
    let _ = inner.outbound_tx.send((addr, datagram));
    debug!(%addr, client_id = token.client_id, "issued challenge");
}

async fn handle_response(inner: &Arc<Inner>, addr: SocketAddr, body: Bytes) {
    let Some((challenge_sequence, ciphertext)) = wire::decode_sequenced_body(body) else {
        trace!(%addr, "dropped too-short connection response");
        return;
    };

    let pending = {
        let mut pending = inner.pending.lock().unwrap();
        match pending.get(&addr) {
            Some(entry) if entry.challenge_sequence == challenge_sequence => pending.remove(&addr),
            _ => None,
        }
    };
    let Some(pending) = pending else {
        trace!(%addr, "dropped connection response with no matching pending handshake");
        return;
    };

    let opened = match ChallengeToken::open(&inner.challenge_key, challenge_sequence, &ciphertext) {
        Ok(opened) => opened,
        Err(_) => {
            trace!(%addr, "dropped connection response that failed to authenticate");
            return;
        }
    };
    if opened.client_id != pending.client_id {
        warn!(%addr, "challenge token client id mismatch, dropping");
        return;
    }

    let (instance, handles) = ClientInstance::spawn(
        addr,
        pending.send_key,
        pending.recv_key,
        pending.user_data,
        &inner.config,
        inner.outbound_tx.clone(),
    );
    instance.mark_connected();

    inner.clients.lock().unwrap().insert(
        addr,
        ConnectedClient {
            instance: instance.clone(),
            inbound: handles.inbound,
        },
    );

    info!(%addr, client_id = pending.client_id, "client connected");
    let _ = inner.accepted_tx.send(Connection {
        instance,
        messages: handles.delivery,
    });
    let ClientHandles { join, .. } = handles;
    drop(join); // detached: the tick task stops itself via `stopped`/closed channels
}

fn deny(inner: &Arc<Inner>, addr: SocketAddr, reason: HandshakeRejectedReason) {
    let reason_byte = match reason {
        HandshakeRejectedReason::NotWhitelisted => 0u8,
        HandshakeRejectedReason::AlreadyConnected => 1u8,
        HandshakeRejectedReason::AtCapacity => 2u8,
    };
    let datagram = wire::encode_outer(PacketType::Denied, &[reason_byte]);
    let _ = inner.outbound_tx.send((addr, datagram));
    debug!(%addr, %reason, "denied connection request");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_config(listen: &str, public: &str) -> ServerConfig {
        ServerConfig {
            listen_address: listen.parse().unwrap(),
            public_address: public.parse().unwrap(),
            protocol_id: 7,
            private_key: [9u8; 32],
            timeout: StdDuration::from_secs(5),
            max_packet_size_bytes: 512,
            max_clients: 2,
            client_inbound_capacity: 32,
        }
    }

    #[tokio::test]
    async fn binds_and_reports_zero_clients() {
        let server = Server::bind(test_config("127.0.0.1:0", "127.0.0.1:40001")).await.unwrap();
        assert_eq!(server.client_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn full_handshake_admits_a_client() {
        let public: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let config = test_config("127.0.0.1:40002", "127.0.0.1:40002");
        let private_key = config.private_key;
        let server = Server::bind(config).await.unwrap();
        assert_eq!(server.local_addr(), public);

        let client_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_socket.connect(public).await.unwrap();

        let token = ConnectToken {
            client_id: 1,
            expires_at_ms: now_ms() + 30_000,
            server_whitelist: vec![public],
            send_key: [1u8; 32],
            recv_key: [2u8; 32],
            user_data: vec![],
        };
        let request = wire::encode_outer(PacketType::Request, &token.seal(&private_key));
        client_socket.send(&request).await.unwrap();

        let mut buf = [0u8; 2048];
        let len = tokio::time::timeout(StdDuration::from_secs(1), client_socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let challenge = wire::decode_outer(Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(challenge.packet_type, PacketType::Challenge);

        client_socket.send(&wire::encode_outer(PacketType::Response, &challenge.body)).await.unwrap();

        let connection = tokio::time::timeout(StdDuration::from_secs(1), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(connection.instance.is_connected());
        assert_eq!(server.client_count(), 1);

        server.shutdown().await;
    }
}
