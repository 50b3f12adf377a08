//! End-to-end message delivery over a connected `Server`/client pair: proves
//! out the reliable/unreliable channel split (`spec.md` §4.4/§8) through the
//! real socket path rather than the in-process `ClientInstance` plumbing unit
//! tests in `client.rs` already cover.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key};
use gamenet_proto::ReliablePacketController;
use gamenet_server::client::UNRELIABLE_CHANNEL;
use gamenet_server::config::ServerConfig;
use gamenet_server::crypto::{nonce_from_counter, SealKey};
use gamenet_server::token::{now_ms, ConnectToken};
use gamenet_server::wire::{self, PacketType};
use gamenet_server::Server;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen_address: listen,
        public_address: listen,
        protocol_id: 7,
        private_key: [0x55u8; 32],
        timeout: Duration::from_secs(5),
        max_packet_size_bytes: 512,
        max_clients: 4,
        client_inbound_capacity: 32,
    }
}

/// Minimal client-side AEAD matching `client::aad`'s scheme, just enough to
/// drive one reliable roundtrip without pulling in the server's internal
/// `ReliablePacketController` bookkeeping.
fn seal(key: &SealKey, counter: u64, packet_type: PacketType, plaintext: &[u8], protocol_id: u64) -> Vec<u8> {
    let mut aad = [0u8; 9];
    aad[0] = match packet_type {
        PacketType::KeepAlive => 4,
        PacketType::Payload => 5,
        PacketType::Disconnect => 6,
        _ => unreachable!("handshake types are never sealed this way"),
    };
    aad[1..].copy_from_slice(&protocol_id.to_le_bytes());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_from_counter(counter);
    cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad: &aad })
        .unwrap()
}

fn open(key: &SealKey, counter: u64, packet_type: PacketType, ciphertext: &[u8], protocol_id: u64) -> Option<Vec<u8>> {
    let mut aad = [0u8; 9];
    aad[0] = match packet_type {
        PacketType::KeepAlive => 4,
        PacketType::Payload => 5,
        PacketType::Disconnect => 6,
        _ => unreachable!("handshake types are never opened this way"),
    };
    aad[1..].copy_from_slice(&protocol_id.to_le_bytes());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_from_counter(counter);
    cipher
        .decrypt(&nonce, chacha20poly1305::aead::Payload { msg: ciphertext, aad: &aad })
        .ok()
}

/// Connects one client and returns its send/recv keys, protocol id, and the
/// bound client socket, positioned right after the handshake completes.
async fn connect(server: &Server, public: SocketAddr) -> (UdpSocket, SealKey, SealKey, u64) {
    let private_key = server.config().private_key;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(public).await.unwrap();

    let send_key = [9u8; 32];
    let recv_key = [8u8; 32];
    let token = ConnectToken {
        client_id: 1,
        expires_at_ms: now_ms() + 30_000,
        server_whitelist: vec![public],
        send_key,
        recv_key,
        user_data: vec![],
    };
    client
        .send(&wire::encode_outer(PacketType::Request, &token.seal(&private_key)))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let len = timeout(Duration::from_secs(1), client.recv(&mut buf)).await.unwrap().unwrap();
    let challenge = wire::decode_outer(Bytes::copy_from_slice(&buf[..len])).unwrap();
    client
        .send(&wire::encode_outer(PacketType::Response, &challenge.body))
        .await
        .unwrap();

    (client, send_key, recv_key, server.config().protocol_id)
}

#[tokio::test]
async fn unreliable_payload_round_trips_to_application() {
    let listen: SocketAddr = "127.0.0.1:40201".parse().unwrap();
    let cfg = config(listen);
    let fragment_size = cfg.fragment_size();
    let max_fragments = cfg.max_fragments_per_packet();
    let max_packet_size = cfg.max_packet_size_bytes;
    let server = Server::bind(cfg).await.unwrap();
    let (client, send_key, _recv_key, protocol_id) = connect(&server, listen).await;

    let mut connection = timeout(Duration::from_secs(1), server.accept()).await.unwrap().unwrap();

    // Mirrors exactly what a peer's own unreliable-channel controller would
    // emit: one unfragmented chunk carrying "ping", framed the same way
    // `ClientInstance::send_fragments` frames the server's outgoing chunks.
    let mut controller = ReliablePacketController::new(UNRELIABLE_CHANNEL, fragment_size, max_fragments, max_packet_size, 256);
    let out = controller.send_packet(b"ping").unwrap();
    assert_eq!(out.fragments.len(), 1, "a 4-byte message should never need to fragment");

    let ciphertext = seal(&send_key, 0, PacketType::Payload, &out.fragments[0], protocol_id);
    let body = wire::encode_sequenced_body(0, &ciphertext);
    client.send(&wire::encode_outer(PacketType::Payload, &body)).await.unwrap();

    let delivered = timeout(Duration::from_secs(1), connection.messages.recv()).await.unwrap().unwrap();
    assert_eq!(&delivered[..], b"ping");

    server.shutdown().await;
}

#[tokio::test]
async fn server_keep_alive_authenticates_under_client_recv_key() {
    let listen: SocketAddr = "127.0.0.1:40202".parse().unwrap();
    let server = Server::bind(config(listen)).await.unwrap();
    let (client, _send_key, recv_key, protocol_id) = connect(&server, listen).await;

    let _connection = timeout(Duration::from_secs(1), server.accept()).await.unwrap().unwrap();

    let mut buf = [0u8; 2048];
    loop {
        let len = timeout(Duration::from_secs(1), client.recv(&mut buf)).await.unwrap().unwrap();
        let outer = wire::decode_outer(Bytes::copy_from_slice(&buf[..len])).unwrap();
        if outer.packet_type != PacketType::KeepAlive && outer.packet_type != PacketType::Payload {
            continue;
        }
        let (counter, ciphertext) = wire::decode_sequenced_body(outer.body).unwrap();
        let plaintext = open(&recv_key, counter, outer.packet_type, &ciphertext, protocol_id);
        assert!(plaintext.is_some(), "server's own traffic key must open what it sealed");
        break;
    }

    server.shutdown().await;
}
