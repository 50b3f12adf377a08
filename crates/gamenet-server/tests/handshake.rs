//! End-to-end handshake scenarios over real loopback UDP sockets: the parts
//! of `spec.md` §4.5/§7 that a unit test inside `server.rs` can't exercise
//! because they need two independent peers racing real packet loss and
//! retry behavior.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use gamenet_server::config::ServerConfig;
use gamenet_server::token::{now_ms, ConnectToken};
use gamenet_server::wire::{self, PacketType};
use gamenet_server::Server;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn config(listen: SocketAddr, public: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen_address: listen,
        public_address: public,
        protocol_id: 99,
        private_key: [0xABu8; 32],
        timeout: Duration::from_secs(5),
        max_packet_size_bytes: 512,
        max_clients: 1,
        client_inbound_capacity: 32,
    }
}

async fn do_handshake(server: &Server, client: &UdpSocket, private_key: [u8; 32], public: SocketAddr) {
    let token = ConnectToken {
        client_id: 1,
        expires_at_ms: now_ms() + 30_000,
        server_whitelist: vec![public],
        send_key: [1u8; 32],
        recv_key: [2u8; 32],
        user_data: vec![42],
    };
    client
        .send(&wire::encode_outer(PacketType::Request, &token.seal(&private_key)))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let len = timeout(Duration::from_secs(1), client.recv(&mut buf)).await.unwrap().unwrap();
    let challenge = wire::decode_outer(Bytes::copy_from_slice(&buf[..len])).unwrap();
    assert_eq!(challenge.packet_type, PacketType::Challenge);

    client
        .send(&wire::encode_outer(PacketType::Response, &challenge.body))
        .await
        .unwrap();

    let connection = timeout(Duration::from_secs(1), server.accept()).await.unwrap().unwrap();
    assert!(connection.instance.is_connected());
    assert_eq!(connection.instance.user_data(), &[42]);
}

#[tokio::test]
async fn rejects_request_with_unwhitelisted_public_address() {
    let listen: SocketAddr = "127.0.0.1:40101".parse().unwrap();
    let wrong_public: SocketAddr = "127.0.0.1:40102".parse().unwrap();
    let cfg = config(listen, listen);
    let private_key = cfg.private_key;
    let server = Server::bind(cfg).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(listen).await.unwrap();

    let token = ConnectToken {
        client_id: 1,
        expires_at_ms: now_ms() + 30_000,
        server_whitelist: vec![wrong_public],
        send_key: [1u8; 32],
        recv_key: [2u8; 32],
        user_data: vec![],
    };
    client
        .send(&wire::encode_outer(PacketType::Request, &token.seal(&private_key)))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let len = timeout(Duration::from_secs(1), client.recv(&mut buf)).await.unwrap().unwrap();
    let denied = wire::decode_outer(Bytes::copy_from_slice(&buf[..len])).unwrap();
    assert_eq!(denied.packet_type, PacketType::Denied);
    assert_eq!(server.client_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn rejects_request_once_at_capacity() {
    let listen: SocketAddr = "127.0.0.1:40103".parse().unwrap();
    let cfg = config(listen, listen);
    let private_key = cfg.private_key;
    let server = Server::bind(cfg).await.unwrap();

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    first.connect(listen).await.unwrap();
    do_handshake(&server, &first, private_key, listen).await;
    assert_eq!(server.client_count(), 1);

    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    second.connect(listen).await.unwrap();
    let token = ConnectToken {
        client_id: 2,
        expires_at_ms: now_ms() + 30_000,
        server_whitelist: vec![listen],
        send_key: [3u8; 32],
        recv_key: [4u8; 32],
        user_data: vec![],
    };
    second
        .send(&wire::encode_outer(PacketType::Request, &token.seal(&private_key)))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let len = timeout(Duration::from_secs(1), second.recv(&mut buf)).await.unwrap().unwrap();
    let denied = wire::decode_outer(Bytes::copy_from_slice(&buf[..len])).unwrap();
    assert_eq!(denied.packet_type, PacketType::Denied);
    assert_eq!(server.client_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn drops_request_with_expired_token_silently() {
    let listen: SocketAddr = "127.0.0.1:40104".parse().unwrap();
    let cfg = config(listen, listen);
    let private_key = cfg.private_key;
    let server = Server::bind(cfg).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(listen).await.unwrap();

    let token = ConnectToken {
        client_id: 1,
        expires_at_ms: now_ms().saturating_sub(1),
        server_whitelist: vec![listen],
        send_key: [1u8; 32],
        recv_key: [2u8; 32],
        user_data: vec![],
    };
    client
        .send(&wire::encode_outer(PacketType::Request, &token.seal(&private_key)))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let result = timeout(Duration::from_millis(300), client.recv(&mut buf)).await;
    assert!(result.is_err(), "an expired token must never receive any reply");
    assert_eq!(server.client_count(), 0);

    server.shutdown().await;
}
