//! See [`ServerConfig`].

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration knobs read once at [`crate::server::Server::bind`] time.
///
/// One struct constructed by the embedding application, mirroring the
/// teacher's `aeronet_webtransport::server::ServerConfig` (itself built by the
/// application and handed to `Server::new`) rather than parsed from a file or
/// environment - this is a library, not a standalone binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address the UDP socket binds to.
    pub listen_address: SocketAddr,
    /// Address advertised to clients and checked against a connect token's
    /// whitelist. May differ from `listen_address` behind NAT/port-forwarding.
    pub public_address: SocketAddr,
    /// 64-bit value bound into every outer packet; datagrams for a different
    /// protocol are dropped before they reach the handshake state machine.
    pub protocol_id: u64,
    /// Symmetric key used to open connect tokens presented in
    /// `ConnectionRequest` packets.
    pub private_key: [u8; 32],
    /// A client with no received datagram for longer than this is reaped.
    /// Keep-alives are sent at least every `timeout / 4`.
    pub timeout: Duration,
    /// Upper bound on a single outer UDP datagram. Derives the per-channel
    /// fragment size and max-fragments-per-packet for both
    /// [`gamenet_proto::ReliablePacketController`]s a [`crate::client::ClientInstance`]
    /// owns.
    pub max_packet_size_bytes: usize,
    /// Upper bound on concurrently connected clients; `ConnectionRequest`s
    /// past this are rejected with `HandshakeRejected`.
    pub max_clients: usize,
    /// Capacity of the bounded channel feeding each `ClientInstance`'s inbound
    /// datagram queue.
    pub client_inbound_capacity: usize,
}

impl ServerConfig {
    /// Fragment body size derived from `max_packet_size_bytes`, leaving room
    /// for the marker byte, packet header, and fragment info on every chunk.
    #[must_use]
    pub fn fragment_size(&self) -> usize {
        let overhead = 1 + gamenet_proto::header::PACKET_HEADER_LEN + gamenet_proto::header::FRAGMENT_INFO_LEN;
        self.max_packet_size_bytes.saturating_sub(overhead)
    }

    /// Largest number of fragments a single reliable send may split into
    /// before [`gamenet_proto::SendError::PacketTooLarge`] is returned. Capped
    /// at 255 since [`gamenet_proto::header::FragmentInfo::fragment_total`] is
    /// a `u8`.
    #[must_use]
    pub fn max_fragments_per_packet(&self) -> u8 {
        255
    }

    /// Cadence at which a connected client must hear from this server, and
    /// vice versa, to stay alive.
    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        self.timeout / 4
    }
}
