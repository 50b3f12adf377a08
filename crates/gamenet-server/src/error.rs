//! Crate-level error type (`spec.md` §7), grounded on the same
//! `thiserror`-enum-at-the-boundary shape as `gamenet_proto::{SendError,
//! RecvError}` and the teacher's `aeronet_webtransport::server::ServerError`.

use thiserror::Error;

/// Error returned to the application from a [`crate::client::ClientInstance`]
/// or [`crate::server::Server`] operation.
///
/// Per `spec.md` §7: only send-path errors are meant to be surfaced to the
/// caller. Everything else (decode anomalies, unknown packet types, socket
/// write failures) is absorbed and logged inside the client or server and
/// never appears here - no single malformed packet ever closes a session.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation targeted a [`crate::client::ClientInstance`] that has
    /// already stopped, or never finished connecting.
    #[error("client is closed")]
    ClosedClient,
    /// An unreliable payload exceeded the single-fragment limit.
    #[error("unreliable payload of {len} bytes exceeds the {max}-byte single-fragment limit")]
    WriteOversize {
        /// Size of the rejected payload.
        len: usize,
        /// Largest payload the unreliable channel will carry unfragmented.
        max: usize,
    },
    /// The reliable send window (256 messages) is full.
    #[error("reliable send buffer is full")]
    SendBufferFull,
    /// The datagram failed to parse, authenticate, or otherwise validate.
    #[error("invalid packet: {0}")]
    InvalidPacket(#[source] InvalidPacketReason),
    /// A `ConnectionRequest` was rejected before a `ClientInstance` was ever
    /// created.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(#[from] HandshakeRejectedReason),
    /// A transient failure (socket write error, decode anomaly) that was
    /// logged and the offending packet dropped; surfaced here only for tests
    /// and diagnostics that want to observe it.
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Why a datagram was rejected as an [`Error::InvalidPacket`].
#[derive(Debug, Error)]
pub enum InvalidPacketReason {
    /// The outer packet type byte is not one of the seven known types.
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    /// AEAD authentication of the outer packet failed.
    #[error("failed to authenticate packet")]
    Unauthenticated,
    /// The embedded connect or challenge token had expired.
    #[error("token expired")]
    TokenExpired,
    /// This packet's sequence has already been seen, or falls outside the
    /// replay-protection window.
    #[error("replayed or out-of-window sequence")]
    Replayed,
    /// A fragment header or coalesced-message length prefix was malformed.
    #[error("malformed fragment or coalescing")]
    Malformed(#[from] gamenet_proto::RecvError),
}

/// Why a `ConnectionRequest` was rejected outright.
#[derive(Debug, Error)]
pub enum HandshakeRejectedReason {
    /// The server's public endpoint is not in the connect token's whitelist.
    #[error("public address not in connect token whitelist")]
    NotWhitelisted,
    /// This address already has a connected `ClientInstance`.
    #[error("address already connected")]
    AlreadyConnected,
    /// The server is at `max_clients` capacity.
    #[error("server at capacity")]
    AtCapacity,
}
