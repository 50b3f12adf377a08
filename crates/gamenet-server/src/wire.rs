//! Outer packet framing (`spec.md` §6): `{1-byte type, type-dependent body}`.
//!
//! Handshake packets (`Request`/`Denied`/`Challenge`/`Response`) carry their
//! own already-sealed token blobs (see [`crate::token`]) and are not
//! separately encrypted at this layer. Post-handshake packets
//! (`KeepAlive`/`Payload`/`Disconnect`) carry a cleartext 64-bit
//! per-direction sequence counter followed by an AEAD-sealed body, sealed
//! with the per-client send/recv key and that counter as the nonce (see
//! [`crate::crypto`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire-level tag for the outer packet (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Client announcing a connect token, hoping to start a handshake.
    Request,
    /// Server refusing a `Request` outright (whitelist, capacity).
    Denied,
    /// Server's reply to a valid `Request`: a sealed challenge token.
    Challenge,
    /// Client echoing a challenge token back to complete the handshake.
    Response,
    /// Either side's idle-channel heartbeat.
    KeepAlive,
    /// A reliable or unreliable channel chunk from
    /// [`gamenet_proto::ReliablePacketController`].
    Payload,
    /// Either side tearing down the connection.
    Disconnect,
}

impl PacketType {
    pub(crate) const fn tag(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Denied => 1,
            Self::Challenge => 2,
            Self::Response => 3,
            Self::KeepAlive => 4,
            Self::Payload => 5,
            Self::Disconnect => 6,
        }
    }

    /// Recognizes a wire tag byte, returning `None` for anything else - such
    /// datagrams are dropped before they reach the handshake state machine,
    /// per `spec.md` §3's "anything else is dropped".
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Denied),
            2 => Some(Self::Challenge),
            3 => Some(Self::Response),
            4 => Some(Self::KeepAlive),
            5 => Some(Self::Payload),
            6 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// A parsed, but not yet decrypted, outer datagram.
#[derive(Debug, Clone)]
pub struct OuterPacket {
    /// The packet's type tag.
    pub packet_type: PacketType,
    /// Everything after the type byte.
    pub body: Bytes,
}

/// Splits `datagram` into its type tag and body.
///
/// Returns `None` for an empty datagram or an unrecognized type byte - both
/// are dropped silently by the caller, per `spec.md` §5 ("Datagram intake").
#[must_use]
pub fn decode_outer(mut datagram: Bytes) -> Option<OuterPacket> {
    if !datagram.has_remaining() {
        return None;
    }
    let tag = datagram.get_u8();
    let packet_type = PacketType::from_tag(tag)?;
    Some(OuterPacket {
        packet_type,
        body: datagram,
    })
}

/// Prefixes `body` with `packet_type`'s tag byte.
#[must_use]
pub fn encode_outer(packet_type: PacketType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(packet_type.tag());
    buf.put_slice(body);
    buf.freeze()
}

/// Prefixes an encrypted post-handshake body with its cleartext sequence
/// counter, for framing by [`encode_outer`].
#[must_use]
pub fn encode_sequenced_body(sequence: u64, ciphertext: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + ciphertext.len());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(ciphertext);
    buf
}

/// Splits a post-handshake body into its cleartext sequence counter and the
/// remaining ciphertext. Returns `None` if shorter than the 8-byte counter.
#[must_use]
pub fn decode_sequenced_body(mut body: Bytes) -> Option<(u64, Bytes)> {
    if body.remaining() < 8 {
        return None;
    }
    let sequence = body.get_u64_le();
    Some((sequence, body))
}
