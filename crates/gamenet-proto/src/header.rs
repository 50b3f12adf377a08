//! Wire headers for the fragmentation/ack layer.
//!
//! See `spec.md` §6 for the exact wire layout. Sequence numbers are encoded
//! little-endian, matching native x86/ARM byte order (see `DESIGN.md`,
//! "Sequence byte order").

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::ack::Ack;
use crate::seq::Seq;

/// Error decoding a [`PacketHeader`] or [`FragmentInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Fewer bytes remained than the header requires.
    #[error("buffer too short for packet header")]
    TooShort,
}

/// Header present on every wire-level fragment, carrying the channel id,
/// this controller's own sequence number, and piggybacked ack state.
///
/// Encoded as:
/// ```text
/// channel_id : u8
/// sequence   : u16 (little-endian)
/// ack        : u16 (little-endian)
/// ack_bits   : u32 (little-endian)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Which logical channel (reliable/unreliable) this packet belongs to.
    pub channel_id: u8,
    /// This controller's own fragmentation-layer sequence number.
    pub sequence: Seq,
    /// Acknowledgement of sequences this side has received from the peer.
    pub ack: Ack,
}

/// Encoded size of [`PacketHeader`], in bytes.
pub const PACKET_HEADER_LEN: usize = 1 + 2 + 2 + 4;

impl PacketHeader {
    /// Writes this header to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.channel_id);
        buf.put_u16_le(self.sequence.0);
        buf.put_u16_le(self.ack.ack.0);
        buf.put_u32_le(self.ack.ack_bits);
    }

    /// Reads a header written by [`PacketHeader::encode`], advancing `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TooShort`] if fewer than [`PACKET_HEADER_LEN`]
    /// bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, HeaderError> {
        if buf.remaining() < PACKET_HEADER_LEN {
            return Err(HeaderError::TooShort);
        }
        let channel_id = buf.get_u8();
        let sequence = Seq(buf.get_u16_le());
        let ack = Seq(buf.get_u16_le());
        let ack_bits = buf.get_u32_le();
        Ok(Self {
            channel_id,
            sequence,
            ack: Ack { ack, ack_bits },
        })
    }
}

/// Extra header present on every fragment of a packet that was split into
/// more than one piece. Only fragment 0 also carries a [`PacketHeader`];
/// every fragment (0 included) carries this.
///
/// Encoded as:
/// ```text
/// fragment_index : u8
/// fragment_total : u8
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Zero-based index of this fragment within the packet.
    pub fragment_index: u8,
    /// Total number of fragments the packet was split into.
    pub fragment_total: u8,
}

/// Encoded size of [`FragmentInfo`], in bytes.
pub const FRAGMENT_INFO_LEN: usize = 2;

impl FragmentInfo {
    /// Writes this header to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.fragment_index);
        buf.put_u8(self.fragment_total);
    }

    /// Reads a header written by [`FragmentInfo::encode`], advancing `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::TooShort`] if fewer than [`FRAGMENT_INFO_LEN`]
    /// bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, HeaderError> {
        if buf.remaining() < FRAGMENT_INFO_LEN {
            return Err(HeaderError::TooShort);
        }
        Ok(Self {
            fragment_index: buf.get_u8(),
            fragment_total: buf.get_u8(),
        })
    }
}
