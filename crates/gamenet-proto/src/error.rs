//! Crate-level error type, grounded on the teacher's
//! `aeronet_proto::session::{SendError, RecvError}` shape: a `thiserror` enum
//! at the public boundary, with `#[from]`/`#[source]` wrapping the lower
//! layers instead of an opaque `anyhow::Error`.

use thiserror::Error;

use crate::header::HeaderError;
use crate::varint::VarUintError;

/// Error sending a packet through a [`crate::controller::ReliablePacketController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The packet (after fragmentation, if any) would still exceed the
    /// configured maximum packet size.
    #[error("packet of {len} bytes exceeds the maximum packet size of {max} bytes")]
    PacketTooLarge {
        /// Size of the offending packet, in bytes.
        len: usize,
        /// Configured maximum packet size.
        max: usize,
    },
}

/// Error receiving a packet through a
/// [`crate::controller::ReliablePacketController`].
///
/// It is always safe to drop the offending packet and continue; none of
/// these close the underlying connection by themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// Failed to decode the [`crate::header::PacketHeader`].
    #[error("failed to decode packet header: {0}")]
    Header(#[from] HeaderError),
    /// Failed to decode a [`crate::header::FragmentInfo`].
    #[error("failed to decode fragment info: {0}")]
    FragmentInfo(HeaderError),
    /// This sequence has already been seen (duplicate or replay).
    #[error("duplicate fragment sequence")]
    Duplicate,
    /// `fragment_index >= fragment_total`, or `fragment_total == 0`.
    #[error("malformed fragment index {index}/{total}")]
    MalformedFragment {
        /// The fragment's claimed index.
        index: u8,
        /// The fragment's claimed total.
        total: u8,
    },
    /// A later fragment of this packet disagreed with an earlier one about
    /// how many fragments the packet has in total.
    #[error("fragment total changed mid-reassembly")]
    InconsistentFragmentTotal,
}

/// Error decoding a coalesced reliable message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoalesceError {
    /// Failed to decode a message's varuint16 length prefix.
    #[error("failed to decode message length: {0}")]
    Length(#[from] VarUintError),
    /// A message's length prefix claimed more bytes than remained in the
    /// packet.
    #[error("message body runs past the end of the packet")]
    TruncatedBody,
}
