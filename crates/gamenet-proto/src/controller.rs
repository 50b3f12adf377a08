//! See [`ReliablePacketController`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ack::Ack;
use crate::error::{RecvError, SendError};
use crate::header::{FragmentInfo, HeaderError, PacketHeader, FRAGMENT_INFO_LEN, PACKET_HEADER_LEN};
use crate::sequence_buffer::{ReassemblyBuffer, ReceivedBuffer};
use crate::seq::Seq;

/// Marker byte prefixed to every wire chunk a controller emits, resolving an
/// ambiguity `spec.md` leaves implicit: a receiver needs *some* way to tell a
/// single un-fragmented packet apart from a fragment of a multi-fragment one
/// before it has decoded anything else. `0` means what follows is a
/// [`PacketHeader`] then the whole body; `1` means a [`PacketHeader`] then a
/// [`FragmentInfo`] then one fragment's body. Every fragment (not only
/// fragment 0) carries the full [`PacketHeader`], including ack state, so
/// that reassembly can route purely on `PacketHeader::sequence` regardless of
/// fragment arrival order - seen in `DESIGN.md` as the "reassembly needs a
/// routable sequence on every fragment" resolution.
const MARKER_SINGLE: u8 = 0;
const MARKER_FRAGMENT: u8 = 1;

/// Output of [`ReliablePacketController::send_packet`]: the sequence number
/// assigned to this packet, and the wire-ready chunk(s) to write to the
/// socket in order.
#[derive(Debug, Clone)]
pub struct SendOutput {
    /// Sequence this controller assigned to the packet.
    pub sequence: Seq,
    /// One chunk if the packet fit unfragmented; otherwise one chunk per
    /// fragment, in order.
    pub fragments: Vec<Bytes>,
}

/// Output of [`ReliablePacketController::receive_packet`].
#[derive(Debug, Clone)]
pub struct ReceiveOutput {
    /// Sequence carried by the chunk that was just processed.
    pub sequence: Seq,
    /// The reassembled packet body, once every fragment has arrived. `None`
    /// while a multi-fragment packet is still incomplete.
    pub reassembled: Option<Bytes>,
    /// Sequences this controller's own earlier sends that the peer's ack
    /// state, as carried on this chunk, newly reports as acknowledged.
    pub newly_acked: Vec<Seq>,
}

/// Per-channel, per-client sans-IO fragmentation/ack engine (`spec.md` §4.3).
///
/// One of these is owned per channel (reliable, unreliable) per
/// `ClientInstance`. It has no knowledge of sockets, encryption, or message
/// ids - only of splitting an opaque byte buffer into wire fragments on the
/// way out, and reassembling + ack-bookkeeping fragments on the way in.
#[derive(Debug)]
pub struct ReliablePacketController {
    channel_id: u8,
    fragment_size: usize,
    max_fragments_per_packet: u8,
    max_packet_size: usize,

    send_sequence: Seq,
    /// Tracks sequences this controller has received from the peer, so
    /// outgoing headers can piggyback an up-to-date ack.
    own_ack: Ack,
    received: ReceivedBuffer,
    reassembly: ReassemblyBuffer,
}

impl ReliablePacketController {
    /// Creates a controller for `channel_id`.
    ///
    /// `fragment_size` is the body size of every fragment but the last;
    /// `max_packet_size` bounds the total wire size of a single un-fragmented
    /// send (and, combined with `fragment_size`, the largest packet this
    /// controller will ever split: `fragment_size * max_fragments_per_packet`
    /// at most). `buffer_size` sizes both the duplicate-rejection and
    /// reassembly sequence buffers.
    #[must_use]
    pub fn new(
        channel_id: u8,
        fragment_size: usize,
        max_fragments_per_packet: u8,
        max_packet_size: usize,
        buffer_size: u16,
    ) -> Self {
        assert!(fragment_size > 0, "fragment_size must be nonzero");
        assert!(
            max_packet_size >= 1 + PACKET_HEADER_LEN,
            "max_packet_size must fit at least an empty packet's headers"
        );
        Self {
            channel_id,
            fragment_size,
            max_fragments_per_packet,
            max_packet_size,
            send_sequence: Seq(0),
            own_ack: Ack::new(),
            received: ReceivedBuffer::new(buffer_size),
            reassembly: ReassemblyBuffer::new(buffer_size),
        }
    }

    /// Largest payload [`ReliablePacketController::send_packet`] will accept.
    #[must_use]
    pub fn max_payload_len(&self) -> usize {
        self.fragment_size * usize::from(self.max_fragments_per_packet)
    }

    fn header(&self, sequence: Seq) -> PacketHeader {
        PacketHeader {
            channel_id: self.channel_id,
            sequence,
            ack: self.own_ack,
        }
    }

    /// Assigns the next sequence to `data` and returns the wire chunk(s)
    /// needed to send it, splitting into fragments if `data` does not fit in
    /// one packet.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::PacketTooLarge`] if `data` exceeds
    /// [`ReliablePacketController::max_payload_len`].
    pub fn send_packet(&mut self, data: &[u8]) -> Result<SendOutput, SendError> {
        let sequence = self.send_sequence;

        let single_overhead = 1 + PACKET_HEADER_LEN;
        if data.len() + single_overhead <= self.max_packet_size {
            let header = self.header(sequence);
            let mut buf = BytesMut::with_capacity(data.len() + single_overhead);
            buf.put_u8(MARKER_SINGLE);
            header.encode(&mut buf);
            buf.put_slice(data);
            self.send_sequence = self.send_sequence + 1;
            return Ok(SendOutput {
                sequence,
                fragments: vec![buf.freeze()],
            });
        }

        let num_fragments = data.len().div_ceil(self.fragment_size);
        if num_fragments > usize::from(self.max_fragments_per_packet) || num_fragments > usize::from(u8::MAX) {
            return Err(SendError::PacketTooLarge {
                len: data.len(),
                max: self.max_payload_len(),
            });
        }

        let header = self.header(sequence);
        let frag_overhead = 1 + PACKET_HEADER_LEN + FRAGMENT_INFO_LEN;
        let mut fragments = Vec::with_capacity(num_fragments);
        for index in 0..num_fragments {
            let start = index * self.fragment_size;
            let end = (start + self.fragment_size).min(data.len());
            let body = &data[start..end];

            let mut buf = BytesMut::with_capacity(frag_overhead + body.len());
            buf.put_u8(MARKER_FRAGMENT);
            header.encode(&mut buf);
            FragmentInfo {
                fragment_index: index as u8,
                fragment_total: num_fragments as u8,
            }
            .encode(&mut buf);
            buf.put_slice(body);
            fragments.push(buf.freeze());
        }

        self.send_sequence = self.send_sequence + 1;
        Ok(SendOutput { sequence, fragments })
    }

    /// Emits a header-only chunk carrying no payload, used to piggyback a
    /// pure ack update when the tick loop has nothing new to coalesce.
    pub fn send_ack(&mut self) -> Bytes {
        let output = self
            .send_packet(&[])
            .expect("an empty packet never exceeds max_packet_size");
        output
            .fragments
            .into_iter()
            .next()
            .expect("send_packet always returns at least one chunk")
    }

    /// Processes one received wire chunk, updating ack and reassembly state.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError`] if the chunk fails to parse, repeats an
    /// already-seen or too-old sequence, or disagrees with an in-progress
    /// reassembly about the packet's total fragment count. It is always safe
    /// for the caller to drop the chunk and continue on error.
    pub fn receive_packet(&mut self, mut buf: Bytes) -> Result<ReceiveOutput, RecvError> {
        if !buf.has_remaining() {
            return Err(RecvError::Header(HeaderError::TooShort));
        }
        let marker = buf.get_u8();
        let header = PacketHeader::decode(&mut buf)?;

        if self.received.exists(header.sequence) {
            return Err(RecvError::Duplicate);
        }
        self.received.insert(header.sequence).ok_or(RecvError::Duplicate)?;

        self.own_ack.ack(header.sequence);
        let newly_acked: Vec<Seq> = header.ack.iter_acked().collect();

        match marker {
            MARKER_SINGLE => Ok(ReceiveOutput {
                sequence: header.sequence,
                reassembled: Some(buf),
                newly_acked,
            }),
            MARKER_FRAGMENT => {
                let info = FragmentInfo::decode(&mut buf).map_err(RecvError::FragmentInfo)?;
                if info.fragment_total == 0 || info.fragment_index >= info.fragment_total {
                    return Err(RecvError::MalformedFragment {
                        index: info.fragment_index,
                        total: info.fragment_total,
                    });
                }

                if self.reassembly.exists(header.sequence) {
                    let entry = self
                        .reassembly
                        .find_mut(header.sequence)
                        .expect("exists() just confirmed this");
                    if entry.num_fragments_total != info.fragment_total {
                        return Err(RecvError::InconsistentFragmentTotal);
                    }
                } else {
                    let fragment_size = self.fragment_size;
                    let entry = self
                        .reassembly
                        .insert(header.sequence)
                        .ok_or(RecvError::Duplicate)?;
                    entry.num_fragments_total = info.fragment_total;
                    entry.num_fragments_received = 0;
                    entry.fragment_size = fragment_size;
                    entry.received = vec![false; usize::from(info.fragment_total)];
                    entry.bytes = vec![0u8; fragment_size * usize::from(info.fragment_total)];
                    entry.total_len = 0;
                }

                let entry = self
                    .reassembly
                    .find_mut(header.sequence)
                    .expect("just inserted or validated above");

                let index = usize::from(info.fragment_index);
                if entry.received[index] {
                    return Err(RecvError::Duplicate);
                }

                let body_len = buf.remaining();
                if body_len > entry.fragment_size {
                    return Err(RecvError::MalformedFragment {
                        index: info.fragment_index,
                        total: info.fragment_total,
                    });
                }
                let offset = index * entry.fragment_size;
                entry.bytes[offset..offset + body_len].copy_from_slice(&buf);
                entry.received[index] = true;
                entry.num_fragments_received += 1;
                if index + 1 == usize::from(info.fragment_total) {
                    entry.total_len = offset + body_len;
                }

                if entry.is_complete() {
                    let total_len = entry.total_len;
                    let mut bytes = std::mem::take(&mut entry.bytes);
                    bytes.truncate(total_len);
                    self.reassembly.remove(header.sequence);
                    Ok(ReceiveOutput {
                        sequence: header.sequence,
                        reassembled: Some(Bytes::from(bytes)),
                        newly_acked,
                    })
                } else {
                    Ok(ReceiveOutput {
                        sequence: header.sequence,
                        reassembled: None,
                        newly_acked,
                    })
                }
            }
            _ => Err(RecvError::Header(HeaderError::TooShort)),
        }
    }
}
