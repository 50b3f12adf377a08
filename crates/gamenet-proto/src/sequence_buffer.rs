//! See [`SequenceBuffer`].
//!
//! The data structure here is the fixed-size "sequence buffer" described by
//! *Gaffer On Games*: a ring of `N` slots addressed by a 16-bit sequence
//! number, where each slot is tagged with the full sequence number it holds
//! so that stale data left over from a previous lap around the ring can be
//! told apart from a genuine hit. This is the structure the teacher's own
//! `frag` module documents and then deliberately moves away from (in favour
//! of an unbounded map) to avoid the fixed buffer's bounded-capacity failure
//! mode; we keep the fixed form, since bounded memory per client is a
//! requirement here, not a drawback.
//!
//! See <https://gafferongames.com/post/reliable_ordered_messages/#sequence-buffers>.

/// Tag value meaning "this slot holds no entry". Distinct from any value a
/// 16-bit sequence number can take once widened to `u32`.
const NULL_SEQUENCE: u32 = 0xFFFF_FFFF;

use crate::seq::Seq;

/// Fixed-size ring buffer keyed by 16-bit sequence number.
///
/// Used for three purposes in this crate, all sharing the same indexing and
/// staleness rules: tracking metadata about sent packets awaiting ack
/// (`SequenceBuffer<SentEntry>`), tracking which sequences have been received
/// (`SequenceBuffer<()>`), and buffering in-progress fragment reassembly
/// (`SequenceBuffer<ReassemblyEntry>`).
#[derive(Debug, Clone)]
pub struct SequenceBuffer<T> {
    size: u16,
    /// One past the most recent sequence number ever successfully inserted
    /// ("high-water mark"). Starts at `Seq(0)`, meaning nothing has been
    /// inserted yet.
    high_water: Seq,
    tags: Vec<u32>,
    entries: Vec<T>,
}

impl<T: Default + Clone> SequenceBuffer<T> {
    /// Creates a buffer with `size` slots. `size` need not be a power of two.
    #[must_use]
    pub fn new(size: u16) -> Self {
        assert!(size > 0, "sequence buffer must have at least one slot");
        Self {
            size,
            high_water: Seq(0),
            tags: vec![NULL_SEQUENCE; size as usize],
            entries: vec![T::default(); size as usize],
        }
    }

    /// Number of slots in this ring.
    #[must_use]
    pub const fn size(&self) -> u16 {
        self.size
    }

    /// Most recent sequence number that was successfully inserted.
    #[must_use]
    pub fn newest(&self) -> Seq {
        self.high_water - 1
    }

    fn index(&self, seq: Seq) -> usize {
        (seq.0 % self.size) as usize
    }

    /// Whether `seq` currently occupies its slot.
    #[must_use]
    pub fn exists(&self, seq: Seq) -> bool {
        self.tags[self.index(seq)] == u32::from(seq.0)
    }

    /// Looks up the entry stored for `seq`, if present.
    #[must_use]
    pub fn find(&self, seq: Seq) -> Option<&T> {
        self.exists(seq).then(|| &self.entries[self.index(seq)])
    }

    /// Mutable version of [`SequenceBuffer::find`].
    pub fn find_mut(&mut self, seq: Seq) -> Option<&mut T> {
        if self.exists(seq) {
            let index = self.index(seq);
            Some(&mut self.entries[index])
        } else {
            None
        }
    }

    /// Inserts a fresh, default-valued entry for `seq` and returns it for the
    /// caller to populate.
    ///
    /// Returns [`None`] if `seq` is older than `newest() - size`, i.e. too far
    /// in the past to fit in the window any more. Otherwise, if `seq` is at
    /// or beyond the current high-water mark, every slot strictly between the
    /// old high-water mark and `seq` (inclusive, wrapping-aware) is cleared
    /// first, so that a later [`SequenceBuffer::exists`] on a skipped
    /// sequence correctly reports absence instead of stale data.
    pub fn insert(&mut self, seq: Seq) -> Option<&mut T> {
        let oldest_allowed = self.high_water - self.size;
        if seq < oldest_allowed {
            return None;
        }

        if seq + 1 > self.high_water {
            self.remove_entries(self.high_water, seq);
            self.high_water = seq + 1;
        }

        let index = self.index(seq);
        self.tags[index] = u32::from(seq.0);
        self.entries[index] = T::default();
        Some(&mut self.entries[index])
    }

    /// Clears the slot for `seq`, if present, returning the entry that was
    /// stored there.
    pub fn remove(&mut self, seq: Seq) -> Option<T> {
        if self.exists(seq) {
            let index = self.index(seq);
            self.tags[index] = NULL_SEQUENCE;
            Some(std::mem::take(&mut self.entries[index]))
        } else {
            None
        }
    }

    /// Clears slots `[start, finish]` inclusive (wrapping-aware). If the span
    /// is at least as large as the buffer, every slot is cleared instead of
    /// iterating the (possibly huge) wrapping range.
    fn remove_entries(&mut self, start: Seq, finish: Seq) {
        let span = u32::from(finish.0.wrapping_sub(start.0));
        if span < u32::from(self.size) {
            let mut seq = start;
            loop {
                let index = self.index(seq);
                self.tags[index] = NULL_SEQUENCE;
                self.entries[index] = T::default();
                if seq == finish {
                    break;
                }
                seq = seq + 1;
            }
        } else {
            for tag in &mut self.tags {
                *tag = NULL_SEQUENCE;
            }
            for entry in &mut self.entries {
                *entry = T::default();
            }
        }
    }
}

/// Per-sent-fragment bookkeeping: used by the "sent" specialization of
/// [`SequenceBuffer`] to decide whether and when to retransmit.
#[derive(Debug, Clone, Default)]
pub struct SentEntry {
    /// `now` (ms) at which this fragment was last written to the wire.
    pub time_ms: u64,
    /// Set once this fragment has been acknowledged, so a concurrent
    /// retransmission scan does not resend it out from under an in-flight
    /// ack.
    pub write_locked: bool,
    /// The fragment body as last sent, kept around for retransmission.
    pub data: Vec<u8>,
}

/// "Sent" specialization: per-outgoing-fragment metadata for ack tracking and
/// retransmission.
pub type SentBuffer = SequenceBuffer<SentEntry>;

/// "Received" specialization: presence alone is meaningful, used for
/// duplicate/replay rejection of fragment and unreliable-message sequences.
pub type ReceivedBuffer = SequenceBuffer<()>;

/// Per-in-progress-reassembly state: used by the "reassembly" specialization
/// of [`SequenceBuffer`].
///
/// Fragment 0's header has already been stripped by the time a fragment body
/// reaches this buffer, so there is no separate header-offset field - `bytes`
/// holds only fragment payloads, packed contiguously by fragment index.
#[derive(Debug, Clone, Default)]
pub struct ReassemblyEntry {
    /// Number of fragments this packet was split into. `0` until the
    /// fragment carrying the header (fragment 0) has arrived.
    pub num_fragments_total: u8,
    /// Number of distinct fragments received so far.
    pub num_fragments_received: u8,
    /// `received[i]` is set once fragment `i` has been copied into `bytes`.
    pub received: Vec<bool>,
    /// Per-fragment length, needed because fragments other than the last may
    /// be smaller at the tail of the message.
    pub fragment_size: usize,
    /// Concatenated fragment payloads, pre-sized to `num_fragments_total *
    /// fragment_size` as soon as the first fragment of this packet arrives.
    /// The tail end is padding until `total_len` is known.
    // TODO: this buffer is reallocated per in-progress message; pooling
    // allocations across `ReassemblyEntry`s would cut churn under load.
    pub bytes: Vec<u8>,
    /// Actual length of the reassembled packet, known once the last fragment
    /// (whose body is typically shorter than `fragment_size`) has arrived.
    pub total_len: usize,
}

impl ReassemblyEntry {
    /// Whether every fragment of this packet has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.num_fragments_total != 0
            && self.num_fragments_received == self.num_fragments_total
    }
}

/// "Reassembly" specialization: per-fragment receive state for multi-fragment
/// packets in flight.
pub type ReassemblyBuffer = SequenceBuffer<ReassemblyEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find() {
        let mut buf: SequenceBuffer<u32> = SequenceBuffer::new(8);
        *buf.insert(Seq(0)).unwrap() = 111;
        assert_eq!(buf.find(Seq(0)), Some(&111));
        assert!(buf.exists(Seq(0)));
        assert!(!buf.exists(Seq(1)));
    }

    #[test]
    fn insert_advances_high_water_and_clears_skipped() {
        let mut buf: SequenceBuffer<u32> = SequenceBuffer::new(4);
        *buf.insert(Seq(0)).unwrap() = 1;
        // skip 1, 2 - inserting 3 should clear slots for 1 and 2 (and 0's
        // slot is untouched since 0 < 1).
        buf.insert(Seq(3));
        assert!(buf.exists(Seq(0)));
        assert!(!buf.exists(Seq(1)));
        assert!(!buf.exists(Seq(2)));
        assert!(buf.exists(Seq(3)));
    }

    #[test]
    fn insert_rejects_too_old() {
        let mut buf: SequenceBuffer<u32> = SequenceBuffer::new(4);
        buf.insert(Seq(100));
        // 100 - 4 = 96 is the oldest allowed; 50 is far older.
        assert!(buf.insert(Seq(50)).is_none());
        assert!(buf.insert(Seq(97)).is_some());
    }

    #[test]
    fn remove_clears_slot() {
        let mut buf: SequenceBuffer<u32> = SequenceBuffer::new(4);
        buf.insert(Seq(0));
        assert!(buf.exists(Seq(0)));
        buf.remove(Seq(0));
        assert!(!buf.exists(Seq(0)));
    }

    #[test]
    fn wraps_across_u16_boundary() {
        // Sequence numbers are only ever compared when they are assumed to be
        // "close" (within half the u16 range), so a buffer is only ever
        // driven by ascending inserts from its initial `Seq(0)`, the same way
        // a real outgoing packet counter starts at 0 and counts up. Drive it
        // all the way across the wraparound point to exercise that codepath.
        let mut buf: SequenceBuffer<u32> = SequenceBuffer::new(4);
        // Ascend all the way to u16::MAX, then one step further to wrap to 0.
        for i in 0..=u32::from(u16::MAX) + 1 {
            buf.insert(Seq((i % 65536) as u16));
        }
        assert!(buf.exists(Seq(u16::MAX)));
        assert!(buf.exists(Seq(0)));
        assert!(buf.exists(Seq(u16::MAX - 2)));
        assert!(!buf.exists(Seq(u16::MAX - 3)));
    }
}
