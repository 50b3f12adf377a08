//! See [`Ack`].

use crate::seq::Seq;

/// Compactly represents acknowledgement of the 32 packet sequences up to and
/// including `ack`.
///
/// If bit `N` of `ack_bits` is set, then sequence `ack - N` has been
/// acknowledged. Bit 0 is only meaningful if `ack` itself has actually been
/// acknowledged - unlike the other 31 bits, it is not implied by `ack` being
/// the most recently received sequence.
///
/// See <https://gafferongames.com/post/reliable_ordered_messages/#packet-levelacks>.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack {
    /// Most recently received sequence number.
    pub ack: Seq,
    /// Bitfield of which of the 32 sequences before (and including) `ack`
    /// have been received.
    pub ack_bits: u32,
}

impl Ack {
    /// Creates an empty ack record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `seq` as received, updating `ack`/`ack_bits` as needed.
    pub fn ack(&mut self, seq: Seq) {
        let delta = self.ack.dist_to(seq);
        if delta > 0 {
            // `seq` is newer than our current high-water mark: it becomes the
            // new `ack`, and the bitfield shifts to make room for it.
            #[allow(clippy::cast_sign_loss)]
            let shift = delta as u32;
            self.ack_bits = if shift >= 32 { 0 } else { self.ack_bits << shift };
            self.ack = seq;
            self.ack_bits |= 1;
        } else {
            #[allow(clippy::cast_sign_loss)]
            let back = (-delta) as u32;
            if back < 32 {
                self.ack_bits |= 1u32 << back;
            }
            // older than 32 sequences behind `ack`: silently ignored, same as
            // `SequenceBuffer::insert` dropping out-of-range sequences.
        }
    }

    /// Whether `seq` has been acknowledged according to this record.
    #[must_use]
    pub fn is_acked(&self, seq: Seq) -> bool {
        let delta = self.ack.dist_to(seq);
        if delta > 0 {
            false
        } else {
            #[allow(clippy::cast_sign_loss)]
            let back = (-delta) as u32;
            back < 32 && (self.ack_bits & (1u32 << back)) != 0
        }
    }

    /// Iterates every sequence this record marks as acknowledged, most recent
    /// first.
    pub fn iter_acked(self) -> impl Iterator<Item = Seq> {
        (0..32).filter_map(move |bit| {
            if self.ack_bits & (1 << bit) == 0 {
                None
            } else {
                Some(self.ack - bit)
            }
        })
    }
}
