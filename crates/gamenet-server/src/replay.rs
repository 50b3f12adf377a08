//! See [`ReplayProtection`].

/// Width of the rejection window, in sequences behind the most recent one
/// accepted. Chosen to comfortably cover UDP's usual reordering depth without
/// costing more than one `u128` per client.
const WINDOW_BITS: u64 = 128;

/// Per-client sliding window rejecting replayed or too-old inbound outer
/// packet sequences (`spec.md` §3/§9, "Replay protection").
///
/// Shape follows [`gamenet_proto::Ack`]'s bit-packed acknowledgment window,
/// reinterpreted: instead of recording which sequences *were* received to
/// report upstream, this only ever needs to answer "have I already accepted
/// this one" and "is it too old to consider".
#[derive(Debug, Clone)]
pub struct ReplayProtection {
    most_recent: u64,
    /// Bit `n` set means sequence `most_recent - n` has already been
    /// accepted. Bit 0 only means anything once at least one sequence has
    /// been accepted (tracked via `has_accepted`).
    window: u128,
    has_accepted: bool,
}

impl ReplayProtection {
    /// Creates an empty window that has not yet accepted anything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            most_recent: 0,
            window: 0,
            has_accepted: false,
        }
    }

    /// Checks whether `seq` is new, and if so, records it as accepted.
    ///
    /// Returns `false` (reject) if `seq` has already been seen, or if it is
    /// older than `most_recent - WINDOW_BITS`.
    pub fn check_and_update(&mut self, seq: u64) -> bool {
        if !self.has_accepted {
            self.has_accepted = true;
            self.most_recent = seq;
            self.window = 1;
            return true;
        }

        if seq > self.most_recent {
            let shift = seq - self.most_recent;
            self.window = if shift >= WINDOW_BITS { 0 } else { self.window << shift };
            self.most_recent = seq;
            self.window |= 1;
            true
        } else {
            let back = self.most_recent - seq;
            if back >= WINDOW_BITS {
                return false;
            }
            let bit = 1u128 << back;
            if self.window & bit != 0 {
                false
            } else {
                self.window |= bit;
                true
            }
        }
    }
}

impl Default for ReplayProtection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_strictly_ascending_sequences() {
        let mut rp = ReplayProtection::new();
        for seq in 0..10 {
            assert!(rp.check_and_update(seq));
        }
    }

    #[test]
    fn rejects_exact_duplicate() {
        let mut rp = ReplayProtection::new();
        assert!(rp.check_and_update(5));
        assert!(!rp.check_and_update(5));
    }

    #[test]
    fn accepts_reordered_within_window() {
        let mut rp = ReplayProtection::new();
        assert!(rp.check_and_update(10));
        assert!(rp.check_and_update(9));
        assert!(!rp.check_and_update(9));
        assert!(rp.check_and_update(8));
    }

    #[test]
    fn rejects_sequence_older_than_window() {
        let mut rp = ReplayProtection::new();
        assert!(rp.check_and_update(200));
        assert!(!rp.check_and_update(200 - WINDOW_BITS));
    }

    #[test]
    fn advancing_past_window_clears_old_bits() {
        let mut rp = ReplayProtection::new();
        assert!(rp.check_and_update(0));
        assert!(rp.check_and_update(1000));
        // 0 is now far outside the window; re-delivering it must be rejected
        // as too old, not accepted as "never seen".
        assert!(!rp.check_and_update(0));
    }
}
