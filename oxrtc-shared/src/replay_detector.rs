/// Sliding-window replay detection over a 64-bit index space.
///
/// `check` tests whether an index would be accepted; `accept` commits the
/// last checked index. The two-phase shape lets callers verify an auth tag
/// between the two calls so forged packets never advance the window.
pub struct SlidingWindowDetector {
    latest: u64,
    mask: u128,
    window_size: u64,
    checked: Option<u64>,
}

impl SlidingWindowDetector {
    pub fn new(window_size: u64) -> Self {
        assert!(window_size > 0 && window_size <= 128);
        Self {
            latest: 0,
            mask: 0,
            window_size,
            checked: None,
        }
    }

    /// Returns true if `seq` is new, i.e. neither older than the window
    /// nor already seen.
    pub fn check(&mut self, seq: u64) -> bool {
        self.checked = None;

        if seq <= self.latest {
            let delta = self.latest - seq;
            if delta >= self.window_size {
                return false;
            }
            if self.mask & (1u128 << delta) != 0 {
                return false;
            }
        }
        self.checked = Some(seq);
        true
    }

    /// Commits the index passed to the last successful `check`.
    pub fn accept(&mut self) {
        let seq = match self.checked.take() {
            Some(seq) => seq,
            None => return,
        };

        if seq > self.latest {
            let delta = seq - self.latest;
            if delta >= 128 {
                self.mask = 0;
            } else {
                self.mask <<= delta;
            }
            self.latest = seq;
            self.mask |= 1;
        } else {
            self.mask |= 1u128 << (self.latest - seq);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accepts_fresh_and_rejects_replay() {
        let mut d = SlidingWindowDetector::new(64);
        for seq in [1u64, 2, 3, 5, 4] {
            assert!(d.check(seq), "seq {seq} should be fresh");
            d.accept();
        }
        for seq in [1u64, 3, 5] {
            assert!(!d.check(seq), "seq {seq} should be a replay");
        }
        assert!(d.check(6));
        d.accept();
    }

    #[test]
    fn test_rejects_older_than_window() {
        let mut d = SlidingWindowDetector::new(64);
        assert!(d.check(1000));
        d.accept();
        assert!(!d.check(1000 - 64));
        assert!(d.check(1000 - 63));
    }

    #[test]
    fn test_check_without_accept_does_not_advance() {
        let mut d = SlidingWindowDetector::new(64);
        assert!(d.check(10));
        // no accept: a forged packet failed auth
        assert!(d.check(10));
        d.accept();
        assert!(!d.check(10));
    }
}
