use serde::Serialize;
use std::fmt;

/// Check state of a candidate pair.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    /// A check has not been performed for this pair yet.
    #[default]
    #[serde(rename = "waiting")]
    Waiting,

    /// A check has been sent but the transaction is still in progress.
    #[serde(rename = "in-progress")]
    InProgress,

    /// Every check for this pair timed out or produced an error response.
    #[serde(rename = "failed")]
    Failed,

    /// A check for this pair produced a valid response.
    #[serde(rename = "succeeded")]
    Succeeded,
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        };
        write!(f, "{s}")
    }
}

/// A combination of a local and a remote candidate, indexed into the
/// agent's candidate vectors. Pairs are created once and never removed,
/// only re-sorted or marked failed.
#[derive(Clone, Copy)]
pub struct CandidatePair {
    pub local_index: usize,
    pub remote_index: usize,
    pub local_priority: u32,
    pub remote_priority: u32,
    pub(crate) ice_role_controlling: bool,
    pub(crate) binding_request_count: u16,
    pub(crate) state: CandidatePairState,
    pub(crate) nominated: bool,
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local {} prio {}) <-> (remote {} prio {}) [{}]",
            self.priority(),
            self.local_index,
            self.local_priority,
            self.remote_index,
            self.remote_priority,
            self.state,
        )
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.local_index == other.local_index && self.remote_index == other.remote_index
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(
        local_index: usize,
        remote_index: usize,
        local_priority: u32,
        remote_priority: u32,
        ice_role_controlling: bool,
    ) -> Self {
        Self {
            local_index,
            remote_index,
            local_priority,
            remote_priority,
            ice_role_controlling,
            state: CandidatePairState::Waiting,
            binding_request_count: 0,
            nominated: false,
        }
    }

    pub fn state(&self) -> CandidatePairState {
        self.state
    }

    pub fn nominated(&self) -> bool {
        self.nominated
    }

    /// RFC 8445 section 6.1.2.3: let G be the controlling side's candidate
    /// priority and D the controlled side's;
    /// `pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)`.
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.ice_role_controlling {
            (self.local_priority, self.remote_priority)
        } else {
            (self.remote_priority, self.local_priority)
        };

        (1u64 << 32) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_priority_is_pure_and_deterministic() {
        let pair = CandidatePair::new(0, 0, 2130706431, 2130706175, true);
        let first = pair.priority();
        for _ in 0..16 {
            assert_eq!(CandidatePair::new(0, 0, 2130706431, 2130706175, true).priority(), first);
        }
    }

    #[test]
    fn test_priority_symmetric_across_roles() {
        // both agents must compute the same priority for the same pair
        let controlling = CandidatePair::new(0, 0, 100, 200, true);
        let controlled = CandidatePair::new(0, 0, 200, 100, false);
        assert_eq!(controlling.priority(), controlled.priority());
    }

    #[test]
    fn test_priority_formula_exact() {
        let pair = CandidatePair::new(0, 0, 100, 200, true);
        assert_eq!((1u64 << 32) * 100 + 2 * 200, pair.priority());

        // min distinguishes pairs even when max does not
        let high = CandidatePair::new(0, 0, 0x8000_0001, 0x8000_0002, true);
        let low = CandidatePair::new(0, 0, 0x8000_0000, 0x8000_0002, true);
        assert!(high.priority() > low.priority());
        assert_eq!(
            (1u64 << 32) * 0x8000_0001 + 2 * 0x8000_0002,
            high.priority()
        );
    }

    #[test]
    fn test_controlling_side_breaks_ties() {
        let a = CandidatePair::new(0, 0, 200, 100, true);
        let b = CandidatePair::new(0, 0, 100, 200, true);
        assert_eq!(a.priority(), b.priority() + 1);
    }
}
