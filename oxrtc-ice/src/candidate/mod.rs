pub mod candidate_pair;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// ICE candidate type, ordered by type preference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    /// Type preference per RFC 8445 section 5.1.2.2.
    pub fn preference(&self) -> u32 {
        match *self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

/// An ICE candidate: an immutable transport address discovered once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub transport: String,
    pub priority: u32,
    pub address: SocketAddr,
    pub candidate_type: CandidateType,
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    /// Creates a host candidate with the default local preference.
    pub fn host(address: SocketAddr, component: u16) -> Self {
        Self::new(address, component, CandidateType::Host, 65535, None)
    }

    /// Creates a peer-reflexive candidate learned from an inbound check.
    pub fn peer_reflexive(address: SocketAddr, component: u16, priority: u32) -> Self {
        let mut c = Self::new(address, component, CandidateType::PeerReflexive, 65535, None);
        c.priority = priority;
        c
    }

    pub fn new(
        address: SocketAddr,
        component: u16,
        candidate_type: CandidateType,
        local_preference: u32,
        related_address: Option<SocketAddr>,
    ) -> Self {
        let priority = compute_priority(candidate_type, local_preference, component);
        Self {
            foundation: compute_foundation(candidate_type, &address, "udp"),
            component,
            transport: "udp".to_string(),
            priority,
            address,
            candidate_type,
            related_address,
        }
    }

    /// Two candidates are redundant when their transport addresses match.
    pub fn equal(&self, other: &Candidate) -> bool {
        self.address == other.address
            && self.component == other.component
            && self.candidate_type == other.candidate_type
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} typ {}",
            self.foundation, self.component, self.priority, self.address, self.candidate_type
        )
    }
}

/// Candidate priority per RFC 8445 section 5.1.2.1:
/// `(2^24)·type-pref + (2^8)·local-pref + (256 − component)`.
pub fn compute_priority(candidate_type: CandidateType, local_preference: u32, component: u16) -> u32 {
    (1 << 24) * candidate_type.preference()
        + (1 << 8) * local_preference
        + (256 - u32::from(component))
}

/// The foundation groups candidates of one type from one base; it only has
/// to be stable within the agent.
fn compute_foundation(candidate_type: CandidateType, address: &SocketAddr, transport: &str) -> String {
    let mut hasher = DefaultHasher::new();
    candidate_type.preference().hash(&mut hasher);
    address.ip().hash(&mut hasher);
    transport.hash(&mut hasher);
    format!("{}", hasher.finish() >> 32)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_host_priority() {
        let c = Candidate::host(SocketAddr::from_str("10.0.0.1:1234").unwrap(), 1);
        // 126 << 24 | 65535 << 8 | 255
        assert_eq!(c.priority, 2130706431);
    }

    #[test]
    fn test_component_lowers_priority() {
        let rtp = Candidate::host(SocketAddr::from_str("10.0.0.1:1234").unwrap(), 1);
        let rtcp = Candidate::host(SocketAddr::from_str("10.0.0.1:1235").unwrap(), 2);
        assert!(rtp.priority > rtcp.priority);
    }

    #[test]
    fn test_foundation_stable_per_base() {
        let a = Candidate::host(SocketAddr::from_str("10.0.0.1:1234").unwrap(), 1);
        let b = Candidate::host(SocketAddr::from_str("10.0.0.1:5678").unwrap(), 1);
        let c = Candidate::host(SocketAddr::from_str("10.0.0.2:1234").unwrap(), 1);
        assert_eq!(a.foundation, b.foundation);
        assert_ne!(a.foundation, c.foundation);
    }
}
