#![warn(rust_2018_idioms)]
//! Sans-I/O ICE agent, RFC 8445 model: candidate gathering, pairing,
//! connectivity checks over STUN, aggressive nomination and path
//! maintenance. The embedder owns the sockets; the agent consumes tagged
//! datagrams and emits tagged transmits.

pub mod agent;
pub mod candidate;
pub mod state;

pub use agent::{Agent, AgentConfig, IceEvent};
pub use candidate::candidate_pair::{CandidatePair, CandidatePairState};
pub use candidate::{Candidate, CandidateType};
pub use state::{ConnectionState, GatheringState};

/// Generates a random ICE character string of the given length.
pub(crate) fn random_ice_string(len: usize) -> String {
    use rand::Rng;
    const ICE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ICE_CHARS[rng.random_range(0..ICE_CHARS.len())] as char)
        .collect()
}

/// Generates a local username fragment (8 chars, 48 bits).
pub fn generate_ufrag() -> String {
    random_ice_string(8)
}

/// Generates a local password (24 chars, 144 bits).
pub fn generate_pwd() -> String {
    random_ice_string(24)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_lengths() {
        assert_eq!(8, generate_ufrag().len());
        assert_eq!(24, generate_pwd().len());
    }
}
