use std::fmt;
use std::str::FromStr;

use sdp::description::SessionDescription;
use shared::error::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SdpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "pranswer" => Ok(SdpType::Pranswer),
            "answer" => Ok(SdpType::Answer),
            "rollback" => Ok(SdpType::Rollback),
            _ => Err(Error::ErrUnknownSdpType(s.to_string())),
        }
    }
}

/// A session description as exchanged over the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RTCSessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl RTCSessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp,
        }
    }

    pub fn parsed(&self) -> Result<SessionDescription> {
        SessionDescription::parse(&self.sdp)
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StateChangeOp {
    SetLocal,
    SetRemote,
}

/// Validates one signaling transition, RFC 8829 section 4.1.8. Returns
/// the next state or fails without side effects.
pub fn check_next_signaling_state(
    cur: SignalingState,
    op: StateChangeOp,
    sdp_type: SdpType,
) -> Result<SignalingState> {
    let next = match (cur, op, sdp_type) {
        (SignalingState::Stable, StateChangeOp::SetLocal, SdpType::Offer)
        | (SignalingState::HaveLocalOffer, StateChangeOp::SetLocal, SdpType::Offer) => {
            Some(SignalingState::HaveLocalOffer)
        }
        (SignalingState::Stable, StateChangeOp::SetRemote, SdpType::Offer)
        | (SignalingState::HaveRemoteOffer, StateChangeOp::SetRemote, SdpType::Offer) => {
            Some(SignalingState::HaveRemoteOffer)
        }
        (SignalingState::HaveRemoteOffer, StateChangeOp::SetLocal, SdpType::Answer)
        | (SignalingState::HaveLocalPranswer, StateChangeOp::SetLocal, SdpType::Answer) => {
            Some(SignalingState::Stable)
        }
        (SignalingState::HaveLocalOffer, StateChangeOp::SetRemote, SdpType::Answer)
        | (SignalingState::HaveRemotePranswer, StateChangeOp::SetRemote, SdpType::Answer) => {
            Some(SignalingState::Stable)
        }
        (SignalingState::HaveRemoteOffer, StateChangeOp::SetLocal, SdpType::Pranswer)
        | (SignalingState::HaveLocalPranswer, StateChangeOp::SetLocal, SdpType::Pranswer) => {
            Some(SignalingState::HaveLocalPranswer)
        }
        (SignalingState::HaveLocalOffer, StateChangeOp::SetRemote, SdpType::Pranswer)
        | (SignalingState::HaveRemotePranswer, StateChangeOp::SetRemote, SdpType::Pranswer) => {
            Some(SignalingState::HaveRemotePranswer)
        }
        (SignalingState::HaveLocalOffer, StateChangeOp::SetLocal, SdpType::Rollback)
        | (SignalingState::HaveRemoteOffer, StateChangeOp::SetRemote, SdpType::Rollback) => {
            Some(SignalingState::Stable)
        }
        _ => None,
    };
    next.ok_or_else(|| {
        Error::ErrInvalidSignalingStateTransition(format!(
            "{cur} -> {} {sdp_type}",
            match op {
                StateChangeOp::SetLocal => "set_local_description",
                StateChangeOp::SetRemote => "set_remote_description",
            },
        ))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offer_answer_happy_path() {
        let s = check_next_signaling_state(
            SignalingState::Stable,
            StateChangeOp::SetLocal,
            SdpType::Offer,
        )
        .unwrap();
        assert_eq!(s, SignalingState::HaveLocalOffer);

        let s = check_next_signaling_state(s, StateChangeOp::SetRemote, SdpType::Answer).unwrap();
        assert_eq!(s, SignalingState::Stable);
    }

    #[test]
    fn test_remote_offer_local_answer() {
        let s = check_next_signaling_state(
            SignalingState::Stable,
            StateChangeOp::SetRemote,
            SdpType::Offer,
        )
        .unwrap();
        assert_eq!(s, SignalingState::HaveRemoteOffer);

        let s = check_next_signaling_state(s, StateChangeOp::SetLocal, SdpType::Answer).unwrap();
        assert_eq!(s, SignalingState::Stable);
    }

    #[test]
    fn test_pranswer_path() {
        let s = check_next_signaling_state(
            SignalingState::HaveRemoteOffer,
            StateChangeOp::SetLocal,
            SdpType::Pranswer,
        )
        .unwrap();
        assert_eq!(s, SignalingState::HaveLocalPranswer);

        let s = check_next_signaling_state(s, StateChangeOp::SetLocal, SdpType::Answer).unwrap();
        assert_eq!(s, SignalingState::Stable);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        // local answer while stable
        assert!(check_next_signaling_state(
            SignalingState::Stable,
            StateChangeOp::SetLocal,
            SdpType::Answer,
        )
        .is_err());
        // from have-remote-offer, anything but a local answer/pranswer fails
        assert!(check_next_signaling_state(
            SignalingState::HaveRemoteOffer,
            StateChangeOp::SetRemote,
            SdpType::Answer,
        )
        .is_err());
        assert!(check_next_signaling_state(
            SignalingState::HaveRemoteOffer,
            StateChangeOp::SetLocal,
            SdpType::Offer,
        )
        .is_err());
    }

    #[test]
    fn test_rollback() {
        let s = check_next_signaling_state(
            SignalingState::HaveLocalOffer,
            StateChangeOp::SetLocal,
            SdpType::Rollback,
        )
        .unwrap();
        assert_eq!(s, SignalingState::Stable);

        assert!(check_next_signaling_state(
            SignalingState::Stable,
            StateChangeOp::SetLocal,
            SdpType::Rollback,
        )
        .is_err());
    }
}
