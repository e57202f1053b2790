#![warn(rust_2018_idioms)]
//! Sans-I/O WebRTC peer connection: SDP offer/answer negotiation over
//! per-section transport bundles (ICE, DTLS, then SRTP media or
//! SCTP-backed data channels). The caller owns sockets and the clock;
//! the connection exchanges tagged datagrams and deadline callbacks.

pub(crate) mod bundle;
pub mod peer_connection;
pub mod signaling;

pub use peer_connection::{PeerConnection, PeerConnectionConfig, PeerConnectionEvent};
pub use signaling::{RTCSessionDescription, SdpType, SignalingState};

pub use datachannel::{DataChannelConfig, DataChannelPayload};
pub use dtls::Certificate;
pub use ice::{ConnectionState, GatheringState};
pub use sdp::description::MediaKind;
