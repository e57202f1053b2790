#![warn(rust_2018_idioms)]
//! Sans-I/O DTLS 1.2 endpoint, scoped to what WebRTC transports need: an
//! ECDHE handshake authenticated by certificate fingerprints from
//! signaling, AES-128-GCM record protection, SRTP keying material export
//! (RFC 5705 / RFC 5764) and application data for SCTP.

pub mod crypto;
pub mod endpoint;
pub mod handshake;
pub mod record;

pub use crypto::{Certificate, SrtpKeyingMaterial};
pub use endpoint::{DtlsConfig, DtlsEndpoint, DtlsEvent, DtlsRole, HandshakeState};
