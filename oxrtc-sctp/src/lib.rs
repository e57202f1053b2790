#![warn(rust_2018_idioms)]
//! Sans-I/O SCTP association (RFC 4960 with RFC 3758 partial
//! reliability), scoped to the single-homed, DTLS-encapsulated shape
//! WebRTC data channels use. The association exchanges whole datagrams
//! with the DTLS transport; it owns no sockets and reads no clocks.

pub mod association;
pub mod chunk;
pub mod packet;

pub use association::{
    Association, AssociationConfig, AssociationEvent, AssociationState, ReliabilityPolicy,
};
