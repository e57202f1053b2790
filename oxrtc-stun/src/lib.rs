#![warn(rust_2018_idioms)]
//! STUN message codec, RFC 5389 subset used for ICE connectivity checks:
//! Binding requests/responses with XOR-MAPPED-ADDRESS, USERNAME,
//! MESSAGE-INTEGRITY, FINGERPRINT and the ICE attributes of RFC 8445.

pub mod attributes;
pub mod message;

pub use message::{Message, MessageClass, MessageType, TransactionId, METHOD_BINDING};
