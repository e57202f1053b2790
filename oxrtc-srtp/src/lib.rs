#![warn(rust_2018_idioms)]
//! SRTP and SRTCP packet protection (RFC 3711) with the one profile DTLS
//! negotiates here: AES-128 counter mode encryption and 80-bit
//! HMAC-SHA1 authentication.

pub mod context;
pub mod key_derivation;

pub use context::Context;
