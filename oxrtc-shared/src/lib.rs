#![warn(rust_2018_idioms)]

pub mod error;
pub mod marshal;
pub mod replay_detector;
pub mod time;
pub(crate) mod transport;

pub use transport::{FourTuple, TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol};
