#![warn(rust_2018_idioms)]

pub mod header;
pub mod jitter_buffer;
pub mod packet;
pub mod rtcp;
pub mod sequence;
pub mod session;

pub use header::Header;
pub use jitter_buffer::JitterBuffer;
pub use packet::Packet;
pub use sequence::Sequencer;
pub use session::{RtpSession, SessionConfig, SessionEvent};
