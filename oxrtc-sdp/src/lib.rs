#![warn(rust_2018_idioms)]
//! SDP session description model.
//!
//! Parsing is tolerant of attribute ordering inside a section but strict
//! about the `m=`, `c=` and `a=candidate` grammars. Attributes the model
//! does not know are preserved opaquely so an unmodified description
//! round-trips byte-stable.

pub mod attribute;
pub mod description;

pub use attribute::{Attribute, CandidateAttribute, CandidateKind, Direction, SetupRole};
pub use description::{MediaDescription, MediaKind, SessionDescription};
