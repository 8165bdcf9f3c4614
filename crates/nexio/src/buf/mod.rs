//! Ring buffer family.
//!
//! `BipBuffer` backs the out direction (committed bytes never move, so an
//! in-flight native send can point into it). `StraightBuffer` backs the in
//! direction (compaction keeps the whole unread region contiguous for
//! framing consumers; safe because at most one recv reservation is ever
//! outstanding).

mod bip;
mod straight;

pub use bip::BipBuffer;
pub use straight::StraightBuffer;
