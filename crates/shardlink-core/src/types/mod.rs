//! Core types for shardlink.

mod envelope;
mod identifiers;
mod payload;

pub use envelope::*;
pub use identifiers::*;
pub use payload::*;
