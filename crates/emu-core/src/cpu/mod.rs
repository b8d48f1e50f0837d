//! CPU cores.

/// NMOS 6502.
pub mod m6502;

pub use m6502::{M6502Config, M6502Memory, M6502Snapshot, SpaceInterface, M6502};
