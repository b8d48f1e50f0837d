//! Bus-master DMA controllers.

/// Hitachi HD63450.
pub mod hd63450;

pub use hd63450::{
    ChannelRegisters, ChannelState, Hd63450, Hd63450Config, Hd63450Snapshot, OperationSize,
};
