//! Emulation core: memory-mapped address-space dispatch, a cycle-stepped 6502, and bus-master
//! DMA and SCSI controllers driven by a virtual-time scheduler.

/// Configuration errors and hardware error codes.
pub mod fault;
pub use fault::{ChannelErrorCode, ConfigError};

/// Virtual time and device clocks.
pub mod timing;
pub use timing::{Clock, Time, PICOS_PER_SECOND};

/// Machine-wide execution context.
pub mod context;
pub use context::{MachineContext, SharedContext, SideEffectsDisabler};

/// Address spaces and handler dispatch.
pub mod memory;
pub use memory::{
    AccessSide, AddressMap, AddressSpace, BusDevice, DataWidth, Endianness, MemoryBank,
    MemoryBlock, Offset, SharedBusDevice, SharedSpace, SpaceCache, SpaceConfig,
};

/// Per-space access counters.
pub mod diag;
pub use diag::SpaceDiagnostics;

/// Device-facing contracts.
pub mod api;
pub use api::{
    drive_line, DeviceStateEntry, ExecuteDevice, InputLine, LineCallback, LineState,
    SnapshotVersion, TraceEvent, TraceSink,
};

/// Timers.
pub mod scheduler;
pub use scheduler::{Scheduler, SharedScheduler, TimerId};

/// Time-slice driver.
pub mod machine;
pub use machine::{Machine, TimerDevice};

/// CPU cores.
pub mod cpu;
pub use cpu::{M6502Config, M6502Snapshot, M6502};

/// DMA controllers.
pub mod dma;
pub use dma::{Hd63450, Hd63450Config};

/// SCSI bus and controllers.
pub mod scsi;
pub use scsi::{Ncr5380, Ncr5380Config, ScsiBus};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
