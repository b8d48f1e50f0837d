//! Status flags, configuration, state-register indices and the save-state record.

use crate::api::SnapshotVersion;

/// Carry.
pub const FLAG_C: u8 = 0x01;
/// Zero.
pub const FLAG_Z: u8 = 0x02;
/// Interrupt disable.
pub const FLAG_I: u8 = 0x04;
/// Decimal mode.
pub const FLAG_D: u8 = 0x08;
/// Break; only meaningful in the copy pushed on the stack.
pub const FLAG_B: u8 = 0x10;
/// Unused bit, always reads as one.
pub const FLAG_E: u8 = 0x20;
/// Overflow.
pub const FLAG_V: u8 = 0x40;
/// Negative.
pub const FLAG_N: u8 = 0x80;

/// Input line: maskable interrupt, level triggered.
pub const M6502_IRQ_LINE: u32 = 0;
/// Input line: set-overflow pin, a rising edge sets V.
pub const M6502_SET_OVERFLOW_LINE: u32 = 10;

/// State-register index of PC.
pub const M6502_PC: u32 = 1;
/// State-register index of A.
pub const M6502_A: u32 = 2;
/// State-register index of X.
pub const M6502_X: u32 = 3;
/// State-register index of Y.
pub const M6502_Y: u32 = 4;
/// State-register index of P.
pub const M6502_P: u32 = 5;
/// State-register index of SP.
pub const M6502_S: u32 = 6;
/// State-register index of IR.
pub const M6502_IR: u32 = 7;

/// Construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct M6502Config {
    /// Device tag used in diagnostics.
    pub tag: String,
    /// Input clock in Hz; one bus cycle per clock.
    pub clock_hz: u32,
    /// Fetch opcodes and operands through [`crate::memory::SpaceCache`] instead of full dispatch.
    pub use_cache: bool,
}

impl Default for M6502Config {
    fn default() -> Self {
        Self {
            tag: "maincpu".to_owned(),
            clock_hz: 1_000_000,
            use_cache: true,
        }
    }
}

/// Where the core is inside its microcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MicroStage {
    /// Running the reset sequence.
    Reset,
    /// Computing the effective address of a memory operand.
    Address,
    /// Running the operation cycles of the current opcode.
    Operate,
}

/// Every field that survives a save/restore cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[allow(clippy::struct_excessive_bools)]
pub struct M6502Snapshot {
    /// Schema version.
    pub version: SnapshotVersion,
    /// Fetch address.
    pub pc: u16,
    /// Address of the instruction now executing.
    pub ppc: u16,
    /// Accumulator.
    pub a: u8,
    /// X index.
    pub x: u8,
    /// Y index.
    pub y: u8,
    /// Status register.
    pub p: u8,
    /// Stack pointer low byte; the stack lives in page one.
    pub sp: u8,
    /// Current opcode.
    pub ir: u8,
    /// Effective-address latch.
    pub tmp: u16,
    /// Data latch.
    pub tmp2: u8,
    /// Microcode stage.
    pub stage: MicroStage,
    /// Cycle index within the stage.
    pub step: u8,
    /// The opcode fetch was replaced by an interrupt sequence.
    pub irq_taken: bool,
    /// Interrupt sampling is suppressed.
    pub inhibit_interrupts: bool,
    /// NMI input level.
    pub nmi_level: bool,
    /// Latched NMI edge.
    pub nmi_pending: bool,
    /// IRQ input level.
    pub irq_level: bool,
    /// Set-overflow input level.
    pub so_level: bool,
    /// SYNC output, high during opcode fetch cycles.
    pub sync: bool,
    /// Total cycles executed.
    pub total_cycles: u64,
}
