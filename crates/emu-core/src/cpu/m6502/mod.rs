//! MOS Technology 6502, original NMOS variant.
//!
//! The core is cycle stepped: every call to the microcode engine performs exactly one bus
//! access and charges one cycle, so `execute_run` can stop on any cycle boundary and resume at
//! the same micro-step on the next call. As on the real part, the opcode fetch of the next
//! instruction is the last cycle of the current one; interrupts are sampled at that fetch.

/// Flag-exact arithmetic.
pub mod alu;
/// Text disassembly.
pub mod disasm;
/// Memory trampolines.
pub mod interface;
mod micro;
/// Flags, configuration and save state.
pub mod state;
/// Opcode decode table.
pub mod table;

pub use disasm::{disassemble, disassemble_window, DisassemblyRow};
pub use interface::{FlatMemory, M6502Memory, SpaceInterface};
pub use state::{
    M6502Config, M6502Snapshot, MicroStage, FLAG_B, FLAG_C, FLAG_D, FLAG_E, FLAG_I, FLAG_N,
    FLAG_V, FLAG_Z, M6502_A, M6502_IR, M6502_IRQ_LINE, M6502_P, M6502_PC, M6502_S,
    M6502_SET_OVERFLOW_LINE, M6502_X, M6502_Y,
};
pub use table::{opcode_info, Access, Mnemonic, Mode, OpcodeInfo, OPCODE_TABLE};

use crate::api::{
    DeviceStateEntry, ExecuteDevice, InputLine, LineCallback, LineState, SnapshotVersion,
    TraceSink, INPUT_LINE_HALT, INPUT_LINE_NMI, INPUT_LINE_RESET,
};
use crate::context::SharedContext;
use crate::fault::ConfigError;
use crate::memory::SharedSpace;
use crate::timing::Clock;

const LOG_TARGET: &str = "emu_core::m6502";

/// A 6502 bound to a memory interface.
pub struct M6502<M: M6502Memory> {
    config: M6502Config,
    clock: Clock,
    ctx: SharedContext,
    memory: M,
    pc: u16,
    ppc: u16,
    a: u8,
    x: u8,
    y: u8,
    p: u8,
    sp: u8,
    ir: u8,
    tmp: u16,
    tmp2: u8,
    stage: MicroStage,
    step: u8,
    irq_taken: bool,
    inhibit_interrupts: bool,
    icount: i32,
    total_cycles: u64,
    sync: bool,
    irq: InputLine,
    nmi: InputLine,
    so: InputLine,
    halt: InputLine,
    sync_output: Option<LineCallback>,
    trace: Option<Box<dyn TraceSink>>,
}

impl<M: M6502Memory> core::fmt::Debug for M6502<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("M6502")
            .field("tag", &self.config.tag)
            .field("pc", &self.pc)
            .field("a", &self.a)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("p", &self.p)
            .field("sp", &self.sp)
            .field("stage", &self.stage)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl M6502<SpaceInterface> {
    /// Builds a core that fetches through address spaces.
    ///
    /// # Errors
    ///
    /// [`ConfigError::IncompatibleSpace`] when a space does not have the 6502 bus geometry.
    pub fn with_spaces(
        config: M6502Config,
        ctx: SharedContext,
        program: SharedSpace,
        opcodes: Option<SharedSpace>,
    ) -> Result<Self, ConfigError> {
        let memory = SpaceInterface::new(&config.tag, program, opcodes, config.use_cache)?;
        Ok(Self::new(config, ctx, memory))
    }
}

impl<M: M6502Memory> M6502<M> {
    /// Creates a core in its power-on state; the reset sequence runs on the first cycle.
    #[must_use]
    pub fn new(config: M6502Config, ctx: SharedContext, memory: M) -> Self {
        let clock = Clock::new(config.clock_hz);
        Self {
            config,
            clock,
            ctx,
            memory,
            pc: 0x0000,
            ppc: 0x0000,
            a: 0x00,
            x: 0x80,
            y: 0x00,
            p: 0x36,
            sp: 0x00,
            ir: 0x00,
            tmp: 0x0000,
            tmp2: 0x00,
            stage: MicroStage::Reset,
            step: 0,
            irq_taken: false,
            inhibit_interrupts: false,
            icount: 0,
            total_cycles: 0,
            sync: false,
            irq: InputLine::new(),
            nmi: InputLine::new(),
            so: InputLine::new(),
            halt: InputLine::new(),
            sync_output: None,
            trace: None,
        }
    }

    /// Configuration the core was built with.
    #[must_use]
    pub const fn config(&self) -> &M6502Config {
        &self.config
    }

    /// Memory interface.
    #[must_use]
    pub const fn memory(&self) -> &M {
        &self.memory
    }

    /// Mutable memory interface.
    pub const fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Next fetch address.
    #[must_use]
    pub const fn pc(&self) -> u16 {
        self.pc
    }

    /// Address of the instruction now executing.
    #[must_use]
    pub const fn ppc(&self) -> u16 {
        self.ppc
    }

    /// Accumulator.
    #[must_use]
    pub const fn a(&self) -> u8 {
        self.a
    }

    /// X index.
    #[must_use]
    pub const fn x(&self) -> u8 {
        self.x
    }

    /// Y index.
    #[must_use]
    pub const fn y(&self) -> u8 {
        self.y
    }

    /// Status register.
    #[must_use]
    pub const fn p(&self) -> u8 {
        self.p
    }

    /// Stack pointer low byte.
    #[must_use]
    pub const fn sp(&self) -> u8 {
        self.sp
    }

    /// Current opcode.
    #[must_use]
    pub const fn ir(&self) -> u8 {
        self.ir
    }

    /// Microcode position.
    #[must_use]
    pub const fn micro_position(&self) -> (MicroStage, u8) {
        (self.stage, self.step)
    }

    /// Total cycles executed since construction.
    #[must_use]
    pub const fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Level of the SYNC output; high only during opcode fetches.
    #[must_use]
    pub const fn sync(&self) -> bool {
        self.sync
    }

    /// IRQ input.
    #[must_use]
    pub const fn irq_line(&self) -> &InputLine {
        &self.irq
    }

    /// NMI input.
    #[must_use]
    pub const fn nmi_line(&self) -> &InputLine {
        &self.nmi
    }

    /// Set-overflow input.
    #[must_use]
    pub const fn so_line(&self) -> &InputLine {
        &self.so
    }

    /// Halt input; while asserted the core does not execute.
    #[must_use]
    pub const fn halt_line(&self) -> &InputLine {
        &self.halt
    }

    /// Wires the SYNC output.
    pub fn set_sync_callback(&mut self, callback: LineCallback) {
        self.sync_output = Some(callback);
    }

    /// Attaches a trace sink, replacing any previous one.
    pub fn attach_trace(&mut self, sink: Box<dyn TraceSink>) {
        self.trace = Some(sink);
    }

    /// Detaches and returns the trace sink.
    pub fn detach_trace(&mut self) -> Option<Box<dyn TraceSink>> {
        self.trace.take()
    }

    /// Returns architectural state to the start of the reset sequence.
    pub fn reset(&mut self) {
        self.stage = MicroStage::Reset;
        self.step = 0;
        self.irq_taken = false;
        self.inhibit_interrupts = false;
        self.nmi.clear_edge();
        self.set_sync(false);
    }

    /// Status register as `NV.DIZC`-style text.
    #[must_use]
    pub fn flags_string(&self) -> String {
        [
            (FLAG_N, 'N'),
            (FLAG_V, 'V'),
            (FLAG_D, 'D'),
            (FLAG_I, 'I'),
            (FLAG_Z, 'Z'),
            (FLAG_C, 'C'),
        ]
        .iter()
        .map(|&(flag, name)| if self.p & flag != 0 { name } else { '.' })
        .collect()
    }

    /// Named registers for debugger display.
    #[must_use]
    pub fn state_entries(&self) -> Vec<DeviceStateEntry> {
        vec![
            DeviceStateEntry {
                index: M6502_PC,
                name: "PC",
                value: u64::from(self.ppc),
                bits: 16,
            },
            DeviceStateEntry {
                index: M6502_A,
                name: "A",
                value: u64::from(self.a),
                bits: 8,
            },
            DeviceStateEntry {
                index: M6502_X,
                name: "X",
                value: u64::from(self.x),
                bits: 8,
            },
            DeviceStateEntry {
                index: M6502_Y,
                name: "Y",
                value: u64::from(self.y),
                bits: 8,
            },
            DeviceStateEntry {
                index: M6502_P,
                name: "P",
                value: u64::from(self.p),
                bits: 8,
            },
            DeviceStateEntry {
                index: M6502_S,
                name: "SP",
                value: u64::from(self.sp),
                bits: 8,
            },
            DeviceStateEntry {
                index: M6502_IR,
                name: "IR",
                value: u64::from(self.ir),
                bits: 8,
            },
        ]
    }

    /// Writes a named register from the debugger. Returns `false` for an unknown index.
    ///
    /// Writing PC refetches the opcode at the new address and restarts execution there.
    #[allow(clippy::cast_possible_truncation)]
    pub fn state_import(&mut self, index: u32, value: u64) -> bool {
        match index {
            M6502_PC => {
                self.pc = value as u16;
                self.irq_taken = false;
                self.ir = self.memory.read_sync(self.pc);
                self.ppc = self.pc;
                self.pc = self.pc.wrapping_add(1);
                self.begin_instruction(false);
            }
            M6502_A => self.a = value as u8,
            M6502_X => self.x = value as u8,
            M6502_Y => self.y = value as u8,
            M6502_P => self.p = value as u8 | FLAG_B | FLAG_E,
            M6502_S => self.sp = value as u8,
            M6502_IR => self.ir = value as u8,
            _ => return false,
        }
        true
    }

    /// Captures every save-state field.
    #[must_use]
    pub fn snapshot(&self) -> M6502Snapshot {
        M6502Snapshot {
            version: SnapshotVersion::V1,
            pc: self.pc,
            ppc: self.ppc,
            a: self.a,
            x: self.x,
            y: self.y,
            p: self.p,
            sp: self.sp,
            ir: self.ir,
            tmp: self.tmp,
            tmp2: self.tmp2,
            stage: self.stage,
            step: self.step,
            irq_taken: self.irq_taken,
            inhibit_interrupts: self.inhibit_interrupts,
            nmi_level: self.nmi.level(),
            nmi_pending: self.nmi.edge_pending(),
            irq_level: self.irq.level(),
            so_level: self.so.level(),
            sync: self.sync,
            total_cycles: self.total_cycles,
        }
    }

    /// Restores a snapshot taken with [`M6502::snapshot`].
    pub fn restore(&mut self, snapshot: &M6502Snapshot) {
        self.pc = snapshot.pc;
        self.ppc = snapshot.ppc;
        self.a = snapshot.a;
        self.x = snapshot.x;
        self.y = snapshot.y;
        self.p = snapshot.p;
        self.sp = snapshot.sp;
        self.ir = snapshot.ir;
        self.tmp = snapshot.tmp;
        self.tmp2 = snapshot.tmp2;
        self.stage = snapshot.stage;
        self.step = snapshot.step;
        self.irq_taken = snapshot.irq_taken;
        self.inhibit_interrupts = snapshot.inhibit_interrupts;
        self.nmi.restore(snapshot.nmi_level, snapshot.nmi_pending);
        self.irq.restore(snapshot.irq_level, false);
        self.so.restore(snapshot.so_level, false);
        self.sync = snapshot.sync;
        self.total_cycles = snapshot.total_cycles;
    }

    fn set_sync(&mut self, level: bool) {
        self.sync = level;
        if let Some(output) = self.sync_output.as_mut() {
            output(level);
        }
    }

    fn poll_overflow(&mut self) {
        if self.so.take_edge() {
            self.p |= FLAG_V;
        }
    }
}

impl<M: M6502Memory> ExecuteDevice for M6502<M> {
    fn tag(&self) -> &str {
        &self.config.tag
    }

    fn clock(&self) -> Clock {
        self.clock
    }

    fn execute_run(&mut self) {
        while self.icount > 0 {
            if self.halt.level() || self.ctx.abort_requested() {
                break;
            }
            self.poll_overflow();
            self.cycle();
        }
    }

    fn icount(&self) -> i32 {
        self.icount
    }

    fn set_icount(&mut self, icount: i32) {
        self.icount = icount;
    }

    fn execute_max_cycles(&self) -> u32 {
        10
    }

    fn execute_input_lines(&self) -> u32 {
        INPUT_LINE_NMI + 1
    }

    fn execute_input_edge_triggered(&self, line: u32) -> bool {
        line == INPUT_LINE_NMI
    }

    fn set_input_line(&mut self, line: u32, state: LineState) {
        match line {
            M6502_IRQ_LINE => self.irq.set(state),
            INPUT_LINE_NMI => self.nmi.set(state),
            M6502_SET_OVERFLOW_LINE => {
                self.so.set(state);
                self.poll_overflow();
            }
            INPUT_LINE_HALT => self.halt.set(state),
            INPUT_LINE_RESET => {
                if state != LineState::Clear {
                    self.reset();
                }
            }
            _ => log::warn!(
                target: LOG_TARGET,
                "'{}': write to unknown input line {line}",
                self.config.tag
            ),
        }
    }

    fn is_suspended(&self) -> bool {
        self.halt.level()
    }

    fn device_reset(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::{FlatMemory, M6502Config, M6502, FLAG_I, FLAG_V, M6502_PC};
    use crate::api::{ExecuteDevice, LineState};
    use crate::context::MachineContext;
    use crate::cpu::m6502::M6502_SET_OVERFLOW_LINE;

    fn core_with(program: &[u8]) -> M6502<FlatMemory> {
        let mut memory = FlatMemory::new();
        memory.load(0x0200, program);
        memory.set_reset_vector(0x0200);
        M6502::new(M6502Config::default(), MachineContext::new(), memory)
    }

    fn run(cpu: &mut M6502<FlatMemory>, cycles: i32) {
        cpu.set_icount(cycles);
        cpu.execute_run();
    }

    #[test]
    fn reset_loads_the_vector_and_sets_i() {
        let mut cpu = core_with(&[0xea]);
        run(&mut cpu, 8);
        assert_eq!(cpu.ppc(), 0x0200);
        assert_eq!(cpu.pc(), 0x0201);
        assert_eq!(cpu.sp(), 0xfd);
        assert_ne!(cpu.p() & FLAG_I, 0);
        assert_eq!(cpu.total_cycles(), 8);
    }

    #[test]
    fn set_overflow_edge_sets_v() {
        let mut cpu = core_with(&[0xea]);
        cpu.set_input_line(M6502_SET_OVERFLOW_LINE, LineState::Assert);
        assert_ne!(cpu.p() & FLAG_V, 0);
    }

    #[test]
    fn state_import_of_pc_restarts_at_the_new_address() {
        let mut cpu = core_with(&[0xea, 0xea, 0xa9, 0x42]);
        run(&mut cpu, 8);
        assert!(cpu.state_import(M6502_PC, 0x0202));
        run(&mut cpu, 2);
        assert_eq!(cpu.a(), 0x42);
        assert!(!cpu.state_import(99, 0));
    }

    #[test]
    fn snapshot_restores_mid_instruction() {
        let mut cpu = core_with(&[0xa9, 0x10, 0x69, 0x05, 0xea]);
        run(&mut cpu, 8 + 2);
        let saved = cpu.snapshot();
        run(&mut cpu, 3);
        let expected = cpu.a();
        cpu.restore(&saved);
        run(&mut cpu, 3);
        assert_eq!(cpu.a(), expected);
        assert_eq!(cpu.a(), 0x15);
        assert_eq!(cpu.flags_string(), "...I..");
    }
}
