//! Cycle-level microcode.
//!
//! [`M6502::cycle`] performs exactly one bus access. The position inside an instruction is the
//! pair (`stage`, `step`), both saved in snapshots, so execution can stop after any cycle.

use super::alu;
use super::interface::M6502Memory;
use super::state::{MicroStage, FLAG_B, FLAG_C, FLAG_D, FLAG_E, FLAG_I, FLAG_N, FLAG_V};
use super::table::{opcode_info, Access, Mnemonic, Mode, OpcodeInfo};
use super::M6502;
use crate::api::TraceEvent;

/// What follows the cycle just performed.
enum Flow {
    /// Advance to the next step.
    Next,
    /// Continue at the given step.
    Goto(u8),
    /// The opcode fetch ran; the next instruction has been set up.
    Fetched,
}

const fn set_low(address: u16, low: u16) -> u16 {
    (address & 0xff00) | (low & 0x00ff)
}

const fn page_crossing(base: u16, offset: u16) -> bool {
    (base & 0xff00) != (base.wrapping_add(offset) & 0xff00)
}

impl<M: M6502Memory> M6502<M> {
    fn tick(&mut self) {
        self.icount -= 1;
        self.total_cycles += 1;
        self.ctx.advance_cycles(1);
    }

    fn read(&mut self, address: u16) -> u8 {
        let data = self.memory.read(address);
        self.tick();
        data
    }

    fn read_arg(&mut self, address: u16) -> u8 {
        let data = self.memory.read_arg(address);
        self.tick();
        data
    }

    fn write(&mut self, address: u16, data: u8) {
        self.memory.write(address, data);
        self.tick();
    }

    fn read_pc(&mut self) -> u8 {
        let data = self.read_arg(self.pc);
        self.pc = self.pc.wrapping_add(1);
        data
    }

    fn read_pc_noinc(&mut self) -> u8 {
        self.read_arg(self.pc)
    }

    const fn stack(&self) -> u16 {
        0x0100 | self.sp as u16
    }

    fn push(&mut self, data: u8) {
        self.write(self.stack(), data);
        self.sp = self.sp.wrapping_sub(1);
    }

    const fn set_nz(&mut self, value: u8) {
        self.p = alu::set_nz(self.p, value);
    }

    /// Fetches the next opcode, sampling interrupts: a pending NMI edge or an unmasked IRQ
    /// replaces the opcode with BRK and leaves PC on the interrupted instruction.
    fn prefetch(&mut self) -> Flow {
        self.set_sync(true);
        let fetch_at = self.pc;
        self.ir = self.memory.read_sync(fetch_at);
        self.tick();
        self.set_sync(false);
        let irq = self.irq.level() && self.p & FLAG_I == 0;
        if (self.nmi.edge_pending() || irq) && !self.inhibit_interrupts {
            self.irq_taken = true;
            self.ir = 0x00;
        } else {
            self.pc = self.pc.wrapping_add(1);
        }
        self.ppc = fetch_at;
        self.begin_instruction(true);
        Flow::Fetched
    }

    pub(super) fn begin_instruction(&mut self, traced: bool) {
        let info = opcode_info(self.ir);
        let addressed = !matches!(info.mnemonic.access(), Access::Other)
            && info.mode.computes_address();
        self.stage = if addressed {
            MicroStage::Address
        } else {
            MicroStage::Operate
        };
        self.step = 0;
        self.ctx.set_pc(u32::from(self.ppc));
        if traced && !self.irq_taken {
            if let Some(sink) = self.trace.as_mut() {
                sink.on_event(TraceEvent::Instruction {
                    pc: u32::from(self.ppc),
                    opcode: self.ir,
                    registers: [
                        u32::from(self.a),
                        u32::from(self.x),
                        u32::from(self.y),
                        u32::from(self.p),
                        u32::from(self.sp),
                    ],
                    cycles: self.total_cycles,
                });
            }
        }
    }

    /// Runs one bus cycle.
    pub(super) fn cycle(&mut self) {
        let flow = match self.stage {
            MicroStage::Reset => self.reset_cycle(),
            MicroStage::Address => {
                let info = opcode_info(self.ir);
                if self.address_cycle(info) {
                    self.stage = MicroStage::Operate;
                    self.step = 0;
                    return;
                }
                Flow::Next
            }
            MicroStage::Operate => {
                let info = opcode_info(self.ir);
                self.operate_cycle(info)
            }
        };
        match flow {
            Flow::Next => self.step = self.step.wrapping_add(1),
            Flow::Goto(step) => self.step = step,
            Flow::Fetched => {}
        }
    }

    fn reset_cycle(&mut self) -> Flow {
        match self.step {
            0 | 1 => {
                self.read_pc_noinc();
            }
            2..=4 => {
                // pushes are turned into reads while RESET is held
                self.read(self.stack());
                self.sp = self.sp.wrapping_sub(1);
            }
            5 => self.tmp2 = self.read_arg(0xfffc),
            6 => {
                let high = self.read_arg(0xfffd);
                self.pc = u16::from_le_bytes([self.tmp2, high]);
                self.p |= FLAG_I;
                self.irq_taken = false;
            }
            _ => return self.prefetch(),
        }
        Flow::Next
    }

    /// Address-computation cycle; returns `true` once the effective address is in `tmp`.
    fn address_cycle(&mut self, info: OpcodeInfo) -> bool {
        let index = match info.mode {
            Mode::ZeroPageX | Mode::AbsoluteX => u16::from(self.x),
            Mode::ZeroPageY | Mode::AbsoluteY | Mode::IndirectIndexed => u16::from(self.y),
            _ => 0,
        };
        let always_fixup = info.mnemonic.access() != Access::Read;
        let unstable = info.mnemonic.is_unstable_store();
        match (info.mode, self.step) {
            (Mode::ZeroPage, _) => {
                self.tmp = u16::from(self.read_pc());
                true
            }
            (Mode::ZeroPageX | Mode::ZeroPageY, 0) => {
                self.tmp = u16::from(self.read_pc());
                false
            }
            (Mode::ZeroPageX | Mode::ZeroPageY, _) => {
                self.read(self.tmp);
                self.tmp = (self.tmp + index) & 0x00ff;
                true
            }
            (Mode::Absolute | Mode::AbsoluteX | Mode::AbsoluteY, 0) => {
                self.tmp = u16::from(self.read_pc());
                false
            }
            (Mode::Absolute, _) => {
                self.tmp |= u16::from(self.read_pc()) << 8;
                true
            }
            (Mode::AbsoluteX | Mode::AbsoluteY, 1) => {
                self.tmp |= u16::from(self.read_pc()) << 8;
                if always_fixup || page_crossing(self.tmp, index) {
                    false
                } else {
                    self.tmp = self.tmp.wrapping_add(index);
                    true
                }
            }
            (Mode::IndexedIndirect, 0) | (Mode::IndirectIndexed, 0) => {
                self.tmp2 = self.read_pc();
                false
            }
            (Mode::IndexedIndirect, 1) => {
                self.read(u16::from(self.tmp2));
                self.tmp2 = self.tmp2.wrapping_add(self.x);
                false
            }
            (Mode::IndexedIndirect, 2) | (Mode::IndirectIndexed, 1) => {
                self.tmp = u16::from(self.read(u16::from(self.tmp2)));
                false
            }
            (Mode::IndexedIndirect, _) => {
                let high = self.read(u16::from(self.tmp2.wrapping_add(1)));
                self.tmp |= u16::from(high) << 8;
                true
            }
            (Mode::IndirectIndexed, 2) => {
                let high = self.read(u16::from(self.tmp2.wrapping_add(1)));
                self.tmp |= u16::from(high) << 8;
                if always_fixup || page_crossing(self.tmp, index) {
                    false
                } else {
                    self.tmp = self.tmp.wrapping_add(index);
                    true
                }
            }
            (Mode::AbsoluteX | Mode::AbsoluteY | Mode::IndirectIndexed, _) => {
                // dummy read from the unfixed page
                self.read(set_low(self.tmp, self.tmp.wrapping_add(index)));
                if !unstable {
                    self.tmp = self.tmp.wrapping_add(index);
                }
                true
            }
            _ => {
                debug_assert!(false, "no address cycles for {:?}", info.mode);
                self.read_pc_noinc();
                true
            }
        }
    }

    fn operate_cycle(&mut self, info: OpcodeInfo) -> Flow {
        match info.mnemonic.access() {
            Access::Read => match (info.mode, self.step) {
                (Mode::Implied, 0) => {
                    self.read_pc_noinc();
                    Flow::Next
                }
                (Mode::Immediate, 0) => {
                    let value = self.read_pc();
                    self.apply_read(info.mnemonic, value);
                    Flow::Next
                }
                (_, 0) => {
                    let value = self.read(self.tmp);
                    self.apply_read(info.mnemonic, value);
                    Flow::Next
                }
                _ => self.prefetch(),
            },
            Access::Write => match self.step {
                0 => {
                    let (address, value) = self.store_target(info);
                    self.write(address, value);
                    Flow::Next
                }
                _ => self.prefetch(),
            },
            Access::ReadModifyWrite if info.mode == Mode::Accumulator => match self.step {
                0 => {
                    self.read_pc_noinc();
                    self.a = self.apply_modify(info.mnemonic, self.a);
                    Flow::Next
                }
                _ => self.prefetch(),
            },
            Access::ReadModifyWrite => match self.step {
                0 => {
                    self.tmp2 = self.read(self.tmp);
                    Flow::Next
                }
                1 => {
                    // the unmodified value is written back first
                    self.write(self.tmp, self.tmp2);
                    self.tmp2 = self.apply_modify(info.mnemonic, self.tmp2);
                    Flow::Next
                }
                2 => {
                    self.write(self.tmp, self.tmp2);
                    Flow::Next
                }
                _ => self.prefetch(),
            },
            Access::Other => self.control_cycle(info),
        }
    }

    fn apply_read(&mut self, mnemonic: Mnemonic, value: u8) {
        match mnemonic {
            Mnemonic::Adc => (self.a, self.p) = alu::adc(self.a, value, self.p),
            Mnemonic::Sbc => (self.a, self.p) = alu::sbc(self.a, value, self.p),
            Mnemonic::And => {
                self.a &= value;
                self.set_nz(self.a);
            }
            Mnemonic::Ora => {
                self.a |= value;
                self.set_nz(self.a);
            }
            Mnemonic::Eor => {
                self.a ^= value;
                self.set_nz(self.a);
            }
            Mnemonic::Bit => self.p = alu::bit(self.a, value, self.p),
            Mnemonic::Cmp => self.p = alu::compare(self.a, value, self.p),
            Mnemonic::Cpx => self.p = alu::compare(self.x, value, self.p),
            Mnemonic::Cpy => self.p = alu::compare(self.y, value, self.p),
            Mnemonic::Lda => {
                self.a = value;
                self.set_nz(value);
            }
            Mnemonic::Ldx => {
                self.x = value;
                self.set_nz(value);
            }
            Mnemonic::Ldy => {
                self.y = value;
                self.set_nz(value);
            }
            Mnemonic::Lax | Mnemonic::Lxa => {
                self.a = value;
                self.x = value;
                self.set_nz(value);
            }
            Mnemonic::Las => {
                let value = value & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.set_nz(value);
            }
            Mnemonic::Anc => {
                self.a &= value;
                self.set_nz(self.a);
                if self.p & FLAG_N != 0 {
                    self.p |= FLAG_C;
                } else {
                    self.p &= !FLAG_C;
                }
            }
            Mnemonic::Alr => (self.a, self.p) = alu::lsr(self.a & value, self.p),
            Mnemonic::Arr => (self.a, self.p) = alu::arr(self.a & value, self.p),
            Mnemonic::Ane => {
                self.a &= value & self.x;
                self.set_nz(self.a);
            }
            Mnemonic::Sbx => {
                self.x &= self.a;
                if self.x < value {
                    self.p &= !FLAG_C;
                } else {
                    self.p |= FLAG_C;
                }
                self.x = self.x.wrapping_sub(value);
                self.set_nz(self.x);
            }
            _ => {}
        }
    }

    fn apply_modify(&mut self, mnemonic: Mnemonic, value: u8) -> u8 {
        let (result, p) = match mnemonic {
            Mnemonic::Asl | Mnemonic::Slo => alu::asl(value, self.p),
            Mnemonic::Lsr | Mnemonic::Sre => alu::lsr(value, self.p),
            Mnemonic::Rol | Mnemonic::Rla => alu::rol(value, self.p),
            Mnemonic::Ror | Mnemonic::Rra => alu::ror(value, self.p),
            Mnemonic::Inc | Mnemonic::Isb => {
                let result = value.wrapping_add(1);
                (result, alu::set_nz(self.p, result))
            }
            Mnemonic::Dec | Mnemonic::Dcp => {
                let result = value.wrapping_sub(1);
                (result, alu::set_nz(self.p, result))
            }
            _ => (value, self.p),
        };
        self.p = p;
        match mnemonic {
            Mnemonic::Slo => {
                self.a |= result;
                self.set_nz(self.a);
            }
            Mnemonic::Rla => {
                self.a &= result;
                self.set_nz(self.a);
            }
            Mnemonic::Sre => {
                self.a ^= result;
                self.set_nz(self.a);
            }
            Mnemonic::Rra => (self.a, self.p) = alu::adc(self.a, result, self.p),
            Mnemonic::Dcp => self.p = alu::compare(self.a, result, self.p),
            Mnemonic::Isb => (self.a, self.p) = alu::sbc(self.a, result, self.p),
            _ => {}
        }
        result
    }

    /// Address and data of a store. The SHA/SHX/SHY/TAS family ANDs the data with the base
    /// high byte plus one, and on a page cross that value also replaces the address high byte.
    fn store_target(&mut self, info: OpcodeInfo) -> (u16, u8) {
        let plain = match info.mnemonic {
            Mnemonic::Sta => Some(self.a),
            Mnemonic::Stx => Some(self.x),
            Mnemonic::Sty => Some(self.y),
            Mnemonic::Sax => Some(self.a & self.x),
            _ => None,
        };
        if let Some(value) = plain {
            return (self.tmp, value);
        }
        let index = if info.mnemonic == Mnemonic::Shy {
            self.x
        } else {
            self.y
        };
        let high_plus_one = (self.tmp >> 8).to_le_bytes()[0].wrapping_add(1);
        let source = match info.mnemonic {
            Mnemonic::Shx => self.x,
            Mnemonic::Shy => self.y,
            Mnemonic::Tas => {
                self.sp = self.a & self.x;
                self.sp
            }
            _ => self.a & self.x,
        };
        let value = source & high_plus_one;
        let index = u16::from(index);
        let address = if page_crossing(self.tmp, index) {
            (u16::from(value) << 8) | (self.tmp.wrapping_add(index) & 0x00ff)
        } else {
            self.tmp.wrapping_add(index)
        };
        (address, value)
    }

    fn branch_taken(&self, mnemonic: Mnemonic) -> bool {
        let flag = |mask: u8| self.p & mask != 0;
        match mnemonic {
            Mnemonic::Bpl => !flag(FLAG_N),
            Mnemonic::Bmi => flag(FLAG_N),
            Mnemonic::Bvc => !flag(FLAG_V),
            Mnemonic::Bvs => flag(FLAG_V),
            Mnemonic::Bcc => !flag(FLAG_C),
            Mnemonic::Bcs => flag(FLAG_C),
            Mnemonic::Bne => !flag(super::state::FLAG_Z),
            Mnemonic::Beq => flag(super::state::FLAG_Z),
            _ => false,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn control_cycle(&mut self, info: OpcodeInfo) -> Flow {
        let step = self.step;
        match (info.mnemonic, info.mode) {
            (Mnemonic::Brk, _) => self.brk_cycle(),
            (Mnemonic::Kil, _) => {
                if step == 0 {
                    self.read_pc();
                } else {
                    self.read_arg(0xffff);
                }
                Flow::Goto(1)
            }
            (Mnemonic::Jsr, _) => {
                match step {
                    0 => self.tmp = u16::from(self.read_pc()),
                    1 => {
                        self.read(self.stack());
                    }
                    2 => self.push(self.pc.to_le_bytes()[1]),
                    3 => self.push(self.pc.to_le_bytes()[0]),
                    4 => {
                        self.tmp |= u16::from(self.read_pc()) << 8;
                        self.pc = self.tmp;
                    }
                    _ => return self.prefetch(),
                }
                Flow::Next
            }
            (Mnemonic::Rts, _) => {
                match step {
                    0 => {
                        self.read_pc_noinc();
                    }
                    1 => {
                        self.read(self.stack());
                        self.sp = self.sp.wrapping_add(1);
                    }
                    2 => {
                        self.tmp2 = self.read(self.stack());
                        self.sp = self.sp.wrapping_add(1);
                    }
                    3 => {
                        let high = self.read(self.stack());
                        self.pc = u16::from_le_bytes([self.tmp2, high]);
                    }
                    4 => {
                        self.read_pc();
                    }
                    _ => return self.prefetch(),
                }
                Flow::Next
            }
            (Mnemonic::Rti, _) => {
                match step {
                    0 => {
                        self.read_pc_noinc();
                    }
                    1 => {
                        self.read(self.stack());
                        self.sp = self.sp.wrapping_add(1);
                    }
                    2 => {
                        self.p = self.read(self.stack()) | FLAG_B | FLAG_E;
                        self.sp = self.sp.wrapping_add(1);
                    }
                    3 => {
                        self.tmp2 = self.read(self.stack());
                        self.sp = self.sp.wrapping_add(1);
                    }
                    4 => {
                        let high = self.read(self.stack());
                        self.pc = u16::from_le_bytes([self.tmp2, high]);
                    }
                    _ => return self.prefetch(),
                }
                Flow::Next
            }
            (Mnemonic::Pha | Mnemonic::Php, _) => {
                match step {
                    0 => {
                        self.read_pc_noinc();
                    }
                    1 => {
                        let value = if info.mnemonic == Mnemonic::Pha {
                            self.a
                        } else {
                            self.p
                        };
                        self.push(value);
                    }
                    _ => return self.prefetch(),
                }
                Flow::Next
            }
            (Mnemonic::Pla | Mnemonic::Plp, _) => {
                match step {
                    0 => {
                        self.read_pc_noinc();
                    }
                    1 => {
                        self.read(self.stack());
                        self.sp = self.sp.wrapping_add(1);
                    }
                    2 => {
                        let value = self.read(self.stack());
                        if info.mnemonic == Mnemonic::Pla {
                            self.a = value;
                            self.set_nz(value);
                        } else {
                            self.tmp2 = value | FLAG_B | FLAG_E;
                        }
                    }
                    _ => {
                        let flow = self.prefetch();
                        // P changes after the fetch sampled interrupts
                        if info.mnemonic == Mnemonic::Plp {
                            self.p = self.tmp2;
                        }
                        return flow;
                    }
                }
                Flow::Next
            }
            (Mnemonic::Jmp, Mode::Indirect) => {
                match step {
                    0 => self.tmp = u16::from(self.read_pc()),
                    1 => self.tmp |= u16::from(self.read_pc()) << 8,
                    2 => self.tmp2 = self.read(self.tmp),
                    // the high byte comes from the same page
                    3 => {
                        let high = self.read(set_low(self.tmp, self.tmp.wrapping_add(1)));
                        self.pc = u16::from_le_bytes([self.tmp2, high]);
                    }
                    _ => return self.prefetch(),
                }
                Flow::Next
            }
            (Mnemonic::Jmp, _) => {
                match step {
                    0 => self.tmp = u16::from(self.read_pc()),
                    1 => {
                        self.tmp |= u16::from(self.read_pc()) << 8;
                        self.pc = self.tmp;
                    }
                    _ => return self.prefetch(),
                }
                Flow::Next
            }
            (_, Mode::Relative) => self.branch_cycle(info.mnemonic),
            (Mnemonic::Cli | Mnemonic::Sei, _) => {
                if step == 0 {
                    self.read_pc_noinc();
                    return Flow::Next;
                }
                let flow = self.prefetch();
                if info.mnemonic == Mnemonic::Cli {
                    self.p &= !FLAG_I;
                } else {
                    self.p |= FLAG_I;
                }
                flow
            }
            _ => {
                if step == 0 {
                    self.read_pc_noinc();
                    self.apply_implied(info.mnemonic);
                    return Flow::Next;
                }
                self.prefetch()
            }
        }
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn branch_cycle(&mut self, mnemonic: Mnemonic) -> Flow {
        let offset = i16::from(self.tmp2 as i8) as u16;
        match self.step {
            0 => {
                self.tmp2 = self.read_pc();
                if self.branch_taken(mnemonic) {
                    Flow::Next
                } else {
                    Flow::Goto(3)
                }
            }
            1 => {
                self.read_pc_noinc();
                if page_crossing(self.pc, offset) {
                    Flow::Next
                } else {
                    self.pc = self.pc.wrapping_add(offset);
                    Flow::Goto(3)
                }
            }
            2 => {
                self.read_arg(set_low(self.pc, self.pc.wrapping_add(offset)));
                self.pc = self.pc.wrapping_add(offset);
                Flow::Next
            }
            _ => self.prefetch(),
        }
    }

    /// BRK and the interrupt sequence share microcode. An NMI latched before the vector fetch
    /// takes over the sequence, BRK included.
    fn brk_cycle(&mut self) -> Flow {
        match self.step {
            0 => {
                if self.irq_taken {
                    self.read_pc_noinc();
                } else {
                    self.read_pc();
                }
            }
            1 => self.push(self.pc.to_le_bytes()[1]),
            2 => self.push(self.pc.to_le_bytes()[0]),
            3 => {
                let pushed = if self.irq_taken {
                    self.p & !FLAG_B
                } else {
                    self.p
                };
                self.push(pushed);
            }
            4 => {
                let nmi = self.nmi.take_edge();
                self.tmp = if nmi { 0xfffa } else { 0xfffe };
                if nmi || self.irq_taken {
                    if let Some(sink) = self.trace.as_mut() {
                        sink.on_event(TraceEvent::Interrupt {
                            pc: u32::from(self.ppc),
                            vector: u32::from(self.tmp),
                        });
                    }
                }
                self.tmp2 = self.read_arg(self.tmp);
            }
            5 => {
                let high = self.read_arg(self.tmp.wrapping_add(1));
                self.pc = u16::from_le_bytes([self.tmp2, high]);
                self.irq_taken = false;
                self.p |= FLAG_I;
            }
            _ => return self.prefetch(),
        }
        Flow::Next
    }

    fn apply_implied(&mut self, mnemonic: Mnemonic) {
        match mnemonic {
            Mnemonic::Clc => self.p &= !FLAG_C,
            Mnemonic::Cld => self.p &= !FLAG_D,
            Mnemonic::Clv => self.p &= !FLAG_V,
            Mnemonic::Sec => self.p |= FLAG_C,
            Mnemonic::Sed => self.p |= FLAG_D,
            Mnemonic::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.set_nz(self.x);
            }
            Mnemonic::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.set_nz(self.y);
            }
            Mnemonic::Inx => {
                self.x = self.x.wrapping_add(1);
                self.set_nz(self.x);
            }
            Mnemonic::Iny => {
                self.y = self.y.wrapping_add(1);
                self.set_nz(self.y);
            }
            Mnemonic::Tax => {
                self.x = self.a;
                self.set_nz(self.x);
            }
            Mnemonic::Tay => {
                self.y = self.a;
                self.set_nz(self.y);
            }
            Mnemonic::Tsx => {
                self.x = self.sp;
                self.set_nz(self.x);
            }
            Mnemonic::Txa => {
                self.a = self.x;
                self.set_nz(self.a);
            }
            Mnemonic::Txs => self.sp = self.x,
            Mnemonic::Tya => {
                self.a = self.y;
                self.set_nz(self.a);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{ExecuteDevice, LineState, TraceEvent, INPUT_LINE_NMI};
    use crate::context::MachineContext;
    use crate::cpu::m6502::{FlatMemory, M6502Config, M6502, FLAG_C, FLAG_I, M6502_IRQ_LINE};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn boot(program: &[u8]) -> M6502<FlatMemory> {
        let mut memory = FlatMemory::new();
        memory.load(0x0200, program);
        memory.set_reset_vector(0x0200);
        let mut cpu = M6502::new(M6502Config::default(), MachineContext::new(), memory);
        run(&mut cpu, 8);
        cpu
    }

    fn run(cpu: &mut M6502<FlatMemory>, cycles: i32) -> i32 {
        cpu.set_icount(cycles);
        cpu.execute_run();
        cycles - cpu.icount()
    }

    #[test]
    fn indexed_reads_pay_for_page_crossings_only() {
        // ldx #$ff ; lda $10f0,x ; lda $1000,x
        let mut cpu = boot(&[0xa2, 0xff, 0xbd, 0xf0, 0x10, 0xbd, 0x00, 0x10]);
        cpu.memory_mut().load(0x11ef, &[0x5a]);
        cpu.memory_mut().load(0x10ff, &[0xa5]);
        let start = cpu.total_cycles();
        run(&mut cpu, 2 + 5);
        assert_eq!(cpu.a(), 0x5a);
        assert_eq!(cpu.total_cycles() - start, 7);
        run(&mut cpu, 4);
        assert_eq!(cpu.a(), 0xa5);
    }

    #[test]
    fn jmp_indirect_wraps_within_the_page() {
        let mut cpu = boot(&[0x6c, 0xff, 0x30]);
        cpu.memory_mut().load(0x30ff, &[0x34]);
        cpu.memory_mut().load(0x3000, &[0x12]);
        cpu.memory_mut().load(0x3100, &[0x99]);
        run(&mut cpu, 5);
        assert_eq!(cpu.ppc(), 0x1234);
    }

    #[test]
    fn jsr_and_rts_round_trip() {
        // jsr $0210 ; lda #$01 ... $0210: ldx #$07 ; rts
        let mut program = vec![0x20, 0x10, 0x02, 0xa9, 0x01];
        program.resize(0x10, 0xea);
        program.extend_from_slice(&[0xa2, 0x07, 0x60]);
        let mut cpu = boot(&program);
        assert_eq!(run(&mut cpu, 6 + 2 + 6 + 2), 16);
        assert_eq!(cpu.x(), 0x07);
        assert_eq!(cpu.a(), 0x01);
        assert_eq!(cpu.sp(), 0xfd);
    }

    #[test]
    fn cli_delays_a_pending_irq_by_one_instruction() {
        // cli ; lda #$55 ; nop
        let mut cpu = boot(&[0x58, 0xa9, 0x55, 0xea]);
        cpu.memory_mut().set_reset_vector(0x0200);
        cpu.memory_mut().load(0xfffe, &[0x00, 0x40]);
        cpu.set_input_line(M6502_IRQ_LINE, LineState::Assert);
        run(&mut cpu, 2);
        assert_eq!(cpu.p() & FLAG_I, 0);
        assert_eq!(cpu.ppc(), 0x0201);
        run(&mut cpu, 2);
        assert_eq!(cpu.a(), 0x55);
        run(&mut cpu, 7);
        assert_eq!(cpu.ppc(), 0x4000);
        assert_ne!(cpu.p() & FLAG_I, 0);
        // return address is the interrupted instruction, B clear in the pushed P
        assert_eq!(cpu.memory().bytes()[0x01fd], 0x02);
        assert_eq!(cpu.memory().bytes()[0x01fc], 0x03);
        assert_eq!(cpu.memory().bytes()[0x01fb] & 0x10, 0);
    }

    #[test]
    fn nmi_hijacks_a_brk_in_progress() {
        let mut cpu = boot(&[0x00, 0x00]);
        cpu.memory_mut().load(0xfffa, &[0x00, 0x50]);
        cpu.memory_mut().load(0xfffe, &[0x00, 0x40]);
        let events = Rc::new(RefCell::new(Vec::new()));
        cpu.attach_trace(Box::new(events.clone()));
        run(&mut cpu, 2);
        cpu.set_input_line(INPUT_LINE_NMI, LineState::Pulse);
        run(&mut cpu, 5);
        assert_eq!(cpu.ppc(), 0x5000);
        // the pushed P still carries B, this was a BRK
        assert_ne!(cpu.memory().bytes()[0x01fb] & 0x10, 0);
        assert!(events
            .borrow()
            .iter()
            .any(|event| matches!(event, TraceEvent::Interrupt { vector: 0xfffa, .. })));
    }

    #[test]
    fn kil_hangs_reading_the_top_of_memory() {
        let mut cpu = boot(&[0x02, 0xea]);
        assert_eq!(run(&mut cpu, 50), 50);
        assert_eq!(cpu.pc(), 0x0202);
        assert_eq!(cpu.ir(), 0x02);
    }

    #[test]
    fn rmw_sbc_and_decimal_paths() {
        // sed ; sec ; lda #$10 ; sbc #$01 ; cld ; isb $20
        let mut cpu = boot(&[0xf8, 0x38, 0xa9, 0x10, 0xe9, 0x01, 0xd8, 0xe7, 0x20]);
        cpu.memory_mut().load(0x0020, &[0x02]);
        run(&mut cpu, 2 + 2 + 2 + 2);
        assert_eq!(cpu.a(), 0x09);
        assert_ne!(cpu.p() & FLAG_C, 0);
        run(&mut cpu, 2 + 5);
        assert_eq!(cpu.memory().bytes()[0x20], 0x03);
        assert_eq!(cpu.a(), 0x06);
    }
}
