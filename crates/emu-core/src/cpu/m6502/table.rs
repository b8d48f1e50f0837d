//! Per-opcode decode table for the NMOS 6502, undocumented opcodes included.

/// Instruction mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[allow(missing_docs)]
pub enum Mnemonic {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    // undocumented
    Slo,
    Rla,
    Sre,
    Rra,
    Sax,
    Lax,
    Dcp,
    Isb,
    Anc,
    Alr,
    Arr,
    Ane,
    Lxa,
    Sbx,
    Sha,
    Shx,
    Shy,
    Tas,
    Las,
    Kil,
}

/// How an instruction uses its effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Reads one operand byte.
    Read,
    /// Writes one byte.
    Write,
    /// Reads, writes the old value back, then writes the result.
    ReadModifyWrite,
    /// Has its own microcode (flow control, stack, implied register ops).
    Other,
}

impl Mnemonic {
    /// Bus usage class.
    #[must_use]
    pub const fn access(self) -> Access {
        match self {
            Self::Adc
            | Self::And
            | Self::Bit
            | Self::Cmp
            | Self::Cpx
            | Self::Cpy
            | Self::Eor
            | Self::Lda
            | Self::Ldx
            | Self::Ldy
            | Self::Ora
            | Self::Sbc
            | Self::Nop
            | Self::Lax
            | Self::Las
            | Self::Anc
            | Self::Alr
            | Self::Arr
            | Self::Ane
            | Self::Lxa
            | Self::Sbx => Access::Read,
            Self::Sta
            | Self::Stx
            | Self::Sty
            | Self::Sax
            | Self::Sha
            | Self::Shx
            | Self::Shy
            | Self::Tas => Access::Write,
            Self::Asl
            | Self::Lsr
            | Self::Rol
            | Self::Ror
            | Self::Inc
            | Self::Dec
            | Self::Slo
            | Self::Rla
            | Self::Sre
            | Self::Rra
            | Self::Dcp
            | Self::Isb => Access::ReadModifyWrite,
            _ => Access::Other,
        }
    }

    /// Stores whose address high byte depends on the stored value when indexing crosses a page.
    #[must_use]
    pub const fn is_unstable_store(self) -> bool {
        matches!(self, Self::Sha | Self::Shx | Self::Shy | Self::Tas)
    }

    /// Returns `true` for opcodes outside the documented instruction set.
    #[must_use]
    pub const fn is_undocumented(self) -> bool {
        matches!(
            self,
            Self::Slo
                | Self::Rla
                | Self::Sre
                | Self::Rra
                | Self::Sax
                | Self::Lax
                | Self::Dcp
                | Self::Isb
                | Self::Anc
                | Self::Alr
                | Self::Arr
                | Self::Ane
                | Self::Lxa
                | Self::Sbx
                | Self::Sha
                | Self::Shx
                | Self::Shy
                | Self::Tas
                | Self::Las
                | Self::Kil
        )
    }

    /// Lower-case assembler name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Adc => "adc",
            Self::And => "and",
            Self::Asl => "asl",
            Self::Bcc => "bcc",
            Self::Bcs => "bcs",
            Self::Beq => "beq",
            Self::Bit => "bit",
            Self::Bmi => "bmi",
            Self::Bne => "bne",
            Self::Bpl => "bpl",
            Self::Brk => "brk",
            Self::Bvc => "bvc",
            Self::Bvs => "bvs",
            Self::Clc => "clc",
            Self::Cld => "cld",
            Self::Cli => "cli",
            Self::Clv => "clv",
            Self::Cmp => "cmp",
            Self::Cpx => "cpx",
            Self::Cpy => "cpy",
            Self::Dec => "dec",
            Self::Dex => "dex",
            Self::Dey => "dey",
            Self::Eor => "eor",
            Self::Inc => "inc",
            Self::Inx => "inx",
            Self::Iny => "iny",
            Self::Jmp => "jmp",
            Self::Jsr => "jsr",
            Self::Lda => "lda",
            Self::Ldx => "ldx",
            Self::Ldy => "ldy",
            Self::Lsr => "lsr",
            Self::Nop => "nop",
            Self::Ora => "ora",
            Self::Pha => "pha",
            Self::Php => "php",
            Self::Pla => "pla",
            Self::Plp => "plp",
            Self::Rol => "rol",
            Self::Ror => "ror",
            Self::Rti => "rti",
            Self::Rts => "rts",
            Self::Sbc => "sbc",
            Self::Sec => "sec",
            Self::Sed => "sed",
            Self::Sei => "sei",
            Self::Sta => "sta",
            Self::Stx => "stx",
            Self::Sty => "sty",
            Self::Tax => "tax",
            Self::Tay => "tay",
            Self::Tsx => "tsx",
            Self::Txa => "txa",
            Self::Txs => "txs",
            Self::Tya => "tya",
            Self::Slo => "slo",
            Self::Rla => "rla",
            Self::Sre => "sre",
            Self::Rra => "rra",
            Self::Sax => "sax",
            Self::Lax => "lax",
            Self::Dcp => "dcp",
            Self::Isb => "isb",
            Self::Anc => "anc",
            Self::Alr => "alr",
            Self::Arr => "arr",
            Self::Ane => "ane",
            Self::Lxa => "lxa",
            Self::Sbx => "sbx",
            Self::Sha => "sha",
            Self::Shx => "shx",
            Self::Shy => "shy",
            Self::Tas => "tas",
            Self::Las => "las",
            Self::Kil => "kil",
        }
    }
}

/// Addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Mode {
    /// No operand.
    Implied,
    /// Operates on A.
    Accumulator,
    /// `#$nn`
    Immediate,
    /// `$nn`
    ZeroPage,
    /// `$nn,x`
    ZeroPageX,
    /// `$nn,y`
    ZeroPageY,
    /// `$nnnn`
    Absolute,
    /// `$nnnn,x`
    AbsoluteX,
    /// `$nnnn,y`
    AbsoluteY,
    /// `($nn,x)`
    IndexedIndirect,
    /// `($nn),y`
    IndirectIndexed,
    /// `($nnnn)`, JMP only.
    Indirect,
    /// Signed branch displacement.
    Relative,
}

impl Mode {
    /// Instruction length in bytes, opcode included.
    #[must_use]
    pub const fn length(self) -> u8 {
        match self {
            Self::Implied | Self::Accumulator => 1,
            Self::Immediate
            | Self::ZeroPage
            | Self::ZeroPageX
            | Self::ZeroPageY
            | Self::IndexedIndirect
            | Self::IndirectIndexed
            | Self::Relative => 2,
            Self::Absolute | Self::AbsoluteX | Self::AbsoluteY | Self::Indirect => 3,
        }
    }

    /// Whether the mode computes an effective address before the data cycles.
    #[must_use]
    pub const fn computes_address(self) -> bool {
        matches!(
            self,
            Self::ZeroPage
                | Self::ZeroPageX
                | Self::ZeroPageY
                | Self::Absolute
                | Self::AbsoluteX
                | Self::AbsoluteY
                | Self::IndexedIndirect
                | Self::IndirectIndexed
        )
    }
}

/// Decode entry for one opcode value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodeInfo {
    /// Operation.
    pub mnemonic: Mnemonic,
    /// Addressing mode.
    pub mode: Mode,
    /// Documented cycle count, opcode fetch included.
    pub cycles: u8,
    /// One more cycle when indexing crosses a page (branches: when taken, and one more on a
    /// page cross).
    pub page_penalty: bool,
}

impl OpcodeInfo {
    #[allow(clippy::match_same_arms)]
    const fn new(mnemonic: Mnemonic, mode: Mode) -> Self {
        let access = mnemonic.access();
        let cycles = match (access, mode) {
            (_, Mode::Implied | Mode::Accumulator | Mode::Immediate | Mode::Relative) => {
                match mnemonic {
                    Mnemonic::Brk => 7,
                    Mnemonic::Rti | Mnemonic::Rts => 6,
                    Mnemonic::Pha | Mnemonic::Php => 3,
                    Mnemonic::Pla | Mnemonic::Plp => 4,
                    _ => 2,
                }
            }
            (Access::Other, Mode::Absolute) => {
                if matches!(mnemonic, Mnemonic::Jsr) {
                    6
                } else {
                    3
                }
            }
            (_, Mode::Indirect) => 5,
            (Access::ReadModifyWrite, Mode::ZeroPage) => 5,
            (Access::ReadModifyWrite, Mode::ZeroPageX | Mode::Absolute) => 6,
            (Access::ReadModifyWrite, Mode::AbsoluteX | Mode::AbsoluteY) => 7,
            (Access::ReadModifyWrite, Mode::IndexedIndirect | Mode::IndirectIndexed) => 8,
            (_, Mode::ZeroPage) => 3,
            (_, Mode::ZeroPageX | Mode::ZeroPageY | Mode::Absolute) => 4,
            (Access::Write, Mode::AbsoluteX | Mode::AbsoluteY) => 5,
            (_, Mode::AbsoluteX | Mode::AbsoluteY) => 4,
            (_, Mode::IndexedIndirect) => 6,
            (Access::Write, Mode::IndirectIndexed) => 6,
            (_, Mode::IndirectIndexed) => 5,
        };
        let page_penalty = matches!(mode, Mode::Relative)
            || (matches!(access, Access::Read)
                && matches!(mode, Mode::AbsoluteX | Mode::AbsoluteY | Mode::IndirectIndexed));
        Self {
            mnemonic,
            mode,
            cycles,
            page_penalty,
        }
    }
}

use Mnemonic as Mn;
use Mode as Md;

const ROWS: [(Mnemonic, Mode); 256] = [
    // 0x00
    (Mn::Brk, Md::Implied),
    (Mn::Ora, Md::IndexedIndirect),
    (Mn::Kil, Md::Implied),
    (Mn::Slo, Md::IndexedIndirect),
    (Mn::Nop, Md::ZeroPage),
    (Mn::Ora, Md::ZeroPage),
    (Mn::Asl, Md::ZeroPage),
    (Mn::Slo, Md::ZeroPage),
    (Mn::Php, Md::Implied),
    (Mn::Ora, Md::Immediate),
    (Mn::Asl, Md::Accumulator),
    (Mn::Anc, Md::Immediate),
    (Mn::Nop, Md::Absolute),
    (Mn::Ora, Md::Absolute),
    (Mn::Asl, Md::Absolute),
    (Mn::Slo, Md::Absolute),
    // 0x10
    (Mn::Bpl, Md::Relative),
    (Mn::Ora, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Slo, Md::IndirectIndexed),
    (Mn::Nop, Md::ZeroPageX),
    (Mn::Ora, Md::ZeroPageX),
    (Mn::Asl, Md::ZeroPageX),
    (Mn::Slo, Md::ZeroPageX),
    (Mn::Clc, Md::Implied),
    (Mn::Ora, Md::AbsoluteY),
    (Mn::Nop, Md::Implied),
    (Mn::Slo, Md::AbsoluteY),
    (Mn::Nop, Md::AbsoluteX),
    (Mn::Ora, Md::AbsoluteX),
    (Mn::Asl, Md::AbsoluteX),
    (Mn::Slo, Md::AbsoluteX),
    // 0x20
    (Mn::Jsr, Md::Absolute),
    (Mn::And, Md::IndexedIndirect),
    (Mn::Kil, Md::Implied),
    (Mn::Rla, Md::IndexedIndirect),
    (Mn::Bit, Md::ZeroPage),
    (Mn::And, Md::ZeroPage),
    (Mn::Rol, Md::ZeroPage),
    (Mn::Rla, Md::ZeroPage),
    (Mn::Plp, Md::Implied),
    (Mn::And, Md::Immediate),
    (Mn::Rol, Md::Accumulator),
    (Mn::Anc, Md::Immediate),
    (Mn::Bit, Md::Absolute),
    (Mn::And, Md::Absolute),
    (Mn::Rol, Md::Absolute),
    (Mn::Rla, Md::Absolute),
    // 0x30
    (Mn::Bmi, Md::Relative),
    (Mn::And, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Rla, Md::IndirectIndexed),
    (Mn::Nop, Md::ZeroPageX),
    (Mn::And, Md::ZeroPageX),
    (Mn::Rol, Md::ZeroPageX),
    (Mn::Rla, Md::ZeroPageX),
    (Mn::Sec, Md::Implied),
    (Mn::And, Md::AbsoluteY),
    (Mn::Nop, Md::Implied),
    (Mn::Rla, Md::AbsoluteY),
    (Mn::Nop, Md::AbsoluteX),
    (Mn::And, Md::AbsoluteX),
    (Mn::Rol, Md::AbsoluteX),
    (Mn::Rla, Md::AbsoluteX),
    // 0x40
    (Mn::Rti, Md::Implied),
    (Mn::Eor, Md::IndexedIndirect),
    (Mn::Kil, Md::Implied),
    (Mn::Sre, Md::IndexedIndirect),
    (Mn::Nop, Md::ZeroPage),
    (Mn::Eor, Md::ZeroPage),
    (Mn::Lsr, Md::ZeroPage),
    (Mn::Sre, Md::ZeroPage),
    (Mn::Pha, Md::Implied),
    (Mn::Eor, Md::Immediate),
    (Mn::Lsr, Md::Accumulator),
    (Mn::Alr, Md::Immediate),
    (Mn::Jmp, Md::Absolute),
    (Mn::Eor, Md::Absolute),
    (Mn::Lsr, Md::Absolute),
    (Mn::Sre, Md::Absolute),
    // 0x50
    (Mn::Bvc, Md::Relative),
    (Mn::Eor, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Sre, Md::IndirectIndexed),
    (Mn::Nop, Md::ZeroPageX),
    (Mn::Eor, Md::ZeroPageX),
    (Mn::Lsr, Md::ZeroPageX),
    (Mn::Sre, Md::ZeroPageX),
    (Mn::Cli, Md::Implied),
    (Mn::Eor, Md::AbsoluteY),
    (Mn::Nop, Md::Implied),
    (Mn::Sre, Md::AbsoluteY),
    (Mn::Nop, Md::AbsoluteX),
    (Mn::Eor, Md::AbsoluteX),
    (Mn::Lsr, Md::AbsoluteX),
    (Mn::Sre, Md::AbsoluteX),
    // 0x60
    (Mn::Rts, Md::Implied),
    (Mn::Adc, Md::IndexedIndirect),
    (Mn::Kil, Md::Implied),
    (Mn::Rra, Md::IndexedIndirect),
    (Mn::Nop, Md::ZeroPage),
    (Mn::Adc, Md::ZeroPage),
    (Mn::Ror, Md::ZeroPage),
    (Mn::Rra, Md::ZeroPage),
    (Mn::Pla, Md::Implied),
    (Mn::Adc, Md::Immediate),
    (Mn::Ror, Md::Accumulator),
    (Mn::Arr, Md::Immediate),
    (Mn::Jmp, Md::Indirect),
    (Mn::Adc, Md::Absolute),
    (Mn::Ror, Md::Absolute),
    (Mn::Rra, Md::Absolute),
    // 0x70
    (Mn::Bvs, Md::Relative),
    (Mn::Adc, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Rra, Md::IndirectIndexed),
    (Mn::Nop, Md::ZeroPageX),
    (Mn::Adc, Md::ZeroPageX),
    (Mn::Ror, Md::ZeroPageX),
    (Mn::Rra, Md::ZeroPageX),
    (Mn::Sei, Md::Implied),
    (Mn::Adc, Md::AbsoluteY),
    (Mn::Nop, Md::Implied),
    (Mn::Rra, Md::AbsoluteY),
    (Mn::Nop, Md::AbsoluteX),
    (Mn::Adc, Md::AbsoluteX),
    (Mn::Ror, Md::AbsoluteX),
    (Mn::Rra, Md::AbsoluteX),
    // 0x80
    (Mn::Nop, Md::Immediate),
    (Mn::Sta, Md::IndexedIndirect),
    (Mn::Nop, Md::Immediate),
    (Mn::Sax, Md::IndexedIndirect),
    (Mn::Sty, Md::ZeroPage),
    (Mn::Sta, Md::ZeroPage),
    (Mn::Stx, Md::ZeroPage),
    (Mn::Sax, Md::ZeroPage),
    (Mn::Dey, Md::Implied),
    (Mn::Nop, Md::Immediate),
    (Mn::Txa, Md::Implied),
    (Mn::Ane, Md::Immediate),
    (Mn::Sty, Md::Absolute),
    (Mn::Sta, Md::Absolute),
    (Mn::Stx, Md::Absolute),
    (Mn::Sax, Md::Absolute),
    // 0x90
    (Mn::Bcc, Md::Relative),
    (Mn::Sta, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Sha, Md::IndirectIndexed),
    (Mn::Sty, Md::ZeroPageX),
    (Mn::Sta, Md::ZeroPageX),
    (Mn::Stx, Md::ZeroPageY),
    (Mn::Sax, Md::ZeroPageY),
    (Mn::Tya, Md::Implied),
    (Mn::Sta, Md::AbsoluteY),
    (Mn::Txs, Md::Implied),
    (Mn::Tas, Md::AbsoluteY),
    (Mn::Shy, Md::AbsoluteX),
    (Mn::Sta, Md::AbsoluteX),
    (Mn::Shx, Md::AbsoluteY),
    (Mn::Sha, Md::AbsoluteY),
    // 0xa0
    (Mn::Ldy, Md::Immediate),
    (Mn::Lda, Md::IndexedIndirect),
    (Mn::Ldx, Md::Immediate),
    (Mn::Lax, Md::IndexedIndirect),
    (Mn::Ldy, Md::ZeroPage),
    (Mn::Lda, Md::ZeroPage),
    (Mn::Ldx, Md::ZeroPage),
    (Mn::Lax, Md::ZeroPage),
    (Mn::Tay, Md::Implied),
    (Mn::Lda, Md::Immediate),
    (Mn::Tax, Md::Implied),
    (Mn::Lxa, Md::Immediate),
    (Mn::Ldy, Md::Absolute),
    (Mn::Lda, Md::Absolute),
    (Mn::Ldx, Md::Absolute),
    (Mn::Lax, Md::Absolute),
    // 0xb0
    (Mn::Bcs, Md::Relative),
    (Mn::Lda, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Lax, Md::IndirectIndexed),
    (Mn::Ldy, Md::ZeroPageX),
    (Mn::Lda, Md::ZeroPageX),
    (Mn::Ldx, Md::ZeroPageY),
    (Mn::Lax, Md::ZeroPageY),
    (Mn::Clv, Md::Implied),
    (Mn::Lda, Md::AbsoluteY),
    (Mn::Tsx, Md::Implied),
    (Mn::Las, Md::AbsoluteY),
    (Mn::Ldy, Md::AbsoluteX),
    (Mn::Lda, Md::AbsoluteX),
    (Mn::Ldx, Md::AbsoluteY),
    (Mn::Lax, Md::AbsoluteY),
    // 0xc0
    (Mn::Cpy, Md::Immediate),
    (Mn::Cmp, Md::IndexedIndirect),
    (Mn::Nop, Md::Immediate),
    (Mn::Dcp, Md::IndexedIndirect),
    (Mn::Cpy, Md::ZeroPage),
    (Mn::Cmp, Md::ZeroPage),
    (Mn::Dec, Md::ZeroPage),
    (Mn::Dcp, Md::ZeroPage),
    (Mn::Iny, Md::Implied),
    (Mn::Cmp, Md::Immediate),
    (Mn::Dex, Md::Implied),
    (Mn::Sbx, Md::Immediate),
    (Mn::Cpy, Md::Absolute),
    (Mn::Cmp, Md::Absolute),
    (Mn::Dec, Md::Absolute),
    (Mn::Dcp, Md::Absolute),
    // 0xd0
    (Mn::Bne, Md::Relative),
    (Mn::Cmp, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Dcp, Md::IndirectIndexed),
    (Mn::Nop, Md::ZeroPageX),
    (Mn::Cmp, Md::ZeroPageX),
    (Mn::Dec, Md::ZeroPageX),
    (Mn::Dcp, Md::ZeroPageX),
    (Mn::Cld, Md::Implied),
    (Mn::Cmp, Md::AbsoluteY),
    (Mn::Nop, Md::Implied),
    (Mn::Dcp, Md::AbsoluteY),
    (Mn::Nop, Md::AbsoluteX),
    (Mn::Cmp, Md::AbsoluteX),
    (Mn::Dec, Md::AbsoluteX),
    (Mn::Dcp, Md::AbsoluteX),
    // 0xe0
    (Mn::Cpx, Md::Immediate),
    (Mn::Sbc, Md::IndexedIndirect),
    (Mn::Nop, Md::Immediate),
    (Mn::Isb, Md::IndexedIndirect),
    (Mn::Cpx, Md::ZeroPage),
    (Mn::Sbc, Md::ZeroPage),
    (Mn::Inc, Md::ZeroPage),
    (Mn::Isb, Md::ZeroPage),
    (Mn::Inx, Md::Implied),
    (Mn::Sbc, Md::Immediate),
    (Mn::Nop, Md::Implied),
    (Mn::Sbc, Md::Immediate),
    (Mn::Cpx, Md::Absolute),
    (Mn::Sbc, Md::Absolute),
    (Mn::Inc, Md::Absolute),
    (Mn::Isb, Md::Absolute),
    // 0xf0
    (Mn::Beq, Md::Relative),
    (Mn::Sbc, Md::IndirectIndexed),
    (Mn::Kil, Md::Implied),
    (Mn::Isb, Md::IndirectIndexed),
    (Mn::Nop, Md::ZeroPageX),
    (Mn::Sbc, Md::ZeroPageX),
    (Mn::Inc, Md::ZeroPageX),
    (Mn::Isb, Md::ZeroPageX),
    (Mn::Sed, Md::Implied),
    (Mn::Sbc, Md::AbsoluteY),
    (Mn::Nop, Md::Implied),
    (Mn::Isb, Md::AbsoluteY),
    (Mn::Nop, Md::AbsoluteX),
    (Mn::Sbc, Md::AbsoluteX),
    (Mn::Inc, Md::AbsoluteX),
    (Mn::Isb, Md::AbsoluteX),
];

const fn build_table() -> [OpcodeInfo; 256] {
    let mut table = [OpcodeInfo::new(Mnemonic::Kil, Mode::Implied); 256];
    let mut index = 0;
    while index < 256 {
        let (mnemonic, mode) = ROWS[index];
        table[index] = OpcodeInfo::new(mnemonic, mode);
        index += 1;
    }
    table
}

/// Decode table indexed by opcode byte.
pub const OPCODE_TABLE: [OpcodeInfo; 256] = build_table();

/// Looks up the decode entry of `opcode`.
#[must_use]
pub const fn opcode_info(opcode: u8) -> OpcodeInfo {
    OPCODE_TABLE[opcode as usize]
}
