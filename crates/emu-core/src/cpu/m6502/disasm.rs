//! Instruction disassembly for the 6502.
//!
//! Output uses lower-case mnemonics and `$`-prefixed hex operands; branch operands are shown as
//! absolute targets.

use super::table::{opcode_info, Mode};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A single disassembled instruction row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DisassemblyRow {
    /// The starting address of this instruction.
    pub addr_start: u16,
    /// Length in bytes, 1 to 3.
    pub len_bytes: u8,
    /// Raw instruction bytes.
    pub bytes: Vec<u8>,
    /// The instruction mnemonic (e.g., "lda", "jsr").
    pub mnemonic: String,
    /// The formatted operands (e.g., "#$12" or "($20),y").
    pub operands: String,
    /// Whether the opcode is outside the documented set.
    pub is_undocumented: bool,
}

/// Disassembles one instruction from `bytes`, which start at `pc`.
///
/// Returns the text and the instruction length. When `bytes` is shorter than the instruction,
/// the first byte is shown as `.byte` with a length of 1; an empty slice yields an empty string
/// and a length of 0.
#[must_use]
pub fn disassemble(pc: u16, bytes: &[u8]) -> (String, usize) {
    match decode(pc, bytes) {
        Some((mnemonic, operands, len)) if operands.is_empty() => (mnemonic.to_owned(), len),
        Some((mnemonic, operands, len)) => (format!("{mnemonic} {operands}"), len),
        None => bytes
            .first()
            .map_or((String::new(), 0), |byte| (format!(".byte ${byte:02x}"), 1)),
    }
}

fn decode(pc: u16, bytes: &[u8]) -> Option<(&'static str, String, usize)> {
    let opcode = *bytes.first()?;
    let info = opcode_info(opcode);
    let len = usize::from(info.mode.length());
    let operand = bytes.get(1..len)?;
    let byte = operand.first().copied().unwrap_or(0);
    let word = u16::from_le_bytes([byte, operand.get(1).copied().unwrap_or(0)]);
    let operands = match info.mode {
        Mode::Implied => String::new(),
        Mode::Accumulator => "a".to_owned(),
        Mode::Immediate => format!("#${byte:02x}"),
        Mode::ZeroPage => format!("${byte:02x}"),
        Mode::ZeroPageX => format!("${byte:02x},x"),
        Mode::ZeroPageY => format!("${byte:02x},y"),
        Mode::Absolute => format!("${word:04x}"),
        Mode::AbsoluteX => format!("${word:04x},x"),
        Mode::AbsoluteY => format!("${word:04x},y"),
        Mode::IndexedIndirect => format!("(${byte:02x},x)"),
        Mode::IndirectIndexed => format!("(${byte:02x}),y"),
        Mode::Indirect => format!("(${word:04x})"),
        Mode::Relative => {
            let offset = i16::from(i8::from_le_bytes([byte]));
            let target = pc.wrapping_add(2).wrapping_add_signed(offset);
            format!("${target:04x}")
        }
    };
    Some((info.mnemonic.name(), operands, len))
}

/// Disassembles a window of instructions around `center_pc`.
///
/// `memory` is indexed by address. Rows that would run past the end of `memory` are omitted.
/// Instructions before the center are found by scanning backwards for an instruction that ends
/// exactly at the next row, preferring the longest encoding.
#[must_use]
pub fn disassemble_window(
    center_pc: u16,
    before: usize,
    after: usize,
    memory: &[u8],
) -> Vec<DisassemblyRow> {
    let mut forward_rows = Vec::with_capacity(after + 1);
    let mut pc = center_pc;
    for _ in 0..=after {
        let Some(row) = disassemble_one(pc, memory) else {
            break;
        };
        pc = pc.wrapping_add(u16::from(row.len_bytes));
        forward_rows.push(row);
    }

    let mut found_before: Vec<DisassemblyRow> = Vec::new();
    let mut scan_pc = center_pc;
    while scan_pc > 0 && found_before.len() < before {
        let mut found_one = false;
        for len in [3u8, 2, 1] {
            if scan_pc < u16::from(len) {
                continue;
            }
            let try_pc = scan_pc - u16::from(len);
            if let Some(row) = disassemble_one(try_pc, memory) {
                if row.len_bytes == len {
                    found_before.push(row);
                    scan_pc = try_pc;
                    found_one = true;
                    break;
                }
            }
        }
        if !found_one {
            scan_pc -= 1;
        }
    }
    found_before.reverse();
    found_before.extend(forward_rows);
    found_before
}

fn disassemble_one(pc: u16, memory: &[u8]) -> Option<DisassemblyRow> {
    let start = usize::from(pc);
    let opcode = *memory.get(start)?;
    let info = opcode_info(opcode);
    let bytes = memory.get(start..start + usize::from(info.mode.length()))?;
    let (mnemonic, operands, _) = decode(pc, bytes)?;
    Some(DisassemblyRow {
        addr_start: pc,
        len_bytes: info.mode.length(),
        bytes: bytes.to_vec(),
        mnemonic: mnemonic.to_owned(),
        operands,
        is_undocumented: info.mnemonic.is_undocumented(),
    })
}

#[cfg(test)]
mod tests {
    use super::{disassemble, disassemble_window};
    use rstest::rstest;

    #[rstest]
    #[case(&[0xa9, 0x12], "lda #$12", 2)]
    #[case(&[0xbd, 0x34, 0x12], "lda $1234,x", 3)]
    #[case(&[0xb1, 0x12], "lda ($12),y", 2)]
    #[case(&[0xa1, 0x12], "lda ($12,x)", 2)]
    #[case(&[0x6c, 0x34, 0x12], "jmp ($1234)", 3)]
    #[case(&[0x0a], "asl a", 1)]
    #[case(&[0xb6, 0x80], "ldx $80,y", 2)]
    #[case(&[0xea], "nop", 1)]
    #[case(&[0xa7, 0x10], "lax $10", 2)]
    fn formats_each_addressing_mode(
        #[case] bytes: &[u8],
        #[case] text: &str,
        #[case] len: usize,
    ) {
        assert_eq!(disassemble(0x0200, bytes), (text.to_owned(), len));
    }

    #[test]
    fn branches_show_absolute_targets() {
        assert_eq!(disassemble(0x0200, &[0xd0, 0xfe]).0, "bne $0200");
        assert_eq!(disassemble(0x0200, &[0x10, 0x10]).0, "bpl $0212");
        assert_eq!(disassemble(0xfff0, &[0xf0, 0x20]).0, "beq $0012");
    }

    #[test]
    fn truncated_input_falls_back_to_a_byte_directive() {
        assert_eq!(disassemble(0, &[0xad, 0x00]), (".byte $ad".to_owned(), 1));
        assert_eq!(disassemble(0, &[]), (String::new(), 0));
    }

    #[test]
    fn window_walks_back_to_instruction_boundaries() {
        let mut memory = vec![0xea; 0x20];
        // lda #$01 ; sta $0400 ; nop
        memory[0x10..0x16].copy_from_slice(&[0xa9, 0x01, 0x8d, 0x00, 0x04, 0xea]);
        let rows = disassemble_window(0x15, 2, 1, &memory);
        let starts: Vec<u16> = rows.iter().map(|row| row.addr_start).collect();
        assert_eq!(starts, vec![0x10, 0x12, 0x15, 0x16]);
        assert_eq!(rows[1].mnemonic, "sta");
        assert_eq!(rows[1].operands, "$0400");
        assert_eq!(rows[1].bytes, vec![0x8d, 0x00, 0x04]);
        assert!(!rows[2].is_undocumented);
    }

    #[test]
    fn window_stops_at_the_end_of_memory() {
        let memory = [0xea, 0xea, 0x4c];
        let rows = disassemble_window(0, 0, 5, &memory);
        assert_eq!(rows.len(), 2);
    }
}
