//! 6502 arithmetic truth tables, instruction timing and resumable execution.

use emu_core::cpu::m6502::{
    alu, FlatMemory, M6502Config, Mnemonic, Mode, M6502, FLAG_C, FLAG_D, FLAG_N, FLAG_V, FLAG_Z,
    OPCODE_TABLE,
};
use emu_core::{ExecuteDevice, MachineContext};
use log as _;
use proptest::prelude::*;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

fn boot(program: &[u8]) -> M6502<FlatMemory> {
    let mut memory = FlatMemory::new();
    memory.load(0x0200, program);
    memory.set_reset_vector(0x0200);
    let mut cpu = M6502::new(M6502Config::default(), MachineContext::new(), memory);
    run(&mut cpu, 8);
    cpu
}

fn run(cpu: &mut M6502<FlatMemory>, cycles: i32) {
    cpu.set_icount(cycles);
    cpu.execute_run();
    assert_eq!(cpu.icount(), 0, "a cycle-stepped core spends its budget exactly");
}

fn nz(value: u8) -> u8 {
    let mut p = 0;
    if value == 0 {
        p |= FLAG_Z;
    }
    if value & 0x80 != 0 {
        p |= FLAG_N;
    }
    p
}

#[test]
fn binary_adc_matches_the_reference_truth_table() {
    for a in 0..=u8::MAX {
        for value in 0..=u8::MAX {
            for carry in [0u8, 1] {
                let wide = u16::from(a) + u16::from(value) + u16::from(carry);
                let [result, high] = wide.to_le_bytes();
                let mut expected = nz(result);
                if high != 0 {
                    expected |= FLAG_C;
                }
                if (a ^ result) & (value ^ result) & 0x80 != 0 {
                    expected |= FLAG_V;
                }
                let flags = FLAG_N | FLAG_V | FLAG_Z | FLAG_C;
                let (got, p) = alu::adc_binary(a, value, carry);
                assert_eq!((got, p & flags), (result, expected), "{a:02x} + {value:02x} + {carry}");
            }
        }
    }
}

#[test]
fn binary_sbc_matches_the_reference_truth_table() {
    for a in 0..=u8::MAX {
        for value in 0..=u8::MAX {
            for carry in [0u8, 1] {
                let wide = i16::from(a) - i16::from(value) - i16::from(1 - carry);
                let [result, _] = wide.to_le_bytes();
                let mut expected = nz(result);
                if wide >= 0 {
                    expected |= FLAG_C;
                }
                if (a ^ value) & (a ^ result) & 0x80 != 0 {
                    expected |= FLAG_V;
                }
                let flags = FLAG_N | FLAG_V | FLAG_Z | FLAG_C;
                let (got, p) = alu::sbc_binary(a, value, carry);
                assert_eq!((got, p & flags), (result, expected), "{a:02x} - {value:02x} - !{carry}");
            }
        }
    }
}

#[rstest]
#[case(0x09, 0x01, 0, 0x10, 0)]
#[case(0x58, 0x46, FLAG_C, 0x05, FLAG_C | FLAG_N | FLAG_V)]
#[case(0x12, 0x34, 0, 0x46, 0)]
#[case(0x99, 0x01, 0, 0x00, FLAG_C | FLAG_N)]
#[case(0x50, 0x50, 0, 0x00, FLAG_C | FLAG_N | FLAG_V)]
fn decimal_adc_keeps_nmos_flag_quirks(
    #[case] a: u8,
    #[case] value: u8,
    #[case] carry: u8,
    #[case] result: u8,
    #[case] flags: u8,
) {
    let (got, p) = alu::adc(a, value, FLAG_D | carry);
    assert_eq!(got, result);
    assert_eq!(p & (FLAG_N | FLAG_V | FLAG_Z | FLAG_C), flags);
    assert_ne!(p & FLAG_D, 0);
}

#[rstest]
#[case::lda_immediate(&[0xa9, 0x01], 2, 0x0202)]
#[case::lda_absolute(&[0xad, 0x00, 0x10], 4, 0x0203)]
#[case::lda_indirect_indexed(&[0xb1, 0x10], 5, 0x0202)]
#[case::sta_absolute_x(&[0x9d, 0x00, 0x10], 5, 0x0203)]
#[case::inc_zero_page(&[0xe6, 0x10], 5, 0x0202)]
#[case::inc_absolute_x(&[0xfe, 0x00, 0x10], 7, 0x0203)]
#[case::pha(&[0x48], 3, 0x0201)]
#[case::pla(&[0x68], 4, 0x0201)]
#[case::nop(&[0xea], 2, 0x0201)]
#[case::jsr(&[0x20, 0x00, 0x03], 6, 0x0300)]
#[case::jmp_absolute(&[0x4c, 0x00, 0x03], 3, 0x0300)]
#[case::branch_not_taken(&[0xd0, 0x10], 2, 0x0202)]
#[case::lax_zero_page(&[0xa7, 0x10], 3, 0x0202)]
fn instructions_take_their_documented_cycles(
    #[case] program: &[u8],
    #[case] cycles: i32,
    #[case] next: u16,
) {
    let mut bytes = program.to_vec();
    bytes.resize(0x10, 0xea);
    // lda #$01 leaves Z clear so bne is not taken
    let mut cpu = if program[0] == 0xd0 {
        let mut prefixed = vec![0xa9, 0x01];
        prefixed.extend_from_slice(&bytes);
        let mut cpu = boot(&prefixed);
        run(&mut cpu, 2);
        cpu
    } else {
        boot(&bytes)
    };
    let start = cpu.ppc();
    run(&mut cpu, cycles - 1);
    assert_eq!(cpu.ppc(), start, "instruction ended early");
    run(&mut cpu, 1);
    let expected = if program[0] == 0xd0 { next + 2 } else { next };
    assert_eq!(cpu.ppc(), expected);
}

#[test]
fn every_opcode_takes_the_cycles_its_table_entry_lists() {
    let mut mismatches = Vec::new();
    for (opcode, info) in (0u8..=u8::MAX).zip(OPCODE_TABLE) {
        if matches!(info.mnemonic, Mnemonic::Kil) || matches!(info.mode, Mode::Relative) {
            continue;
        }
        // operands stay on one page with X = 0x80 and Y = 0
        let mut program = vec![opcode, 0x10, 0x10];
        program.resize(0x10, 0xea);
        let mut cpu = boot(&program);
        let start = cpu.ppc();
        let cycles = i32::from(info.cycles);
        run(&mut cpu, cycles - 1);
        let early = cpu.ppc() != start;
        run(&mut cpu, 1);
        if early || cpu.ppc() == start {
            mismatches.push(format!("{opcode:02x} {}", info.mnemonic.name()));
        }
    }
    assert!(mismatches.is_empty(), "cycle table disagrees with execution: {mismatches:?}");
}

// ldx #0 ; loop: txa ; adc #3 ; sta $0300,x ; inx ; cpx #$40 ; bne loop ; jmp *
const TABLE_BUILDER: [u8; 16] = [
    0xa2, 0x00, 0x8a, 0x69, 0x03, 0x9d, 0x00, 0x03, 0xe8, 0xe0, 0x40, 0xd0, 0xf5, 0x4c, 0x0d,
    0x02,
];
const TABLE_CYCLES: i32 = 1_500;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn execution_resumes_exactly_at_any_split(
        chunks in prop::collection::vec(1i32..97, 1..40)
    ) {
        let mut whole = boot(&TABLE_BUILDER);
        run(&mut whole, TABLE_CYCLES);

        let mut split = boot(&TABLE_BUILDER);
        let mut spent = 0;
        for chunk in chunks {
            let chunk = chunk.min(TABLE_CYCLES - spent);
            if chunk == 0 {
                break;
            }
            run(&mut split, chunk);
            spent += chunk;
        }
        run(&mut split, TABLE_CYCLES - spent);

        prop_assert_eq!(split.snapshot(), whole.snapshot());
        prop_assert_eq!(split.memory().bytes(), whole.memory().bytes());
    }
}

#[test]
fn table_builder_produces_the_expected_table() {
    let mut cpu = boot(&TABLE_BUILDER);
    run(&mut cpu, TABLE_CYCLES);
    let table = &cpu.memory().bytes()[0x0300..0x0340];
    for (index, &value) in (0u8..).zip(table) {
        assert_eq!(value, index + 3);
    }
    assert_eq!(cpu.x(), 0x40);
    assert_eq!(cpu.ppc(), 0x020d);
}

#[test]
fn snapshots_restore_into_a_fresh_core() {
    let mut cpu = boot(&TABLE_BUILDER);
    run(&mut cpu, 333);
    let snapshot = cpu.snapshot();
    let mut memory = FlatMemory::new();
    memory.load(0, cpu.memory().bytes());
    let mut copy = M6502::new(M6502Config::default(), MachineContext::new(), memory);
    copy.restore(&snapshot);
    run(&mut cpu, 200);
    run(&mut copy, 200);
    assert_eq!(copy.snapshot(), cpu.snapshot());
}

#[test]
fn snapshots_carry_the_nmi_line_and_its_latched_edge() {
    let mut cpu = boot(&TABLE_BUILDER);
    run(&mut cpu, 101);
    cpu.nmi_line().set_level(true);
    let snapshot = cpu.snapshot();
    assert!(snapshot.nmi_level && snapshot.nmi_pending);

    let mut memory = FlatMemory::new();
    memory.load(0, cpu.memory().bytes());
    let mut copy = M6502::new(M6502Config::default(), MachineContext::new(), memory);
    copy.restore(&snapshot);
    assert!(copy.nmi_line().level());
    assert!(copy.nmi_line().edge_pending());
    assert_eq!(copy.sync(), cpu.sync());
    assert_eq!(copy.snapshot(), snapshot);

    run(&mut cpu, 40);
    run(&mut copy, 40);
    assert_eq!(copy.snapshot(), cpu.snapshot());
    assert_eq!(copy.memory().bytes(), cpu.memory().bytes());
}
