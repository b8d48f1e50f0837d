//! Deterministic run fingerprint used by CI cross-host comparison.
//!
//! Boots a 6502 on a dispatched address space, interrupts it from a periodic timer and
//! hashes the final registers and memory.

use std::cell::RefCell;
use std::rc::Rc;

use emu_core::memory::{DataWidth, Endianness, SpaceConfig};
use emu_core::{AddressSpace, M6502Config, Machine, Time, M6502};
use log as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

// ldx #0 ; cli ; loop: txa ; adc #7 ; sta $0400,x ; inx ; jmp loop
const MAIN: [u8; 12] = [0xa2, 0x00, 0x58, 0x8a, 0x69, 0x07, 0x9d, 0x00, 0x04, 0xe8, 0x4c, 0x03];
// inc $20 ; lda $20 ; sta $0500 ; rti, with the acknowledge done by the timer
const HANDLER: [u8; 8] = [0xe6, 0x20, 0xa5, 0x20, 0x8d, 0x00, 0x05, 0x40];

fn hash_bytes(hash: &mut u64, bytes: &[u8]) {
    for byte in bytes {
        *hash ^= u64::from(*byte);
        *hash = hash.wrapping_mul(0x1000_0000_01B3);
    }
}

fn fingerprint() -> String {
    let mut machine = Machine::new();
    let config = SpaceConfig::new("program", DataWidth::Bits8, 16, Endianness::Little);
    let mut space = AddressSpace::new(config, machine.context().clone()).expect("space");
    let ram = space.install_ram(0x0000, 0xffff, 0).expect("ram");
    ram.load(0x0200, &MAIN);
    ram.load(0x020c, &[0x02]);
    ram.load(0x0300, &HANDLER);
    ram.load(0xfffc, &[0x00, 0x02]);
    ram.load(0xfffe, &[0x00, 0x03]);

    let cpu = M6502::with_spaces(
        M6502Config::default(),
        machine.context().clone(),
        space.into_shared(),
        None,
    )
    .expect("6502 geometry");
    let cpu = Rc::new(RefCell::new(cpu));
    machine.add_executor(cpu.clone());

    let irq = cpu.borrow().irq_line().clone();
    let raise = machine.add_timer_callback("raise", move |_| irq.set_level(true));
    let irq = cpu.borrow().irq_line().clone();
    let ack = machine.add_timer_callback("ack", move |_| irq.set_level(false));
    {
        let mut sched = machine.scheduler().borrow_mut();
        sched.adjust(raise, Time::from_usec(997), 0, Time::from_usec(1_000));
        sched.adjust(ack, Time::from_usec(1_010), 0, Time::from_usec(1_000));
    }
    machine.run_for(Time::from_usec(20_000));

    let cpu = cpu.borrow();
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    hash_bytes(&mut hash, &cpu.pc().to_le_bytes());
    hash_bytes(&mut hash, &[cpu.a(), cpu.x(), cpu.y(), cpu.p(), cpu.sp()]);
    hash_bytes(&mut hash, &cpu.total_cycles().to_le_bytes());
    hash_bytes(&mut hash, &ram.to_vec());

    format!("{hash:016x}")
}

fn main() {
    println!("{}", fingerprint());
}
