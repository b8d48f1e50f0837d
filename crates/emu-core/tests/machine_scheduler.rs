//! A 6502 on an address space inside a machine: timer-driven interrupts, burst DMA holding
//! the core, and timer ordering.

use std::cell::RefCell;
use std::rc::Rc;

use emu_core::cpu::m6502::{SpaceInterface, FLAG_B, FLAG_I};
use emu_core::dma::hd63450::ChannelState;
use emu_core::memory::{DataWidth, Endianness, MemoryBlock, SpaceConfig};
use emu_core::{
    AddressSpace, Hd63450, Hd63450Config, M6502Config, Machine, SharedSpace, Time, M6502,
};
use log as _;
use proptest::prelude::*;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

// cli ; loop: inx ; jmp loop
const COUNTER: [u8; 5] = [0x58, 0xe8, 0x4c, 0x01, 0x02];
// lda #$aa ; sta $10 ; jmp *
const HANDLER: [u8; 7] = [0xa9, 0xaa, 0x85, 0x10, 0x4c, 0x04, 0x03];

struct Rig {
    machine: Machine,
    ram: MemoryBlock,
    space: SharedSpace,
    cpu: Rc<RefCell<M6502<SpaceInterface>>>,
}

fn rig() -> Rig {
    let mut machine = Machine::new();
    let config = SpaceConfig::new("program", DataWidth::Bits8, 16, Endianness::Little);
    let mut space = AddressSpace::new(config, machine.context().clone()).expect("space");
    let ram = space.install_ram(0x0000, 0xffff, 0).expect("ram");
    ram.load(0x0200, &COUNTER);
    ram.load(0x0300, &HANDLER);
    ram.load(0xfffc, &[0x00, 0x02]);
    ram.load(0xfffe, &[0x00, 0x03]);
    let space = space.into_shared();
    let cpu = M6502::with_spaces(
        M6502Config::default(),
        machine.context().clone(),
        space.clone(),
        None,
    )
    .expect("6502 geometry");
    let cpu = Rc::new(RefCell::new(cpu));
    machine.add_executor(cpu.clone());
    Rig { machine, ram, space, cpu }
}

#[test]
fn timer_raised_irq_enters_the_handler() {
    let mut rig = rig();
    let irq = rig.cpu.borrow().irq_line().clone();
    let timer = rig.machine.add_timer_callback("vblank", move |_| irq.set_level(true));
    rig.machine
        .scheduler()
        .borrow_mut()
        .adjust(timer, Time::from_usec(100), 0, Time::NEVER);

    rig.machine.run_for(Time::from_usec(90));
    assert_eq!(rig.ram.byte(0x10), 0);
    rig.machine.run_for(Time::from_usec(110));
    assert_eq!(rig.ram.byte(0x10), 0xaa);

    let cpu = rig.cpu.borrow();
    assert_eq!(cpu.sp(), 0xfa);
    assert_ne!(cpu.p() & FLAG_I, 0);
    assert_eq!(rig.ram.byte(0x01fb) & FLAG_B, 0, "hardware interrupts push B clear");
    let pushed = u16::from_le_bytes([rig.ram.byte(0x01fc), rig.ram.byte(0x01fd)]);
    assert!((0x0201..=0x0204).contains(&pushed), "returns into the loop, got {pushed:04x}");
    assert_eq!(rig.machine.executor_cycles(0), Some(200));
}

#[test]
fn burst_dma_holds_the_cpu_until_the_block_is_done() {
    let mut rig = rig();
    let pattern: Vec<u8> = (0..64u8).map(|i| i ^ 0x5a).collect();
    rig.ram.load(0x1000, &pattern);
    let dmac = Hd63450::new(Hd63450Config::default(), rig.space.clone(), rig.machine.scheduler());
    let dmac = Rc::new(RefCell::new(dmac));
    rig.machine.add_timer_device(dmac.clone());
    {
        let mut dmac = dmac.borrow_mut();
        dmac.set_cpu_halt_line(rig.cpu.borrow().halt_line().clone());
        dmac.write(0x05, 64, 0xffff);
        dmac.write(0x07, 0x1000, 0xffff);
        dmac.write(0x0b, 0x2000, 0xffff);
        // burst, memory to device, bytes, auto request
        dmac.write(0x02, 0x0000, 0xffff);
    }

    rig.machine.run_for(Time::from_usec(50));
    let before = rig.cpu.borrow().total_cycles();
    assert!(before > 0);
    dmac.borrow_mut().write(0x03, 0x0580, 0xffff);
    assert!(rig.cpu.borrow().halt_line().level());

    rig.machine.run_for(Time::from_usec(10));
    assert_eq!(rig.cpu.borrow().total_cycles(), before, "held during the burst");

    rig.machine.run_for(Time::from_usec(40));
    assert_eq!(rig.ram.to_vec()[0x2000..0x2040], pattern[..]);
    assert_eq!(dmac.borrow().channel_state(0), ChannelState::Idle);
    let cpu = rig.cpu.borrow();
    assert!(!cpu.halt_line().level());
    assert!(cpu.total_cycles() > before);
    assert_eq!(rig.machine.executor_cycles(0), Some(100));
}

#[test]
fn timers_due_together_fire_in_allocation_order() {
    let mut machine = Machine::new();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let timers: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let log = fired.clone();
            machine.add_timer_callback(name, move |_| log.borrow_mut().push(name))
        })
        .collect();
    for &timer in timers.iter().rev() {
        machine
            .scheduler()
            .borrow_mut()
            .adjust(timer, Time::from_usec(5), 0, Time::NEVER);
    }
    machine.run_for(Time::from_usec(10));
    assert_eq!(*fired.borrow(), ["a", "b", "c"]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn periodic_timers_fire_once_per_period(period in 1u64..20, span in 1u64..200) {
        let mut machine = Machine::new();
        let count = Rc::new(RefCell::new(0u64));
        let seen = count.clone();
        let timer = machine.add_timer_callback("tick", move |_| *seen.borrow_mut() += 1);
        let every = Time::from_usec(period);
        machine.scheduler().borrow_mut().adjust(timer, every, 0, every);
        machine.run_for(Time::from_usec(span));
        let expected = span / period;
        prop_assert_eq!(*count.borrow(), expected);
        prop_assert_eq!(machine.now(), Time::from_usec(span));
    }
}
