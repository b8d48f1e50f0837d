#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use emu_core::memory::{DataWidth, Endianness, SpaceConfig};
use emu_core::{
    AddressSpace, BusDevice, ExecuteDevice, M6502Config, MachineContext, SharedBusDevice, M6502,
};
use libfuzzer_sys::fuzz_target;

/// Latches the last byte written and returns it on reads.
#[derive(Default)]
struct Latch(u64);

impl BusDevice for Latch {
    fn read(&mut self, _offset: u32, _mem_mask: u64) -> u64 {
        self.0
    }

    fn write(&mut self, _offset: u32, data: u64, mem_mask: u64) {
        self.0 = data & mem_mask;
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let (header, program) = data.split_at(4);
    let ctx = MachineContext::new();
    let config = SpaceConfig::new("program", DataWidth::Bits8, 16, Endianness::Little)
        .with_log_unmap(false)
        .with_unmap_value(u64::from(header[0]));
    let Ok(mut space) = AddressSpace::new(config, ctx.clone()) else {
        return;
    };
    let Ok(ram) = space.install_ram(0x0000, 0x3fff, u32::from(header[1] & 0xc0) << 8) else {
        return;
    };
    let latch: SharedBusDevice = Rc::new(RefCell::new(Latch::default()));
    if space.install_device(0xd000, 0xd0ff, 0, &latch).is_err() {
        return;
    }
    let _ = space.verify_coverage();
    ram.load(0x0200, program);
    ram.load(0x3ffc, &[0x00, 0x02]);
    ram.load(0x3ffe, &[0x00, 0x02]);

    let config = M6502Config {
        use_cache: header[2] & 1 != 0,
        ..M6502Config::default()
    };
    let Ok(mut cpu) = M6502::with_spaces(config, ctx, space.into_shared(), None) else {
        return;
    };
    cpu.irq_line().set_level(header[3] & 1 != 0);
    for _ in 0..8 {
        cpu.set_icount(i32::from(header[3]) + 1);
        cpu.execute_run();
    }
});
