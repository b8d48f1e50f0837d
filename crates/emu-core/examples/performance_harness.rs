//! Throughput harness for the 6502 core on dispatched address spaces.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p emu-core --release --example performance_harness
//! ```
//!
//! ## Metrics
//!
//! - Emulated cycles per second
//! - Real-time multiple of a 1 MHz part
//!
//! Each thread builds its own machine, so the figures reflect independent cores running side
//! by side.

#![allow(clippy::pedantic)]

use emu_core::memory::{DataWidth, Endianness, MemoryBlock, SpaceConfig};
use emu_core::{AddressSpace, ExecuteDevice, M6502Config, MachineContext, M6502};
use log as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const SLICE_CYCLES: i32 = 10_000;
const CLOCK_HZ: f64 = 1_000_000.0;
const NUM_THREADS: usize = 4;

// loop: inx ; dey ; nop ; jmp loop
const REGISTER_LOOP: &[u8] = &[0xe8, 0x88, 0xea, 0x4c, 0x00, 0x02];
// loop: lda $10,x ; sta $0400,x ; inc $20 ; inx ; jmp loop
const MEMORY_LOOP: &[u8] = &[
    0xb5, 0x10, 0x9d, 0x00, 0x04, 0xe6, 0x20, 0xe8, 0x4c, 0x00, 0x02,
];

#[derive(Debug, Clone, Copy)]
struct BenchmarkResult {
    name: &'static str,
    cycles_per_second: f64,
    realtime_multiple: f64,
}

fn run_core(program: &'static [u8], use_cache: bool, duration: Duration) -> u64 {
    let ctx = MachineContext::new();
    let config = SpaceConfig::new("program", DataWidth::Bits8, 16, Endianness::Little)
        .with_log_unmap(false);
    let mut space = AddressSpace::new(config, ctx.clone()).expect("space");
    let ram = space.install_ram(0x0000, 0x7fff, 0).expect("ram");
    let rom = MemoryBlock::new(0x8000);
    rom.load(0x7ffc, &[0x00, 0x02]);
    space.install_rom(0x8000, 0xffff, 0, &rom).expect("rom");
    ram.load(0x0200, program);

    let config = M6502Config {
        use_cache,
        ..M6502Config::default()
    };
    let mut cpu = M6502::with_spaces(config, ctx, space.into_shared(), None).expect("geometry");
    let start = Instant::now();
    while start.elapsed() < duration {
        cpu.set_icount(SLICE_CYCLES);
        cpu.execute_run();
    }
    cpu.total_cycles()
}

fn benchmark(
    name: &'static str,
    program: &'static [u8],
    use_cache: bool,
    duration: Duration,
) -> BenchmarkResult {
    let (tx, rx) = mpsc::channel();
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let tx = tx.clone();
            thread::spawn(move || {
                tx.send(run_core(program, use_cache, duration)).ok();
            })
        })
        .collect();
    for h in handles {
        h.join().ok();
    }
    drop(tx);

    let total_cycles: u64 = rx.iter().sum();
    let cycles_per_second = total_cycles as f64 / duration.as_secs_f64();
    BenchmarkResult {
        name,
        cycles_per_second,
        realtime_multiple: cycles_per_second / CLOCK_HZ,
    }
}

fn format_number(n: f64) -> String {
    if n >= 1_000_000.0 {
        format!("{:.2}M", n / 1_000_000.0)
    } else if n >= 1_000.0 {
        format!("{:.2}K", n / 1_000.0)
    } else {
        format!("{:.2}", n)
    }
}

fn print_results(results: &[BenchmarkResult]) {
    println!();
    println!("emu-core performance harness, {NUM_THREADS} threads, {SLICE_CYCLES} cycles per slice");
    println!("{:18} {:>14} {:>12}", "benchmark", "cycles/sec", "x realtime");
    for result in results {
        println!(
            "{:18} {:>14} {:>12.1}",
            result.name,
            format_number(result.cycles_per_second),
            result.realtime_multiple
        );
    }
}

fn main() {
    let duration = Duration::from_secs(2);
    let results = [
        benchmark("registers/cached", REGISTER_LOOP, true, duration),
        benchmark("registers/direct", REGISTER_LOOP, false, duration),
        benchmark("memory/cached", MEMORY_LOOP, true, duration),
        benchmark("memory/direct", MEMORY_LOOP, false, duration),
    ];
    print_results(&results);
}
