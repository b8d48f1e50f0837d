//! Cooperative time-slice driver.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::api::ExecuteDevice;
use crate::context::{MachineContext, SharedContext};
use crate::scheduler::{Scheduler, SharedScheduler, TimerId};
use crate::timing::Time;

/// A device that owns scheduler timers.
pub trait TimerDevice {
    /// Timers the machine routes to this device.
    fn timer_ids(&self) -> Vec<TimerId>;

    /// Called when one of the device's timers fires.
    fn device_timer(&mut self, id: TimerId, param: u32);
}

/// Shared handle to an executing device.
pub type SharedExecutor = Rc<RefCell<dyn ExecuteDevice>>;
/// Shared handle to a timer-owning device.
pub type SharedTimerDevice = Rc<RefCell<dyn TimerDevice>>;

enum TimerRoute {
    Device(SharedTimerDevice),
    Callback(Box<dyn FnMut(u32)>),
}

struct ExecSlot {
    device: SharedExecutor,
    cycles: u64,
}

/// Owns the scheduler and interleaves executing devices in virtual time.
///
/// Each slice ends at the earlier of the run target and the next timer expiry. Executors run
/// in registration order; an executor that is suspended (halted by a bus master) performs no
/// work and has its cycle count moved to the slice end.
pub struct Machine {
    ctx: SharedContext,
    scheduler: SharedScheduler,
    executors: Vec<ExecSlot>,
    routes: HashMap<TimerId, TimerRoute>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Creates a machine at time zero.
    #[must_use]
    pub fn new() -> Self {
        let ctx = MachineContext::new();
        let scheduler = Scheduler::shared(Rc::clone(&ctx));
        Self {
            ctx,
            scheduler,
            executors: Vec::new(),
            routes: HashMap::new(),
        }
    }

    /// Machine context, shared with spaces and devices.
    #[must_use]
    pub const fn context(&self) -> &SharedContext {
        &self.ctx
    }

    /// Scheduler, shared with devices that arm timers.
    #[must_use]
    pub const fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.ctx.now()
    }

    /// Registers an executing device; execution order follows registration order.
    pub fn add_executor(&mut self, device: SharedExecutor) {
        let cycles = device.borrow().clock().time_to_cycles(self.ctx.now());
        self.executors.push(ExecSlot { device, cycles });
    }

    /// Routes every timer of `device` to it.
    pub fn add_timer_device(&mut self, device: SharedTimerDevice) {
        let ids = device.borrow().timer_ids();
        for id in ids {
            self.routes.insert(id, TimerRoute::Device(Rc::clone(&device)));
        }
    }

    /// Allocates a timer handled by a closure.
    pub fn add_timer_callback(&mut self, name: &str, callback: impl FnMut(u32) + 'static) -> TimerId {
        let id = self.scheduler.borrow_mut().allocate(name);
        self.routes.insert(id, TimerRoute::Callback(Box::new(callback)));
        id
    }

    /// Cycles executed so far by the executor registered at `index`.
    #[must_use]
    pub fn executor_cycles(&self, index: usize) -> Option<u64> {
        self.executors.get(index).map(|slot| slot.cycles)
    }

    /// Runs for `duration` of virtual time.
    pub fn run_for(&mut self, duration: Time) {
        let target = self.ctx.now().saturating_add(duration);
        self.run_until(target);
    }

    /// Runs until virtual time reaches `target`.
    pub fn run_until(&mut self, target: Time) {
        loop {
            self.fire_due_timers(self.ctx.now());
            let now = self.ctx.now();
            if now >= target {
                break;
            }
            let mut slice_end = target.min(self.scheduler.borrow().next_expiry());
            self.ctx.set_slice_end(slice_end);
            for slot in &mut self.executors {
                let device = Rc::clone(&slot.device);
                let clock = device.borrow().clock();
                let target_cycles = clock.time_to_cycles(slice_end);
                if device.borrow().is_suspended() {
                    slot.cycles = slot.cycles.max(target_cycles);
                    continue;
                }
                if target_cycles <= slot.cycles {
                    continue;
                }
                let budget = i32::try_from(target_cycles - slot.cycles).unwrap_or(i32::MAX);
                let (tag, pc_chars) = {
                    let device = device.borrow();
                    (device.tag().to_owned(), device.pc_chars())
                };
                self.ctx.set_executing(&tag, pc_chars);
                self.ctx.begin_exec(clock, slot.cycles);
                let left = {
                    let mut device = device.borrow_mut();
                    device.set_icount(budget);
                    device.execute_run();
                    device.icount()
                };
                let aborted = self.ctx.abort_requested();
                self.ctx.end_exec();
                self.ctx.clear_executing();
                let consumed = i64::from(budget) - i64::from(left);
                slot.cycles += u64::try_from(consumed).unwrap_or(0);
                if aborted {
                    log::trace!(target: "emu_core::machine", "'{tag}' yielded early");
                    // later executors and the timer queue must not pass the yield point
                    slice_end = slice_end.min(clock.cycles_to_time(slot.cycles));
                }
                slice_end = slice_end.min(self.scheduler.borrow().next_expiry());
                self.ctx.set_slice_end(slice_end);
            }
            self.ctx.set_slice_end(Time::NEVER);
            let slice_end = slice_end.max(now);
            self.ctx.set_base_time(slice_end);
        }
    }

    fn fire_due_timers(&mut self, limit: Time) {
        loop {
            let due = self.scheduler.borrow_mut().pop_due(limit);
            let Some((id, param)) = due else {
                break;
            };
            match self.routes.get_mut(&id) {
                Some(TimerRoute::Device(device)) => {
                    let device = Rc::clone(device);
                    device.borrow_mut().device_timer(id, param);
                }
                Some(TimerRoute::Callback(callback)) => callback(param),
                None => log::warn!(
                    target: "emu_core::machine",
                    "timer {} fired with no owner",
                    id.index()
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Machine;
    use crate::api::{ExecuteDevice, InputLine, LineState};
    use crate::context::SharedContext;
    use crate::scheduler::{SharedScheduler, TimerId};
    use crate::timing::{Clock, Time};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    struct Counter {
        icount: i32,
        executed: u64,
        halt: InputLine,
    }

    impl ExecuteDevice for Counter {
        fn tag(&self) -> &str {
            "counter"
        }

        fn clock(&self) -> Clock {
            Clock::new(1_000_000)
        }

        fn execute_run(&mut self) {
            while self.icount > 0 {
                self.icount -= 1;
                self.executed += 1;
            }
        }

        fn icount(&self) -> i32 {
            self.icount
        }

        fn set_icount(&mut self, icount: i32) {
            self.icount = icount;
        }

        fn execute_input_lines(&self) -> u32 {
            0
        }

        fn execute_input_edge_triggered(&self, _line: u32) -> bool {
            false
        }

        fn set_input_line(&mut self, _line: u32, state: LineState) {
            self.halt.set(state);
        }

        fn is_suspended(&self) -> bool {
            self.halt.level()
        }

        fn device_reset(&mut self) {}
    }

    /// Counts cycles through the context and arms `timer` once, `delay` after cycle `arm_at`.
    struct Armer {
        ctx: SharedContext,
        scheduler: SharedScheduler,
        timer: TimerId,
        arm_at: u64,
        delay: Time,
        icount: i32,
        executed: Rc<Cell<u64>>,
    }

    impl ExecuteDevice for Armer {
        fn tag(&self) -> &str {
            "armer"
        }

        fn clock(&self) -> Clock {
            Clock::new(1_000_000)
        }

        fn execute_run(&mut self) {
            while self.icount > 0 {
                self.icount -= 1;
                self.ctx.advance_cycles(1);
                self.executed.set(self.executed.get() + 1);
                if self.executed.get() == self.arm_at {
                    self.scheduler
                        .borrow_mut()
                        .adjust(self.timer, self.delay, 0, Time::NEVER);
                }
                if self.ctx.abort_requested() {
                    break;
                }
            }
        }

        fn icount(&self) -> i32 {
            self.icount
        }

        fn set_icount(&mut self, icount: i32) {
            self.icount = icount;
        }

        fn execute_input_lines(&self) -> u32 {
            0
        }

        fn execute_input_edge_triggered(&self, _line: u32) -> bool {
            false
        }

        fn set_input_line(&mut self, _line: u32, _state: LineState) {}

        fn is_suspended(&self) -> bool {
            false
        }

        fn device_reset(&mut self) {}
    }

    #[test]
    fn timer_armed_mid_slice_fires_at_its_expiry() {
        let mut machine = Machine::new();
        let armer_cycles = Rc::new(Cell::new(0u64));
        let counter = Rc::new(RefCell::new(Counter {
            icount: 0,
            executed: 0,
            halt: InputLine::new(),
        }));
        let seen = Rc::new(Cell::new((0u64, 0u64, Time::ZERO)));
        let record = Rc::clone(&seen);
        let cycles = Rc::clone(&armer_cycles);
        let other = Rc::clone(&counter);
        let ctx = Rc::clone(machine.context());
        let timer = machine.add_timer_callback("armed", move |_| {
            record.set((cycles.get(), other.borrow().executed, ctx.now()));
        });
        let armer = Armer {
            ctx: Rc::clone(machine.context()),
            scheduler: Rc::clone(machine.scheduler()),
            timer,
            arm_at: 2,
            delay: Time::from_usec(3),
            icount: 0,
            executed: Rc::clone(&armer_cycles),
        };
        machine.add_executor(Rc::new(RefCell::new(armer)));
        machine.add_executor(counter.clone());

        machine.run_for(Time::from_usec(20));
        assert_eq!(seen.get(), (5, 5, Time::from_usec(5)));
        assert_eq!(armer_cycles.get(), 20);
        assert_eq!(counter.borrow().executed, 20);
    }

    #[test]
    fn executors_advance_to_the_target_and_timers_split_slices() {
        let mut machine = Machine::new();
        let halt = InputLine::new();
        let counter = Rc::new(RefCell::new(Counter {
            icount: 0,
            executed: 0,
            halt: halt.clone(),
        }));
        machine.add_executor(counter.clone());
        let seen = Rc::new(Cell::new(0u64));
        let observed = Rc::clone(&seen);
        let probe = Rc::clone(&counter);
        let timer = machine.add_timer_callback("probe", move |_| observed.set(probe.borrow().executed));
        machine
            .scheduler()
            .borrow_mut()
            .adjust(timer, Time::from_usec(30), 0, Time::NEVER);

        machine.run_for(Time::from_usec(100));
        assert_eq!(seen.get(), 30);
        assert_eq!(counter.borrow().executed, 100);
        assert_eq!(machine.now(), Time::from_usec(100));
    }

    #[test]
    fn suspended_executors_do_not_run_or_catch_up() {
        let mut machine = Machine::new();
        let halt = InputLine::new();
        let counter = Rc::new(RefCell::new(Counter {
            icount: 0,
            executed: 0,
            halt: halt.clone(),
        }));
        machine.add_executor(counter.clone());
        halt.set(LineState::Assert);
        machine.run_for(Time::from_usec(40));
        assert_eq!(counter.borrow().executed, 0);
        halt.set(LineState::Clear);
        machine.run_for(Time::from_usec(10));
        assert_eq!(counter.borrow().executed, 10);
        assert_eq!(machine.executor_cycles(0), Some(50));
    }
}
