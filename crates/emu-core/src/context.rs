//! Machine-wide execution context shared by spaces, devices and the scheduler.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::timing::{Clock, Time};

/// Shared handle to a [`MachineContext`].
pub type SharedContext = Rc<MachineContext>;

/// Execution window of the device currently inside `execute_run`.
#[derive(Debug, Clone, Copy)]
struct ExecWindow {
    clock: Clock,
    base_cycles: u64,
}

/// Tracks which device is executing, its program counter, virtual time inside the running
/// timeslice, side-effect suppression for debugger peeks, and timeslice-abort requests.
#[derive(Debug, Default)]
pub struct MachineContext {
    side_effects_disabled: Cell<u32>,
    executing_tag: RefCell<String>,
    executing_pc: Cell<Option<u32>>,
    pc_chars: Cell<usize>,
    base_time: Cell<Time>,
    slice_end: Cell<Time>,
    window: Cell<Option<ExecWindow>>,
    exec_cycles: Cell<u64>,
    abort: Cell<bool>,
}

/// Guard returned by [`MachineContext::disable_side_effects`]; side effects resume when the last
/// guard is dropped.
#[derive(Debug)]
pub struct SideEffectsDisabler<'a> {
    ctx: &'a MachineContext,
}

impl Drop for SideEffectsDisabler<'_> {
    fn drop(&mut self) {
        let depth = self.ctx.side_effects_disabled.get();
        debug_assert!(depth > 0);
        self.ctx.side_effects_disabled.set(depth.saturating_sub(1));
    }
}

impl MachineContext {
    /// Creates a fresh context at time zero with no executing device.
    #[must_use]
    pub fn new() -> SharedContext {
        Rc::new(Self {
            slice_end: Cell::new(Time::NEVER),
            pc_chars: Cell::new(4),
            ..Self::default()
        })
    }

    /// Returns `true` while at least one [`SideEffectsDisabler`] is alive.
    #[must_use]
    pub fn side_effects_disabled(&self) -> bool {
        self.side_effects_disabled.get() > 0
    }

    /// Suppresses logging and state mutation until the returned guard is dropped. Nests.
    #[must_use]
    pub fn disable_side_effects(&self) -> SideEffectsDisabler<'_> {
        self.side_effects_disabled
            .set(self.side_effects_disabled.get().saturating_add(1));
        SideEffectsDisabler { ctx: self }
    }

    /// Records the device now executing; `pc_chars` is the hex width used to print its PC.
    pub fn set_executing(&self, tag: &str, pc_chars: usize) {
        let mut current = self.executing_tag.borrow_mut();
        current.clear();
        current.push_str(tag);
        self.pc_chars.set(pc_chars);
        self.executing_pc.set(None);
    }

    /// Clears the executing device once its slice ends.
    pub fn clear_executing(&self) {
        self.executing_tag.borrow_mut().clear();
        self.executing_pc.set(None);
    }

    /// Updates the program counter reported for the executing device.
    pub fn set_pc(&self, pc: u32) {
        self.executing_pc.set(Some(pc));
    }

    /// Formats the executing device for diagnostics: `'tag' (PC)` or `(no context)`.
    #[must_use]
    pub fn describe(&self) -> String {
        let tag = self.executing_tag.borrow();
        if tag.is_empty() {
            return "(no context)".to_owned();
        }
        match self.executing_pc.get() {
            Some(pc) => format!("'{tag}' ({pc:0width$X})", width = self.pc_chars.get()),
            None => format!("'{tag}'"),
        }
    }

    /// Current virtual time, precise to the cycle while a device is executing.
    #[must_use]
    pub fn now(&self) -> Time {
        let base = self.base_time.get();
        match self.window.get() {
            Some(window) => {
                let local = window
                    .clock
                    .cycles_to_time(window.base_cycles + self.exec_cycles.get());
                local.max(base)
            }
            None => base,
        }
    }

    /// End of the running timeslice, or [`Time::NEVER`] outside one.
    #[must_use]
    pub fn slice_end(&self) -> Time {
        self.slice_end.get()
    }

    /// Returns `true` while some device is inside `execute_run`.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.window.get().is_some()
    }

    /// Advances the executing device's local cycle count; CPU cores call this once per cycle.
    pub fn advance_cycles(&self, cycles: u64) {
        self.exec_cycles.set(self.exec_cycles.get() + cycles);
    }

    /// Asks the executing device to return from `execute_run` at the next cycle boundary.
    pub fn request_abort(&self) {
        if self.is_executing() {
            self.abort.set(true);
        }
    }

    /// Returns `true` when an abort has been requested and not yet consumed.
    #[must_use]
    pub fn abort_requested(&self) -> bool {
        self.abort.get()
    }

    /// Consumes a pending abort request.
    pub fn take_abort(&self) -> bool {
        self.abort.replace(false)
    }

    pub(crate) fn set_base_time(&self, time: Time) {
        self.base_time.set(time);
    }

    pub(crate) fn set_slice_end(&self, end: Time) {
        self.slice_end.set(end);
    }

    pub(crate) fn begin_exec(&self, clock: Clock, base_cycles: u64) {
        self.window.set(Some(ExecWindow { clock, base_cycles }));
        self.exec_cycles.set(0);
        self.abort.set(false);
    }

    pub(crate) fn end_exec(&self) {
        self.window.set(None);
        self.exec_cycles.set(0);
        self.abort.set(false);
    }
}
