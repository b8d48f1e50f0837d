//! Device-facing contracts: execution, input lines, state introspection and tracing.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::scheduler::{Scheduler, SharedScheduler, TimerId};
use crate::timing::{Clock, Time};

/// Input line number of the non-maskable interrupt.
pub const INPUT_LINE_NMI: u32 = 0x20;
/// Input line number of the halt (bus request) input.
pub const INPUT_LINE_HALT: u32 = 0x21;
/// Input line number of the reset input.
pub const INPUT_LINE_RESET: u32 = 0x22;

/// Requested state for [`ExecuteDevice::set_input_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum LineState {
    /// De-assert the line.
    Clear,
    /// Assert the line until cleared.
    Assert,
    /// Assert then immediately clear; latches an edge without a lasting level.
    Pulse,
}

impl LineState {
    /// Builds a state from a level.
    #[must_use]
    pub const fn from_level(asserted: bool) -> Self {
        if asserted {
            Self::Assert
        } else {
            Self::Clear
        }
    }
}

#[derive(Default)]
struct LineInner {
    level: Cell<bool>,
    edge: Cell<bool>,
    watch: RefCell<Option<(Weak<RefCell<Scheduler>>, TimerId, u32)>>,
}

/// A shared, single-wire input.
///
/// The driving side calls [`InputLine::set`]; the receiving device samples the level and
/// consumes latched rising edges whenever its own logic polls. A receiver that must react
/// without polling registers a watch timer, which the scheduler fires at the current time.
#[derive(Clone, Default)]
pub struct InputLine(Rc<LineInner>);

impl fmt::Debug for InputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputLine")
            .field("level", &self.0.level.get())
            .field("edge", &self.0.edge.get())
            .finish()
    }
}

impl InputLine {
    /// Creates a cleared line.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives the line.
    pub fn set(&self, state: LineState) {
        match state {
            LineState::Clear => self.set_level(false),
            LineState::Assert => self.set_level(true),
            LineState::Pulse => {
                self.set_level(true);
                self.set_level(false);
            }
        }
    }

    /// Drives the line to a level; a rising edge is latched until taken.
    pub fn set_level(&self, asserted: bool) {
        let previous = self.0.level.replace(asserted);
        if previous == asserted {
            return;
        }
        if asserted {
            self.0.edge.set(true);
        }
        let watch = self.0.watch.borrow();
        if let Some((scheduler, timer, param)) = watch.as_ref() {
            if let Some(scheduler) = scheduler.upgrade() {
                match scheduler.try_borrow_mut() {
                    Ok(mut scheduler) => scheduler.adjust(*timer, Time::ZERO, *param, Time::NEVER),
                    Err(_) => log::error!(
                        target: "emu_core::api",
                        "input line changed while the scheduler was busy; watch timer not armed"
                    ),
                }
            }
        }
    }

    /// Current level.
    #[must_use]
    pub fn level(&self) -> bool {
        self.0.level.get()
    }

    /// Consumes a latched rising edge.
    pub fn take_edge(&self) -> bool {
        self.0.edge.replace(false)
    }

    /// Returns `true` when a rising edge is latched, without consuming it.
    #[must_use]
    pub fn edge_pending(&self) -> bool {
        self.0.edge.get()
    }

    /// Drops any latched edge.
    pub fn clear_edge(&self) {
        self.0.edge.set(false);
    }

    /// Restores level and latched edge from a save state without notifying any watcher.
    pub fn restore(&self, level: bool, edge: bool) {
        self.0.level.set(level);
        self.0.edge.set(edge);
    }

    /// Arms `timer` with `param` at the current time whenever the level changes.
    pub fn watch(&self, scheduler: &SharedScheduler, timer: TimerId, param: u32) {
        *self.0.watch.borrow_mut() = Some((Rc::downgrade(scheduler), timer, param));
    }
}

/// Output-line callback wired at machine-build time.
pub type LineCallback = Box<dyn FnMut(bool)>;

/// Builds an output callback that drives `line`.
#[must_use]
pub fn drive_line(line: &InputLine) -> LineCallback {
    let line = line.clone();
    Box::new(move |asserted| line.set_level(asserted))
}

/// A named, introspectable register of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceStateEntry {
    /// Stable index used by [`ExecuteDevice`] implementors for `state_import`.
    pub index: u32,
    /// Display name.
    pub name: &'static str,
    /// Current value.
    pub value: u64,
    /// Width in bits.
    pub bits: u8,
}

/// Contract every time-sliced executing device fulfils.
pub trait ExecuteDevice {
    /// Device tag used in diagnostics.
    fn tag(&self) -> &str;

    /// Clock the device counts cycles in.
    fn clock(&self) -> Clock;

    /// Executes until the cycle budget in `icount` is spent or the timeslice is aborted.
    fn execute_run(&mut self);

    /// Remaining cycle budget; may be negative after an overrun.
    fn icount(&self) -> i32;

    /// Sets the cycle budget.
    fn set_icount(&mut self, icount: i32);

    /// Shortest unit of work in cycles.
    fn execute_min_cycles(&self) -> u32 {
        1
    }

    /// Longest unit of work in cycles.
    fn execute_max_cycles(&self) -> u32 {
        1
    }

    /// Number of numbered input lines.
    fn execute_input_lines(&self) -> u32;

    /// Whether input `line` reacts to edges instead of levels.
    fn execute_input_edge_triggered(&self, line: u32) -> bool;

    /// Drives an input line.
    fn set_input_line(&mut self, line: u32, state: LineState);

    /// Returns `true` while the device is held off the bus and must not execute.
    fn is_suspended(&self) -> bool;

    /// Returns architectural state to power-on values.
    fn device_reset(&mut self);

    /// Hex digits used to print the program counter.
    fn pc_chars(&self) -> usize {
        4
    }
}

/// Stable snapshot wire-version identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u16)]
pub enum SnapshotVersion {
    /// Initial schema revision.
    V1 = 1,
}

impl SnapshotVersion {
    /// Converts a wire value to a known snapshot version.
    #[must_use]
    pub const fn from_u16(version: u16) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            _ => None,
        }
    }

    /// Wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Execution trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEvent {
    /// An instruction is about to start.
    Instruction {
        /// Address of the opcode.
        pc: u32,
        /// Opcode byte.
        opcode: u8,
        /// Device-defined register snapshot; the 6502 reports A, X, Y, P and SP.
        registers: [u32; 5],
        /// Total cycles the device had executed at this point.
        cycles: u64,
    },
    /// An interrupt sequence fetched its vector.
    Interrupt {
        /// Address of the instruction that was interrupted.
        pc: u32,
        /// Vector address read.
        vector: u32,
    },
}

/// Receives trace records in execution order.
pub trait TraceSink {
    /// Records one event.
    fn on_event(&mut self, event: TraceEvent);
}

impl TraceSink for Vec<TraceEvent> {
    fn on_event(&mut self, event: TraceEvent) {
        self.push(event);
    }
}

impl<T: TraceSink> TraceSink for Rc<RefCell<T>> {
    fn on_event(&mut self, event: TraceEvent) {
        self.borrow_mut().on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{drive_line, InputLine, LineState, SnapshotVersion};
    use crate::context::MachineContext;
    use crate::scheduler::Scheduler;
    use crate::timing::Time;

    #[test]
    fn snapshot_version_roundtrip_is_stable() {
        assert_eq!(SnapshotVersion::from_u16(1), Some(SnapshotVersion::V1));
        assert_eq!(SnapshotVersion::from_u16(2), None);
        assert_eq!(SnapshotVersion::V1.as_u16(), 1);
    }

    #[test]
    fn lines_latch_rising_edges_only() {
        let line = InputLine::new();
        line.set(LineState::Assert);
        line.set(LineState::Assert);
        assert!(line.level());
        assert!(line.take_edge());
        assert!(!line.take_edge());
        line.set(LineState::Clear);
        assert!(!line.edge_pending());
        line.set(LineState::Pulse);
        assert!(!line.level());
        assert!(line.take_edge());
    }

    #[test]
    fn watched_lines_arm_their_timer_on_change() {
        let scheduler = Scheduler::shared(MachineContext::new());
        let timer = scheduler.borrow_mut().allocate("drq");
        let line = InputLine::new();
        line.watch(&scheduler, timer, 7);
        let mut output = drive_line(&line);
        output(true);
        assert_eq!(scheduler.borrow_mut().pop_due(Time::ZERO), Some((timer, 7)));
        output(true);
        assert!(!scheduler.borrow().enabled(timer));
    }
}
