//! Parallel SCSI bus with wired-OR signals.
//!
//! Every attached port drives its own copy of the control and data lines; the bus value is
//! the OR of all ports. A port names the control lines it cares about with a wait mask, and
//! when any of them change the bus arms that port's notification timer at the current time.
//! Nothing on the bus ever calls into a device directly.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::scheduler::{Scheduler, SharedScheduler, TimerId};
use crate::timing::Time;

/// Input/output: set when the target drives data to the initiator.
pub const S_INP: u32 = 0x0001;
/// Control/data.
pub const S_CTL: u32 = 0x0002;
/// Message.
pub const S_MSG: u32 = 0x0004;
/// Busy.
pub const S_BSY: u32 = 0x0008;
/// Select.
pub const S_SEL: u32 = 0x0010;
/// Request, driven by the target.
pub const S_REQ: u32 = 0x0020;
/// Acknowledge, driven by the initiator.
pub const S_ACK: u32 = 0x0040;
/// Attention.
pub const S_ATN: u32 = 0x0080;
/// Reset.
pub const S_RST: u32 = 0x0100;
/// Every control line.
pub const S_ALL: u32 = 0x01ff;

/// Lines that encode the information transfer phase.
pub const S_PHASE_MASK: u32 = S_INP | S_CTL | S_MSG;
/// Data out phase.
pub const S_PHASE_DATA_OUT: u32 = 0;
/// Data in phase.
pub const S_PHASE_DATA_IN: u32 = S_INP;
/// Command phase.
pub const S_PHASE_COMMAND: u32 = S_CTL;
/// Status phase.
pub const S_PHASE_STATUS: u32 = S_CTL | S_INP;
/// Message out phase.
pub const S_PHASE_MSG_OUT: u32 = S_MSG | S_CTL;
/// Message in phase.
pub const S_PHASE_MSG_IN: u32 = S_MSG | S_CTL | S_INP;

const LOG_TARGET: &str = "emu_core::scsi";

/// Shared handle to a bus.
pub type SharedScsiBus = Rc<RefCell<ScsiBus>>;

/// Handle of one attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScsiPort(usize);

impl ScsiPort {
    /// Attachment order of the port.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct PortState {
    name: String,
    ctrl: u32,
    data: u8,
    wait: u32,
    notify: Option<(TimerId, u32)>,
}

/// The bus itself.
#[derive(Debug)]
pub struct ScsiBus {
    scheduler: Weak<RefCell<Scheduler>>,
    ports: Vec<PortState>,
    ctrl: u32,
    data: u8,
}

fn phase_name(ctrl: u32) -> &'static str {
    match ctrl & S_PHASE_MASK {
        S_PHASE_DATA_OUT => "data out",
        S_PHASE_DATA_IN => "data in",
        S_PHASE_COMMAND => "command",
        S_PHASE_STATUS => "status",
        S_PHASE_MSG_OUT => "message out",
        S_PHASE_MSG_IN => "message in",
        _ => "reserved",
    }
}

impl ScsiBus {
    /// Creates an empty bus whose change notifications are armed on `scheduler`.
    #[must_use]
    pub fn new(scheduler: &SharedScheduler) -> Self {
        Self {
            scheduler: Rc::downgrade(scheduler),
            ports: Vec::new(),
            ctrl: 0,
            data: 0,
        }
    }

    /// Creates a shared bus.
    #[must_use]
    pub fn shared(scheduler: &SharedScheduler) -> SharedScsiBus {
        Rc::new(RefCell::new(Self::new(scheduler)))
    }

    /// Attaches a device. When `notify` is set, the bus arms that timer with its parameter
    /// whenever a control line in the port's wait mask changes because of another port.
    pub fn attach(&mut self, name: &str, notify: Option<(TimerId, u32)>) -> ScsiPort {
        self.ports.push(PortState {
            name: name.to_owned(),
            ctrl: 0,
            data: 0,
            wait: 0,
            notify,
        });
        ScsiPort(self.ports.len() - 1)
    }

    /// Number of attached ports.
    #[must_use]
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Current control lines.
    #[must_use]
    pub const fn ctrl_r(&self) -> u32 {
        self.ctrl
    }

    /// Current data lines.
    #[must_use]
    pub const fn data_r(&self) -> u8 {
        self.data
    }

    /// Control lines driven by `port` alone.
    #[must_use]
    pub fn driven_ctrl(&self, port: ScsiPort) -> u32 {
        self.ports.get(port.0).map_or(0, |p| p.ctrl)
    }

    /// Drives the control lines selected by `mask` to `lines` from `port`.
    pub fn ctrl_w(&mut self, port: ScsiPort, lines: u32, mask: u32) {
        let Some(state) = self.ports.get_mut(port.0) else {
            return;
        };
        state.ctrl = (state.ctrl & !mask) | (lines & mask & S_ALL);
        self.regen_ctrl(port);
    }

    /// Drives the data lines from `port`.
    pub fn data_w(&mut self, port: ScsiPort, data: u8) {
        let Some(state) = self.ports.get_mut(port.0) else {
            return;
        };
        state.data = data;
        self.data = self.ports.iter().fold(0, |acc, p| acc | p.data);
    }

    /// Updates the wait mask of `port` for the lines selected by `mask`.
    pub fn ctrl_wait(&mut self, port: ScsiPort, lines: u32, mask: u32) {
        if let Some(state) = self.ports.get_mut(port.0) {
            state.wait = (state.wait & !mask) | (lines & mask);
        }
    }

    fn regen_ctrl(&mut self, writer: ScsiPort) {
        let previous = self.ctrl;
        self.ctrl = self.ports.iter().fold(0, |acc, p| acc | p.ctrl);
        let changed = previous ^ self.ctrl;
        if changed == 0 {
            return;
        }
        if changed & S_PHASE_MASK != 0 || changed & (S_BSY | S_SEL) != 0 {
            log::debug!(
                target: LOG_TARGET,
                "{}: phase {} bsy={} sel={}",
                self.ports[writer.0].name,
                phase_name(self.ctrl),
                self.ctrl & S_BSY != 0,
                self.ctrl & S_SEL != 0
            );
        }
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        let Ok(mut scheduler) = scheduler.try_borrow_mut() else {
            log::error!(
                target: LOG_TARGET,
                "bus lines changed while the scheduler was busy; notifications dropped"
            );
            return;
        };
        for (index, port) in self.ports.iter().enumerate() {
            if index == writer.0 || changed & port.wait == 0 {
                continue;
            }
            if let Some((timer, param)) = port.notify {
                scheduler.adjust(timer, Time::ZERO, param, Time::NEVER);
            }
        }
    }
}
