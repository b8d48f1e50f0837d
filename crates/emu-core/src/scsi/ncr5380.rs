//! NCR 5380 SCSI bus controller, initiator side.
//!
//! The host sees eight byte registers. Bus signals are driven directly through the initiator
//! command register; arbitration and the pseudo-DMA REQ/ACK handshake run on their own,
//! paced by a single step timer and woken by bus change notifications.
//!
//! The chip has no clock input. Delays are expressed in cycles of a nominal 10 MHz clock.

use crate::api::LineCallback;
use crate::context::SharedContext;
use crate::machine::TimerDevice;
use crate::memory::{BusDevice, Offset};
use crate::scheduler::{SharedScheduler, TimerId};
use crate::timing::Time;

use super::bus::{
    ScsiPort, SharedScsiBus, S_ACK, S_ALL, S_ATN, S_BSY, S_CTL, S_INP, S_MSG, S_PHASE_MASK,
    S_REQ, S_RST, S_SEL,
};

const LOG_TARGET: &str = "emu_core::ncr5380";

const NOMINAL_CLOCK_HZ: u32 = 10_000_000;
const ARBITRATION_DELAY: u32 = 11;
const BUS_SETTLE_DELAY: u32 = 2;

/// Mode: start arbitration.
pub const MODE_ARBITRATE: u8 = 0x01;
/// Mode: DMA mode.
pub const MODE_DMA: u8 = 0x02;
/// Mode: monitor busy.
pub const MODE_MONITOR_BUSY: u8 = 0x04;
/// Mode: interrupt on end of DMA.
pub const MODE_EOP_IRQ: u8 = 0x08;
/// Mode: target role.
pub const MODE_TARGET: u8 = 0x40;
/// Mode: block-mode DMA.
pub const MODE_BLOCK_DMA: u8 = 0x80;

/// Initiator command: drive the data bus.
pub const IC_DBUS: u8 = 0x01;
/// Initiator command: assert ATN.
pub const IC_ATN: u8 = 0x02;
/// Initiator command: assert SEL.
pub const IC_SEL: u8 = 0x04;
/// Initiator command: assert BSY.
pub const IC_BSY: u8 = 0x08;
/// Initiator command: assert ACK.
pub const IC_ACK: u8 = 0x10;
/// Initiator command (read): arbitration lost.
pub const IC_ARB_LOST: u8 = 0x20;
/// Initiator command (read): arbitration in progress.
pub const IC_ARB_IN_PROGRESS: u8 = 0x40;
/// Initiator command: assert RST.
pub const IC_RST: u8 = 0x80;
const IC_LINE_MASK: u8 = IC_RST | IC_ACK | IC_BSY | IC_SEL | IC_ATN;
const IC_WRITE_MASK: u8 = IC_LINE_MASK | IC_DBUS;
const IC_STATUS_MASK: u8 = IC_ARB_LOST | IC_ARB_IN_PROGRESS;

/// Current bus status: SEL.
pub const ST_SEL: u8 = 0x02;
/// Current bus status: I/O.
pub const ST_IO: u8 = 0x04;
/// Current bus status: C/D.
pub const ST_CD: u8 = 0x08;
/// Current bus status: MSG.
pub const ST_MSG: u8 = 0x10;
/// Current bus status: REQ.
pub const ST_REQ: u8 = 0x20;
/// Current bus status: BSY.
pub const ST_BSY: u8 = 0x40;
/// Current bus status: RST.
pub const ST_RST: u8 = 0x80;

/// Bus and status: ACK.
pub const BAS_ACK: u8 = 0x01;
/// Bus and status: ATN.
pub const BAS_ATN: u8 = 0x02;
/// Bus and status: busy error.
pub const BAS_BUSY_ERROR: u8 = 0x04;
/// Bus and status: phase match.
pub const BAS_PHASE_MATCH: u8 = 0x08;
/// Bus and status: interrupt request active.
pub const BAS_IRQ_ACTIVE: u8 = 0x10;
/// Bus and status: parity error.
pub const BAS_PARITY_ERROR: u8 = 0x20;
/// Bus and status: DMA request.
pub const BAS_DMA_REQUEST: u8 = 0x40;
/// Bus and status: end of DMA.
pub const BAS_END_OF_DMA: u8 = 0x80;

/// Register offsets; the write-side name follows the read-side one where they differ.
pub mod reg {
    /// Current SCSI data / output data.
    pub const DATA: u32 = 0;
    /// Initiator command.
    pub const INITIATOR_COMMAND: u32 = 1;
    /// Mode.
    pub const MODE: u32 = 2;
    /// Target command.
    pub const TARGET_COMMAND: u32 = 3;
    /// Current bus status / select enable.
    pub const STATUS: u32 = 4;
    /// Bus and status / start DMA send.
    pub const BUS_AND_STATUS: u32 = 5;
    /// Input data / start DMA target receive.
    pub const INPUT_DATA: u32 = 6;
    /// Reset parity and interrupt / start DMA initiator receive.
    pub const RESET_PARITY: u32 = 7;
}

/// Construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Ncr5380Config {
    /// Device tag used in diagnostics and timer names.
    pub tag: String,
    /// Bus id the controller arbitrates with, 0 to 7.
    pub scsi_id: u8,
    /// REQ/ACK settle delay in nominal clock cycles.
    pub sync_period: u32,
}

impl Default for Ncr5380Config {
    fn default() -> Self {
        Self {
            tag: "ncr5380".to_owned(),
            scsi_id: 7,
            sync_period: 5,
        }
    }
}

/// Progress of the automatic bus sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Handshake {
    /// Nothing in progress.
    Idle,
    /// Arbitration delay running; the winner is decided when it expires.
    Arbitrating,
    /// Send: data and ACK driven, waiting for the bus to settle.
    SendSettle,
    /// Send: waiting for the target to drop REQ.
    SendWaitReqLow,
    /// Receive: waiting for the target to raise REQ.
    ReceiveWaitReqHigh,
    /// Receive: REQ seen, waiting for the data to settle.
    ReceiveSettle,
    /// Receive: byte latched and ACK driven, waiting for the target to drop REQ.
    ReceiveWaitReqLow,
}

/// The controller.
pub struct Ncr5380 {
    config: Ncr5380Config,
    ctx: SharedContext,
    scheduler: SharedScheduler,
    bus: SharedScsiBus,
    port: ScsiPort,
    step_timer: TimerId,
    notify_timer: TimerId,
    handshake: Handshake,
    connected: bool,
    clock_conv: u32,
    sync_period: u32,
    mode: u8,
    output_data: u8,
    bus_status: u8,
    dma_latch: u8,
    icommand: u8,
    tcommand: u8,
    drq: bool,
    drq_output: Option<LineCallback>,
}

impl core::fmt::Debug for Ncr5380 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ncr5380")
            .field("tag", &self.config.tag)
            .field("handshake", &self.handshake)
            .field("mode", &self.mode)
            .field("icommand", &self.icommand)
            .field("tcommand", &self.tcommand)
            .field("drq", &self.drq)
            .finish_non_exhaustive()
    }
}

impl Ncr5380 {
    /// Creates a controller attached to `bus`, allocating its timers from `scheduler`.
    #[must_use]
    pub fn new(config: Ncr5380Config, bus: &SharedScsiBus, scheduler: &SharedScheduler) -> Self {
        let (ctx, step_timer, notify_timer) = {
            let mut sched = scheduler.borrow_mut();
            let step = sched.allocate(&format!("{}:step", config.tag));
            let notify = sched.allocate(&format!("{}:bus", config.tag));
            (sched.context().clone(), step, notify)
        };
        let port = bus.borrow_mut().attach(&config.tag, Some((notify_timer, 0)));
        let mut ncr = Self {
            sync_period: config.sync_period,
            config,
            ctx,
            scheduler: scheduler.clone(),
            bus: bus.clone(),
            port,
            step_timer,
            notify_timer,
            handshake: Handshake::Idle,
            connected: false,
            clock_conv: 0,
            mode: 0,
            output_data: 0,
            bus_status: 0,
            dma_latch: 0,
            icommand: 0,
            tcommand: 0,
            drq: false,
            drq_output: None,
        };
        ncr.device_reset();
        ncr
    }

    /// Configuration the controller was built with.
    #[must_use]
    pub const fn config(&self) -> &Ncr5380Config {
        &self.config
    }

    /// Port the controller drives on its bus.
    #[must_use]
    pub const fn port(&self) -> ScsiPort {
        self.port
    }

    /// Wires the DRQ output.
    pub fn set_drq_callback(&mut self, callback: LineCallback) {
        self.drq_output = Some(callback);
    }

    /// Current DRQ level.
    #[must_use]
    pub const fn drq(&self) -> bool {
        self.drq
    }

    /// Progress of the automatic bus sequences.
    #[must_use]
    pub const fn handshake(&self) -> Handshake {
        self.handshake
    }

    /// Hardware reset: releases the bus and clears every register.
    pub fn device_reset(&mut self) {
        self.clock_conv = 2;
        self.sync_period = self.config.sync_period;
        self.mode = 0;
        self.tcommand = 0;
        self.icommand = 0;
        self.bus_status = 0;
        self.cancel_step();
        self.reset_soft();
    }

    fn reset_soft(&mut self) {
        self.handshake = Handshake::Idle;
        {
            let mut bus = self.bus.borrow_mut();
            bus.data_w(self.port, 0);
            bus.ctrl_w(self.port, 0, S_ALL);
            bus.ctrl_wait(self.port, S_ALL, S_ALL);
        }
        self.set_drq(false);
        self.connected = false;
    }

    /// Reads register `offset & 7`.
    pub fn read(&mut self, offset: Offset) -> u8 {
        match offset & 7 {
            reg::DATA => self.bus.borrow().data_r(),
            reg::INITIATOR_COMMAND => self.icommand,
            reg::MODE => self.mode,
            reg::TARGET_COMMAND => self.tcommand,
            reg::STATUS => self.current_status(),
            reg::BUS_AND_STATUS => self.bus_and_status(),
            reg::INPUT_DATA => self.dma_r(),
            _ => self.reset_parity_irq(),
        }
    }

    /// Writes register `offset & 7`.
    pub fn write(&mut self, offset: Offset, data: u8) {
        log::trace!(target: LOG_TARGET, "{}: reg {} <- {data:02x}", self.config.tag, offset & 7);
        match offset & 7 {
            reg::DATA => self.output_data_w(data),
            reg::INITIATOR_COMMAND => self.icommand_w(data),
            reg::MODE => self.mode_w(data),
            reg::TARGET_COMMAND => self.tcommand_w(data),
            reg::STATUS => {
                log::trace!(target: LOG_TARGET, "{}: select enable ignored", self.config.tag);
            }
            reg::BUS_AND_STATUS => {
                log::debug!(target: LOG_TARGET, "{}: start DMA send", self.config.tag);
                self.set_drq(true);
            }
            reg::INPUT_DATA => {
                log::debug!(
                    target: LOG_TARGET,
                    "{}: target receive requested; target role is not supported",
                    self.config.tag
                );
            }
            _ => {
                log::debug!(target: LOG_TARGET, "{}: start DMA initiator receive", self.config.tag);
                self.receive_byte();
            }
        }
    }

    /// Pseudo-DMA read: returns the latched byte and, in DMA mode, starts receiving the next.
    pub fn dma_r(&mut self) -> u8 {
        if !self.ctx.side_effects_disabled() {
            self.set_drq(false);
            self.bus.borrow_mut().ctrl_w(self.port, 0, S_ACK);
            if self.mode & MODE_DMA != 0 {
                self.receive_byte();
            }
        }
        self.dma_latch
    }

    /// Pseudo-DMA write: sends `data` when in DMA mode.
    pub fn dma_w(&mut self, data: u8) {
        self.set_drq(false);
        if self.mode & MODE_DMA != 0 {
            self.dma_latch = data;
            self.send_byte();
        }
    }

    /// Reacts to a change of the bus control lines.
    pub fn ctrl_changed(&mut self) {
        let ctrl = self.bus.borrow().ctrl_r();
        self.update_phase_match(ctrl);

        if self.mode & MODE_DMA != 0
            && (ctrl & S_BSY == 0 || self.bus_status & BAS_PHASE_MATCH == 0)
        {
            log::debug!(
                target: LOG_TARGET,
                "{}: DMA ended by {}",
                self.config.tag,
                if ctrl & S_BSY == 0 { "bus free" } else { "phase change" }
            );
            self.mode &= !MODE_DMA;
            self.bus_status |= BAS_END_OF_DMA;
            self.set_drq(false);
        }

        if ctrl & S_RST != 0 {
            log::debug!(target: LOG_TARGET, "{}: bus reset", self.config.tag);
            return;
        }
        self.step(false);
    }

    fn current_status(&self) -> u8 {
        let ctrl = self.bus.borrow().ctrl_r();
        [
            (S_RST, ST_RST),
            (S_BSY, ST_BSY),
            (S_REQ, ST_REQ),
            (S_MSG, ST_MSG),
            (S_CTL, ST_CD),
            (S_INP, ST_IO),
            (S_SEL, ST_SEL),
        ]
        .iter()
        .filter(|(line, _)| ctrl & line != 0)
        .fold(0, |acc, (_, bit)| acc | bit)
    }

    fn bus_and_status(&self) -> u8 {
        let ctrl = self.bus.borrow().ctrl_r();
        let mut value = self.bus_status;
        if ctrl & S_ATN != 0 {
            value |= BAS_ATN;
        }
        if ctrl & S_ACK != 0 {
            value |= BAS_ACK;
        }
        value
    }

    fn reset_parity_irq(&mut self) -> u8 {
        if !self.ctx.side_effects_disabled() {
            self.bus_status &= !(BAS_PARITY_ERROR | BAS_IRQ_ACTIVE | BAS_BUSY_ERROR);
        }
        0
    }

    fn output_data_w(&mut self, data: u8) {
        self.output_data = data;
        if self.icommand & IC_DBUS != 0 {
            self.bus.borrow_mut().data_w(self.port, data);
        }
    }

    fn icommand_w(&mut self, data: u8) {
        let dbus_rising = data & IC_DBUS != 0 && self.icommand & IC_DBUS == 0;
        let dbus_falling = data & IC_DBUS == 0 && self.icommand & IC_DBUS != 0;
        if dbus_rising {
            self.bus.borrow_mut().data_w(self.port, self.output_data);
        } else if dbus_falling && self.handshake == Handshake::Idle {
            self.bus.borrow_mut().data_w(self.port, 0);
        }

        if (data ^ self.icommand) & IC_LINE_MASK != 0 {
            let lines = [
                (IC_RST, S_RST),
                (IC_ACK, S_ACK),
                (IC_BSY, S_BSY),
                (IC_SEL, S_SEL),
                (IC_ATN, S_ATN),
            ]
            .iter()
            .filter(|(bit, _)| data & bit != 0)
            .fold(0, |acc, (_, line)| acc | line);
            self.bus
                .borrow_mut()
                .ctrl_w(self.port, lines, S_RST | S_ACK | S_BSY | S_SEL | S_ATN);
        }

        self.icommand = (data & IC_WRITE_MASK) | (self.icommand & IC_STATUS_MASK);
        self.delay(BUS_SETTLE_DELAY);
    }

    fn mode_w(&mut self, data: u8) {
        let arbitrate_rising = data & MODE_ARBITRATE != 0 && self.mode & MODE_ARBITRATE == 0;
        let arbitrate_falling = data & MODE_ARBITRATE == 0 && self.mode & MODE_ARBITRATE != 0;
        if arbitrate_rising {
            let ctrl = self.bus.borrow().ctrl_r();
            if ctrl & S_SEL != 0 && self.icommand & IC_SEL == 0 {
                log::warn!(
                    target: LOG_TARGET,
                    "{}: arbitration refused, SEL already asserted",
                    self.config.tag
                );
                self.icommand |= IC_ARB_LOST;
            } else {
                self.arbitrate();
            }
        } else if arbitrate_falling {
            // in-progress only clears when the host turns arbitration off
            self.icommand &= !IC_ARB_IN_PROGRESS;
        }
        if data & MODE_TARGET != 0 {
            log::warn!(target: LOG_TARGET, "{}: target role is not supported", self.config.tag);
        }
        self.mode = data;
    }

    fn tcommand_w(&mut self, data: u8) {
        self.tcommand = data;
        let ctrl = self.bus.borrow().ctrl_r();
        self.update_phase_match(ctrl);
    }

    fn update_phase_match(&mut self, ctrl: u32) {
        if ctrl & S_PHASE_MASK == u32::from(self.tcommand) & S_PHASE_MASK {
            self.bus_status |= BAS_PHASE_MATCH;
        } else {
            self.bus_status &= !BAS_PHASE_MATCH;
        }
    }

    fn arbitrate(&mut self) {
        log::debug!(target: LOG_TARGET, "{}: arbitrating", self.config.tag);
        self.icommand &= !IC_ARB_LOST;
        self.icommand |= IC_ARB_IN_PROGRESS | IC_BSY;
        self.handshake = Handshake::Arbitrating;
        {
            let mut bus = self.bus.borrow_mut();
            bus.data_w(self.port, self.output_data);
            bus.ctrl_w(self.port, S_BSY, S_BSY);
        }
        self.delay(ARBITRATION_DELAY);
    }

    fn send_byte(&mut self) {
        self.handshake = Handshake::SendSettle;
        {
            let mut bus = self.bus.borrow_mut();
            bus.data_w(self.port, self.dma_latch);
            bus.ctrl_w(self.port, S_ACK, S_ACK);
            bus.ctrl_wait(self.port, S_REQ, S_REQ);
        }
        self.delay_cycles(self.sync_period);
    }

    fn receive_byte(&mut self) {
        self.handshake = Handshake::ReceiveWaitReqHigh;
        self.step(false);
    }

    fn step(&mut self, timeout: bool) {
        let (ctrl, data) = {
            let bus = self.bus.borrow();
            (bus.ctrl_r(), bus.data_r())
        };

        if ctrl & S_BSY != 0 {
            self.connected = self.connected || self.handshake != Handshake::Arbitrating;
        } else if self.connected && ctrl & S_SEL == 0 {
            log::debug!(target: LOG_TARGET, "{}: bus free", self.config.tag);
            self.connected = false;
            self.handshake = Handshake::Idle;
        }

        match self.handshake {
            Handshake::Idle => {}
            Handshake::Arbitrating => {
                if !timeout {
                    return;
                }
                self.handshake = Handshake::Idle;
                let winner = (0..8u8).rev().find(|id| data & (1 << id) != 0);
                if winner != Some(self.config.scsi_id) {
                    log::warn!(
                        target: LOG_TARGET,
                        "{}: lost arbitration to id {winner:?}",
                        self.config.tag
                    );
                    {
                        let mut bus = self.bus.borrow_mut();
                        bus.data_w(self.port, 0);
                        bus.ctrl_w(self.port, 0, S_ALL);
                    }
                    self.icommand = (self.icommand | IC_ARB_LOST) & !(IC_BSY | IC_DBUS);
                    return;
                }
                log::debug!(target: LOG_TARGET, "{}: won arbitration", self.config.tag);
            }
            Handshake::SendSettle => {
                if timeout {
                    self.handshake = Handshake::SendWaitReqLow;
                    self.step(false);
                }
            }
            Handshake::SendWaitReqLow => {
                if ctrl & S_REQ != 0 {
                    return;
                }
                self.handshake = Handshake::Idle;
                {
                    let mut bus = self.bus.borrow_mut();
                    bus.data_w(self.port, 0);
                    bus.ctrl_w(self.port, 0, S_ACK);
                }
                if self.mode & MODE_DMA != 0 {
                    self.set_drq(true);
                }
            }
            Handshake::ReceiveWaitReqHigh => {
                if ctrl & S_REQ == 0 {
                    return;
                }
                self.handshake = Handshake::ReceiveSettle;
                self.delay_cycles(self.sync_period);
            }
            Handshake::ReceiveSettle => {
                if !timeout {
                    return;
                }
                self.dma_latch = data;
                self.bus.borrow_mut().ctrl_w(self.port, S_ACK, S_ACK);
                self.handshake = Handshake::ReceiveWaitReqLow;
                self.step(false);
            }
            Handshake::ReceiveWaitReqLow => {
                if ctrl & S_REQ != 0 {
                    return;
                }
                self.handshake = Handshake::Idle;
                self.set_drq(true);
            }
        }
    }

    fn set_drq(&mut self, asserted: bool) {
        if self.drq == asserted {
            return;
        }
        self.drq = asserted;
        if asserted {
            self.bus_status |= BAS_DMA_REQUEST;
        } else {
            self.bus_status &= !BAS_DMA_REQUEST;
        }
        if let Some(output) = self.drq_output.as_mut() {
            output(asserted);
        }
    }

    fn delay(&self, cycles: u32) {
        if self.clock_conv != 0 {
            self.delay_cycles(cycles * self.clock_conv);
        }
    }

    fn delay_cycles(&self, cycles: u32) {
        let delay = Time::from_ticks(u64::from(cycles), NOMINAL_CLOCK_HZ);
        match self.scheduler.try_borrow_mut() {
            Ok(mut sched) => sched.adjust(self.step_timer, delay, 0, Time::NEVER),
            Err(_) => log::error!(
                target: LOG_TARGET,
                "{}: scheduler busy, step timer not armed",
                self.config.tag
            ),
        }
    }

    fn cancel_step(&self) {
        if let Ok(mut sched) = self.scheduler.try_borrow_mut() {
            sched.cancel(self.step_timer);
        }
    }
}

impl BusDevice for Ncr5380 {
    fn read(&mut self, offset: Offset, _mem_mask: u64) -> u64 {
        u64::from(Self::read(self, offset))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, offset: Offset, data: u64, _mem_mask: u64) {
        Self::write(self, offset, data as u8);
    }
}

impl TimerDevice for Ncr5380 {
    fn timer_ids(&self) -> Vec<TimerId> {
        vec![self.step_timer, self.notify_timer]
    }

    fn device_timer(&mut self, id: TimerId, _param: u32) {
        if id == self.step_timer {
            self.step(true);
        } else if id == self.notify_timer {
            self.ctrl_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        reg, Handshake, Ncr5380, Ncr5380Config, BAS_END_OF_DMA, BAS_PHASE_MATCH, IC_ARB_IN_PROGRESS,
        IC_ARB_LOST, IC_BSY, IC_SEL, MODE_ARBITRATE, MODE_DMA, ST_BSY, ST_IO, ST_REQ,
    };
    use crate::machine::Machine;
    use crate::scsi::bus::{ScsiBus, SharedScsiBus, S_BSY, S_INP, S_REQ, S_SEL};
    use crate::timing::Time;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn rig() -> (Machine, SharedScsiBus, Rc<RefCell<Ncr5380>>) {
        let mut machine = Machine::new();
        let bus = ScsiBus::shared(machine.scheduler());
        let ncr = Ncr5380::new(Ncr5380Config::default(), &bus, machine.scheduler());
        let ncr = Rc::new(RefCell::new(ncr));
        machine.add_timer_device(ncr.clone());
        (machine, bus, ncr)
    }

    #[test]
    fn status_register_mirrors_the_bus() {
        let (_machine, bus, ncr) = rig();
        let other = bus.borrow_mut().attach("target", None);
        bus.borrow_mut().ctrl_w(other, S_BSY | S_REQ | S_INP, S_BSY | S_REQ | S_INP);
        assert_eq!(ncr.borrow_mut().read(reg::STATUS), ST_BSY | ST_REQ | ST_IO);
    }

    #[test]
    fn highest_id_wins_arbitration() {
        let (mut machine, bus, ncr) = rig();
        ncr.borrow_mut().write(reg::DATA, 0x80);
        ncr.borrow_mut().write(reg::MODE, MODE_ARBITRATE);
        assert_eq!(bus.borrow().ctrl_r() & S_BSY, S_BSY);
        assert_eq!(bus.borrow().data_r(), 0x80);
        assert_ne!(ncr.borrow_mut().read(reg::INITIATOR_COMMAND) & IC_ARB_IN_PROGRESS, 0);
        machine.run_for(Time::from_usec(5));
        let icmd = ncr.borrow_mut().read(reg::INITIATOR_COMMAND);
        assert_eq!(icmd & IC_ARB_LOST, 0);
        assert_eq!(ncr.borrow().handshake(), Handshake::Idle);
        ncr.borrow_mut().write(reg::MODE, 0);
        assert_eq!(ncr.borrow_mut().read(reg::INITIATOR_COMMAND) & IC_ARB_IN_PROGRESS, 0);
    }

    #[test]
    fn lower_id_loses_arbitration_and_releases_the_bus() {
        let (mut machine, bus, ncr) = rig();
        ncr.borrow_mut().write(reg::DATA, 0x80);
        let config = Ncr5380Config { scsi_id: 0, ..Ncr5380Config::default() };
        let low = Rc::new(RefCell::new(Ncr5380::new(config, &bus, machine.scheduler())));
        machine.add_timer_device(low.clone());
        ncr.borrow_mut().write(reg::MODE, MODE_ARBITRATE);
        low.borrow_mut().write(reg::DATA, 0x01);
        low.borrow_mut().write(reg::MODE, MODE_ARBITRATE);
        machine.run_for(Time::from_usec(5));
        let icmd = low.borrow_mut().read(reg::INITIATOR_COMMAND);
        assert_ne!(icmd & IC_ARB_LOST, 0);
        assert_eq!(icmd & IC_BSY, 0);
        assert_eq!(ncr.borrow_mut().read(reg::INITIATOR_COMMAND) & IC_ARB_LOST, 0);
    }

    #[test]
    fn arbitration_is_refused_while_sel_is_asserted() {
        let (_machine, bus, ncr) = rig();
        let other = bus.borrow_mut().attach("other", None);
        bus.borrow_mut().ctrl_w(other, S_SEL, S_SEL);
        ncr.borrow_mut().write(reg::MODE, MODE_ARBITRATE);
        let icmd = ncr.borrow_mut().read(reg::INITIATOR_COMMAND);
        assert_ne!(icmd & IC_ARB_LOST, 0);
        assert_eq!(icmd & IC_SEL, 0);
        assert_eq!(ncr.borrow().handshake(), Handshake::Idle);
    }

    #[test]
    fn phase_mismatch_ends_dma() {
        let (mut machine, bus, ncr) = rig();
        let target = bus.borrow_mut().attach("target", None);
        bus.borrow_mut().ctrl_w(target, S_BSY | S_INP, S_BSY | S_INP);
        ncr.borrow_mut().write(reg::TARGET_COMMAND, 0x01);
        ncr.borrow_mut().write(reg::MODE, MODE_DMA);
        assert_ne!(ncr.borrow_mut().read(reg::BUS_AND_STATUS) & BAS_PHASE_MATCH, 0);
        bus.borrow_mut().ctrl_w(target, 0, S_INP);
        machine.run_for(Time::from_usec(1));
        let mut ncr = ncr.borrow_mut();
        assert_eq!(ncr.read(reg::MODE) & MODE_DMA, 0);
        let bas = ncr.read(reg::BUS_AND_STATUS);
        assert_ne!(bas & BAS_END_OF_DMA, 0);
        assert_eq!(bas & BAS_PHASE_MATCH, 0);
    }
}
