//! Hitachi HD63450 four-channel DMA controller.
//!
//! Each channel moves bytes, words or longwords between a memory address (MAR) and a device
//! address (DAR) on a shared address space, or between memory and a device port callback.
//! Transfers are paced by scheduler timers: burst mode halts the owning CPU and runs at the
//! burst clock, cycle-steal mode runs at the channel clock, and external-request mode moves
//! one unit per DRQ rising edge.
//!
//! Completions and errors of all channels share one interrupt output; the channel driving it
//! is chosen by the priority register, lower values winning.

use crate::api::{InputLine, LineCallback, SnapshotVersion};
use crate::fault::ChannelErrorCode;
use crate::machine::TimerDevice;
use crate::memory::{AccessSide, BusDevice, Offset, SharedSpace};
use crate::scheduler::{SharedScheduler, TimerId};
use crate::timing::Time;

const LOG_TARGET: &str = "emu_core::hd63450";

/// Number of channels.
pub const CHANNELS: usize = 4;

/// CSR: channel operation complete.
pub const CSR_COC: u8 = 0x80;
/// CSR: block transfer complete.
pub const CSR_BTC: u8 = 0x40;
/// CSR: normal device termination.
pub const CSR_NDT: u8 = 0x20;
/// CSR: error; CER holds the cause.
pub const CSR_ERR: u8 = 0x10;
/// CSR: channel active.
pub const CSR_ACT: u8 = 0x08;
/// CSR: peripheral control line transition.
pub const CSR_PCT: u8 = 0x02;
/// CSR bits that request an interrupt.
pub const CSR_IRQ_MASK: u8 = CSR_COC | CSR_BTC | CSR_NDT | CSR_ERR | CSR_PCT;

/// CCR: start operation.
pub const CCR_STR: u8 = 0x80;
/// CCR: continue operation.
pub const CCR_CNT: u8 = 0x40;
/// CCR: halt operation.
pub const CCR_HLT: u8 = 0x20;
/// CCR: software abort.
pub const CCR_SAB: u8 = 0x10;
/// CCR: interrupt enable.
pub const CCR_INT: u8 = 0x08;

/// OCR: transfer direction, set for device to memory.
pub const OCR_DIR: u8 = 0x80;

const OCR_SIZE_MASK: u8 = 0x30;
const OCR_CHAIN_MASK: u8 = 0x0c;
const OCR_CHAIN_ARRAY: u8 = 0x08;
const OCR_CHAIN_LINK: u8 = 0x0c;
const OCR_REQG_MASK: u8 = 0x03;
const OCR_REQG_EXTERNAL: u8 = 0x02;
const OCR_REQG_AUTO_THEN_EXTERNAL: u8 = 0x03;
const DCR_XRM_MASK: u8 = 0xc0;

/// Vector returned by an interrupt acknowledge with nothing pending.
pub const SPURIOUS_VECTOR: u8 = 0x18;

/// Delay from a start command to the first auto-requested transfer.
pub const START_DELAY: Time = Time::from_usec(500);

const REG_CSR_CER: u32 = 0x00;
const REG_DCR_OCR: u32 = 0x02;
const REG_SCR_CCR: u32 = 0x03;
const REG_MTC: u32 = 0x05;
const REG_MAR_HI: u32 = 0x06;
const REG_MAR_LO: u32 = 0x07;
const REG_DAR_HI: u32 = 0x0a;
const REG_DAR_LO: u32 = 0x0b;
const REG_BTC: u32 = 0x0d;
const REG_BAR_HI: u32 = 0x0e;
const REG_BAR_LO: u32 = 0x0f;
const REG_NIV: u32 = 0x12;
const REG_EIV: u32 = 0x13;
const REG_MFC: u32 = 0x14;
const REG_CPR: u32 = 0x16;
const REG_DFC: u32 = 0x18;
const REG_BFC: u32 = 0x1c;
const REG_GCR: u32 = 0x1f;

/// Device-port read for device-to-memory transfers; `None` means the device is not ready and
/// the transfer is retried on the next request.
pub type DmaReadFn = Box<dyn FnMut(u32) -> Option<u8>>;
/// Device-port write for memory-to-device transfers.
pub type DmaWriteFn = Box<dyn FnMut(u32, u8)>;
/// Called with the channel number when a channel completes normally.
pub type DmaEndFn = Box<dyn FnMut(usize)>;

/// Construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Hd63450Config {
    /// Device tag used in diagnostics and timer names.
    pub tag: String,
    /// Per-channel transfer period in cycle-steal and DRQ modes.
    pub our_clock: [Time; CHANNELS],
    /// Per-channel transfer period in burst mode.
    pub burst_clock: [Time; CHANNELS],
}

impl Default for Hd63450Config {
    fn default() -> Self {
        Self {
            tag: "dmac".to_owned(),
            our_clock: [Time::from_usec(2); CHANNELS],
            burst_clock: [Time::from_nsec(500); CHANNELS],
        }
    }
}

/// Programming registers of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[allow(missing_docs)]
pub struct ChannelRegisters {
    pub csr: u8,
    pub cer: u8,
    pub dcr: u8,
    pub ocr: u8,
    pub scr: u8,
    pub ccr: u8,
    pub mtc: u16,
    pub mar: u32,
    pub dar: u32,
    pub btc: u16,
    pub bar: u32,
    pub niv: u8,
    pub eiv: u8,
    pub mfc: u8,
    pub cpr: u8,
    pub dfc: u8,
    pub bfc: u8,
    pub gcr: u8,
}

impl ChannelRegisters {
    const fn interrupt_pending(&self) -> bool {
        self.ccr & CCR_INT != 0 && self.csr & CSR_IRQ_MASK != 0
    }

    const fn priority(&self) -> u8 {
        self.cpr & 0x03
    }

    const fn is_burst(&self) -> bool {
        self.dcr & DCR_XRM_MASK == 0
    }

    const fn is_external_request(&self) -> bool {
        self.ocr & OCR_REQG_MASK == OCR_REQG_EXTERNAL
    }
}

/// Coarse channel state derived from the status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not transferring.
    Idle,
    /// Transferring.
    Active,
    /// Active but paused by a halt command.
    Halted,
    /// Stopped on an error; CER holds the cause.
    Error,
}

/// Size of one transfer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationSize {
    /// One byte.
    Byte,
    /// One 16-bit word.
    Word,
    /// One 32-bit longword, moved as two words.
    Long,
    /// Packed byte, moved as a single byte.
    PackedByte,
}

impl OperationSize {
    /// Decodes the OCR size field.
    #[must_use]
    pub const fn from_ocr(ocr: u8) -> Self {
        match ocr & OCR_SIZE_MASK {
            0x00 => Self::Byte,
            0x10 => Self::Word,
            0x20 => Self::Long,
            _ => Self::PackedByte,
        }
    }

    /// Address step of one unit.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Byte | Self::PackedByte => 1,
            Self::Word => 2,
            Self::Long => 4,
        }
    }
}

/// Every field that survives a save/restore cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Hd63450Snapshot {
    /// Schema version.
    pub version: SnapshotVersion,
    /// Channel registers.
    pub registers: [ChannelRegisters; CHANNELS],
    /// MTC latched at each start.
    pub transfer_size: [u16; CHANNELS],
    /// Halt command in effect.
    pub halted: [bool; CHANNELS],
    /// Last DRQ level seen.
    pub drq_state: [bool; CHANNELS],
    /// Channel driving the interrupt output.
    pub irq_channel: Option<usize>,
    /// Time until each transfer timer fires, [`Time::NEVER`] when disarmed.
    pub timer_remaining: [Time; CHANNELS],
    /// Period each transfer timer was armed with.
    pub timer_period: [Time; CHANNELS],
    /// Timer state captured by a halt command, restored on continue.
    pub halted_remaining: [Time; CHANNELS],
    /// Channels holding the CPU halted for a burst, one bit each.
    pub burst_holds: u8,
}

/// The controller.
pub struct Hd63450 {
    config: Hd63450Config,
    space: SharedSpace,
    scheduler: SharedScheduler,
    regs: [ChannelRegisters; CHANNELS],
    timers: [TimerId; CHANNELS],
    drq_watch: [TimerId; CHANNELS],
    drq_lines: [InputLine; CHANNELS],
    transfer_size: [u16; CHANNELS],
    halted: [bool; CHANNELS],
    halted_remaining: [Time; CHANNELS],
    armed_period: [Time; CHANNELS],
    drq_state: [bool; CHANNELS],
    irq_channel: Option<usize>,
    burst_holds: u8,
    cpu_halt: Option<InputLine>,
    irq_output: Option<LineCallback>,
    dma_end: Option<DmaEndFn>,
    dma_read: [Option<DmaReadFn>; CHANNELS],
    dma_write: [Option<DmaWriteFn>; CHANNELS],
}

impl core::fmt::Debug for Hd63450 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hd63450")
            .field("tag", &self.config.tag)
            .field("regs", &self.regs)
            .field("irq_channel", &self.irq_channel)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn timer_param(channel: usize) -> u32 {
    channel as u32
}

const fn combine16(old: u16, data: u16, mem_mask: u16) -> u16 {
    (old & !mem_mask) | (data & mem_mask)
}

#[allow(clippy::cast_lossless)]
const fn set_high(value: u32, high: u16) -> u32 {
    (value & 0x0000_ffff) | ((high as u32) << 16)
}

#[allow(clippy::cast_lossless)]
const fn set_low(value: u32, low: u16) -> u32 {
    (value & 0xffff_0000) | low as u32
}

#[allow(clippy::cast_possible_truncation)]
const fn high_half(value: u32) -> u16 {
    (value >> 16) as u16
}

#[allow(clippy::cast_possible_truncation)]
const fn low_half(value: u32) -> u16 {
    value as u16
}

impl Hd63450 {
    /// Creates a controller that masters `space`, allocating its timers from `scheduler`.
    ///
    /// The DRQ inputs returned by [`Hd63450::drq_line`] are watched through scheduler timers,
    /// so a device may drive them from inside a transfer callback.
    #[must_use]
    pub fn new(config: Hd63450Config, space: SharedSpace, scheduler: &SharedScheduler) -> Self {
        let (timers, drq_watch) = {
            let mut sched = scheduler.borrow_mut();
            let timers: [TimerId; CHANNELS] =
                core::array::from_fn(|ch| sched.allocate(&format!("{}:ch{ch}", config.tag)));
            let drq_watch: [TimerId; CHANNELS] =
                core::array::from_fn(|ch| sched.allocate(&format!("{}:drq{ch}", config.tag)));
            (timers, drq_watch)
        };
        let drq_lines: [InputLine; CHANNELS] = core::array::from_fn(|_| InputLine::new());
        for (ch, line) in drq_lines.iter().enumerate() {
            line.watch(scheduler, drq_watch[ch], timer_param(ch));
        }
        let mut dmac = Self {
            config,
            space,
            scheduler: scheduler.clone(),
            regs: [ChannelRegisters::default(); CHANNELS],
            timers,
            drq_watch,
            drq_lines,
            transfer_size: [0; CHANNELS],
            halted: [false; CHANNELS],
            halted_remaining: [Time::NEVER; CHANNELS],
            armed_period: [Time::NEVER; CHANNELS],
            drq_state: [false; CHANNELS],
            irq_channel: None,
            burst_holds: 0,
            cpu_halt: None,
            irq_output: None,
            dma_end: None,
            dma_read: Default::default(),
            dma_write: Default::default(),
        };
        dmac.device_reset();
        dmac
    }

    /// Configuration the controller was built with.
    #[must_use]
    pub const fn config(&self) -> &Hd63450Config {
        &self.config
    }

    /// Wires the halt input of the CPU that burst transfers stop.
    pub fn set_cpu_halt_line(&mut self, line: InputLine) {
        line.set_level(self.burst_holds != 0);
        self.cpu_halt = Some(line);
    }

    /// Wires the interrupt output.
    pub fn set_irq_callback(&mut self, callback: LineCallback) {
        self.irq_output = Some(callback);
    }

    /// Wires the end-of-transfer output.
    pub fn set_dma_end_callback(&mut self, callback: DmaEndFn) {
        self.dma_end = Some(callback);
    }

    /// Binds a device-port read to `channel`; device-to-memory transfers then take their data
    /// from it instead of DAR.
    pub fn set_dma_read(&mut self, channel: usize, callback: DmaReadFn) {
        if let Some(slot) = self.dma_read.get_mut(channel) {
            *slot = Some(callback);
        }
    }

    /// Binds a device-port write to `channel`; memory-to-device transfers then deliver their
    /// data to it instead of DAR.
    pub fn set_dma_write(&mut self, channel: usize, callback: DmaWriteFn) {
        if let Some(slot) = self.dma_write.get_mut(channel) {
            *slot = Some(callback);
        }
    }

    /// DRQ input of `channel`.
    #[must_use]
    pub fn drq_line(&self, channel: usize) -> Option<&InputLine> {
        self.drq_lines.get(channel)
    }

    /// Registers of `channel`.
    #[must_use]
    pub fn registers(&self, channel: usize) -> Option<&ChannelRegisters> {
        self.regs.get(channel)
    }

    /// Coarse state of `channel`; unknown channels report idle.
    #[must_use]
    pub fn channel_state(&self, channel: usize) -> ChannelState {
        let Some(regs) = self.regs.get(channel) else {
            return ChannelState::Idle;
        };
        if regs.csr & CSR_ACT != 0 {
            if self.halted[channel] {
                ChannelState::Halted
            } else {
                ChannelState::Active
            }
        } else if regs.csr & CSR_ERR != 0 {
            ChannelState::Error
        } else {
            ChannelState::Idle
        }
    }

    /// Channel currently driving the interrupt output.
    #[must_use]
    pub const fn irq_channel(&self) -> Option<usize> {
        self.irq_channel
    }

    /// Level of the interrupt output.
    #[must_use]
    pub const fn irq_asserted(&self) -> bool {
        self.irq_channel.is_some()
    }

    /// Reset: every channel stops, vectors return to 0x0f and the interrupt output clears.
    pub fn device_reset(&mut self) {
        for ch in 0..CHANNELS {
            let regs = &mut self.regs[ch];
            regs.niv = 0x0f;
            regs.eiv = 0x0f;
            regs.cpr = 0;
            regs.dcr = 0;
            regs.ocr = 0;
            regs.scr = 0;
            regs.ccr = 0;
            regs.csr &= 0x01;
            regs.cer = 0;
            regs.gcr = 0;
            self.disarm(ch);
            self.halted[ch] = false;
            self.halted_remaining[ch] = Time::NEVER;
            self.release_cpu(ch);
        }
        self.irq_channel = None;
        self.drive_irq(false);
    }

    /// Reads the 16-bit register at word `offset`; undefined registers read 0xff.
    #[must_use]
    pub fn read(&self, offset: Offset) -> u16 {
        let channel = ((offset & 0x60) >> 5) as usize;
        let regs = &self.regs[channel];
        match offset & 0x1f {
            REG_CSR_CER => u16::from_be_bytes([regs.csr, regs.cer]),
            REG_DCR_OCR => u16::from_be_bytes([regs.dcr, regs.ocr]),
            REG_SCR_CCR => u16::from_be_bytes([regs.scr, regs.ccr]),
            REG_MTC => regs.mtc,
            REG_MAR_HI => high_half(regs.mar),
            REG_MAR_LO => low_half(regs.mar),
            REG_DAR_HI => high_half(regs.dar),
            REG_DAR_LO => low_half(regs.dar),
            REG_BTC => regs.btc,
            REG_BAR_HI => high_half(regs.bar),
            REG_BAR_LO => low_half(regs.bar),
            REG_NIV => u16::from(regs.niv),
            REG_EIV => u16::from(regs.eiv),
            REG_MFC => u16::from(regs.mfc),
            REG_CPR => u16::from(regs.cpr),
            REG_DFC => u16::from(regs.dfc),
            REG_BFC => u16::from(regs.bfc),
            REG_GCR => u16::from(regs.gcr),
            _ => 0xff,
        }
    }

    /// Writes the 16-bit register at word `offset`; only the byte lanes set in `mem_mask`
    /// are affected.
    #[allow(clippy::too_many_lines)]
    pub fn write(&mut self, offset: Offset, data: u16, mem_mask: u16) {
        let channel = ((offset & 0x60) >> 5) as usize;
        let upper = mem_mask & 0xff00 != 0;
        let lower = mem_mask & 0x00ff != 0;
        let [data_hi, data_lo] = data.to_be_bytes();
        let reg = offset & 0x1f;
        match reg {
            REG_CSR_CER => {
                if upper {
                    // ones clear status bits; ACT and PCS are read only
                    let regs = &mut self.regs[channel];
                    regs.csr &= !(data_hi & 0xf6);
                    if data_hi & CSR_ERR != 0 {
                        regs.cer = 0;
                    }
                    if regs.csr & CSR_IRQ_MASK == 0 {
                        self.clear_irq(channel);
                    }
                }
            }
            REG_DCR_OCR => {
                if upper {
                    self.regs[channel].dcr = data_hi;
                }
                if lower {
                    self.regs[channel].ocr = data_lo;
                }
                log::debug!(
                    target: LOG_TARGET,
                    "{} ch{channel}: dcr {:02x} ocr {:02x}",
                    self.config.tag,
                    self.regs[channel].dcr,
                    self.regs[channel].ocr
                );
            }
            REG_SCR_CCR => {
                if upper {
                    self.regs[channel].scr = data_hi;
                }
                if lower {
                    self.write_ccr(channel, data_lo);
                }
            }
            REG_MTC => {
                let regs = &mut self.regs[channel];
                regs.mtc = combine16(regs.mtc, data, mem_mask);
            }
            REG_MAR_HI | REG_MAR_LO | REG_DAR_HI | REG_DAR_LO | REG_BAR_HI | REG_BAR_LO => {
                let regs = &mut self.regs[channel];
                let target = match reg {
                    REG_MAR_HI | REG_MAR_LO => &mut regs.mar,
                    REG_DAR_HI | REG_DAR_LO => &mut regs.dar,
                    _ => &mut regs.bar,
                };
                *target = if reg & 1 == 0 {
                    set_high(*target, combine16(high_half(*target), data, mem_mask))
                } else {
                    set_low(*target, combine16(low_half(*target), data, mem_mask))
                };
            }
            REG_BTC => {
                let regs = &mut self.regs[channel];
                regs.btc = combine16(regs.btc, data, mem_mask);
            }
            REG_NIV | REG_EIV | REG_MFC | REG_CPR | REG_DFC | REG_BFC | REG_GCR => {
                if !lower {
                    return;
                }
                let regs = &mut self.regs[channel];
                let target = match reg {
                    REG_NIV => &mut regs.niv,
                    REG_EIV => &mut regs.eiv,
                    REG_MFC => &mut regs.mfc,
                    REG_CPR => &mut regs.cpr,
                    REG_DFC => &mut regs.dfc,
                    REG_BFC => &mut regs.bfc,
                    _ => &mut regs.gcr,
                };
                *target = data_lo;
            }
            _ => log::trace!(
                target: LOG_TARGET,
                "{} ch{channel}: write {data:04x} to undefined register {reg:02x}",
                self.config.tag
            ),
        }
    }

    fn write_ccr(&mut self, channel: usize, data: u8) {
        self.regs[channel].ccr = data;
        log::debug!(target: LOG_TARGET, "{} ch{channel}: ccr {data:02x}", self.config.tag);
        if data & CCR_STR != 0 {
            self.start_transfer(channel);
        }
        if data & CCR_SAB != 0 {
            self.abort_transfer(channel);
        }
        if data & CCR_HLT != 0 {
            self.halt_transfer(channel);
        }
        if data & CCR_CNT != 0 {
            self.continue_transfer(channel);
        }
        if data & CCR_INT == 0 {
            self.clear_irq(channel);
        } else if self.regs[channel].csr & CSR_IRQ_MASK != 0 {
            self.set_irq(channel);
        }
    }

    /// Drives the DRQ input of `channel` directly.
    ///
    /// In the external-request modes a rising edge performs one transfer and starts the
    /// channel clock; a falling edge stops it.
    pub fn drq_w(&mut self, channel: usize, state: bool) {
        if channel >= CHANNELS {
            return;
        }
        let previous = self.drq_state[channel];
        self.drq_state[channel] = state;
        if self.regs[channel].ocr & OCR_REQG_EXTERNAL == 0 {
            return;
        }
        if state && !previous {
            self.single_transfer(channel);
            if self.regs[channel].csr & CSR_ACT != 0 && !self.halted[channel] {
                let period = self.config.our_clock[channel];
                self.arm(channel, period, period);
            }
        } else if !state {
            self.disarm(channel);
        }
    }

    /// Interrupt acknowledge: the error or normal vector of the interrupting channel.
    #[must_use]
    pub fn iack(&self) -> u8 {
        match self.irq_channel {
            Some(channel) if self.regs[channel].csr & CSR_ERR != 0 => self.regs[channel].eiv,
            Some(channel) => self.regs[channel].niv,
            None => SPURIOUS_VECTOR,
        }
    }

    /// Sets the cycle-steal period of `channel`, restarting its clock if it is transferring.
    pub fn set_our_clock(&mut self, channel: usize, period: Time) {
        if channel >= CHANNELS {
            return;
        }
        self.config.our_clock[channel] = period;
        if self.regs[channel].csr & CSR_ACT != 0 && !self.halted[channel] {
            self.arm(channel, Time::ZERO, period);
        }
    }

    /// Sets the burst period of `channel`; takes effect at the next start.
    pub fn set_burst_clock(&mut self, channel: usize, period: Time) {
        if let Some(slot) = self.config.burst_clock.get_mut(channel) {
            *slot = period;
        }
    }

    /// Captures every save-state field.
    #[must_use]
    pub fn snapshot(&self) -> Hd63450Snapshot {
        let timer_remaining = {
            let sched = self.scheduler.borrow();
            core::array::from_fn(|ch| sched.remaining(self.timers[ch]))
        };
        Hd63450Snapshot {
            version: SnapshotVersion::V1,
            registers: self.regs,
            transfer_size: self.transfer_size,
            halted: self.halted,
            drq_state: self.drq_state,
            irq_channel: self.irq_channel,
            timer_remaining,
            timer_period: self.armed_period,
            halted_remaining: self.halted_remaining,
            burst_holds: self.burst_holds,
        }
    }

    /// Restores a snapshot taken with [`Hd63450::snapshot`], re-arming timers relative to the
    /// current time.
    pub fn restore(&mut self, snapshot: &Hd63450Snapshot) {
        self.regs = snapshot.registers;
        self.transfer_size = snapshot.transfer_size;
        self.halted = snapshot.halted;
        self.drq_state = snapshot.drq_state;
        self.irq_channel = snapshot.irq_channel.filter(|&ch| ch < CHANNELS);
        self.halted_remaining = snapshot.halted_remaining;
        self.burst_holds = snapshot.burst_holds;
        for ch in 0..CHANNELS {
            let remaining = snapshot.timer_remaining[ch];
            if remaining.is_never() {
                self.disarm(ch);
            } else {
                self.arm(ch, remaining, snapshot.timer_period[ch]);
            }
        }
        if let Some(line) = &self.cpu_halt {
            line.set_level(self.burst_holds != 0);
        }
        let asserted = self.irq_channel.is_some();
        self.drive_irq(asserted);
    }

    // ----------------------------------------------------------------------------------------
    // Channel control

    fn start_transfer(&mut self, ch: usize) {
        if self.regs[ch].csr & CSR_ACT != 0 {
            log::debug!(target: LOG_TARGET, "{} ch{ch}: start ignored, channel active", self.config.tag);
            return;
        }
        let regs = &mut self.regs[ch];
        regs.csr &= !(CSR_COC | CSR_BTC | CSR_NDT | CSR_ERR);
        regs.csr |= CSR_ACT;
        self.halted[ch] = false;
        self.halted_remaining[ch] = Time::NEVER;

        match self.regs[ch].ocr & OCR_CHAIN_MASK {
            0 => {
                if self.regs[ch].mtc == 0 {
                    self.set_error(ch, ChannelErrorCode::CountMemory);
                    return;
                }
            }
            OCR_CHAIN_ARRAY => {
                if self.regs[ch].btc == 0 {
                    self.set_error(ch, ChannelErrorCode::CountBase);
                    return;
                }
                if !self.load_chain_entry(ch) {
                    return;
                }
                self.regs[ch].btc -= 1;
            }
            OCR_CHAIN_LINK => {
                if !self.load_chain_entry(ch) {
                    return;
                }
            }
            _ => {
                self.set_error(ch, ChannelErrorCode::Configuration);
                return;
            }
        }

        let regs = self.regs[ch];
        if regs.is_burst() {
            self.hold_cpu(ch);
            self.arm(ch, Time::ZERO, self.config.burst_clock[ch]);
        } else if regs.ocr & OCR_REQG_EXTERNAL == 0 {
            self.arm(ch, START_DELAY, self.config.our_clock[ch]);
        } else if regs.ocr & OCR_REQG_MASK == OCR_REQG_AUTO_THEN_EXTERNAL {
            self.arm(ch, START_DELAY, Time::NEVER);
        } else {
            self.disarm(ch);
        }
        self.transfer_size[ch] = self.regs[ch].mtc;
        log::debug!(
            target: LOG_TARGET,
            "{} ch{ch}: transfer begins, {} units {:08x} <-> {:08x}",
            self.config.tag,
            self.transfer_size[ch],
            regs.mar,
            regs.dar
        );
    }

    fn abort_transfer(&mut self, ch: usize) {
        if self.regs[ch].csr & CSR_ACT == 0 {
            return;
        }
        log::debug!(target: LOG_TARGET, "{} ch{ch}: transfer aborted", self.config.tag);
        self.halted[ch] = false;
        self.set_error(ch, ChannelErrorCode::SoftwareAbort);
    }

    fn halt_transfer(&mut self, ch: usize) {
        if self.halted[ch] {
            return;
        }
        self.halted[ch] = true;
        self.halted_remaining[ch] = self
            .scheduler
            .try_borrow()
            .map_or(Time::NEVER, |sched| sched.remaining(self.timers[ch]));
        self.disarm(ch);
        self.release_cpu(ch);
    }

    fn continue_transfer(&mut self, ch: usize) {
        if !self.halted[ch] {
            return;
        }
        self.halted[ch] = false;
        if self.regs[ch].csr & CSR_ACT == 0 {
            return;
        }
        if self.regs[ch].is_burst() {
            self.hold_cpu(ch);
        }
        let remaining = core::mem::replace(&mut self.halted_remaining[ch], Time::NEVER);
        if !remaining.is_never() {
            self.arm(ch, remaining, self.armed_period[ch]);
        }
    }

    /// Loads MAR and MTC from the chain entry at BAR; a link entry also replaces BAR with the
    /// next link. Returns `false` after raising a bus error.
    fn load_chain_entry(&mut self, ch: usize) -> bool {
        let bar = self.regs[ch].bar;
        if self.bus_fault(AccessSide::Read, bar) {
            self.set_error(ch, ChannelErrorCode::BusBase);
            return false;
        }
        let link = self.regs[ch].ocr & OCR_CHAIN_MASK == OCR_CHAIN_LINK;
        let (mar, mtc, next) = {
            let space = self.space.borrow();
            let mar = (u32::from(space.read_word(bar)) << 16)
                | u32::from(space.read_word(bar.wrapping_add(2)));
            let mtc = space.read_word(bar.wrapping_add(4));
            let next = link.then(|| {
                (u32::from(space.read_word(bar.wrapping_add(6))) << 16)
                    | u32::from(space.read_word(bar.wrapping_add(8)))
            });
            (mar, mtc, next)
        };
        let regs = &mut self.regs[ch];
        regs.mar = mar;
        regs.mtc = mtc;
        if let Some(next) = next {
            regs.bar = next;
        }
        true
    }

    fn transfer_timer(&mut self, ch: usize) {
        if self.regs[ch].is_external_request() && !self.drq_state[ch] {
            return;
        }
        self.single_transfer(ch);
    }

    /// Moves one unit and handles the end of the block.
    fn single_transfer(&mut self, ch: usize) {
        if self.regs[ch].csr & CSR_ACT == 0 || self.halted[ch] {
            return;
        }
        let regs = self.regs[ch];
        let size = OperationSize::from_ocr(regs.ocr);
        let moved = if regs.ocr & OCR_DIR != 0 {
            self.device_to_memory(ch, size)
        } else {
            self.memory_to_device(ch, size)
        };
        let Some(moved) = moved else {
            return;
        };

        let regs = &mut self.regs[ch];
        regs.mtc = regs.mtc.saturating_sub(1);
        match regs.scr & 0x03 {
            0x01 => regs.dar = regs.dar.wrapping_add(moved),
            0x02 => regs.dar = regs.dar.wrapping_sub(moved),
            _ => {}
        }
        match regs.scr & 0x0c {
            0x04 => regs.mar = regs.mar.wrapping_add(moved),
            0x08 => regs.mar = regs.mar.wrapping_sub(moved),
            _ => {}
        }
        if regs.mtc == 0 {
            self.end_of_block(ch);
        }
    }

    /// Returns the unit size moved, or `None` when nothing moved.
    fn device_to_memory(&mut self, ch: usize, size: OperationSize) -> Option<u32> {
        let ChannelRegisters { mar, dar, .. } = self.regs[ch];
        if self.bus_fault(AccessSide::Write, mar) {
            self.set_error(ch, ChannelErrorCode::BusMemory);
            return None;
        }
        if let Some(read) = self.dma_read[ch].as_mut() {
            // not ready: retried on the next request
            let data = read(mar)?;
            self.space.borrow().write_byte(mar, data);
            log::trace!(target: LOG_TARGET, "{} ch{ch}: port -> {mar:08x} = {data:02x}", self.config.tag);
            return Some(1);
        }
        if self.bus_fault(AccessSide::Read, dar) {
            self.set_error(ch, ChannelErrorCode::BusDevice);
            return None;
        }
        Some(self.copy_unit(dar, mar, size))
    }

    fn memory_to_device(&mut self, ch: usize, size: OperationSize) -> Option<u32> {
        let ChannelRegisters { mar, dar, .. } = self.regs[ch];
        if self.bus_fault(AccessSide::Read, mar) {
            self.set_error(ch, ChannelErrorCode::BusMemory);
            return None;
        }
        if let Some(write) = self.dma_write[ch].as_mut() {
            let data = self.space.borrow().read_byte(mar);
            write(mar, data);
            log::trace!(target: LOG_TARGET, "{} ch{ch}: {mar:08x} -> port = {data:02x}", self.config.tag);
            return Some(1);
        }
        if self.bus_fault(AccessSide::Write, dar) {
            self.set_error(ch, ChannelErrorCode::BusDevice);
            return None;
        }
        Some(self.copy_unit(mar, dar, size))
    }

    fn copy_unit(&self, from: u32, to: u32, size: OperationSize) -> u32 {
        let space = self.space.borrow();
        match size {
            OperationSize::Byte | OperationSize::PackedByte => {
                space.write_byte(to, space.read_byte(from));
            }
            OperationSize::Word => space.write_word(to, space.read_word(from)),
            OperationSize::Long => {
                let high = space.read_word(from);
                let low = space.read_word(from.wrapping_add(2));
                space.write_word(to, high);
                space.write_word(to.wrapping_add(2), low);
            }
        }
        size.bytes()
    }

    fn end_of_block(&mut self, ch: usize) {
        let regs = self.regs[ch];
        match regs.ocr & OCR_CHAIN_MASK {
            OCR_CHAIN_ARRAY if regs.btc > 0 => {
                self.regs[ch].btc -= 1;
                self.regs[ch].bar = regs.bar.wrapping_add(6);
                self.load_chain_entry(ch);
                return;
            }
            OCR_CHAIN_LINK if regs.bar != 0 => {
                self.load_chain_entry(ch);
                return;
            }
            _ => {}
        }
        log::debug!(target: LOG_TARGET, "{} ch{ch}: end of transfer", self.config.tag);
        self.disarm(ch);
        let regs = &mut self.regs[ch];
        regs.csr |= CSR_COC | CSR_BTC | CSR_NDT;
        regs.csr &= !CSR_ACT;
        regs.ccr &= !(CCR_STR | CCR_CNT);
        self.release_cpu(ch);
        if let Some(end) = self.dma_end.as_mut() {
            end(ch);
        }
        self.set_irq(ch);
    }

    fn set_error(&mut self, ch: usize, code: ChannelErrorCode) {
        log::debug!(target: LOG_TARGET, "{} ch{ch}: {code}", self.config.tag);
        self.disarm(ch);
        let regs = &mut self.regs[ch];
        regs.csr |= CSR_COC | CSR_ERR;
        regs.csr &= !CSR_ACT;
        regs.cer = code.as_u8();
        regs.ccr &= !(CCR_STR | CCR_CNT);
        self.release_cpu(ch);
        self.set_irq(ch);
    }

    fn bus_fault(&self, side: AccessSide, address: u32) -> bool {
        self.space.borrow().is_unmapped(side, address)
    }

    // ----------------------------------------------------------------------------------------
    // Interrupt aggregation

    fn set_irq(&mut self, ch: usize) {
        if self.regs[ch].ccr & CCR_INT == 0 {
            return;
        }
        match self.irq_channel {
            None => {
                self.irq_channel = Some(ch);
                self.drive_irq(true);
            }
            Some(current) if self.regs[ch].priority() < self.regs[current].priority() => {
                self.irq_channel = Some(ch);
            }
            Some(_) => {}
        }
    }

    /// Hands the interrupt to the best pending channel, scanning from the one after `ch`,
    /// or releases the output when none is pending.
    fn clear_irq(&mut self, ch: usize) {
        if self.irq_channel != Some(ch) {
            return;
        }
        for priority in 0..=3 {
            for step in 1..CHANNELS {
                let candidate = (ch + step) % CHANNELS;
                let regs = &self.regs[candidate];
                if regs.priority() == priority && regs.interrupt_pending() {
                    self.irq_channel = Some(candidate);
                    return;
                }
            }
        }
        self.irq_channel = None;
        self.drive_irq(false);
    }

    fn drive_irq(&mut self, asserted: bool) {
        if let Some(output) = self.irq_output.as_mut() {
            output(asserted);
        }
    }

    // ----------------------------------------------------------------------------------------
    // Timers and CPU hold

    fn arm(&mut self, ch: usize, delay: Time, period: Time) {
        self.armed_period[ch] = period;
        match self.scheduler.try_borrow_mut() {
            Ok(mut sched) => sched.adjust(self.timers[ch], delay, timer_param(ch), period),
            Err(_) => log::error!(
                target: LOG_TARGET,
                "{} ch{ch}: scheduler busy, transfer timer not armed",
                self.config.tag
            ),
        }
    }

    fn disarm(&self, ch: usize) {
        if let Ok(mut sched) = self.scheduler.try_borrow_mut() {
            sched.cancel(self.timers[ch]);
        }
    }

    fn hold_cpu(&mut self, ch: usize) {
        let was_held = self.burst_holds != 0;
        self.burst_holds |= 1 << ch;
        if !was_held {
            if let Some(line) = &self.cpu_halt {
                line.set_level(true);
            }
        }
    }

    fn release_cpu(&mut self, ch: usize) {
        let bit = 1 << ch;
        if self.burst_holds & bit == 0 {
            return;
        }
        self.burst_holds &= !bit;
        if self.burst_holds == 0 {
            if let Some(line) = &self.cpu_halt {
                line.set_level(false);
            }
        }
    }
}

impl BusDevice for Hd63450 {
    fn read(&mut self, offset: Offset, _mem_mask: u64) -> u64 {
        u64::from(Self::read(self, offset))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, offset: Offset, data: u64, mem_mask: u64) {
        Self::write(self, offset, data as u16, mem_mask as u16);
    }
}

impl TimerDevice for Hd63450 {
    fn timer_ids(&self) -> Vec<TimerId> {
        self.timers.iter().chain(self.drq_watch.iter()).copied().collect()
    }

    fn device_timer(&mut self, id: TimerId, param: u32) {
        let Some(ch) = usize::try_from(param).ok().filter(|&ch| ch < CHANNELS) else {
            return;
        };
        if self.timers[ch] == id {
            self.transfer_timer(ch);
        } else if self.drq_watch[ch] == id {
            let level = self.drq_lines[ch].level();
            self.drq_w(ch, level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ChannelState, Hd63450, Hd63450Config, CSR_ACT, CSR_COC, CSR_ERR, START_DELAY,
    };
    use crate::api::InputLine;
    use crate::fault::ChannelErrorCode;
    use crate::machine::Machine;
    use crate::memory::{AddressSpace, DataWidth, Endianness, MemoryBlock, SpaceConfig};
    use crate::timing::Time;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Rig {
        machine: Machine,
        ram: MemoryBlock,
        dmac: Rc<RefCell<Hd63450>>,
    }

    fn rig() -> Rig {
        let machine = Machine::new();
        let config = SpaceConfig::new("program", DataWidth::Bits16, 24, Endianness::Big);
        let mut space = AddressSpace::new(config, machine.context().clone()).expect("space");
        let ram = space.install_ram(0x0000, 0xffff, 0).expect("ram");
        let space = space.into_shared();
        let dmac = Hd63450::new(Hd63450Config::default(), space, machine.scheduler());
        let dmac = Rc::new(RefCell::new(dmac));
        let mut rig = Rig { machine, ram, dmac };
        rig.machine.add_timer_device(rig.dmac.clone());
        rig
    }

    fn reg(dmac: &Rc<RefCell<Hd63450>>, channel: u32, reg: u32, value: u16) {
        dmac.borrow_mut().write(channel * 0x20 + reg, value, 0xffff);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn program(dmac: &Rc<RefCell<Hd63450>>, channel: u32, mar: u32, dar: u32, count: u16) {
        reg(dmac, channel, 0x05, count);
        reg(dmac, channel, 0x06, (mar >> 16) as u16);
        reg(dmac, channel, 0x07, mar as u16);
        reg(dmac, channel, 0x0a, (dar >> 16) as u16);
        reg(dmac, channel, 0x0b, dar as u16);
    }

    #[test]
    fn byte_lanes_mask_register_writes() {
        let rig = rig();
        let mut dmac = rig.dmac.borrow_mut();
        dmac.write(0x06, 0x1234, 0xffff);
        dmac.write(0x07, 0x5678, 0x00ff);
        assert_eq!(dmac.registers(0).map(|r| r.mar), Some(0x1234_0078));
        dmac.write(0x02, 0x8012, 0xff00);
        assert_eq!(dmac.read(0x02), 0x8000);
        dmac.write(0x20 + 0x12, 0x0040, 0xff00);
        assert_eq!(dmac.read(0x20 + 0x12), 0x000f);
        assert_eq!(dmac.read(0x01), 0x00ff);
    }

    #[test]
    fn cycle_steal_copies_with_independent_address_steps() {
        let mut rig = rig();
        rig.ram.load(0x1000, &[1, 2, 3, 4]);
        program(&rig.dmac, 0, 0x1000, 0x2003, 4);
        // cycle steal, memory to device, bytes; MAR counts up, DAR counts down
        reg(&rig.dmac, 0, 0x02, 0x8000);
        reg(&rig.dmac, 0, 0x03, 0x0680);
        rig.machine.run_for(START_DELAY.saturating_add(Time::from_usec(10)));
        assert_eq!(rig.ram.to_vec()[0x2000..0x2004], [4, 3, 2, 1]);
        let dmac = rig.dmac.borrow();
        assert_eq!(dmac.channel_state(0), ChannelState::Idle);
        assert_eq!(dmac.registers(0).map(|r| (r.mar, r.dar)), Some((0x1004, 0x1fff)));
    }

    #[test]
    fn burst_holds_the_cpu_until_the_block_ends() {
        let mut rig = rig();
        let halt = InputLine::new();
        rig.dmac.borrow_mut().set_cpu_halt_line(halt.clone());
        program(&rig.dmac, 1, 0x0100, 0x0200, 2);
        // burst, word size
        reg(&rig.dmac, 1, 0x02, 0x0010);
        reg(&rig.dmac, 1, 0x03, 0x0580);
        assert!(halt.level());
        rig.machine.run_for(Time::from_usec(5));
        assert!(!halt.level());
        assert_ne!(rig.dmac.borrow().registers(1).map_or(0, |r| r.csr) & CSR_COC, 0);
    }

    #[test]
    fn halt_and_continue_keep_the_transfer_position() {
        let mut rig = rig();
        program(&rig.dmac, 2, 0x0100, 0x0200, 8);
        reg(&rig.dmac, 2, 0x02, 0x8000);
        reg(&rig.dmac, 2, 0x03, 0x0580);
        rig.machine.run_for(START_DELAY.saturating_add(Time::from_usec(3)));
        reg(&rig.dmac, 2, 0x03, 0x0520);
        let (mtc, mar) = rig.dmac.borrow().registers(2).map(|r| (r.mtc, r.mar)).unwrap_or_default();
        assert_eq!(mtc, 6);
        assert_eq!(rig.dmac.borrow().channel_state(2), ChannelState::Halted);
        rig.machine.run_for(Time::from_usec(50));
        assert_eq!(rig.dmac.borrow().registers(2).map(|r| (r.mtc, r.mar)), Some((mtc, mar)));
        reg(&rig.dmac, 2, 0x03, 0x0540);
        rig.machine.run_for(Time::from_usec(50));
        assert_eq!(rig.dmac.borrow().channel_state(2), ChannelState::Idle);
        assert_eq!(rig.dmac.borrow().registers(2).map(|r| r.mar), Some(0x0108));
    }

    #[test]
    fn unmapped_device_address_is_a_bus_error() {
        let mut rig = rig();
        program(&rig.dmac, 0, 0x0100, 0x80_0000, 4);
        reg(&rig.dmac, 0, 0x02, 0x8000);
        reg(&rig.dmac, 0, 0x03, 0x0588);
        rig.machine.run_for(START_DELAY.saturating_add(Time::from_usec(10)));
        let dmac = rig.dmac.borrow();
        let regs = dmac.registers(0).copied().unwrap_or_default();
        assert_eq!(regs.csr & (CSR_ERR | CSR_ACT), CSR_ERR);
        assert_eq!(ChannelErrorCode::from_u8(regs.cer), Some(ChannelErrorCode::BusDevice));
        assert_eq!(regs.mtc, 4);
        assert_eq!(dmac.irq_channel(), Some(0));
        assert_eq!(dmac.iack(), 0x0f);
    }

    #[test]
    fn array_chain_walks_every_entry() {
        let mut rig = rig();
        // two entries: 2 bytes from 0x0300, then 1 byte from 0x0400
        rig.ram.load(0x0500, &[0, 0, 0x03, 0x00, 0, 2, 0, 0, 0x04, 0x00, 0, 1]);
        rig.ram.load(0x0300, &[0xaa, 0xbb]);
        rig.ram.load(0x0400, &[0xcc]);
        program(&rig.dmac, 3, 0, 0x0600, 0);
        reg(&rig.dmac, 3, 0x0d, 2);
        reg(&rig.dmac, 3, 0x0e, 0);
        reg(&rig.dmac, 3, 0x0f, 0x0500);
        reg(&rig.dmac, 3, 0x02, 0x8008);
        reg(&rig.dmac, 3, 0x03, 0x0580);
        rig.machine.run_for(START_DELAY.saturating_add(Time::from_usec(20)));
        assert_eq!(rig.ram.to_vec()[0x0600..0x0603], [0xaa, 0xbb, 0xcc]);
        assert_eq!(rig.dmac.borrow().channel_state(3), ChannelState::Idle);
    }

    #[test]
    fn zero_count_without_chaining_is_a_count_error() {
        let rig = rig();
        program(&rig.dmac, 0, 0x0100, 0x0200, 0);
        reg(&rig.dmac, 0, 0x02, 0x8000);
        reg(&rig.dmac, 0, 0x03, 0x0080);
        let dmac = rig.dmac.borrow();
        assert_eq!(dmac.channel_state(0), ChannelState::Error);
        assert_eq!(dmac.registers(0).map(|r| r.cer), Some(0x0d));
    }
}
