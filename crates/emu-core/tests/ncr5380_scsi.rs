//! NCR 5380 selection and pseudo-DMA receive against a scripted target, with the HD63450
//! servicing DRQ.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use emu_core::dma::hd63450::ChannelState;
use emu_core::memory::{DataWidth, Endianness, MemoryBlock, SpaceConfig};
use emu_core::scsi::bus::{
    ScsiPort, SharedScsiBus, S_ACK, S_ALL, S_BSY, S_INP, S_PHASE_MASK, S_REQ, S_SEL,
};
use emu_core::scsi::ncr5380::{
    reg, BAS_END_OF_DMA, IC_BSY, IC_DBUS, IC_SEL, MODE_ARBITRATE, MODE_DMA, ST_BSY,
};
use emu_core::scsi::Handshake;
use emu_core::{
    drive_line, AddressSpace, Hd63450, Hd63450Config, Machine, Ncr5380, Ncr5380Config, ScsiBus,
    Time, TimerDevice, TimerId,
};
use log as _;
use proptest as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

const TARGET_ID: u8 = 0;
const HOST_ID: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Free,
    Selected,
    Offering,
    Acked,
    Done,
}

/// A disk that answers selection and then sends its payload in the data-in phase.
struct Target {
    bus: SharedScsiBus,
    port: ScsiPort,
    timer: TimerId,
    payload: VecDeque<u8>,
    state: TargetState,
}

impl Target {
    fn offer(&mut self) {
        let mut bus = self.bus.borrow_mut();
        if let Some(byte) = self.payload.pop_front() {
            bus.data_w(self.port, byte);
            bus.ctrl_w(self.port, S_REQ, S_REQ);
            self.state = TargetState::Offering;
        } else {
            bus.data_w(self.port, 0);
            bus.ctrl_w(self.port, 0, S_ALL);
            self.state = TargetState::Done;
        }
    }
}

impl TimerDevice for Target {
    fn timer_ids(&self) -> Vec<TimerId> {
        vec![self.timer]
    }

    fn device_timer(&mut self, _id: TimerId, _param: u32) {
        let (ctrl, data) = {
            let bus = self.bus.borrow();
            (bus.ctrl_r(), bus.data_r())
        };
        match self.state {
            TargetState::Free => {
                if ctrl & S_SEL != 0 && ctrl & S_BSY == 0 && data & (1 << TARGET_ID) != 0 {
                    self.bus.borrow_mut().ctrl_w(self.port, S_BSY, S_BSY);
                    self.state = TargetState::Selected;
                }
            }
            TargetState::Selected => {
                if ctrl & S_SEL == 0 {
                    self.bus.borrow_mut().ctrl_w(self.port, S_INP, S_PHASE_MASK);
                    self.offer();
                }
            }
            TargetState::Offering => {
                if ctrl & S_ACK != 0 {
                    self.bus.borrow_mut().ctrl_w(self.port, 0, S_REQ);
                    self.state = TargetState::Acked;
                }
            }
            TargetState::Acked => {
                if ctrl & S_ACK == 0 {
                    self.offer();
                }
            }
            TargetState::Done => {}
        }
    }
}

struct Rig {
    machine: Machine,
    bus: SharedScsiBus,
    ram: MemoryBlock,
    ncr: Rc<RefCell<Ncr5380>>,
    dmac: Rc<RefCell<Hd63450>>,
    ends: Rc<RefCell<Vec<usize>>>,
}

fn rig(payload: &[u8]) -> Rig {
    let mut machine = Machine::new();
    let bus = ScsiBus::shared(machine.scheduler());

    let config = Ncr5380Config { scsi_id: HOST_ID, ..Ncr5380Config::default() };
    let ncr = Rc::new(RefCell::new(Ncr5380::new(config, &bus, machine.scheduler())));
    machine.add_timer_device(ncr.clone());

    let timer = machine.scheduler().borrow_mut().allocate("target");
    let port = bus.borrow_mut().attach("target", Some((timer, 0)));
    bus.borrow_mut().ctrl_wait(port, S_ALL, S_ALL);
    let target = Target {
        bus: bus.clone(),
        port,
        timer,
        payload: payload.iter().copied().collect(),
        state: TargetState::Free,
    };
    machine.add_timer_device(Rc::new(RefCell::new(target)));

    let config = SpaceConfig::new("program", DataWidth::Bits16, 24, Endianness::Big);
    let mut space = AddressSpace::new(config, machine.context().clone()).expect("space");
    let ram = space.install_ram(0x0000, 0xffff, 0).expect("ram");
    let dmac = Hd63450::new(Hd63450Config::default(), space.into_shared(), machine.scheduler());
    let dmac = Rc::new(RefCell::new(dmac));
    machine.add_timer_device(dmac.clone());

    let ends = Rc::new(RefCell::new(Vec::new()));
    {
        let mut dmac = dmac.borrow_mut();
        let drq = dmac.drq_line(0).expect("channel 0");
        ncr.borrow_mut().set_drq_callback(drive_line(drq));
        let port = ncr.clone();
        dmac.set_dma_read(0, Box::new(move |_| Some(port.borrow_mut().dma_r())));
        let record = ends.clone();
        dmac.set_dma_end_callback(Box::new(move |channel| record.borrow_mut().push(channel)));
    }

    Rig { machine, bus, ram, ncr, dmac, ends }
}

fn ncr_w(rig: &Rig, offset: u32, data: u8) {
    rig.ncr.borrow_mut().write(offset, data);
}

fn dmac_w(rig: &Rig, reg: u32, value: u16) {
    rig.dmac.borrow_mut().write(reg, value, 0xffff);
}

/// Arbitrates, selects the target and leaves the bus in the target's hands.
fn select(rig: &mut Rig) {
    ncr_w(rig, reg::DATA, 1 << HOST_ID);
    ncr_w(rig, reg::MODE, MODE_ARBITRATE);
    rig.machine.run_for(Time::from_usec(5));

    ncr_w(rig, reg::DATA, (1 << HOST_ID) | (1 << TARGET_ID));
    ncr_w(rig, reg::INITIATOR_COMMAND, IC_DBUS | IC_BSY | IC_SEL);
    ncr_w(rig, reg::MODE, 0);
    ncr_w(rig, reg::INITIATOR_COMMAND, IC_DBUS | IC_SEL);
    rig.machine.run_for(Time::from_usec(5));
    assert_ne!(rig.ncr.borrow_mut().read(reg::STATUS) & ST_BSY, 0, "target answered");

    ncr_w(rig, reg::INITIATOR_COMMAND, 0);
    rig.machine.run_for(Time::from_usec(1));
}

/// Device-to-memory, byte-sized, DRQ-paced transfer of `count` bytes into 0x1000.
fn start_channel(rig: &Rig, count: u16) {
    dmac_w(rig, 0x05, count);
    dmac_w(rig, 0x06, 0);
    dmac_w(rig, 0x07, 0x1000);
    dmac_w(rig, 0x02, 0x8082);
    dmac_w(rig, 0x03, 0x0580);
}

fn start_receive(rig: &Rig) {
    ncr_w(rig, reg::TARGET_COMMAND, 0x01);
    ncr_w(rig, reg::MODE, MODE_DMA);
    ncr_w(rig, reg::RESET_PARITY, 0);
}

#[test]
fn selected_target_streams_a_block_into_memory() {
    let payload = [0xde, 0xad, 0xbe, 0xef];
    let mut rig = rig(&payload);
    select(&mut rig);
    start_channel(&rig, 4);
    start_receive(&rig);
    rig.machine.run_for(Time::from_usec(200));

    assert_eq!(rig.ram.to_vec()[0x1000..0x1004], payload);
    assert_eq!(*rig.ends.borrow(), vec![0]);
    assert_eq!(rig.dmac.borrow().channel_state(0), ChannelState::Idle);
    let mut ncr = rig.ncr.borrow_mut();
    assert_ne!(ncr.read(reg::BUS_AND_STATUS) & BAS_END_OF_DMA, 0);
    assert_eq!(ncr.read(reg::MODE) & MODE_DMA, 0);
    assert_eq!(ncr.handshake(), Handshake::Idle);
    assert!(!ncr.drq());
    assert_eq!(rig.bus.borrow().ctrl_r(), 0, "bus free");
}

#[rstest]
#[case::one_byte(&[0x5a])]
#[case::three_bytes(&[0x01, 0x02, 0x03])]
fn bus_free_ends_a_short_transfer(#[case] payload: &[u8]) {
    let mut rig = rig(payload);
    select(&mut rig);
    start_channel(&rig, 8);
    start_receive(&rig);
    rig.machine.run_for(Time::from_usec(200));

    assert_eq!(rig.ram.to_vec()[0x1000..0x1000 + payload.len()], *payload);
    assert!(rig.ends.borrow().is_empty(), "channel did not reach its count");
    let dmac = rig.dmac.borrow();
    assert_eq!(dmac.channel_state(0), ChannelState::Active);
    let left = 8 - u16::try_from(payload.len()).expect("short payload");
    assert_eq!(dmac.registers(0).map(|r| r.mtc), Some(left));
    let mut ncr = rig.ncr.borrow_mut();
    assert_ne!(ncr.read(reg::BUS_AND_STATUS) & BAS_END_OF_DMA, 0);
    assert_eq!(ncr.handshake(), Handshake::Idle);
}

#[test]
fn unanswered_selection_leaves_bsy_low() {
    let mut rig = rig(&[]);
    ncr_w(&rig, reg::DATA, 1 << HOST_ID);
    ncr_w(&rig, reg::MODE, MODE_ARBITRATE);
    rig.machine.run_for(Time::from_usec(5));
    // nobody answers id 3
    ncr_w(&rig, reg::DATA, (1 << HOST_ID) | (1 << 3));
    ncr_w(&rig, reg::INITIATOR_COMMAND, IC_DBUS | IC_BSY | IC_SEL);
    ncr_w(&rig, reg::MODE, 0);
    ncr_w(&rig, reg::INITIATOR_COMMAND, IC_DBUS | IC_SEL);
    rig.machine.run_for(Time::from_usec(250));
    let status = rig.ncr.borrow_mut().read(reg::STATUS);
    assert_eq!(status & ST_BSY, 0);
    assert_eq!(rig.bus.borrow().ctrl_r(), S_SEL);
}
