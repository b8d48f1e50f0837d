//! Declarative address maps and construction of spaces from them.

use std::cell::RefCell;
use std::rc::Rc;

use crate::context::SharedContext;
use crate::fault::ConfigError;
use crate::memory::config::{AccessSide, Offset, SpaceConfig};
use crate::memory::handler::{
    AddressMapBank, MemoryBank, MemoryBlock, ReadFn, ReadHandler, SharedBusDevice, WriteFn,
    WriteHandler,
};
use crate::memory::space::AddressSpace;

/// What the read side of a map entry binds to.
#[derive(Clone)]
pub enum MapRead {
    /// Explicitly unmapped.
    Unmapped,
    /// Open bus without logging.
    Nop,
    /// RAM allocated at build time, shared with a `Ram` write side.
    Ram,
    /// Caller-supplied store (ROM image or shared RAM).
    Block(MemoryBlock),
    /// Memory bank.
    Bank(Rc<MemoryBank>),
    /// Device registers.
    Device(SharedBusDevice),
    /// Closure.
    Function(ReadFn),
    /// Banked view of another space.
    Submap(Rc<AddressMapBank>),
}

/// What the write side of a map entry binds to.
#[derive(Clone)]
pub enum MapWrite {
    /// Explicitly unmapped.
    Unmapped,
    /// Writes dropped without logging.
    Nop,
    /// RAM allocated at build time, shared with a `Ram` read side.
    Ram,
    /// Caller-supplied store.
    Block(MemoryBlock),
    /// Memory bank.
    Bank(Rc<MemoryBank>),
    /// Device registers.
    Device(SharedBusDevice),
    /// Closure.
    Function(WriteFn),
    /// Banked view of another space.
    Submap(Rc<AddressMapBank>),
}

/// One line of an address map: a range, its mirror mask and per-side targets.
#[derive(Clone)]
pub struct MapEntry {
    start: Offset,
    end: Offset,
    mirror: Offset,
    read: Option<MapRead>,
    write: Option<MapWrite>,
}

impl MapEntry {
    /// First address of the entry.
    #[must_use]
    pub const fn start(&self) -> Offset {
        self.start
    }

    /// Last address of the entry.
    #[must_use]
    pub const fn end(&self) -> Offset {
        self.end
    }

    /// Mirror mask of the entry.
    #[must_use]
    pub const fn mirror_mask(&self) -> Offset {
        self.mirror
    }

    /// Sets the mirror mask.
    pub fn mirror(&mut self, mirror: Offset) -> &mut Self {
        self.mirror = mirror;
        self
    }

    /// Read/write RAM.
    pub fn ram(&mut self) -> &mut Self {
        self.read = Some(MapRead::Ram);
        self.write = Some(MapWrite::Ram);
        self
    }

    /// Read-only contents; the write side is left alone.
    pub fn rom(&mut self, block: &MemoryBlock) -> &mut Self {
        self.read = Some(MapRead::Block(block.clone()));
        self
    }

    /// Write-only store; the read side is left alone.
    pub fn writeonly(&mut self, block: &MemoryBlock) -> &mut Self {
        self.write = Some(MapWrite::Block(block.clone()));
        self
    }

    /// Both sides on a caller-supplied store.
    pub fn share(&mut self, block: &MemoryBlock) -> &mut Self {
        self.read = Some(MapRead::Block(block.clone()));
        self.write = Some(MapWrite::Block(block.clone()));
        self
    }

    /// Both sides through a memory bank.
    pub fn bank(&mut self, bank: &Rc<MemoryBank>) -> &mut Self {
        self.read = Some(MapRead::Bank(Rc::clone(bank)));
        self.write = Some(MapWrite::Bank(Rc::clone(bank)));
        self
    }

    /// Read side through a memory bank.
    pub fn read_bank(&mut self, bank: &Rc<MemoryBank>) -> &mut Self {
        self.read = Some(MapRead::Bank(Rc::clone(bank)));
        self
    }

    /// Both sides on a device's registers.
    pub fn device(&mut self, device: &SharedBusDevice) -> &mut Self {
        self.read = Some(MapRead::Device(Rc::clone(device)));
        self.write = Some(MapWrite::Device(Rc::clone(device)));
        self
    }

    /// Read side on a closure.
    pub fn r(&mut self, handler: impl FnMut(Offset, u64) -> u64 + 'static) -> &mut Self {
        self.read = Some(MapRead::Function(Rc::new(RefCell::new(handler))));
        self
    }

    /// Write side on a closure.
    pub fn w(&mut self, handler: impl FnMut(Offset, u64, u64) + 'static) -> &mut Self {
        self.write = Some(MapWrite::Function(Rc::new(RefCell::new(handler))));
        self
    }

    /// Both sides through a banked view of another space.
    pub fn submap(&mut self, bank: &Rc<AddressMapBank>) -> &mut Self {
        self.read = Some(MapRead::Submap(Rc::clone(bank)));
        self.write = Some(MapWrite::Submap(Rc::clone(bank)));
        self
    }

    /// Silent open-bus reads.
    pub fn nopr(&mut self) -> &mut Self {
        self.read = Some(MapRead::Nop);
        self
    }

    /// Silently dropped writes.
    pub fn nopw(&mut self) -> &mut Self {
        self.write = Some(MapWrite::Nop);
        self
    }

    /// Silent on both sides.
    pub fn noprw(&mut self) -> &mut Self {
        self.nopr().nopw()
    }

    /// Unmapped on both sides, overriding nothing but claiming the range.
    pub fn unmaprw(&mut self) -> &mut Self {
        self.read = Some(MapRead::Unmapped);
        self.write = Some(MapWrite::Unmapped);
        self
    }
}

/// An ordered list of map entries, applied in order when a space is built.
#[derive(Clone, Default)]
pub struct AddressMap {
    entries: Vec<MapEntry>,
}

impl AddressMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new entry for `start..=end` and returns it for configuration.
    pub fn map(&mut self, start: Offset, end: Offset) -> &mut MapEntry {
        let index = self.entries.len();
        self.entries.push(MapEntry {
            start,
            end,
            mirror: 0,
            read: None,
            write: None,
        });
        &mut self.entries[index]
    }

    /// Entries in declaration order.
    #[must_use]
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }
}

impl AddressSpace {
    /// Builds a space from a declarative map.
    ///
    /// Every side of every entry is expanded through its mirror mask first; two entries that
    /// claim the same byte on the same side are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Overlap`] for conflicting entries, or any range error raised by an
    /// entry.
    pub fn from_map(
        config: SpaceConfig,
        ctx: SharedContext,
        map: &AddressMap,
    ) -> Result<Self, ConfigError> {
        let mut space = Self::new(config, ctx)?;
        check_overlaps(&space, map, AccessSide::Read)?;
        check_overlaps(&space, map, AccessSide::Write)?;
        for entry in map.entries() {
            space.apply(entry)?;
        }
        Ok(space)
    }

    fn apply(&mut self, entry: &MapEntry) -> Result<(), ConfigError> {
        let (start, end, mirror) = (entry.start, entry.end, entry.mirror);
        let wants_ram = matches!(entry.read, Some(MapRead::Ram))
            || matches!(entry.write, Some(MapWrite::Ram));
        let ram = if wants_ram {
            let (first, last, _) = self
                .expand(start, end, 0)?
                .first()
                .copied()
                .ok_or(ConfigError::InvertedRange {
                    start: u64::from(start),
                    end: u64::from(end),
                })?;
            Some(MemoryBlock::new(
                usize::try_from(last - first + 1).unwrap_or(usize::MAX),
            ))
        } else {
            None
        };
        if let Some(read) = &entry.read {
            match read {
                MapRead::Unmapped => self.unmap_read(start, end, mirror)?,
                MapRead::Nop => self.nop_read(start, end, mirror)?,
                MapRead::Ram => {
                    if let Some(block) = &ram {
                        self.install_rom(start, end, mirror, block)?;
                    }
                }
                MapRead::Block(block) => self.install_rom(start, end, mirror, block)?,
                MapRead::Bank(bank) => self.install_read_bank(start, end, mirror, bank)?,
                MapRead::Device(device) => self.install_read(
                    start,
                    end,
                    mirror,
                    ReadHandler::Device(Rc::clone(device)),
                )?,
                MapRead::Function(function) => self.install_read(
                    start,
                    end,
                    mirror,
                    ReadHandler::Function(Rc::clone(function)),
                )?,
                MapRead::Submap(bank) => self.install_read(
                    start,
                    end,
                    mirror,
                    ReadHandler::Submap(Rc::clone(bank)),
                )?,
            }
        }
        if let Some(write) = &entry.write {
            match write {
                MapWrite::Unmapped => self.unmap_write(start, end, mirror)?,
                MapWrite::Nop => self.nop_write(start, end, mirror)?,
                MapWrite::Ram => {
                    if let Some(block) = &ram {
                        self.install_writeonly(start, end, mirror, block)?;
                    }
                }
                MapWrite::Block(block) => self.install_writeonly(start, end, mirror, block)?,
                MapWrite::Bank(bank) => self.install_write_bank(start, end, mirror, bank)?,
                MapWrite::Device(device) => self.install_write(
                    start,
                    end,
                    mirror,
                    WriteHandler::Device(Rc::clone(device)),
                )?,
                MapWrite::Function(function) => self.install_write(
                    start,
                    end,
                    mirror,
                    WriteHandler::Function(Rc::clone(function)),
                )?,
                MapWrite::Submap(bank) => self.install_write(
                    start,
                    end,
                    mirror,
                    WriteHandler::Submap(Rc::clone(bank)),
                )?,
            }
        }
        Ok(())
    }
}

fn check_overlaps(space: &AddressSpace, map: &AddressMap, side: AccessSide) -> Result<(), ConfigError> {
    let mut claimed = Vec::new();
    for entry in map.entries() {
        let present = match side {
            AccessSide::Read => entry.read.is_some(),
            AccessSide::Write => entry.write.is_some(),
        };
        if !present {
            continue;
        }
        for (first, last, _) in space.expand(entry.start, entry.end, entry.mirror)? {
            claimed.push((first, last, entry.start, entry.end));
        }
    }
    claimed.sort_unstable_by_key(|&(first, ..)| first);
    for pair in claimed.windows(2) {
        let (earlier, later) = (pair[0], pair[1]);
        if later.0 <= earlier.1 {
            return Err(ConfigError::Overlap {
                side,
                first_start: u64::from(earlier.2),
                first_end: u64::from(earlier.3),
                second_start: u64::from(later.2),
                second_end: u64::from(later.3),
            });
        }
    }
    Ok(())
}
