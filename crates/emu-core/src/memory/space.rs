//! Address spaces: two dispatch tables plus the access paths that walk them.

#![allow(clippy::cast_possible_truncation)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::context::SharedContext;
use crate::diag::SpaceDiagnostics;
use crate::fault::ConfigError;
use crate::memory::config::{AccessSide, Offset, SpaceConfig};
use crate::memory::dispatch::DispatchTable;
use crate::memory::handler::{
    lane_shift, AddressMapBank, MemoryBank, MemoryBlock, ReadFn, ReadHandler, SharedBusDevice, Tap,
    TapFn, WriteFn, WriteHandler,
};

/// Shared handle to an address space.
pub type SharedSpace = Rc<RefCell<AddressSpace>>;

/// Upper bound on the copies a mirror mask may expand to.
pub const MAX_MIRROR_COPIES: u64 = 1 << 16;

const LOG_TARGET: &str = "emu_core::memory";

/// A RAM/ROM window the access cache can serve without dispatch.
#[derive(Debug, Clone)]
pub struct CacheWindow {
    /// First byte of the window.
    pub start: u64,
    /// Last byte of the window.
    pub end: u64,
    /// Backing store.
    pub block: MemoryBlock,
    /// Block byte at `start`.
    pub base: u64,
}

/// One bus as seen by its devices.
#[derive(Debug)]
pub struct AddressSpace {
    config: SpaceConfig,
    ctx: SharedContext,
    read: DispatchTable<ReadHandler>,
    write: DispatchTable<WriteHandler>,
    generation: Rc<Cell<u64>>,
    diagnostics: Cell<SpaceDiagnostics>,
}

impl AddressSpace {
    /// Builds a space whose whole range is unmapped on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedGeometry`] for an invalid configuration.
    pub fn new(config: SpaceConfig, ctx: SharedContext) -> Result<Self, ConfigError> {
        config.validate()?;
        let limit = config.byte_limit();
        let unit_log2 = config.data_width().log2_bytes();
        Ok(Self {
            read: DispatchTable::new(limit, unit_log2, ReadHandler::Unmapped),
            write: DispatchTable::new(limit, unit_log2, WriteHandler::Unmapped),
            config,
            ctx,
            generation: Rc::new(Cell::new(0)),
            diagnostics: Cell::new(SpaceDiagnostics::default()),
        })
    }

    /// Wraps the space for sharing between devices.
    #[must_use]
    pub fn into_shared(self) -> SharedSpace {
        Rc::new(RefCell::new(self))
    }

    /// Space configuration.
    #[must_use]
    pub const fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Machine context the space reports through.
    #[must_use]
    pub const fn context(&self) -> &SharedContext {
        &self.ctx
    }

    /// Space name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Read-side dispatch table.
    #[must_use]
    pub const fn read_table(&self) -> &DispatchTable<ReadHandler> {
        &self.read
    }

    /// Write-side dispatch table.
    #[must_use]
    pub const fn write_table(&self) -> &DispatchTable<WriteHandler> {
        &self.write
    }

    /// Checks that both sides tile the whole byte range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CoverageGap`] for the first uncovered byte.
    pub fn verify_coverage(&self) -> Result<(), ConfigError> {
        self.read.verify_coverage(AccessSide::Read)?;
        self.write.verify_coverage(AccessSide::Write)
    }

    /// Counter bumped by every install; caches compare it to revalidate.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    pub(crate) fn generation_cell(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.generation)
    }

    /// Unmapped-access counters.
    #[must_use]
    pub fn diagnostics(&self) -> SpaceDiagnostics {
        self.diagnostics.get()
    }

    /// Zeroes the unmapped-access counters.
    pub fn reset_diagnostics(&self) {
        self.diagnostics.set(SpaceDiagnostics::default());
    }

    /// Returns `true` when an access to `address` on `side` would reach the unmapped handler.
    #[must_use]
    pub fn is_unmapped(&self, side: AccessSide, address: Offset) -> bool {
        let byte = self.config.address_to_byte(u64::from(address) & self.config.addr_mask());
        match side {
            AccessSide::Read => self.read.resolve(byte).0.is_unmapped(),
            AccessSide::Write => self.write.resolve(byte).0.is_unmapped(),
        }
    }

    // ----------------------------------------------------------------------------------------
    // Installation

    /// Allocates RAM for `start..=end` and binds both sides to it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn install_ram(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
    ) -> Result<MemoryBlock, ConfigError> {
        let len = self.range_bytes(start, end)?;
        let block = MemoryBlock::new(usize::try_from(len).unwrap_or(usize::MAX));
        self.install_ram_block(start, end, mirror, &block, 0)?;
        Ok(block)
    }

    /// Binds both sides of `start..=end` to `block`, starting at block byte `base`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid or the block is too short.
    pub fn install_ram_block(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        block: &MemoryBlock,
        base: u64,
    ) -> Result<(), ConfigError> {
        self.check_block(start, end, block, base)?;
        self.install_read(start, end, mirror, ReadHandler::Memory {
            block: block.clone(),
            base,
        })?;
        self.install_write(start, end, mirror, WriteHandler::Memory {
            block: block.clone(),
            base,
        })
    }

    /// Binds the read side of `start..=end` to `block`; writes keep their current handler.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid or the block is too short.
    pub fn install_rom(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        block: &MemoryBlock,
    ) -> Result<(), ConfigError> {
        self.check_block(start, end, block, 0)?;
        self.install_read(start, end, mirror, ReadHandler::Memory {
            block: block.clone(),
            base: 0,
        })
    }

    /// Binds the write side of `start..=end` to `block`; reads keep their current handler.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid or the block is too short.
    pub fn install_writeonly(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        block: &MemoryBlock,
    ) -> Result<(), ConfigError> {
        self.check_block(start, end, block, 0)?;
        self.install_write(start, end, mirror, WriteHandler::Memory {
            block: block.clone(),
            base: 0,
        })
    }

    /// Binds the read side of a range to a memory bank.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid or wider than the bank window.
    pub fn install_read_bank(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        bank: &Rc<MemoryBank>,
    ) -> Result<(), ConfigError> {
        self.check_bank(start, end, bank)?;
        self.install_read(start, end, mirror, ReadHandler::Bank(Rc::clone(bank)))
    }

    /// Binds the write side of a range to a memory bank.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid or wider than the bank window.
    pub fn install_write_bank(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        bank: &Rc<MemoryBank>,
    ) -> Result<(), ConfigError> {
        self.check_bank(start, end, bank)?;
        self.install_write(start, end, mirror, WriteHandler::Bank(Rc::clone(bank)))
    }

    /// Binds both sides of a range to a memory bank.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid or wider than the bank window.
    pub fn install_readwrite_bank(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        bank: &Rc<MemoryBank>,
    ) -> Result<(), ConfigError> {
        self.install_read_bank(start, end, mirror, bank)?;
        self.install_write_bank(start, end, mirror, bank)
    }

    /// Binds both sides of a range to a device's register block.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn install_device(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        device: &SharedBusDevice,
    ) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Device(Rc::clone(device)))?;
        self.install_write(start, end, mirror, WriteHandler::Device(Rc::clone(device)))
    }

    /// Binds the read side of a range to a closure.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn install_read_handler(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        handler: impl FnMut(Offset, u64) -> u64 + 'static,
    ) -> Result<(), ConfigError> {
        let handler: ReadFn = Rc::new(RefCell::new(handler));
        self.install_read(start, end, mirror, ReadHandler::Function(handler))
    }

    /// Binds the write side of a range to a closure.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn install_write_handler(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        handler: impl FnMut(Offset, u64, u64) + 'static,
    ) -> Result<(), ConfigError> {
        let handler: WriteFn = Rc::new(RefCell::new(handler));
        self.install_write(start, end, mirror, WriteHandler::Function(handler))
    }

    /// Binds both sides of a range to a pair of closures.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn install_readwrite_handler(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        read: impl FnMut(Offset, u64) -> u64 + 'static,
        write: impl FnMut(Offset, u64, u64) + 'static,
    ) -> Result<(), ConfigError> {
        self.install_read_handler(start, end, mirror, read)?;
        self.install_write_handler(start, end, mirror, write)
    }

    /// Binds both sides of a range to a banked view of another space.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WidthMismatch`] when the inner space has another bus width or byte
    /// order, or a range error.
    pub fn install_submap(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        bank: &Rc<AddressMapBank>,
    ) -> Result<(), ConfigError> {
        let Ok(inner) = bank.space().try_borrow() else {
            return Err(ConfigError::IncompatibleSpace {
                device: bank.tag().to_owned(),
                space: self.name().to_owned(),
                reason: "a space cannot be banked into itself",
            });
        };
        let expected = self.config.data_width().bits();
        let found = inner.config.data_width().bits();
        if expected != found || inner.config.endianness() != self.config.endianness() {
            return Err(ConfigError::WidthMismatch { expected, found });
        }
        drop(inner);
        self.install_read(start, end, mirror, ReadHandler::Submap(Rc::clone(bank)))?;
        self.install_write(start, end, mirror, WriteHandler::Submap(Rc::clone(bank)))
    }

    /// Returns the read side of a range to the unmapped handler.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn unmap_read(&mut self, start: Offset, end: Offset, mirror: Offset) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Unmapped)
    }

    /// Returns the write side of a range to the unmapped handler.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn unmap_write(&mut self, start: Offset, end: Offset, mirror: Offset) -> Result<(), ConfigError> {
        self.install_write(start, end, mirror, WriteHandler::Unmapped)
    }

    /// Returns both sides of a range to the unmapped handler.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn unmap_readwrite(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
    ) -> Result<(), ConfigError> {
        self.unmap_read(start, end, mirror)?;
        self.unmap_write(start, end, mirror)
    }

    /// Masks the read side of a range: open-bus reads without log records.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn nop_read(&mut self, start: Offset, end: Offset, mirror: Offset) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Nop)
    }

    /// Masks the write side of a range: writes are dropped without log records.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn nop_write(&mut self, start: Offset, end: Offset, mirror: Offset) -> Result<(), ConfigError> {
        self.install_write(start, end, mirror, WriteHandler::Nop)
    }

    /// Masks both sides of a range.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range or mirror is invalid.
    pub fn nop_readwrite(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
    ) -> Result<(), ConfigError> {
        self.nop_read(start, end, mirror)?;
        self.nop_write(start, end, mirror)
    }

    /// Layers a named observer in front of every read handler in `start..=end`.
    ///
    /// The tap receives the access address, the data read (which it may rewrite) and the mask.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid.
    pub fn install_read_tap(
        &mut self,
        start: Offset,
        end: Offset,
        name: &str,
        tap: impl FnMut(Offset, &mut u64, u64) + 'static,
    ) -> Result<(), ConfigError> {
        let tap: TapFn = Rc::new(RefCell::new(tap));
        self.tap_read(start, end, name, &tap)
    }

    /// Layers a named observer in front of every write handler in `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid.
    pub fn install_write_tap(
        &mut self,
        start: Offset,
        end: Offset,
        name: &str,
        tap: impl FnMut(Offset, &mut u64, u64) + 'static,
    ) -> Result<(), ConfigError> {
        let tap: TapFn = Rc::new(RefCell::new(tap));
        self.tap_write(start, end, name, &tap)
    }

    /// Layers one named observer in front of both sides of `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the range is invalid.
    pub fn install_readwrite_tap(
        &mut self,
        start: Offset,
        end: Offset,
        name: &str,
        tap: impl FnMut(Offset, &mut u64, u64) + 'static,
    ) -> Result<(), ConfigError> {
        let tap: TapFn = Rc::new(RefCell::new(tap));
        self.tap_read(start, end, name, &tap)?;
        self.tap_write(start, end, name, &tap)
    }

    /// Removes every tap called `name`, restoring the handlers beneath it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTap`] when no such tap is installed.
    pub fn remove_tap(&mut self, name: &str) -> Result<(), ConfigError> {
        let reads = self.read.rewrite_all(|handler| handler.without_tap(name));
        let writes = self.write.rewrite_all(|handler| handler.without_tap(name));
        if reads + writes == 0 {
            return Err(ConfigError::UnknownTap {
                name: name.to_owned(),
            });
        }
        self.bump_generation();
        Ok(())
    }

    fn tap_read(&mut self, start: Offset, end: Offset, name: &str, tap: &TapFn) -> Result<(), ConfigError> {
        let ranges = self.expand(start, end, 0)?;
        for (first, last, _) in ranges {
            self.read.map_range(first, last, |next| {
                ReadHandler::Tap(Rc::new(Tap {
                    name: name.to_owned(),
                    tap: Rc::clone(tap),
                    next: next.clone(),
                }))
            });
        }
        self.bump_generation();
        Ok(())
    }

    fn tap_write(&mut self, start: Offset, end: Offset, name: &str, tap: &TapFn) -> Result<(), ConfigError> {
        let ranges = self.expand(start, end, 0)?;
        for (first, last, _) in ranges {
            self.write.map_range(first, last, |next| {
                WriteHandler::Tap(Rc::new(Tap {
                    name: name.to_owned(),
                    tap: Rc::clone(tap),
                    next: next.clone(),
                }))
            });
        }
        self.bump_generation();
        Ok(())
    }

    pub(crate) fn install_read(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        handler: ReadHandler,
    ) -> Result<(), ConfigError> {
        let ranges = self.expand(start, end, mirror)?;
        self.read.install_ranges(&ranges, &handler);
        self.bump_generation();
        log::trace!(
            target: LOG_TARGET,
            "{}: read {}-{} mirror {} -> {}",
            self.name(),
            self.config.format_address(u64::from(start)),
            self.config.format_address(u64::from(end)),
            self.config.format_address(u64::from(mirror)),
            handler.kind()
        );
        Ok(())
    }

    pub(crate) fn install_write(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        handler: WriteHandler,
    ) -> Result<(), ConfigError> {
        let ranges = self.expand(start, end, mirror)?;
        self.write.install_ranges(&ranges, &handler);
        self.bump_generation();
        log::trace!(
            target: LOG_TARGET,
            "{}: write {}-{} mirror {} -> {}",
            self.name(),
            self.config.format_address(u64::from(start)),
            self.config.format_address(u64::from(end)),
            self.config.format_address(u64::from(mirror)),
            handler.kind()
        );
        Ok(())
    }

    fn bump_generation(&self) {
        self.generation.set(self.generation.get().wrapping_add(1));
    }

    /// Validates a range and mirror and expands them into byte ranges `(start, end, origin)`.
    pub(crate) fn expand(
        &self,
        start: Offset,
        end: Offset,
        mirror: Offset,
    ) -> Result<Vec<(u64, u64, u64)>, ConfigError> {
        let (start, end, mirror) = (u64::from(start), u64::from(end), u64::from(mirror));
        if end < start {
            return Err(ConfigError::InvertedRange { start, end });
        }
        let limit = self.config.addr_mask();
        if (end | mirror) > limit {
            return Err(ConfigError::RangeOutOfSpace {
                start,
                end: end | mirror,
                limit,
            });
        }
        if (start | end) & mirror != 0 {
            return Err(ConfigError::MirrorOverlapsRange { start, end, mirror });
        }
        let copies = 1u64 << mirror.count_ones();
        if copies > MAX_MIRROR_COPIES {
            return Err(ConfigError::MirrorTooLarge { mirror, copies });
        }
        let unit = u64::from(self.config.data_width().bytes());
        let first = self.config.address_to_byte(start);
        let last = self.config.address_to_byte_end(end);
        if first % unit != 0 || (last + 1) % unit != 0 {
            return Err(ConfigError::Misaligned {
                start,
                end,
                unit_bytes: self.config.data_width().bytes(),
            });
        }
        let mut ranges = Vec::with_capacity(copies as usize);
        let mut bits = 0u64;
        loop {
            let copy_first = self.config.address_to_byte(start | bits);
            let copy_last = self.config.address_to_byte_end(end | bits);
            ranges.push((copy_first, copy_last, copy_first));
            if bits == mirror {
                break;
            }
            bits = bits.wrapping_sub(mirror) & mirror;
        }
        Ok(ranges)
    }

    fn range_bytes(&self, start: Offset, end: Offset) -> Result<u64, ConfigError> {
        let (first, last, _) = self
            .expand(start, end, 0)?
            .first()
            .copied()
            .ok_or(ConfigError::InvertedRange {
                start: u64::from(start),
                end: u64::from(end),
            })?;
        Ok(last - first + 1)
    }

    fn check_block(
        &self,
        start: Offset,
        end: Offset,
        block: &MemoryBlock,
        base: u64,
    ) -> Result<(), ConfigError> {
        let needed = base + self.range_bytes(start, end)?;
        let available = block.len() as u64;
        if available < needed {
            return Err(ConfigError::BlockTooSmall { needed, available });
        }
        Ok(())
    }

    fn check_bank(&self, start: Offset, end: Offset, bank: &MemoryBank) -> Result<(), ConfigError> {
        let needed = self.range_bytes(start, end)?;
        if bank.window() < needed {
            return Err(ConfigError::BlockTooSmall {
                needed,
                available: bank.window(),
            });
        }
        Ok(())
    }

    // ----------------------------------------------------------------------------------------
    // Native-unit dispatch

    /// Reads the native unit at byte offset `byte` (unit aligned).
    pub(crate) fn read_unit(&self, byte: u64, mem_mask: u64) -> u64 {
        let byte = byte & self.read.limit();
        let (handler, origin) = self.read.resolve(byte);
        self.dispatch_read(handler, origin, byte, mem_mask)
    }

    /// Writes the native unit at byte offset `byte` (unit aligned).
    pub(crate) fn write_unit(&self, byte: u64, data: u64, mem_mask: u64) {
        let byte = byte & self.write.limit();
        let (handler, origin) = self.write.resolve(byte);
        self.dispatch_write(handler, origin, byte, data, mem_mask);
    }

    fn unit_offset(&self, origin: u64, byte: u64) -> Offset {
        ((byte - origin) >> self.config.data_width().log2_bytes()) as Offset
    }

    fn dispatch_read(&self, handler: &ReadHandler, origin: u64, byte: u64, mem_mask: u64) -> u64 {
        let width = self.config.data_width();
        let endianness = self.config.endianness();
        match handler {
            ReadHandler::Unmapped => {
                self.note_unmapped_read(byte, mem_mask);
                self.config.unmap_value()
            }
            ReadHandler::Nop => self.config.unmap_value(),
            ReadHandler::Memory { block, base } => {
                block.read_unit(base + (byte - origin), width, endianness)
            }
            ReadHandler::Bank(bank) => bank
                .read_unit(byte - origin, width, endianness)
                .unwrap_or_else(|| self.config.unmap_value()),
            ReadHandler::Device(device) => {
                let offset = self.unit_offset(origin, byte);
                let Ok(mut device) = device.try_borrow_mut() else {
                    log::error!(
                        target: LOG_TARGET,
                        "{}: {} read from {} re-entered a busy device",
                        self.ctx.describe(),
                        self.name(),
                        self.config.format_address(self.config.byte_to_address(byte))
                    );
                    return self.config.unmap_value();
                };
                if self.ctx.side_effects_disabled() {
                    device.peek(offset, mem_mask)
                } else {
                    device.read(offset, mem_mask)
                }
            }
            ReadHandler::Function(function) => {
                let offset = self.unit_offset(origin, byte);
                function
                    .try_borrow_mut()
                    .map_or_else(|_| self.config.unmap_value(), |mut f| (&mut *f)(offset, mem_mask))
            }
            ReadHandler::Submap(bank) => bank.read_unit(byte - origin, mem_mask),
            ReadHandler::Tap(tap) => {
                let mut data = self.dispatch_read(&tap.next, origin, byte, mem_mask);
                if !self.ctx.side_effects_disabled() {
                    if let Ok(mut observer) = tap.tap.try_borrow_mut() {
                        let address = self.config.byte_to_address(byte) as Offset;
                        (&mut *observer)(address, &mut data, mem_mask);
                    }
                }
                data
            }
        }
    }

    fn dispatch_write(
        &self,
        handler: &WriteHandler,
        origin: u64,
        byte: u64,
        data: u64,
        mem_mask: u64,
    ) {
        let width = self.config.data_width();
        let endianness = self.config.endianness();
        match handler {
            WriteHandler::Unmapped => self.note_unmapped_write(byte, data, mem_mask),
            WriteHandler::Nop => {}
            WriteHandler::Memory { block, base } => {
                block.write_unit(base + (byte - origin), data, mem_mask, width, endianness);
            }
            WriteHandler::Bank(bank) => {
                bank.write_unit(byte - origin, data, mem_mask, width, endianness);
            }
            WriteHandler::Device(device) => {
                let offset = self.unit_offset(origin, byte);
                match device.try_borrow_mut() {
                    Ok(mut device) => device.write(offset, data, mem_mask),
                    Err(_) => log::error!(
                        target: LOG_TARGET,
                        "{}: {} write to {} re-entered a busy device",
                        self.ctx.describe(),
                        self.name(),
                        self.config.format_address(self.config.byte_to_address(byte))
                    ),
                }
            }
            WriteHandler::Function(function) => {
                let offset = self.unit_offset(origin, byte);
                if let Ok(mut f) = function.try_borrow_mut() {
                    (&mut *f)(offset, data, mem_mask);
                }
            }
            WriteHandler::Submap(bank) => bank.write_unit(byte - origin, data, mem_mask),
            WriteHandler::Tap(tap) => {
                let mut data = data;
                if let Ok(mut observer) = tap.tap.try_borrow_mut() {
                    let address = self.config.byte_to_address(byte) as Offset;
                    (&mut *observer)(address, &mut data, mem_mask);
                }
                self.dispatch_write(&tap.next, origin, byte, data, mem_mask);
            }
        }
    }

    fn note_unmapped_read(&self, byte: u64, mem_mask: u64) {
        if self.ctx.side_effects_disabled() {
            return;
        }
        self.diagnostics.set(self.diagnostics.get().with_unmapped_read());
        if self.config.log_unmap() {
            log::warn!(
                target: LOG_TARGET,
                "{}: unmapped {} memory read from {} & {}",
                self.ctx.describe(),
                self.name(),
                self.config.format_address(self.config.byte_to_address(byte)),
                self.config.format_data(mem_mask)
            );
        }
    }

    fn note_unmapped_write(&self, byte: u64, data: u64, mem_mask: u64) {
        if self.ctx.side_effects_disabled() {
            return;
        }
        self.diagnostics.set(self.diagnostics.get().with_unmapped_write());
        if self.config.log_unmap() {
            log::warn!(
                target: LOG_TARGET,
                "{}: unmapped {} memory write to {} = {} & {}",
                self.ctx.describe(),
                self.name(),
                self.config.format_address(self.config.byte_to_address(byte)),
                self.config.format_data(data),
                self.config.format_data(mem_mask)
            );
        }
    }

    /// Resolves the RAM/ROM window holding `byte`, if the read side there is plain memory.
    #[must_use]
    pub fn cache_window(&self, byte: u64) -> Option<CacheWindow> {
        let entry = self.read.entry_at(byte & self.read.limit());
        match &entry.handler {
            ReadHandler::Memory { block, base } => Some(CacheWindow {
                start: entry.start,
                end: entry.end,
                block: block.clone(),
                base: base + (entry.start - entry.origin),
            }),
            _ => None,
        }
    }

    // ----------------------------------------------------------------------------------------
    // Sized accesses

    /// Walks the native units touched by a `bytes`-wide access at `address`, calling `unit` with
    /// `(unit byte, unit lane mask, [(value shift, unit shift)])` for each one that has an
    /// enabled lane.
    fn for_each_unit(
        &self,
        address: Offset,
        bytes: u32,
        mem_mask: u64,
        mut unit: impl FnMut(u64, u64, &[(u32, u32)]),
    ) {
        let endianness = self.config.endianness();
        let unit_bytes = u64::from(self.config.data_width().bytes());
        let limit = self.read.limit();
        let first = self.config.address_to_byte(u64::from(address) & self.config.addr_mask());
        let last = first + u64::from(bytes) - 1;
        let mut base = first & !(unit_bytes - 1);
        let mut lanes = [(0u32, 0u32); 8];
        while base <= last {
            let lo = base.max(first);
            let hi = (base + unit_bytes - 1).min(last);
            let mut unit_mask = 0u64;
            let mut count = 0;
            for byte in lo..=hi {
                let value_shift = lane_shift((byte - first) as usize, bytes as usize, endianness);
                let unit_shift = lane_shift((byte - base) as usize, unit_bytes as usize, endianness);
                let lane = (mem_mask >> value_shift) & 0xff;
                if lane != 0 {
                    unit_mask |= lane << unit_shift;
                    lanes[count] = (value_shift, unit_shift);
                    count += 1;
                }
            }
            if unit_mask != 0 {
                unit(base & limit, unit_mask, &lanes[..count]);
            }
            base += unit_bytes;
        }
    }

    fn read_sized(&self, address: Offset, bytes: u32, mem_mask: u64) -> u64 {
        let width = self.config.data_width();
        if bytes == width.bytes() {
            let byte = self.config.address_to_byte(u64::from(address) & self.config.addr_mask());
            if byte % u64::from(bytes) == 0 {
                return self.read_unit(byte, mem_mask) & mem_mask;
            }
        }
        let mut value = 0u64;
        self.for_each_unit(address, bytes, mem_mask, |unit, unit_mask, lanes| {
            let data = self.read_unit(unit, unit_mask);
            for &(value_shift, unit_shift) in lanes {
                value |= ((data >> unit_shift) & 0xff) << value_shift;
            }
        });
        value & mem_mask
    }

    fn write_sized(&self, address: Offset, bytes: u32, data: u64, mem_mask: u64) {
        let width = self.config.data_width();
        if bytes == width.bytes() {
            let byte = self.config.address_to_byte(u64::from(address) & self.config.addr_mask());
            if byte % u64::from(bytes) == 0 {
                self.write_unit(byte, data, mem_mask);
                return;
            }
        }
        self.for_each_unit(address, bytes, mem_mask, |unit, unit_mask, lanes| {
            let mut unit_data = 0u64;
            for &(value_shift, unit_shift) in lanes {
                unit_data |= ((data >> value_shift) & 0xff) << unit_shift;
            }
            self.write_unit(unit, unit_data, unit_mask);
        });
    }

    /// Reads one byte.
    #[must_use]
    pub fn read_byte(&self, address: Offset) -> u8 {
        self.read_sized(address, 1, 0xff) as u8
    }

    /// Reads a 16-bit value in the space's byte order; unaligned accesses are split.
    #[must_use]
    pub fn read_word(&self, address: Offset) -> u16 {
        self.read_sized(address, 2, 0xffff) as u16
    }

    /// Reads the lanes of a 16-bit value selected by `mem_mask`.
    #[must_use]
    pub fn read_word_masked(&self, address: Offset, mem_mask: u16) -> u16 {
        self.read_sized(address, 2, u64::from(mem_mask)) as u16
    }

    /// Reads a 32-bit value in the space's byte order.
    #[must_use]
    pub fn read_dword(&self, address: Offset) -> u32 {
        self.read_sized(address, 4, 0xffff_ffff) as u32
    }

    /// Reads the lanes of a 32-bit value selected by `mem_mask`.
    #[must_use]
    pub fn read_dword_masked(&self, address: Offset, mem_mask: u32) -> u32 {
        self.read_sized(address, 4, u64::from(mem_mask)) as u32
    }

    /// Reads a 64-bit value in the space's byte order.
    #[must_use]
    pub fn read_qword(&self, address: Offset) -> u64 {
        self.read_sized(address, 8, u64::MAX)
    }

    /// Reads the lanes of a 64-bit value selected by `mem_mask`.
    #[must_use]
    pub fn read_qword_masked(&self, address: Offset, mem_mask: u64) -> u64 {
        self.read_sized(address, 8, mem_mask)
    }

    /// Reads one native unit.
    #[must_use]
    pub fn read_native(&self, address: Offset, mem_mask: u64) -> u64 {
        let width = self.config.data_width();
        self.read_sized(address, width.bytes(), mem_mask & width.mask())
    }

    /// Writes one byte.
    pub fn write_byte(&self, address: Offset, data: u8) {
        self.write_sized(address, 1, u64::from(data), 0xff);
    }

    /// Writes a 16-bit value in the space's byte order.
    pub fn write_word(&self, address: Offset, data: u16) {
        self.write_sized(address, 2, u64::from(data), 0xffff);
    }

    /// Writes the lanes of a 16-bit value selected by `mem_mask`.
    pub fn write_word_masked(&self, address: Offset, data: u16, mem_mask: u16) {
        self.write_sized(address, 2, u64::from(data), u64::from(mem_mask));
    }

    /// Writes a 32-bit value in the space's byte order.
    pub fn write_dword(&self, address: Offset, data: u32) {
        self.write_sized(address, 4, u64::from(data), 0xffff_ffff);
    }

    /// Writes the lanes of a 32-bit value selected by `mem_mask`.
    pub fn write_dword_masked(&self, address: Offset, data: u32, mem_mask: u32) {
        self.write_sized(address, 4, u64::from(data), u64::from(mem_mask));
    }

    /// Writes a 64-bit value in the space's byte order.
    pub fn write_qword(&self, address: Offset, data: u64) {
        self.write_sized(address, 8, data, u64::MAX);
    }

    /// Writes the lanes of a 64-bit value selected by `mem_mask`.
    pub fn write_qword_masked(&self, address: Offset, data: u64, mem_mask: u64) {
        self.write_sized(address, 8, data, mem_mask);
    }

    /// Writes one native unit.
    pub fn write_native(&self, address: Offset, data: u64, mem_mask: u64) {
        let width = self.config.data_width();
        self.write_sized(address, width.bytes(), data, mem_mask & width.mask());
    }

    /// Debugger byte read: no log records, counters, taps or device side effects.
    #[must_use]
    pub fn peek_byte(&self, address: Offset) -> u8 {
        let _guard = self.ctx.disable_side_effects();
        self.read_byte(address)
    }

    /// Debugger word read.
    #[must_use]
    pub fn peek_word(&self, address: Offset) -> u16 {
        let _guard = self.ctx.disable_side_effects();
        self.read_word(address)
    }

    /// Debugger dword read.
    #[must_use]
    pub fn peek_dword(&self, address: Offset) -> u32 {
        let _guard = self.ctx.disable_side_effects();
        self.read_dword(address)
    }

    /// Debugger qword read.
    #[must_use]
    pub fn peek_qword(&self, address: Offset) -> u64 {
        let _guard = self.ctx.disable_side_effects();
        self.read_qword(address)
    }

    /// Debugger native-unit read.
    #[must_use]
    pub fn peek_native(&self, address: Offset) -> u64 {
        let _guard = self.ctx.disable_side_effects();
        self.read_native(address, u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::AddressSpace;
    use crate::context::MachineContext;
    use crate::fault::ConfigError;
    use crate::memory::config::{AccessSide, DataWidth, Endianness, SpaceConfig};
    use crate::memory::handler::{BusDevice, MemoryBank, MemoryBlock, SharedBusDevice};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn space(width: DataWidth, endianness: Endianness) -> AddressSpace {
        let config = SpaceConfig::new("program", width, 16, endianness);
        AddressSpace::new(config, MachineContext::new()).expect("valid space")
    }

    #[derive(Default)]
    struct Latch {
        writes: Vec<(u32, u64, u64)>,
        reads: u32,
    }

    impl BusDevice for Latch {
        fn read(&mut self, offset: u32, _mem_mask: u64) -> u64 {
            self.reads += 1;
            u64::from(offset) | 0x40
        }

        fn write(&mut self, offset: u32, data: u64, mem_mask: u64) {
            self.writes.push((offset, data, mem_mask));
        }

        fn peek(&mut self, offset: u32, _mem_mask: u64) -> u64 {
            u64::from(offset) | 0x40
        }
    }

    #[test]
    fn ram_reads_back_and_mirrors_share_storage() {
        let mut space = space(DataWidth::Bits8, Endianness::Little);
        let block = space.install_ram(0x0000, 0x07ff, 0x1800).expect("ram");
        space.write_byte(0x0123, 0x5a);
        assert_eq!(space.read_byte(0x0923), 0x5a);
        assert_eq!(space.read_byte(0x1923), 0x5a);
        assert_eq!(block.byte(0x123), 0x5a);
        assert_eq!(space.read_byte(0x2000), 0xff);
    }

    #[test]
    fn rom_ignores_writes_and_logs_them_as_unmapped() {
        let mut space = space(DataWidth::Bits8, Endianness::Little);
        let rom = MemoryBlock::from_bytes(vec![0xea; 0x100]);
        space.install_rom(0xff00, 0xffff, 0, &rom).expect("rom");
        space.write_byte(0xff10, 0x00);
        assert_eq!(space.read_byte(0xff10), 0xea);
        assert_eq!(space.diagnostics().unmapped_writes, 1);
    }

    #[test]
    fn device_offsets_count_native_units_from_each_mirror_copy() {
        let mut space = space(DataWidth::Bits16, Endianness::Big);
        let latch = Rc::new(RefCell::new(Latch::default()));
        let device: SharedBusDevice = latch.clone();
        space.install_device(0x100, 0x10f, 0x200, &device).expect("device");
        space.write_word(0x304, 0xbeef);
        assert_eq!(latch.borrow().writes, vec![(2, 0xbeef, 0xffff)]);
        space.write_byte(0x105, 0x12);
        assert_eq!(latch.borrow().writes[1], (2, 0x0012, 0x00ff));
        assert_eq!(space.read_word(0x10e), 0x47);
    }

    #[test]
    fn wide_and_unaligned_accesses_split_into_native_units() {
        let mut space = space(DataWidth::Bits16, Endianness::Little);
        space.install_ram(0x0000, 0x00ff, 0).expect("ram");
        space.write_dword(0x11, 0x4433_2211);
        assert_eq!(space.read_byte(0x11), 0x11);
        assert_eq!(space.read_byte(0x14), 0x44);
        assert_eq!(space.read_word(0x12), 0x3322);
        assert_eq!(space.read_dword(0x11), 0x4433_2211);
    }

    #[test]
    fn big_endian_words_put_the_high_byte_first() {
        let mut space = space(DataWidth::Bits32, Endianness::Big);
        let block = space.install_ram(0x0000, 0x00ff, 0).expect("ram");
        space.write_dword(0x10, 0x1122_3344);
        assert_eq!(block.byte(0x10), 0x11);
        assert_eq!(space.read_word(0x12), 0x3344);
        space.write_word_masked(0x10, 0xaabb, 0x00ff);
        assert_eq!(space.read_dword(0x10), 0x11bb_3344);
    }

    #[test]
    fn word_addressed_space_maps_one_address_per_unit() {
        let config = SpaceConfig::new("program", DataWidth::Bits16, 16, Endianness::Big)
            .with_addr_shift(-1);
        let mut space = AddressSpace::new(config, MachineContext::new()).expect("space");
        let block = space.install_ram(0x0000, 0x00ff, 0).expect("ram");
        assert_eq!(block.len(), 0x200);
        space.write_native(0x0010, 0xcafe, 0xffff);
        assert_eq!(block.byte(0x20), 0xca);
        assert_eq!(space.read_native(0x0010, 0xffff), 0xcafe);
    }

    #[test]
    fn banks_switch_without_reinstalling() {
        let mut space = space(DataWidth::Bits8, Endianness::Little);
        let rom = MemoryBlock::from_bytes((0..4u8).flat_map(|page| vec![page; 0x100]).collect());
        let bank = MemoryBank::new("bank", 0x100);
        bank.configure_entries(&rom, 4, 0x100).expect("entries");
        space.install_read_bank(0x8000, 0x80ff, 0, &bank).expect("bank");
        let generation = space.generation();
        assert_eq!(space.read_byte(0x8042), 0);
        bank.set_entry(3).expect("entry");
        assert_eq!(space.read_byte(0x8042), 3);
        assert_eq!(space.generation(), generation);
    }

    #[test]
    fn taps_observe_and_rewrite_then_disappear() {
        let mut space = space(DataWidth::Bits8, Endianness::Little);
        space.install_ram(0x0000, 0x00ff, 0).expect("ram");
        space.write_byte(0x20, 0x10);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        space
            .install_read_tap(0x20, 0x2f, "watch", move |address, data, _| {
                log.borrow_mut().push(address);
                *data += 1;
            })
            .expect("tap");
        assert_eq!(space.read_byte(0x20), 0x11);
        assert_eq!(space.peek_byte(0x20), 0x10);
        assert_eq!(*seen.borrow(), vec![0x20]);
        space.remove_tap("watch").expect("remove");
        assert_eq!(space.read_byte(0x20), 0x10);
        assert_eq!(
            space.remove_tap("watch"),
            Err(ConfigError::UnknownTap { name: "watch".into() })
        );
    }

    #[test]
    fn peeks_leave_devices_and_counters_alone() {
        let mut space = space(DataWidth::Bits8, Endianness::Little);
        let latch = Rc::new(RefCell::new(Latch::default()));
        let device: SharedBusDevice = latch.clone();
        space.install_device(0x10, 0x1f, 0, &device).expect("device");
        assert_eq!(space.peek_byte(0x13), 0x43);
        assert_eq!(space.peek_byte(0x40), 0xff);
        assert_eq!(latch.borrow().reads, 0);
        assert_eq!(space.diagnostics().unmapped_reads, 0);
    }

    #[test]
    fn invalid_ranges_are_rejected_before_any_change() {
        let mut space = space(DataWidth::Bits16, Endianness::Little);
        let generation = space.generation();
        assert!(matches!(space.install_ram(0x10, 0x0f, 0), Err(ConfigError::InvertedRange { .. })));
        assert!(matches!(space.install_ram(0x01, 0x10, 0), Err(ConfigError::Misaligned { .. })));
        assert!(matches!(
            space.install_ram(0x00, 0x1f, 0x10),
            Err(ConfigError::MirrorOverlapsRange { .. })
        ));
        assert!(matches!(
            space.nop_read(0x0000, 0x0001, 0x1_0000),
            Err(ConfigError::RangeOutOfSpace { .. })
        ));
        assert_eq!(space.generation(), generation);
        assert!(space.verify_coverage().is_ok());
        assert!(space.is_unmapped(AccessSide::Read, 0x10));
    }

    #[test]
    fn nop_ranges_read_open_bus_silently() {
        let mut space = space(DataWidth::Bits8, Endianness::Little);
        space.nop_readwrite(0x4000, 0x4fff, 0).expect("nop");
        assert_eq!(space.read_byte(0x4000), 0xff);
        space.write_byte(0x4000, 1);
        assert_eq!(space.diagnostics().total(), 0);
        assert!(!space.is_unmapped(AccessSide::Write, 0x4000));
    }
}
