//! Handler variants a dispatch range can resolve to, and the backing stores they point at.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::fault::ConfigError;
use crate::memory::config::{DataWidth, Endianness, Offset};
use crate::memory::space::SharedSpace;

/// A shared, resizable-at-construction byte store used for RAM, ROM and bank entries.
///
/// Bytes are kept in bus byte-address order, so the same block reads back identically through
/// little- and big-endian spaces of any width.
#[derive(Clone, Default)]
pub struct MemoryBlock(Rc<RefCell<Vec<u8>>>);

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock").field("len", &self.len()).finish()
    }
}

impl MemoryBlock {
    /// Allocates a zero-filled block.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self(Rc::new(RefCell::new(vec![0; len])))
    }

    /// Wraps existing contents (ROM images).
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(bytes)))
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Returns `true` for a zero-length block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` when both handles share the same storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Reads one byte; out-of-range indices read as zero.
    #[must_use]
    pub fn byte(&self, index: usize) -> u8 {
        self.0.borrow().get(index).copied().unwrap_or(0)
    }

    /// Writes one byte; out-of-range indices are ignored.
    pub fn set_byte(&self, index: usize, value: u8) {
        if let Some(slot) = self.0.borrow_mut().get_mut(index) {
            *slot = value;
        }
    }

    /// Copies `bytes` into the block starting at `offset`, clipping at the end.
    pub fn load(&self, offset: usize, bytes: &[u8]) {
        let mut store = self.0.borrow_mut();
        if offset >= store.len() {
            return;
        }
        let len = bytes.len().min(store.len() - offset);
        store[offset..offset + len].copy_from_slice(&bytes[..len]);
    }

    /// Returns a copy of the contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    /// Assembles one native unit starting at byte `index`.
    #[must_use]
    pub(crate) fn read_unit(&self, index: u64, width: DataWidth, endianness: Endianness) -> u64 {
        let store = self.0.borrow();
        let bytes = width.bytes() as usize;
        let mut value = 0u64;
        for lane in 0..bytes {
            let byte = usize::try_from(index)
                .ok()
                .and_then(|base| store.get(base + lane))
                .copied()
                .unwrap_or(0);
            value |= u64::from(byte) << lane_shift(lane, bytes, endianness);
        }
        value
    }

    /// Stores the lanes of one native unit selected by `mem_mask`.
    pub(crate) fn write_unit(
        &self,
        index: u64,
        data: u64,
        mem_mask: u64,
        width: DataWidth,
        endianness: Endianness,
    ) {
        let mut store = self.0.borrow_mut();
        let bytes = width.bytes() as usize;
        let Ok(base) = usize::try_from(index) else {
            return;
        };
        for lane in 0..bytes {
            let shift = lane_shift(lane, bytes, endianness);
            #[allow(clippy::cast_possible_truncation)]
            let lane_mask = (mem_mask >> shift) as u8;
            if lane_mask == 0 {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let lane_data = (data >> shift) as u8;
            if let Some(slot) = store.get_mut(base + lane) {
                *slot = (*slot & !lane_mask) | (lane_data & lane_mask);
            }
        }
    }
}

/// Bit position of byte `lane` (0 = lowest byte address) within a `bytes`-wide value.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn lane_shift(lane: usize, bytes: usize, endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Little => (lane * 8) as u32,
        Endianness::Big => ((bytes - 1 - lane) * 8) as u32,
    }
}

/// A switchable window onto one of several backing stores.
///
/// Selecting an entry redirects every range bound to the bank on its next access; the dispatch
/// table itself is untouched.
#[derive(Debug)]
pub struct MemoryBank {
    tag: String,
    window: u64,
    entries: RefCell<Vec<(MemoryBlock, u64)>>,
    current: Cell<usize>,
}

impl MemoryBank {
    /// Creates an empty bank whose entries each expose `window` bytes.
    #[must_use]
    pub fn new(tag: impl Into<String>, window: u64) -> Rc<Self> {
        Rc::new(Self {
            tag: tag.into(),
            window,
            entries: RefCell::new(Vec::new()),
            current: Cell::new(0),
        })
    }

    /// Bank tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Bytes visible through each entry.
    #[must_use]
    pub const fn window(&self) -> u64 {
        self.window
    }

    /// Number of configured entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Appends an entry viewing `block` from byte `base`; returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BlockTooSmall`] when the block cannot back the whole window.
    pub fn add_entry(&self, block: &MemoryBlock, base: u64) -> Result<usize, ConfigError> {
        let needed = base + self.window;
        let available = block.len() as u64;
        if available < needed {
            return Err(ConfigError::BlockTooSmall { needed, available });
        }
        let mut entries = self.entries.borrow_mut();
        entries.push((block.clone(), base));
        Ok(entries.len() - 1)
    }

    /// Adds `count` entries over `block`, `stride` bytes apart, starting at byte 0.
    ///
    /// # Errors
    ///
    /// Propagates [`ConfigError::BlockTooSmall`] from the first entry that does not fit.
    pub fn configure_entries(
        &self,
        block: &MemoryBlock,
        count: usize,
        stride: u64,
    ) -> Result<(), ConfigError> {
        for index in 0..count as u64 {
            self.add_entry(block, index * stride)?;
        }
        Ok(())
    }

    /// Selects the entry seen by subsequent accesses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BankEntryOutOfRange`] for an unconfigured entry.
    pub fn set_entry(&self, entry: usize) -> Result<(), ConfigError> {
        let entries = self.entry_count();
        if entry >= entries {
            return Err(ConfigError::BankEntryOutOfRange {
                bank: self.tag.clone(),
                entry,
                entries,
            });
        }
        self.current.set(entry);
        Ok(())
    }

    /// Currently selected entry.
    #[must_use]
    pub fn entry(&self) -> usize {
        self.current.get()
    }

    fn current_block(&self) -> Option<(MemoryBlock, u64)> {
        self.entries.borrow().get(self.current.get()).cloned()
    }

    pub(crate) fn read_unit(&self, rel: u64, width: DataWidth, endianness: Endianness) -> Option<u64> {
        self.current_block()
            .map(|(block, base)| block.read_unit(base + rel, width, endianness))
    }

    pub(crate) fn write_unit(
        &self,
        rel: u64,
        data: u64,
        mem_mask: u64,
        width: DataWidth,
        endianness: Endianness,
    ) {
        if let Some((block, base)) = self.current_block() {
            block.write_unit(base + rel, data, mem_mask, width, endianness);
        }
    }
}

/// A banked view of another address space: bank `n` exposes the inner space starting at
/// `n * stride` bytes.
pub struct AddressMapBank {
    tag: String,
    space: SharedSpace,
    stride: u64,
    bank: Cell<u32>,
}

impl fmt::Debug for AddressMapBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressMapBank")
            .field("tag", &self.tag)
            .field("stride", &self.stride)
            .field("bank", &self.bank.get())
            .finish_non_exhaustive()
    }
}

impl AddressMapBank {
    /// Wraps `space` with a bank stride given in bytes.
    #[must_use]
    pub fn new(tag: impl Into<String>, space: SharedSpace, stride: u64) -> Rc<Self> {
        Rc::new(Self {
            tag: tag.into(),
            space,
            stride,
            bank: Cell::new(0),
        })
    }

    /// Bank device tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The wrapped space.
    #[must_use]
    pub const fn space(&self) -> &SharedSpace {
        &self.space
    }

    /// Selects the visible bank.
    pub fn set_bank(&self, bank: u32) {
        self.bank.set(bank);
    }

    /// Currently visible bank.
    #[must_use]
    pub fn bank(&self) -> u32 {
        self.bank.get()
    }

    fn inner_byte(&self, rel: u64) -> u64 {
        u64::from(self.bank.get()) * self.stride + rel
    }

    pub(crate) fn read_unit(&self, rel: u64, mem_mask: u64) -> u64 {
        let byte = self.inner_byte(rel);
        self.space.borrow().read_unit(byte, mem_mask)
    }

    pub(crate) fn write_unit(&self, rel: u64, data: u64, mem_mask: u64) {
        let byte = self.inner_byte(rel);
        self.space.borrow().write_unit(byte, data, mem_mask);
    }
}

/// A memory-mapped device register block.
///
/// `offset` counts native bus units from the start of the installed range; `mem_mask` selects
/// the byte lanes taking part in the access.
pub trait BusDevice {
    /// Handles a read.
    fn read(&mut self, offset: Offset, mem_mask: u64) -> u64;

    /// Handles a write.
    fn write(&mut self, offset: Offset, data: u64, mem_mask: u64);

    /// Handles a debugger read; must not change device state. Defaults to [`BusDevice::read`]
    /// for devices whose reads have no side effects.
    fn peek(&mut self, offset: Offset, mem_mask: u64) -> u64 {
        self.read(offset, mem_mask)
    }
}

/// Shared device handle installed in a space.
pub type SharedBusDevice = Rc<RefCell<dyn BusDevice>>;
/// Closure read handler: `(offset, mem_mask) -> data`.
pub type ReadFn = Rc<RefCell<dyn FnMut(Offset, u64) -> u64>>;
/// Closure write handler: `(offset, data, mem_mask)`.
pub type WriteFn = Rc<RefCell<dyn FnMut(Offset, u64, u64)>>;
/// Tap observer: `(address, data, mem_mask)`; may rewrite the data.
pub type TapFn = Rc<RefCell<dyn FnMut(Offset, &mut u64, u64)>>;

/// A named observer layered in front of the handler that previously owned a range.
pub struct Tap<H> {
    pub(crate) name: String,
    pub(crate) tap: TapFn,
    pub(crate) next: H,
}

impl<H: fmt::Debug> fmt::Debug for Tap<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tap")
            .field("name", &self.name)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl<H> Tap<H> {
    /// Tap name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler the tap forwards to.
    #[must_use]
    pub const fn next(&self) -> &H {
        &self.next
    }
}

/// Read-side handler variants.
#[derive(Clone)]
pub enum ReadHandler {
    /// Open bus; logs when the space asks for it.
    Unmapped,
    /// Open bus, silently.
    Nop,
    /// Direct read from a block; `base` is the block byte at the start of the range.
    Memory {
        /// Backing store.
        block: MemoryBlock,
        /// Block byte mapped at the range origin.
        base: u64,
    },
    /// Read through the current entry of a bank.
    Bank(Rc<MemoryBank>),
    /// Device register read.
    Device(SharedBusDevice),
    /// Closure read.
    Function(ReadFn),
    /// Sub-dispatch into another space.
    Submap(Rc<AddressMapBank>),
    /// Observer in front of another handler.
    Tap(Rc<Tap<Self>>),
}

/// Write-side handler variants.
#[derive(Clone)]
pub enum WriteHandler {
    /// Discards the write; logs when the space asks for it.
    Unmapped,
    /// Discards the write silently.
    Nop,
    /// Direct write into a block; `base` is the block byte at the start of the range.
    Memory {
        /// Backing store.
        block: MemoryBlock,
        /// Block byte mapped at the range origin.
        base: u64,
    },
    /// Write through the current entry of a bank.
    Bank(Rc<MemoryBank>),
    /// Device register write.
    Device(SharedBusDevice),
    /// Closure write.
    Function(WriteFn),
    /// Sub-dispatch into another space.
    Submap(Rc<AddressMapBank>),
    /// Observer in front of another handler.
    Tap(Rc<Tap<Self>>),
}

macro_rules! handler_common {
    ($ty:ident) => {
        impl $ty {
            /// Short kind name used in diagnostics.
            #[must_use]
            pub const fn kind(&self) -> &'static str {
                match self {
                    Self::Unmapped => "unmapped",
                    Self::Nop => "nop",
                    Self::Memory { .. } => "memory",
                    Self::Bank(_) => "bank",
                    Self::Device(_) => "device",
                    Self::Function(_) => "function",
                    Self::Submap(_) => "submap",
                    Self::Tap(_) => "tap",
                }
            }

            /// Returns `true` when the access ends at the unmapped handler.
            #[must_use]
            pub fn is_unmapped(&self) -> bool {
                match self {
                    Self::Unmapped => true,
                    Self::Tap(tap) => tap.next.is_unmapped(),
                    _ => false,
                }
            }

            /// Strips every tap named `name`; returns `None` when nothing changed.
            pub(crate) fn without_tap(&self, name: &str) -> Option<Self> {
                let Self::Tap(tap) = self else {
                    return None;
                };
                let next = tap.next.without_tap(name);
                if tap.name == name {
                    Some(next.unwrap_or_else(|| tap.next.clone()))
                } else {
                    next.map(|next| {
                        Self::Tap(Rc::new(Tap {
                            name: tap.name.clone(),
                            tap: Rc::clone(&tap.tap),
                            next,
                        }))
                    })
                }
            }

            /// Returns `true` when a tap named `name` sits in front of this handler.
            #[must_use]
            pub fn has_tap(&self, name: &str) -> bool {
                match self {
                    Self::Tap(tap) => tap.name == name || tap.next.has_tap(name),
                    _ => false,
                }
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    Self::Memory { block, base } => f
                        .debug_struct("Memory")
                        .field("len", &block.len())
                        .field("base", base)
                        .finish(),
                    Self::Bank(bank) => f.debug_tuple("Bank").field(&bank.tag()).finish(),
                    Self::Submap(bank) => f.debug_tuple("Submap").field(&bank.tag()).finish(),
                    Self::Tap(tap) => tap.fmt(f),
                    other => f.write_str(other.kind()),
                }
            }
        }
    };
}

handler_common!(ReadHandler);
handler_common!(WriteHandler);

#[cfg(test)]
mod tests {
    use super::{MemoryBank, MemoryBlock, ReadHandler, Tap};
    use crate::memory::config::{DataWidth, Endianness};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unit_lanes_follow_endianness() {
        let block = MemoryBlock::from_bytes(vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(block.read_unit(0, DataWidth::Bits32, Endianness::Little), 0x4433_2211);
        assert_eq!(block.read_unit(0, DataWidth::Bits32, Endianness::Big), 0x1122_3344);
        block.write_unit(0, 0xaabb, 0x00ff, DataWidth::Bits16, Endianness::Big);
        assert_eq!(block.to_vec(), vec![0x11, 0xbb, 0x33, 0x44]);
    }

    #[test]
    fn load_clips_at_the_end_of_the_block() {
        let block = MemoryBlock::new(4);
        block.load(2, &[1, 2, 3, 4]);
        assert_eq!(block.to_vec(), vec![0, 0, 1, 2]);
        block.load(9, &[7]);
        assert_eq!(block.byte(9), 0);
    }

    #[test]
    fn bank_rejects_short_blocks_and_unknown_entries() {
        let bank = MemoryBank::new("rombank", 0x100);
        let block = MemoryBlock::new(0x300);
        assert!(bank.configure_entries(&block, 3, 0x100).is_ok());
        assert!(bank.add_entry(&block, 0x250).is_err());
        assert!(bank.set_entry(2).is_ok());
        assert!(bank.set_entry(3).is_err());
        assert_eq!(bank.entry(), 2);
    }

    #[test]
    fn removing_a_tap_keeps_outer_taps() {
        let noop: super::TapFn = Rc::new(RefCell::new(|_, _: &mut u64, _| {}));
        let inner = ReadHandler::Tap(Rc::new(Tap {
            name: "inner".into(),
            tap: Rc::clone(&noop),
            next: ReadHandler::Nop,
        }));
        let outer = ReadHandler::Tap(Rc::new(Tap {
            name: "outer".into(),
            tap: noop,
            next: inner,
        }));
        let stripped = outer.without_tap("inner").expect("tap present");
        assert!(stripped.has_tap("outer"));
        assert!(!stripped.has_tap("inner"));
        assert!(outer.without_tap("missing").is_none());
    }
}
