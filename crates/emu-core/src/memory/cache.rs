use std::cell::Cell;
use std::rc::Rc;

use crate::memory::config::{Endianness, Offset, SpaceConfig};
use crate::memory::space::{CacheWindow, SharedSpace};

/// Fast path for instruction and operand fetches.
///
/// Remembers the last plain RAM/ROM window it resolved and serves bytes straight from the
/// backing store. Any install on the space bumps its generation and drops the window, so banked
/// or tapped ranges are always fetched through full dispatch.
#[derive(Debug)]
pub struct SpaceCache {
    space: SharedSpace,
    config: SpaceConfig,
    generation: Rc<Cell<u64>>,
    seen: u64,
    window: Option<CacheWindow>,
}

impl SpaceCache {
    /// Creates a cache in front of `space`.
    #[must_use]
    pub fn new(space: SharedSpace) -> Self {
        let (config, generation) = {
            let inner = space.borrow();
            (inner.config().clone(), inner.generation_cell())
        };
        let seen = generation.get();
        Self {
            space,
            config,
            generation,
            seen,
            window: None,
        }
    }

    /// The cached space.
    #[must_use]
    pub const fn space(&self) -> &SharedSpace {
        &self.space
    }

    fn lookup(&mut self, byte: u64) -> Option<(&CacheWindow, u64)> {
        let generation = self.generation.get();
        if generation != self.seen {
            self.seen = generation;
            self.window = None;
        }
        let hit = self
            .window
            .as_ref()
            .is_some_and(|window| window.start <= byte && byte <= window.end);
        if !hit {
            self.window = self.space.borrow().cache_window(byte);
        }
        self.window
            .as_ref()
            .filter(|window| window.start <= byte && byte <= window.end)
            .map(|window| (window, window.base + (byte - window.start)))
    }

    /// Reads one byte, from the cached window when possible.
    pub fn read_byte(&mut self, address: Offset) -> u8 {
        let byte = self
            .config
            .address_to_byte(u64::from(address) & self.config.addr_mask());
        if let Some((window, index)) = self.lookup(byte) {
            if let Ok(index) = usize::try_from(index) {
                return window.block.byte(index);
            }
        }
        self.space.borrow().read_byte(address)
    }

    /// Reads a 16-bit value in the space's byte order.
    pub fn read_word(&mut self, address: Offset) -> u16 {
        if self.config.addr_shift() == 0 {
            let byte = u64::from(address) & self.config.addr_mask();
            let pair = self.lookup(byte).and_then(|(window, index)| {
                (byte < window.end).then(|| {
                    let index = usize::try_from(index).unwrap_or(usize::MAX);
                    (window.block.byte(index), window.block.byte(index.saturating_add(1)))
                })
            });
            if let Some((first, second)) = pair {
                return match self.config.endianness() {
                    Endianness::Little => u16::from_le_bytes([first, second]),
                    Endianness::Big => u16::from_be_bytes([first, second]),
                };
            }
        }
        self.space.borrow().read_word(address)
    }
}

#[cfg(test)]
mod tests {
    use super::SpaceCache;
    use crate::context::MachineContext;
    use crate::memory::config::{DataWidth, Endianness, SpaceConfig};
    use crate::memory::handler::MemoryBlock;
    use crate::memory::space::AddressSpace;

    #[test]
    fn cache_serves_memory_and_revalidates_after_installs() {
        let config = SpaceConfig::new("program", DataWidth::Bits8, 16, Endianness::Little);
        let mut space = AddressSpace::new(config, MachineContext::new()).expect("space");
        let rom = MemoryBlock::from_bytes(vec![0x11, 0x22, 0x33, 0x44]);
        space.install_rom(0x1000, 0x1003, 0, &rom).expect("rom");
        let shared = space.into_shared();
        let mut cache = SpaceCache::new(shared.clone());

        assert_eq!(cache.read_byte(0x1001), 0x22);
        assert_eq!(cache.read_word(0x1002), 0x4433);
        assert_eq!(cache.read_word(0x1003), 0xff44);

        let other = MemoryBlock::from_bytes(vec![0xaa; 4]);
        shared
            .borrow_mut()
            .install_rom(0x1000, 0x1003, 0, &other)
            .expect("rom");
        assert_eq!(cache.read_byte(0x1001), 0xaa);
    }

    #[test]
    fn taps_bypass_the_cache() {
        let config = SpaceConfig::new("program", DataWidth::Bits8, 16, Endianness::Big);
        let mut space = AddressSpace::new(config, MachineContext::new()).expect("space");
        space.install_ram(0x0000, 0x00ff, 0).expect("ram");
        space.write_word(0x10, 0x1234);
        space
            .install_read_tap(0x10, 0x10, "flip", |_, data, _| *data ^= 0xff)
            .expect("tap");
        let mut cache = SpaceCache::new(space.into_shared());
        assert_eq!(cache.read_byte(0x10), 0xed);
        assert_eq!(cache.read_byte(0x11), 0x34);
    }
}
