//! Memory interfaces the core fetches and stores through.

use crate::fault::ConfigError;
use crate::memory::{DataWidth, Endianness, SharedSpace, SpaceCache};

/// Bus access trampolines.
///
/// `read_sync` is used for opcode fetches and `read_arg` for operand bytes taken from the
/// instruction stream; every other access goes through `read`/`write`.
pub trait M6502Memory {
    /// Data read.
    fn read(&mut self, address: u16) -> u8;

    /// Opcode fetch.
    fn read_sync(&mut self, address: u16) -> u8 {
        self.read(address)
    }

    /// Operand fetch.
    fn read_arg(&mut self, address: u16) -> u8 {
        self.read(address)
    }

    /// Data write.
    fn write(&mut self, address: u16, data: u8);
}

/// A flat 64 KiB array with no side effects.
#[derive(Clone)]
pub struct FlatMemory {
    bytes: Box<[u8; 0x1_0000]>,
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self {
            bytes: Box::new([0; 0x1_0000]),
        }
    }
}

impl core::fmt::Debug for FlatMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlatMemory").finish_non_exhaustive()
    }
}

impl FlatMemory {
    /// Zero-filled memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `data` in at `address`, wrapping at the top of memory.
    pub fn load(&mut self, address: u16, data: &[u8]) {
        let mut at = address;
        for &byte in data {
            self.bytes[usize::from(at)] = byte;
            at = at.wrapping_add(1);
        }
    }

    /// Sets the reset vector.
    pub fn set_reset_vector(&mut self, target: u16) {
        self.load(0xfffc, &target.to_le_bytes());
    }

    /// Whole memory image.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

impl M6502Memory for FlatMemory {
    fn read(&mut self, address: u16) -> u8 {
        self.bytes[usize::from(address)]
    }

    fn write(&mut self, address: u16, data: u8) {
        self.bytes[usize::from(address)] = data;
    }
}

enum Fetch {
    Cached(SpaceCache),
    Direct(SharedSpace),
}

impl Fetch {
    fn read(&mut self, address: u16) -> u8 {
        match self {
            Self::Cached(cache) => cache.read_byte(u32::from(address)),
            Self::Direct(space) => space.borrow().read_byte(u32::from(address)),
        }
    }
}

/// Fetches through address spaces: data through the program space, opcodes through the
/// optional decrypted-opcodes space.
pub struct SpaceInterface {
    program: SharedSpace,
    opcodes: Fetch,
    args: Fetch,
}

impl core::fmt::Debug for SpaceInterface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpaceInterface")
            .field("program", &self.program.borrow().name())
            .finish_non_exhaustive()
    }
}

fn check_geometry(tag: &str, space: &SharedSpace) -> Result<(), ConfigError> {
    let space = space.borrow();
    let config = space.config();
    let reason = if config.data_width() != DataWidth::Bits8 {
        Some("the 6502 bus is 8 bits wide")
    } else if config.addr_shift() != 0 {
        Some("the 6502 bus is byte addressed")
    } else if config.addr_width() < 16 {
        Some("the 6502 needs 16 address bits")
    } else if config.endianness() != Endianness::Little {
        Some("the 6502 is little endian")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::IncompatibleSpace {
            device: tag.to_owned(),
            space: space.name().to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

impl SpaceInterface {
    /// Binds the interface; `opcodes` defaults to `program`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::IncompatibleSpace`] when a space is not an 8-bit, byte-addressed,
    /// little-endian bus with at least 16 address bits.
    pub fn new(
        tag: &str,
        program: SharedSpace,
        opcodes: Option<SharedSpace>,
        use_cache: bool,
    ) -> Result<Self, ConfigError> {
        check_geometry(tag, &program)?;
        if let Some(opcodes) = &opcodes {
            check_geometry(tag, opcodes)?;
        }
        let opcode_space = opcodes.unwrap_or_else(|| program.clone());
        let (opcodes, args) = if use_cache {
            (
                Fetch::Cached(SpaceCache::new(opcode_space)),
                Fetch::Cached(SpaceCache::new(program.clone())),
            )
        } else {
            (Fetch::Direct(opcode_space), Fetch::Direct(program.clone()))
        };
        Ok(Self {
            program,
            opcodes,
            args,
        })
    }

    /// The data space.
    #[must_use]
    pub const fn program(&self) -> &SharedSpace {
        &self.program
    }
}

impl M6502Memory for SpaceInterface {
    fn read(&mut self, address: u16) -> u8 {
        self.program.borrow().read_byte(u32::from(address))
    }

    fn read_sync(&mut self, address: u16) -> u8 {
        self.opcodes.read(address)
    }

    fn read_arg(&mut self, address: u16) -> u8 {
        self.args.read(address)
    }

    fn write(&mut self, address: u16, data: u8) {
        self.program.borrow().write_byte(u32::from(address), data);
    }
}
