use core::fmt;

use crate::fault::ConfigError;

/// CPU-visible address, in the space's own address units.
pub type Offset = u32;

/// Native data-bus width of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum DataWidth {
    /// 8-bit bus.
    Bits8,
    /// 16-bit bus.
    Bits16,
    /// 32-bit bus.
    Bits32,
    /// 64-bit bus.
    Bits64,
}

impl DataWidth {
    /// Decodes a width in bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::Bits8),
            16 => Some(Self::Bits16),
            32 => Some(Self::Bits32),
            64 => Some(Self::Bits64),
            _ => None,
        }
    }

    /// Width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        8 << self.log2_bytes()
    }

    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        1 << self.log2_bytes()
    }

    /// Base-two logarithm of the width in bytes.
    #[must_use]
    pub const fn log2_bytes(self) -> u32 {
        match self {
            Self::Bits8 => 0,
            Self::Bits16 => 1,
            Self::Bits32 => 2,
            Self::Bits64 => 3,
        }
    }

    /// All-ones value of this width.
    #[must_use]
    pub const fn mask(self) -> u64 {
        u64::MAX >> (64 - self.bits())
    }
}

/// Byte order of multi-byte values on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Endianness {
    /// Least significant byte at the lowest address.
    Little,
    /// Most significant byte at the lowest address.
    Big,
}

/// Which of a space's two dispatch tables an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessSide {
    /// Read dispatch.
    Read,
    /// Write dispatch.
    Write,
}

impl fmt::Display for AccessSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Geometry and policy of one address space.
///
/// `addr_shift` converts CPU address units to byte offsets: a negative shift means each
/// address names `1 << -shift` bytes (word-addressed buses), a positive shift means
/// `1 << shift` addresses share one byte (bit-addressed buses).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SpaceConfig {
    name: String,
    data_width: DataWidth,
    addr_width: u8,
    addr_shift: i8,
    endianness: Endianness,
    unmap_value: u64,
    log_unmap: bool,
    octal: bool,
}

impl SpaceConfig {
    /// Builds a byte-addressed configuration with open-bus reads of all ones and unmapped
    /// logging enabled.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        data_width: DataWidth,
        addr_width: u8,
        endianness: Endianness,
    ) -> Self {
        Self {
            name: name.into(),
            data_width,
            addr_width,
            addr_shift: 0,
            endianness,
            unmap_value: u64::MAX,
            log_unmap: true,
            octal: false,
        }
    }

    /// Sets the address shift.
    #[must_use]
    pub const fn with_addr_shift(mut self, addr_shift: i8) -> Self {
        self.addr_shift = addr_shift;
        self
    }

    /// Sets the value returned by unmapped and no-op reads.
    #[must_use]
    pub const fn with_unmap_value(mut self, value: u64) -> Self {
        self.unmap_value = value;
        self
    }

    /// Enables or disables unmapped-access log records.
    #[must_use]
    pub const fn with_log_unmap(mut self, log_unmap: bool) -> Self {
        self.log_unmap = log_unmap;
        self
    }

    /// Prints addresses and data in octal in diagnostics.
    #[must_use]
    pub const fn with_octal(mut self, octal: bool) -> Self {
        self.octal = octal;
        self
    }

    /// Checks the width/shift combination and the address width.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedGeometry`] when the address width is outside `1..=32`
    /// or the shift is not one the dispatch engine can convert exactly.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        let shift_ok = match self.data_width {
            DataWidth::Bits8 => matches!(self.addr_shift, 0 | 1),
            DataWidth::Bits16 => matches!(self.addr_shift, 3 | 0 | -1),
            DataWidth::Bits32 => matches!(self.addr_shift, 0 | -1 | -2),
            DataWidth::Bits64 => matches!(self.addr_shift, 0 | -1 | -2 | -3),
        };
        if !shift_ok || self.addr_width == 0 || self.addr_width > 32 {
            return Err(ConfigError::UnsupportedGeometry {
                data_bits: self.data_width.bits(),
                addr_bits: self.addr_width as u32,
                addr_shift: self.addr_shift,
            });
        }
        Ok(())
    }

    /// Space name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Native data width.
    #[must_use]
    pub const fn data_width(&self) -> DataWidth {
        self.data_width
    }

    /// Address width in bits.
    #[must_use]
    pub const fn addr_width(&self) -> u8 {
        self.addr_width
    }

    /// Address shift.
    #[must_use]
    pub const fn addr_shift(&self) -> i8 {
        self.addr_shift
    }

    /// Byte order.
    #[must_use]
    pub const fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Open-bus value, truncated to the native width.
    #[must_use]
    pub const fn unmap_value(&self) -> u64 {
        self.unmap_value & self.data_width.mask()
    }

    /// Whether unmapped accesses are logged.
    #[must_use]
    pub const fn log_unmap(&self) -> bool {
        self.log_unmap
    }

    /// Whether diagnostics print in octal.
    #[must_use]
    pub const fn is_octal(&self) -> bool {
        self.octal
    }

    /// Highest valid CPU address.
    #[must_use]
    pub const fn addr_mask(&self) -> u64 {
        u64::MAX >> (64 - self.addr_width as u32)
    }

    /// Digits used when printing an address.
    #[must_use]
    pub const fn addrchars(&self) -> usize {
        let bits = self.addr_width as usize;
        if self.octal {
            (bits + 2) / 3
        } else {
            (bits + 3) / 4
        }
    }

    /// Digits used when printing a native-width data or mask value.
    #[must_use]
    pub const fn datachars(&self) -> usize {
        2 << self.data_width.log2_bytes()
    }

    /// First byte offset covered by `address`.
    #[must_use]
    pub const fn address_to_byte(&self, address: u64) -> u64 {
        if self.addr_shift < 0 {
            address << -self.addr_shift
        } else {
            address >> self.addr_shift
        }
    }

    /// Last byte offset covered by `address`.
    #[must_use]
    pub const fn address_to_byte_end(&self, address: u64) -> u64 {
        if self.addr_shift < 0 {
            let shift = -self.addr_shift;
            (address << shift) | ((1 << shift) - 1)
        } else {
            address >> self.addr_shift
        }
    }

    /// First address that names byte offset `byte`.
    #[must_use]
    pub const fn byte_to_address(&self, byte: u64) -> u64 {
        if self.addr_shift < 0 {
            byte >> -self.addr_shift
        } else {
            byte << self.addr_shift
        }
    }

    /// Last address that names byte offset `byte`.
    #[must_use]
    pub const fn byte_to_address_end(&self, byte: u64) -> u64 {
        if self.addr_shift < 0 {
            byte >> -self.addr_shift
        } else {
            (byte << self.addr_shift) | ((1 << self.addr_shift) - 1)
        }
    }

    /// Highest valid byte offset.
    #[must_use]
    pub const fn byte_limit(&self) -> u64 {
        self.address_to_byte_end(self.addr_mask())
    }

    /// Formats an address zero-padded to the space's address width.
    #[must_use]
    pub fn format_address(&self, address: u64) -> String {
        let width = self.addrchars();
        if self.octal {
            format!("{address:0width$o}")
        } else {
            format!("{address:0width$X}")
        }
    }

    /// Formats a native-width data or mask value.
    #[must_use]
    pub fn format_data(&self, value: u64) -> String {
        let width = self.datachars();
        if self.octal {
            format!("{value:0width$o}")
        } else {
            format!("{value:0width$X}")
        }
    }
}
