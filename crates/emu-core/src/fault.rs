use thiserror::Error;

use crate::memory::AccessSide;

/// Machine-configuration errors raised while building or mutating address spaces and
/// binding devices to them.
///
/// These always indicate a driver bug. None of them can be produced by emulated software.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ConfigError {
    /// The range (or its mirror fan-out) reaches past the last address of the space.
    #[error("range {start:#x}-{end:#x} exceeds space limit {limit:#x}")]
    RangeOutOfSpace {
        /// First address of the offending range.
        start: u64,
        /// Last address of the offending range.
        end: u64,
        /// Highest valid address in the space.
        limit: u64,
    },
    /// The range end lies before its start.
    #[error("range end {end:#x} precedes start {start:#x}")]
    InvertedRange {
        /// First address of the offending range.
        start: u64,
        /// Last address of the offending range.
        end: u64,
    },
    /// The range does not start and end on native bus-unit boundaries.
    #[error("range {start:#x}-{end:#x} is not aligned to {unit_bytes}-byte bus units")]
    Misaligned {
        /// First address of the offending range.
        start: u64,
        /// Last address of the offending range.
        end: u64,
        /// Native bus width in bytes.
        unit_bytes: u32,
    },
    /// Mirror bits overlap bits used by the range itself.
    #[error("mirror mask {mirror:#x} overlaps range {start:#x}-{end:#x}")]
    MirrorOverlapsRange {
        /// First address of the offending range.
        start: u64,
        /// Last address of the offending range.
        end: u64,
        /// Requested mirror mask.
        mirror: u64,
    },
    /// The mirror mask expands to more copies than the dispatch table accepts.
    #[error("mirror mask {mirror:#x} expands to {copies} copies")]
    MirrorTooLarge {
        /// Requested mirror mask.
        mirror: u64,
        /// Number of copies the mask expands to.
        copies: u64,
    },
    /// Two entries of a declarative address map claim the same addresses.
    #[error("{side} map entries {first_start:#x}-{first_end:#x} and {second_start:#x}-{second_end:#x} overlap")]
    Overlap {
        /// Dispatch side the overlap was found on.
        side: AccessSide,
        /// Start of the earlier entry.
        first_start: u64,
        /// End of the earlier entry.
        first_end: u64,
        /// Start of the later entry.
        second_start: u64,
        /// End of the later entry.
        second_end: u64,
    },
    /// A byte address resolves to no handler.
    #[error("{side} dispatch leaves byte address {address:#x} uncovered")]
    CoverageGap {
        /// Dispatch side the gap was found on.
        side: AccessSide,
        /// First uncovered byte address.
        address: u64,
    },
    /// Two spaces that must share a bus width do not.
    #[error("data width mismatch: expected {expected} bits, found {found} bits")]
    WidthMismatch {
        /// Width required by the installing space.
        expected: u32,
        /// Width of the space being attached.
        found: u32,
    },
    /// The data width, address width and address shift combination is not supported.
    #[error("unsupported space geometry: {data_bits}-bit data, {addr_bits}-bit address, shift {addr_shift}")]
    UnsupportedGeometry {
        /// Data bus width in bits.
        data_bits: u32,
        /// Address bus width in bits.
        addr_bits: u32,
        /// Address shift.
        addr_shift: i8,
    },
    /// A backing store is shorter than the range it was installed on.
    #[error("backing store holds {available} bytes, range needs {needed}")]
    BlockTooSmall {
        /// Bytes the range needs, counted from the block offset.
        needed: u64,
        /// Bytes the block holds.
        available: u64,
    },
    /// A bank entry outside the configured entry list was selected or configured.
    #[error("bank '{bank}' has no entry {entry} ({entries} configured)")]
    BankEntryOutOfRange {
        /// Bank tag.
        bank: String,
        /// Requested entry.
        entry: usize,
        /// Number of configured entries.
        entries: usize,
    },
    /// A device was bound to a space whose geometry it cannot drive.
    #[error("device '{device}' cannot use space '{space}': {reason}")]
    IncompatibleSpace {
        /// Device tag.
        device: String,
        /// Space name.
        space: String,
        /// What is wrong with the space.
        reason: &'static str,
    },
    /// No tap with the given name is installed.
    #[error("no tap named '{name}' is installed")]
    UnknownTap {
        /// Requested tap name.
        name: String,
    },
}

/// Channel error codes reported by the HD63450 in its CER register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum ChannelErrorCode {
    /// Register contents form an invalid operation.
    #[error("configuration error")]
    Configuration = 0x01,
    /// Start or continue issued at an invalid time.
    #[error("operation timing error")]
    OperationTiming = 0x02,
    /// Memory address register points at an invalid location.
    #[error("address error (memory address)")]
    AddressMemory = 0x05,
    /// Device address register points at an invalid location.
    #[error("address error (device address)")]
    AddressDevice = 0x06,
    /// Base address register points at an invalid location.
    #[error("address error (base address)")]
    AddressBase = 0x07,
    /// Bus error while accessing the memory address.
    #[error("bus error (memory address)")]
    BusMemory = 0x09,
    /// Bus error while accessing the device address.
    #[error("bus error (device address)")]
    BusDevice = 0x0A,
    /// Bus error while fetching a chain entry from the base address.
    #[error("bus error (base address)")]
    BusBase = 0x0B,
    /// Memory transfer counter was zero at start.
    #[error("count error (memory transfer counter)")]
    CountMemory = 0x0D,
    /// Base transfer counter was zero at start of a chained operation.
    #[error("count error (base transfer counter)")]
    CountBase = 0x0F,
    /// Transfer aborted through the external abort input.
    #[error("external abort")]
    ExternalAbort = 0x10,
    /// Transfer aborted by software through CCR.
    #[error("software abort")]
    SoftwareAbort = 0x11,
}

impl ChannelErrorCode {
    /// Returns the raw CER encoding.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a raw CER value; `0` and undefined codes yield `None`.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Configuration),
            0x02 => Some(Self::OperationTiming),
            0x05 => Some(Self::AddressMemory),
            0x06 => Some(Self::AddressDevice),
            0x07 => Some(Self::AddressBase),
            0x09 => Some(Self::BusMemory),
            0x0A => Some(Self::BusDevice),
            0x0B => Some(Self::BusBase),
            0x0D => Some(Self::CountMemory),
            0x0F => Some(Self::CountBase),
            0x10 => Some(Self::ExternalAbort),
            0x11 => Some(Self::SoftwareAbort),
            _ => None,
        }
    }

    /// Returns `true` for the codes raised by a failed bus cycle.
    #[must_use]
    pub const fn is_bus_error(self) -> bool {
        matches!(self, Self::BusMemory | Self::BusDevice | Self::BusBase)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelErrorCode, ConfigError};
    use crate::memory::AccessSide;

    #[test]
    fn channel_error_codes_round_trip_through_cer_values() {
        for raw in 0u8..=0x20 {
            if let Some(code) = ChannelErrorCode::from_u8(raw) {
                assert_eq!(code.as_u8(), raw);
            }
        }
        assert_eq!(ChannelErrorCode::from_u8(0), None);
        assert_eq!(ChannelErrorCode::SoftwareAbort.as_u8(), 0x11);
    }

    #[test]
    fn bus_error_classification() {
        assert!(ChannelErrorCode::BusMemory.is_bus_error());
        assert!(ChannelErrorCode::BusDevice.is_bus_error());
        assert!(!ChannelErrorCode::SoftwareAbort.is_bus_error());
    }

    #[test]
    fn config_errors_render_addresses_in_hex() {
        let err = ConfigError::CoverageGap {
            side: AccessSide::Read,
            address: 0x1234,
        };
        assert_eq!(
            err.to_string(),
            "read dispatch leaves byte address 0x1234 uncovered"
        );
    }
}
