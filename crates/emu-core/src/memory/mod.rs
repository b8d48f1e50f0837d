//! Address-space dispatch: configuration, handlers, range tables, spaces and access caches.

/// Fetch cache in front of a space.
pub mod cache;
/// Space geometry and policy.
pub mod config;
/// Range-partition dispatch table.
pub mod dispatch;
/// Handler variants and backing stores.
pub mod handler;
/// Declarative address maps.
pub mod map;
/// Address spaces and their access paths.
pub mod space;

pub use cache::SpaceCache;
pub use config::{AccessSide, DataWidth, Endianness, Offset, SpaceConfig};
pub use dispatch::{DispatchEntry, DispatchTable, DIRECT_MAP_UNITS};
pub use handler::{
    AddressMapBank, BusDevice, MemoryBank, MemoryBlock, ReadFn, ReadHandler, SharedBusDevice, Tap,
    TapFn, WriteFn, WriteHandler,
};
pub use map::{AddressMap, MapEntry, MapRead, MapWrite};
pub use space::{AddressSpace, CacheWindow, SharedSpace, MAX_MIRROR_COPIES};
